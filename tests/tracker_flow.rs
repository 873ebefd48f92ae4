mod common;

use common::*;
use runwatch::core::{Attribution, JobStatus, JobTracker, PollState, StatusReport, TrackerError};
use runwatch::remote::{HOST_SPECIFIC_KEY, SINGLE_HOST_MARKER, StartRequest};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::time::sleep;

fn hosts(names: &[&str]) -> Vec<String> {
    names.iter().map(|h| h.to_string()).collect()
}

fn tracker_with(service: &Arc<FakeService>) -> JobTracker {
    JobTracker::new(service.clone(), tracker_config())
}

#[tokio::test(start_paused = true)]
async fn test_fan_out_master_fails_with_mean_progress() {
    let service = Arc::new(FakeService::with_ids(&["m1", "j1", "j2"]));
    service.script("j1", vec![running(50), completed()]);
    service.script("j2", vec![running(40), failed(40)]);
    let tracker = tracker_with(&service);
    let mut events = tracker.subscribe();

    let started = tracker
        .start(StartRequest::new("playbooks/baseline.yml", hosts(&["h1", "h2"])), true)
        .await
        .unwrap();
    assert_eq!(started.id, "m1");
    assert_eq!(started.label, "baseline.yml");

    wait_for_finish(&mut events, "m1").await;

    let master = tracker.expand_output("m1").await.unwrap();
    assert_eq!(master.status, JobStatus::Failed);
    assert_eq!(master.progress, 70);
    assert_eq!(master.attribution, Attribution::PerHost);
    let children: Vec<_> = master.children.iter().map(|c| (c.id.as_str(), c.target.as_str())).collect();
    assert_eq!(children, vec![("j1", "h1"), ("j2", "h2")]);
    assert!(master.children.iter().all(|c| c.progress == 100));

    let starts = service.starts();
    assert_eq!(starts.len(), 3);
    assert!(starts[0].single_host_target().is_none());
    assert_eq!(starts[1].extra_vars[SINGLE_HOST_MARKER], true);
    assert_eq!(starts[2].extra_vars[HOST_SPECIFIC_KEY], "h2");
}

#[tokio::test(start_paused = true)]
async fn test_combined_output_has_one_section_per_host() {
    let service = Arc::new(FakeService::with_ids(&["m1", "j1", "j2"]));
    service.script(
        "j1",
        vec![Ok(StatusReport::new(JobStatus::Completed)
            .with_progress(100)
            .with_output("TASK [ping] ****\nok: [h1]\n"))],
    );
    service.script(
        "j2",
        vec![Ok(StatusReport::new(JobStatus::Completed)
            .with_progress(100)
            .with_output("TASK [ping] ****\nchanged: [h2]\n"))],
    );
    let tracker = tracker_with(&service);
    let mut events = tracker.subscribe();

    tracker
        .start(StartRequest::new("site.yml", hosts(&["h1", "h2"])), true)
        .await
        .unwrap();
    wait_for_finish(&mut events, "j2").await;

    let master = tracker.snapshot("m1", true).await.unwrap();
    let output = master.combined_output.unwrap();
    assert!(output.contains("==== HOST 1/2: h1 (Job: j1) ===="));
    assert!(output.contains("==== HOST 2/2: h2 (Job: j2) ===="));
    assert!(output.find("ok: [h1]").unwrap() < output.find("changed: [h2]").unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_uncorrelated_master_falls_back_to_single_stream() {
    let service = Arc::new(FakeService::with_ids(&["m1"]));
    service.script(
        "m1",
        vec![Ok(StatusReport::new(JobStatus::Completed)
            .with_progress(100)
            .with_output("PLAY [all] ****\nok: [h1]\nok: [h2]\n"))],
    );
    let mut config = tracker_config();
    config.correlation_grace = Duration::ZERO;
    let tracker = JobTracker::new(service.clone(), config);
    let mut events = tracker.subscribe();

    tracker
        .start(StartRequest::new("site.yml", hosts(&["h1", "h2"])), false)
        .await
        .unwrap();
    wait_for_finish(&mut events, "m1").await;

    let master = tracker.snapshot("m1", true).await.unwrap();
    assert_eq!(master.attribution, Attribution::SingleStream);
    assert!(master.children.is_empty());
    assert_eq!(master.status, JobStatus::Completed);
    let output = master.combined_output.unwrap();
    assert!(output.starts_with("==== UNATTRIBUTED / SINGLE-STREAM (Job: m1) ===="));
    assert!(output.contains("ok: [h2]"));
}

#[tokio::test(start_paused = true)]
async fn test_late_failed_host_fails_master_that_reported_completed() {
    let service = Arc::new(FakeService::with_ids(&["m1", "j1", "j2"]));
    service.script("m1", vec![completed()]);
    service.script("j1", vec![completed()]);
    service.script("j2", vec![running(40), failed(40)]);
    let tracker = tracker_with(&service);
    let request = StartRequest::new("site.yml", hosts(&["h1", "h2"]));

    tracker.start(request.clone(), false).await.unwrap();
    sleep(Duration::from_millis(500)).await;
    let master = tracker.snapshot("m1", false).await.unwrap();
    assert_eq!(master.status, JobStatus::Completed);
    assert!(master.children.is_empty());

    for host in ["h1", "h2"] {
        tracker.start(request.for_single_host(host), false).await.unwrap();
        sleep(Duration::from_secs(3)).await;
    }
    sleep(Duration::from_secs(10)).await;

    let master = tracker.snapshot("m1", false).await.unwrap();
    let children: Vec<_> = master.children.iter().map(|c| (c.id.as_str(), c.status)).collect();
    assert_eq!(children, vec![("j1", JobStatus::Completed), ("j2", JobStatus::Failed)]);
    assert_eq!(master.status, JobStatus::Failed);
    assert_eq!(master.progress, 100);
}

#[tokio::test(start_paused = true)]
async fn test_repeated_hosts_fan_out_once() {
    let service = Arc::new(FakeService::with_ids(&["m1", "j1", "j2"]));
    service.script("j1", vec![running(50), completed()]);
    let tracker = tracker_with(&service);
    let mut events = tracker.subscribe();

    let started = tracker
        .start(StartRequest::new("site.yml", hosts(&["h1", "h1"])), true)
        .await
        .unwrap();
    assert_eq!(started.targets, hosts(&["h1"]));

    wait_for_finish(&mut events, "m1").await;
    sleep(Duration::from_secs(60)).await;

    let master = tracker.snapshot("m1", false).await.unwrap();
    assert_eq!(master.status, JobStatus::Completed);
    assert_eq!(master.progress, 100);
    assert_eq!(master.children.len(), 1);

    let starts = service.starts();
    assert_eq!(starts.len(), 2);
    assert_eq!(starts[0].hosts, hosts(&["h1"]));
    let ids: Vec<_> = tracker.list().await.into_iter().map(|j| j.id).collect();
    assert_eq!(ids, vec!["m1".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_transport_errors_never_fail_a_job() {
    let service = Arc::new(FakeService::with_ids(&["j1"]));
    service.script(
        "j1",
        vec![
            unreachable_service(),
            unreachable_service(),
            unreachable_service(),
            running(30),
            completed(),
        ],
    );
    let tracker = tracker_with(&service);
    let mut events = tracker.subscribe();

    tracker
        .start(StartRequest::new("site.yml", hosts(&["h1"])).for_single_host("h1"), false)
        .await
        .unwrap();

    sleep(Duration::from_secs(11)).await;
    assert_eq!(service.calls("j1"), 3);
    let job = tracker.snapshot("j1", false).await.unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.poll_state, PollState::Polling);

    wait_for_finish(&mut events, "j1").await;
    let job = tracker.snapshot("j1", false).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.progress, 100);
    assert_eq!(job.poll_state, PollState::Terminated);
    assert_eq!(service.calls("j1"), 5);
}

#[tokio::test(start_paused = true)]
async fn test_one_request_in_flight_per_job() {
    let mut fake = FakeService::with_ids(&["j1"]);
    fake.latency = Duration::from_secs(3);
    let service = Arc::new(fake);
    service.script("j1", vec![running(10)]);
    let tracker = tracker_with(&service);

    tracker
        .start(StartRequest::new("site.yml", hosts(&["h1"])).for_single_host("h1"), false)
        .await
        .unwrap();
    tracker.expand_output("j1").await.unwrap();
    tracker.expand_output("j1").await.unwrap();

    sleep(Duration::from_secs(20)).await;
    assert!(service.calls("j1") >= 3);
    assert_eq!(service.max_in_flight("j1"), 1);
    assert_eq!(tracker.polling_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_collapse_cancels_pending_poll() {
    let service = Arc::new(FakeService::with_ids(&["j1"]));
    service.script("j1", vec![running(25)]);
    let mut config = tracker_config();
    config.auto_poll = false;
    let tracker = JobTracker::new(service.clone(), config);

    let job = tracker
        .start(StartRequest::new("site.yml", hosts(&["h1"])).for_single_host("h1"), false)
        .await
        .unwrap();
    assert_eq!(job.poll_state, PollState::Idle);
    sleep(Duration::from_secs(5)).await;
    assert_eq!(service.calls("j1"), 0);

    let job = tracker.expand_output("j1").await.unwrap();
    assert_eq!(job.poll_state, PollState::Polling);
    sleep(Duration::from_secs(2)).await;
    assert_eq!(service.calls("j1"), 2);

    tracker.collapse_output("j1").await.unwrap();
    sleep(Duration::from_secs(60)).await;
    assert_eq!(service.calls("j1"), 2);

    let job = tracker.snapshot("j1", false).await.unwrap();
    assert_eq!(job.poll_state, PollState::Idle);
    assert_eq!(job.progress, 25);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_without_terminal_status_expires_to_cancelled() {
    let service = Arc::new(FakeService::with_ids(&["j1"]));
    service.script("j1", vec![running(30)]);
    let tracker = tracker_with(&service);
    let mut events = tracker.subscribe();

    tracker
        .start(StartRequest::new("site.yml", hosts(&["h1"])).for_single_host("h1"), false)
        .await
        .unwrap();
    sleep(Duration::from_secs(1)).await;

    tracker.request_cancel("j1").await.unwrap();
    assert_eq!(service.cancels(), vec!["j1".to_string()]);
    assert_eq!(tracker.snapshot("j1", false).await.unwrap().status, JobStatus::Running);

    wait_for_finish(&mut events, "j1").await;
    let job = tracker.snapshot("j1", false).await.unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert_eq!(job.progress, 100);
    assert_eq!(job.poll_state, PollState::Terminated);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_master_reaches_children() {
    let service = Arc::new(FakeService::with_ids(&["m1", "j1", "j2"]));
    service.script("j1", vec![running(20)]);
    service.script("j2", vec![running(20)]);
    let tracker = tracker_with(&service);
    let mut events = tracker.subscribe();

    tracker
        .start(StartRequest::new("site.yml", hosts(&["h1", "h2"])), true)
        .await
        .unwrap();
    sleep(Duration::from_secs(2)).await;

    tracker.request_cancel("m1").await.unwrap();
    assert_eq!(service.cancels(), vec!["m1".to_string(), "j1".to_string(), "j2".to_string()]);

    wait_for_finish(&mut events, "m1").await;
    let master = tracker.snapshot("m1", false).await.unwrap();
    assert_eq!(master.status, JobStatus::Cancelled);
    assert_eq!(master.progress, 100);
    assert!(master.children.iter().all(|c| c.status == JobStatus::Cancelled));
    assert_eq!(tracker.polling_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_rejected_cancel_leaves_job_untouched() {
    let service = Arc::new(FakeService::with_ids(&["j1"]));
    service.script("j1", vec![running(30)]);
    service.reject_cancel.store(true, Ordering::SeqCst);
    let tracker = tracker_with(&service);

    tracker
        .start(StartRequest::new("site.yml", hosts(&["h1"])).for_single_host("h1"), false)
        .await
        .unwrap();
    sleep(Duration::from_secs(1)).await;

    let err = tracker.request_cancel("j1").await.unwrap_err();
    assert!(matches!(err, TrackerError::CancelFailed { ref job_id, .. } if job_id == "j1"));

    sleep(Duration::from_secs(60)).await;
    let job = tracker.snapshot("j1", false).await.unwrap();
    assert_eq!(job.status, JobStatus::Running);
    assert_eq!(job.poll_state, PollState::Polling);
    let state = tracker.state().read().await;
    assert!(state.registry.get("j1").unwrap().cancel_requested_at.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_start_errors_are_reported() {
    let service = Arc::new(FakeService::with_ids(&["m1"]));
    let tracker = tracker_with(&service);

    let err = tracker
        .start(StartRequest::new("site.yml", vec![]), false)
        .await
        .unwrap_err();
    assert!(matches!(err, TrackerError::InvalidRequest(_)));

    service.reject_start.store(true, Ordering::SeqCst);
    let err = tracker
        .start(StartRequest::new("site.yml", hosts(&["h1"])), false)
        .await
        .unwrap_err();
    assert!(matches!(err, TrackerError::StartFailed(_)));
    assert!(tracker.list().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_unknown_job_is_not_found() {
    let service = Arc::new(FakeService::default());
    let tracker = tracker_with(&service);

    assert!(matches!(tracker.snapshot("nope", false).await, Err(TrackerError::NotFound(_))));
    assert!(matches!(tracker.expand_output("nope").await, Err(TrackerError::NotFound(_))));
    assert!(matches!(tracker.request_cancel("nope").await, Err(TrackerError::NotFound(_))));
    assert!(matches!(tracker.dismiss("nope").await, Err(TrackerError::NotFound(_))));
}

#[tokio::test(start_paused = true)]
async fn test_list_shows_only_top_level_cards() {
    let service = Arc::new(FakeService::with_ids(&["m1", "j1", "j2", "s1"]));
    let tracker = tracker_with(&service);

    tracker
        .start(StartRequest::new("site.yml", hosts(&["h1", "h2"])), true)
        .await
        .unwrap();
    sleep(Duration::from_secs(2)).await;
    tracker
        .start(StartRequest::new("other.yml", hosts(&["h9"])).for_single_host("h9"), false)
        .await
        .unwrap();

    let ids: Vec<_> = tracker.list().await.into_iter().map(|j| j.id).collect();
    assert_eq!(ids, vec!["m1".to_string(), "s1".to_string()]);

    tracker.clear().await;
    assert!(tracker.list().await.is_empty());
    assert_eq!(tracker.job_count().await, 0);
    assert_eq!(tracker.polling_count(), 0);
}

//! Transcript structuring and multi-host output merging.
//!
//! Classification is advisory: it labels lines for display and never feeds
//! back into job status or progress. [`classify`] is a pure function over the
//! raw text, so rendering the same transcript twice yields identical output.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;

use super::correlation::CorrelationIndex;
use super::models::{Attribution, JobId};
use super::registry::JobRegistry;

static PLAY_HEADER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^PLAY\s*\[(.*?)\]").expect("valid regex"));
static TASK_HEADER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:TASK|HANDLER)\s*\[(.*?)\]").expect("valid regex"));
static HOST_RESULT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(ok|changed|failed|fatal|skipping|unreachable):\s*\[([^\]]+)\]").expect("valid regex")
});
static RECAP_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\S+)\s*:\s*ok=(\d+)\s+changed=(\d+)\s+unreachable=(\d+)\s+failed=(\d+)")
        .expect("valid regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultTag {
    Ok,
    Changed,
    Failed,
    Skipped,
    Unreachable,
}

impl ResultTag {
    fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix {
            "ok" => Some(ResultTag::Ok),
            "changed" => Some(ResultTag::Changed),
            "failed" | "fatal" => Some(ResultTag::Failed),
            "skipping" => Some(ResultTag::Skipped),
            "unreachable" => Some(ResultTag::Unreachable),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LineKind {
    PlayHeader { name: String },
    TaskHeader { name: String },
    HostResult { tag: ResultTag, host: String },
    RecapHeader,
    RecapEntry {
        host: String,
        ok: u32,
        changed: u32,
        unreachable: u32,
        failed: u32,
    },
    Plain,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifiedLine {
    pub kind: LineKind,
    pub text: String,
}

/// Classify each line of a raw transcript. Unrecognized lines are `Plain`
/// and their text is kept untouched.
pub fn classify(raw: &str) -> Vec<ClassifiedLine> {
    let mut in_recap = false;
    raw.lines()
        .map(|line| {
            let trimmed = line.trim_start();
            let kind = if trimmed.starts_with("PLAY RECAP") {
                in_recap = true;
                LineKind::RecapHeader
            } else if let Some(caps) = PLAY_HEADER.captures(trimmed) {
                in_recap = false;
                LineKind::PlayHeader { name: caps[1].to_string() }
            } else if let Some(caps) = TASK_HEADER.captures(trimmed) {
                in_recap = false;
                LineKind::TaskHeader { name: caps[1].to_string() }
            } else if let Some(caps) = HOST_RESULT.captures(trimmed) {
                match ResultTag::from_prefix(&caps[1]) {
                    Some(tag) => LineKind::HostResult { tag, host: caps[2].to_string() },
                    None => LineKind::Plain,
                }
            } else if let Some(caps) = RECAP_LINE.captures(trimmed).filter(|_| in_recap) {
                LineKind::RecapEntry {
                    host: caps[1].to_string(),
                    ok: caps[2].parse().unwrap_or(0),
                    changed: caps[3].parse().unwrap_or(0),
                    unreachable: caps[4].parse().unwrap_or(0),
                    failed: caps[5].parse().unwrap_or(0),
                }
            } else {
                LineKind::Plain
            };
            ClassifiedLine {
                kind,
                text: line.to_string(),
            }
        })
        .collect()
}

/// Merge a cumulative transcript into what is already stored for a job.
///
/// The service resends the whole transcript on every poll. A response that
/// is a stale prefix of what we already hold is ignored so the visible
/// output never shrinks. Returns true when the stored text changed.
pub fn append_raw(stored: &mut String, incoming: &str) -> bool {
    if incoming.is_empty() || stored.as_str() == incoming || stored.starts_with(incoming) {
        return false;
    }
    stored.clear();
    stored.push_str(incoming);
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptSection {
    /// Target host, or `None` for an unattributed stream.
    pub host: Option<String>,
    pub job_id: JobId,
    pub lines: Vec<ClassifiedLine>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CombinedTranscript {
    pub master_id: JobId,
    pub attribution: Attribution,
    pub sections: Vec<TranscriptSection>,
}

impl fmt::Display for CombinedTranscript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let total = self.sections.len();
        for (idx, section) in self.sections.iter().enumerate() {
            if idx > 0 {
                writeln!(f)?;
            }
            match &section.host {
                Some(host) => writeln!(
                    f,
                    "==== HOST {}/{}: {} (Job: {}) ====",
                    idx + 1,
                    total,
                    host,
                    section.job_id
                )?,
                None => writeln!(
                    f,
                    "==== UNATTRIBUTED / SINGLE-STREAM (Job: {}) ====",
                    section.job_id
                )?,
            }
            for line in &section.lines {
                writeln!(f, "{}", line.text)?;
            }
        }
        Ok(())
    }
}

/// Build the combined transcript for a job.
///
/// A master with correlated children gets one labelled section per child in
/// first-resolved target order. Anything else gets its own stream verbatim
/// in a single unattributed section. Returns `None` for unknown jobs.
pub fn render_combined(
    registry: &JobRegistry,
    correlation: &CorrelationIndex,
    master_id: &str,
    attribution: Attribution,
) -> Option<CombinedTranscript> {
    let master = registry.get(master_id)?;
    let children = correlation.children_of(master_id);

    let sections = if children.is_empty() {
        vec![TranscriptSection {
            host: None,
            job_id: master.id.clone(),
            lines: classify(&master.raw_output),
        }]
    } else {
        children
            .iter()
            .map(|link| TranscriptSection {
                host: Some(link.target.clone()),
                job_id: link.job_id.clone(),
                lines: registry
                    .get(&link.job_id)
                    .map(|child| classify(&child.raw_output))
                    .unwrap_or_default(),
            })
            .collect()
    };

    Some(CombinedTranscript {
        master_id: master.id.clone(),
        attribution,
        sections,
    })
}

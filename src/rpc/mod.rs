//! JSON-RPC 2.0 over TCP: the daemon's presentation-layer interface.
//!
//! - `protocol`: request/response types and error codes
//! - `transport`: TCP listener with newline-delimited framing
//! - `methods`: dispatch onto the job tracker
//! - `client`: used by the CLI subcommands

pub mod client;
pub mod methods;
mod protocol;
mod transport;

use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;

use crate::context::AppContext;
use transport::Transport;

pub use client::{ClientError, RpcClient};
pub use methods::MethodHandler;
pub use protocol::{
    CANCEL_FAILED, INVALID_PARAMS, JOB_NOT_FOUND, Request, Response, RpcError, START_FAILED,
};

pub struct RpcServer {
    transport: Transport,
}

impl RpcServer {
    /// Bind the listener. Port 0 picks a free port; see [`RpcServer::local_addr`].
    pub async fn bind(ctx: AppContext, bind_addr: SocketAddr) -> anyhow::Result<Self> {
        let transport = Transport::bind(bind_addr, MethodHandler::new(ctx)).await?;
        Ok(Self { transport })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.transport.local_addr()
    }

    /// Serve until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) -> anyhow::Result<()> {
        self.transport.listen(shutdown).await
    }
}

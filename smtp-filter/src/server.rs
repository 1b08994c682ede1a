use std::sync::Arc;
use std::time::Duration;

use miette::{Context, IntoDiagnostic, Result};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::session::{handle_connection, SessionContext};

const ACCEPT_RETRY_PAUSE: Duration = Duration::from_secs(1);

pub struct Server {
    listener: TcpListener,
    ctx: Arc<SessionContext>,
    sessions: TaskTracker,
    limit: Option<Arc<Semaphore>>,
}

impl Server {
    pub async fn bind(ctx: Arc<SessionContext>) -> Result<Self> {
        let server = &ctx.provider.config().server;
        let listener = TcpListener::bind(&server.listen_addr)
            .await
            .into_diagnostic()
            .wrap_err_with(|| format!("binding {}", server.listen_addr))?;
        let limit = server
            .max_sessions
            .map(|max| Arc::new(Semaphore::new(max.max(1))));

        Ok(Server {
            listener,
            ctx,
            sessions: TaskTracker::new(),
            limit,
        })
    }

    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        self.listener.local_addr().into_diagnostic()
    }

    /// Handle on the live sessions, used to wait for them on shutdown.
    pub fn sessions(&self) -> TaskTracker {
        self.sessions.clone()
    }

    /// Accepts connections until `cancel` fires. Sessions already running are
    /// left to finish; see [`drain`].
    pub async fn run(self, cancel: CancellationToken) {
        info!(addr = ?self.listener.local_addr().ok(), "listening");

        loop {
            let permit = match &self.limit {
                Some(limit) => tokio::select! {
                    _ = cancel.cancelled() => break,
                    permit = limit.clone().acquire_owned() => match permit {
                        Ok(permit) => Some(permit),
                        Err(_) => break,
                    },
                },
                None => None,
            };

            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((socket, _peer)) => {
                    let ctx = self.ctx.clone();
                    self.sessions.spawn(async move {
                        handle_connection(socket, ctx).await;
                        drop(permit);
                    });
                }
                Err(e) => {
                    error!(error = %e, "error accepting connection");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(ACCEPT_RETRY_PAUSE) => {}
                    }
                }
            }
        }

        self.sessions.close();
        info!("listener stopped");
    }
}

/// Waits up to `limit` for the tracked sessions to end. Returns false if some
/// were still running when the time ran out.
pub async fn drain(sessions: &TaskTracker, limit: Duration) -> bool {
    sessions.close();
    if !sessions.is_empty() {
        info!("waiting for {} sessions", sessions.len());
    }

    match tokio::time::timeout(limit, sessions.wait()).await {
        Ok(()) => true,
        Err(_) => {
            warn!(remaining = sessions.len(), "waiting for sessions timeout");
            false
        }
    }
}

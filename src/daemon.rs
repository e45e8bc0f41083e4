//! Daemon composition root
//!
//! Owns the mail tool client and the HTTP server, binds the front-door
//! port through the negotiator, and decides when the process should exit:
//! on Ctrl-C or SIGTERM after a graceful stop, or with a failure code when
//! the mail tool exhausts its restart budget.

use std::collections::HashSet;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{HTTP_SERVICE, PortConfig, PortConfigError};
use crate::http_server::HttpServer;
use crate::mail::{MailClientError, MailToolClient, MailToolConfig};
use crate::net::{NegotiationError, PortNegotiator, default_alternates};
use crate::supervisor::{SupervisorConfigError, SupervisorEvent};

/// Exit code used when the mail tool failed permanently
pub const PERMANENT_FAILURE_EXIT_CODE: i32 = 2;

#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("Port configuration error: {0}")]
    Ports(#[from] PortConfigError),

    #[error(transparent)]
    Negotiation(#[from] NegotiationError),

    #[error("Mail tool configuration error: {0}")]
    MailConfig(#[from] SupervisorConfigError),

    #[error("Mail tool error: {0}")]
    Mail(#[from] MailClientError),
}

impl DaemonError {
    /// Operator-facing remediation
    pub fn hint(&self) -> Option<String> {
        match self {
            DaemonError::Ports(e) => e
                .suggestion()
                .map(|port| format!("Try port {port} (--http-port / --mcp-port)")),
            DaemonError::Negotiation(e) => e.hint(),
            DaemonError::MailConfig(_) => None,
            DaemonError::Mail(MailClientError::Supervisor(e)) => e.hint(),
            DaemonError::Mail(MailClientError::Rpc(e)) => e.hint(),
            DaemonError::Mail(_) => None,
        }
    }
}

/// Why the daemon stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonExit {
    /// Stopped on request
    Shutdown,
    /// The mail tool crashed more often than the restart budget allows
    PermanentFailure { attempts: u32 },
}

impl DaemonExit {
    pub fn code(self) -> i32 {
        match self {
            DaemonExit::Shutdown => 0,
            DaemonExit::PermanentFailure { .. } => PERMANENT_FAILURE_EXIT_CODE,
        }
    }
}

pub struct Daemon {
    ports: PortConfig,
    mail: MailToolConfig,
}

impl Daemon {
    pub fn new(ports: PortConfig, mail: MailToolConfig) -> Self {
        Self { ports, mail }
    }

    /// Run until a shutdown signal or a permanent mail tool failure
    pub async fn run(self) -> Result<DaemonExit, DaemonError> {
        self.run_until(shutdown_signal()).await
    }

    /// Run until `shutdown` completes or the mail tool fails permanently
    pub async fn run_until<F>(self, shutdown: F) -> Result<DaemonExit, DaemonError>
    where
        F: std::future::Future<Output = ()>,
    {
        self.ports.validate()?;

        let claimed: HashSet<u16> = self.ports.claimed_ports().into_iter().collect();
        let negotiator = PortNegotiator::new(HTTP_SERVICE, self.ports.http.source.clone())
            .with_claimed_ports(claimed.iter().copied());
        let alternates = default_alternates(self.ports.http.value, &claimed);
        let (listener, resolution) = negotiator
            .resolve_and_bind(self.ports.http.value, &alternates)
            .await?;

        info!(
            "Mail tool port {} from {}",
            self.ports.mcp.value, self.ports.mcp.source
        );
        let client = MailToolClient::new(&self.mail)?;
        let mut events = client.supervisor().subscribe();
        client.start().await?;

        let server_shutdown = CancellationToken::new();
        let server = HttpServer::new(listener, resolution, client.clone())
            .spawn(server_shutdown.clone());

        let exit = watch_events(&mut events, shutdown).await;

        info!("Daemon stopping ({:?})", exit);
        if let Err(e) = client.stop().await {
            warn!("Mail tool did not stop cleanly: {}", e);
        }
        server_shutdown.cancel();
        match server.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("HTTP server failed: {}", e),
            Err(e) => debug!("HTTP server task ended abnormally: {}", e),
        }

        Ok(exit)
    }
}

async fn watch_events<F>(events: &mut broadcast::Receiver<SupervisorEvent>, shutdown: F) -> DaemonExit
where
    F: std::future::Future<Output = ()>,
{
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => return DaemonExit::Shutdown,
            event = events.recv() => match event {
                Ok(SupervisorEvent::PermanentFailure { attempts }) => {
                    error!(
                        "Mail tool failed permanently after {} restart attempt(s), shutting down",
                        attempts
                    );
                    return DaemonExit::PermanentFailure { attempts };
                }
                Ok(SupervisorEvent::Error { kind, message }) => {
                    warn!("Mail tool error ({}): {}", kind, message);
                }
                Ok(event) => debug!("Mail tool event: {}", event.name()),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Missed {} mail tool event(s)", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    // Sender lives in the supervisor; only the shutdown path remains
                    (&mut shutdown).await;
                    return DaemonExit::Shutdown;
                }
            }
        }
    }
}

/// Completes on Ctrl-C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

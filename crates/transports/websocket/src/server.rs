//! WebSocket control server
//!
//! Binds the listener, spawns the dispatcher and one task per connection,
//! and runs the ordered shutdown when asked to stop.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use pipectl_core::{ControlPlane, EventReceiver};

use crate::config::ServerConfig;
use crate::connection::handle_connection;
use crate::dispatcher::BroadcastDispatcher;
use crate::error::Result;

/// How long connection tasks get to flush their close frames at shutdown
const CONNECTION_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// A bound, not yet serving, control server
pub struct ControlServer {
    listener: TcpListener,
    config: Arc<ServerConfig>,
    control: ControlPlane,
    events: EventReceiver,
}

impl ControlServer {
    /// Validate the configuration and bind the listening socket
    ///
    /// Failing to bind is the only fatal startup error.
    pub async fn bind(
        config: ServerConfig,
        control: ControlPlane,
        events: EventReceiver,
    ) -> Result<Self> {
        config.validate()?;
        let listener = TcpListener::bind(config.bind_addr()).await.map_err(|e| {
            error!(addr = %config.bind_addr(), error = %e, "Failed to bind WebSocket server");
            e
        })?;
        info!(
            addr = %listener.local_addr()?,
            path = %config.path,
            "WebSocket server bound"
        );

        Ok(Self {
            listener,
            config: Arc::new(config),
            control,
            events,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Serve until the process ends
    pub async fn serve(self) -> Result<()> {
        self.serve_with_shutdown(std::future::pending()).await
    }

    /// Serve until `shutdown` completes
    ///
    /// Shutdown order: stop accepting connections, delete every pipeline,
    /// close every client, stop the engine.
    pub async fn serve_with_shutdown<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let ControlServer {
            listener,
            config,
            control,
            events,
        } = self;
        let local_addr = listener.local_addr()?;

        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        let (dispatcher, handle) = BroadcastDispatcher::new(control, events, &config);
        let dispatcher_task = tokio::spawn(dispatcher.run(shutdown_tx.subscribe()));

        info!("WebSocket server started on ws://{}{}", local_addr, config.path);

        let mut connections = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer_addr)) => {
                            debug!(peer = %peer_addr, "Accepted TCP connection");
                            let handle = handle.clone();
                            let config = Arc::clone(&config);
                            connections.spawn(async move {
                                let result =
                                    handle_connection(stream, peer_addr, handle, config).await;
                                if let Err(e) = result {
                                    warn!(
                                        peer = %peer_addr,
                                        error = %e,
                                        "WebSocket connection error"
                                    );
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept WebSocket connection");
                        }
                    }
                }
                Some(finished) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = finished {
                        error!(error = %e, "Connection task failed");
                    }
                }
            }
        }

        drop(listener);
        drop(handle);

        let _ = shutdown_tx.send(());
        if let Err(e) = dispatcher_task.await {
            error!(error = %e, "Dispatcher task failed");
        }

        let drained = tokio::time::timeout(CONNECTION_DRAIN_TIMEOUT, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(remaining = connections.len(), "Aborting connections that did not close in time");
            connections.abort_all();
        }

        info!("WebSocket server stopped");
        Ok(())
    }
}

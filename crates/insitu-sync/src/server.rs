//! Parameter server network loop.
//!
//! ```text
//!   TcpListener ──accept──► connection task (one per client)
//!                               │ read_header, read_body (body timeout)
//!                               ▼
//!                           WorkQueue ──► HandlerTable::dispatch(&PsState)
//!                               │              (N OS worker threads)
//!                               ▼ oneshot
//!                           write_message (reply)
//! ```
//!
//! Requests of one connection are handled strictly in order; requests of
//! different connections run concurrently on the worker pool.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};
use crate::handler::{error_reply, HandlerTable, PsState};
use crate::protocol::{self, Message, MessageType, DEFAULT_MAX_BODY};
use crate::queue::WorkQueue;

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Handler worker threads
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Queued requests before submitters wait
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Close a connection whose request body stalls this long after its
    /// header arrived. Waiting between requests is not limited.
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,

    /// Maximum message body size in bytes
    #[serde(default = "default_max_body")]
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
            read_timeout_secs: default_read_timeout(),
            max_body_bytes: default_max_body(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 5559))
}

fn default_workers() -> usize {
    4
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_read_timeout() -> u64 {
    30
}

fn default_max_body() -> usize {
    DEFAULT_MAX_BODY
}

/// Stops a running [`NetServer`].
#[derive(Clone, Debug)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_shutdown(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Everything a connection task needs.
#[derive(Clone)]
struct ConnectionContext {
    state: Arc<PsState>,
    handlers: Arc<HandlerTable>,
    queue: Arc<WorkQueue>,
    shutdown: ShutdownHandle,
    read_timeout: Duration,
    max_body: usize,
}

/// The parameter server.
pub struct NetServer {
    config: ServerConfig,
    listener: TcpListener,
    state: Arc<PsState>,
    handlers: HandlerTable,
    shutdown: ShutdownHandle,
}

impl NetServer {
    /// Bind the listen socket. Use port 0 to pick a free port.
    pub async fn bind(config: ServerConfig, state: Arc<PsState>) -> SyncResult<Self> {
        let listener = TcpListener::bind(config.listen_addr).await?;
        let (tx, _) = watch::channel(false);
        Ok(Self {
            config,
            listener,
            state,
            handlers: HandlerTable::standard(),
            shutdown: ShutdownHandle { tx: Arc::new(tx) },
        })
    }

    pub fn with_handlers(mut self, handlers: HandlerTable) -> Self {
        self.handlers = handlers;
        self
    }

    pub fn local_addr(&self) -> SyncResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn state(&self) -> Arc<PsState> {
        self.state.clone()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Serve until a quit message arrives or the shutdown handle fires.
    /// In-flight requests finish before this returns.
    pub async fn run(self) -> SyncResult<()> {
        let addr = self.local_addr()?;
        let queue = Arc::new(WorkQueue::new(
            "ps-worker",
            self.config.workers,
            self.config.queue_capacity,
        )?);
        let ctx = ConnectionContext {
            state: self.state.clone(),
            handlers: Arc::new(self.handlers),
            queue: queue.clone(),
            shutdown: self.shutdown.clone(),
            read_timeout: Duration::from_secs(self.config.read_timeout_secs.max(1)),
            max_body: self.config.max_body_bytes,
        };
        let mut stop = self.shutdown.tx.subscribe();
        let mut connections = JoinSet::new();

        info!(%addr, workers = self.config.workers, "parameter server listening");

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "client connected");
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!(%peer, error = %e, "set_nodelay failed");
                        }
                        connections.spawn(serve_connection(stream, peer, ctx.clone()));
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                },
                _ = stop.wait_for(|stopped| *stopped) => break,
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        warn!(error = %e, "connection task failed");
                    }
                }
            }
        }

        info!(open = connections.len(), "shutting down, draining connections");
        while let Some(joined) = connections.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "connection task failed");
            }
        }
        drop(ctx);

        match Arc::try_unwrap(queue) {
            Ok(queue) => {
                tokio::task::spawn_blocking(move || queue.shutdown())
                    .await
                    .map_err(|e| SyncError::Protocol(format!("worker pool join failed: {e}")))?;
            }
            Err(_) => warn!("work queue still shared at shutdown"),
        }
        info!(
            requests = self.state.requests_served(),
            "parameter server stopped"
        );
        Ok(())
    }
}

async fn serve_connection(stream: TcpStream, peer: SocketAddr, ctx: ConnectionContext) {
    let (mut reader, mut writer) = stream.into_split();
    let mut stop = ctx.shutdown.tx.subscribe();

    loop {
        let header = tokio::select! {
            header = protocol::read_header(&mut reader) => header,
            _ = stop.wait_for(|stopped| *stopped) => break,
        };
        let header = match header {
            Ok(Some(header)) => header,
            Ok(None) => {
                debug!(%peer, "client disconnected");
                break;
            }
            Err(e) => {
                warn!(%peer, error = %e, "unreadable header, closing connection");
                break;
            }
        };

        let body = tokio::time::timeout(
            ctx.read_timeout,
            protocol::read_body(&mut reader, &header, ctx.max_body),
        )
        .await;
        let request = match body {
            Ok(Ok(body)) => Message { header, body },
            Ok(Err(e @ SyncError::BodyTooLarge { .. })) => {
                warn!(%peer, error = %e, "oversized request rejected");
                let head_only = Message { header, body: Bytes::new() };
                let discarded = tokio::time::timeout(
                    ctx.read_timeout,
                    protocol::discard_body(&mut reader, header.body_len()),
                )
                .await;
                if !matches!(discarded, Ok(Ok(()))) {
                    break;
                }
                if protocol::write_message(&mut writer, &error_reply(&head_only, &e)).await.is_err() {
                    break;
                }
                continue;
            }
            Ok(Err(e @ SyncError::Protocol(_))) => {
                // the stream cannot be realigned after a bad size
                warn!(%peer, error = %e, "malformed header, closing connection");
                let head_only = Message { header, body: Bytes::new() };
                let _ = protocol::write_message(&mut writer, &error_reply(&head_only, &e)).await;
                break;
            }
            Ok(Err(e)) => {
                warn!(%peer, error = %e, "unreadable message, closing connection");
                break;
            }
            Err(_) => {
                info!(%peer, timeout = ?ctx.read_timeout, "request body stalled, closing connection");
                break;
            }
        };

        if request.header.msg_type == MessageType::ReqQuit.as_i32() {
            if request.is_quit() {
                let reply = request.reply(MessageType::RepQuit, Vec::new());
                if let Err(e) = protocol::write_message(&mut writer, &reply).await {
                    debug!(%peer, error = %e, "quit reply not delivered");
                }
                info!(%peer, "quit received");
                ctx.shutdown.shutdown();
                break;
            }
            let e = SyncError::Protocol("quit request must have an empty body".into());
            if protocol::write_message(&mut writer, &error_reply(&request, &e)).await.is_err() {
                break;
            }
            continue;
        }

        let reply = dispatch(&ctx, request).await;
        if let Err(e) = protocol::write_message(&mut writer, &reply).await {
            debug!(%peer, error = %e, "reply not delivered");
            break;
        }
    }
}

/// Run one request on the worker pool and wait for its reply.
async fn dispatch(ctx: &ConnectionContext, request: Message) -> Message {
    let (tx, rx) = oneshot::channel();
    let state = ctx.state.clone();
    let handlers = ctx.handlers.clone();
    let job_request = request.clone();

    let submitted = ctx
        .queue
        .submit(move || {
            let reply = handlers.dispatch(&state, &job_request);
            let _ = tx.send(reply);
        })
        .await;

    match submitted {
        Ok(()) => match rx.await {
            Ok(reply) => reply,
            Err(_) => error_reply(&request, &SyncError::QueueClosed),
        },
        Err(e) => error_reply(&request, &e),
    }
}

//! Per-connection method executor.
//!
//! The I/O task validates and decodes requests, then hands them to an
//! executor task over a channel. The executor owns the connection's handler
//! state and runs one handler at a time on the blocking pool, so handler
//! latency never stalls the read pump and handlers never race each other.

use crate::context::OperationContext;
use crate::error::{ChannelError, HandlerError};
use crate::service::{AnyMessage, Reply, Service};
use crate::streams::StreamTable;
use crate::transport::SendQueue;
use protochannel_protocol::{MessageHeader, MessageKind};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// A validated request waiting for execution.
pub struct PendingRequest {
    pub message: AnyMessage,
    pub message_type: u32,
    pub association_id: u16,
    pub is_one_way: bool,
}

impl std::fmt::Debug for PendingRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRequest")
            .field("message_type", &self.message_type)
            .field("association_id", &self.association_id)
            .field("is_one_way", &self.is_one_way)
            .finish()
    }
}

/// Faults nobody on the wire is told about.
#[derive(Debug, Error)]
pub enum UnhandledError {
    #[error("handler for message {message_type} (association {association_id}) failed: {source}")]
    Handler {
        message_type: u32,
        association_id: u16,
        #[source]
        source: HandlerError,
    },

    #[error("connection failed: {source}")]
    Connection {
        #[source]
        source: ChannelError,
    },
}

/// Receives faults that cannot be reported to the peer.
pub trait UnhandledErrorHook: Send + Sync + 'static {
    fn on_error(&self, error: &UnhandledError);
}

impl<F> UnhandledErrorHook for F
where
    F: Fn(&UnhandledError) + Send + Sync + 'static,
{
    fn on_error(&self, error: &UnhandledError) {
        self(error)
    }
}

/// Logs unhandled errors through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogErrorHook;

impl UnhandledErrorHook for LogErrorHook {
    fn on_error(&self, error: &UnhandledError) {
        tracing::error!("Unhandled error: {}", error);
    }
}

/// Handle to a running executor task.
pub struct Executor {
    tx: mpsc::UnboundedSender<PendingRequest>,
    task: JoinHandle<()>,
}

impl Executor {
    /// Starts an executor owning `handler`.
    pub fn spawn<S: Send + 'static>(
        handler: S,
        service: Arc<Service<S>>,
        protocol: u32,
        queue: Arc<SendQueue>,
        streams: Arc<StreamTable>,
        hook: Arc<dyn UnhandledErrorHook>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_executor(
            handler, service, protocol, queue, streams, hook, rx,
        ));
        Self { tx, task }
    }

    /// Queues a request. Fails once the executor has stopped.
    pub fn submit(&self, request: PendingRequest) -> Result<(), ChannelError> {
        self.tx.send(request).map_err(|_| ChannelError::Disposed)
    }

    /// Lets queued requests finish, then waits for the executor to exit.
    pub async fn drain(self) {
        drop(self.tx);
        let _ = self.task.await;
    }

    /// Stops the executor without running queued requests. A handler that is
    /// already running finishes on the blocking pool but its result is dropped.
    pub fn abort(self) {
        self.task.abort();
    }
}

async fn run_executor<S: Send + 'static>(
    handler: S,
    service: Arc<Service<S>>,
    protocol: u32,
    queue: Arc<SendQueue>,
    streams: Arc<StreamTable>,
    hook: Arc<dyn UnhandledErrorHook>,
    mut rx: mpsc::UnboundedReceiver<PendingRequest>,
) {
    let mut handler = handler;

    while let Some(request) = rx.recv().await {
        let method = match service.method(request.message_type) {
            Some(method) => method.clone(),
            None => continue,
        };
        let message_type = request.message_type;
        let association_id = request.association_id;
        let mut ctx = OperationContext::new(
            association_id,
            message_type,
            protocol,
            queue.clone(),
            streams.clone(),
        );

        let mut state = handler;
        let joined = tokio::task::spawn_blocking(move || {
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                method.invoke(&mut state, &mut ctx, request.message)
            }));
            (state, outcome)
        })
        .await;

        let outcome = match joined {
            Ok((state, outcome)) => {
                handler = state;
                outcome
            }
            Err(e) => {
                tracing::debug!("Executor stopped: {}", e);
                return;
            }
        };

        let result = match outcome {
            Ok(result) => result,
            Err(panic) => Err(HandlerError::Panicked(panic_message(panic.as_ref()))),
        };

        match result {
            Ok(Some(reply)) if !request.is_one_way => {
                send_reply(&queue, association_id, reply, &*hook);
            }
            Ok(_) => {}
            Err(source) => hook.on_error(&UnhandledError::Handler {
                message_type,
                association_id,
                source,
            }),
        }
    }
}

fn send_reply(queue: &SendQueue, association_id: u16, reply: Reply, hook: &dyn UnhandledErrorHook) {
    let header = MessageHeader::new(MessageKind::Response, reply.message_type, association_id);
    match queue.send_encoded(header, &reply.body) {
        Ok(()) => {}
        Err(ChannelError::Disposed) => {
            tracing::debug!(
                "Dropping response {} for closed connection",
                association_id
            );
        }
        Err(source) => hook.on_error(&UnhandledError::Connection { source }),
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

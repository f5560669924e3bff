//! Outstanding calls and stream uploads, keyed by association id.

use crate::error::ClientError;
use parking_lot::Mutex;
use protochannel_core::{ChannelError, ResponseHandler};
use protochannel_protocol::{ErrorCode, MessageHeader};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::oneshot;

/// Ids 1..=u16::MAX; 0 is used by one-way messages.
const MAX_OUTSTANDING: usize = u16::MAX as usize;

/// An undecoded response body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    pub message_type: u32,
    pub body: Vec<u8>,
}

pub(crate) type CallReceiver = oneshot::Receiver<Result<RawResponse, ClientError>>;
pub(crate) type StreamReceiver = oneshot::Receiver<Result<(), ClientError>>;

enum Waiter {
    Call(oneshot::Sender<Result<RawResponse, ClientError>>),
    Stream(oneshot::Sender<Result<(), ClientError>>),
}

/// Why the table stopped accepting work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    PeerClosed,
    Remote(ErrorCode),
    Violation(ErrorCode),
    Failed(String),
}

impl CloseReason {
    fn to_error(&self) -> ClientError {
        match self {
            CloseReason::PeerClosed => ClientError::ConnectionClosed,
            CloseReason::Remote(code) => ClientError::Remote(*code),
            CloseReason::Violation(code) => ClientError::Violation(*code),
            CloseReason::Failed(message) => ClientError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                message.clone(),
            )),
        }
    }
}

struct PendingState {
    next_id: u16,
    waiters: HashMap<u16, Waiter>,
    closed: Option<CloseReason>,
}

/// Association-keyed table of everything awaiting an answer from the host.
pub struct PendingTable {
    state: Mutex<PendingState>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PendingState {
                next_id: 1,
                waiters: HashMap::new(),
                closed: None,
            }),
        }
    }

    pub(crate) fn register_call(&self) -> Result<(u16, CallReceiver), ClientError> {
        let (tx, rx) = oneshot::channel();
        let id = self.insert(Waiter::Call(tx))?;
        Ok((id, rx))
    }

    pub(crate) fn register_stream(&self) -> Result<(u16, StreamReceiver), ClientError> {
        let (tx, rx) = oneshot::channel();
        let id = self.insert(Waiter::Stream(tx))?;
        Ok((id, rx))
    }

    fn insert(&self, waiter: Waiter) -> Result<u16, ClientError> {
        let mut state = self.state.lock();
        if let Some(reason) = &state.closed {
            return Err(reason.to_error());
        }
        if state.waiters.len() >= MAX_OUTSTANDING {
            return Err(ClientError::TooManyPending);
        }
        // Wraps and skips ids that are still outstanding.
        let id = loop {
            let id = state.next_id;
            state.next_id = match id.wrapping_add(1) {
                0 => 1,
                next => next,
            };
            if !state.waiters.contains_key(&id) {
                break id;
            }
        };
        state.waiters.insert(id, waiter);
        Ok(id)
    }

    /// Forgets an entry, e.g. after a timeout. Late answers are dropped.
    pub fn remove(&self, association_id: u16) {
        self.state.lock().waiters.remove(&association_id);
    }

    pub fn len(&self) -> usize {
        self.state.lock().waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The error new work fails with, once closed.
    pub fn closed_error(&self) -> Option<ClientError> {
        self.state.lock().closed.as_ref().map(CloseReason::to_error)
    }

    /// Fails every waiter and refuses new ones. The first reason wins.
    pub fn close(&self, reason: CloseReason) {
        let (reason, waiters) = {
            let mut state = self.state.lock();
            let reason = state.closed.get_or_insert(reason).clone();
            (reason, std::mem::take(&mut state.waiters))
        };
        for (_, waiter) in waiters {
            match waiter {
                Waiter::Call(tx) => {
                    let _ = tx.send(Err(reason.to_error()));
                }
                Waiter::Stream(tx) => {
                    let _ = tx.send(Err(reason.to_error()));
                }
            }
        }
    }

    fn complete_response(&self, header: MessageHeader, body: Vec<u8>) {
        let id = header.association_id;
        let waiter = {
            let mut state = self.state.lock();
            match state.waiters.remove(&id) {
                Some(Waiter::Stream(tx)) => {
                    state.waiters.insert(id, Waiter::Stream(tx));
                    None
                }
                other => other,
            }
        };
        match waiter {
            Some(Waiter::Call(tx)) => {
                let _ = tx.send(Ok(RawResponse {
                    message_type: header.message_type,
                    body,
                }));
            }
            _ => tracing::debug!("Dropping response for unknown association {}", id),
        }
    }

    fn complete_stream(&self, association_id: u16, accepted: bool) {
        let waiter = {
            let mut state = self.state.lock();
            match state.waiters.remove(&association_id) {
                Some(Waiter::Call(tx)) => {
                    state.waiters.insert(association_id, Waiter::Call(tx));
                    None
                }
                other => other,
            }
        };
        match waiter {
            Some(Waiter::Stream(tx)) => {
                let result = if accepted {
                    Ok(())
                } else {
                    Err(ClientError::StreamRejected { association_id })
                };
                let _ = tx.send(result);
            }
            _ => tracing::debug!(
                "Dropping stream acknowledgement for unknown association {}",
                association_id
            ),
        }
    }
}

impl Default for PendingTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Routes responses and stream acknowledgements into a [`PendingTable`].
pub struct PendingResponses(pub Arc<PendingTable>);

impl ResponseHandler for PendingResponses {
    fn on_response(&mut self, header: MessageHeader, body: Vec<u8>) -> Result<(), ChannelError> {
        self.0.complete_response(header, body);
        Ok(())
    }

    fn on_stream_ack(&mut self, association_id: u16, accepted: bool) -> Result<(), ChannelError> {
        self.0.complete_stream(association_id, accepted);
        Ok(())
    }
}

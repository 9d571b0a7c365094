//! In-flight requests
//!
//! A [`Request`] is the unit of work whose processing may be deferred. Its
//! payload is opaque to this workspace. Completing a request consumes it, so a
//! request can be observably completed at most once; dropping a request that
//! was never completed reports [`RequestStatus::Abandoned`] to its waiter.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::oneshot;

/// Request ID for matching completions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req#{}", self.0)
    }
}

/// Final status of a request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestStatus {
    /// Processed successfully
    Success,
    /// Processing failed with a host-defined code
    Failed { code: i32 },
    /// Dropped without being completed
    Abandoned,
}

/// Completion record delivered to the waiter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub id: RequestId,
    pub status: RequestStatus,
    /// Name of the thread that completed the request
    pub completed_on: String,
}

impl Completion {
    fn here(id: RequestId, status: RequestStatus) -> Self {
        Self {
            id,
            status,
            completed_on: std::thread::current()
                .name()
                .unwrap_or("unnamed")
                .to_string(),
        }
    }
}

/// An in-flight request
pub struct Request {
    id: RequestId,
    endpoint: u8,
    payload: Bytes,
    completion: Option<oneshot::Sender<Completion>>,
}

impl Request {
    /// Create a request and the waiter that observes its completion
    pub fn new(id: RequestId, endpoint: u8, payload: impl Into<Bytes>) -> (Self, CompletionWaiter) {
        let (tx, rx) = oneshot::channel();
        let request = Self {
            id,
            endpoint,
            payload: payload.into(),
            completion: Some(tx),
        };
        (request, CompletionWaiter { id, rx })
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Target endpoint address
    pub fn endpoint(&self) -> u8 {
        self.endpoint
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Complete the request
    ///
    /// Returns `false` if nobody is waiting for the completion anymore.
    pub fn complete(mut self, status: RequestStatus) -> bool {
        match self.completion.take() {
            Some(tx) => tx.send(Completion::here(self.id, status)).is_ok(),
            None => false,
        }
    }
}

impl Drop for Request {
    fn drop(&mut self) {
        if let Some(tx) = self.completion.take() {
            tracing::warn!(request = %self.id, "Request dropped without completion");
            let _ = tx.send(Completion::here(self.id, RequestStatus::Abandoned));
        }
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// Receiving side of a request's completion
#[derive(Debug)]
pub struct CompletionWaiter {
    id: RequestId,
    rx: oneshot::Receiver<Completion>,
}

impl CompletionWaiter {
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Wait for the request to complete
    pub async fn wait(self) -> Completion {
        let id = self.id;
        self.rx
            .await
            .unwrap_or_else(|_| Completion::here(id, RequestStatus::Abandoned))
    }

    /// Wait from a thread outside any async runtime
    pub fn blocking_wait(self) -> Completion {
        let id = self.id;
        self.rx
            .blocking_recv()
            .unwrap_or_else(|_| Completion::here(id, RequestStatus::Abandoned))
    }

    /// Check for a completion without waiting
    pub fn try_wait(&mut self) -> Option<Completion> {
        self.rx.try_recv().ok()
    }
}

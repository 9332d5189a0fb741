//! The edge-side correlation structure: one row per in-flight public HTTP
//! request, keyed by the id assigned when the request was admitted.
//!
//! Mirrors the counter-plus-locked-map split used elsewhere in this
//! codebase for session bookkeeping, but the delivery slot here is a
//! bounded `mpsc` channel rather than a plain map value, since a handler
//! needs to *wait* for its row to be filled in.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::AetherError;
use crate::frame::{RequestFrame, ResponseFrame};

/// A single row of the exchange table.
struct Exchange {
    sender: mpsc::Sender<ResponseFrame>,
    #[allow(dead_code)]
    created_at: Instant,
}

/// Correlates request ids with the handler waiting on their response.
///
/// One table exists per `Session`; it is discarded along with the session
/// so a stale entry can never outlive the channel that could fill it.
pub struct ExchangeTable {
    rows: Mutex<HashMap<u64, Exchange>>,
    next_id: AtomicU64,
}

impl Default for ExchangeTable {
    fn default() -> Self {
        Self {
            rows: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }
}

impl ExchangeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign a fresh id to `request`, install its delivery slot, and hand
    /// back the id, the populated frame, and the receiving half the caller
    /// should await.
    pub fn insert(&self, mut request: RequestFrame) -> (u64, RequestFrame, mpsc::Receiver<ResponseFrame>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        request.id = id;

        let (sender, receiver) = mpsc::channel(1);
        self.rows.lock().insert(
            id,
            Exchange {
                sender,
                created_at: request.created_at,
            },
        );

        (id, request, receiver)
    }

    /// Remove the row for `id`, if still present. Safe to call more than
    /// once; every caller treats this as idempotent cleanup.
    pub fn remove(&self, id: u64) {
        self.rows.lock().remove(&id);
    }

    /// Deliver a response from the agent to its waiting handler.
    ///
    /// Uses `try_send` rather than a blocking send: the channel has
    /// capacity 1 and the handler is the only consumer, so this succeeds
    /// unless the handler already gave up (timeout, cancellation) and the
    /// row just hasn't been swept yet, or `close_all` raced us to the same
    /// slot — both are fine to ignore.
    pub fn deliver(&self, response: ResponseFrame) -> Result<(), AetherError> {
        let sender = {
            let rows = self.rows.lock();
            match rows.get(&response.id) {
                Some(exchange) => exchange.sender.clone(),
                None => return Err(AetherError::UnknownId(response.id)),
            }
        };

        let _ = sender.try_send(response);
        Ok(())
    }

    /// Synthesize an error response for every exchange still open, without
    /// removing any rows — the owning handlers remove themselves once they
    /// observe the synthetic response (or their own timeout/cancellation).
    pub fn close_all(&self, reason: &str) {
        let rows = self.rows.lock();
        for (&id, exchange) in rows.iter() {
            let _ = exchange.sender.try_send(ResponseFrame::closed(id, reason));
        }
    }

    /// Number of exchanges currently pending. Exposed for tests verifying
    /// that a session's teardown leaves nothing behind once handlers drain.
    pub fn len(&self) -> usize {
        self.rows.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

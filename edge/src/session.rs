//! The singleton tunnel session: its guarded slot, its accept path, and the
//! WebSocket read/write loop that keeps it alive.
//!
//! Re-architected from a bare nullable global into a typed guarded slot
//! (see `SPEC_FULL.md` §9): acceptance is a single lock-and-check, and
//! teardown clears the same slot under the same lock.

use std::sync::Arc;

use aether_core::ExchangeTable;
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;

/// Handle to the live session, cheap to clone and hand to every HTTP
/// handler that needs to submit a frame.
#[derive(Clone)]
pub struct LiveSession {
    pub table: Arc<ExchangeTable>,
    outbox: mpsc::UnboundedSender<Message>,
}

impl LiveSession {
    /// Enqueue a frame for delivery to the agent. The actual write happens
    /// on the session's single writer task, so concurrent callers never
    /// interleave partial frames on the socket.
    pub fn send(&self, text: String) -> Result<(), aether_core::AetherError> {
        self.outbox
            .send(Message::Text(text.into()))
            .map_err(|_| aether_core::AetherError::ChannelDown("writer task gone".into()))
    }
}

/// The process-wide singleton slot. `None` means idle; `Some` means a
/// session is active and a second upgrade attempt must be rejected.
pub type SessionSlot = Arc<Mutex<Option<LiveSession>>>;

pub fn new_slot() -> SessionSlot {
    Arc::new(Mutex::new(None))
}

/// Attempt to claim the slot for a newly upgraded socket.
///
/// Returns the freshly installed `LiveSession` and the receiving half of
/// its outbox on success, or `None` if a session was already live (the
/// caller should respond with the singleton conflict described in
/// `SPEC_FULL.md` §4.4). The check and the insert happen under one lock
/// acquisition, so two concurrent upgrades can never both win.
///
/// Must be called, and its result observed, *before* the HTTP connection is
/// promoted to a WebSocket (`axum::extract::ws::WebSocketUpgrade::on_upgrade`
/// sends the 101 response synchronously, ahead of ever running the future it
/// is given) — otherwise two concurrent handshakes can both see an idle slot
/// and both get a 101, with only one ever becoming a real session and the
/// other never producing the spec's 503.
pub fn try_accept(slot: &SessionSlot) -> Option<(LiveSession, mpsc::UnboundedReceiver<Message>)> {
    let mut guard = slot.lock();
    if guard.is_some() {
        return None;
    }

    let (outbox, receiver) = mpsc::unbounded_channel();
    let session = LiveSession {
        table: Arc::new(ExchangeTable::new()),
        outbox,
    };
    *guard = Some(session.clone());
    Some((session, receiver))
}

/// Drive one already-claimed session's WebSocket to completion: spawn the
/// writer loop, run the reader loop inline, and tear the session down when
/// the reader ends.
///
/// The caller must have already won the slot via [`try_accept`] — secret
/// checking and the singleton decision both happen before the socket is
/// upgraded at all, so by the time this runs the session is committed.
pub async fn run(
    slot: SessionSlot,
    session: LiveSession,
    mut outbox_rx: mpsc::UnboundedReceiver<Message>,
    socket: WebSocket,
) {
    let table = session.table;

    let (mut sink, mut stream) = socket.split();

    let writer = tokio::spawn(async move {
        while let Some(message) = outbox_rx.recv().await {
            if sink.send(message).await.is_err() {
                break;
            }
        }
    });

    while let Some(next) = stream.next().await {
        match next {
            Ok(Message::Text(text)) => {
                match aether_core::frame::decode::<aether_core::ResponseFrame>(&text) {
                    Ok(response) => {
                        if let Err(err) = table.deliver(response) {
                            log::warn!("ws resp: {err}");
                        }
                    }
                    Err(err) => log::warn!("ws resp: {err}"),
                }
            }
            Ok(Message::Binary(_)) => {
                log::debug!("dropping binary frame on tunnel channel");
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(err) => {
                log::info!("ws read: {err}");
                break;
            }
        }
    }

    *slot.lock() = None;
    table.close_all("connection was closed");
    writer.abort();
    log::info!("session closed");
}

/// Pure helper so the handshake route and its tests can check singleton
/// and secret rules without standing up a real socket.
pub fn is_live(slot: &SessionSlot) -> bool {
    slot.lock().is_some()
}

pub fn secret_matches(configured: &str, presented: Option<&str>) -> bool {
    if configured.is_empty() {
        return true;
    }
    presented == Some(configured)
}

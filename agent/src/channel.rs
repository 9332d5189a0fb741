//! The reconnecting tunnel channel: one WebSocket connection to the edge at
//! a time, recreated on every drop with the fixed backoff schedule, never
//! exponential or jittered.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use aether_core::{AetherError, RECONNECT_BACKOFF_MS, RequestFrame, ResponseFrame, frame};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;

use crate::config::AgentConfig;

/// Handle to the channel's current outbox. Dispatch tasks hold a clone of
/// this and use it to write their response back whenever it finishes,
/// regardless of which connection attempt is current by then.
#[derive(Clone)]
pub struct Channel {
    outbox: Arc<Mutex<Option<mpsc::UnboundedSender<Message>>>>,
    closing: Arc<AtomicBool>,
}

impl Channel {
    pub fn new() -> Self {
        Self {
            outbox: Arc::new(Mutex::new(None)),
            closing: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Encode and enqueue a response frame on the current connection, if
    /// one exists. Best-effort: if the connection has dropped between the
    /// dispatch starting and finishing, the response is simply lost, same
    /// as the edge timing the exchange out on its side.
    pub fn send(&self, response: &ResponseFrame) -> Result<(), AetherError> {
        let text = frame::encode(response)?;
        let guard = self.outbox.lock();
        let sender = guard
            .as_ref()
            .ok_or_else(|| AetherError::ChannelDown("no active connection".into()))?;
        sender
            .send(Message::Text(text.into()))
            .map_err(|_| AetherError::ChannelDown("writer task gone".into()))
    }

    /// Request a graceful shutdown: stop reconnecting once the current
    /// connection (if any) ends, and ask the peer to close now.
    pub fn close(&self) {
        self.closing.store(true, Ordering::Release);
        if let Some(sender) = self.outbox.lock().as_ref() {
            let _ = sender.send(Message::Close(None));
        }
    }
}

impl Default for Channel {
    fn default() -> Self {
        Self::new()
    }
}

/// Dial repeatedly until `dial_once` succeeds, following the declared
/// backoff schedule exactly: try, and on failure wait the next scheduled
/// delay before trying again, in order. Gives up only once every scheduled
/// delay has been used and the dial after it has also failed.
async fn dial_until_connected<F, Fut, T>(mut dial_once: F) -> Result<T, AetherError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = anyhow::Result<T>>,
{
    match dial_once().await {
        Ok(value) => return Ok(value),
        Err(err) => log::warn!("tunnel: dial failed: {err}"),
    }

    for &delay_ms in RECONNECT_BACKOFF_MS {
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        match dial_once().await {
            Ok(value) => return Ok(value),
            Err(err) => log::warn!("tunnel: dial failed: {err}"),
        }
    }

    log::error!("tunnel: exhausted reconnect schedule, giving up");
    Err(AetherError::ChannelDown("exhausted reconnect schedule".into()))
}

/// Run the channel until [`Channel::close`] is called or the bounded
/// reconnect schedule runs out without a single successful dial, in which
/// case `AetherError::ChannelDown` is returned and the caller is expected
/// to exit non-zero.
///
/// Each successful dial resets the backoff budget: the schedule bounds how
/// many times in a row the agent will try to *establish* a connection, not
/// the lifetime total, so a tunnel that has worked before keeps getting a
/// fresh attempt budget after every drop.
///
/// `dispatch` is handed each decoded request frame along with a clone of
/// the channel to send its eventual response on; it is spawned on its own
/// task per request so one slow origin request never blocks the others.
pub async fn run<D, Fut>(
    channel: Channel,
    config: Arc<AgentConfig>,
    dispatch: D,
) -> Result<(), AetherError>
where
    D: Fn(RequestFrame, Channel) -> Fut + Clone + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    loop {
        if channel.closing.load(Ordering::Acquire) {
            break;
        }

        let stream = dial_until_connected(|| dial(&config)).await?;

        log::info!("tunnel connected to {}", config.host);
        run_session(&channel, stream, dispatch.clone()).await;

        if channel.closing.load(Ordering::Acquire) {
            break;
        }
        // Loop straight back to `dial_until_connected` with no pre-delay:
        // the declared backoff schedule only governs spacing between
        // failed *dial* attempts, not the gap after a session that was
        // running successfully drops. If this dial then fails, the usual
        // schedule applies from its first entry, same as a first-connect
        // failure.
        log::info!("tunnel disconnected, reconnecting");
    }

    log::info!("tunnel channel stopped");
    Ok(())
}

type TunnelStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

async fn dial(config: &AgentConfig) -> anyhow::Result<TunnelStream> {
    let mut request = config.handshake_url().into_client_request()?;
    if !config.secret.is_empty() {
        request
            .headers_mut()
            .insert(AUTHORIZATION, HeaderValue::from_str(&config.secret)?);
    }

    let (stream, _response) = tokio_tungstenite::connect_async(request).await?;
    Ok(stream)
}

/// Drive one established connection until it closes or errors, delivering
/// every request frame it carries to `dispatch` along the way.
async fn run_session<D, Fut>(channel: &Channel, stream: TunnelStream, dispatch: D)
where
    D: Fn(RequestFrame, Channel) -> Fut + Clone + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let (mut sink, mut source) = stream.split();
    let (outbox_tx, mut outbox_rx) = mpsc::unbounded_channel();
    *channel.outbox.lock() = Some(outbox_tx);

    let writer = tokio::spawn(async move {
        while let Some(message) = outbox_rx.recv().await {
            if sink.send(message).await.is_err() {
                break;
            }
        }
    });

    loop {
        match source.next().await {
            Some(Ok(Message::Text(text))) => match frame::decode::<RequestFrame>(&text) {
                Ok(request) => {
                    let channel = channel.clone();
                    let dispatch = dispatch.clone();
                    tokio::spawn(async move { dispatch(request, channel).await });
                }
                Err(err) => log::warn!("tunnel: {err}"),
            },
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => {}
            Some(Err(err)) => {
                log::warn!("tunnel: read error: {err}");
                break;
            }
        }
    }

    *channel.outbox.lock() = None;
    writer.abort();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test(start_paused = true)]
    async fn dial_until_connected_exhausts_the_full_schedule_before_giving_up() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let recorded = Arc::new(Mutex::new(Vec::new()));
        let started = tokio::time::Instant::now();

        let counter = attempts.clone();
        let delays = recorded.clone();
        let mut last = started;
        let result: Result<(), AetherError> = dial_until_connected(|| {
            counter.fetch_add(1, Ordering::SeqCst);
            let now = tokio::time::Instant::now();
            delays.lock().push(now.duration_since(last));
            last = now;
            async { Err(anyhow::anyhow!("connection refused")) }
        })
        .await;

        assert!(matches!(result, Err(AetherError::ChannelDown(_))));

        // One dial attempt per declared delay, plus the initial attempt
        // before any delay is ever applied.
        assert_eq!(attempts.load(Ordering::SeqCst), RECONNECT_BACKOFF_MS.len() + 1);

        // The gap before each attempt (after the first) is exactly the next
        // scheduled delay, in order, and the schedule is only fully spent
        // once the attempt following the last delay has also failed.
        let gaps = recorded.lock();
        assert_eq!(gaps.len(), RECONNECT_BACKOFF_MS.len() + 1);
        for (gap, expected_ms) in gaps.iter().skip(1).zip(RECONNECT_BACKOFF_MS) {
            assert_eq!(gap.as_millis() as u64, *expected_ms);
        }

        let expected_total: u64 = RECONNECT_BACKOFF_MS.iter().sum();
        assert_eq!(started.elapsed(), Duration::from_millis(expected_total));
    }

    #[tokio::test(start_paused = true)]
    async fn dial_until_connected_returns_as_soon_as_a_dial_succeeds() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();

        let result = dial_until_connected(move || {
            let attempt = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 2 {
                    Err(anyhow::anyhow!("connection refused"))
                } else {
                    Ok(42)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(result, 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn send_without_a_connection_reports_channel_down() {
        let channel = Channel::new();
        let response = ResponseFrame::closed(1, "never connected");
        assert!(matches!(
            channel.send(&response),
            Err(AetherError::ChannelDown(_))
        ));
    }

    #[test]
    fn close_before_connecting_is_a_no_op_beyond_flagging_closing() {
        let channel = Channel::new();
        channel.close();
        assert!(channel.closing.load(Ordering::Acquire));
    }
}

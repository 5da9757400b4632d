//! Self-reconnecting push channel.
//!
//! [`QuorumChannel::spawn`] starts a background task that connects, forwards
//! every text frame as a [`ChannelEvent::Message`], and reconnects according
//! to a [`BackoffPolicy`] whenever the connection fails or closes. Connection
//! changes are reported as events and through [`ChannelState`], so callers can
//! observe them; the quorum waiter deliberately ignores them.
//!
//! ```text
//!            ┌──────────── backoff ────────────┐
//!            ▼                                 │
//!   Connecting ──ok──▶ Connected ──drop──▶ Reconnecting
//!        │                                     │
//!        └──────────fail───────────────────────┘
//!   (any) ──close / give up──▶ Closed
//! ```

use crate::backoff::BackoffPolicy;
use crate::connector::PushConnector;
use crate::error::{Error, Result};
use futures::StreamExt;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

/// Default capacity of the event channel.
const DEFAULT_EVENT_CAPACITY: usize = 64;

/// Connection state of the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// First connection attempt in progress.
    Connecting,
    /// Connection is live.
    Connected,
    /// Waiting out backoff or retrying after a drop.
    Reconnecting,
    /// Stopped; no further events.
    Closed,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Reconnecting => write!(f, "Reconnecting"),
            Self::Closed => write!(f, "Closed"),
        }
    }
}

/// Events emitted by the channel task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// A connection was established.
    Connected,
    /// A connection failed or dropped; reconnect `attempt` is scheduled.
    Disconnected { attempt: u32, reason: String },
    /// A text frame arrived. Not necessarily a quorum frame.
    Message(String),
    /// The backoff policy declined further attempts. Last event.
    GaveUp { attempts: u32 },
}

/// Build the waiting-room channel URL for a participant.
///
/// The push scheme follows the server scheme: `http` → `ws`, `https` → `wss`.
pub fn channel_url(base: &Url, worker_id: Option<&str>, participant_id: &str) -> Result<Url> {
    let mut url = base.join("/chat")?;
    let scheme = match base.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(Error::UnsupportedScheme(other.to_string())),
    };
    url.set_scheme(scheme)
        .map_err(|()| Error::UnsupportedScheme(scheme.to_string()))?;
    url.query_pairs_mut()
        .clear()
        .append_pair("channel", "quorum")
        .append_pair("worker_id", worker_id.unwrap_or_default())
        .append_pair("participant_id", participant_id);
    Ok(url)
}

/// Handle to a running channel task.
///
/// Dropping the handle stops the task.
pub struct QuorumChannel {
    state: watch::Receiver<ChannelState>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl fmt::Debug for QuorumChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuorumChannel")
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

impl QuorumChannel {
    /// Start the channel. Returns the handle and the event receiver.
    pub fn spawn(
        url: Url,
        connector: Arc<dyn PushConnector>,
        backoff: Arc<dyn BackoffPolicy>,
    ) -> (Self, mpsc::Receiver<ChannelEvent>) {
        Self::spawn_with_capacity(url, connector, backoff, DEFAULT_EVENT_CAPACITY)
    }

    /// Start the channel with a specific event channel capacity.
    pub fn spawn_with_capacity(
        url: Url,
        connector: Arc<dyn PushConnector>,
        backoff: Arc<dyn BackoffPolicy>,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<ChannelEvent>) {
        let (events_tx, events_rx) = mpsc::channel(capacity.max(1));
        let (state_tx, state_rx) = watch::channel(ChannelState::Connecting);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let task = tokio::spawn(run(url, connector, backoff, events_tx, state_tx, shutdown_rx));

        (
            Self {
                state: state_rx,
                shutdown: Some(shutdown_tx),
                task: Some(task),
            },
            events_rx,
        )
    }

    /// Current connection state.
    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    /// Subscribe to state changes.
    pub fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.state.clone()
    }

    /// Stop the task and wait for it to finish.
    pub async fn close(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "Quorum channel task ended abnormally");
            }
        }
    }
}

impl Drop for QuorumChannel {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

/// Why a connected session ended.
enum SessionEnd {
    Dropped(String),
    Shutdown,
}

async fn run(
    url: Url,
    connector: Arc<dyn PushConnector>,
    backoff: Arc<dyn BackoffPolicy>,
    events: mpsc::Sender<ChannelEvent>,
    state: watch::Sender<ChannelState>,
    mut shutdown: oneshot::Receiver<()>,
) {
    let mut attempt: u32 = 0;

    'outer: loop {
        let connected = tokio::select! {
            _ = &mut shutdown => break 'outer,
            result = connector.connect(&url) => result,
        };

        let reason = match connected {
            Ok(mut frames) => {
                attempt = 0;
                state.send_replace(ChannelState::Connected);
                info!(url = %url, "Quorum channel connected");
                if !emit(&events, &mut shutdown, ChannelEvent::Connected).await {
                    break 'outer;
                }

                let end = loop {
                    tokio::select! {
                        _ = &mut shutdown => break SessionEnd::Shutdown,
                        frame = frames.next() => match frame {
                            Some(Ok(text)) => {
                                debug!(len = text.len(), "Channel frame received");
                                if !emit(&events, &mut shutdown, ChannelEvent::Message(text)).await {
                                    break SessionEnd::Shutdown;
                                }
                            }
                            Some(Err(e)) => break SessionEnd::Dropped(e.to_string()),
                            None => break SessionEnd::Dropped("connection closed".into()),
                        },
                    }
                };
                match end {
                    SessionEnd::Dropped(reason) => reason,
                    SessionEnd::Shutdown => break 'outer,
                }
            }
            Err(e) => e.to_string(),
        };

        attempt = attempt.saturating_add(1);
        state.send_replace(ChannelState::Reconnecting);
        warn!(url = %url, attempt, reason = %reason, "Quorum channel disconnected");
        let disconnected = ChannelEvent::Disconnected {
            attempt,
            reason,
        };
        if !emit(&events, &mut shutdown, disconnected).await {
            break 'outer;
        }

        match backoff.delay(attempt) {
            Some(delay) => {
                debug!(?delay, attempt, "Reconnecting after backoff");
                tokio::select! {
                    _ = &mut shutdown => break 'outer,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            None => {
                warn!(attempts = attempt, "Quorum channel giving up");
                emit(&events, &mut shutdown, ChannelEvent::GaveUp { attempts: attempt }).await;
                break 'outer;
            }
        }
    }

    state.send_replace(ChannelState::Closed);
    debug!(url = %url, "Quorum channel closed");
}

/// Forward an event unless shutdown comes first. A full buffer nobody drains
/// must not keep the task alive. Returns `false` when the task should stop.
async fn emit(
    events: &mpsc::Sender<ChannelEvent>,
    shutdown: &mut oneshot::Receiver<()>,
    event: ChannelEvent,
) -> bool {
    tokio::select! {
        _ = shutdown => false,
        sent = events.send(event) => sent.is_ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::FixedBackoff;
    use crate::connector::{ScriptedConnector, ScriptedSession};
    use crate::wait::wait_for_quorum;
    use crate::wire::{encode_frame, QuorumProgress, Termination};
    use std::time::Duration;

    fn url() -> Url {
        Url::parse("ws://localhost/chat?channel=quorum").unwrap()
    }

    fn fast() -> Arc<dyn BackoffPolicy> {
        Arc::new(FixedBackoff::new(Duration::from_millis(1)))
    }

    #[test]
    fn channel_url_follows_scheme() {
        let base = Url::parse("https://example.org/ad").unwrap();
        let url = channel_url(&base, Some("W1"), "42").unwrap();
        assert_eq!(
            url.as_str(),
            "wss://example.org/chat?channel=quorum&worker_id=W1&participant_id=42"
        );

        let base = Url::parse("http://localhost:5000").unwrap();
        let url = channel_url(&base, None, "7").unwrap();
        assert_eq!(url.scheme(), "ws");
        assert_eq!(url.port(), Some(5000));
    }

    #[test]
    fn channel_url_rejects_other_schemes() {
        let base = Url::parse("ftp://example.org").unwrap();
        assert!(channel_url(&base, None, "1").is_err());
    }

    #[tokio::test]
    async fn reconnects_after_refusal_and_drop() {
        let connector = ScriptedConnector::new([
            ScriptedSession::Refuse("down".into()),
            ScriptedSession::Deliver(vec!["one".into()]),
            ScriptedSession::DeliverAndHold(vec!["two".into()]),
        ]);
        let (channel, mut events) = QuorumChannel::spawn(url(), Arc::new(connector.clone()), fast());

        let mut seen = Vec::new();
        while seen.len() < 6 {
            seen.push(events.recv().await.unwrap());
        }
        assert_eq!(
            seen,
            vec![
                ChannelEvent::Disconnected { attempt: 1, reason: "Connection error: down".into() },
                ChannelEvent::Connected,
                ChannelEvent::Message("one".into()),
                ChannelEvent::Disconnected { attempt: 1, reason: "connection closed".into() },
                ChannelEvent::Connected,
                ChannelEvent::Message("two".into()),
            ]
        );
        assert_eq!(channel.state(), ChannelState::Connected);
        assert_eq!(connector.connect_attempts().len(), 3);

        let mut state = channel.watch_state();
        channel.close().await;
        assert_eq!(*state.borrow_and_update(), ChannelState::Closed);
    }

    #[tokio::test]
    async fn gives_up_when_policy_says_so() {
        let connector = ScriptedConnector::new([]);
        let backoff = Arc::new(FixedBackoff::new(Duration::from_millis(1)).with_max_attempts(2));
        let (_channel, mut events) = QuorumChannel::spawn(url(), Arc::new(connector), backoff);

        let mut last = None;
        while let Some(event) = events.recv().await {
            last = Some(event);
        }
        assert_eq!(last, Some(ChannelEvent::GaveUp { attempts: 3 }));
    }

    #[tokio::test]
    async fn close_finishes_with_undrained_burst() {
        let mut frames = vec![encode_frame(QuorumProgress::new(2, 2))];
        frames.extend((0..200).map(|i| format!("chat:{i}")));
        let connector = ScriptedConnector::new([ScriptedSession::DeliverAndHold(frames)]);
        let (channel, mut events) = QuorumChannel::spawn(url(), Arc::new(connector), fast());

        let reached = wait_for_quorum(&mut events, Termination::AtLeast, |_| {})
            .await
            .unwrap();
        assert_eq!(reached, QuorumProgress::new(2, 2));

        // let the task fill the buffer and block on the next send
        tokio::time::sleep(Duration::from_millis(50)).await;
        tokio::time::timeout(Duration::from_secs(2), channel.close())
            .await
            .expect("close should not wait on a full event buffer");
        drop(events);
    }

    #[tokio::test]
    async fn dropping_handle_stops_task() {
        let connector = ScriptedConnector::new([ScriptedSession::DeliverAndHold(vec![])]);
        let (channel, mut events) = QuorumChannel::spawn(url(), Arc::new(connector), fast());

        assert_eq!(events.recv().await, Some(ChannelEvent::Connected));
        drop(channel);
        assert_eq!(events.recv().await, None);
    }
}

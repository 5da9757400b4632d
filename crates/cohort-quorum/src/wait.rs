//! Waiting for quorum.

use crate::channel::ChannelEvent;
use crate::error::{Error, Result};
use crate::wire::{parse_frame, QuorumProgress, Termination};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Consume channel events until quorum is observed.
///
/// `on_progress` runs once per quorum frame, including the one that satisfies
/// the wait. The function returns exactly once; frames arriving afterwards are
/// never read. Connection churn is invisible here: only a channel that gives up
/// or closes ends the wait without quorum.
pub async fn wait_for_quorum<F>(
    events: &mut mpsc::Receiver<ChannelEvent>,
    termination: Termination,
    mut on_progress: F,
) -> Result<QuorumProgress>
where
    F: FnMut(QuorumProgress),
{
    while let Some(event) = events.recv().await {
        match event {
            ChannelEvent::Message(frame) => match parse_frame(&frame) {
                Some(Ok(progress)) => {
                    debug!(n = progress.n, q = progress.q, "Quorum progress");
                    on_progress(progress);
                    if progress.is_met(termination) {
                        return Ok(progress);
                    }
                }
                Some(Err(e)) => warn!(error = %e, "Ignoring malformed quorum frame"),
                None => trace!("Ignoring frame from another channel"),
            },
            ChannelEvent::Connected => debug!("Waiting room connected"),
            ChannelEvent::Disconnected { attempt, .. } => {
                debug!(attempt, "Waiting room connection lost, channel will retry")
            }
            ChannelEvent::GaveUp { attempts } => return Err(Error::GaveUp { attempts }),
        }
    }
    Err(Error::ChannelClosed)
}

/// [`wait_for_quorum`] with an optional upper bound on the wait.
pub async fn wait_for_quorum_within<F>(
    events: &mut mpsc::Receiver<ChannelEvent>,
    termination: Termination,
    limit: Option<Duration>,
    on_progress: F,
) -> Result<QuorumProgress>
where
    F: FnMut(QuorumProgress),
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, wait_for_quorum(events, termination, on_progress))
            .await
            .map_err(|_| Error::Timeout(limit))?,
        None => wait_for_quorum(events, termination, on_progress).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{encode_frame, QuorumProgress};

    async fn feed(events: Vec<ChannelEvent>) -> mpsc::Receiver<ChannelEvent> {
        let (tx, rx) = mpsc::channel(events.len().max(1));
        for event in events {
            tx.send(event).await.unwrap();
        }
        rx
    }

    fn quorum(n: u32, q: u32) -> ChannelEvent {
        ChannelEvent::Message(encode_frame(QuorumProgress::new(n, q)))
    }

    #[tokio::test]
    async fn resolves_once_after_third_frame() {
        let mut rx = feed(vec![quorum(1, 3), quorum(2, 3), quorum(3, 3), quorum(3, 3)]).await;
        let mut calls = Vec::new();

        let result = wait_for_quorum(&mut rx, Termination::Exact, |p| calls.push((p.n, p.q)))
            .await
            .unwrap();

        assert_eq!(result, QuorumProgress::new(3, 3));
        assert_eq!(calls, vec![(1, 3), (2, 3), (3, 3)]);
        // the trailing frame is left unread
        assert_eq!(rx.recv().await, Some(quorum(3, 3)));
    }

    #[tokio::test]
    async fn unrelated_messages_are_ignored() {
        let mut rx = feed(vec![
            ChannelEvent::Message(r#"chat:{"n":3,"q":3}"#.into()),
            ChannelEvent::Message("quorum:garbage".into()),
        ])
        .await;
        let mut calls = 0;

        let result = wait_for_quorum(&mut rx, Termination::AtLeast, |_| calls += 1).await;

        assert!(matches!(result, Err(Error::ChannelClosed)));
        assert_eq!(calls, 0);
    }

    #[tokio::test]
    async fn disconnects_do_not_end_the_wait() {
        let mut rx = feed(vec![
            ChannelEvent::Connected,
            quorum(1, 2),
            ChannelEvent::Disconnected { attempt: 1, reason: "reset".into() },
            ChannelEvent::Connected,
            quorum(2, 2),
        ])
        .await;

        let result = wait_for_quorum(&mut rx, Termination::AtLeast, |_| {}).await.unwrap();
        assert_eq!(result, QuorumProgress::new(2, 2));
    }

    #[tokio::test]
    async fn overshoot_satisfies_at_least_only() {
        let mut rx = feed(vec![quorum(1, 3), quorum(4, 3)]).await;
        let result = wait_for_quorum(&mut rx, Termination::AtLeast, |_| {}).await.unwrap();
        assert_eq!(result.n, 4);

        let mut rx = feed(vec![quorum(1, 3), quorum(4, 3)]).await;
        let result = wait_for_quorum(&mut rx, Termination::Exact, |_| {}).await;
        assert!(matches!(result, Err(Error::ChannelClosed)));
    }

    #[tokio::test]
    async fn giving_up_fails_the_wait() {
        let mut rx = feed(vec![quorum(1, 2), ChannelEvent::GaveUp { attempts: 5 }]).await;
        let result = wait_for_quorum(&mut rx, Termination::AtLeast, |_| {}).await;
        assert!(matches!(result, Err(Error::GaveUp { attempts: 5 })));
    }

    #[test]
    fn stays_pending_until_quorum_frame() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut wait =
            tokio_test::task::spawn(wait_for_quorum(&mut rx, Termination::AtLeast, |_| {}));

        tokio_test::assert_pending!(wait.poll());
        tx.try_send(quorum(1, 2)).unwrap();
        assert!(wait.is_woken());
        tokio_test::assert_pending!(wait.poll());

        tx.try_send(quorum(2, 2)).unwrap();
        let reached = tokio_test::assert_ready!(wait.poll()).unwrap();
        assert_eq!(reached, QuorumProgress::new(2, 2));
    }

    #[tokio::test]
    async fn optional_limit() {
        let (_tx, mut rx) = mpsc::channel::<ChannelEvent>(1);
        let result = wait_for_quorum_within(
            &mut rx,
            Termination::AtLeast,
            Some(Duration::from_millis(10)),
            |_| {},
        )
        .await;
        assert!(matches!(result, Err(Error::Timeout(_))));
    }
}

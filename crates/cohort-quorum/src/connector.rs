//! Push connection port.
//!
//! A [`PushConnector`] opens one connection and yields its text frames. It
//! knows nothing about reconnection; [`crate::QuorumChannel`] owns that.

use crate::error::{Error, Result};
use async_trait::async_trait;
use futures::stream::{self, Stream, StreamExt};
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;
use url::Url;

/// Text frames from one live connection. The stream ends when the connection
/// closes; an `Err` item means it broke.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Opens push connections.
#[async_trait]
pub trait PushConnector: Send + Sync {
    async fn connect(&self, url: &Url) -> Result<FrameStream>;
}

/// WebSocket connector.
#[derive(Debug, Clone, Default)]
pub struct WsConnector;

#[async_trait]
impl PushConnector for WsConnector {
    async fn connect(&self, url: &Url) -> Result<FrameStream> {
        let (socket, response) = tokio_tungstenite::connect_async(url.as_str()).await?;
        debug!(url = %url, status = %response.status(), "WebSocket upgraded");

        let frames = socket.filter_map(|message| async move {
            match message {
                Ok(Message::Text(text)) => Some(Ok(text)),
                Ok(_) => None,
                Err(e) => Some(Err(Error::from(e))),
            }
        });
        Ok(Box::pin(frames))
    }
}

/// One scripted connection outcome for [`ScriptedConnector`].
#[derive(Debug, Clone)]
pub enum ScriptedSession {
    /// Connection attempt fails.
    Refuse(String),
    /// Connection succeeds, delivers the frames, then closes.
    Deliver(Vec<String>),
    /// Connection succeeds, delivers the frames, then stays silent.
    DeliverAndHold(Vec<String>),
}

/// In-process connector that plays back scripted sessions, one per connect.
/// Once the script runs out every further attempt is refused.
#[derive(Debug, Clone, Default)]
pub struct ScriptedConnector {
    sessions: Arc<Mutex<VecDeque<ScriptedSession>>>,
    urls: Arc<Mutex<Vec<Url>>>,
}

impl ScriptedConnector {
    pub fn new(sessions: impl IntoIterator<Item = ScriptedSession>) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(sessions.into_iter().collect())),
            urls: Arc::default(),
        }
    }

    /// URLs of every connect attempt so far.
    pub fn connect_attempts(&self) -> Vec<Url> {
        self.urls.lock().map(|urls| urls.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl PushConnector for ScriptedConnector {
    async fn connect(&self, url: &Url) -> Result<FrameStream> {
        if let Ok(mut urls) = self.urls.lock() {
            urls.push(url.clone());
        }
        let next = self
            .sessions
            .lock()
            .map_err(|_| Error::Connect("script lock poisoned".into()))?
            .pop_front();

        match next {
            Some(ScriptedSession::Deliver(frames)) => {
                Ok(Box::pin(stream::iter(frames.into_iter().map(Ok))))
            }
            Some(ScriptedSession::DeliverAndHold(frames)) => Ok(Box::pin(
                stream::iter(frames.into_iter().map(Ok)).chain(stream::pending()),
            )),
            Some(ScriptedSession::Refuse(reason)) => Err(Error::Connect(reason)),
            None => Err(Error::Connect("script exhausted".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_sessions_play_in_order() {
        let connector = ScriptedConnector::new([
            ScriptedSession::Refuse("down".into()),
            ScriptedSession::Deliver(vec!["a".into(), "b".into()]),
        ]);
        let url = Url::parse("ws://localhost/chat").unwrap();

        assert!(connector.connect(&url).await.is_err());
        let frames: Vec<String> = connector
            .connect(&url)
            .await
            .unwrap()
            .map(|f| f.unwrap())
            .collect()
            .await;
        assert_eq!(frames, vec!["a", "b"]);
        assert!(connector.connect(&url).await.is_err());
        assert_eq!(connector.connect_attempts().len(), 3);
    }
}

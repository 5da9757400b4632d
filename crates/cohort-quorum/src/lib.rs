//! Cohort Quorum - the waiting-room push channel.
//!
//! Multi-participant experiments hold each participant until enough of them
//! are ready. The server announces the live count over a shared push channel
//! as `quorum:{"n":..,"q":..}` frames; this crate keeps that channel connected
//! and turns its frames into a single "quorum reached" outcome.
//!
//! # Architecture
//!
//! - **Wire**: frame tag, frame decoding, progress and termination rules
//! - **Connector**: push connection port, WebSocket implementation, scripted fake
//! - **Backoff**: reconnect delay policies
//! - **Channel**: reconnecting connection task with observable state and events
//! - **Wait**: consumes events until quorum is met, exactly once
//!
//! # Example
//!
//! ```no_run
//! use cohort_quorum::{
//!     channel_url, wait_for_quorum, ExponentialBackoff, QuorumChannel, Termination, WsConnector,
//! };
//! use std::sync::Arc;
//! use url::Url;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let url = channel_url(&Url::parse("http://localhost:5000")?, Some("W1"), "42")?;
//! let (channel, mut events) = QuorumChannel::spawn(
//!     url,
//!     Arc::new(WsConnector),
//!     Arc::new(ExponentialBackoff::default()),
//! );
//! let reached = wait_for_quorum(&mut events, Termination::AtLeast, |p| {
//!     println!("{}% ({p})", p.percent());
//! })
//! .await?;
//! channel.close().await;
//! println!("quorum reached at {reached}");
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod channel;
pub mod connector;
pub mod error;
pub mod wait;
pub mod wire;

pub use backoff::{BackoffPolicy, ExponentialBackoff, FixedBackoff};
pub use channel::{channel_url, ChannelEvent, ChannelState, QuorumChannel};
pub use connector::{FrameStream, PushConnector, ScriptedConnector, ScriptedSession, WsConnector};
pub use error::{Error, Result};
pub use wait::{wait_for_quorum, wait_for_quorum_within};
pub use wire::{encode_frame, parse_frame, QuorumInfo, QuorumProgress, Termination, QUORUM_TAG};

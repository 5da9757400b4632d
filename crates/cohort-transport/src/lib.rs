//! Cohort Transport - the one way the participant client talks to the
//! experiment server.
//!
//! Every request resolves with decoded JSON or rejects with an
//! [`AjaxRejection`] carrying route, method, payload, status, any server
//! error page, and a replayable request snapshot. The transport never retries
//! and never touches session state; error rendering and navigation are the
//! caller's business.
//!
//! # Example
//!
//! ```no_run
//! use cohort_transport::{Transport, TransportConfig};
//! use url::Url;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let transport = Transport::new(TransportConfig::new(Url::parse("http://localhost:5000")?))?;
//! let participant = transport.get("/participant/42", None).await?;
//! println!("{}", participant["participant"]["mode"]);
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod error;
pub mod rejection;

pub use client::{BodyEncoding, Transport, TransportConfig};
pub use error::{Error, Result};
pub use rejection::{AjaxRejection, Method, Payload, RequestSnapshot};

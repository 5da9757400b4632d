//! Quorum frame format.
//!
//! The push channel is shared with other message types. Quorum frames are
//! plain strings tagged `quorum:` followed by a JSON object `{"n": .., "q": ..}`;
//! anything without the tag belongs to someone else.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Prefix identifying quorum frames on the shared channel.
pub const QUORUM_TAG: &str = "quorum:";

/// When a wait counts as satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Termination {
    /// `n >= q`. Tolerates the server reporting an overshoot.
    #[default]
    AtLeast,
    /// `n == q`. Stalls forever if the count jumps past `q`.
    Exact,
}

impl FromStr for Termination {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "at-least" | "at_least" | "gte" => Ok(Self::AtLeast),
            "exact" | "eq" => Ok(Self::Exact),
            other => Err(format!("unknown quorum termination: {other}")),
        }
    }
}

/// Live count of ready participants against the threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuorumProgress {
    pub n: u32,
    pub q: u32,
}

impl QuorumProgress {
    pub fn new(n: u32, q: u32) -> Self {
        Self { n, q }
    }

    /// Rounded percentage shown by a waiting-room progress bar.
    pub fn percent(&self) -> u32 {
        if self.q == 0 {
            return 100;
        }
        (f64::from(self.n) / f64::from(self.q) * 100.0).round() as u32
    }

    pub fn is_met(&self, termination: Termination) -> bool {
        match termination {
            Termination::AtLeast => self.n >= self.q,
            Termination::Exact => self.n == self.q,
        }
    }
}

impl fmt::Display for QuorumProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.n, self.q)
    }
}

/// Quorum block of a registration response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuorumInfo {
    pub n: u32,
    pub q: u32,
    /// Set when this participant arrived after quorum was already met.
    #[serde(default)]
    pub overrecruited: bool,
}

impl QuorumInfo {
    pub fn progress(&self) -> QuorumProgress {
        QuorumProgress::new(self.n, self.q)
    }
}

/// Decode one channel frame.
///
/// `None` for frames without the quorum tag, `Some(Err)` for tagged frames
/// whose payload does not decode.
pub fn parse_frame(frame: &str) -> Option<Result<QuorumProgress>> {
    let payload = frame.strip_prefix(QUORUM_TAG)?;
    Some(serde_json::from_str(payload).map_err(Into::into))
}

/// Encode a quorum frame.
pub fn encode_frame(progress: QuorumProgress) -> String {
    format!(
        "{QUORUM_TAG}{}",
        serde_json::json!({ "n": progress.n, "q": progress.q })
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn parses_tagged_frames() {
        let progress = parse_frame(r#"quorum:{"n":2,"q":3}"#).unwrap().unwrap();
        assert_eq!(progress, QuorumProgress::new(2, 3));
    }

    #[test]
    fn extra_fields_are_tolerated() {
        let progress = parse_frame(r#"quorum:{"n":1,"q":4,"waiting":[1]}"#)
            .unwrap()
            .unwrap();
        assert_eq!(progress, QuorumProgress::new(1, 4));
    }

    #[test]
    fn ignores_other_channels() {
        assert!(parse_frame(r#"chat:{"n":2,"q":3}"#).is_none());
        assert!(parse_frame(r#"{"n":2,"q":3}"#).is_none());
        assert!(parse_frame(r#" quorum:{"n":2,"q":3}"#).is_none());
    }

    #[test]
    fn malformed_payload_is_an_error() {
        assert!(parse_frame("quorum:not json").unwrap().is_err());
    }

    #[test]
    fn encode_then_parse() {
        let frame = encode_frame(QuorumProgress::new(3, 3));
        assert!(frame.starts_with(QUORUM_TAG));
        assert_eq!(parse_frame(&frame).unwrap().unwrap(), QuorumProgress::new(3, 3));
    }

    #[test]
    fn percent_rounds() {
        assert_eq!(QuorumProgress::new(1, 2).percent(), 50);
        assert_eq!(QuorumProgress::new(1, 3).percent(), 33);
        assert_eq!(QuorumProgress::new(2, 3).percent(), 67);
        assert_eq!(QuorumProgress::new(3, 3).percent(), 100);
    }

    #[test]
    fn termination_rules() {
        let overshoot = QuorumProgress::new(4, 3);
        assert!(overshoot.is_met(Termination::AtLeast));
        assert!(!overshoot.is_met(Termination::Exact));

        let exact = QuorumProgress::new(3, 3);
        assert!(exact.is_met(Termination::AtLeast));
        assert!(exact.is_met(Termination::Exact));

        assert!(!QuorumProgress::new(2, 3).is_met(Termination::AtLeast));
    }

    #[test]
    fn quorum_info_defaults_overrecruited() {
        let info: QuorumInfo = serde_json::from_str(r#"{"n":1,"q":2}"#).unwrap();
        assert!(!info.overrecruited);
    }

    proptest! {
        #[test]
        fn untagged_frames_never_parse(frame in "\\PC*") {
            prop_assume!(!frame.starts_with(QUORUM_TAG));
            prop_assert!(parse_frame(&frame).is_none());
        }
    }
}

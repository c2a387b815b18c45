//! Line framing rules for the half-duplex command/state protocol.
//!
//! Inbound lines are UTF-8 text, one JSON object per line, optionally preceded
//! by a single bare handshake line. Outbound lines are bare command text.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Handshake line exchanged once per process lifetime. Never a state record.
pub const HANDSHAKE_LINE: &str = "ready";

/// Verb used to ask the driven system to block on a condition itself.
pub const WAIT_FOR_VERB: &str = "wait_for";

/// Framing-level fault. Unlike a JSON content error this is fatal for the run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("inbound line contains a NUL byte at offset {offset}")]
    NulByte { offset: usize },
    #[error("inbound line is not valid UTF-8: {reason}")]
    InvalidUtf8 { reason: String },
    #[error("command `{command}` cannot be framed: {reason}")]
    InvalidCommand {
        command: String,
        reason: &'static str,
    },
}

/// Validate framing of one raw inbound line and return it as text.
///
/// The trailing line terminator (`\n` or `\r\n`) is stripped.
pub fn decode_line(raw: &[u8]) -> Result<String, ProtocolError> {
    let mut bytes = raw;
    if let Some(stripped) = bytes.strip_suffix(b"\n") {
        bytes = stripped;
    }
    if let Some(stripped) = bytes.strip_suffix(b"\r") {
        bytes = stripped;
    }
    if let Some(offset) = bytes.iter().position(|b| *b == 0) {
        return Err(ProtocolError::NulByte { offset });
    }
    let text = std::str::from_utf8(bytes).map_err(|err| ProtocolError::InvalidUtf8 {
        reason: err.to_string(),
    })?;
    Ok(text.to_string())
}

/// Condition the driven system evaluates on our behalf (`wait_for <condition>`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DelegatedCondition {
    VisualStable,
    MainMenu,
    InCombat(bool),
    InGame(bool),
}

impl DelegatedCondition {
    /// Words appended after the `wait_for` verb.
    pub fn words(&self) -> Vec<String> {
        match self {
            Self::VisualStable => vec!["visual_stable".to_string()],
            Self::MainMenu => vec!["main_menu".to_string()],
            Self::InCombat(value) => vec!["in_combat".to_string(), value.to_string()],
            Self::InGame(value) => vec!["in_game".to_string(), value.to_string()],
        }
    }
}

impl fmt::Display for DelegatedCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.words().join(" "))
    }
}

impl FromStr for DelegatedCondition {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let words: Vec<&str> = s.split_whitespace().collect();
        match words.as_slice() {
            ["visual_stable"] => Ok(Self::VisualStable),
            ["main_menu"] => Ok(Self::MainMenu),
            ["in_combat", value] => parse_flag(value).map(Self::InCombat),
            ["in_game", value] => parse_flag(value).map(Self::InGame),
            _ => Err(format!("unknown delegated condition '{s}'")),
        }
    }
}

impl TryFrom<String> for DelegatedCondition {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DelegatedCondition> for String {
    fn from(value: DelegatedCondition) -> Self {
        value.to_string()
    }
}

fn parse_flag(value: &str) -> Result<bool, String> {
    match value {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(format!("expected true/false, got '{other}'")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_strips_crlf() {
        assert_eq!(decode_line(b"{\"a\":1}\r\n").expect("decode"), "{\"a\":1}");
        assert_eq!(decode_line(b"state").expect("decode"), "state");
    }

    #[test]
    fn decode_rejects_nul_bytes() {
        let err = decode_line(b"{\"a\"\0:1}\n").expect_err("nul");
        assert_eq!(err, ProtocolError::NulByte { offset: 4 });
    }

    #[test]
    fn decode_rejects_invalid_utf8() {
        let err = decode_line(&[0x7b, 0xff, 0x7d]).expect_err("utf8");
        assert!(matches!(err, ProtocolError::InvalidUtf8 { .. }));
    }

    #[test]
    fn delegated_conditions_parse_their_own_rendering() {
        for condition in [
            DelegatedCondition::VisualStable,
            DelegatedCondition::MainMenu,
            DelegatedCondition::InCombat(true),
            DelegatedCondition::InGame(false),
        ] {
            let parsed: DelegatedCondition = condition.to_string().parse().expect("parse");
            assert_eq!(parsed, condition);
        }
    }

    #[test]
    fn delegated_condition_rejects_unknown_words() {
        assert!("in_combat maybe".parse::<DelegatedCondition>().is_err());
        assert!("shop".parse::<DelegatedCondition>().is_err());
    }
}

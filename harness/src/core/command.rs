//! Outbound instructions: a verb plus positional arguments, one line each.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::protocol::{DelegatedCondition, ProtocolError, WAIT_FOR_VERB};

/// One outbound command. Serialized as `verb arg1 arg2 ...`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    verb: String,
    args: Vec<String>,
}

impl Command {
    pub fn new(verb: impl Into<String>) -> Self {
        Self {
            verb: verb.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// `wait_for <condition>`: the driven system blocks until the condition holds.
    pub fn wait_for(condition: &DelegatedCondition) -> Self {
        Self::new(WAIT_FOR_VERB).args(condition.words())
    }

    pub fn verb(&self) -> &str {
        &self.verb
    }

    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    /// Parse a bare command line (whitespace separated). Returns `None` for blank lines.
    pub fn parse(line: &str) -> Option<Self> {
        let mut words = line.split_whitespace();
        let verb = words.next()?;
        Some(Self::new(verb).args(words))
    }

    /// Render the wire line (without terminator), rejecting anything that would break framing.
    pub fn to_line(&self) -> Result<String, ProtocolError> {
        if self.verb.trim().is_empty() {
            return Err(self.invalid("empty verb"));
        }
        if self.verb.chars().any(char::is_whitespace) {
            return Err(self.invalid("verb contains whitespace"));
        }
        let line = self.to_string();
        if line.contains(['\n', '\r']) {
            return Err(self.invalid("line terminator inside command"));
        }
        if line.contains('\0') {
            return Err(self.invalid("NUL byte inside command"));
        }
        Ok(line)
    }

    fn invalid(&self, reason: &'static str) -> ProtocolError {
        ProtocolError::InvalidCommand {
            command: self.to_string().escape_debug().to_string(),
            reason,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.verb)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_verb_and_positional_args() {
        let cmd = Command::new("start").arg("IRONCLAD").arg("0");
        assert_eq!(cmd.to_line().expect("line"), "start IRONCLAD 0");
    }

    #[test]
    fn wait_for_renders_condition_words() {
        let cmd = Command::wait_for(&DelegatedCondition::InCombat(true));
        assert_eq!(cmd.to_line().expect("line"), "wait_for in_combat true");
    }

    #[test]
    fn multi_word_arguments_stay_on_one_line() {
        let cmd = Command::new("arena").args(["WATCHER", "Jaw Worm", "7"]);
        assert_eq!(cmd.to_line().expect("line"), "arena WATCHER Jaw Worm 7");
    }

    #[test]
    fn rejects_embedded_newline() {
        let cmd = Command::new("state").arg("x\nabandon");
        let err = cmd.to_line().expect_err("newline");
        assert!(matches!(
            err,
            ProtocolError::InvalidCommand {
                reason: "line terminator inside command",
                ..
            }
        ));
    }

    #[test]
    fn rejects_empty_verb() {
        assert!(Command::new("  ").to_line().is_err());
    }

    #[test]
    fn parse_splits_on_whitespace() {
        let cmd = Command::parse("  results_button   continue ").expect("parse");
        assert_eq!(cmd.verb(), "results_button");
        assert_eq!(cmd.arguments(), ["continue"]);
        assert!(Command::parse("   ").is_none());
    }
}

//! Settling after an outcome-forcing action.
//!
//! After a fight is forced to end the driven system may pass through several
//! transient screens. Settling walks an ordered rule list: the first rule that
//! matches the current snapshot decides what happens next. When no rule
//! matches the caller polls for a fresh state and tries again.

use serde::{Deserialize, Serialize};

use crate::core::command::Command;
use crate::core::protocol::DelegatedCondition;
use crate::core::snapshot::StateSnapshot;

/// One settle rule, matched in list order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SettleRule {
    /// Done once the system is out of a session.
    Baseline,
    /// On `screen`, send `command` to dismiss it.
    Dismiss { screen: String, command: String },
    /// Hand the wait to the driven system. Fires at most once per settle.
    Delegate { condition: DelegatedCondition },
}

/// What the settle loop should do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettleDecision {
    Done,
    Send(Command),
    Delegate(DelegatedCondition),
}

/// Default arena rules: leave results screens with the continue button, then
/// fall back to waiting for the main menu.
pub fn default_rules() -> Vec<SettleRule> {
    vec![
        SettleRule::Baseline,
        SettleRule::Dismiss {
            screen: "ARENA_RESULTS".to_string(),
            command: "results_button continue".to_string(),
        },
        SettleRule::Delegate {
            condition: DelegatedCondition::MainMenu,
        },
    ]
}

/// First matching rule and its decision. `fired` lists rule indices already
/// used by this settle; delegate rules in it are skipped. `None` means poll.
pub fn decide(
    rules: &[SettleRule],
    snapshot: &StateSnapshot,
    fired: &[usize],
) -> Option<(usize, SettleDecision)> {
    rules.iter().enumerate().find_map(|(index, rule)| match rule {
        SettleRule::Baseline if !snapshot.in_session && snapshot.is_trusted() => {
            Some((index, SettleDecision::Done))
        }
        SettleRule::Dismiss { screen, command } if snapshot.screen_is(screen) => {
            Command::parse(command).map(|cmd| (index, SettleDecision::Send(cmd)))
        }
        SettleRule::Delegate { condition } if !fired.contains(&index) => {
            Some((index, SettleDecision::Delegate(condition.clone())))
        }
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_session_is_done() {
        let snapshot = StateSnapshot::parse(r#"{"in_game":false,"ready_for_command":true}"#);
        assert_eq!(
            decide(&default_rules(), &snapshot, &[]),
            Some((0, SettleDecision::Done))
        );
    }

    #[test]
    fn results_screen_is_dismissed_every_time() {
        let snapshot = StateSnapshot::parse(
            r#"{"in_game":true,"game_state":{"screen_type":"ARENA_RESULTS"}}"#,
        );
        let expected = Some((
            1,
            SettleDecision::Send(Command::new("results_button").arg("continue")),
        ));
        assert_eq!(decide(&default_rules(), &snapshot, &[]), expected);
        assert_eq!(decide(&default_rules(), &snapshot, &[1, 2]), expected);
    }

    #[test]
    fn delegate_fires_once_then_polls() {
        let snapshot =
            StateSnapshot::parse(r#"{"in_game":true,"game_state":{"screen_type":"NONE"}}"#);
        assert_eq!(
            decide(&default_rules(), &snapshot, &[]),
            Some((2, SettleDecision::Delegate(DelegatedCondition::MainMenu)))
        );
        assert_eq!(decide(&default_rules(), &snapshot, &[2]), None);
    }

    #[test]
    fn rules_load_from_toml() {
        #[derive(Deserialize)]
        struct Wrapper {
            rules: Vec<SettleRule>,
        }
        let parsed: Wrapper = toml::from_str(
            r#"
[[rules]]
kind = "baseline"

[[rules]]
kind = "dismiss"
screen = "ARENA_RESULTS"
command = "results_button continue"

[[rules]]
kind = "delegate"
condition = "main_menu"
"#,
        )
        .expect("parse rules");
        assert_eq!(parsed.rules, default_rules());
    }
}

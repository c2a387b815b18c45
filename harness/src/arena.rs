//! Arena model: sandboxed single fights, practice fights started from a
//! normal run, and the normal run itself, driven through the generalized
//! engine.
//!
//! The model is advanced only from each action's known effect. The driven
//! system's reports are consulted by the invariants, never copied into the
//! model.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use rand::Rng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::baseline::{RecoveryPolicy, ensure_baseline};
use crate::core::command::Command;
use crate::core::invariants::{
    Invariant, bounded_len, flag_agreement, forbidden_screens, implies, model_only, non_negative,
};
use crate::core::protocol::DelegatedCondition;
use crate::core::settle::{SettleDecision, SettleRule, decide, default_rules};
use crate::core::snapshot::StateSnapshot;
use crate::engine::{Engine, StepError};
use crate::io::coordinator::{Coordinator, TimeoutError, WaitError};
use crate::io::transport::Transport;

/// Present in `game_state` only while a fight is running.
const COMBAT_STATE: &str = "/combat_state";
const MONSTERS: &str = "/combat_state/monsters";

/// `[arena]` configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ArenaSettings {
    pub characters: Vec<String>,
    pub encounters: Vec<String>,
    /// Screens that must never appear while in arena mode.
    pub forbidden_screens: Vec<String>,
    /// Monsters that must never appear in an arena fight (fallback encounters).
    pub forbidden_monsters: Vec<String>,
    pub max_hand_size: usize,
    /// Screen shown after winning a normal-run fight.
    pub reward_screen: String,
    /// Screen shown after losing a normal-run fight.
    pub defeat_screen: String,
    /// Ordered settle rules applied after arena `win`/`lose`.
    pub after_outcome: Vec<SettleRule>,
}

impl Default for ArenaSettings {
    fn default() -> Self {
        let strings = |items: &[&str]| items.iter().map(|s| (*s).to_string()).collect();
        Self {
            characters: strings(&["IRONCLAD", "THE_SILENT", "DEFECT", "WATCHER"]),
            encounters: strings(&[
                "Cultist",
                "Jaw Worm",
                "2 Louse",
                "Lagavulin",
                "Hexaghost",
                "Chosen",
                "Gremlin Nob",
                "3 Sentries",
                "Slime Boss",
            ]),
            forbidden_screens: strings(&[
                "CARD_REWARD",
                "COMBAT_REWARD",
                "MAP",
                "BOSS_REWARD",
                "SHOP_ROOM",
                "SHOP_SCREEN",
                "REST",
                "CHEST",
                "EVENT",
            ]),
            forbidden_monsters: strings(&["Apology Slime"]),
            max_hand_size: 10,
            reward_screen: "COMBAT_REWARD".to_string(),
            defeat_screen: "GAME_OVER".to_string(),
            after_outcome: default_rules(),
        }
    }
}

/// The engine's belief about the driven system.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ArenaModel {
    pub in_session: bool,
    /// Inside an arena fight.
    pub restricted: bool,
    /// The arena fight was started from a normal run; leaving it resumes
    /// that run.
    pub practice: bool,
    pub character: Option<String>,
    pub encounter: Option<String>,
    pub in_combat: bool,
    /// A normal-run fight is over and its aftermath screen waits for `proceed`.
    pub combat_ended: bool,
    /// The fight that ended was lost.
    pub defeated: bool,
    pub fights_started: u32,
    pub fights_won: u32,
    pub fights_lost: u32,
    pub fights_abandoned: u32,
}

impl ArenaModel {
    /// Back at the main menu, counters kept.
    fn at_menu(&self) -> Self {
        Self {
            fights_started: self.fights_started,
            fights_won: self.fights_won,
            fights_lost: self.fights_lost,
            fights_abandoned: self.fights_abandoned,
            ..Self::default()
        }
    }

    fn in_normal_run(&self) -> bool {
        self.in_session && !self.restricted
    }

    fn can_force_outcome(&self) -> bool {
        self.in_session && self.in_combat && !self.practice
    }

    fn can_enter_normal_combat(&self) -> bool {
        self.in_normal_run() && !self.in_combat && !self.combat_ended
    }

    /// An arena fight left before it was decided counts as abandoned.
    fn abandoned_fights(&self) -> u32 {
        self.fights_abandoned + u32::from(self.restricted && self.in_combat)
    }
}

/// Build the arena engine with every action and invariant registered.
pub fn build_engine<T>(settings: Arc<ArenaSettings>, recovery: RecoveryPolicy) -> Engine<ArenaModel, T>
where
    T: Transport + 'static,
{
    let mut engine = Engine::new(
        move |coord: &mut Coordinator<T>| {
            ensure_baseline(coord, recovery)?;
            Ok(ArenaModel::default())
        },
        move |coord: &mut Coordinator<T>| {
            ensure_baseline(coord, recovery)?;
            Ok(())
        },
    );

    let args_settings = Arc::clone(&settings);
    engine.register_action(
        "start_arena_fight",
        |m: &ArenaModel| !m.in_session,
        move |rng, _| {
            let character = args_settings.characters.choose(rng).cloned().unwrap_or_default();
            let encounter = args_settings.encounters.choose(rng).cloned().unwrap_or_default();
            let seed: i64 = rng.gen_range(0..i64::MAX);
            vec![character, encounter, seed.to_string()]
        },
        |m, args, coord| {
            let [character, encounter, seed] = args else {
                return Err(StepError::aborted(format!(
                    "start_arena_fight expects 3 arguments, got {}",
                    args.len()
                )));
            };
            coord.send_message(&Command::new("arena").arg(character).arg(encounter).arg(seed))?;
            let ready = coord.settings().ready;
            coord.await_ready(ready)?;
            enter_session(coord, true)?;
            Ok(ArenaModel {
                in_session: true,
                restricted: true,
                character: Some(character.clone()),
                encounter: Some(encounter.clone()),
                in_combat: true,
                fights_started: m.fights_started + 1,
                ..m.clone()
            })
        },
    );

    let args_settings = Arc::clone(&settings);
    engine.register_action(
        "start_normal_run",
        |m: &ArenaModel| !m.in_session,
        move |rng, _| {
            vec![args_settings.characters.choose(rng).cloned().unwrap_or_default()]
        },
        |m, args, coord| {
            let [character] = args else {
                return Err(StepError::aborted(format!(
                    "start_normal_run expects 1 argument, got {}",
                    args.len()
                )));
            };
            coord.send_message(&Command::new("start").arg(character).arg("0"))?;
            let ready = coord.settings().ready;
            coord.await_ready(ready)?;
            enter_session(coord, false)?;
            Ok(ArenaModel {
                in_session: true,
                character: Some(character.clone()),
                ..m.at_menu()
            })
        },
    );

    engine.register_action(
        "enter_normal_combat",
        ArenaModel::can_enter_normal_combat,
        |_, _| Vec::new(),
        |m, _, coord| {
            navigate_to_combat(coord)?;
            Ok(ArenaModel {
                in_combat: true,
                ..m.clone()
            })
        },
    );

    engine.register_action(
        "abandon",
        |m: &ArenaModel| m.in_session,
        |_, _| Vec::new(),
        |m, _, coord| {
            coord.send_message(&Command::new("abandon"))?;
            let timeout = coord.settings().session_change;
            coord.await_main_menu(timeout)?;
            Ok(ArenaModel {
                fights_abandoned: m.abandoned_fights(),
                ..m.at_menu()
            })
        },
    );

    let rules = Arc::new(settings.after_outcome.clone());
    for (name, verb) in [("win_fight", "win"), ("lose_fight", "lose")] {
        let rules = Arc::clone(&rules);
        let settings = Arc::clone(&settings);
        engine.register_action(
            name,
            ArenaModel::can_force_outcome,
            |_, _| Vec::new(),
            move |m, _, coord| {
                let lost = verb == "lose";
                coord.send_message(&Command::new(verb))?;
                let ready = coord.settings().ready;
                coord.await_ready(ready)?;
                if !m.restricted {
                    let screen = if lost {
                        &settings.defeat_screen
                    } else {
                        &settings.reward_screen
                    };
                    let timeout = coord.settings().session_change;
                    coord.await_screen(screen, timeout)?;
                    return Ok(ArenaModel {
                        in_combat: false,
                        combat_ended: true,
                        defeated: lost,
                        ..m.clone()
                    });
                }
                settle(coord, &rules)?;
                let mut next = m.at_menu();
                if lost {
                    next.fights_lost += 1;
                } else {
                    next.fights_won += 1;
                }
                Ok(next)
            },
        );
    }

    engine.register_action(
        "proceed_after_combat",
        |m: &ArenaModel| m.in_normal_run() && m.combat_ended,
        |_, _| Vec::new(),
        |m, _, coord| {
            coord.send_message(&Command::new("proceed"))?;
            let settings = coord.settings().clone();
            coord.await_ready(settings.ready)?;
            if m.defeated {
                coord.await_main_menu(settings.session_change)?;
                return Ok(m.at_menu());
            }
            coord.await_in_session(settings.ready)?;
            Ok(ArenaModel {
                combat_ended: false,
                defeated: false,
                ..m.clone()
            })
        },
    );

    engine.register_action(
        "practice_in_arena",
        |m: &ArenaModel| m.in_normal_run() && m.in_combat,
        |_, _| Vec::new(),
        |m, _, coord| {
            coord.send_message(&Command::new("practice_in_arena"))?;
            let ready = coord.settings().ready;
            coord.await_ready(ready)?;
            enter_session(coord, true)?;
            Ok(ArenaModel {
                restricted: true,
                practice: true,
                fights_started: m.fights_started + 1,
                ..m.clone()
            })
        },
    );

    engine.register_action(
        "leave_arena",
        |m: &ArenaModel| m.in_session && m.restricted,
        |_, _| Vec::new(),
        |m, _, coord| {
            coord.send_message(&Command::new("leave_arena"))?;
            let settings = coord.settings().clone();
            coord.await_ready(settings.ready)?;
            let fights_abandoned = m.abandoned_fights();
            if !m.practice {
                coord.await_main_menu(settings.session_change)?;
                return Ok(ArenaModel {
                    fights_abandoned,
                    ..m.at_menu()
                });
            }
            // The resumed run is back in the fight practice started from.
            enter_session(coord, true)?;
            Ok(ArenaModel {
                restricted: false,
                practice: false,
                in_combat: true,
                fights_abandoned,
                ..m.clone()
            })
        },
    );

    engine.register_action(
        "query_state",
        |_: &ArenaModel| true,
        |_, _| Vec::new(),
        |m, _, coord| {
            coord.await_state_update()?;
            Ok(m.clone())
        },
    );

    for invariant in arena_invariants(&settings) {
        engine.register_invariant(invariant);
    }
    engine
}

/// Delegated waits for the session (and fight) to begin. A delegated
/// failure here is left for the session invariants to report against the
/// model; timeouts and transport faults still end the step.
fn enter_session<T: Transport>(coord: &mut Coordinator<T>, combat: bool) -> Result<(), StepError> {
    let timeout = coord.settings().session_change;
    if !tolerate_delegated(coord.wait_for(&DelegatedCondition::InGame(true), timeout))? {
        return Ok(());
    }
    if combat {
        tolerate_delegated(coord.wait_for(&DelegatedCondition::InCombat(true), timeout))?;
    }
    Ok(())
}

/// `Ok(false)` when the driven system reported that the condition failed.
fn tolerate_delegated<S>(result: Result<S, WaitError>) -> Result<bool, WaitError> {
    match result {
        Ok(_) => Ok(true),
        Err(WaitError::Delegated {
            condition, message, ..
        }) => {
            warn!(%condition, message = %message, "delegated wait failed");
            Ok(false)
        }
        Err(err) => Err(err),
    }
}

/// One overall budget shared by several commands and waits. Inner timeouts
/// are reported under the deadline's operation.
struct Deadline {
    operation: &'static str,
    start: Instant,
    budget: Duration,
}

impl Deadline {
    fn new(operation: &'static str, budget: Duration) -> Self {
        Self {
            operation,
            start: Instant::now(),
            budget,
        }
    }

    fn remaining(&self) -> Duration {
        self.budget.saturating_sub(self.start.elapsed())
    }

    fn expired(&self, last_snapshot: Arc<StateSnapshot>) -> WaitError {
        TimeoutError {
            operation: self.operation.to_string(),
            elapsed: self.start.elapsed(),
            last_snapshot,
        }
        .into()
    }

    fn bound<S>(&self, result: Result<S, WaitError>) -> Result<S, WaitError> {
        match result {
            Err(WaitError::Timeout(inner)) => Err(self.expired(inner.last_snapshot)),
            other => other,
        }
    }

    fn send_and_await<T: Transport>(
        &self,
        coord: &mut Coordinator<T>,
        command: &Command,
    ) -> Result<Arc<StateSnapshot>, WaitError> {
        coord.send_message(command)?;
        self.bound(coord.await_ready(self.remaining()))
    }
}

/// Walk the settle rules after an outcome-forcing command until one says the
/// system is back at baseline, or the session-change budget runs out.
fn settle<T: Transport>(coord: &mut Coordinator<T>, rules: &[SettleRule]) -> Result<(), WaitError> {
    let deadline = Deadline::new("settle", coord.settings().session_change);
    let poll = coord.settings().poll_interval;
    let mut fired = Vec::new();
    loop {
        let remaining = deadline.remaining();
        if remaining.is_zero() {
            return Err(deadline.expired(coord.latest()));
        }
        let snapshot = coord.latest();
        match decide(rules, &snapshot, &fired) {
            Some((_, SettleDecision::Done)) => {
                debug!(elapsed_ms = deadline.start.elapsed().as_millis() as u64, "settled");
                return Ok(());
            }
            Some((index, SettleDecision::Send(command))) => {
                debug!(rule = index, command = %command, "settle: dismiss");
                deadline.send_and_await(coord, &command)?;
            }
            Some((index, SettleDecision::Delegate(condition))) => {
                debug!(rule = index, %condition, "settle: delegate");
                fired.push(index);
                tolerate_delegated(deadline.bound(coord.wait_for(&condition, remaining)))?;
            }
            None => {
                thread::sleep(poll.min(remaining));
                deadline.send_and_await(coord, &Command::new("state"))?;
            }
        }
    }
}

/// Walk a fresh normal run into its first fight: pick the first option on
/// events and the map, proceed past reward screens.
fn navigate_to_combat<T: Transport>(coord: &mut Coordinator<T>) -> Result<(), WaitError> {
    let deadline = Deadline::new("enter_normal_combat", coord.settings().session_change);
    let poll = coord.settings().poll_interval;
    let mut snapshot = deadline.send_and_await(coord, &Command::new("state"))?;
    loop {
        if snapshot.in_session && snapshot.has_field(COMBAT_STATE) {
            return Ok(());
        }
        let remaining = deadline.remaining();
        if remaining.is_zero() {
            return Err(deadline.expired(snapshot));
        }
        let offers = |verb: &str| snapshot.available_commands.iter().any(|c| c == verb);
        let command = if offers("choose") {
            Command::new("choose").arg("0")
        } else if offers("proceed") {
            Command::new("proceed")
        } else {
            thread::sleep(poll.min(remaining));
            Command::new("state")
        };
        debug!(command = %command, screen = snapshot.screen.as_deref().unwrap_or("-"), "navigating");
        snapshot = deadline.send_and_await(coord, &command)?;
    }
}

/// Invariants checked after every arena action.
pub fn arena_invariants(settings: &ArenaSettings) -> Vec<Invariant<ArenaModel>> {
    let forbidden_monsters = settings.forbidden_monsters.clone();
    vec![
        flag_agreement(
            "session_agreement",
            "in_session",
            |m: &ArenaModel| m.in_session,
            |s| s.in_session,
        ),
        implies(
            "session_has_game_state",
            |_: &ArenaModel, s| s.in_session,
            |_, s| {
                if s.payload.is_empty() {
                    Err("in session but no game_state reported".to_string())
                } else {
                    Ok(())
                }
            },
        ),
        forbidden_screens(
            "no_forbidden_screens_in_arena",
            |m: &ArenaModel| m.restricted,
            settings.forbidden_screens.clone(),
        ),
        implies(
            "no_fallback_monster_in_arena",
            |m: &ArenaModel, s| m.restricted && m.in_combat && s.in_session,
            move |m, s| {
                let names: Vec<&str> = s
                    .field(MONSTERS)
                    .and_then(|monsters| monsters.as_array())
                    .map(|monsters| {
                        monsters
                            .iter()
                            .filter_map(|monster| monster.get("name").and_then(|n| n.as_str()))
                            .collect()
                    })
                    .unwrap_or_default();
                match names.iter().find(|name| forbidden_monsters.iter().any(|f| f == *name)) {
                    Some(found) => Err(format!(
                        "arena fight against {} got fallback monster {found} (monsters: {})",
                        m.encounter.as_deref().unwrap_or("the current encounter"),
                        names.join(", ")
                    )),
                    None => Ok(()),
                }
            },
        ),
        implies(
            "character_matches",
            |m: &ArenaModel, _| m.in_session,
            |m, s| {
                let Some(expected) = m.character.as_deref() else {
                    return Err("in session without a character".to_string());
                };
                match s.str_field("/class") {
                    Some(actual) if s.in_session && actual != expected => Err(format!(
                        "expected character {expected}, driven system reports {actual}"
                    )),
                    _ => Ok(()),
                }
            },
        ),
        non_negative("hp_non_negative", "/current_hp"),
        non_negative("energy_non_negative", "/combat_state/player/energy"),
        bounded_len("hand_size", "/combat_state/hand", settings.max_hand_size),
        model_only("fight_outcomes_bounded", |m: &ArenaModel| {
            let finished = m.fights_won + m.fights_lost + m.fights_abandoned;
            if finished <= m.fights_started {
                Ok(())
            } else {
                Err(format!(
                    "{finished} fights finished but only {} started",
                    m.fights_started
                ))
            }
        }),
        model_only("practice_is_arena", |m: &ArenaModel| {
            if m.practice && !(m.restricted && m.in_session) {
                Err("practice mode outside an arena fight".to_string())
            } else {
                Ok(())
            }
        }),
        implies(
            "combat_has_monsters",
            |m: &ArenaModel, s| m.in_combat && s.in_session,
            |_, s| match s.len_field(MONSTERS) {
                Some(count) if count > 0 => Ok(()),
                _ => Err("model is in combat but no monsters are reported".to_string()),
            },
        ),
        implies(
            "aftermath_offers_proceed",
            |m: &ArenaModel, s| m.combat_ended && s.in_session,
            |_, s| {
                if s.available_commands.iter().any(|c| c == "proceed") {
                    Ok(())
                } else {
                    Err(format!(
                        "fight is over but proceed is not offered on {}",
                        s.screen.as_deref().unwrap_or("an unknown screen")
                    ))
                }
            },
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::invariants::check_invariants;
    use crate::core::snapshot::StateSnapshot;

    fn fighting() -> ArenaModel {
        ArenaModel {
            in_session: true,
            restricted: true,
            character: Some("IRONCLAD".to_string()),
            encounter: Some("Cultist".to_string()),
            in_combat: true,
            fights_started: 1,
            ..ArenaModel::default()
        }
    }

    fn names(model: &ArenaModel, line: &str) -> Vec<String> {
        let invariants = arena_invariants(&ArenaSettings::default());
        check_invariants(&invariants, model, &StateSnapshot::parse(line))
            .into_iter()
            .map(|v| v.invariant)
            .collect()
    }

    #[test]
    fn healthy_fight_passes() {
        let line = r#"{"ready_for_command":true,"in_game":true,"game_state":{"screen_type":"NONE","class":"IRONCLAD","current_hp":50,"combat_state":{"hand":[1,2],"monsters":[{}],"player":{"energy":3}}}}"#;
        assert!(names(&fighting(), line).is_empty());
        assert!(names(&ArenaModel::default(), r#"{"ready_for_command":true,"in_game":false}"#).is_empty());
    }

    #[test]
    fn reward_screen_in_arena_is_flagged() {
        let line = r#"{"ready_for_command":true,"in_game":true,"game_state":{"screen_type":"COMBAT_REWARD","class":"IRONCLAD","current_hp":50,"combat_state":{"hand":[],"monsters":[{}],"player":{"energy":3}}}}"#;
        assert_eq!(names(&fighting(), line), vec!["no_forbidden_screens_in_arena"]);
    }

    #[test]
    fn wrong_character_and_bounds_are_flagged() {
        let hand: Vec<u32> = (0..11).collect();
        let line = format!(
            r#"{{"ready_for_command":true,"in_game":true,"game_state":{{"screen_type":"NONE","class":"DEFECT","current_hp":-3,"combat_state":{{"hand":{hand:?},"monsters":[],"player":{{"energy":-1}}}}}}}}"#
        );
        assert_eq!(
            names(&fighting(), &line),
            vec![
                "character_matches",
                "hp_non_negative",
                "energy_non_negative",
                "hand_size",
                "combat_has_monsters",
            ]
        );
    }

    #[test]
    fn fallback_monster_in_arena_is_flagged() {
        let line = r#"{"ready_for_command":true,"in_game":true,"game_state":{"screen_type":"NONE","class":"IRONCLAD","current_hp":50,"combat_state":{"hand":[],"monsters":[{"name":"Apology Slime"}],"player":{"energy":3}}}}"#;
        let invariants = arena_invariants(&ArenaSettings::default());
        let violations = check_invariants(&invariants, &fighting(), &StateSnapshot::parse(line));
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].invariant, "no_fallback_monster_in_arena");
        assert!(violations[0].message.contains("Apology Slime"), "{}", violations[0].message);
        assert!(violations[0].message.contains("Cultist"), "{}", violations[0].message);

        let normal_run = ArenaModel {
            restricted: false,
            ..fighting()
        };
        assert!(names(&normal_run, line).is_empty());
    }

    #[test]
    fn ended_fight_must_offer_proceed() {
        let model = ArenaModel {
            in_session: true,
            character: Some("IRONCLAD".to_string()),
            combat_ended: true,
            ..ArenaModel::default()
        };
        let offered = r#"{"ready_for_command":true,"in_game":true,"available_commands":["proceed"],"game_state":{"screen_type":"COMBAT_REWARD","class":"IRONCLAD","current_hp":50}}"#;
        assert!(names(&model, offered).is_empty());
        let missing = r#"{"ready_for_command":true,"in_game":true,"available_commands":["choose"],"game_state":{"screen_type":"MAP","class":"IRONCLAD","current_hp":50}}"#;
        assert_eq!(names(&model, missing), vec!["aftermath_offers_proceed"]);
    }

    #[test]
    fn practice_outside_the_arena_is_flagged() {
        let model = ArenaModel {
            practice: true,
            ..ArenaModel::default()
        };
        assert_eq!(
            names(&model, r#"{"ready_for_command":true,"in_game":false}"#),
            vec!["practice_is_arena"]
        );
    }

    #[test]
    fn leaving_an_undecided_arena_fight_counts_as_abandoned() {
        assert_eq!(fighting().abandoned_fights(), 1);
        let normal_combat = ArenaModel {
            restricted: false,
            ..fighting()
        };
        assert_eq!(normal_combat.abandoned_fights(), 0);
        assert!(!ArenaModel {
            practice: true,
            ..fighting()
        }
        .can_force_outcome());
        assert!(normal_combat.can_force_outcome());
        assert!(!normal_combat.can_enter_normal_combat());
    }

    #[test]
    fn outcome_counters_never_exceed_starts() {
        let model = ArenaModel {
            fights_won: 1,
            ..ArenaModel::default()
        };
        assert_eq!(
            names(&model, r#"{"ready_for_command":true,"in_game":false}"#),
            vec!["fight_outcomes_bounded"]
        );
    }
}

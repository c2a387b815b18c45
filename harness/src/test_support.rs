//! Test-only scripted driven system.
//!
//! `FakeGame` speaks the inbound/outbound line protocol in-process: every
//! command it receives updates a tiny world state and queues the reply lines
//! the real system would send. Faults bend that behavior to provoke the
//! failures the harness must catch.

use std::collections::{BTreeSet, VecDeque};
use std::time::Duration;

use serde_json::{Value, json};

use crate::core::protocol::HANDSHAKE_LINE;
use crate::io::transport::{Transport, TransportError};

/// Deliberate misbehavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Fault {
    /// `start`/`arena` are acknowledged but no session begins.
    IgnoreStart,
    /// Arena fights show the combat reward screen.
    RewardScreenDuringFight,
    /// Nothing after the initial state is ever answered.
    Silent,
    /// `wait_for visual_stable` always reports a stability timeout.
    UnstableVisuals,
    /// Arena `win`/`lose` park on a results screen until it is dismissed.
    ResultsScreenAfterOutcome,
    /// `abandon` is acknowledged but the session continues.
    StuckInSession,
    /// Arena fights fall back to the placeholder monster.
    ApologySlimeInArena,
    /// `leave_arena` after practice drops to the main menu instead of
    /// resuming the run.
    LeaveArenaToMenu,
    /// Arena `win`/`lose` leave the session open, and nothing after that
    /// reply is answered.
    MuteAfterOutcome,
}

const FALLBACK_MONSTER: &str = "Apology Slime";
const NORMAL_ENCOUNTER: &str = "Jaw Worm";

#[derive(Debug, Clone, Default)]
struct World {
    in_game: bool,
    arena: bool,
    in_combat: bool,
    character: Option<String>,
    encounter: Option<String>,
    screen: String,
    floor: i64,
    hp: i64,
    energy: i64,
    hand: usize,
    monsters: usize,
    /// The normal run an arena practice fight was started from.
    saved_run: Option<Box<World>>,
}

impl World {
    fn main_menu() -> Self {
        Self {
            screen: "MAIN_MENU".to_string(),
            ..Self::default()
        }
    }

    fn normal_run(character: &str) -> Self {
        Self {
            in_game: true,
            character: Some(character.to_string()),
            screen: "EVENT".to_string(),
            hp: 80,
            ..Self::default()
        }
    }

    fn leave_session(&mut self) {
        *self = Self::main_menu();
    }

    fn enter_combat(&mut self, encounter: &str) {
        self.in_combat = true;
        self.encounter = Some(encounter.to_string());
        self.screen = "NONE".to_string();
        self.energy = 3;
        self.hand = 5;
        self.monsters = 1;
    }
}

#[derive(Debug)]
pub struct FakeGame {
    world: World,
    faults: BTreeSet<Fault>,
    outbox: VecDeque<String>,
    received: Vec<String>,
    drop_replies: u32,
    muted: bool,
    closed: bool,
}

impl Default for FakeGame {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeGame {
    /// At the main menu; the handshake and an initial ready state are queued.
    pub fn new() -> Self {
        let mut game = Self {
            world: World::main_menu(),
            faults: BTreeSet::new(),
            outbox: VecDeque::new(),
            received: Vec::new(),
            drop_replies: 0,
            muted: false,
            closed: false,
        };
        game.outbox.push_back(HANDSHAKE_LINE.to_string());
        game.queue_state();
        game
    }

    /// Already inside a normal run as `character`.
    pub fn in_session(character: &str) -> Self {
        let mut game = Self::new();
        game.outbox.clear();
        game.outbox.push_back(HANDSHAKE_LINE.to_string());
        game.world = World {
            screen: "MAP".to_string(),
            floor: 1,
            hp: 70,
            ..World::normal_run(character)
        };
        game.queue_state();
        game
    }

    pub fn with_fault(mut self, fault: Fault) -> Self {
        self.faults.insert(fault);
        self
    }

    /// Swallow the replies to the next `n` commands.
    pub fn drop_next_replies(mut self, n: u32) -> Self {
        self.drop_replies = n;
        self
    }

    /// Queue an arbitrary inbound line.
    pub fn push_raw(&mut self, line: &str) {
        self.outbox.push_back(line.to_string());
    }

    /// Subsequent reads report a closed channel once the queue is empty.
    pub fn close(&mut self) {
        self.closed = true;
    }

    /// Every command line received so far.
    pub fn received(&self) -> &[String] {
        &self.received
    }

    pub fn in_game(&self) -> bool {
        self.world.in_game
    }

    fn has(&self, fault: Fault) -> bool {
        self.faults.contains(&fault)
    }

    fn state_json(&self) -> Value {
        let w = &self.world;
        let mut reply = json!({
            "ready_for_command": true,
            "in_game": w.in_game,
            "available_commands": self.available_commands(),
        });
        if w.in_game {
            let mut game_state = json!({
                "screen_type": w.screen,
                "class": w.character,
                "current_hp": w.hp,
                "max_hp": 80,
                "floor": w.floor,
            });
            if w.in_combat {
                let hand: Vec<Value> = (0..w.hand)
                    .map(|i| json!({ "name": format!("Strike_{i}") }))
                    .collect();
                let monsters: Vec<Value> = (0..w.monsters)
                    .map(|_| json!({ "name": w.encounter, "current_hp": 40 }))
                    .collect();
                game_state["combat_state"] = json!({
                    "hand": hand,
                    "monsters": monsters,
                    "player": { "energy": w.energy },
                });
            }
            reply["game_state"] = game_state;
        }
        reply
    }

    fn available_commands(&self) -> Vec<&'static str> {
        let w = &self.world;
        let mut commands = if !w.in_game {
            vec!["start", "arena"]
        } else if w.in_combat && w.arena {
            vec!["win", "lose", "leave_arena", "abandon"]
        } else if w.in_combat {
            vec!["win", "lose", "practice_in_arena", "abandon"]
        } else {
            match w.screen.as_str() {
                "EVENT" | "MAP" => vec!["choose", "abandon"],
                "COMBAT_REWARD" | "GAME_OVER" => vec!["proceed", "abandon"],
                "ARENA_RESULTS" => vec!["results_button", "abandon"],
                _ => vec!["abandon"],
            }
        };
        commands.extend(["state", "wait_for"]);
        commands
    }

    fn queue_state(&mut self) {
        let line = self.state_json().to_string();
        self.outbox.push_back(line);
    }

    fn queue_busy(&mut self) {
        let line = json!({"ready_for_command": false, "in_game": self.world.in_game}).to_string();
        self.outbox.push_back(line);
    }

    fn queue_error(&mut self, message: &str) {
        let line = json!({"ready_for_command": true, "error": message}).to_string();
        self.outbox.push_back(line);
    }

    fn handle(&mut self, line: &str) {
        self.received.push(line.to_string());
        if self.muted || self.has(Fault::Silent) {
            return;
        }
        if self.drop_replies > 0 {
            self.drop_replies -= 1;
            return;
        }
        let words: Vec<&str> = line.split_whitespace().collect();
        match words.as_slice() {
            ["state"] => self.queue_state(),
            ["start", character, _ascension] => self.start(character, None),
            ["arena", character, encounter @ .., seed]
                if !encounter.is_empty() && seed.parse::<u64>().is_ok() =>
            {
                self.start(character, Some(&encounter.join(" ")));
            }
            ["abandon"] => {
                if !self.world.in_game {
                    self.queue_error("Invalid command: abandon");
                    return;
                }
                if !self.has(Fault::StuckInSession) {
                    self.world.leave_session();
                }
                self.queue_state();
            }
            ["choose", _index] => self.choose(),
            ["proceed"] => self.proceed(),
            [verb @ ("win" | "lose")] => self.finish_fight(verb),
            ["practice_in_arena"] => self.practice_in_arena(),
            ["leave_arena"] => self.leave_arena(),
            ["results_button", "continue"] => {
                if self.world.screen == "ARENA_RESULTS" {
                    self.world.leave_session();
                    self.queue_state();
                } else {
                    self.queue_error("Invalid command: results_button");
                }
            }
            ["wait_for", condition @ ..] => self.wait_for(condition),
            _ => self.queue_error(&format!("Invalid command: {line}")),
        }
    }

    fn start(&mut self, character: &str, encounter: Option<&str>) {
        if self.world.in_game {
            self.queue_error("Invalid command: already in game");
            return;
        }
        self.queue_busy();
        if self.has(Fault::IgnoreStart) {
            self.queue_state();
            return;
        }
        self.world = World::normal_run(character);
        if let Some(encounter) = encounter {
            self.enter_arena(encounter);
        }
        self.queue_state();
    }

    /// Turn the current world into an arena fight against `encounter`.
    fn enter_arena(&mut self, encounter: &str) {
        let monster = if self.has(Fault::ApologySlimeInArena) {
            FALLBACK_MONSTER
        } else {
            encounter
        };
        self.world.arena = true;
        self.world.floor = 0;
        self.world.enter_combat(monster);
        if self.has(Fault::RewardScreenDuringFight) {
            self.world.screen = "COMBAT_REWARD".to_string();
        }
    }

    /// Neow event, then the first monster room on the map.
    fn choose(&mut self) {
        let screen = self.world.screen.clone();
        let w = &mut self.world;
        match (w.in_game && !w.in_combat, screen.as_str()) {
            (true, "EVENT") => w.screen = "MAP".to_string(),
            (true, "MAP") => {
                w.floor += 1;
                w.enter_combat(NORMAL_ENCOUNTER);
            }
            _ => {
                self.queue_error("Invalid command: choose");
                return;
            }
        }
        self.queue_state();
    }

    fn proceed(&mut self) {
        let screen = self.world.screen.clone();
        let w = &mut self.world;
        match (w.in_game && !w.arena, screen.as_str()) {
            (true, "COMBAT_REWARD") => w.screen = "MAP".to_string(),
            (true, "GAME_OVER") => w.leave_session(),
            _ => {
                self.queue_error("Invalid command: proceed");
                return;
            }
        }
        self.queue_state();
    }

    fn finish_fight(&mut self, verb: &str) {
        if !(self.world.in_game && self.world.in_combat) {
            self.queue_error(&format!("Invalid command: {verb}"));
            return;
        }
        let lost = verb == "lose";
        if !self.world.arena {
            let w = &mut self.world;
            w.in_combat = false;
            if lost {
                w.hp = 0;
                w.screen = "GAME_OVER".to_string();
            } else {
                w.screen = "COMBAT_REWARD".to_string();
            }
        } else if self.has(Fault::MuteAfterOutcome) {
            self.world.in_combat = false;
            self.world.screen = "NONE".to_string();
            self.queue_state();
            self.muted = true;
            return;
        } else if self.has(Fault::ResultsScreenAfterOutcome) {
            self.world.in_combat = false;
            self.world.screen = "ARENA_RESULTS".to_string();
            if lost {
                self.world.hp = 0;
            }
        } else {
            self.world.leave_session();
        }
        self.queue_state();
    }

    /// Save the normal run and fight its current encounter in the arena.
    fn practice_in_arena(&mut self) {
        let w = &self.world;
        if !(w.in_game && w.in_combat && !w.arena) {
            self.queue_error("Invalid command: practice_in_arena");
            return;
        }
        let encounter = w.encounter.clone().unwrap_or_default();
        self.queue_busy();
        let saved = Box::new(self.world.clone());
        self.enter_arena(&encounter);
        self.world.saved_run = Some(saved);
        self.queue_state();
    }

    fn leave_arena(&mut self) {
        if !(self.world.in_game && self.world.arena) {
            self.queue_error("Invalid command: leave_arena");
            return;
        }
        match self.world.saved_run.take() {
            Some(saved) if !self.has(Fault::LeaveArenaToMenu) => self.world = *saved,
            _ => self.world.leave_session(),
        }
        self.queue_state();
    }

    fn wait_for(&mut self, condition: &[&str]) {
        let satisfied = match condition {
            ["visual_stable"] => !self.has(Fault::UnstableVisuals),
            ["main_menu"] => !self.world.in_game,
            ["in_combat", value] => value.parse::<bool>().ok() == Some(self.world.in_combat),
            ["in_game", value] => value.parse::<bool>().ok() == Some(self.world.in_game),
            _ => {
                self.queue_error(&format!("Unknown wait condition: {}", condition.join(" ")));
                return;
            }
        };
        if satisfied {
            self.queue_state();
        } else {
            self.queue_error(&format!("wait_for {} timed out", condition.join(" ")));
        }
    }
}

impl Transport for FakeGame {
    fn send_line(&mut self, line: &str) -> Result<(), TransportError> {
        self.handle(line);
        Ok(())
    }

    fn recv_line(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, TransportError> {
        match self.try_recv_line()? {
            Some(line) => Ok(Some(line)),
            None => {
                std::thread::sleep(timeout);
                Ok(None)
            }
        }
    }

    fn try_recv_line(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        match self.outbox.pop_front() {
            Some(line) => Ok(Some(format!("{line}\n").into_bytes())),
            None if self.closed => Err(TransportError::Closed),
            None => Ok(None),
        }
    }
}

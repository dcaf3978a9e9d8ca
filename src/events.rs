//! Structured game events and where they go.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{Actor, GameId, PlayerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventCategory {
    AttackerMutantCreated,
    DefenderTestCreated,
    DefenderMutantClaimedEquivalent,
    DefenderMutantEquivalent,
    AttackerMutantKilledEquivalent,
    /// Game chat line posted on behalf of the defenders.
    GameMessageDefender,
    GameStateChanged,
    MutantKilled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Visibility {
    /// Everyone in the game.
    Game,
    Player(PlayerId),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub game_id: GameId,
    pub actor: Actor,
    pub category: EventCategory,
    pub visibility: Visibility,
    pub message: String,
    pub at_ms: u64,
}

impl Event {
    pub fn new(
        game_id: GameId,
        actor: Actor,
        category: EventCategory,
        visibility: Visibility,
        message: impl Into<String>,
    ) -> Self {
        Event {
            game_id,
            actor,
            category,
            visibility,
            message: message.into(),
            at_ms: crate::now_ms(),
        }
    }
}

/// Fire-and-forget sink for events. Delivery failures are the notifier's
/// problem and never fail the operation that raised the event.
pub trait Notifier: Send + Sync {
    fn notify(&self, event: Event);
}

/// Writes every event to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, event: Event) {
        info!(
            game = event.game_id,
            category = ?event.category,
            visibility = ?event.visibility,
            "{}",
            event.message
        );
    }
}

/// Keeps events in memory, for callers that render them later.
#[derive(Debug, Default)]
pub struct MemoryNotifier {
    events: Mutex<Vec<Event>>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        MemoryNotifier::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn drain(&self) -> Vec<Event> {
        self.events
            .lock()
            .map(|mut e| std::mem::take(&mut *e))
            .unwrap_or_default()
    }
}

impl Notifier for MemoryNotifier {
    fn notify(&self, event: Event) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

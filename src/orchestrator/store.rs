//! Conversation state shared between the orchestrator (sole writer) and views (readers).

use crate::types::{Message, Mode};
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Where a mode is in the submit state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Idle,
    Submitting,
    Streaming,
    AwaitingArtifact,
    Retrying,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    HistoryChanged(Mode),
    DraftChanged(Mode),
    PhaseChanged(Mode, Phase),
}

#[derive(Default)]
struct StoreState {
    histories: HashMap<Mode, Vec<Message>>,
    drafts: HashMap<Mode, Message>,
    phases: HashMap<Mode, Phase>,
}

#[derive(Clone)]
pub struct ConversationStore {
    state: Arc<RwLock<StoreState>>,
    tx: broadcast::Sender<StoreEvent>,
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationStore {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self {
            state: Arc::new(RwLock::new(StoreState::default())),
            tx,
        }
    }

    // A poisoned lock only means a panicking writer; the maps are still usable.
    fn read(&self) -> RwLockReadGuard<'_, StoreState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, StoreState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: StoreEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.tx.subscribe()
    }

    pub fn history(&self, mode: Mode) -> Vec<Message> {
        self.read().histories.get(&mode).cloned().unwrap_or_default()
    }

    pub fn draft(&self, mode: Mode) -> Option<Message> {
        self.read().drafts.get(&mode).cloned()
    }

    pub fn phase(&self, mode: Mode) -> Phase {
        self.read().phases.get(&mode).copied().unwrap_or_default()
    }

    pub fn is_loading(&self, mode: Mode) -> bool {
        self.phase(mode) != Phase::Idle
    }

    pub(crate) fn set_phase(&self, mode: Mode, phase: Phase) {
        let changed = {
            let mut state = self.write();
            let previous = state.phases.insert(mode, phase).unwrap_or_default();
            previous != phase
        };
        if changed {
            tracing::debug!("[{}] phase -> {:?}", mode, phase);
            self.emit(StoreEvent::PhaseChanged(mode, phase));
        }
    }

    pub(crate) fn push(&self, mode: Mode, message: Message) {
        self.write().histories.entry(mode).or_default().push(message);
        self.emit(StoreEvent::HistoryChanged(mode));
    }

    /// Replaces the message with `id` in place. Returns false when it no longer exists.
    pub(crate) fn replace(&self, mode: Mode, id: Uuid, message: Message) -> bool {
        let replaced = {
            let mut state = self.write();
            match state
                .histories
                .get_mut(&mode)
                .and_then(|h| h.iter_mut().find(|m| m.id == id))
            {
                Some(slot) => {
                    *slot = message;
                    true
                }
                None => false,
            }
        };
        if replaced {
            self.emit(StoreEvent::HistoryChanged(mode));
        }
        replaced
    }

    pub(crate) fn remove(&self, mode: Mode, id: Uuid) -> bool {
        let removed = {
            let mut state = self.write();
            match state.histories.get_mut(&mode) {
                Some(h) => {
                    let before = h.len();
                    h.retain(|m| m.id != id);
                    h.len() != before
                }
                None => false,
            }
        };
        if removed {
            self.emit(StoreEvent::HistoryChanged(mode));
        }
        removed
    }

    /// Rewrites a placeholder's progress text; finished or removed messages are left alone.
    pub(crate) fn update_placeholder(&self, mode: Mode, id: Uuid, content: &str) -> bool {
        let updated = {
            let mut state = self.write();
            match state
                .histories
                .get_mut(&mode)
                .and_then(|h| h.iter_mut().find(|m| m.id == id && m.is_loading))
            {
                Some(slot) => {
                    slot.content = content.to_string();
                    true
                }
                None => false,
            }
        };
        if updated {
            self.emit(StoreEvent::HistoryChanged(mode));
        }
        updated
    }

    /// Drops every placeholder and notice for a mode.
    pub(crate) fn remove_transients(&self, mode: Mode) -> usize {
        let removed = {
            let mut state = self.write();
            match state.histories.get_mut(&mode) {
                Some(h) => {
                    let before = h.len();
                    h.retain(|m| !m.is_transient());
                    before - h.len()
                }
                None => 0,
            }
        };
        if removed > 0 {
            self.emit(StoreEvent::HistoryChanged(mode));
        }
        removed
    }

    pub(crate) fn open_draft(&self, mode: Mode) {
        self.write().drafts.insert(mode, Message::model(""));
        self.emit(StoreEvent::DraftChanged(mode));
    }

    pub(crate) fn append_draft(&self, mode: Mode, delta: &str) {
        let appended = {
            let mut state = self.write();
            match state.drafts.get_mut(&mode) {
                Some(draft) => {
                    draft.content.push_str(delta);
                    true
                }
                None => false,
            }
        };
        if appended {
            self.emit(StoreEvent::DraftChanged(mode));
        }
    }

    /// Moves the draft into history as the final model message.
    pub(crate) fn commit_draft(&self, mode: Mode) -> Option<Message> {
        let committed = {
            let mut state = self.write();
            let draft = state.drafts.remove(&mode)?;
            state.histories.entry(mode).or_default().push(draft.clone());
            draft
        };
        self.emit(StoreEvent::DraftChanged(mode));
        self.emit(StoreEvent::HistoryChanged(mode));
        Some(committed)
    }

    pub(crate) fn discard_draft(&self, mode: Mode) -> bool {
        let discarded = self.write().drafts.remove(&mode).is_some();
        if discarded {
            self.emit(StoreEvent::DraftChanged(mode));
        }
        discarded
    }

    pub(crate) fn clear(&self, mode: Mode) {
        {
            let mut state = self.write();
            state.histories.remove(&mode);
            state.drafts.remove(&mode);
        }
        self.emit(StoreEvent::HistoryChanged(mode));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn draft_is_separate_from_history_until_commit() {
        let store = ConversationStore::new();
        store.push(Mode::General, Message::user("hi"));
        store.open_draft(Mode::General);
        store.append_draft(Mode::General, "Hel");
        store.append_draft(Mode::General, "lo");

        assert_eq!(store.history(Mode::General).len(), 1);
        assert_eq!(store.draft(Mode::General).unwrap().content, "Hello");

        store.commit_draft(Mode::General);
        let history = store.history(Mode::General);
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].content, "Hello");
        assert!(store.draft(Mode::General).is_none());
    }

    #[test]
    fn placeholder_updates_stop_once_replaced() {
        let store = ConversationStore::new();
        let placeholder = Message::placeholder("Working...");
        let id = placeholder.id;
        store.push(Mode::Media, placeholder);
        assert!(store.update_placeholder(Mode::Media, id, "Still working..."));

        let mut done = Message::model("").with_image("data:image/png;base64,AA");
        done.id = id;
        assert!(store.replace(Mode::Media, id, done));
        assert!(!store.update_placeholder(Mode::Media, id, "late tick"));
        assert_eq!(store.history(Mode::Media)[0].content, "");
    }

    #[test]
    fn modes_do_not_share_history() {
        let store = ConversationStore::new();
        store.push(Mode::General, Message::user("a"));
        store.push(Mode::Coding, Message::user("b"));
        store.clear(Mode::General);
        assert!(store.history(Mode::General).is_empty());
        assert_eq!(store.history(Mode::Coding).len(), 1);
    }

    #[test]
    fn phase_changes_are_published_once() {
        let store = ConversationStore::new();
        let mut rx = store.subscribe();
        store.set_phase(Mode::Vision, Phase::Submitting);
        store.set_phase(Mode::Vision, Phase::Submitting);
        assert_eq!(
            rx.try_recv().unwrap(),
            StoreEvent::PhaseChanged(Mode::Vision, Phase::Submitting)
        );
        assert!(rx.try_recv().is_err());
        assert!(store.is_loading(Mode::Vision));
    }
}

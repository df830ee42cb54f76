//! Pending commands and the action table.

use crate::events::{Action, Command, EventId};
use std::collections::{HashMap, VecDeque};

/// FIFO of commands waiting to be bound to time, plus the table of every
/// id the clock currently knows about.
///
/// An id is in the table exactly while it is pending as a command or queued
/// as an event. Cancelling drops it from the table; a command whose id has
/// left the table is skipped when it is drained.
#[derive(Debug, Default)]
pub struct CommandBuffer {
    pending: VecDeque<Command>,
    actions: HashMap<EventId, Action>,
}

impl CommandBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a command and register it in the action table.
    pub fn push(&mut self, command: Command) {
        self.actions
            .insert(command.event_id, Action::Command(command.clone()));
        self.pending.push_back(command);
    }

    /// Pop the next command that has not been cancelled.
    ///
    /// The command leaves the table; the caller registers whatever it turns
    /// into.
    pub fn pop_live(&mut self) -> Option<Command> {
        while let Some(command) = self.pending.pop_front() {
            if matches!(
                self.actions.get(&command.event_id),
                Some(Action::Command(_))
            ) {
                self.actions.remove(&command.event_id);
                return Some(command);
            }
        }
        None
    }

    pub fn get(&self, event_id: EventId) -> Option<&Action> {
        self.actions.get(&event_id)
    }

    pub fn insert(&mut self, action: Action) {
        self.actions.insert(action.event_id(), action);
    }

    /// Remove an id from the table, dropping its pending command if any.
    pub fn take(&mut self, event_id: EventId) -> Option<Action> {
        let action = self.actions.remove(&event_id)?;
        if matches!(action, Action::Command(_)) {
            self.pending.retain(|command| command.event_id != event_id);
        }
        Some(action)
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn pending(&self) -> impl Iterator<Item = &Command> {
        self.pending.iter()
    }

    /// Every action in the table.
    pub fn actions(&self) -> impl Iterator<Item = &Action> {
        self.actions.values()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
        self.actions.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Change, EventType, Payload};
    use crate::timing::TimeUnit;

    fn command(id: u64, schedule_at: f64) -> Command {
        Command {
            event_id: EventId::new(id),
            event_type: EventType::SCHEDULE,
            schedule_at,
            time_unit: Some(TimeUnit::Beats),
            quantization: None,
            payload: Payload::Change(Change::default()),
        }
    }

    #[test]
    fn test_fifo_drain() {
        let mut buffer = CommandBuffer::new();
        buffer.push(command(1, 4.0));
        buffer.push(command(2, 0.0));
        assert_eq!(buffer.pop_live().map(|c| c.event_id.get()), Some(1));
        assert!(buffer.get(EventId::new(1)).is_none());
        assert_eq!(buffer.pop_live().map(|c| c.event_id.get()), Some(2));
        assert!(buffer.pop_live().is_none());
    }

    #[test]
    fn test_cancelled_commands_are_skipped() {
        let mut buffer = CommandBuffer::new();
        buffer.push(command(1, 0.0));
        buffer.push(command(2, 1.0));
        assert!(buffer.take(EventId::new(1)).is_some());
        assert!(buffer.take(EventId::new(1)).is_none());
        assert_eq!(buffer.pending().count(), 1);
        assert_eq!(buffer.pop_live().map(|c| c.event_id.get()), Some(2));
    }

    #[test]
    fn test_reissued_id_is_not_shadowed() {
        let mut buffer = CommandBuffer::new();
        buffer.push(command(1, 0.0));
        buffer.take(EventId::new(1));
        buffer.push(command(1, 8.0));
        let command = buffer.pop_live().unwrap();
        assert_eq!(command.schedule_at, 8.0);
        assert!(buffer.pop_live().is_none());
    }
}

//! Bounded history of command outcomes.
//!
//! Every dispatched command gets a client-side correlation id, so results of
//! concurrent commands can be told apart even though the wire envelope has
//! no id of its own.

use super::envelope::CommandResponse;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use uuid::Uuid;

pub const DEFAULT_LOG_CAPACITY: usize = 32;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum CommandOutcome {
    Succeeded { response: CommandResponse },
    Failed { message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandRecord {
    pub id: Uuid,
    pub device_id: String,
    pub command: String,
    pub finished_at: DateTime<Utc>,
    pub outcome: CommandOutcome,
}

impl CommandRecord {
    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, CommandOutcome::Succeeded { .. })
    }
}

/// Ring buffer keeping the newest `capacity` records.
#[derive(Debug, Clone)]
pub struct CommandLog {
    records: VecDeque<CommandRecord>,
    capacity: usize,
}

impl CommandLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            records: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, record: CommandRecord) {
        if self.records.len() == self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(record);
    }

    pub fn get(&self, id: Uuid) -> Option<&CommandRecord> {
        self.records.iter().find(|r| r.id == id)
    }

    /// Oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &CommandRecord> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl Default for CommandLog {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY)
    }
}

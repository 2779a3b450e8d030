//! Append-only audit events for a transaction's timeline

use crate::party::Actor;
use crate::types::TimeStamp;
use chrono::Utc;
use std::collections::BTreeMap;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    #[n(0)]
    TransactionCreated,
    #[n(1)]
    ContractsExchanged,
    #[n(2)]
    CoolingOffStarted,
    #[n(3)]
    WentUnconditional,
    #[n(4)]
    ConditionSatisfied,
    #[n(5)]
    SettlingStarted,
    #[n(6)]
    Settled,
    #[n(7)]
    FellThrough,
    #[n(8)]
    DepositRecorded,
    #[n(9)]
    MilestoneCompleted,
    #[n(10)]
    ConveyancerAssigned,
}

/// One occurrence on a transaction. Appended at the moment it happens and
/// never mutated afterwards.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct TransactionEvent {
    #[n(0)]
    pub event_type: EventType,
    #[n(1)]
    pub title: String,
    #[n(2)]
    pub description: Option<String>,
    #[n(3)]
    pub metadata: BTreeMap<String, String>,
    #[n(4)]
    pub occurred_at: TimeStamp<Utc>,
    #[n(5)]
    pub actor: Actor,
}

impl TransactionEvent {
    pub fn new(
        event_type: EventType,
        title: impl Into<String>,
        occurred_at: TimeStamp<Utc>,
        actor: Actor,
    ) -> Self {
        Self {
            event_type,
            title: title.into(),
            description: None,
            metadata: BTreeMap::new(),
            occurred_at,
            actor,
        }
    }
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

//! Transaction progress checklist
//!
//! Milestones are display markers, not the state machine. One fixed set is
//! stamped out per transaction; each entry completes at most once.

use crate::party::Actor;
use crate::types::TimeStamp;
use chrono::Utc;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    #[n(0)]
    Buyer,
    #[n(1)]
    Seller,
    #[n(2)]
    Both,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Milestone {
    #[n(0)]
    pub name: String,
    #[n(1)]
    pub visibility: Visibility,
    #[n(2)]
    pub completed_at: Option<TimeStamp<Utc>>,
    #[n(3)]
    pub completed_by: Option<Actor>,
}

impl Milestone {
    pub fn is_completed(&self) -> bool {
        self.completed_at.is_some()
    }
}

pub const TEMPLATE: [(&str, Visibility); 12] = [
    ("Offer accepted", Visibility::Both),
    ("Conveyancer appointed", Visibility::Both),
    ("Contract of sale drafted", Visibility::Seller),
    ("Contract of sale reviewed", Visibility::Buyer),
    ("Deposit paid", Visibility::Buyer),
    ("Contracts exchanged", Visibility::Both),
    ("Cooling-off period ended", Visibility::Both),
    ("Finance approved", Visibility::Buyer),
    ("Building inspection completed", Visibility::Buyer),
    ("Pest inspection completed", Visibility::Buyer),
    ("Pre-settlement inspection completed", Visibility::Buyer),
    ("Settlement completed", Visibility::Both),
];

/// Fresh checklist for a newly created transaction.
pub fn checklist() -> Vec<Milestone> {
    TEMPLATE
        .iter()
        .map(|(name, visibility)| Milestone {
            name: (*name).to_string(),
            visibility: *visibility,
            completed_at: None,
            completed_by: None,
        })
        .collect()
}

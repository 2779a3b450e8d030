use crate::offer::OfferStatus;
use crate::transaction::TransactionStatus;

/// Data invariant violations caught at record creation, before anything
/// is persisted.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("offer amount must be greater than zero")]
    ZeroAmount,
    #[error("settlement period must be at least one day")]
    ZeroSettlementPeriod,
    #[error("finance type is not set")]
    MissingFinanceType,
    #[error("deposit {deposit} exceeds offer amount {amount}")]
    DepositExceedsAmount { deposit: u64, amount: u64 },
    #[error("proposing and receiving parties must differ")]
    SameParty,
    #[error("the property owner cannot open an offer on their own listing")]
    OwnerOffer,
    #[error("property {0} is not open to offers")]
    NotOfferable(String),
    #[error("deposit payment must be greater than zero")]
    ZeroDepositPayment,
}

/// Guard violations. These are expected outcomes of attempting an
/// operation from the wrong state, signalled as values for the caller to
/// branch on.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Denied {
    #[error("offer is {current:?}, cannot {action}")]
    OfferState {
        current: OfferStatus,
        action: &'static str,
    },
    #[error("offer has not reached its expiry yet")]
    NotYetExpired,
    #[error("transaction is {current:?}, cannot {action}")]
    TransactionState {
        current: TransactionStatus,
        action: &'static str,
    },
    #[error("conditions outstanding: {0}")]
    ConditionsOutstanding(String),
    #[error("cooling-off is not in effect")]
    CoolingOffNotInEffect,
    #[error("property {0} is no longer open to offers")]
    PropertyNotOfferable(String),
    #[error("milestone {0:?} has already been completed")]
    MilestoneCompleted(String),
    #[error("no milestone named {0:?} on this transaction")]
    UnknownMilestone(String),
}

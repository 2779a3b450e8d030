//! Offer records, negotiated terms and the offer state machine

use crate::error::{Denied, ValidationError};
use crate::party::BuyingEntity;
use crate::types::TimeStamp;
use chrono::{Duration, Utc};

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinanceType {
    #[n(0)]
    Cash,
    #[n(1)]
    PreApproved,
    #[n(2)]
    SubjectToFinance,
}

/// Subject-to clauses negotiated on an offer. Flags mark which clauses
/// apply; satisfaction is tracked on the transaction once one exists.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Default, PartialEq, Eq)]
pub struct ConditionFlags {
    #[n(0)]
    pub finance: bool,
    #[n(1)]
    pub building_inspection: bool,
    #[n(2)]
    pub pest_inspection: bool,
    #[n(3)]
    pub valuation: bool,
    #[n(4)]
    pub sale_of_other_property: bool,
    #[n(5)]
    pub other: Option<String>,
    #[n(6)]
    pub cooling_off_waived: bool,
}

impl ConditionFlags {
    pub fn any(&self) -> bool {
        self.finance
            || self.building_inspection
            || self.pest_inspection
            || self.valuation
            || self.sale_of_other_property
            || self.other.is_some()
    }

    pub fn list(&self) -> Vec<String> {
        let mut conditions = Vec::new();
        if self.finance {
            conditions.push("finance".to_string());
        }
        if self.building_inspection {
            conditions.push("building inspection".to_string());
        }
        if self.pest_inspection {
            conditions.push("pest inspection".to_string());
        }
        if self.valuation {
            conditions.push("valuation".to_string());
        }
        if self.sale_of_other_property {
            conditions.push("sale of another property".to_string());
        }
        if let Some(other) = &self.other {
            conditions.push(other.clone());
        }
        conditions
    }
}

// Also used for constructing drafts; validation runs when the draft is
// persisted, not on every setter.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Default, PartialEq, Eq)]
pub struct OfferTerms {
    #[n(0)]
    amount: u64,
    #[n(1)]
    deposit: u64,
    #[n(2)]
    finance: Option<FinanceType>,
    #[n(3)]
    settlement_days: u32,
    #[n(4)]
    conditions: ConditionFlags,
}

impl OfferTerms {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn set_amount(mut self, amount: u64) -> Self {
        self.amount = amount;
        self
    }
    pub fn set_deposit(mut self, deposit: u64) -> Self {
        self.deposit = deposit;
        self
    }
    pub fn set_finance(mut self, finance: FinanceType) -> Self {
        self.finance = Some(finance);
        self
    }
    pub fn set_settlement_days(mut self, days: u32) -> Self {
        self.settlement_days = days;
        self
    }
    pub fn set_conditions(mut self, conditions: ConditionFlags) -> Self {
        self.conditions = conditions;
        self
    }

    pub fn amount(&self) -> u64 {
        self.amount
    }
    pub fn deposit(&self) -> u64 {
        self.deposit
    }
    pub fn finance(&self) -> Option<FinanceType> {
        self.finance
    }
    pub fn settlement_days(&self) -> u32 {
        self.settlement_days
    }
    pub fn conditions(&self) -> &ConditionFlags {
        &self.conditions
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.amount == 0 {
            return Err(ValidationError::ZeroAmount);
        }
        if self.settlement_days == 0 {
            return Err(ValidationError::ZeroSettlementPeriod);
        }
        if self.finance.is_none() {
            return Err(ValidationError::MissingFinanceType);
        }
        if self.deposit > self.amount {
            return Err(ValidationError::DepositExceedsAmount {
                deposit: self.deposit,
                amount: self.amount,
            });
        }
        Ok(())
    }

    /// Merges a counter-proposal over these terms. Anything the counter
    /// does not override is inherited unchanged.
    pub fn counter(&self, counter: &CounterTerms) -> Result<OfferTerms, ValidationError> {
        let merged = OfferTerms {
            amount: counter.amount,
            deposit: counter.deposit.unwrap_or(self.deposit),
            finance: counter.finance.or(self.finance),
            settlement_days: counter.settlement_days.unwrap_or(self.settlement_days),
            conditions: counter
                .conditions
                .clone()
                .unwrap_or_else(|| self.conditions.clone()),
        };
        merged.validate()?;
        Ok(merged)
    }
}

/// A counter-proposal: a new amount plus any terms the countering party
/// wants to change.
#[derive(Debug, Clone, Default)]
pub struct CounterTerms {
    amount: u64,
    deposit: Option<u64>,
    finance: Option<FinanceType>,
    settlement_days: Option<u32>,
    conditions: Option<ConditionFlags>,
}

impl CounterTerms {
    pub fn new(amount: u64) -> Self {
        Self {
            amount,
            ..Self::default()
        }
    }
    pub fn set_deposit(mut self, deposit: u64) -> Self {
        self.deposit = Some(deposit);
        self
    }
    pub fn set_finance(mut self, finance: FinanceType) -> Self {
        self.finance = Some(finance);
        self
    }
    pub fn set_settlement_days(mut self, days: u32) -> Self {
        self.settlement_days = Some(days);
        self
    }
    pub fn set_conditions(mut self, conditions: ConditionFlags) -> Self {
        self.conditions = Some(conditions);
        self
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferStatus {
    #[n(0)]
    Draft,
    #[n(1)]
    Submitted,
    #[n(2)]
    Viewed,
    #[n(3)]
    Accepted,
    #[n(4)]
    Rejected,
    #[n(5)]
    Countered,
    #[n(6)]
    Withdrawn,
    #[n(7)]
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferEvent {
    Submit,
    View,
    Accept,
    Reject,
    Counter,
    Withdraw,
    Expire,
}

impl OfferStatus {
    /// Awaiting a response from the receiving party.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Submitted | Self::Viewed)
    }

    /// Reached an outcome that closes the offer to further action.
    pub fn is_finalized(self) -> bool {
        matches!(
            self,
            Self::Accepted | Self::Rejected | Self::Withdrawn | Self::Expired
        )
    }

    /// The transition table. Anything not listed here is an illegal
    /// transition and is rejected, not patched around.
    pub fn next(self, event: OfferEvent) -> Option<OfferStatus> {
        use OfferEvent::*;
        use OfferStatus::*;

        match (self, event) {
            (Draft, Submit) => Some(Submitted),
            (Submitted, View) => Some(Viewed),
            (Submitted | Viewed, Accept) => Some(Accepted),
            (Submitted | Viewed, Reject) => Some(Rejected),
            (Submitted | Viewed, Counter) => Some(Countered),
            (Draft | Submitted | Viewed | Countered, Withdraw) => Some(Withdrawn),
            (Submitted | Viewed, Expire) => Some(Expired),
            _ => None,
        }
    }
}

/// A proposal to buy a specific property.
///
/// The proposing/receiving pair replaces the usual buyer field: on an
/// opening offer the proposer is the would-be buyer, on a counter-offer
/// the roles are swapped, and the swap is visible in the record rather
/// than encoded by convention.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Offer {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub property_id: String,
    #[n(2)]
    pub proposing_party: String,
    #[n(3)]
    pub receiving_party: String,
    #[n(4)]
    pub buying_entity: Option<BuyingEntity>,
    #[n(5)]
    terms: OfferTerms,
    #[n(6)]
    status: OfferStatus,
    #[n(7)]
    parent_offer_id: Option<String>,
    #[n(8)]
    submitted_at: Option<TimeStamp<Utc>>,
    #[n(9)]
    viewed_at: Option<TimeStamp<Utc>>,
    #[n(10)]
    responded_at: Option<TimeStamp<Utc>>,
    #[n(11)]
    accepted_at: Option<TimeStamp<Utc>>,
    #[n(12)]
    rejected_at: Option<TimeStamp<Utc>>,
    #[n(13)]
    withdrawn_at: Option<TimeStamp<Utc>>,
    #[n(14)]
    expires_at: Option<TimeStamp<Utc>>,
    #[n(15)]
    seller_response: Option<String>,
}

impl Offer {
    /// Creates an opening offer in `Draft`. Party and term invariants are
    /// checked here, before anything touches storage.
    pub fn draft(
        id: String,
        property_id: String,
        proposing_party: String,
        receiving_party: String,
        buying_entity: Option<BuyingEntity>,
        terms: OfferTerms,
    ) -> Result<Self, ValidationError> {
        terms.validate()?;
        if proposing_party == receiving_party {
            return Err(ValidationError::SameParty);
        }

        Ok(Self {
            id,
            property_id,
            proposing_party,
            receiving_party,
            buying_entity,
            terms,
            status: OfferStatus::Draft,
            parent_offer_id: None,
            submitted_at: None,
            viewed_at: None,
            responded_at: None,
            accepted_at: None,
            rejected_at: None,
            withdrawn_at: None,
            expires_at: None,
            seller_response: None,
        })
    }

    fn transition(&mut self, event: OfferEvent, action: &'static str) -> Result<(), Denied> {
        match self.status.next(event) {
            Some(next) => {
                self.status = next;
                Ok(())
            }
            None => Err(Denied::OfferState {
                current: self.status,
                action,
            }),
        }
    }

    pub fn submit(&mut self, now: TimeStamp<Utc>, validity_days: u32) -> Result<(), Denied> {
        self.transition(OfferEvent::Submit, "submit")?;
        self.expires_at =
            Some((now.to_datetime_utc() + Duration::days(validity_days as i64)).into());
        self.submitted_at = Some(now);
        Ok(())
    }

    pub fn mark_viewed(&mut self, now: TimeStamp<Utc>) -> Result<(), Denied> {
        self.transition(OfferEvent::View, "mark as viewed")?;
        self.viewed_at = Some(now);
        Ok(())
    }

    pub fn accept(
        &mut self,
        now: TimeStamp<Utc>,
        seller_response: Option<String>,
    ) -> Result<(), Denied> {
        self.transition(OfferEvent::Accept, "accept")?;
        self.accepted_at = Some(now.clone());
        self.responded_at = Some(now);
        self.seller_response = seller_response;
        Ok(())
    }

    pub fn reject(
        &mut self,
        now: TimeStamp<Utc>,
        seller_response: Option<String>,
    ) -> Result<(), Denied> {
        self.transition(OfferEvent::Reject, "reject")?;
        self.rejected_at = Some(now.clone());
        self.responded_at = Some(now);
        self.seller_response = seller_response;
        Ok(())
    }

    pub fn mark_countered(&mut self, now: TimeStamp<Utc>) -> Result<(), Denied> {
        self.transition(OfferEvent::Counter, "counter")?;
        self.responded_at = Some(now);
        Ok(())
    }

    pub fn withdraw(&mut self, now: TimeStamp<Utc>) -> Result<(), Denied> {
        self.transition(OfferEvent::Withdraw, "withdraw")?;
        self.withdrawn_at = Some(now);
        Ok(())
    }

    pub fn expire(&mut self, now: &TimeStamp<Utc>) -> Result<(), Denied> {
        if self.status.next(OfferEvent::Expire).is_none() {
            return Err(Denied::OfferState {
                current: self.status,
                action: "expire",
            });
        }
        if !self.expiry_passed(now) {
            return Err(Denied::NotYetExpired);
        }
        self.transition(OfferEvent::Expire, "expire")
    }

    /// Builds the counter-offer this offer produces: proposing and
    /// receiving parties swap, the parent pointer records the lineage, and
    /// the new record is born submitted with a fresh expiry window. The
    /// parent pointer is set here once and has no setter afterwards, which
    /// is what keeps the chain acyclic.
    pub fn spawn_counter(
        &self,
        id: String,
        terms: OfferTerms,
        now: TimeStamp<Utc>,
        validity_days: u32,
    ) -> Offer {
        Offer {
            id,
            property_id: self.property_id.clone(),
            proposing_party: self.receiving_party.clone(),
            receiving_party: self.proposing_party.clone(),
            buying_entity: self.buying_entity.clone(),
            terms,
            status: OfferStatus::Submitted,
            parent_offer_id: Some(self.id.clone()),
            submitted_at: Some(now.clone()),
            viewed_at: None,
            responded_at: None,
            accepted_at: None,
            rejected_at: None,
            withdrawn_at: None,
            expires_at: Some(
                (now.to_datetime_utc() + Duration::days(validity_days as i64)).into(),
            ),
            seller_response: None,
        }
    }

    pub fn status(&self) -> OfferStatus {
        self.status
    }
    pub fn terms(&self) -> &OfferTerms {
        &self.terms
    }
    pub fn parent_offer_id(&self) -> Option<&str> {
        self.parent_offer_id.as_deref()
    }
    pub fn submitted_at(&self) -> Option<&TimeStamp<Utc>> {
        self.submitted_at.as_ref()
    }
    pub fn viewed_at(&self) -> Option<&TimeStamp<Utc>> {
        self.viewed_at.as_ref()
    }
    pub fn responded_at(&self) -> Option<&TimeStamp<Utc>> {
        self.responded_at.as_ref()
    }
    pub fn accepted_at(&self) -> Option<&TimeStamp<Utc>> {
        self.accepted_at.as_ref()
    }
    pub fn expires_at(&self) -> Option<&TimeStamp<Utc>> {
        self.expires_at.as_ref()
    }
    pub fn seller_response(&self) -> Option<&str> {
        self.seller_response.as_deref()
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }
    pub fn is_finalized(&self) -> bool {
        self.status.is_finalized()
    }

    pub fn expiry_passed(&self, now: &TimeStamp<Utc>) -> bool {
        self.expires_at.as_ref().is_some_and(|e| e.is_past(now))
    }

    /// What a timeline displays as expired: either the sweep got to it, or
    /// the clock ran out before anyone finalized it.
    pub fn is_expired(&self, now: &TimeStamp<Utc>) -> bool {
        self.status == OfferStatus::Expired
            || (self.expiry_passed(now) && !self.status.is_finalized())
    }

    pub fn has_conditions(&self) -> bool {
        self.terms.conditions.any()
    }
    pub fn conditions_list(&self) -> Vec<String> {
        self.terms.conditions.list()
    }

    /// The party on the buying side of this proposal, whichever direction
    /// the negotiation is currently pointing.
    pub fn buyer_party(&self, property_owner: &str) -> &str {
        if self.proposing_party == property_owner {
            &self.receiving_party
        } else {
            &self.proposing_party
        }
    }
}

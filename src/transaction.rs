//! Settlement transactions and the lifecycle state machine

use crate::calendar;
use crate::error::Denied;
use crate::event::{EventType, TransactionEvent};
use crate::milestone::{self, Milestone};
use crate::offer::{FinanceType, Offer};
use crate::party::{Actor, BuyingEntity, Side};
use crate::property::PropertyCard;
use crate::types::TimeStamp;
use chrono::{Duration, Utc};

pub const RESCISSION_REASON: &str = "Rescinded during cooling-off period";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionKind {
    Finance,
    BuildingInspection,
    PestInspection,
}

impl ConditionKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::Finance => "finance",
            Self::BuildingInspection => "building inspection",
            Self::PestInspection => "pest inspection",
        }
    }
}

/// Tracks the subject-to clauses a transaction must clear. A condition the
/// offer never flagged is vacuously satisfied.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Default, PartialEq, Eq)]
pub struct ConditionGate {
    #[n(0)]
    finance_required: bool,
    #[n(1)]
    finance_satisfied_at: Option<TimeStamp<Utc>>,
    #[n(2)]
    building_required: bool,
    #[n(3)]
    building_satisfied_at: Option<TimeStamp<Utc>>,
    #[n(4)]
    pest_required: bool,
    #[n(5)]
    pest_satisfied_at: Option<TimeStamp<Utc>>,
}

impl ConditionGate {
    pub fn from_offer(offer: &Offer) -> Self {
        let flags = offer.terms().conditions();
        Self {
            finance_required: flags.finance
                || offer.terms().finance() == Some(FinanceType::SubjectToFinance),
            building_required: flags.building_inspection,
            pest_required: flags.pest_inspection,
            ..Self::default()
        }
    }

    fn slot(&mut self, kind: ConditionKind) -> &mut Option<TimeStamp<Utc>> {
        match kind {
            ConditionKind::Finance => &mut self.finance_satisfied_at,
            ConditionKind::BuildingInspection => &mut self.building_satisfied_at,
            ConditionKind::PestInspection => &mut self.pest_satisfied_at,
        }
    }

    /// Records satisfaction. Returns false if the condition was already
    /// satisfied; the original timestamp is kept.
    pub fn satisfy(&mut self, kind: ConditionKind, now: TimeStamp<Utc>) -> bool {
        let slot = self.slot(kind);
        if slot.is_some() {
            return false;
        }
        *slot = Some(now);
        true
    }

    pub fn is_required(&self, kind: ConditionKind) -> bool {
        match kind {
            ConditionKind::Finance => self.finance_required,
            ConditionKind::BuildingInspection => self.building_required,
            ConditionKind::PestInspection => self.pest_required,
        }
    }

    pub fn satisfied_at(&self, kind: ConditionKind) -> Option<&TimeStamp<Utc>> {
        match kind {
            ConditionKind::Finance => self.finance_satisfied_at.as_ref(),
            ConditionKind::BuildingInspection => self.building_satisfied_at.as_ref(),
            ConditionKind::PestInspection => self.pest_satisfied_at.as_ref(),
        }
    }

    pub fn outstanding(&self) -> Vec<&'static str> {
        [
            ConditionKind::Finance,
            ConditionKind::BuildingInspection,
            ConditionKind::PestInspection,
        ]
        .into_iter()
        .filter(|kind| self.is_required(*kind) && self.satisfied_at(*kind).is_none())
        .map(ConditionKind::label)
        .collect()
    }

    pub fn all_satisfied(&self) -> bool {
        self.outstanding().is_empty()
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    #[n(0)]
    Pending,
    #[n(1)]
    Exchanged,
    #[n(2)]
    CoolingOff,
    #[n(3)]
    Unconditional,
    #[n(4)]
    Settling,
    #[n(5)]
    Settled,
    #[n(6)]
    FallenThrough,
}

impl TransactionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Settled | Self::FallenThrough)
    }
}

/// The binding sale created when an offer is accepted. Lives forever;
/// the two terminal states absorb every further action.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub property_id: String,
    #[n(2)]
    pub offer_id: String,
    #[n(3)]
    pub seller_party: String,
    #[n(4)]
    pub buyer_party: String,
    #[n(5)]
    pub seller_entity: Option<BuyingEntity>,
    #[n(6)]
    pub buyer_entity: Option<BuyingEntity>,
    #[n(7)]
    seller_conveyancer: Option<String>,
    #[n(8)]
    buyer_conveyancer: Option<String>,
    #[n(9)]
    pub sale_price: u64,
    #[n(10)]
    pub deposit_total: u64,
    #[n(11)]
    deposit_paid: u64,
    #[n(12)]
    status: TransactionStatus,
    #[n(13)]
    exchange_date: Option<TimeStamp<Utc>>,
    #[n(14)]
    pub settlement_date: TimeStamp<Utc>,
    #[n(15)]
    cooling_off_ends_at: Option<TimeStamp<Utc>>,
    #[n(16)]
    cooling_off_waived: bool,
    #[n(17)]
    conditions: ConditionGate,
    #[n(18)]
    settled_at: Option<TimeStamp<Utc>>,
    #[n(19)]
    fell_through_at: Option<TimeStamp<Utc>>,
    #[n(20)]
    fall_through_reason: Option<String>,
    #[n(21)]
    events: Vec<TransactionEvent>,
    #[n(22)]
    milestones: Vec<Milestone>,
}

impl Transaction {
    /// Seeds a transaction from the accepted offer: sale price from the
    /// offer amount, deposit from the offer deposit, settlement date from
    /// the negotiated period. The buyer is whichever party of the offer is
    /// not the property owner, so counter-offer depth does not matter.
    pub fn open(id: String, offer: &Offer, property: &PropertyCard, now: TimeStamp<Utc>) -> Self {
        let buyer_party = offer.buyer_party(&property.owner).to_string();
        let settlement_date = (now.to_datetime_utc()
            + Duration::days(offer.terms().settlement_days() as i64))
        .into();

        let mut txn = Self {
            id,
            property_id: property.id.clone(),
            offer_id: offer.id.clone(),
            seller_party: property.owner.clone(),
            buyer_party,
            seller_entity: None,
            buyer_entity: offer.buying_entity.clone(),
            seller_conveyancer: None,
            buyer_conveyancer: None,
            sale_price: offer.terms().amount(),
            deposit_total: offer.terms().deposit(),
            deposit_paid: 0,
            status: TransactionStatus::Pending,
            exchange_date: None,
            settlement_date,
            cooling_off_ends_at: None,
            cooling_off_waived: offer.terms().conditions().cooling_off_waived,
            conditions: ConditionGate::from_offer(offer),
            settled_at: None,
            fell_through_at: None,
            fall_through_reason: None,
            events: Vec::new(),
            milestones: milestone::checklist(),
        };
        txn.log(
            TransactionEvent::new(
                EventType::TransactionCreated,
                "Transaction created",
                now,
                Actor::System,
            )
            .with_meta("offer_id", &txn.offer_id)
            .with_meta("sale_price", txn.sale_price.to_string()),
        );
        txn
    }

    // the append-only ledger; entries are pushed and never touched again
    fn log(&mut self, event: TransactionEvent) {
        self.events.push(event);
    }

    fn deny(&self, action: &'static str) -> Denied {
        Denied::TransactionState {
            current: self.status,
            action,
        }
    }

    pub fn exchange(&mut self, exchange_date: TimeStamp<Utc>, actor: Actor) -> Result<(), Denied> {
        if self.status != TransactionStatus::Pending {
            return Err(self.deny("exchange contracts"));
        }
        self.status = TransactionStatus::Exchanged;
        self.exchange_date = Some(exchange_date.clone());
        self.log(
            TransactionEvent::new(
                EventType::ContractsExchanged,
                "Contracts exchanged",
                exchange_date.clone(),
                actor,
            )
            .with_meta(
                "exchange_date",
                exchange_date.to_datetime_utc().to_rfc3339(),
            ),
        );
        Ok(())
    }

    /// Starts the cooling-off clock. The expiry defaults to the
    /// jurisdiction rule counted in business days from the exchange date.
    pub fn start_cooling_off(
        &mut self,
        ends_at: Option<TimeStamp<Utc>>,
        business_days: u32,
        now: TimeStamp<Utc>,
        actor: Actor,
    ) -> Result<(), Denied> {
        if self.status != TransactionStatus::Exchanged {
            return Err(self.deny("start cooling-off"));
        }
        let basis = self.exchange_date.clone().unwrap_or_else(|| now.clone());
        let ends_at = ends_at.unwrap_or_else(|| {
            calendar::add_business_days(basis.to_datetime_utc(), business_days).into()
        });
        self.status = TransactionStatus::CoolingOff;
        self.cooling_off_ends_at = Some(ends_at.clone());
        self.log(
            TransactionEvent::new(
                EventType::CoolingOffStarted,
                "Cooling-off period started",
                now,
                actor,
            )
            .with_meta("ends_at", ends_at.to_datetime_utc().to_rfc3339()),
        );
        Ok(())
    }

    pub fn go_unconditional(&mut self, now: TimeStamp<Utc>, actor: Actor) -> Result<(), Denied> {
        let allowed = self.status == TransactionStatus::CoolingOff
            || (self.status == TransactionStatus::Exchanged && self.cooling_off_waived);
        if !allowed {
            return Err(self.deny("go unconditional"));
        }
        self.status = TransactionStatus::Unconditional;
        self.log(TransactionEvent::new(
            EventType::WentUnconditional,
            "Went unconditional",
            now,
            actor,
        ));
        Ok(())
    }

    /// Records satisfaction of a condition. A no-op when the condition was
    /// already satisfied; either way, a transaction sitting in cooling-off
    /// with nothing outstanding and an expired clock advances to
    /// unconditional.
    pub fn satisfy_condition(
        &mut self,
        kind: ConditionKind,
        now: TimeStamp<Utc>,
        actor: Actor,
    ) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        let newly = self.conditions.satisfy(kind, now.clone());
        if newly {
            self.log(
                TransactionEvent::new(
                    EventType::ConditionSatisfied,
                    format!("Condition satisfied: {}", kind.label()),
                    now.clone(),
                    actor,
                )
                .with_meta("condition", kind.label()),
            );
        }
        self.auto_advance_if_ready(&now);
        newly
    }

    fn auto_advance_if_ready(&mut self, now: &TimeStamp<Utc>) {
        let expired = self
            .cooling_off_ends_at
            .as_ref()
            .is_some_and(|e| e.is_past(now));
        if self.status == TransactionStatus::CoolingOff
            && expired
            && self.conditions.all_satisfied()
        {
            self.status = TransactionStatus::Unconditional;
            self.log(
                TransactionEvent::new(
                    EventType::WentUnconditional,
                    "Went unconditional",
                    now.clone(),
                    Actor::System,
                )
                .with_description("cooling-off expired with no conditions outstanding"),
            );
        }
    }

    pub fn start_settling(&mut self, now: TimeStamp<Utc>, actor: Actor) -> Result<(), Denied> {
        if self.status != TransactionStatus::Unconditional {
            return Err(self.deny("start settling"));
        }
        let outstanding = self.conditions.outstanding();
        if !outstanding.is_empty() {
            return Err(Denied::ConditionsOutstanding(outstanding.join(", ")));
        }
        self.status = TransactionStatus::Settling;
        self.log(TransactionEvent::new(
            EventType::SettlingStarted,
            "Settlement started",
            now,
            actor,
        ));
        Ok(())
    }

    pub fn settle(&mut self, now: TimeStamp<Utc>, actor: Actor) -> Result<(), Denied> {
        if !matches!(
            self.status,
            TransactionStatus::Settling | TransactionStatus::Unconditional
        ) {
            return Err(self.deny("settle"));
        }
        self.status = TransactionStatus::Settled;
        self.settled_at = Some(now.clone());
        self.log(
            TransactionEvent::new(EventType::Settled, "Settlement completed", now, actor)
                .with_meta("sale_price", self.sale_price.to_string()),
        );
        Ok(())
    }

    pub fn fall_through(
        &mut self,
        reason: impl Into<String>,
        now: TimeStamp<Utc>,
        actor: Actor,
    ) -> Result<(), Denied> {
        if self.status.is_terminal() {
            return Err(self.deny("mark as fallen through"));
        }
        let reason = reason.into();
        self.status = TransactionStatus::FallenThrough;
        self.fell_through_at = Some(now.clone());
        self.fall_through_reason = Some(reason.clone());
        self.log(
            TransactionEvent::new(EventType::FellThrough, "Sale fell through", now, actor)
                .with_description(reason),
        );
        Ok(())
    }

    /// Backs out during cooling-off. Only valid while the cooling-off
    /// clock is genuinely running.
    pub fn rescind(
        &mut self,
        reason: Option<String>,
        now: TimeStamp<Utc>,
        actor: Actor,
    ) -> Result<(), Denied> {
        if !self.can_rescind(&now) {
            return Err(Denied::CoolingOffNotInEffect);
        }
        self.fall_through(
            reason.unwrap_or_else(|| RESCISSION_REASON.to_string()),
            now,
            actor,
        )
    }

    pub fn record_deposit(
        &mut self,
        amount: u64,
        now: TimeStamp<Utc>,
        actor: Actor,
    ) -> Result<(), Denied> {
        if self.status.is_terminal() {
            return Err(self.deny("record a deposit payment"));
        }
        self.deposit_paid += amount;
        self.log(
            TransactionEvent::new(EventType::DepositRecorded, "Deposit payment recorded", now, actor)
                .with_meta("amount", amount.to_string())
                .with_meta("paid_to_date", self.deposit_paid.to_string()),
        );
        Ok(())
    }

    pub fn complete_milestone(
        &mut self,
        name: &str,
        now: TimeStamp<Utc>,
        actor: Actor,
    ) -> Result<(), Denied> {
        let milestone = self
            .milestones
            .iter_mut()
            .find(|m| m.name == name)
            .ok_or_else(|| Denied::UnknownMilestone(name.to_string()))?;
        if milestone.is_completed() {
            return Err(Denied::MilestoneCompleted(name.to_string()));
        }
        milestone.completed_at = Some(now.clone());
        milestone.completed_by = Some(actor.clone());
        self.log(
            TransactionEvent::new(
                EventType::MilestoneCompleted,
                format!("Milestone completed: {name}"),
                now,
                actor,
            )
            .with_meta("milestone", name),
        );
        Ok(())
    }

    pub fn assign_conveyancer(
        &mut self,
        side: Side,
        party_id: String,
        now: TimeStamp<Utc>,
        actor: Actor,
    ) -> Result<(), Denied> {
        if self.status.is_terminal() {
            return Err(self.deny("assign a conveyancer"));
        }
        let label = match side {
            Side::Buyer => {
                self.buyer_conveyancer = Some(party_id.clone());
                "buyer"
            }
            Side::Seller => {
                self.seller_conveyancer = Some(party_id.clone());
                "seller"
            }
        };
        self.log(
            TransactionEvent::new(
                EventType::ConveyancerAssigned,
                format!("Conveyancer assigned for {label}"),
                now,
                actor,
            )
            .with_meta("side", label)
            .with_meta("party", party_id),
        );
        Ok(())
    }

    pub fn status(&self) -> TransactionStatus {
        self.status
    }
    pub fn exchange_date(&self) -> Option<&TimeStamp<Utc>> {
        self.exchange_date.as_ref()
    }
    pub fn cooling_off_ends_at(&self) -> Option<&TimeStamp<Utc>> {
        self.cooling_off_ends_at.as_ref()
    }
    pub fn cooling_off_waived(&self) -> bool {
        self.cooling_off_waived
    }
    pub fn conditions(&self) -> &ConditionGate {
        &self.conditions
    }
    pub fn settled_at(&self) -> Option<&TimeStamp<Utc>> {
        self.settled_at.as_ref()
    }
    pub fn fell_through_at(&self) -> Option<&TimeStamp<Utc>> {
        self.fell_through_at.as_ref()
    }
    pub fn fall_through_reason(&self) -> Option<&str> {
        self.fall_through_reason.as_deref()
    }
    pub fn deposit_paid(&self) -> u64 {
        self.deposit_paid
    }
    pub fn events(&self) -> &[TransactionEvent] {
        &self.events
    }
    pub fn milestones(&self) -> &[Milestone] {
        &self.milestones
    }
    pub fn conveyancer(&self, side: Side) -> Option<&str> {
        match side {
            Side::Buyer => self.buyer_conveyancer.as_deref(),
            Side::Seller => self.seller_conveyancer.as_deref(),
        }
    }

    pub fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }

    pub fn can_rescind(&self, now: &TimeStamp<Utc>) -> bool {
        self.status == TransactionStatus::CoolingOff
            && self
                .cooling_off_ends_at
                .as_ref()
                .is_some_and(|e| !e.is_past(now))
    }

    pub fn is_overdue(&self, now: &TimeStamp<Utc>) -> bool {
        self.is_active() && self.settlement_date.is_past(now)
    }

    pub fn days_until_settlement(&self, now: &TimeStamp<Utc>) -> i64 {
        (self.settlement_date.to_datetime_utc().date_naive()
            - now.to_datetime_utc().date_naive())
        .num_days()
    }

    pub fn all_conditions_satisfied(&self) -> bool {
        self.conditions.all_satisfied()
    }

    pub fn deposit_outstanding(&self) -> u64 {
        self.deposit_total.saturating_sub(self.deposit_paid)
    }
}

//! Service layer API for offer negotiation and settlement operations

use crate::error::{Denied, ValidationError};
use crate::notify::{NoopNotifier, Notifier, NotifyEvent};
use crate::offer::{CounterTerms, Offer, OfferStatus, OfferTerms};
use crate::party::{Actor, BuyingEntity, Side};
use crate::property::PropertyCard;
use crate::transaction::{ConditionKind, Transaction};
use crate::types::TimeStamp;
use crate::utils;
use sled::transaction::{
    ConflictableTransactionError, ConflictableTransactionResult, TransactionError,
    TransactionalTree,
};
use sled::Batch;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Knobs the jurisdiction or product sets once at startup.
#[derive(Debug, Clone, Copy)]
pub struct NegotiationRules {
    /// How long a submitted offer stays open, in calendar days.
    pub offer_validity_days: u32,
    /// Cooling-off length counted in business days from exchange.
    pub cooling_off_business_days: u32,
}

impl Default for NegotiationRules {
    fn default() -> Self {
        Self {
            offer_validity_days: 5,
            cooling_off_business_days: 5,
        }
    }
}

/// Why an atomic operation backed out. Carried through the sled
/// transaction machinery and unwrapped into the caller-facing error.
enum OpFailure {
    Guard(Denied),
    Missing(String),
    Codec(String),
}

impl OpFailure {
    fn into_error(self) -> anyhow::Error {
        match self {
            Self::Guard(denied) => anyhow::Error::new(denied),
            Self::Missing(what) => anyhow::anyhow!("{what} not found"),
            Self::Codec(message) => anyhow::anyhow!(message),
        }
    }
}

type TxResult<T> = ConflictableTransactionResult<T, OpFailure>;

fn abort<T>(failure: OpFailure) -> TxResult<T> {
    Err(ConflictableTransactionError::Abort(failure))
}

fn guard<T>(result: Result<T, Denied>) -> TxResult<T> {
    result.map_err(|denied| ConflictableTransactionError::Abort(OpFailure::Guard(denied)))
}

fn tx_load<T: for<'b> minicbor::Decode<'b, ()>>(
    tx: &TransactionalTree,
    kind: &str,
    id: &str,
) -> TxResult<T> {
    let Some(bytes) = tx.get(id.as_bytes())? else {
        return abort(OpFailure::Missing(format!("{kind} {id}")));
    };
    minicbor::decode(&bytes)
        .map_err(|e| ConflictableTransactionError::Abort(OpFailure::Codec(e.to_string())))
}

fn tx_save<T: minicbor::Encode<()>>(tx: &TransactionalTree, id: &str, record: &T) -> TxResult<()> {
    let bytes = minicbor::to_vec(record)
        .map_err(|e| ConflictableTransactionError::Abort(OpFailure::Codec(e.to_string())))?;
    tx.insert(id.as_bytes(), bytes)?;
    Ok(())
}

fn commit<T>(outcome: Result<T, TransactionError<OpFailure>>) -> anyhow::Result<T> {
    match outcome {
        Ok(value) => Ok(value),
        Err(TransactionError::Abort(failure)) => Err(failure.into_error()),
        Err(TransactionError::Storage(err)) => Err(err.into()),
    }
}

pub struct SettlementService {
    instance: Arc<sled::Db>,
    rules: NegotiationRules,
    notifier: Arc<dyn Notifier>,
}

impl SettlementService {
    pub fn new(instance: Arc<sled::Db>) -> Self {
        Self {
            instance,
            rules: NegotiationRules::default(),
            notifier: Arc::new(NoopNotifier),
        }
    }

    pub fn with_rules(mut self, rules: NegotiationRules) -> Self {
        self.rules = rules;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    fn persist<T: minicbor::Encode<()>>(&self, id: &str, record: &T) -> anyhow::Result<()> {
        self.instance.insert(id, minicbor::to_vec(record)?)?;
        Ok(())
    }

    fn load_offer(&self, offer_id: &str) -> anyhow::Result<Offer> {
        let bytes = self
            .instance
            .get(offer_id)?
            .ok_or_else(|| anyhow::anyhow!("offer {offer_id} not found"))?;
        Ok(minicbor::decode(&bytes)?)
    }

    fn load_transaction(&self, transaction_id: &str) -> anyhow::Result<Transaction> {
        let bytes = self
            .instance
            .get(transaction_id)?
            .ok_or_else(|| anyhow::anyhow!("transaction {transaction_id} not found"))?;
        Ok(minicbor::decode(&bytes)?)
    }

    /// Registers the listing card the engine keeps for a property.
    pub fn register_property(
        &self,
        owner: String,
        asking_price: u64,
    ) -> anyhow::Result<PropertyCard> {
        let id = utils::new_uuid_to_bech32("prop_")?;
        let property = PropertyCard::new(id, owner, asking_price);
        self.persist(&property.id, &property)?;
        info!(property_id = %property.id, "property registered");
        Ok(property)
    }

    pub fn property(&self, property_id: &str) -> anyhow::Result<PropertyCard> {
        let bytes = self
            .instance
            .get(property_id)?
            .ok_or_else(|| anyhow::anyhow!("property {property_id} not found"))?;
        Ok(minicbor::decode(&bytes)?)
    }

    pub fn offer(&self, offer_id: &str) -> anyhow::Result<Offer> {
        self.load_offer(offer_id)
    }

    pub fn transaction(&self, transaction_id: &str) -> anyhow::Result<Transaction> {
        self.load_transaction(transaction_id)
    }

    /// Creates an opening offer in draft. The proposer must not own the
    /// listing, and the listing must still be open to offers.
    pub fn draft_offer(
        &self,
        property_id: &str,
        proposing_party: String,
        buying_entity: Option<BuyingEntity>,
        terms: OfferTerms,
    ) -> anyhow::Result<Offer> {
        let property = self.property(property_id)?;
        if !property.is_offerable() {
            return Err(anyhow::Error::new(ValidationError::NotOfferable(
                property_id.to_string(),
            )));
        }
        if proposing_party == property.owner {
            return Err(anyhow::Error::new(ValidationError::OwnerOffer));
        }

        let id = utils::new_uuid_to_bech32("offer_")?;
        let offer = Offer::draft(
            id,
            property.id.clone(),
            proposing_party,
            property.owner.clone(),
            buying_entity,
            terms,
        )
        .map_err(anyhow::Error::new)?;

        self.persist(&offer.id, &offer)?;
        debug!(offer_id = %offer.id, property_id, "offer drafted");
        Ok(offer)
    }

    /// Submits a drafted offer, starting its validity window.
    pub fn submit_offer(&self, offer_id: &str) -> anyhow::Result<Offer> {
        let mut offer = self.load_offer(offer_id)?;
        let property = self.property(&offer.property_id)?;
        if !property.is_offerable() {
            return Err(anyhow::Error::new(Denied::PropertyNotOfferable(
                property.id,
            )));
        }

        offer
            .submit(TimeStamp::new(), self.rules.offer_validity_days)
            .map_err(anyhow::Error::new)?;
        self.persist(offer_id, &offer)?;

        info!(offer_id, property_id = %offer.property_id, "offer submitted");
        self.notifier.notify(&NotifyEvent::OfferReceived {
            offer_id: offer.id.clone(),
            property_id: offer.property_id.clone(),
            to: offer.receiving_party.clone(),
        });
        Ok(offer)
    }

    pub fn mark_viewed(&self, offer_id: &str) -> anyhow::Result<Offer> {
        let mut offer = self.load_offer(offer_id)?;
        offer.mark_viewed(TimeStamp::new()).map_err(anyhow::Error::new)?;
        self.persist(offer_id, &offer)?;
        Ok(offer)
    }

    /// Accepts an offer. One atomic unit: the offer finalizes, the
    /// property goes under offer, and the transaction comes into being.
    /// Two accepts racing on one property serialize here; the loser sees
    /// a failed offerable check, never a half-applied state.
    pub fn accept_offer(
        &self,
        offer_id: &str,
        seller_response: Option<String>,
    ) -> anyhow::Result<(Offer, Transaction)> {
        let transaction_id = utils::new_uuid_to_bech32("txn_")?;

        let outcome = self.instance.transaction(|tx| {
            let mut offer: Offer = tx_load(tx, "offer", offer_id)?;
            let mut property: PropertyCard = tx_load(tx, "property", &offer.property_id)?;

            let now = TimeStamp::new();
            guard(offer.accept(now.clone(), seller_response.clone()))?;
            guard(property.mark_under_offer())?;
            let txn = Transaction::open(transaction_id.clone(), &offer, &property, now);

            tx_save(tx, &offer.id, &offer)?;
            tx_save(tx, &property.id, &property)?;
            tx_save(tx, &txn.id, &txn)?;
            Ok((offer, txn))
        });
        let (offer, txn) = commit(outcome)?;

        info!(
            offer_id,
            transaction_id = %txn.id,
            sale_price = txn.sale_price,
            "offer accepted, transaction opened"
        );
        self.notifier.notify(&NotifyEvent::OfferResponded {
            offer_id: offer.id.clone(),
            property_id: offer.property_id.clone(),
            to: offer.proposing_party.clone(),
            outcome: OfferStatus::Accepted,
        });
        Ok((offer, txn))
    }

    pub fn reject_offer(
        &self,
        offer_id: &str,
        seller_response: Option<String>,
    ) -> anyhow::Result<Offer> {
        let mut offer = self.load_offer(offer_id)?;
        offer
            .reject(TimeStamp::new(), seller_response)
            .map_err(anyhow::Error::new)?;
        self.persist(offer_id, &offer)?;

        info!(offer_id, "offer rejected");
        self.notifier.notify(&NotifyEvent::OfferResponded {
            offer_id: offer.id.clone(),
            property_id: offer.property_id.clone(),
            to: offer.proposing_party.clone(),
            outcome: OfferStatus::Rejected,
        });
        Ok(offer)
    }

    /// Counters an active offer: the original moves to countered and a new
    /// offer is minted with the proposing and receiving roles swapped.
    /// Both records land in one batch.
    pub fn counter_offer(
        &self,
        offer_id: &str,
        counter: &CounterTerms,
    ) -> anyhow::Result<Offer> {
        let mut original = self.load_offer(offer_id)?;
        let terms = original
            .terms()
            .counter(counter)
            .map_err(anyhow::Error::new)?;

        let now = TimeStamp::new();
        original.mark_countered(now.clone()).map_err(anyhow::Error::new)?;

        let id = utils::new_uuid_to_bech32("offer_")?;
        let counter_offer = original.spawn_counter(id, terms, now, self.rules.offer_validity_days);

        let mut batch = Batch::default();
        batch.insert(original.id.as_bytes(), minicbor::to_vec(&original)?);
        batch.insert(counter_offer.id.as_bytes(), minicbor::to_vec(&counter_offer)?);
        self.instance.apply_batch(batch)?;

        info!(
            offer_id,
            counter_offer_id = %counter_offer.id,
            amount = counter_offer.terms().amount(),
            "offer countered"
        );
        self.notifier.notify(&NotifyEvent::OfferResponded {
            offer_id: original.id.clone(),
            property_id: original.property_id.clone(),
            to: original.proposing_party.clone(),
            outcome: OfferStatus::Countered,
        });
        self.notifier.notify(&NotifyEvent::OfferReceived {
            offer_id: counter_offer.id.clone(),
            property_id: counter_offer.property_id.clone(),
            to: counter_offer.receiving_party.clone(),
        });
        Ok(counter_offer)
    }

    pub fn withdraw_offer(&self, offer_id: &str) -> anyhow::Result<Offer> {
        let mut offer = self.load_offer(offer_id)?;
        offer.withdraw(TimeStamp::new()).map_err(anyhow::Error::new)?;
        self.persist(offer_id, &offer)?;
        info!(offer_id, "offer withdrawn");
        Ok(offer)
    }

    pub fn expire_offer(&self, offer_id: &str) -> anyhow::Result<Offer> {
        let mut offer = self.load_offer(offer_id)?;
        offer.expire(&TimeStamp::new()).map_err(anyhow::Error::new)?;
        self.persist(offer_id, &offer)?;
        info!(offer_id, "offer expired");
        Ok(offer)
    }

    /// The periodic sweep: expires every active offer whose validity
    /// window has passed. Offers finalized by a user action between read
    /// and write lose the compare-and-swap and are skipped; a bad record
    /// is skipped too. Running the sweep twice changes nothing the second
    /// time.
    pub fn expire_overdue_offers(&self) -> anyhow::Result<usize> {
        let now = TimeStamp::new();
        let mut expired = 0usize;

        for entry in self.instance.scan_prefix("offer_") {
            let (key, bytes) = match entry {
                Ok(kv) => kv,
                Err(err) => {
                    warn!(error = %err, "sweep failed to read an offer record");
                    continue;
                }
            };
            let mut offer: Offer = match minicbor::decode(&bytes) {
                Ok(offer) => offer,
                Err(err) => {
                    warn!(error = %err, "sweep skipped an undecodable offer record");
                    continue;
                }
            };

            if offer.expire(&now).is_err() {
                continue;
            }
            let updated = match minicbor::to_vec(&offer) {
                Ok(updated) => updated,
                Err(err) => {
                    warn!(offer_id = %offer.id, error = %err, "sweep failed to encode an offer");
                    continue;
                }
            };

            match self
                .instance
                .compare_and_swap(&key, Some(&bytes), Some(updated))
            {
                Ok(Ok(())) => {
                    info!(offer_id = %offer.id, "offer expired by sweep");
                    expired += 1;
                }
                Ok(Err(_)) => {
                    debug!(offer_id = %offer.id, "offer changed mid-sweep, skipped");
                }
                Err(err) => {
                    warn!(offer_id = %offer.id, error = %err, "sweep failed to store an offer");
                }
            }
        }

        Ok(expired)
    }

    /// The negotiation history ending at the given offer, oldest first.
    pub fn offer_chain(&self, offer_id: &str) -> anyhow::Result<Vec<Offer>> {
        let mut chain = vec![self.load_offer(offer_id)?];
        while let Some(parent_id) = chain
            .last()
            .and_then(|offer| offer.parent_offer_id())
            .map(str::to_string)
        {
            chain.push(self.load_offer(&parent_id)?);
        }
        chain.reverse();
        Ok(chain)
    }

    pub fn exchange(
        &self,
        transaction_id: &str,
        exchange_date: Option<TimeStamp<chrono::Utc>>,
        actor: Actor,
    ) -> anyhow::Result<Transaction> {
        let mut txn = self.load_transaction(transaction_id)?;
        txn.exchange(exchange_date.unwrap_or_else(TimeStamp::new), actor)
            .map_err(anyhow::Error::new)?;
        self.persist(transaction_id, &txn)?;
        info!(transaction_id, "contracts exchanged");
        Ok(txn)
    }

    pub fn start_cooling_off(
        &self,
        transaction_id: &str,
        ends_at: Option<TimeStamp<chrono::Utc>>,
        actor: Actor,
    ) -> anyhow::Result<Transaction> {
        let mut txn = self.load_transaction(transaction_id)?;
        txn.start_cooling_off(
            ends_at,
            self.rules.cooling_off_business_days,
            TimeStamp::new(),
            actor,
        )
        .map_err(anyhow::Error::new)?;
        self.persist(transaction_id, &txn)?;
        info!(transaction_id, "cooling-off started");
        Ok(txn)
    }

    pub fn go_unconditional(
        &self,
        transaction_id: &str,
        actor: Actor,
    ) -> anyhow::Result<Transaction> {
        let mut txn = self.load_transaction(transaction_id)?;
        txn.go_unconditional(TimeStamp::new(), actor)
            .map_err(anyhow::Error::new)?;
        self.persist(transaction_id, &txn)?;
        info!(transaction_id, "transaction unconditional");
        Ok(txn)
    }

    fn satisfy_condition(
        &self,
        transaction_id: &str,
        kind: ConditionKind,
        actor: Actor,
    ) -> anyhow::Result<Transaction> {
        let mut txn = self.load_transaction(transaction_id)?;
        let newly = txn.satisfy_condition(kind, TimeStamp::new(), actor);
        self.persist(transaction_id, &txn)?;
        debug!(
            transaction_id,
            condition = kind.label(),
            newly_satisfied = newly,
            status = ?txn.status(),
            "condition recorded"
        );
        Ok(txn)
    }

    pub fn approve_finance(&self, transaction_id: &str, actor: Actor) -> anyhow::Result<Transaction> {
        self.satisfy_condition(transaction_id, ConditionKind::Finance, actor)
    }

    pub fn pass_building_inspection(
        &self,
        transaction_id: &str,
        actor: Actor,
    ) -> anyhow::Result<Transaction> {
        self.satisfy_condition(transaction_id, ConditionKind::BuildingInspection, actor)
    }

    pub fn pass_pest_inspection(
        &self,
        transaction_id: &str,
        actor: Actor,
    ) -> anyhow::Result<Transaction> {
        self.satisfy_condition(transaction_id, ConditionKind::PestInspection, actor)
    }

    pub fn start_settling(&self, transaction_id: &str, actor: Actor) -> anyhow::Result<Transaction> {
        let mut txn = self.load_transaction(transaction_id)?;
        txn.start_settling(TimeStamp::new(), actor)
            .map_err(anyhow::Error::new)?;
        self.persist(transaction_id, &txn)?;
        info!(transaction_id, "settlement started");
        Ok(txn)
    }

    /// Completes the sale. One atomic unit: the transaction settles and
    /// the property is marked sold at the recorded sale price.
    pub fn settle(&self, transaction_id: &str, actor: Actor) -> anyhow::Result<Transaction> {
        let outcome = self.instance.transaction(|tx| {
            let mut txn: Transaction = tx_load(tx, "transaction", transaction_id)?;
            let mut property: PropertyCard = tx_load(tx, "property", &txn.property_id)?;

            guard(txn.settle(TimeStamp::new(), actor.clone()))?;
            property.mark_sold(txn.sale_price);

            tx_save(tx, &txn.id, &txn)?;
            tx_save(tx, &property.id, &property)?;
            Ok(txn)
        });
        let txn = commit(outcome)?;
        info!(transaction_id, sale_price = txn.sale_price, "transaction settled");
        Ok(txn)
    }

    fn terminate(
        &self,
        transaction_id: &str,
        reason: Option<String>,
        via_rescission: bool,
        actor: Actor,
    ) -> anyhow::Result<Transaction> {
        let outcome = self.instance.transaction(|tx| {
            let mut txn: Transaction = tx_load(tx, "transaction", transaction_id)?;
            let mut property: PropertyCard = tx_load(tx, "property", &txn.property_id)?;

            let now = TimeStamp::new();
            if via_rescission {
                guard(txn.rescind(reason.clone(), now, actor.clone()))?;
            } else {
                guard(txn.fall_through(
                    reason.clone().unwrap_or_default(),
                    now,
                    actor.clone(),
                ))?;
            }
            property.reactivate();

            tx_save(tx, &txn.id, &txn)?;
            tx_save(tx, &property.id, &property)?;
            Ok(txn)
        });
        let txn = commit(outcome)?;
        info!(
            transaction_id,
            reason = txn.fall_through_reason().unwrap_or(""),
            "transaction fell through"
        );
        Ok(txn)
    }

    /// Marks the sale as fallen through and releases the property back to
    /// market if it was under offer. One atomic unit.
    pub fn fall_through(
        &self,
        transaction_id: &str,
        reason: impl Into<String>,
        actor: Actor,
    ) -> anyhow::Result<Transaction> {
        self.terminate(transaction_id, Some(reason.into()), false, actor)
    }

    /// Buyer backs out during cooling-off. Valid only while the
    /// cooling-off clock is running.
    pub fn rescind(
        &self,
        transaction_id: &str,
        reason: Option<String>,
        actor: Actor,
    ) -> anyhow::Result<Transaction> {
        self.terminate(transaction_id, reason, true, actor)
    }

    pub fn record_deposit_payment(
        &self,
        transaction_id: &str,
        amount: u64,
        actor: Actor,
    ) -> anyhow::Result<Transaction> {
        if amount == 0 {
            return Err(anyhow::Error::new(ValidationError::ZeroDepositPayment));
        }
        let mut txn = self.load_transaction(transaction_id)?;
        txn.record_deposit(amount, TimeStamp::new(), actor)
            .map_err(anyhow::Error::new)?;
        self.persist(transaction_id, &txn)?;
        info!(
            transaction_id,
            amount,
            outstanding = txn.deposit_outstanding(),
            "deposit payment recorded"
        );
        Ok(txn)
    }

    pub fn complete_milestone(
        &self,
        transaction_id: &str,
        name: &str,
        actor: Actor,
    ) -> anyhow::Result<Transaction> {
        let mut txn = self.load_transaction(transaction_id)?;
        txn.complete_milestone(name, TimeStamp::new(), actor)
            .map_err(anyhow::Error::new)?;
        self.persist(transaction_id, &txn)?;
        debug!(transaction_id, milestone = name, "milestone completed");
        Ok(txn)
    }

    pub fn assign_conveyancer(
        &self,
        transaction_id: &str,
        side: Side,
        party_id: String,
        actor: Actor,
    ) -> anyhow::Result<Transaction> {
        let mut txn = self.load_transaction(transaction_id)?;
        txn.assign_conveyancer(side, party_id, TimeStamp::new(), actor)
            .map_err(anyhow::Error::new)?;
        self.persist(transaction_id, &txn)?;
        Ok(txn)
    }
}

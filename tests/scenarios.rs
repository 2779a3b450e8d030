//! End-to-end negotiation and settlement scenarios

use anyhow::Context;
use chrono::{Datelike, Duration, Timelike, Utc, Weekday};
use offer_settlement::{
    error::Denied,
    offer::{ConditionFlags, CounterTerms, FinanceType, OfferStatus, OfferTerms},
    party::Actor,
    property::ListingStatus,
    service::{NegotiationRules, SettlementService},
    transaction::{RESCISSION_REASON, TransactionStatus},
    types::TimeStamp,
    utils,
};
use sled::open;
use std::sync::Arc;
use tempfile::{TempDir, tempdir};

// Sled uses file-based locking, so every test opens its own database under
// a temp dir. Returning the TempDir keeps it alive for the test's duration.
fn new_service(db_name: &str) -> anyhow::Result<(TempDir, SettlementService)> {
    let temp_dir = tempdir()?;
    let db = open(temp_dir.path().join(db_name))?;
    db.clear()?;
    Ok((temp_dir, SettlementService::new(Arc::new(db))))
}

fn finance_terms() -> OfferTerms {
    OfferTerms::new()
        .set_amount(850_000)
        .set_deposit(85_000)
        .set_finance(FinanceType::SubjectToFinance)
        .set_settlement_days(42)
        .set_conditions(ConditionFlags {
            finance: true,
            ..Default::default()
        })
}

fn cash_terms() -> OfferTerms {
    OfferTerms::new()
        .set_amount(850_000)
        .set_deposit(85_000)
        .set_finance(FinanceType::Cash)
        .set_settlement_days(42)
}

#[test]
fn subject_to_finance_sale_walkthrough() -> anyhow::Result<()> {
    let (_guard, service) = new_service("walkthrough.db")?;

    let seller = utils::new_uuid_to_bech32("user_")?;
    let buyer = utils::new_uuid_to_bech32("user_")?;
    let property = service.register_property(seller.clone(), 900_000)?;

    let offer = service.draft_offer(&property.id, buyer.clone(), None, finance_terms())?;
    assert_eq!(offer.status(), OfferStatus::Draft);

    let offer = service
        .submit_offer(&offer.id)
        .context("offer failed on submit: ")?;
    assert!(offer.is_active());
    assert!(offer.has_conditions());
    assert_eq!(offer.conditions_list(), vec!["finance".to_string()]);

    let offer = service.mark_viewed(&offer.id)?;
    assert_eq!(offer.status(), OfferStatus::Viewed);

    let (offer, txn) = service
        .accept_offer(&offer.id, Some("Happy to proceed".into()))
        .context("offer failed on accept: ")?;
    assert_eq!(offer.status(), OfferStatus::Accepted);
    assert_eq!(txn.status(), TransactionStatus::Pending);
    assert_eq!(txn.sale_price, 850_000);
    assert_eq!(txn.deposit_total, 85_000);
    assert_eq!(txn.seller_party, seller);
    assert_eq!(txn.buyer_party, buyer);
    assert_eq!(txn.days_until_settlement(&TimeStamp::new()), 42);
    assert_eq!(
        service.property(&property.id)?.status(),
        ListingStatus::UnderOffer
    );

    // exchange on an upcoming Monday so the default cooling-off window is
    // easy to pin down
    let mut monday = Utc::now() + Duration::days(14);
    while monday.weekday() != Weekday::Mon {
        monday += Duration::days(1);
    }
    let txn = service.exchange(&txn.id, Some(monday.into()), Actor::party(&seller))?;
    assert_eq!(txn.status(), TransactionStatus::Exchanged);

    // five business days from a Monday is the following Monday
    let txn = service.start_cooling_off(&txn.id, None, Actor::System)?;
    assert_eq!(txn.status(), TransactionStatus::CoolingOff);
    let ends = txn.cooling_off_ends_at().unwrap().to_datetime_utc();
    assert_eq!(ends.date_naive(), (monday + Duration::days(7)).date_naive());
    assert_eq!(ends.weekday(), Weekday::Mon);
    assert_eq!((ends.hour(), ends.minute(), ends.second()), (23, 59, 59));

    // finance comes through while the clock is still running: the
    // condition is recorded but nothing advances
    let txn = service.approve_finance(&txn.id, Actor::party(&buyer))?;
    assert!(txn.all_conditions_satisfied());
    assert_eq!(txn.status(), TransactionStatus::CoolingOff);
    assert!(txn.can_rescind(&TimeStamp::new()));

    let txn = service.go_unconditional(&txn.id, Actor::System)?;
    let txn = service.start_settling(&txn.id, Actor::System)?;
    assert_eq!(txn.status(), TransactionStatus::Settling);

    let txn = service.settle(&txn.id, Actor::party(&seller))?;
    assert_eq!(txn.status(), TransactionStatus::Settled);
    assert!(!txn.is_active());
    assert!(txn.settled_at().is_some());

    let property = service.property(&property.id)?;
    assert_eq!(property.status(), ListingStatus::Sold);
    assert_eq!(property.sold_price(), Some(850_000));

    // the timeline kept every step: created, exchanged, cooling-off,
    // condition, unconditional, settling, settled
    assert_eq!(txn.events().len(), 7);
    Ok(())
}

#[test]
fn conditions_auto_advance_once_the_clock_has_lapsed() -> anyhow::Result<()> {
    let (_guard, service) = new_service("auto_advance.db")?;

    let seller = utils::new_uuid_to_bech32("user_")?;
    let buyer = utils::new_uuid_to_bech32("user_")?;
    let property = service.register_property(seller, 900_000)?;

    let terms = cash_terms().set_conditions(ConditionFlags {
        building_inspection: true,
        pest_inspection: true,
        ..Default::default()
    });
    let offer = service.draft_offer(&property.id, buyer.clone(), None, terms)?;
    service.submit_offer(&offer.id)?;
    let (_, txn) = service.accept_offer(&offer.id, None)?;

    service.exchange(&txn.id, None, Actor::System)?;
    // pin the cooling-off expiry in the past: the window has already lapsed
    let lapsed = (Utc::now() - Duration::days(1)).into();
    service.start_cooling_off(&txn.id, Some(lapsed), Actor::System)?;

    // one of two conditions satisfied: still cooling off
    let txn = service.pass_building_inspection(&txn.id, Actor::party(&buyer))?;
    assert_eq!(txn.status(), TransactionStatus::CoolingOff);
    assert!(!txn.all_conditions_satisfied());

    // the final condition call finds nothing outstanding and the clock
    // expired, so the transaction advances on its own
    let txn = service.pass_pest_inspection(&txn.id, Actor::party(&buyer))?;
    assert_eq!(txn.status(), TransactionStatus::Unconditional);
    Ok(())
}

#[test]
fn counter_offers_swap_roles_and_keep_the_chain() -> anyhow::Result<()> {
    let (_guard, service) = new_service("counter_chain.db")?;

    let seller = utils::new_uuid_to_bech32("user_")?;
    let buyer = utils::new_uuid_to_bech32("user_")?;
    let property = service.register_property(seller.clone(), 900_000)?;

    let offer = service.draft_offer(&property.id, buyer.clone(), None, cash_terms())?;
    let offer = service.submit_offer(&offer.id)?;

    // the seller counters at a higher price
    let first_counter = service.counter_offer(&offer.id, &CounterTerms::new(880_000))?;
    assert_eq!(first_counter.proposing_party, seller);
    assert_eq!(first_counter.receiving_party, buyer);
    assert_eq!(first_counter.status(), OfferStatus::Submitted);
    assert_eq!(first_counter.terms().amount(), 880_000);
    // untouched terms carry over from the original
    assert_eq!(first_counter.terms().settlement_days(), 42);
    assert_eq!(service.offer(&offer.id)?.status(), OfferStatus::Countered);

    // the buyer counters back; roles swap again
    let second_counter =
        service.counter_offer(&first_counter.id, &CounterTerms::new(860_000))?;
    assert_eq!(second_counter.proposing_party, buyer);
    assert_eq!(second_counter.receiving_party, seller);

    let chain = service.offer_chain(&second_counter.id)?;
    let ids: Vec<&str> = chain.iter().map(|o| o.id.as_str()).collect();
    assert_eq!(
        ids,
        vec![
            offer.id.as_str(),
            first_counter.id.as_str(),
            second_counter.id.as_str()
        ]
    );

    // accepting the buyer's counter still records the right sides
    let (_, txn) = service.accept_offer(&second_counter.id, None)?;
    assert_eq!(txn.seller_party, seller);
    assert_eq!(txn.buyer_party, buyer);
    assert_eq!(txn.sale_price, 860_000);
    Ok(())
}

#[test]
fn accepting_one_offer_locks_out_the_other() -> anyhow::Result<()> {
    let (_guard, service) = new_service("mutual_exclusion.db")?;

    let seller = utils::new_uuid_to_bech32("user_")?;
    let first_buyer = utils::new_uuid_to_bech32("user_")?;
    let second_buyer = utils::new_uuid_to_bech32("user_")?;
    let property = service.register_property(seller, 900_000)?;

    let first = service.draft_offer(&property.id, first_buyer, None, cash_terms())?;
    service.submit_offer(&first.id)?;
    let second = service.draft_offer(&property.id, second_buyer, None, cash_terms())?;
    service.submit_offer(&second.id)?;

    service.accept_offer(&first.id, None)?;

    // the loser observes a failed precondition, not a corrupted state
    let err = service.accept_offer(&second.id, None).unwrap_err();
    assert_eq!(
        err.downcast_ref::<Denied>(),
        Some(&Denied::PropertyNotOfferable(property.id.clone()))
    );
    assert_eq!(service.offer(&second.id)?.status(), OfferStatus::Submitted);

    // accepting the winner twice never mints a second transaction
    let err = service.accept_offer(&first.id, None).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<Denied>(),
        Some(Denied::OfferState { .. })
    ));

    // and the property takes no further offers
    let third_buyer = utils::new_uuid_to_bech32("user_")?;
    assert!(
        service
            .draft_offer(&property.id, third_buyer, None, cash_terms())
            .is_err()
    );
    Ok(())
}

#[test]
fn fall_through_releases_the_property() -> anyhow::Result<()> {
    let (_guard, service) = new_service("fall_through.db")?;

    let seller = utils::new_uuid_to_bech32("user_")?;
    let buyer = utils::new_uuid_to_bech32("user_")?;
    let property = service.register_property(seller, 900_000)?;

    let offer = service.draft_offer(&property.id, buyer, None, cash_terms())?;
    service.submit_offer(&offer.id)?;
    let (_, txn) = service.accept_offer(&offer.id, None)?;
    assert_eq!(
        service.property(&property.id)?.status(),
        ListingStatus::UnderOffer
    );

    let txn = service.fall_through(&txn.id, "finance declined", Actor::System)?;
    assert_eq!(txn.status(), TransactionStatus::FallenThrough);
    assert_eq!(txn.fall_through_reason(), Some("finance declined"));
    assert_eq!(service.property(&property.id)?.status(), ListingStatus::Active);

    // the listing is back on market and can take a fresh offer
    let next_buyer = utils::new_uuid_to_bech32("user_")?;
    assert!(
        service
            .draft_offer(&property.id, next_buyer, None, cash_terms())
            .is_ok()
    );
    Ok(())
}

#[test]
fn terminal_states_absorb_all_further_operations() -> anyhow::Result<()> {
    let (_guard, service) = new_service("terminal.db")?;

    let seller = utils::new_uuid_to_bech32("user_")?;
    let buyer = utils::new_uuid_to_bech32("user_")?;
    let property = service.register_property(seller, 900_000)?;

    // waived cooling-off is the short path to settlement
    let terms = cash_terms().set_conditions(ConditionFlags {
        cooling_off_waived: true,
        ..Default::default()
    });
    let offer = service.draft_offer(&property.id, buyer, None, terms)?;
    service.submit_offer(&offer.id)?;
    let (_, txn) = service.accept_offer(&offer.id, None)?;
    service.exchange(&txn.id, None, Actor::System)?;
    service.go_unconditional(&txn.id, Actor::System)?;
    let txn = service.settle(&txn.id, Actor::System)?;
    assert_eq!(txn.status(), TransactionStatus::Settled);

    assert!(service.fall_through(&txn.id, "too late", Actor::System).is_err());
    assert!(service.exchange(&txn.id, None, Actor::System).is_err());
    assert!(service.settle(&txn.id, Actor::System).is_err());
    assert!(
        service
            .record_deposit_payment(&txn.id, 1_000, Actor::System)
            .is_err()
    );
    // the sold listing never reverts
    assert_eq!(service.property(&property.id)?.status(), ListingStatus::Sold);
    Ok(())
}

#[test]
fn rescission_is_bounded_by_the_cooling_off_clock() -> anyhow::Result<()> {
    let (_guard, service) = new_service("rescind.db")?;

    let seller = utils::new_uuid_to_bech32("user_")?;
    let buyer = utils::new_uuid_to_bech32("user_")?;
    let property = service.register_property(seller, 900_000)?;

    let offer = service.draft_offer(&property.id, buyer.clone(), None, cash_terms())?;
    service.submit_offer(&offer.id)?;
    let (_, txn) = service.accept_offer(&offer.id, None)?;
    service.exchange(&txn.id, None, Actor::System)?;

    // clock still running: rescission goes through with the stock reason
    let running = (Utc::now() + Duration::days(3)).into();
    service.start_cooling_off(&txn.id, Some(running), Actor::System)?;
    let txn = service.rescind(&txn.id, None, Actor::party(&buyer))?;
    assert_eq!(txn.status(), TransactionStatus::FallenThrough);
    assert_eq!(txn.fall_through_reason(), Some(RESCISSION_REASON));
    assert_eq!(service.property(&property.id)?.status(), ListingStatus::Active);

    // clock already lapsed: rescission is denied
    let offer = service.draft_offer(&property.id, buyer.clone(), None, cash_terms())?;
    service.submit_offer(&offer.id)?;
    let (_, txn) = service.accept_offer(&offer.id, None)?;
    service.exchange(&txn.id, None, Actor::System)?;
    let lapsed = (Utc::now() - Duration::days(1)).into();
    service.start_cooling_off(&txn.id, Some(lapsed), Actor::System)?;

    let err = service.rescind(&txn.id, None, Actor::party(&buyer)).unwrap_err();
    assert_eq!(
        err.downcast_ref::<Denied>(),
        Some(&Denied::CoolingOffNotInEffect)
    );
    Ok(())
}

#[test]
fn deposit_payments_accumulate_against_the_total() -> anyhow::Result<()> {
    let (_guard, service) = new_service("deposit.db")?;

    let seller = utils::new_uuid_to_bech32("user_")?;
    let buyer = utils::new_uuid_to_bech32("user_")?;
    let property = service.register_property(seller, 900_000)?;

    let offer = service.draft_offer(&property.id, buyer.clone(), None, cash_terms())?;
    service.submit_offer(&offer.id)?;
    let (_, txn) = service.accept_offer(&offer.id, None)?;
    assert_eq!(txn.deposit_outstanding(), 85_000);

    let txn = service.record_deposit_payment(&txn.id, 50_000, Actor::party(&buyer))?;
    assert_eq!(txn.deposit_paid(), 50_000);
    assert_eq!(txn.deposit_outstanding(), 35_000);

    let txn = service.record_deposit_payment(&txn.id, 35_000, Actor::party(&buyer))?;
    assert_eq!(txn.deposit_outstanding(), 0);

    assert!(
        service
            .record_deposit_payment(&txn.id, 0, Actor::party(&buyer))
            .is_err()
    );
    Ok(())
}

#[test]
fn expiry_sweep_is_idempotent_and_skips_finalized_offers() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let db = open(temp_dir.path().join("sweep.db"))?;
    db.clear()?;
    // a zero-day validity window makes every submitted offer immediately
    // sweepable
    let service = SettlementService::new(Arc::new(db)).with_rules(NegotiationRules {
        offer_validity_days: 0,
        cooling_off_business_days: 5,
    });

    let seller = utils::new_uuid_to_bech32("user_")?;
    let mut submitted = Vec::new();
    for _ in 0..3 {
        let buyer = utils::new_uuid_to_bech32("user_")?;
        let property = service.register_property(seller.clone(), 900_000)?;
        let offer = service.draft_offer(&property.id, buyer, None, cash_terms())?;
        submitted.push(service.submit_offer(&offer.id)?);
    }

    // one of them gets accepted before the sweep runs
    service.accept_offer(&submitted[2].id, None)?;

    assert_eq!(service.expire_overdue_offers()?, 2);
    assert_eq!(service.offer(&submitted[0].id)?.status(), OfferStatus::Expired);
    assert_eq!(service.offer(&submitted[1].id)?.status(), OfferStatus::Expired);
    assert_eq!(service.offer(&submitted[2].id)?.status(), OfferStatus::Accepted);

    // the second pass finds nothing left to do
    assert_eq!(service.expire_overdue_offers()?, 0);
    Ok(())
}

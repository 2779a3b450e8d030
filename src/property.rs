//! The slice of the listing aggregate this engine reads and mutates
//!
//! Listing CRUD, search and presentation live elsewhere. The card below
//! carries only what offer acceptance and settlement need: who owns the
//! property and whether it can still receive offers.

use crate::error::Denied;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListingStatus {
    #[n(0)]
    Active,
    #[n(1)]
    UnderOffer,
    #[n(2)]
    Sold,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct PropertyCard {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub owner: String, // party id
    #[n(2)]
    pub asking_price: u64,
    #[n(3)]
    status: ListingStatus,
    #[n(4)]
    sold_price: Option<u64>,
}

impl PropertyCard {
    pub fn new(id: String, owner: String, asking_price: u64) -> Self {
        Self {
            id,
            owner,
            asking_price,
            status: ListingStatus::Active,
            sold_price: None,
        }
    }

    pub fn status(&self) -> ListingStatus {
        self.status
    }

    pub fn sold_price(&self) -> Option<u64> {
        self.sold_price
    }

    pub fn is_offerable(&self) -> bool {
        self.status == ListingStatus::Active
    }

    pub fn mark_under_offer(&mut self) -> Result<(), Denied> {
        if !self.is_offerable() {
            return Err(Denied::PropertyNotOfferable(self.id.clone()));
        }
        self.status = ListingStatus::UnderOffer;
        Ok(())
    }

    pub fn mark_sold(&mut self, price: u64) {
        self.status = ListingStatus::Sold;
        self.sold_price = Some(price);
    }

    /// Reverts an under-offer listing to active. Sold listings stay sold.
    pub fn reactivate(&mut self) {
        if self.status == ListingStatus::UnderOffer {
            self.status = ListingStatus::Active;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn under_offer_blocks_further_offers() {
        let mut card = PropertyCard::new("prop_1test".into(), "user_1owner".into(), 900_000);
        assert!(card.is_offerable());

        card.mark_under_offer().unwrap();
        assert!(!card.is_offerable());
        assert_eq!(
            card.mark_under_offer(),
            Err(Denied::PropertyNotOfferable("prop_1test".into()))
        );
    }

    #[test]
    fn reactivate_leaves_sold_listings_alone() {
        let mut card = PropertyCard::new("prop_1test".into(), "user_1owner".into(), 900_000);
        card.mark_under_offer().unwrap();
        card.mark_sold(850_000);

        card.reactivate();

        assert_eq!(card.status(), ListingStatus::Sold);
        assert_eq!(card.sold_price(), Some(850_000));
    }
}

//! Party and entity identity types

/// Who performed a mutating operation. Attached to every audit event
/// rather than read from ambient state.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub enum Actor {
    #[n(0)]
    System,
    #[n(1)]
    Party(#[n(0)] String),
}

impl Actor {
    pub fn party(id: impl Into<String>) -> Self {
        Self::Party(id.into())
    }
    pub fn party_id(&self) -> Option<&str> {
        match self {
            Self::System => None,
            Self::Party(id) => Some(id),
        }
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    #[n(0)]
    Individual,
    #[n(1)]
    Company,
    #[n(2)]
    Trust,
}

/// The legal entity a party buys (or sells) through, when it is not the
/// party personally.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct BuyingEntity {
    #[n(0)]
    pub kind: EntityKind,
    #[n(1)]
    pub name: String,
}

impl BuyingEntity {
    pub fn new(kind: EntityKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }
}

/// Which side of a transaction a conveyancer or milestone belongs to.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    #[n(0)]
    Buyer,
    #[n(1)]
    Seller,
}

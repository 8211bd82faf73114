//! Domain records held in the client-side cache.
//!
//! Baseline state comes from the REST collaborator; push events only ever
//! carry partial patches of these records.

use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of cached entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Member,
    Bet,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::Member => write!(f, "member"),
            EntityKind::Bet => write!(f, "bet"),
        }
    }
}

/// Cache key: entity kind plus its server id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityRef {
    pub kind: EntityKind,
    pub id: String,
}

impl EntityRef {
    pub fn member(id: impl Into<String>) -> Self {
        Self {
            kind: EntityKind::Member,
            id: id.into(),
        }
    }

    pub fn bet(id: impl Into<String>) -> Self {
        Self {
            kind: EntityKind::Bet,
            id: id.into(),
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// A record that can be hydrated into the cache and read back typed.
pub trait Entity: Serialize + DeserializeOwned + Send + Sync {
    const KIND: EntityKind;

    fn id(&self) -> &str;

    fn entity_ref(&self) -> EntityRef {
        EntityRef {
            kind: Self::KIND,
            id: self.id().to_string(),
        }
    }
}

/// Account status of a member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MemberStatus {
    #[default]
    Active,
    Suspended,
    Locked,
    Closed,
}

/// Member account as returned by `GET /members/{id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Member {
    pub id: String,
    pub username: String,
    /// Upline agent, if any.
    #[serde(default)]
    pub agent_id: Option<String>,
    pub balance: Decimal,
    #[serde(default)]
    pub available_balance: Decimal,
    /// Rolling commission rate in percent.
    #[serde(default)]
    pub rolling_percent: Decimal,
    /// Accumulated rolling commission.
    #[serde(default)]
    pub rolling_amount: Decimal,
    #[serde(default)]
    pub status: MemberStatus,
}

impl Entity for Member {
    const KIND: EntityKind = EntityKind::Member;

    fn id(&self) -> &str {
        &self.id
    }
}

/// Lifecycle of a bet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BetStatus {
    #[default]
    Pending,
    Settled,
    Cancelled,
    Void,
}

/// Bet record as returned by `GET /bets/{id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bet {
    pub id: String,
    pub member_id: String,
    pub stake: Decimal,
    #[serde(default)]
    pub payout: Option<Decimal>,
    #[serde(default)]
    pub win_loss: Option<Decimal>,
    #[serde(default)]
    pub status: BetStatus,
}

impl Entity for Bet {
    const KIND: EntityKind = EntityKind::Bet;

    fn id(&self) -> &str {
        &self.id
    }
}

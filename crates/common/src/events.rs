//! Typed business events.
//!
//! Channel frames arrive keyed by a topic string; they are decoded once into
//! [`DomainEvent`] so that every consumer matches on a closed set of variants.

use crate::error::{Error, Result};
use crate::messages::Event;
use crate::models::{BetStatus, EntityRef, MemberStatus};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const BALANCE_CHANGED: &str = "balance-changed";
pub const ROLLING_UPDATED: &str = "rolling-updated";
pub const BETTING_UPDATED: &str = "betting-updated";
pub const STATUS_CHANGED: &str = "status-changed";

/// Topic names the client knows how to reconcile.
pub const KNOWN_EVENT_TYPES: [&str; 4] = [
    BALANCE_CHANGED,
    ROLLING_UPDATED,
    BETTING_UPDATED,
    STATUS_CHANGED,
];

/// Member balance moved (deposit, withdrawal, settlement).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceChanged {
    pub member_id: String,
    pub balance: Decimal,
    #[serde(default)]
    pub available_balance: Option<Decimal>,
    /// Free-form cause reported by the server; not stored on the member.
    #[serde(default)]
    pub reason: Option<String>,
}

/// Member rolling commission changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollingUpdated {
    pub member_id: String,
    #[serde(default)]
    pub rolling_percent: Option<Decimal>,
    #[serde(default)]
    pub rolling_amount: Option<Decimal>,
}

/// A bet was placed, settled or voided.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BettingUpdated {
    pub bet_id: String,
    pub member_id: String,
    pub status: BetStatus,
    #[serde(default)]
    pub stake: Option<Decimal>,
    #[serde(default)]
    pub payout: Option<Decimal>,
    #[serde(default)]
    pub win_loss: Option<Decimal>,
}

/// Member account status changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusChanged {
    pub member_id: String,
    pub status: MemberStatus,
}

/// Business event decoded from an [`Event`] frame.
#[derive(Debug, Clone, PartialEq)]
pub enum DomainEvent {
    BalanceChanged(BalanceChanged),
    RollingUpdated(RollingUpdated),
    BettingUpdated(BettingUpdated),
    StatusChanged(StatusChanged),
}

fn decode_payload<T: DeserializeOwned>(event: &Event) -> Result<T> {
    serde_json::from_value(event.data.clone()).map_err(|source| Error::InvalidPayload {
        event_type: event.event_type.clone(),
        source,
    })
}

fn put(fields: &mut Map<String, Value>, name: &str, value: impl Serialize) -> Result<()> {
    fields.insert(name.to_string(), serde_json::to_value(value)?);
    Ok(())
}

impl DomainEvent {
    /// Decode a channel event. Returns `Ok(None)` for topics this client does
    /// not reconcile.
    pub fn decode(event: &Event) -> Result<Option<Self>> {
        let decoded = match event.event_type.as_str() {
            BALANCE_CHANGED => DomainEvent::BalanceChanged(decode_payload(event)?),
            ROLLING_UPDATED => DomainEvent::RollingUpdated(decode_payload(event)?),
            BETTING_UPDATED => DomainEvent::BettingUpdated(decode_payload(event)?),
            STATUS_CHANGED => DomainEvent::StatusChanged(decode_payload(event)?),
            _ => return Ok(None),
        };
        Ok(Some(decoded))
    }

    /// Topic name of this event.
    pub fn event_type(&self) -> &'static str {
        match self {
            DomainEvent::BalanceChanged(_) => BALANCE_CHANGED,
            DomainEvent::RollingUpdated(_) => ROLLING_UPDATED,
            DomainEvent::BettingUpdated(_) => BETTING_UPDATED,
            DomainEvent::StatusChanged(_) => STATUS_CHANGED,
        }
    }

    /// Cached entity this event patches.
    pub fn target(&self) -> EntityRef {
        match self {
            DomainEvent::BalanceChanged(e) => EntityRef::member(&e.member_id),
            DomainEvent::RollingUpdated(e) => EntityRef::member(&e.member_id),
            DomainEvent::BettingUpdated(e) => EntityRef::bet(&e.bet_id),
            DomainEvent::StatusChanged(e) => EntityRef::member(&e.member_id),
        }
    }

    /// Field-level patch for the target entity. Only fields the event carries
    /// are present, so a merge leaves everything else untouched.
    pub fn patch(&self) -> Result<Map<String, Value>> {
        let mut fields = Map::new();
        match self {
            DomainEvent::BalanceChanged(e) => {
                put(&mut fields, "balance", e.balance)?;
                if let Some(available) = e.available_balance {
                    put(&mut fields, "available_balance", available)?;
                }
            }
            DomainEvent::RollingUpdated(e) => {
                if let Some(percent) = e.rolling_percent {
                    put(&mut fields, "rolling_percent", percent)?;
                }
                if let Some(amount) = e.rolling_amount {
                    put(&mut fields, "rolling_amount", amount)?;
                }
            }
            DomainEvent::BettingUpdated(e) => {
                put(&mut fields, "status", e.status)?;
                if let Some(stake) = e.stake {
                    put(&mut fields, "stake", stake)?;
                }
                if let Some(payout) = e.payout {
                    put(&mut fields, "payout", payout)?;
                }
                if let Some(win_loss) = e.win_loss {
                    put(&mut fields, "win_loss", win_loss)?;
                }
            }
            DomainEvent::StatusChanged(e) => {
                put(&mut fields, "status", e.status)?;
            }
        }
        Ok(fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EntityKind;
    use serde_json::json;
    use std::str::FromStr;

    fn event(event_type: &str, data: Value) -> Event {
        Event::new(event_type, 1, data, 0)
    }

    #[test]
    fn test_decode_balance_changed() {
        let e = event(
            BALANCE_CHANGED,
            json!({"member_id": "m1", "balance": "120.50", "reason": "deposit"}),
        );
        let decoded = DomainEvent::decode(&e).unwrap().unwrap();
        assert_eq!(decoded.target(), EntityRef::member("m1"));
        assert_eq!(decoded.event_type(), BALANCE_CHANGED);

        let patch = decoded.patch().unwrap();
        assert_eq!(patch.len(), 1);
        let balance: Decimal = serde_json::from_value(patch["balance"].clone()).unwrap();
        assert_eq!(balance, Decimal::from_str("120.50").unwrap());
    }

    #[test]
    fn test_rolling_patch_only_carries_present_fields() {
        let e = event(
            ROLLING_UPDATED,
            json!({"member_id": "m1", "rolling_amount": "3.2"}),
        );
        let patch = DomainEvent::decode(&e).unwrap().unwrap().patch().unwrap();
        assert!(patch.contains_key("rolling_amount"));
        assert!(!patch.contains_key("rolling_percent"));
    }

    #[test]
    fn test_betting_targets_bet() {
        let e = event(
            BETTING_UPDATED,
            json!({"bet_id": "b9", "member_id": "m1", "status": "settled", "payout": "40"}),
        );
        let decoded = DomainEvent::decode(&e).unwrap().unwrap();
        assert_eq!(decoded.target().kind, EntityKind::Bet);
        assert_eq!(decoded.patch().unwrap()["status"], "settled");
    }

    #[test]
    fn test_unknown_type_is_not_an_error() {
        let e = event("agent-created", json!({"agent_id": "a1"}));
        assert!(DomainEvent::decode(&e).unwrap().is_none());
    }

    #[test]
    fn test_invalid_payload() {
        let e = event(STATUS_CHANGED, json!({"member_id": "m1", "status": "unknown"}));
        match DomainEvent::decode(&e) {
            Err(Error::InvalidPayload { event_type, .. }) => assert_eq!(event_type, STATUS_CHANGED),
            other => panic!("expected invalid payload, got {:?}", other),
        }
    }
}

//! Document identity: entity kinds and composite keys.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// The kinds of documents mirrored by the cache manager.
///
/// Each kind has its own cache collection; nothing ties collections
/// together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Balances,
    Bank,
    Cooldowns,
    Currencies,
    Guilds,
    History,
    Inventory,
    Settings,
    Shop,
    Users,
}

impl EntityKind {
    /// Every kind, in declaration order.
    pub const ALL: [EntityKind; 10] = [
        Self::Balances,
        Self::Bank,
        Self::Cooldowns,
        Self::Currencies,
        Self::Guilds,
        Self::History,
        Self::Inventory,
        Self::Settings,
        Self::Shop,
        Self::Users,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Balances => "balances",
            Self::Bank => "bank",
            Self::Cooldowns => "cooldowns",
            Self::Currencies => "currencies",
            Self::Guilds => "guilds",
            Self::History => "history",
            Self::Inventory => "inventory",
            Self::Settings => "settings",
            Self::Shop => "shop",
            Self::Users => "users",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| StoreError::invalid_type(s, "unknown entity kind"))
    }
}

/// Owner-scope / entity-scope identifier of one document.
///
/// Guild-wide documents (settings, shop, currencies) carry no member id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CompositeKey {
    pub guild_id: String,
    pub member_id: Option<String>,
}

impl CompositeKey {
    /// Key for a member-scoped document.
    pub fn member(guild_id: impl Into<String>, member_id: impl Into<String>) -> Self {
        Self {
            guild_id: guild_id.into(),
            member_id: Some(member_id.into()),
        }
    }

    /// Key for a guild-wide document.
    pub fn guild(guild_id: impl Into<String>) -> Self {
        Self {
            guild_id: guild_id.into(),
            member_id: None,
        }
    }

    /// True for member-scoped keys, including an empty member id.
    pub fn is_member_scoped(&self) -> bool {
        self.member_id.is_some()
    }

    /// The member id, or `""` for guild-wide documents. Storage pairs it
    /// with [`is_member_scoped`](Self::is_member_scoped), since `""` is also
    /// a valid member id.
    pub fn member_or_empty(&self) -> &str {
        self.member_id.as_deref().unwrap_or("")
    }
}

impl fmt::Display for CompositeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.member_id {
            Some(member) => write!(f, "{}:{}", self.guild_id, member),
            None => f.write_str(&self.guild_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_round_trips_through_str() {
        for kind in EntityKind::ALL {
            assert_eq!(kind.as_str().parse::<EntityKind>().unwrap(), kind);
        }
        assert!("wallets".parse::<EntityKind>().is_err());
    }

    #[test]
    fn key_display() {
        assert_eq!(CompositeKey::member("g1", "u1").to_string(), "g1:u1");
        assert_eq!(CompositeKey::guild("g1").to_string(), "g1");
        assert_eq!(CompositeKey::guild("g1").member_or_empty(), "");
    }

    #[test]
    fn empty_member_is_not_the_guild() {
        let guild = CompositeKey::guild("g1");
        let member = CompositeKey::member("g1", "");
        assert_ne!(guild, member);
        assert!(!guild.is_member_scoped());
        assert!(member.is_member_scoped());
        assert_eq!(member.to_string(), "g1:");
    }
}

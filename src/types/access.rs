use std::fmt;

use serde::{Deserialize, Serialize};

/// A named rollout track. Declaration order is the natural channel order used
/// when falling back across allowed channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelName {
    Dev,
    Beta,
    Production,
}

impl ChannelName {
    pub const ALL: [ChannelName; 3] = [Self::Dev, Self::Beta, Self::Production];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Dev => "dev",
            Self::Beta => "beta",
            Self::Production => "production",
        }
    }

    pub fn parse(s: &str) -> Option<ChannelName> {
        match s {
            "dev" => Some(Self::Dev),
            "beta" => Some(Self::Beta),
            "production" => Some(Self::Production),
            _ => None,
        }
    }
}

impl fmt::Display for ChannelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Role of a user inside one tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Member,
    Player,
}

impl Role {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Member => "member",
            Self::Player => "player",
        }
    }

    pub fn parse(s: &str) -> Option<Role> {
        match s {
            "admin" => Some(Self::Admin),
            "member" => Some(Self::Member),
            "player" => Some(Self::Player),
            _ => None,
        }
    }
}

/// Membership attribute deciding which channels a reader may resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessLevel {
    All,
    Dev,
    Beta,
    #[default]
    Production,
}

impl AccessLevel {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::All => "all",
            Self::Dev => "dev",
            Self::Beta => "beta",
            Self::Production => "production",
        }
    }

    pub fn parse(s: &str) -> Option<AccessLevel> {
        match s {
            "all" => Some(Self::All),
            "dev" => Some(Self::Dev),
            "beta" => Some(Self::Beta),
            "production" => Some(Self::Production),
            _ => None,
        }
    }
}

/// Site-wide role of a user, independent of any tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GlobalRole {
    Admin,
    #[default]
    User,
}

impl GlobalRole {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::User => "user",
        }
    }

    pub fn parse(s: &str) -> Option<GlobalRole> {
        match s {
            "admin" => Some(Self::Admin),
            "user" => Some(Self::User),
            _ => None,
        }
    }
}

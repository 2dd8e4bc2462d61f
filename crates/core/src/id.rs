//! Strongly-typed identifiers used across the subsystem.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreError;

/// Identifier of the user owning a schedule or run.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(u64);

/// Identifier of a plugin (the target a schedule fires).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetId(u64);

/// Identifier of a persisted entity handed to a job (e.g. a briefing row).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(u64);

macro_rules! impl_numeric_newtype {
    ($t:ty, $name:literal) => {
        impl $t {
            pub const fn new(value: u64) -> Self {
                Self(value)
            }

            pub const fn get(&self) -> u64 {
                self.0
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                core::fmt::Display::fmt(&self.0, f)
            }
        }

        impl From<u64> for $t {
            fn from(value: u64) -> Self {
                Self(value)
            }
        }

        impl From<$t> for u64 {
            fn from(value: $t) -> Self {
                value.0
            }
        }

        impl FromStr for $t {
            type Err = CoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let value = s
                    .trim()
                    .parse::<u64>()
                    .map_err(|e| CoreError::invalid_id(format!("{}: {}", $name, e)))?;
                Ok(Self(value))
            }
        }
    };
}

impl_numeric_newtype!(OwnerId, "OwnerId");
impl_numeric_newtype!(TargetId, "TargetId");
impl_numeric_newtype!(EntityId, "EntityId");

/// Opaque identifier linking an execution request, its result and its run record.
///
/// Generated ids are UUIDv7 strings, but any non-empty string received from the
/// external executor is accepted as-is.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Generate a fresh, time-ordered correlation id.
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for CorrelationId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(CoreError::invalid_id("CorrelationId: empty"));
        }
        Ok(Self(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_ids_parse_and_display() {
        let owner: OwnerId = " 42 ".parse().unwrap();
        assert_eq!(owner, OwnerId::new(42));
        assert_eq!(owner.to_string(), "42");
        assert!("abc".parse::<TargetId>().is_err());
    }

    #[test]
    fn correlation_ids_are_unique_and_non_empty() {
        let a = CorrelationId::generate();
        let b = CorrelationId::generate();
        assert_ne!(a, b);
        assert!(!a.as_str().is_empty());
        assert!("   ".parse::<CorrelationId>().is_err());
    }

    #[test]
    fn correlation_id_serializes_as_plain_string() {
        let id: CorrelationId = "run-1".parse().unwrap();
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"run-1\"");
    }
}

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

/// Access tier of a caller, as asserted by the gateway.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Tier {
    #[default]
    Free,
    Premium,
    Admin,
}

/// Authenticated caller of the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller {
    pub owner_id: Uuid,
    pub tier: Tier,
}

/// Monthly extraction limits per tier.
#[derive(Debug, Clone, Copy)]
pub struct QuotaPolicy {
    pub free_limit: i64,
    pub premium_limit: i64,
}

impl QuotaPolicy {
    /// `None` means unlimited.
    pub fn limit_for(&self, tier: Tier) -> Option<i64> {
        match tier {
            Tier::Free => Some(self.free_limit),
            Tier::Premium => Some(self.premium_limit),
            Tier::Admin => None,
        }
    }

    /// Whether the tier may clone a public recipe instead of extracting again.
    pub fn can_clone_shared(&self, tier: Tier) -> bool {
        matches!(tier, Tier::Premium | Tier::Admin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn admin_is_unlimited() {
        let policy = QuotaPolicy {
            free_limit: 10,
            premium_limit: 200,
        };
        assert_eq!(policy.limit_for(Tier::Free), Some(10));
        assert_eq!(policy.limit_for(Tier::Premium), Some(200));
        assert_eq!(policy.limit_for(Tier::Admin), None);
        assert!(!policy.can_clone_shared(Tier::Free));
        assert!(policy.can_clone_shared(Tier::Premium));
    }

    #[test]
    fn tier_parses_header_values() {
        assert_eq!(Tier::from_str("premium").unwrap(), Tier::Premium);
        assert_eq!(Tier::from_str("ADMIN").unwrap(), Tier::Admin);
        assert!(Tier::from_str("gold").is_err());
    }
}

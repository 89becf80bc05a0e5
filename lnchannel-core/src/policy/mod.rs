/// Channel errors
#[macro_use]
pub mod error;
/// Channel parameter validation
pub mod validator;

use serde_derive::{Deserialize, Serialize};

/// The default minimum depth before the funding is considered locked
pub const DEFAULT_FUNDING_MIN_DEPTH: u32 = 3;

/// Local limits on what this party accepts from a counterparty.
///
/// Unlike [`crate::channel::ChannelSetup`], these are not negotiated and
/// need not match between the parties.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelPolicy {
    /// Smallest acceptable channel value
    pub min_channel_value_sat: u64,
    /// Largest acceptable channel value
    pub max_channel_value_sat: u64,
    /// Smallest relative delay we accept on our own to-us output
    pub min_to_self_delay: u16,
    /// Largest relative delay we accept on our own to-us output
    pub max_to_self_delay: u16,
    /// Smallest acceptable channel reserve
    pub min_reserve_sat: u64,
    /// Largest acceptable HTLC cap
    pub max_htlc_count: u16,
    /// Smallest acceptable HTLC amount
    pub min_htlc_sat: u64,
    /// Largest acceptable commitment fee
    pub max_commitment_fee_sat: u64,
    /// Largest acceptable cooperative closing fee
    pub max_closing_fee_sat: u64,
    /// Confirmations before the funding is considered locked
    pub funding_min_depth: u32,
}

impl Default for ChannelPolicy {
    fn default() -> Self {
        make_simple_policy()
    }
}

/// A policy with reasonable defaults
pub fn make_simple_policy() -> ChannelPolicy {
    ChannelPolicy {
        min_channel_value_sat: 10_000,
        max_channel_value_sat: 1_000_000_000,
        min_to_self_delay: 6,
        max_to_self_delay: 2016,
        min_reserve_sat: 0,
        max_htlc_count: 483,
        min_htlc_sat: 1,
        max_commitment_fee_sat: 50_000,
        max_closing_fee_sat: 50_000,
        funding_min_depth: DEFAULT_FUNDING_MIN_DEPTH,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_serde_defaults_test() {
        let policy: ChannelPolicy =
            serde_json::from_str(r#"{"max_htlc_count": 10, "funding_min_depth": 1}"#).unwrap();
        assert_eq!(policy.max_htlc_count, 10);
        assert_eq!(policy.funding_min_depth, 1);
        assert_eq!(policy.max_to_self_delay, make_simple_policy().max_to_self_delay);
    }
}

use bitcoin::blockdata::locktime::absolute::LOCK_TIME_THRESHOLD;
use bitcoin::Amount;

use super::error::ChannelError;
use super::ChannelPolicy;
use crate::channel::ChannelSetup;
use crate::prelude::*;
use crate::tx::tx::DUST_LIMIT_SAT;
use crate::Arc;

/// Validation of channel parameters and cooperative operations against local policy
pub trait Validator: SendSync {
    /// Validate the negotiated parameters at channel open
    fn validate_setup(&self, setup: &ChannelSetup) -> Result<(), ChannelError>;

    /// Validate a new conditional payment before it is offered or accepted
    fn validate_htlc(
        &self,
        setup: &ChannelSetup,
        amount_sat: u64,
        cltv_expiry: u32,
    ) -> Result<(), ChannelError>;

    /// Validate a cooperative closing fee
    fn validate_closing_fee(&self, setup: &ChannelSetup, fee_sat: u64)
        -> Result<(), ChannelError>;

    /// The local policy
    fn policy(&self) -> &ChannelPolicy;
}

/// A validator enforcing a [`ChannelPolicy`]
pub struct SimpleValidator {
    policy: ChannelPolicy,
}

impl SendSync for SimpleValidator {}

impl SimpleValidator {
    /// Create a validator for the policy
    pub fn new(policy: ChannelPolicy) -> Arc<dyn Validator> {
        Arc::new(SimpleValidator { policy })
    }
}

impl Validator for SimpleValidator {
    fn validate_setup(&self, setup: &ChannelSetup) -> Result<(), ChannelError> {
        let policy = &self.policy;
        if setup.channel_value_sat < policy.min_channel_value_sat {
            construction_err!(
                "channel value {} below minimum {}",
                setup.channel_value_sat,
                policy.min_channel_value_sat
            );
        }
        if setup.channel_value_sat > policy.max_channel_value_sat {
            construction_err!(
                "channel value {} above maximum {}",
                setup.channel_value_sat,
                policy.max_channel_value_sat
            );
        }
        if Amount::from_sat(setup.channel_value_sat) > Amount::MAX_MONEY {
            construction_err!("channel value {} exceeds max money", setup.channel_value_sat);
        }
        let delay = setup.counterparty_selected_contest_delay;
        if delay < policy.min_to_self_delay || delay > policy.max_to_self_delay {
            construction_err!(
                "to_self_delay {} outside [{}, {}]",
                delay,
                policy.min_to_self_delay,
                policy.max_to_self_delay
            );
        }
        if setup.holder_selected_contest_delay == 0 {
            construction_err!("counterparty to_self_delay must be nonzero");
        }
        if setup.channel_reserve_sat < policy.min_reserve_sat {
            construction_err!(
                "reserve {} below minimum {}",
                setup.channel_reserve_sat,
                policy.min_reserve_sat
            );
        }
        if setup.max_accepted_htlcs == 0 || setup.max_accepted_htlcs > policy.max_htlc_count {
            construction_err!(
                "max_accepted_htlcs {} outside [1, {}]",
                setup.max_accepted_htlcs,
                policy.max_htlc_count
            );
        }
        if setup.commitment_fee_sat > policy.max_commitment_fee_sat {
            construction_err!(
                "commitment fee {} above maximum {}",
                setup.commitment_fee_sat,
                policy.max_commitment_fee_sat
            );
        }
        if setup.holder_initial_sat > setup.channel_value_sat {
            construction_err!(
                "initial balance {} exceeds channel value {}",
                setup.holder_initial_sat,
                setup.channel_value_sat
            );
        }
        let initiator_initial = if setup.is_outbound {
            setup.holder_initial_sat
        } else {
            setup.channel_value_sat - setup.holder_initial_sat
        };
        if initiator_initial < setup.commitment_fee_sat {
            construction_err!(
                "initiator balance {} cannot pay commitment fee {}",
                initiator_initial,
                setup.commitment_fee_sat
            );
        }
        if setup.holder_funding_pubkey == setup.counterparty_funding_pubkey {
            construction_err!("holder and counterparty funding keys are identical");
        }
        Ok(())
    }

    fn validate_htlc(
        &self,
        setup: &ChannelSetup,
        amount_sat: u64,
        cltv_expiry: u32,
    ) -> Result<(), ChannelError> {
        if amount_sat > setup.channel_value_sat {
            update_rejected_err!(
                "htlc amount {} exceeds channel value {}",
                amount_sat,
                setup.channel_value_sat
            );
        }
        if amount_sat < self.policy.min_htlc_sat {
            update_rejected_err!(
                "htlc amount {} below minimum {}",
                amount_sat,
                self.policy.min_htlc_sat
            );
        }
        if cltv_expiry == 0 || cltv_expiry >= LOCK_TIME_THRESHOLD {
            update_rejected_err!("htlc expiry {} is not a block height", cltv_expiry);
        }
        Ok(())
    }

    fn validate_closing_fee(
        &self,
        setup: &ChannelSetup,
        fee_sat: u64,
    ) -> Result<(), ChannelError> {
        if fee_sat > self.policy.max_closing_fee_sat {
            update_rejected_err!(
                "closing fee {} above maximum {}",
                fee_sat,
                self.policy.max_closing_fee_sat
            );
        }
        if fee_sat + DUST_LIMIT_SAT > setup.channel_value_sat {
            update_rejected_err!("closing fee {} consumes the channel", fee_sat);
        }
        Ok(())
    }

    fn policy(&self) -> &ChannelPolicy {
        &self.policy
    }
}

/// A validator with the default policy
pub fn make_simple_validator() -> Arc<dyn Validator> {
    SimpleValidator::new(super::make_simple_policy())
}

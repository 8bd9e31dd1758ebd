//! Per-mode appointment inspection
//!
//! Each dispute-handler mode carries a fixed capability set: validate a
//! request before acceptance, decode the dispute deadline from a trigger
//! log, and check the post-condition after a response. The registry maps a
//! mode selector to its implementation; there is no open inheritance.

use std::collections::HashMap;
use std::sync::Arc;

use alloy::primitives::{eip191_hash_message, keccak256, Address, PrimitiveSignature, U256};
use alloy::sol_types::SolCall;
use async_trait::async_trait;
use tracing::debug;

use crate::appointment::Appointment;
use crate::chain::{ChainEndpoint, LogEntry, StateChannel};
use crate::error::{InspectionError, TowerError};

/// Protocol-specific checks for one dispute-handler mode.
#[async_trait]
pub trait Inspector: Send + Sync {
    /// Validate an appointment against on-chain state before acceptance.
    async fn inspect(
        &self,
        appointment: &Appointment,
        chain: &dyn ChainEndpoint,
    ) -> Result<(), TowerError>;

    /// Dispute deadline encoded in a trigger log, if the mode defines one.
    fn decode_time(&self, log: &LogEntry) -> Option<u64>;

    /// Whether the response logs satisfy the mode's post-condition.
    fn check_post(&self, logs: &[LogEntry]) -> bool;
}

/// Mode selectors recognised by the tower.
pub mod modes {
    /// Relay an opaque payload; structural checks only.
    pub const RELAY: u64 = 0;
    /// Respond to a state-channel dispute with a newer signed state.
    pub const STATE_CHANNEL: u64 = 1;
}

/// Mapping from mode selector to its inspector.
pub struct InspectorRegistry {
    by_mode: HashMap<u64, Arc<dyn Inspector>>,
}

impl InspectorRegistry {
    /// The standard mode set: relay and state-channel.
    pub fn standard(min_dispute_period: u64) -> Self {
        let mut by_mode: HashMap<u64, Arc<dyn Inspector>> = HashMap::new();
        by_mode.insert(modes::RELAY, Arc::new(RelayInspector));
        by_mode.insert(
            modes::STATE_CHANNEL,
            Arc::new(StateChannelInspector { min_dispute_period }),
        );
        Self { by_mode }
    }

    pub fn get(&self, mode: u64) -> Option<Arc<dyn Inspector>> {
        self.by_mode.get(&mode).cloned()
    }

    pub fn knows(&self, mode: u64) -> bool {
        self.by_mode.contains_key(&mode)
    }
}

/// Accepts any appointment whose payload is plausible calldata.
pub struct RelayInspector;

#[async_trait]
impl Inspector for RelayInspector {
    async fn inspect(
        &self,
        appointment: &Appointment,
        chain: &dyn ChainEndpoint,
    ) -> Result<(), TowerError> {
        if appointment.data.is_empty() {
            return Err(InspectionError::EmptyPayload.into());
        }
        let code = chain.code_at(appointment.contract_address).await?;
        if code.is_empty() {
            return Err(InspectionError::NoContractCode {
                address: format!("{:#x}", appointment.contract_address),
            }
            .into());
        }
        Ok(())
    }

    fn decode_time(&self, _log: &LogEntry) -> Option<u64> {
        None
    }

    fn check_post(&self, logs: &[LogEntry]) -> bool {
        !logs.is_empty()
    }
}

/// Inspector for state-channel dispute appointments.
///
/// The payload must be a `setstate(sigs, round, hstate)` call carrying a
/// round strictly newer than the channel's, signed by every participant,
/// against a channel whose dispute period leaves the tower room to respond.
pub struct StateChannelInspector {
    pub min_dispute_period: u64,
}

impl StateChannelInspector {
    /// Digest a participant signs to endorse `(hstate, round)` on a channel.
    fn state_digest(
        hstate: alloy::primitives::B256,
        round: U256,
        channel: Address,
    ) -> alloy::primitives::B256 {
        let mut buf = Vec::with_capacity(32 + 32 + 20);
        buf.extend_from_slice(hstate.as_slice());
        buf.extend_from_slice(&round.to_be_bytes::<32>());
        buf.extend_from_slice(channel.as_slice());
        eip191_hash_message(keccak256(&buf))
    }

    async fn read_round(
        &self,
        chain: &dyn ChainEndpoint,
        channel: Address,
    ) -> Result<u64, TowerError> {
        let ret = chain
            .call(channel, StateChannel::bestRoundCall {}.abi_encode().into())
            .await?;
        let decoded = StateChannel::bestRoundCall::abi_decode_returns(&ret, true)
            .map_err(|e| InspectionError::UndecodablePayload(e.to_string()))?;
        Ok(decoded._0.saturating_to())
    }

    async fn read_dispute_period(
        &self,
        chain: &dyn ChainEndpoint,
        channel: Address,
    ) -> Result<u64, TowerError> {
        let ret = chain
            .call(
                channel,
                StateChannel::disputePeriodCall {}.abi_encode().into(),
            )
            .await?;
        let decoded = StateChannel::disputePeriodCall::abi_decode_returns(&ret, true)
            .map_err(|e| InspectionError::UndecodablePayload(e.to_string()))?;
        Ok(decoded._0.saturating_to())
    }

    async fn read_participants(
        &self,
        chain: &dyn ChainEndpoint,
        channel: Address,
    ) -> Result<Vec<Address>, TowerError> {
        let ret = chain
            .call(
                channel,
                StateChannel::participantsCall {}.abi_encode().into(),
            )
            .await?;
        let decoded = StateChannel::participantsCall::abi_decode_returns(&ret, true)
            .map_err(|e| InspectionError::UndecodablePayload(e.to_string()))?;
        Ok(decoded.plist)
    }
}

#[async_trait]
impl Inspector for StateChannelInspector {
    async fn inspect(
        &self,
        appointment: &Appointment,
        chain: &dyn ChainEndpoint,
    ) -> Result<(), TowerError> {
        let channel = appointment.contract_address;

        let code = chain.code_at(channel).await?;
        if code.is_empty() {
            return Err(InspectionError::NoContractCode {
                address: format!("{channel:#x}"),
            }
            .into());
        }

        let call = StateChannel::setstateCall::abi_decode(&appointment.data, true)
            .map_err(|e| InspectionError::UndecodablePayload(e.to_string()))?;

        let onchain_round = self.read_round(chain, channel).await?;
        let claimed: u64 = call.round.saturating_to();
        if claimed <= onchain_round {
            return Err(InspectionError::StaleRound {
                claimed,
                onchain: onchain_round,
            }
            .into());
        }

        let period = self.read_dispute_period(chain, channel).await?;
        if period < self.min_dispute_period {
            return Err(InspectionError::DisputePeriodTooShort {
                period,
                minimum: self.min_dispute_period,
            }
            .into());
        }
        let head = chain.head_number().await?;
        let remaining = appointment.end_block.saturating_sub(head);
        if period >= remaining {
            return Err(InspectionError::DisputePeriodTooLong { period, remaining }.into());
        }

        let participants = self.read_participants(chain, channel).await?;
        let digest = Self::state_digest(call.hstate, call.round, channel);
        let mut signers = Vec::with_capacity(call.sigs.len());
        for sig in &call.sigs {
            let parsed = PrimitiveSignature::try_from(sig.as_ref())
                .map_err(|e| InspectionError::UndecodablePayload(e.to_string()))?;
            let signer = parsed
                .recover_address_from_prehash(&digest)
                .map_err(|e| InspectionError::UndecodablePayload(e.to_string()))?;
            signers.push(signer);
        }
        for participant in &participants {
            if !signers.contains(participant) {
                return Err(InspectionError::MissingParticipantSignature {
                    address: format!("{participant:#x}"),
                }
                .into());
            }
        }

        debug!(
            channel = %channel,
            round = claimed,
            participants = participants.len(),
            "state channel appointment inspected"
        );
        Ok(())
    }

    /// The trigger log's first data word carries the dispute deadline.
    fn decode_time(&self, log: &LogEntry) -> Option<u64> {
        if log.data.len() < 32 {
            return None;
        }
        let word = U256::from_be_slice(&log.data[..32]);
        u64::try_from(word).ok()
    }

    fn check_post(&self, logs: &[LogEntry]) -> bool {
        !logs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{BlockStub, ReceiptInfo};
    use crate::error::ProviderError;
    use alloy::primitives::{Bytes, B256};
    use alloy::signers::{local::PrivateKeySigner, SignerSync};
    use alloy::sol_types::SolValue;
    use std::sync::Mutex;

    /// Endpoint whose contract reads come from a script.
    struct ChannelChain {
        round: U256,
        dispute_period: U256,
        participants: Vec<Address>,
        code: Bytes,
        head: u64,
        calls: Mutex<Vec<Bytes>>,
    }

    #[async_trait]
    impl ChainEndpoint for ChannelChain {
        async fn chain_id(&self) -> Result<u64, ProviderError> {
            Ok(1)
        }
        async fn head_number(&self) -> Result<u64, ProviderError> {
            Ok(self.head)
        }
        async fn block_by_number(&self, _: u64) -> Result<Option<BlockStub>, ProviderError> {
            Ok(None)
        }
        async fn logs(&self, _: Address, _: u64, _: u64) -> Result<Vec<LogEntry>, ProviderError> {
            Ok(vec![])
        }
        async fn call(&self, _: Address, data: Bytes) -> Result<Bytes, ProviderError> {
            self.calls.lock().unwrap().push(data.clone());
            let selector: [u8; 4] = data[..4].try_into().unwrap();
            let ret = if selector == StateChannel::bestRoundCall::SELECTOR {
                self.round.abi_encode()
            } else if selector == StateChannel::disputePeriodCall::SELECTOR {
                self.dispute_period.abi_encode()
            } else if selector == StateChannel::participantsCall::SELECTOR {
                self.participants.abi_encode()
            } else {
                vec![]
            };
            Ok(Bytes::from(ret))
        }
        async fn code_at(&self, _: Address) -> Result<Bytes, ProviderError> {
            Ok(self.code.clone())
        }
        async fn gas_price(&self) -> Result<u128, ProviderError> {
            Ok(1)
        }
        async fn transaction_count(&self, _: Address) -> Result<u64, ProviderError> {
            Ok(0)
        }
        async fn send_raw(&self, _: Bytes) -> Result<B256, ProviderError> {
            Ok(B256::ZERO)
        }
        async fn transaction_receipt(&self, _: B256) -> Result<Option<ReceiptInfo>, ProviderError> {
            Ok(None)
        }
    }

    const KEY_A: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
    const KEY_B: &str = "0x59c6995e998f97a5a0044966f0945389dc9e86dae88c7a8412f4603b6b78690d";

    fn setstate_appointment(round: u64, signing_keys: &[&str]) -> (Appointment, Vec<Address>) {
        let channel = Address::repeat_byte(0x11);
        let hstate = B256::repeat_byte(0x77);
        let round = U256::from(round);
        let digest = StateChannelInspector::state_digest(hstate, round, channel);

        let mut participants = Vec::new();
        let mut sigs = Vec::new();
        for key in signing_keys {
            let signer: PrivateKeySigner = key.parse().unwrap();
            participants.push(signer.address());
            let sig = signer.sign_hash_sync(&digest).unwrap();
            sigs.push(Bytes::from(sig.as_bytes().to_vec()));
        }

        let data = StateChannel::setstateCall {
            sigs,
            round,
            hstate,
        }
        .abi_encode();

        let appointment = Appointment {
            contract_address: channel,
            customer_address: Address::repeat_byte(0x22),
            start_block: 1,
            end_block: 1_000,
            challenge_period: 100,
            customer_chosen_id: 1,
            job_id: 1,
            data: Bytes::from(data),
            refund: U256::ZERO,
            gas_limit: 200_000,
            mode: modes::STATE_CHANNEL,
            event_abi: "event EventDispute(uint256 indexed channel)".to_string(),
            event_args: Bytes::new(),
            pre_condition: Bytes::new(),
            post_condition: Bytes::new(),
            payment_hash: crate::appointment::free_tier_payment_hash(),
            customer_signature: Bytes::from(vec![0u8; 65]),
        };
        (appointment, participants)
    }

    fn chain_for(participants: Vec<Address>, round: u64, period: u64, head: u64) -> ChannelChain {
        ChannelChain {
            round: U256::from(round),
            dispute_period: U256::from(period),
            participants,
            code: Bytes::from(vec![0x60, 0x80]),
            head,
            calls: Mutex::new(vec![]),
        }
    }

    #[tokio::test]
    async fn test_state_channel_accepts_valid_appointment() {
        let (appointment, participants) = setstate_appointment(5, &[KEY_A, KEY_B]);
        let chain = chain_for(participants, 4, 50, 100);
        let inspector = StateChannelInspector {
            min_dispute_period: 20,
        };
        inspector.inspect(&appointment, &chain).await.unwrap();
    }

    #[tokio::test]
    async fn test_state_channel_rejects_stale_round() {
        let (appointment, participants) = setstate_appointment(5, &[KEY_A]);
        let chain = chain_for(participants, 5, 50, 100);
        let inspector = StateChannelInspector {
            min_dispute_period: 20,
        };
        let err = inspector.inspect(&appointment, &chain).await.unwrap_err();
        assert!(matches!(
            err,
            TowerError::Inspection(InspectionError::StaleRound { claimed: 5, onchain: 5 })
        ));
    }

    #[tokio::test]
    async fn test_state_channel_rejects_short_dispute_period() {
        let (appointment, participants) = setstate_appointment(5, &[KEY_A]);
        let chain = chain_for(participants, 4, 10, 100);
        let inspector = StateChannelInspector {
            min_dispute_period: 20,
        };
        let err = inspector.inspect(&appointment, &chain).await.unwrap_err();
        assert!(matches!(
            err,
            TowerError::Inspection(InspectionError::DisputePeriodTooShort { .. })
        ));
    }

    #[tokio::test]
    async fn test_state_channel_rejects_period_beyond_window() {
        let (appointment, participants) = setstate_appointment(5, &[KEY_A]);
        // remaining window is 1000 - 990 = 10, below the 50-block period
        let chain = chain_for(participants, 4, 50, 990);
        let inspector = StateChannelInspector {
            min_dispute_period: 20,
        };
        let err = inspector.inspect(&appointment, &chain).await.unwrap_err();
        assert!(matches!(
            err,
            TowerError::Inspection(InspectionError::DisputePeriodTooLong { .. })
        ));
    }

    #[tokio::test]
    async fn test_state_channel_requires_every_participant() {
        // B is a participant but only A signed
        let (appointment, _) = setstate_appointment(5, &[KEY_A]);
        let signer_b: PrivateKeySigner = KEY_B.parse().unwrap();
        let signer_a: PrivateKeySigner = KEY_A.parse().unwrap();
        let chain = chain_for(vec![signer_a.address(), signer_b.address()], 4, 50, 100);
        let inspector = StateChannelInspector {
            min_dispute_period: 20,
        };
        let err = inspector.inspect(&appointment, &chain).await.unwrap_err();
        assert!(matches!(
            err,
            TowerError::Inspection(InspectionError::MissingParticipantSignature { .. })
        ));
    }

    #[tokio::test]
    async fn test_relay_rejects_empty_payload_and_codeless_target() {
        let (mut appointment, participants) = setstate_appointment(5, &[KEY_A]);
        appointment.mode = modes::RELAY;

        let chain = chain_for(participants.clone(), 4, 50, 100);
        appointment.data = Bytes::new();
        let err = RelayInspector
            .inspect(&appointment, &chain)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TowerError::Inspection(InspectionError::EmptyPayload)
        ));

        appointment.data = Bytes::from(vec![1, 2, 3]);
        let codeless = ChannelChain {
            code: Bytes::new(),
            ..chain_for(participants, 4, 50, 100)
        };
        let err = RelayInspector
            .inspect(&appointment, &codeless)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TowerError::Inspection(InspectionError::NoContractCode { .. })
        ));
    }

    #[test]
    fn test_registry_modes() {
        let registry = InspectorRegistry::standard(20);
        assert!(registry.knows(modes::RELAY));
        assert!(registry.knows(modes::STATE_CHANNEL));
        assert!(!registry.knows(99));
        assert!(registry.get(modes::RELAY).is_some());
    }

    #[test]
    fn test_decode_time_reads_first_word() {
        let inspector = StateChannelInspector {
            min_dispute_period: 20,
        };
        let mut data = [0u8; 32];
        data[24..].copy_from_slice(&777u64.to_be_bytes());
        let log = LogEntry {
            address: Address::ZERO,
            topics: vec![],
            data: Bytes::from(data.to_vec()),
            block_hash: B256::ZERO,
            block_number: 1,
            tx_hash: B256::ZERO,
            log_index: 0,
        };
        assert_eq!(inspector.decode_time(&log), Some(777));

        let short = LogEntry {
            data: Bytes::from(vec![1, 2]),
            ..log
        };
        assert_eq!(inspector.decode_time(&short), None);
    }
}

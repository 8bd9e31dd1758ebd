//! Shared test fixtures: a scriptable chain endpoint and appointment
//! builders.

use std::collections::HashMap;
use std::sync::Mutex;

use alloy::primitives::{keccak256, Address, Bytes, B256, U256};
use alloy::signers::{local::PrivateKeySigner, SignerSync};
use async_trait::async_trait;

use pisa_tower::appointment::{free_tier_payment_hash, Appointment};
use pisa_tower::chain::{BlockStub, ChainEndpoint, LogEntry, ReceiptInfo};
use pisa_tower::error::ProviderError;
use pisa_tower::receipt::receipt_digest;

pub const CUSTOMER_KEY: &str =
    "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
pub const RESPONDER_KEY: &str =
    "0x59c6995e998f97a5a0044966f0945389dc9e86dae88c7a8412f4603b6b78690d";
pub const RECEIPT_KEY: &str =
    "0x5de4111afa1a4b94908f83103eb1f1706367c2e68ca870fc3fb9a804cdab365a";

pub const TOWER_CONTRACT: &str = "0x9999999999999999999999999999999999999999";

/// Scriptable in-process chain endpoint.
#[derive(Default)]
pub struct MockChain {
    pub blocks: Mutex<HashMap<u64, BlockStub>>,
    pub logs: Mutex<Vec<LogEntry>>,
    pub sent: Mutex<Vec<Bytes>>,
    pub receipts: Mutex<HashMap<B256, ReceiptInfo>>,
    /// every broadcast confirms instantly at this block
    pub confirm_at: Mutex<Option<u64>>,
    pub gas_price: Mutex<u128>,
    pub nonce: Mutex<u64>,
}

impl MockChain {
    pub fn new() -> Self {
        let chain = Self::default();
        *chain.gas_price.lock().unwrap() = 50;
        chain
    }

    /// Extend the scripted canonical chain to `height` with linear blocks.
    pub fn extend_to(&self, height: u64) {
        let mut blocks = self.blocks.lock().unwrap();
        for number in 1..=height {
            blocks.entry(number).or_insert_with(|| BlockStub {
                hash: block_hash(number, 0),
                parent: block_hash(number - 1, 0),
                number,
            });
        }
    }

    pub fn block(&self, number: u64) -> BlockStub {
        self.blocks.lock().unwrap()[&number]
    }

    pub fn push_log(&self, log: LogEntry) {
        self.logs.lock().unwrap().push(log);
    }

    pub fn confirm_broadcasts_at(&self, block: u64) {
        *self.confirm_at.lock().unwrap() = Some(block);
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    /// Raw transactions whose payload embeds the given bytes.
    pub fn sent_containing(&self, needle: &[u8]) -> usize {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|raw| contains(raw, needle))
            .count()
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    !needle.is_empty() && haystack.windows(needle.len()).any(|w| w == needle)
}

pub fn block_hash(number: u64, branch: u8) -> B256 {
    let mut bytes = [0u8; 32];
    bytes[0] = branch;
    bytes[24..].copy_from_slice(&number.to_be_bytes());
    B256::from(bytes)
}

#[async_trait]
impl ChainEndpoint for MockChain {
    async fn chain_id(&self) -> Result<u64, ProviderError> {
        Ok(1)
    }

    async fn head_number(&self) -> Result<u64, ProviderError> {
        Ok(*self.blocks.lock().unwrap().keys().max().unwrap_or(&0))
    }

    async fn block_by_number(&self, number: u64) -> Result<Option<BlockStub>, ProviderError> {
        Ok(self.blocks.lock().unwrap().get(&number).copied())
    }

    async fn logs(
        &self,
        address: Address,
        from: u64,
        to: u64,
    ) -> Result<Vec<LogEntry>, ProviderError> {
        Ok(self
            .logs
            .lock()
            .unwrap()
            .iter()
            .filter(|log| {
                log.address == address && log.block_number >= from && log.block_number <= to
            })
            .cloned()
            .collect())
    }

    async fn call(&self, _: Address, _: Bytes) -> Result<Bytes, ProviderError> {
        Ok(Bytes::new())
    }

    async fn code_at(&self, _: Address) -> Result<Bytes, ProviderError> {
        Ok(Bytes::from(vec![0x60, 0x80, 0x60, 0x40]))
    }

    async fn gas_price(&self) -> Result<u128, ProviderError> {
        Ok(*self.gas_price.lock().unwrap())
    }

    async fn transaction_count(&self, _: Address) -> Result<u64, ProviderError> {
        Ok(*self.nonce.lock().unwrap())
    }

    async fn send_raw(&self, tx: Bytes) -> Result<B256, ProviderError> {
        let hash = keccak256(&tx);
        self.sent.lock().unwrap().push(tx);
        if let Some(block) = *self.confirm_at.lock().unwrap() {
            self.receipts.lock().unwrap().insert(
                hash,
                ReceiptInfo {
                    block_hash: block_hash(block, 0),
                    block_number: block,
                    status: true,
                },
            );
        }
        Ok(hash)
    }

    async fn transaction_receipt(&self, hash: B256) -> Result<Option<ReceiptInfo>, ProviderError> {
        Ok(self.receipts.lock().unwrap().get(&hash).copied())
    }
}

/// An appointment signed by the customer, ready for admission.
pub fn signed_request(
    customer_chosen_id: u64,
    job_id: u64,
    contract: Address,
    data: Vec<u8>,
) -> Appointment {
    let customer: PrivateKeySigner = CUSTOMER_KEY.parse().unwrap();
    let mut appointment = Appointment {
        contract_address: contract,
        customer_address: customer.address(),
        start_block: 1,
        end_block: 500,
        challenge_period: 50,
        customer_chosen_id,
        job_id,
        data: Bytes::from(data),
        refund: U256::from(1_000_000u64),
        gas_limit: 200_000,
        mode: 0,
        event_abi: "event EventDispute(uint256 indexed channel, uint256 round)".to_string(),
        event_args: Bytes::new(),
        pre_condition: Bytes::new(),
        post_condition: Bytes::new(),
        payment_hash: free_tier_payment_hash(),
        customer_signature: Bytes::new(),
    };

    let tower: Address = TOWER_CONTRACT.parse().unwrap();
    let digest = receipt_digest(&appointment, tower);
    let signature = customer.sign_hash_sync(&digest).unwrap();
    appointment.customer_signature = Bytes::from(signature.as_bytes().to_vec());
    appointment
}

/// A log matching the standard `EventDispute` filter of `signed_request`.
pub fn dispute_log(contract: Address, height: u64, log_index: u64) -> LogEntry {
    LogEntry {
        address: contract,
        topics: vec![
            keccak256(b"EventDispute(uint256,uint256)"),
            B256::from(U256::from(1u64)),
        ],
        data: Bytes::new(),
        block_hash: block_hash(height, 0),
        block_number: height,
        tx_hash: keccak256([height as u8, log_index as u8]),
        log_index,
    }
}

//! Chain endpoint abstraction
//!
//! Every suspension point that talks to the chain lives behind
//! [`ChainEndpoint`]: block reads, log queries, contract calls and raw
//! transaction broadcast. The production implementation wraps an alloy HTTP
//! provider; tests drive the rest of the tower with scripted endpoints.

use std::time::Duration;

use alloy::primitives::{Address, Bytes, TxKind, B256, U256};
use alloy::providers::{Provider, RootProvider};
use alloy::rpc::types::{BlockNumberOrTag, BlockTransactionsKind, Filter, TransactionInput, TransactionRequest};
use alloy::sol;
use alloy::transports::http::{Client, Http};
use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::ProviderError;

sol! {
    /// Accountability contract surface consumed by the tower.
    interface PisaRegistry {
        /// Submit a response on behalf of a customer.
        function respond(
            address sc,
            address cus,
            uint256 appointmentId,
            uint256 jobId,
            bytes data,
            uint256 gas
        ) external;

        /// Shards of the dispute registry.
        function getDataShards() external view returns (uint256 shards);

        /// Records written by `respond` for `(shard, contract, appointment_id)`.
        /// Each record is the ABI encoding of `(block_number, keccak256(data))`.
        function fetchRecords(
            uint256 shard,
            address sc,
            uint256 appointmentId
        ) external view returns (bytes[] records);
    }
}

sol! {
    /// Read surface of a state-channel contract, used by its inspector.
    interface StateChannel {
        function bestRound() external view returns (uint256);
        function disputePeriod() external view returns (uint256);
        function participants() external view returns (address[] plist);

        /// The pre-agreed response payload for state-channel appointments.
        function setstate(bytes[] sigs, uint256 round, bytes32 hstate) external;
    }
}

/// Minimal block identity emitted by the block source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockStub {
    pub hash: B256,
    pub parent: B256,
    pub number: u64,
}

/// A log delivered by the subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
    pub block_hash: B256,
    pub block_number: u64,
    pub tx_hash: B256,
    pub log_index: u64,
}

impl LogEntry {
    /// Stable identity for retraction bookkeeping.
    pub fn key(&self) -> String {
        format!("{:#x}:{}", self.tx_hash, self.log_index)
    }
}

/// Inclusion evidence for a broadcast transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiptInfo {
    pub block_hash: B256,
    pub block_number: u64,
    pub status: bool,
}

/// The tower's view of the chain RPC endpoint.
#[async_trait]
pub trait ChainEndpoint: Send + Sync {
    async fn chain_id(&self) -> Result<u64, ProviderError>;

    async fn head_number(&self) -> Result<u64, ProviderError>;

    async fn block_by_number(&self, number: u64) -> Result<Option<BlockStub>, ProviderError>;

    async fn logs(
        &self,
        address: Address,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<LogEntry>, ProviderError>;

    async fn call(&self, to: Address, data: Bytes) -> Result<Bytes, ProviderError>;

    async fn code_at(&self, address: Address) -> Result<Bytes, ProviderError>;

    async fn gas_price(&self) -> Result<u128, ProviderError>;

    async fn transaction_count(&self, address: Address) -> Result<u64, ProviderError>;

    async fn send_raw(&self, tx: Bytes) -> Result<B256, ProviderError>;

    async fn transaction_receipt(&self, hash: B256) -> Result<Option<ReceiptInfo>, ProviderError>;
}

/// Alloy HTTP provider behind the [`ChainEndpoint`] seam.
pub struct HttpEndpoint {
    provider: RootProvider<Http<Client>>,
    retries: u32,
    retry_delay: Duration,
}

impl HttpEndpoint {
    pub fn connect(url: &str) -> Result<Self, ProviderError> {
        let parsed = url
            .parse()
            .map_err(|e| ProviderError::Rpc(format!("invalid RPC URL {url:?}: {e}")))?;
        Ok(Self {
            provider: RootProvider::new_http(parsed),
            retries: 3,
            retry_delay: Duration::from_millis(500),
        })
    }

    /// Retry a read with linear backoff. Writes (`send_raw`) are never
    /// retried here; the responder owns retry policy for broadcasts.
    async fn with_retry<T, F, Fut>(&self, label: &str, op: F) -> Result<T, ProviderError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, ProviderError>>,
    {
        let mut last = None;
        for attempt in 1..=self.retries {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    debug!(rpc = label, attempt, error = %e, "RPC attempt failed");
                    last = Some(e);
                    if attempt < self.retries {
                        tokio::time::sleep(self.retry_delay * attempt).await;
                    }
                }
            }
        }
        let err = last.unwrap_or_else(|| ProviderError::Rpc("no attempt made".into()));
        warn!(rpc = label, error = %err, "RPC failed after retries");
        Err(err)
    }
}

fn rpc_err<E: std::fmt::Display>(e: E) -> ProviderError {
    ProviderError::Rpc(e.to_string())
}

#[async_trait]
impl ChainEndpoint for HttpEndpoint {
    async fn chain_id(&self) -> Result<u64, ProviderError> {
        self.with_retry("eth_chainId", || async {
            self.provider.get_chain_id().await.map_err(rpc_err)
        })
        .await
    }

    async fn head_number(&self) -> Result<u64, ProviderError> {
        self.with_retry("eth_blockNumber", || async {
            self.provider.get_block_number().await.map_err(rpc_err)
        })
        .await
    }

    async fn block_by_number(&self, number: u64) -> Result<Option<BlockStub>, ProviderError> {
        self.with_retry("eth_getBlockByNumber", || async {
            let block = self
                .provider
                .get_block_by_number(
                    BlockNumberOrTag::Number(number),
                    BlockTransactionsKind::Hashes,
                )
                .await
                .map_err(rpc_err)?;
            Ok(block.map(|b| BlockStub {
                hash: b.header.hash,
                parent: b.header.parent_hash,
                number: b.header.number,
            }))
        })
        .await
    }

    async fn logs(
        &self,
        address: Address,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<LogEntry>, ProviderError> {
        self.with_retry("eth_getLogs", || async {
            let filter = Filter::new()
                .address(address)
                .from_block(from_block)
                .to_block(to_block);
            let logs = self.provider.get_logs(&filter).await.map_err(rpc_err)?;
            Ok(logs
                .into_iter()
                .filter_map(|log| {
                    // pending logs carry no block identity and cannot be
                    // retracted; drop them
                    let block_hash = log.block_hash?;
                    let block_number = log.block_number?;
                    Some(LogEntry {
                        address: log.address(),
                        topics: log.topics().to_vec(),
                        data: log.data().data.clone(),
                        block_hash,
                        block_number,
                        tx_hash: log.transaction_hash.unwrap_or_default(),
                        log_index: log.log_index.unwrap_or_default(),
                    })
                })
                .collect())
        })
        .await
    }

    async fn call(&self, to: Address, data: Bytes) -> Result<Bytes, ProviderError> {
        self.with_retry("eth_call", || async {
            let request = TransactionRequest {
                to: Some(TxKind::Call(to)),
                input: TransactionInput::new(data.clone()),
                ..Default::default()
            };
            self.provider.call(&request).await.map_err(rpc_err)
        })
        .await
    }

    async fn code_at(&self, address: Address) -> Result<Bytes, ProviderError> {
        self.with_retry("eth_getCode", || async {
            self.provider.get_code_at(address).await.map_err(rpc_err)
        })
        .await
    }

    async fn gas_price(&self) -> Result<u128, ProviderError> {
        self.with_retry("eth_gasPrice", || async {
            self.provider.get_gas_price().await.map_err(rpc_err)
        })
        .await
    }

    async fn transaction_count(&self, address: Address) -> Result<u64, ProviderError> {
        self.with_retry("eth_getTransactionCount", || async {
            self.provider
                .get_transaction_count(address)
                .await
                .map_err(rpc_err)
        })
        .await
    }

    async fn send_raw(&self, tx: Bytes) -> Result<B256, ProviderError> {
        let pending = self
            .provider
            .send_raw_transaction(&tx)
            .await
            .map_err(rpc_err)?;
        Ok(*pending.tx_hash())
    }

    async fn transaction_receipt(&self, hash: B256) -> Result<Option<ReceiptInfo>, ProviderError> {
        self.with_retry("eth_getTransactionReceipt", || async {
            let receipt = self
                .provider
                .get_transaction_receipt(hash)
                .await
                .map_err(rpc_err)?;
            Ok(receipt.and_then(|r| {
                Some(ReceiptInfo {
                    block_hash: r.block_hash?,
                    block_number: r.block_number?,
                    status: r.status(),
                })
            }))
        })
        .await
    }
}

/// Calldata for `PisaRegistry.respond` carrying an appointment's payload.
pub fn respond_calldata(
    sc: Address,
    cus: Address,
    customer_chosen_id: u64,
    job_id: u64,
    data: Bytes,
    gas: u64,
) -> Bytes {
    use alloy::sol_types::SolCall;

    let call = PisaRegistry::respondCall {
        sc,
        cus,
        appointmentId: U256::from(customer_chosen_id),
        jobId: U256::from(job_id),
        data,
        gas: U256::from(gas),
    };
    Bytes::from(call.abi_encode())
}

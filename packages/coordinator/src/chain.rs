//! Source-chain RPC capability
//!
//! The coordinator only needs a handful of reads from the source chain. They are
//! modelled as the [`ChainRpc`] trait so the pipeline can be driven by mocks in
//! tests; [`EvmChainRpc`] is the alloy-backed implementation with RPC fallback.

use alloy::primitives::{Address, U256};
use alloy::providers::{Provider, ProviderBuilder, RootProvider};
use alloy::sol;
use alloy::transports::http::{Client, Http};
use async_trait::async_trait;
use eyre::{Result, WrapErr};
use std::future::Future;
use tracing::warn;

use crate::error::TransferError;

sol! {
    /// ERC-20 + ERC-2612 subset used by the coordinator.
    #[sol(rpc)]
    interface IERC20Permit {
        function balanceOf(address account) external view returns (uint256);
        function nonces(address owner) external view returns (uint256);
    }
}

#[async_trait]
pub trait ChainRpc: Send + Sync {
    /// Next transaction sequence number for `address`
    async fn get_nonce(&self, address: Address) -> Result<u64, TransferError>;

    async fn get_gas_price(&self) -> Result<u128, TransferError>;

    /// Bridged token balance
    async fn balance_of(&self, owner: Address) -> Result<U256, TransferError>;

    /// ERC-2612 permit nonce of `owner`. Callers must not cache this value.
    async fn get_permit_nonce(&self, owner: Address) -> Result<U256, TransferError>;
}

/// Parse a comma-separated RPC URL string into individual trimmed URLs.
pub fn parse_rpc_urls(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Create alloy HTTP providers for each RPC URL.
pub fn create_providers(urls: &[String]) -> Result<Vec<RootProvider<Http<Client>>>> {
    if urls.is_empty() {
        return Err(eyre::eyre!("At least one RPC URL is required"));
    }
    urls.iter()
        .map(|url| {
            let parsed = url
                .parse()
                .wrap_err_with(|| format!("Invalid RPC URL: {}", url))?;
            Ok(ProviderBuilder::new().on_http(parsed))
        })
        .collect()
}

/// alloy-backed chain reads, trying each configured RPC in order
pub struct EvmChainRpc {
    providers: Vec<RootProvider<Http<Client>>>,
    token: Address,
}

impl EvmChainRpc {
    pub fn new(rpc_urls: &[String], token: Address) -> Result<Self> {
        Ok(Self {
            providers: create_providers(rpc_urls)?,
            token,
        })
    }

    async fn with_fallback<'a, T, F, Fut>(&'a self, op: &str, call: F) -> Result<T, TransferError>
    where
        F: Fn(&'a RootProvider<Http<Client>>) -> Fut,
        Fut: Future<Output = Result<T, String>> + 'a,
    {
        let mut last_error = String::from("no rpc providers configured");
        for (index, provider) in self.providers.iter().enumerate() {
            match call(provider).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    warn!(op, provider_index = index, error = %e, "RPC call failed, trying next provider");
                    last_error = e;
                }
            }
        }
        Err(TransferError::chain(format!("{}: {}", op, last_error)))
    }
}

#[async_trait]
impl ChainRpc for EvmChainRpc {
    async fn get_nonce(&self, address: Address) -> Result<u64, TransferError> {
        self.with_fallback("get_nonce", |provider| async move {
            provider
                .get_transaction_count(address)
                .await
                .map_err(|e| e.to_string())
        })
        .await
    }

    async fn get_gas_price(&self) -> Result<u128, TransferError> {
        self.with_fallback("get_gas_price", |provider| async move {
            provider.get_gas_price().await.map_err(|e| e.to_string())
        })
        .await
    }

    async fn balance_of(&self, owner: Address) -> Result<U256, TransferError> {
        let token = self.token;
        self.with_fallback("balance_of", |provider| async move {
            let contract = IERC20Permit::new(token, provider.clone());
            contract
                .balanceOf(owner)
                .call()
                .await
                .map(|r| r._0)
                .map_err(|e| e.to_string())
        })
        .await
    }

    async fn get_permit_nonce(&self, owner: Address) -> Result<U256, TransferError> {
        let token = self.token;
        self.with_fallback("get_permit_nonce", |provider| async move {
            let contract = IERC20Permit::new(token, provider.clone());
            contract
                .nonces(owner)
                .call()
                .await
                .map(|r| r._0)
                .map_err(|e| e.to_string())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_multiple_urls() {
        let urls = parse_rpc_urls(" https://a.com , https://b.com,,https://c.com ");
        assert_eq!(urls, vec!["https://a.com", "https://b.com", "https://c.com"]);
    }

    #[test]
    fn test_parse_empty_string() {
        assert!(parse_rpc_urls("").is_empty());
    }

    #[test]
    fn test_create_providers_empty_fails() {
        assert!(create_providers(&[]).is_err());
    }

    #[test]
    fn test_evm_chain_rpc_builds_with_fallbacks() {
        let rpc = EvmChainRpc::new(
            &[
                "http://localhost:8545".to_string(),
                "http://localhost:8546".to_string(),
            ],
            Address::repeat_byte(0x01),
        )
        .unwrap();
        assert_eq!(rpc.providers.len(), 2);
    }
}

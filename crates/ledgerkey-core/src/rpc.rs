//! JSON-RPC account key lookup
//!
//! Calls `condenser_api.get_accounts` on a public node and extracts the
//! authority keys.

use crate::chain::{AccountAuthorities, AccountKeyLookup};
use crate::{Error, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

/// Default public API node
pub const DEFAULT_NODE_URL: &str = "https://api.hive.blog";

/// Request timeout for lookups
const LOOKUP_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct Authority {
    key_auths: Vec<(String, u32)>,
}

#[derive(Debug, Deserialize)]
struct RpcAccount {
    owner: Authority,
    active: Authority,
    posting: Authority,
    memo_key: String,
}

/// Account key lookup over HTTP JSON-RPC
pub struct RpcKeyLookup {
    client: reqwest::Client,
    node_url: String,
}

impl RpcKeyLookup {
    /// Lookup against `node_url`
    pub fn new(node_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(LOOKUP_TIMEOUT)
            .build()
            .map_err(|e| Error::Network(e.to_string()))?;
        Ok(Self {
            client,
            node_url: node_url.into(),
        })
    }

    /// Node URL in use
    pub fn node_url(&self) -> &str {
        &self.node_url
    }
}

#[async_trait]
impl AccountKeyLookup for RpcKeyLookup {
    async fn account_keys(&self, account: &str) -> Result<AccountAuthorities> {
        let request = json!({
            "jsonrpc": "2.0",
            "method": "condenser_api.get_accounts",
            "params": [[account]],
            "id": 1,
        });

        tracing::debug!("Looking up authorities for @{} on {}", account, self.node_url);

        let response: RpcResponse<Vec<RpcAccount>> = self
            .client
            .post(&self.node_url)
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::Network(e.to_string()))?
            .error_for_status()
            .map_err(|e| Error::Network(e.to_string()))?
            .json()
            .await
            .map_err(|e| Error::Network(e.to_string()))?;

        if let Some(err) = response.error {
            return Err(Error::Network(err.message));
        }

        let account_data = response
            .result
            .and_then(|mut accounts| accounts.pop())
            .ok_or_else(|| Error::AccountNotFound(account.to_string()))?;

        Ok(authorities_from(account_data))
    }
}

fn authorities_from(account: RpcAccount) -> AccountAuthorities {
    let keys = |auth: Authority| auth.key_auths.into_iter().map(|(key, _)| key).collect();
    AccountAuthorities {
        owner: keys(account.owner),
        active: keys(account.active),
        posting: keys(account.posting),
        memo: Some(account.memo_key).filter(|k| !k.is_empty()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_get_accounts_response() {
        let raw = r#"{
            "jsonrpc": "2.0",
            "result": [{
                "name": "alice",
                "owner": {"weight_threshold": 1, "account_auths": [], "key_auths": [["STM8owner", 1]]},
                "active": {"weight_threshold": 1, "account_auths": [], "key_auths": [["STM8active", 1]]},
                "posting": {"weight_threshold": 1, "account_auths": [], "key_auths": [["STM8posting", 1], ["STM8other", 1]]},
                "memo_key": "STM8memo"
            }],
            "id": 1
        }"#;

        let response: RpcResponse<Vec<RpcAccount>> = serde_json::from_str(raw).unwrap();
        let auths = authorities_from(response.result.unwrap().pop().unwrap());
        assert_eq!(auths.owner, vec!["STM8owner".to_string()]);
        assert_eq!(auths.posting.len(), 2);
        assert_eq!(auths.memo.as_deref(), Some("STM8memo"));
    }

    #[test]
    fn test_empty_result_is_missing_account() {
        let raw = r#"{"jsonrpc": "2.0", "result": [], "id": 1}"#;
        let response: RpcResponse<Vec<RpcAccount>> = serde_json::from_str(raw).unwrap();
        assert!(response.result.and_then(|mut a| a.pop()).is_none());
    }
}

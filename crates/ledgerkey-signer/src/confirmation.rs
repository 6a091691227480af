//! Confirmation requests
//!
//! What the user is shown before anything is signed: the account, the
//! requested authority and one summary line per operation. The normalized type
//! of the first operation keys the per-account suppression flag.

use crate::prompt::{Prompt, PromptKind};
use ledgerkey_core::{Error, KeyLevel, Operation, OperationType, Result};
use ledgerkey_storage::normalize_account;
use uuid::Uuid;

/// Suppression key used for detached challenge signing
pub const SIGN_ONLY_TYPE: &str = "sign_only";

/// A pending approval
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmationRequest {
    /// Normalized account name
    pub account: String,
    /// Requested authority
    pub key_level: KeyLevel,
    /// Suppression key
    pub op_type: OperationType,
    /// Human-readable lines
    pub summaries: Vec<String>,
}

impl ConfirmationRequest {
    /// Request for broadcasting `operations`
    pub fn for_operations(account: &str, key_level: KeyLevel, operations: &[Operation]) -> Result<Self> {
        let op_type = OperationType::of_first(operations)
            .ok_or_else(|| Error::Other("Nothing to sign: no operations".to_string()))?;
        Ok(Self {
            account: normalize_account(account)?,
            key_level,
            op_type,
            summaries: operations.iter().map(Operation::summary).collect(),
        })
    }

    /// Request for signing a challenge without broadcasting
    pub fn for_challenge(account: &str, key_level: KeyLevel, challenge: &str) -> Result<Self> {
        Ok(Self {
            account: normalize_account(account)?,
            key_level,
            op_type: OperationType::from_raw(SIGN_ONLY_TYPE),
            summaries: vec![format!("sign message: {}", truncate(challenge, 64))],
        })
    }

    /// Prompt of `kind` carrying this request's details
    pub fn prompt(&self, request_id: Uuid, kind: PromptKind) -> Prompt {
        Prompt {
            request_id,
            kind,
            account: self.account.clone(),
            key_level: self.key_level,
            summaries: self.summaries.clone(),
            op_type: Some(self.op_type.as_str().to_string()),
        }
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let head: String = text.chars().take(max_chars).collect();
        format!("{}…", head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_uses_first_operation_type() {
        let ops = vec![
            Operation::new("transfer_operation", json!({"from": "alice", "to": "bob", "amount": "1.000 HIVE"})),
            Operation::new("vote", json!({"voter": "alice", "author": "bob", "permlink": "p", "weight": 10000})),
        ];
        let request = ConfirmationRequest::for_operations("@Alice", KeyLevel::Active, &ops).unwrap();
        assert_eq!(request.account, "alice");
        assert_eq!(request.op_type.as_str(), "transfer");
        assert_eq!(request.summaries.len(), 2);
    }

    #[test]
    fn test_empty_operations_rejected() {
        assert!(ConfirmationRequest::for_operations("alice", KeyLevel::Posting, &[]).is_err());
    }

    #[test]
    fn test_challenge_summary_is_bounded() {
        let challenge = "x".repeat(500);
        let request = ConfirmationRequest::for_challenge("alice", KeyLevel::Posting, &challenge).unwrap();
        assert_eq!(request.op_type.as_str(), SIGN_ONLY_TYPE);
        assert!(request.summaries[0].chars().count() < 100);
    }

    #[test]
    fn test_prompt_carries_details() {
        let ops = vec![Operation::new("vote", json!({"voter": "alice"}))];
        let request = ConfirmationRequest::for_operations("alice", KeyLevel::Posting, &ops).unwrap();
        let id = Uuid::new_v4();
        let prompt = request.prompt(id, PromptKind::Pin);
        assert_eq!(prompt.request_id, id);
        assert_eq!(prompt.kind, PromptKind::Pin);
        assert_eq!(prompt.op_type.as_deref(), Some("vote"));
    }
}

//! Operation tuples handed to the signer
//!
//! Operations are built elsewhere; this module only names them (for
//! suppression flags) and renders short summaries for confirmation prompts.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Longest custom message body quoted in a summary
const SUMMARY_JSON_PREVIEW: usize = 64;

/// `[name, body]` pair, serialized as a two-element JSON array
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation(pub String, pub Value);

impl Operation {
    /// Build an operation
    pub fn new(name: impl Into<String>, body: Value) -> Self {
        Self(name.into(), body)
    }

    /// Operation name as given
    pub fn name(&self) -> &str {
        &self.0
    }

    /// Operation body
    pub fn body(&self) -> &Value {
        &self.1
    }

    /// Normalized type used for suppression flags
    pub fn op_type(&self) -> OperationType {
        OperationType::of(self)
    }

    /// Human readable one-liner
    pub fn summary(&self) -> String {
        let body = self.body();
        match normalize_name(self.name()).as_str() {
            "transfer" => {
                let mut line = format!(
                    "Transfer {} from @{} to @{}",
                    field(body, "amount"),
                    field(body, "from"),
                    field(body, "to")
                );
                match body.get("memo").and_then(Value::as_str) {
                    Some(memo) if memo.starts_with('#') => line.push_str(" (encrypted memo)"),
                    Some(memo) if !memo.is_empty() => line.push_str(&format!(" (memo: {})", memo)),
                    _ => {}
                }
                line
            }
            "vote" => {
                let weight = body.get("weight").and_then(Value::as_i64).unwrap_or(0);
                let verb = if weight < 0 { "Downvote" } else if weight == 0 { "Unvote" } else { "Upvote" };
                format!(
                    "{} @{}/{} at {:.2}% as @{}",
                    verb,
                    field(body, "author"),
                    field(body, "permlink"),
                    weight.abs() as f64 / 100.0,
                    field(body, "voter")
                )
            }
            "comment" => {
                let parent = body.get("parent_author").and_then(Value::as_str).unwrap_or("");
                if parent.is_empty() {
                    format!("Publish post \"{}\" as @{}", field(body, "title"), field(body, "author"))
                } else {
                    format!(
                        "Reply to @{}/{} as @{}",
                        parent,
                        field(body, "parent_permlink"),
                        field(body, "author")
                    )
                }
            }
            "custom_json" => {
                let json = body.get("json").and_then(Value::as_str).unwrap_or("");
                let preview: String = json.chars().take(SUMMARY_JSON_PREVIEW).collect();
                let ellipsis = if json.chars().count() > SUMMARY_JSON_PREVIEW { "…" } else { "" };
                format!("Custom message '{}': {}{}", field(body, "id"), preview, ellipsis)
            }
            other => match body.as_object() {
                Some(map) if !map.is_empty() => {
                    let fields: Vec<String> = map
                        .iter()
                        .take(4)
                        .map(|(k, v)| match v {
                            Value::String(s) => format!("{}={}", k, s),
                            v => format!("{}={}", k, v),
                        })
                        .collect();
                    format!("{} ({})", other, fields.join(", "))
                }
                _ => other.to_string(),
            },
        }
    }
}

/// Normalized operation type identifier
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationType(String);

impl OperationType {
    /// Normalize an operation: lowercase, `_operation` suffix removed,
    /// custom messages qualified by their id.
    pub fn of(op: &Operation) -> Self {
        let name = normalize_name(op.name());
        if name == "custom_json" {
            if let Some(id) = op.body().get("id").and_then(Value::as_str) {
                return Self(format!("custom_json:{}", id.trim()));
            }
        }
        Self(name)
    }

    /// Type of the first operation of a batch
    pub fn of_first(ops: &[Operation]) -> Option<Self> {
        ops.first().map(Self::of)
    }

    /// From an already-normalized identifier
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Identifier string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn normalize_name(name: &str) -> String {
    let lower = name.trim().to_ascii_lowercase();
    match lower.strip_suffix("_operation") {
        Some(stripped) => stripped.to_string(),
        None => lower,
    }
}

fn field<'a>(body: &'a Value, key: &str) -> &'a str {
    body.get(key).and_then(Value::as_str).unwrap_or("?")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_serializes_as_tuple() {
        let op = Operation::new("vote", json!({"voter": "alice"}));
        let encoded = serde_json::to_string(&op).unwrap();
        assert_eq!(encoded, r#"["vote",{"voter":"alice"}]"#);

        let decoded: Operation = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, op);
    }

    #[test]
    fn test_type_normalization() {
        let op = Operation::new("Transfer_Operation", json!({}));
        assert_eq!(op.op_type().as_str(), "transfer");

        let op = Operation::new("custom_json", json!({"id": "follow", "json": "[]"}));
        assert_eq!(op.op_type().as_str(), "custom_json:follow");

        assert!(OperationType::of_first(&[]).is_none());
    }

    #[test]
    fn test_transfer_summary() {
        let op = Operation::new(
            "transfer",
            json!({"from": "alice", "to": "bob", "amount": "1.000 HIVE", "memo": "thanks"}),
        );
        assert_eq!(op.summary(), "Transfer 1.000 HIVE from @alice to @bob (memo: thanks)");

        let op = Operation::new(
            "transfer",
            json!({"from": "alice", "to": "bob", "amount": "1.000 HIVE", "memo": "#secret"}),
        );
        assert!(op.summary().ends_with("(encrypted memo)"));
    }

    #[test]
    fn test_vote_summary() {
        let op = Operation::new(
            "vote",
            json!({"voter": "alice", "author": "bob", "permlink": "hello", "weight": -5000}),
        );
        assert_eq!(op.summary(), "Downvote @bob/hello at 50.00% as @alice");
    }

    #[test]
    fn test_comment_summaries() {
        let post = Operation::new(
            "comment",
            json!({"parent_author": "", "author": "alice", "title": "Hi"}),
        );
        assert_eq!(post.summary(), "Publish post \"Hi\" as @alice");

        let reply = Operation::new(
            "comment",
            json!({"parent_author": "bob", "parent_permlink": "p", "author": "alice"}),
        );
        assert_eq!(reply.summary(), "Reply to @bob/p as @alice");
    }

    #[test]
    fn test_generic_summary() {
        let op = Operation::new("claim_reward_balance", json!({"account": "alice"}));
        assert_eq!(op.summary(), "claim_reward_balance (account=alice)");
    }
}

//! Redirect signer
//!
//! Hands the user off to an external web signer by URL. Only a single
//! `transfer` or a single `custom_json` with the configured id can be
//! expressed as query parameters. Nothing comes back programmatically.

use crate::backend::{RedirectTicket, SignContext, SignOutcome, SignerBackend, SignerKind};
use async_trait::async_trait;
use ledgerkey_core::{Error, KeyLevel, Operation, Result, Signature};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::info;
use url::Url;

/// Redirect signer configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedirectConfig {
    /// Web signer base URL
    pub base_url: String,
    /// The one `custom_json` id this application may send
    pub custom_json_id: String,
    /// Where the web signer returns the user afterwards
    pub redirect_uri: Option<String>,
}

impl Default for RedirectConfig {
    fn default() -> Self {
        Self {
            base_url: "https://hivesigner.com".to_string(),
            custom_json_id: "ledgerkey".to_string(),
            redirect_uri: None,
        }
    }
}

/// Platform hook that opens a URL for the user
pub trait UrlOpener: Send + Sync {
    /// Open `url`
    fn open(&self, url: &Url) -> Result<()>;
}

/// Signer that redirects to a web signer
pub struct RedirectSigner {
    config: RedirectConfig,
    opener: Arc<dyn UrlOpener>,
}

impl RedirectSigner {
    /// New redirect signer
    pub fn new(config: RedirectConfig, opener: Arc<dyn UrlOpener>) -> Self {
        Self { config, opener }
    }

    /// Signer URL for `operations`, or `UnsupportedOperation`
    pub fn signer_url(&self, account: &str, operations: &[Operation], level: KeyLevel) -> Result<Url> {
        let [operation] = operations else {
            return Err(Error::UnsupportedOperation(format!(
                "Redirect signing takes exactly one operation, got {}",
                operations.len()
            )));
        };

        let body = operation.body();
        let (path, mut params) = match operation.op_type().as_str() {
            "transfer" => (
                "sign/transfer",
                vec![
                    ("from", field(body, "from").unwrap_or(account).to_string()),
                    ("to", required(body, "to")?.to_string()),
                    ("amount", required(body, "amount")?.to_string()),
                    ("memo", field(body, "memo").unwrap_or_default().to_string()),
                ],
            ),
            qualified if qualified.starts_with("custom_json:") => {
                let id = required(body, "id")?;
                if id != self.config.custom_json_id {
                    return Err(Error::UnsupportedOperation(format!(
                        "custom_json id {} cannot be signed by redirect",
                        id
                    )));
                }
                let json = match body.get("json") {
                    Some(Value::String(s)) => s.clone(),
                    Some(other) => other.to_string(),
                    None => return Err(missing("json")),
                };
                let (authority, auths_key) = match level {
                    KeyLevel::Posting => ("posting", "required_posting_auths"),
                    _ => ("active", "required_auths"),
                };
                (
                    "sign/custom-json",
                    vec![
                        ("id", id.to_string()),
                        ("json", json),
                        ("authority", authority.to_string()),
                        (auths_key, serde_json::to_string(&[account])?),
                    ],
                )
            }
            other => {
                return Err(Error::UnsupportedOperation(format!(
                    "{} cannot be signed by redirect",
                    other
                )))
            }
        };
        if let Some(redirect_uri) = &self.config.redirect_uri {
            params.push(("redirect_uri", redirect_uri.clone()));
        }

        let base = format!("{}/{}", self.config.base_url.trim_end_matches('/'), path);
        Url::parse_with_params(&base, &params)
            .map_err(|e| Error::Other(format!("Invalid redirect signer URL: {}", e)))
    }
}

fn field<'a>(body: &'a Value, key: &str) -> Option<&'a str> {
    body.get(key).and_then(Value::as_str)
}

fn required<'a>(body: &'a Value, key: &str) -> Result<&'a str> {
    field(body, key).ok_or_else(|| missing(key))
}

fn missing(key: &str) -> Error {
    Error::UnsupportedOperation(format!("Operation is missing `{}`", key))
}

#[async_trait]
impl SignerBackend for RedirectSigner {
    fn kind(&self) -> SignerKind {
        SignerKind::Redirect
    }

    async fn sign(
        &self,
        ctx: &SignContext,
        account: &str,
        operations: &[Operation],
        level: KeyLevel,
    ) -> Result<SignOutcome> {
        let url = self.signer_url(account, operations, level)?;
        ctx.check_cancelled()?;
        self.opener.open(&url)?;
        info!("Opened redirect signer for @{}", account);
        Ok(SignOutcome::Redirected(RedirectTicket { url: url.into() }))
    }

    async fn sign_only(
        &self,
        _ctx: &SignContext,
        _account: &str,
        _challenge: &str,
        _level: KeyLevel,
    ) -> Result<Signature> {
        Err(Error::SignerUnavailable(
            "Redirect signing cannot return a detached signature".to_string(),
        ))
    }
}

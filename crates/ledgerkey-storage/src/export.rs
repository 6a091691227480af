//! Key export
//!
//! Implements a gated flow for exporting stored keys:
//! 1. Warning acknowledgment
//! 2. PIN re-verification
//! 3. Payload rendering (flat file or QR import link)
//!
//! Export requires an unlocked session. Payloads are zeroized on drop and
//! each completed or abandoned export leaves an audit line in the log.

use crate::session::SessionHandle;
use crate::vault::{normalize_account, Vault};
use base64::engine::general_purpose::URL_SAFE_NO_PAD as BASE64_URL;
use base64::Engine;
use ledgerkey_core::{Error, KeyLevel, Result, Secret};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use zeroize::Zeroizing;

/// First line of every exported file
pub const FILE_BANNER: &str = "# SENSITIVE: delete after use";

/// Prefix of the QR import link
pub const IMPORT_URI_PREFIX: &str = "ledgerkey://import?data=";

/// Largest import link that still fits a scannable QR code
pub const MAX_QR_PAYLOAD_BYTES: usize = 1200;

const PAYLOAD_VERSION: u8 = 1;

/// Export output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    /// Plain text file
    File,
    /// `ledgerkey://import?data=...` link for QR display
    QrPayload,
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExportFormat::File => write!(f, "file"),
            ExportFormat::QrPayload => write!(f, "qr"),
        }
    }
}

/// Export flow state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFlowState {
    /// Not started
    NotStarted,
    /// Warning displayed, awaiting acknowledgment
    WarningDisplayed,
    /// Warning acknowledged, awaiting PIN
    AwaitingPin,
    /// PIN verified, payload may be rendered
    Ready,
    /// Payload handed out
    Complete,
    /// Export cancelled
    Cancelled,
}

/// Rendered export (zeroized on drop)
pub struct ExportResult {
    content: Zeroizing<String>,
    /// Output format
    pub format: ExportFormat,
    /// Accounts included
    pub accounts: Vec<String>,
    /// Key levels included
    pub levels: Vec<KeyLevel>,
    /// Export timestamp
    pub exported_at: i64,
}

impl ExportResult {
    /// Rendered payload
    pub fn content(&self) -> &str {
        &self.content
    }
}

impl fmt::Debug for ExportResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExportResult")
            .field("format", &self.format)
            .field("accounts", &self.accounts)
            .field("levels", &self.levels)
            .field("exported_at", &self.exported_at)
            .finish_non_exhaustive()
    }
}

/// Export audit log entry
#[derive(Debug, Clone)]
pub struct ExportAuditEntry {
    /// Accounts requested
    pub accounts: Vec<String>,
    /// Format, when one was chosen
    pub format: Option<ExportFormat>,
    /// Timestamp
    pub timestamp: i64,
    /// Outcome (completed/cancelled/failed)
    pub result: String,
}

impl ExportAuditEntry {
    fn new(accounts: Vec<String>, format: Option<ExportFormat>, result: &str) -> Self {
        Self {
            accounts,
            format,
            timestamp: chrono::Utc::now().timestamp(),
            result: result.to_string(),
        }
    }

    fn emit(&self) {
        tracing::info!(
            accounts = ?self.accounts,
            format = ?self.format,
            timestamp = self.timestamp,
            result = %self.result,
            "Key export audit"
        );
    }
}

/// Gated export flow over an unlocked session
pub struct KeyExportManager {
    session: Arc<SessionHandle>,
    state: RwLock<ExportFlowState>,
    accounts: RwLock<Vec<String>>,
    levels: RwLock<Vec<KeyLevel>>,
    last_audit: RwLock<Option<ExportAuditEntry>>,
}

impl KeyExportManager {
    /// Create new manager
    pub fn new(session: Arc<SessionHandle>) -> Self {
        Self {
            session,
            state: RwLock::new(ExportFlowState::NotStarted),
            accounts: RwLock::new(Vec::new()),
            levels: RwLock::new(Vec::new()),
            last_audit: RwLock::new(None),
        }
    }

    /// Get current state
    pub fn state(&self) -> ExportFlowState {
        *self.state.read()
    }

    /// Most recent audit entry
    pub fn last_audit(&self) -> Option<ExportAuditEntry> {
        self.last_audit.read().clone()
    }

    /// Start exporting `levels` of `accounts`; an empty list selects every
    /// account or every level
    pub fn start_export(&self, accounts: &[String], levels: &[KeyLevel]) -> Result<ExportFlowState> {
        let known = self.session.read(|vault| vault.account_names())?;
        let selected = if accounts.is_empty() {
            known
        } else {
            let mut selected = Vec::with_capacity(accounts.len());
            for name in accounts {
                let name = normalize_account(name)?;
                if !known.contains(&name) {
                    return Err(Error::AccountNotFound(name));
                }
                selected.push(name);
            }
            selected
        };

        let mut levels = if levels.is_empty() {
            KeyLevel::ALL.to_vec()
        } else {
            levels.to_vec()
        };
        levels.sort();
        levels.dedup();

        *self.accounts.write() = selected;
        *self.levels.write() = levels;
        let mut state = self.state.write();
        *state = ExportFlowState::WarningDisplayed;

        tracing::info!("Key export flow started");
        Ok(*state)
    }

    /// Acknowledge warning
    pub fn acknowledge_warning(&self) -> Result<ExportFlowState> {
        let mut state = self.state.write();
        if *state != ExportFlowState::WarningDisplayed {
            return Err(Error::Other("Invalid export flow state".to_string()));
        }
        *state = ExportFlowState::AwaitingPin;
        Ok(*state)
    }

    /// Re-verify the PIN. A wrong PIN keeps the flow waiting.
    pub fn verify_pin(&self, pin: &str) -> Result<ExportFlowState> {
        let mut state = self.state.write();
        if *state != ExportFlowState::AwaitingPin {
            return Err(Error::Other("Invalid export flow state".to_string()));
        }
        self.session.verify_pin(pin)?;
        *state = ExportFlowState::Ready;
        Ok(*state)
    }

    /// Render the payload
    pub fn complete_export(&self, format: ExportFormat) -> Result<ExportResult> {
        let mut state = self.state.write();
        if *state != ExportFlowState::Ready {
            return Err(Error::Other("Invalid export flow state".to_string()));
        }

        let accounts = self.accounts.read().clone();
        let levels = self.levels.read().clone();
        let rendered = self.session.read(|vault| match format {
            ExportFormat::File => Ok(render_file(vault, &accounts, &levels)),
            ExportFormat::QrPayload => render_import_uri(vault, &accounts, &levels),
        })?;

        let content = match rendered {
            Ok(content) => content,
            Err(e) => {
                self.audit(ExportAuditEntry::new(accounts, Some(format), "failed"));
                return Err(e);
            }
        };

        *state = ExportFlowState::Complete;
        self.audit(ExportAuditEntry::new(accounts.clone(), Some(format), "completed"));

        Ok(ExportResult {
            content,
            format,
            accounts,
            levels,
            exported_at: chrono::Utc::now().timestamp(),
        })
    }

    /// Cancel export
    pub fn cancel(&self) {
        let mut state = self.state.write();
        let accounts = std::mem::take(&mut *self.accounts.write());
        *state = ExportFlowState::Cancelled;
        self.audit(ExportAuditEntry::new(accounts, None, "cancelled"));
    }

    /// Reset export flow
    pub fn reset(&self) {
        *self.state.write() = ExportFlowState::NotStarted;
        self.accounts.write().clear();
        self.levels.write().clear();
    }

    fn audit(&self, entry: ExportAuditEntry) {
        entry.emit();
        *self.last_audit.write() = Some(entry);
    }
}

/// Flat text export of the given `levels`, one `[account]` section per account
pub fn render_file(vault: &Vault, accounts: &[String], levels: &[KeyLevel]) -> Zeroizing<String> {
    let mut out = Zeroizing::new(String::new());
    out.push_str(FILE_BANNER);
    out.push('\n');
    out.push_str(&format!(
        "# ledgerkey key export, {}\n",
        chrono::Utc::now().to_rfc3339()
    ));

    for name in accounts {
        let Some(entry) = vault.account(name) else {
            continue;
        };
        out.push_str(&format!("\n[{}]\n", name));
        for (level, secret) in entry.secrets.iter().filter(|(l, _)| levels.contains(l)) {
            out.push_str(&format!("{} = {}\n", level, secret.expose()));
        }
    }
    out
}

#[derive(Serialize, Deserialize)]
struct ImportPayload {
    v: u8,
    a: BTreeMap<String, BTreeMap<KeyLevel, Secret>>,
}

/// Compact import link carrying the given `levels`, bounded by
/// [`MAX_QR_PAYLOAD_BYTES`]
pub fn render_import_uri(vault: &Vault, accounts: &[String], levels: &[KeyLevel]) -> Result<Zeroizing<String>> {
    let payload = ImportPayload {
        v: PAYLOAD_VERSION,
        a: accounts
            .iter()
            .filter_map(|name| {
                let secrets: BTreeMap<KeyLevel, Secret> = vault
                    .account(name)?
                    .secrets
                    .iter()
                    .filter(|(level, _)| levels.contains(level))
                    .map(|(level, secret)| (*level, secret.clone()))
                    .collect();
                (!secrets.is_empty()).then(|| (name.clone(), secrets))
            })
            .collect(),
    };
    let json = Zeroizing::new(serde_json::to_vec(&payload)?);
    let uri = Zeroizing::new(format!("{}{}", IMPORT_URI_PREFIX, BASE64_URL.encode(&json[..])));

    if uri.len() > MAX_QR_PAYLOAD_BYTES {
        return Err(Error::ExportTooLarge(format!(
            "{} bytes exceeds {}; export fewer accounts",
            uri.len(),
            MAX_QR_PAYLOAD_BYTES
        )));
    }
    Ok(uri)
}

/// Parse an import link back into `(account, level, secret)` entries
pub fn parse_import_uri(uri: &str) -> Result<Vec<(String, KeyLevel, Secret)>> {
    let data = uri
        .trim()
        .strip_prefix(IMPORT_URI_PREFIX)
        .ok_or_else(|| Error::Other("Not an import link".to_string()))?;
    let json = Zeroizing::new(
        BASE64_URL
            .decode(data)
            .map_err(|_| Error::Other("Malformed import link".to_string()))?,
    );
    let payload: ImportPayload = serde_json::from_slice(&json)?;
    if payload.v != PAYLOAD_VERSION {
        return Err(Error::Other(format!("Unsupported import version {}", payload.v)));
    }

    Ok(payload
        .a
        .into_iter()
        .flat_map(|(account, secrets)| {
            secrets
                .into_iter()
                .map(move |(level, secret)| (account.clone(), level, secret))
        })
        .collect())
}

/// Warning messages for the export flow
pub mod warnings {
    /// Primary warning message
    pub const PRIMARY_WARNING: &str = "Anyone holding these keys can act as your account. \
         They cannot be revoked without changing your keys on the network.";

    /// File export warning
    pub const FILE_WARNING: &str = "The exported file is not encrypted. \
         Move it to offline storage and delete every other copy.";

    /// QR export warning
    pub const QR_WARNING: &str = "Only scan this code with your own device. \
         Make sure no camera or screen recorder can see it.";
}

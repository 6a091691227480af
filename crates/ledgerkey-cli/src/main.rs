//! Ledgerkey command line
//!
//! Manages the local credential vault and drives the signer backends from a
//! terminal:
//! - Vault lifecycle (PIN, accounts, keys, suppression flags)
//! - Key export and import
//! - Detached challenge signing and relay/redirect signing
//! - Broadcast tracker inspection and KDF benchmarking

#![forbid(unsafe_code)]

mod config;
mod interactive;

use anyhow::{bail, Context};
use async_trait::async_trait;
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use config::CliConfig;
use ledgerkey_core::{
    BroadcastResult, Error, KeyLevel, KeyScheme, Operation, OperationType, RpcKeyLookup, Secp256k1Scheme,
    Secret, SignedTransaction, TransactionBroadcaster, UnsignedTransaction,
};
use ledgerkey_signer::{
    BroadcastRecord, BroadcastStatus, BroadcastTracker, HttpStatusEndpoint, LocalSigner, OperationQueue,
    PromptBroker, RedirectSigner, RelayAck, RelayEvent, RelaySigner, SignOutcome, SignerKind, TrackerEvent, UrlOpener,
    WsConnector,
};
use ledgerkey_storage::{
    benchmark_iterations, export_warnings, load_json, parse_import_uri, CredentialVault, Database,
    ExportFormat, KeyExportManager, KeyValueStore, PreferenceStore, SessionHandle, SessionState, TRACKER_KEY,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};
use url::Url;

#[derive(Parser)]
#[command(name = "ledgerkey")]
#[command(about = "Local key vault and signer front end", long_about = None)]
struct Cli {
    /// Config file (defaults to the platform config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the vault and choose a PIN
    Init,

    /// Change the vault PIN
    ChangePin,

    /// Destroy the vault and every stored key
    Reset {
        /// Skip the confirmation question
        #[arg(long)]
        yes: bool,
    },

    /// Add an account without keys
    AddAccount {
        account: String,

        /// Account is still being created on the network
        #[arg(long)]
        pending: bool,
    },

    /// Clear the pending-creation flag
    MarkCreated { account: String },

    /// Store a private key after checking it against the account's authority
    SetKey {
        account: String,

        /// posting, active, owner, memo or master
        level: KeyLevel,
    },

    /// Delete one stored key
    DeleteKey { account: String, level: KeyLevel },

    /// Delete an account and all its keys
    DeleteAccount { account: String },

    /// List accounts, stored key levels and suppressed confirmations
    List,

    /// Skip (or restore) the confirmation prompt for one operation type
    Suppress {
        account: String,

        /// Operation type, e.g. `vote` or `custom_json:follow`
        op_type: String,

        /// Ask again for this type
        #[arg(long)]
        off: bool,
    },

    /// Export keys as a text file or an import URI for QR display
    Export {
        #[arg(required = true)]
        accounts: Vec<String>,

        /// Key levels to include, comma separated (default: every stored level)
        #[arg(long, value_delimiter = ',')]
        levels: Vec<KeyLevel>,

        /// Render an import URI instead of a text file
        #[arg(long)]
        qr: bool,

        /// Write to this file instead of stdout
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Import keys from an import URI
    Import { uri: String },

    /// Sign a challenge string without broadcasting
    SignOnly {
        challenge: String,

        /// Account (defaults to the last one used)
        #[arg(short, long)]
        account: Option<String>,

        #[arg(short, long, default_value = "posting")]
        level: KeyLevel,

        #[arg(short, long, value_enum, default_value = "local")]
        backend: ChallengeBackend,
    },

    /// Hand operations to a remote signer
    Sign {
        /// Operations as a JSON array of `[name, body]` pairs
        #[arg(long)]
        ops: String,

        /// Account (defaults to the last one used)
        #[arg(short, long)]
        account: Option<String>,

        #[arg(short, long, default_value = "posting")]
        level: KeyLevel,

        #[arg(short, long, value_enum, default_value = "relay")]
        backend: RemoteBackend,
    },

    /// Show tracked broadcasts
    Status {
        /// Poll until every tracked broadcast settles
        #[arg(long)]
        watch: bool,

        /// Stop tracking a transaction
        #[arg(long)]
        dismiss: Option<String>,
    },

    /// Measure a KDF iteration count for this machine
    Benchmark {
        /// Target derivation time in milliseconds
        #[arg(short, long, default_value = "2000")]
        target_ms: u64,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ChallengeBackend {
    Local,
    Relay,
}

#[derive(Clone, Copy, ValueEnum)]
enum RemoteBackend {
    Relay,
    Redirect,
}

impl From<ChallengeBackend> for SignerKind {
    fn from(backend: ChallengeBackend) -> Self {
        match backend {
            ChallengeBackend::Local => SignerKind::Local,
            ChallengeBackend::Relay => SignerKind::Relay,
        }
    }
}

impl From<RemoteBackend> for SignerKind {
    fn from(backend: RemoteBackend) -> Self {
        match backend {
            RemoteBackend::Relay => SignerKind::Relay,
            RemoteBackend::Redirect => SignerKind::Redirect,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = CliConfig::load(cli.config.as_deref())?;

    if let Commands::Benchmark { target_ms } = cli.command {
        return run_benchmark(target_ms).await;
    }

    let app = App::open(config)?;

    match cli.command {
        Commands::Init => run_init(&app).await?,
        Commands::ChangePin => run_change_pin(&app).await?,
        Commands::Reset { yes } => run_reset(&app, yes).await?,
        Commands::AddAccount { account, pending } => {
            app.unlock().await?;
            app.vault.add_account(&account, pending)?;
            info!("Added {}", account);
        }
        Commands::MarkCreated { account } => {
            app.unlock().await?;
            app.vault.mark_created(&account)?;
        }
        Commands::SetKey { account, level } => run_set_key(&app, &account, level).await?,
        Commands::DeleteKey { account, level } => {
            app.unlock().await?;
            if !app.vault.delete_secret(&account, level)? {
                warn!("{} has no {} key", account, level.as_str());
            }
        }
        Commands::DeleteAccount { account } => {
            app.unlock().await?;
            if !app.vault.delete_account(&account)? {
                warn!("{} is not in the vault", account);
            }
        }
        Commands::List => run_list(&app).await?,
        Commands::Suppress { account, op_type, off } => {
            app.unlock().await?;
            app.vault
                .set_suppressed(&account, &OperationType::from_raw(op_type), !off)?;
        }
        Commands::Export {
            accounts,
            levels,
            qr,
            out,
        } => run_export(&app, accounts, levels, qr, out).await?,
        Commands::Import { uri } => run_import(&app, &uri).await?,
        Commands::SignOnly {
            challenge,
            account,
            level,
            backend,
        } => {
            let account = app.account_or_last(account)?;
            let (queue, _) = app.queue(backend.into())?;
            let responder = interactive::spawn_responder(queue.clone());
            let result = queue.sign_only(&account, &challenge, level).await;
            responder.abort();
            let signature = result.map_err(report)?;
            println!("{}", signature.as_str());
        }
        Commands::Sign {
            ops,
            account,
            level,
            backend,
        } => {
            let operations: Vec<Operation> = serde_json::from_str(&ops).context("--ops must be a JSON array")?;
            let account = app.account_or_last(account)?;
            run_sign(&app, &account, &operations, level, backend.into()).await?;
        }
        Commands::Status { watch, dismiss } => run_status(&app, watch, dismiss).await?,
        Commands::Benchmark { .. } => {}
    }

    Ok(())
}

/// Print the user-facing message and keep the error for the exit status
fn report(error: Error) -> anyhow::Error {
    if !error.nothing_signed() {
        eprintln!("The transaction may have been broadcast; check before retrying.");
    }
    eprintln!("{}", error.user_message());
    error.into()
}

struct App {
    config: CliConfig,
    store: Arc<dyn KeyValueStore>,
    session: Arc<SessionHandle>,
    vault: Arc<CredentialVault>,
    preferences: Arc<PreferenceStore>,
}

impl App {
    fn open(config: CliConfig) -> anyhow::Result<Self> {
        let path = config.database_path()?;
        debug!("Opening database at {}", path.display());
        let store: Arc<dyn KeyValueStore> = Arc::new(Database::open(&path)?);

        let session = Arc::new(SessionHandle::new(store.clone(), config.envelope));
        let lookup = Arc::new(RpcKeyLookup::new(config.chain.node_url.clone())?);
        let scheme: Arc<dyn KeyScheme> = Arc::new(Secp256k1Scheme::new(config.chain.public_prefix.clone()));
        let vault = Arc::new(CredentialVault::new(session.clone(), lookup, scheme));
        let preferences = Arc::new(PreferenceStore::load(store.clone()));

        Ok(Self {
            config,
            store,
            session,
            vault,
            preferences,
        })
    }

    async fn unlock(&self) -> anyhow::Result<()> {
        match self.session.state()? {
            SessionState::NoVault => bail!("No vault yet; run `ledgerkey init` first"),
            SessionState::Unlocked => Ok(()),
            SessionState::Locked => {
                let pin = interactive::pin("PIN: ").await?;
                self.session.unlock(&pin).map_err(|e| anyhow::anyhow!(e.user_message()))
            }
        }
    }

    fn account_or_last(&self, account: Option<String>) -> anyhow::Result<String> {
        match account.or_else(|| self.preferences.get().last_account) {
            Some(account) => Ok(account),
            None => bail!("No account given and none used before; pass --account"),
        }
    }

    fn tracker(&self) -> anyhow::Result<Option<Arc<BroadcastTracker>>> {
        let Some(url) = &self.config.status_url else {
            return Ok(None);
        };
        let endpoint = Arc::new(HttpStatusEndpoint::new(url, Duration::from_secs(10))?);
        let tracker = BroadcastTracker::load(self.config.tracker.clone(), self.store.clone(), endpoint)?;
        Ok(Some(tracker))
    }

    /// Queue with every backend registered and `kind` active; the relay
    /// signer is returned too so callers can follow its events
    fn queue(&self, kind: SignerKind) -> anyhow::Result<(Arc<OperationQueue>, Arc<RelaySigner>)> {
        let prompts = PromptBroker::new();
        let local = LocalSigner::new(self.vault.clone(), Arc::new(NoTransactionBuilder), prompts.clone());
        let connector = WsConnector::new(
            self.config.relay.url.clone(),
            Duration::from_millis(self.config.relay.connect_timeout_ms),
        );
        let relay = Arc::new(RelaySigner::new(
            self.config.relay.clone(),
            Arc::new(connector),
            prompts.clone(),
        ));
        let redirect = RedirectSigner::new(self.config.redirect.clone(), Arc::new(PrintOpener));

        let mut queue = OperationQueue::new(prompts)
            .with_preferences(self.preferences.clone())
            .with_backend(Arc::new(local))
            .with_backend(relay.clone())
            .with_backend(Arc::new(redirect));
        if let Some(tracker) = self.tracker()? {
            queue = queue.with_tracker(tracker);
        }
        queue.set_backend(kind)?;
        Ok((Arc::new(queue), relay))
    }
}

/// Placeholder broadcaster for the local signer.
///
/// Building and broadcasting transactions belongs to a ledger-specific
/// builder that the command line does not ship. Until one is plugged in here,
/// a local `sign` fails with `SignerUnavailable`, which is not a configuration
/// problem; `sign` therefore only offers the relay and redirect backends.
/// Local `sign-only` works.
struct NoTransactionBuilder;

#[async_trait]
impl TransactionBroadcaster for NoTransactionBuilder {
    async fn prepare(&self, _account: &str, _operations: &[Operation]) -> ledgerkey_core::Result<UnsignedTransaction> {
        Err(Error::SignerUnavailable(
            "the command line cannot build transactions; use a remote signer".to_string(),
        ))
    }

    async fn broadcast(&self, _transaction: SignedTransaction) -> ledgerkey_core::Result<BroadcastResult> {
        Err(Error::SignerUnavailable(
            "the command line cannot broadcast transactions".to_string(),
        ))
    }
}

/// Prints redirect URLs for the user to open
struct PrintOpener;

impl UrlOpener for PrintOpener {
    fn open(&self, url: &Url) -> ledgerkey_core::Result<()> {
        eprintln!("Open this URL to sign:");
        println!("{}", url);
        Ok(())
    }
}

async fn run_init(app: &App) -> anyhow::Result<()> {
    if app.session.state()? != SessionState::NoVault {
        bail!("A vault already exists; use `change-pin` or `reset`");
    }
    let pin = interactive::new_pin().await?;
    app.session
        .create_pin(&pin)
        .map_err(|e| anyhow::anyhow!(e.user_message()))?;
    info!("Vault created");
    Ok(())
}

async fn run_change_pin(app: &App) -> anyhow::Result<()> {
    if app.session.state()? == SessionState::NoVault {
        bail!("No vault yet; run `ledgerkey init` first");
    }
    let old = interactive::ask("Current PIN: ").await?;
    let new = interactive::new_pin().await?;
    app.session
        .change_pin(&old, &new)
        .map_err(|e| anyhow::anyhow!(e.user_message()))?;
    info!("PIN changed");
    Ok(())
}

async fn run_reset(app: &App, yes: bool) -> anyhow::Result<()> {
    if !yes {
        let answer = interactive::ask("Delete the vault and every stored key? Type 'delete' to confirm: ").await?;
        if answer.as_str() != "delete" {
            bail!("Reset aborted");
        }
    }
    app.session.reset()?;
    info!("Vault deleted");
    Ok(())
}

async fn run_set_key(app: &App, account: &str, level: KeyLevel) -> anyhow::Result<()> {
    app.unlock().await?;
    let raw = interactive::ask(&format!("{} key for {}: ", level.as_str(), account)).await?;
    let secret = Secret::new(raw.as_str())?;
    app.vault.set_secret(account, level, secret).await.map_err(report)?;
    info!("Stored {} key for {}", level.as_str(), account);
    Ok(())
}

async fn run_list(app: &App) -> anyhow::Result<()> {
    app.unlock().await?;
    let accounts = app.vault.accounts()?;
    if accounts.is_empty() {
        println!("No accounts");
        return Ok(());
    }
    for summary in accounts {
        let levels: Vec<&str> = summary.levels.iter().map(|l| l.as_str()).collect();
        let pending = if summary.pending_creation { " (pending creation)" } else { "" };
        println!("{}{}", summary.name, pending);
        println!("  keys: {}", if levels.is_empty() { "-".to_string() } else { levels.join(", ") });
        if !summary.suppressed.is_empty() {
            let types: Vec<&str> = summary.suppressed.iter().map(|t| t.as_str()).collect();
            println!("  no confirmation: {}", types.join(", "));
        }
    }
    Ok(())
}

async fn run_export(
    app: &App,
    accounts: Vec<String>,
    levels: Vec<KeyLevel>,
    qr: bool,
    out: Option<PathBuf>,
) -> anyhow::Result<()> {
    app.unlock().await?;
    let export = KeyExportManager::new(app.session.clone());
    export.start_export(&accounts, &levels)?;

    eprintln!("{}", export_warnings::PRIMARY_WARNING);
    eprintln!(
        "{}",
        if qr {
            export_warnings::QR_WARNING
        } else {
            export_warnings::FILE_WARNING
        }
    );
    let answer = interactive::ask("Type 'export' to continue: ").await?;
    if answer.as_str() != "export" {
        export.cancel();
        bail!("Export cancelled");
    }
    export.acknowledge_warning()?;

    loop {
        let pin = interactive::ask("Confirm PIN (empty to cancel): ").await?;
        if pin.is_empty() {
            export.cancel();
            bail!("Export cancelled");
        }
        match export.verify_pin(&pin) {
            Ok(_) => break,
            Err(e) => eprintln!("{}", e.user_message()),
        }
    }

    let format = if qr { ExportFormat::QrPayload } else { ExportFormat::File };
    let result = export.complete_export(format)?;
    match out {
        Some(path) => {
            std::fs::write(&path, result.content()).with_context(|| format!("writing {}", path.display()))?;
            info!("Exported {} account(s) to {}", result.accounts.len(), path.display());
        }
        None => println!("{}", result.content()),
    }
    Ok(())
}

async fn run_import(app: &App, uri: &str) -> anyhow::Result<()> {
    app.unlock().await?;
    let entries = parse_import_uri(uri)?;
    let mut failed = 0usize;
    for (account, level, secret) in entries {
        match app.vault.set_secret(&account, level, secret).await {
            Ok(()) => info!("Imported {} key for {}", level.as_str(), account),
            Err(e) => {
                failed += 1;
                warn!("Skipped {} key for {}: {}", level.as_str(), account, e.user_message());
            }
        }
    }
    if failed > 0 {
        bail!("{} key(s) were not imported", failed);
    }
    Ok(())
}

async fn run_sign(
    app: &App,
    account: &str,
    operations: &[Operation],
    level: KeyLevel,
    kind: SignerKind,
) -> anyhow::Result<()> {
    let (queue, relay) = app.queue(kind)?;
    let mut relay_events = relay.subscribe();
    let responder = interactive::spawn_responder(queue.clone());
    let result = queue.sign(account, operations, level).await;
    responder.abort();

    match result.map_err(report)? {
        SignOutcome::Broadcast(result) => println!("Broadcast {} via {}", result.tx_id, result.api),
        SignOutcome::Redirected(_) => eprintln!("Finish signing in the browser."),
        SignOutcome::Requested(ack) => {
            eprintln!("Approve request {} in the signing app.", ack.uuid);
            wait_for_relay_result(&mut relay_events, &ack).await?;
        }
    }
    Ok(())
}

/// The relay reports the final result after `sign` has returned
async fn wait_for_relay_result(
    events: &mut broadcast::Receiver<RelayEvent>,
    ack: &RelayAck,
) -> anyhow::Result<()> {
    let remaining = (ack.expires_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
    let outcome = tokio::time::timeout(remaining, async {
        loop {
            match events.recv().await {
                Ok(RelayEvent::SignAccepted { uuid, data }) if uuid == ack.uuid => {
                    return Ok(data);
                }
                Ok(RelayEvent::SignRejected { uuid }) if uuid == ack.uuid => {
                    return Err(Error::UserCancelled);
                }
                Ok(RelayEvent::SignFailed { uuid, error }) if uuid == ack.uuid => {
                    return Err(Error::Relay(error));
                }
                Ok(RelayEvent::Disconnected) | Err(RecvError::Closed) => {
                    return Err(Error::Relay("connection to the relay was lost".to_string()));
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
            }
        }
    })
    .await;

    match outcome {
        Ok(Ok(Some(tx_id))) => println!("Broadcast {}", tx_id),
        Ok(Ok(None)) => println!("Signed"),
        Ok(Err(e)) => return Err(report(e)),
        Err(_) => bail!("Request {} expired before the signing app answered", ack.uuid),
    }
    Ok(())
}

async fn run_status(app: &App, watch: bool, dismiss: Option<String>) -> anyhow::Result<()> {
    if !watch && dismiss.is_none() {
        let records: Vec<BroadcastRecord> = load_json(app.store.as_ref(), TRACKER_KEY)
            .unwrap_or_default()
            .unwrap_or_default();
        print_records(&records);
        return Ok(());
    }

    let tracker = app
        .tracker()?
        .context("status_url is not configured; tracked broadcasts cannot be polled")?;

    if let Some(tx_id) = dismiss {
        if tracker.dismiss(&tx_id)? {
            info!("No longer tracking {}", tx_id);
        } else {
            warn!("{} is not tracked", tx_id);
        }
    }

    if watch {
        let mut events = tracker.subscribe();
        while tracker.records().iter().any(|r| is_active(r.status)) {
            match events.recv().await {
                Ok(TrackerEvent::Confirmed { tx_id, status }) => println!("{} {}", tx_id, status),
                Ok(event @ TrackerEvent::TimedOut { .. }) => {
                    if let Some(e) = event.error() {
                        eprintln!("{}", e.user_message());
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            }
        }
    }

    print_records(&tracker.records());
    tracker.shutdown();
    Ok(())
}

fn is_active(status: BroadcastStatus) -> bool {
    matches!(status, BroadcastStatus::Submitted | BroadcastStatus::Polling)
}

fn print_records(records: &[BroadcastRecord]) {
    if records.is_empty() {
        println!("No tracked broadcasts");
        return;
    }
    for record in records {
        println!(
            "{}  {:?}  attempts={}  api={}  since {}",
            record.tx_id,
            record.status,
            record.attempts,
            record.api,
            record.created_at.to_rfc3339()
        );
    }
}

async fn run_benchmark(target_ms: u64) -> anyhow::Result<()> {
    info!("Benchmarking PBKDF2 for a {} ms target", target_ms);
    let iterations = tokio::task::spawn_blocking(move || benchmark_iterations(Duration::from_millis(target_ms)))
        .await
        .context("benchmark task failed")?;
    println!("{}", iterations);
    eprintln!(
        "Set \"envelope\": {{\"iterations\": {}}} in the config to use it for new vaults.",
        iterations
    );
    Ok(())
}

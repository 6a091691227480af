//! Terminal answers for parked prompts

use anyhow::Context;
use ledgerkey_core::Secret;
use ledgerkey_signer::{OperationQueue, Prompt, PromptEvent, PromptKind};
use std::io::{BufRead, Write};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use zeroize::Zeroizing;

/// Environment variable consulted before asking for a PIN
pub const PIN_ENV: &str = "LEDGERKEY_PIN";

/// Read one line from stdin after printing `label` to stderr.
///
/// Input is echoed; pipe secrets in rather than typing them on shared screens.
pub async fn ask(label: &str) -> anyhow::Result<Zeroizing<String>> {
    let label = label.to_string();
    tokio::task::spawn_blocking(move || {
        eprint!("{}", label);
        std::io::stderr().flush()?;
        let mut line = Zeroizing::new(String::new());
        let read = std::io::stdin().lock().read_line(&mut line)?;
        if read == 0 {
            anyhow::bail!("stdin closed");
        }
        let trimmed = Zeroizing::new(line.trim().to_string());
        Ok(trimmed)
    })
    .await
    .context("input task failed")?
}

/// PIN from the environment, else from the terminal
pub async fn pin(label: &str) -> anyhow::Result<Zeroizing<String>> {
    if let Ok(pin) = std::env::var(PIN_ENV) {
        return Ok(Zeroizing::new(pin));
    }
    ask(label).await
}

/// New PIN entered twice
pub async fn new_pin() -> anyhow::Result<Zeroizing<String>> {
    if let Ok(pin) = std::env::var(PIN_ENV) {
        return Ok(Zeroizing::new(pin));
    }
    loop {
        let first = ask("New PIN: ").await?;
        let second = ask("Repeat PIN: ").await?;
        if *first == *second {
            return Ok(first);
        }
        eprintln!("PINs do not match");
    }
}

/// Answer every prompt the queue opens until the task is aborted
pub fn spawn_responder(queue: Arc<OperationQueue>) -> JoinHandle<()> {
    let mut events = queue.prompts().subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(PromptEvent::Opened(prompt)) => {
                    if let Err(e) = answer(&queue, &prompt).await {
                        warn!("Could not answer prompt {}: {:#}", prompt.request_id, e);
                        let _ = queue.cancel(prompt.request_id).await;
                    }
                }
                Ok(PromptEvent::Display { uri, .. }) => {
                    eprintln!("Open this link in the signing app, or encode it as a QR code:");
                    println!("{}", uri);
                }
                Ok(PromptEvent::Closed { request_id }) => debug!("Prompt {} closed", request_id),
                Err(RecvError::Lagged(n)) => warn!("Missed {} prompt events", n),
                Err(RecvError::Closed) => break,
            }
        }
    })
}

async fn answer(queue: &OperationQueue, prompt: &Prompt) -> anyhow::Result<()> {
    let id = prompt.request_id;
    loop {
        let result = match prompt.kind {
            PromptKind::Confirm => {
                eprintln!(
                    "{} wants to sign with its {} key:",
                    prompt.account,
                    prompt.key_level.as_str()
                );
                for summary in &prompt.summaries {
                    eprintln!("  {}", summary);
                }
                let reply = ask("Sign? [y]es / [a]lways for this type / [N]o: ").await?;
                match reply.to_lowercase().as_str() {
                    "y" | "yes" => queue.confirm(id, false).await,
                    "a" | "always" => queue.confirm(id, true).await,
                    _ => queue.cancel(id).await,
                }
            }
            PromptKind::Pin => {
                let pin = ask("PIN (empty to cancel): ").await?;
                if pin.is_empty() {
                    queue.cancel(id).await
                } else {
                    queue.submit_pin(id, &pin).await
                }
            }
            PromptKind::CreatePin => {
                eprintln!("No vault yet; choose a PIN to create one.");
                let pin = new_pin().await?;
                if pin.is_empty() {
                    queue.cancel(id).await
                } else {
                    queue.submit_pin(id, &pin).await
                }
            }
            PromptKind::Key => {
                let raw = ask(&format!(
                    "{} key for {} (empty to cancel): ",
                    prompt.key_level.as_str(),
                    prompt.account
                ))
                .await?;
                if raw.is_empty() {
                    queue.cancel(id).await
                } else {
                    match Secret::new(raw.as_str()) {
                        Ok(secret) => queue.submit_key(id, secret).await,
                        Err(e) => Err(e),
                    }
                }
            }
        };

        match result {
            Ok(()) => return Ok(()),
            Err(e) => {
                eprintln!("{}", e.user_message());
                if queue.prompts().get(&id).is_none() {
                    return Ok(());
                }
            }
        }
    }
}

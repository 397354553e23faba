use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use strongbox_core::audit::{AuditSink, JsonlAuditLog, TracingAuditSink};
use strongbox_core::{generate_key, lock, EncryptionConfig, LockOptions, SecureStore};
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "strongbox", version, about = "Inspect and edit encrypted state files", long_about = None)]
struct Cli {
    #[command(flatten)]
    opts: StoreOpts,

    #[command(subcommand)]
    command: Commands,
}

/// Overrides on top of the STRONGBOX_* environment.
#[derive(Args, Debug)]
struct StoreOpts {
    /// Directory holding the ML-KEM keypair
    #[arg(long, global = true)]
    key_dir: Option<PathBuf>,

    /// File containing the base64 encryption key
    #[arg(long, global = true)]
    key_file: Option<PathBuf>,

    /// Classical encryption only
    #[arg(long, global = true)]
    no_pq: bool,

    /// Never write; loads skip format upgrades
    #[arg(long, global = true)]
    read_only: bool,

    /// Append security events to this hash-chained JSONL file
    #[arg(long, global = true)]
    audit_log: Option<PathBuf>,

    /// Lock wait in milliseconds
    #[arg(long, global = true)]
    wait_ms: Option<u64>,

    /// Use the long lock patience of interactive login flows
    #[arg(long, global = true, conflicts_with = "wait_ms")]
    interactive: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show encryption algorithm, key source and PQ state
    Status,
    /// Encrypt and store a value
    Put {
        path: PathBuf,
        /// Value to store; read from stdin when omitted
        value: Option<String>,
    },
    /// Decrypt and print a stored value
    Get { path: PathBuf },
    /// Remove every representation of a file
    Delete { path: PathBuf },
    /// Report whether anything is stored under a path
    Exists { path: PathBuf },
    /// Print a fresh base64 key for STRONGBOX_ENCRYPTION_KEY
    GenerateKey,
    /// Show who holds the lock on a path
    LockStatus {
        path: PathBuf,
        #[arg(long, default_value = "30000")]
        stale_ms: u64,
    },
    /// Remove a lock file regardless of owner
    ForceUnlock { path: PathBuf },
    /// Regenerate the ML-KEM keypair (existing .pqenc files become unreadable)
    ResetPqKeys {
        #[arg(long)]
        yes: bool,
    },
}

impl StoreOpts {
    fn config(&self) -> EncryptionConfig {
        let mut config = EncryptionConfig::from_env();
        if let Some(dir) = &self.key_dir {
            config.key_dir = Some(dir.clone());
        }
        if let Some(file) = &self.key_file {
            config.key_file = Some(file.clone());
        }
        if self.no_pq {
            config.pq_enabled = false;
        }
        if self.read_only {
            config.read_only = true;
        }
        if let Some(ms) = self.wait_ms {
            config.lock_timeout_ms = ms;
        }
        config
    }

    fn open(&self) -> Result<SecureStore> {
        let sink: Arc<dyn AuditSink> = match &self.audit_log {
            Some(path) => Arc::new(
                JsonlAuditLog::open(path)
                    .with_context(|| format!("opening audit log {}", path.display()))?,
            ),
            None => Arc::new(TracingAuditSink),
        };
        let config = self.config();
        debug!(?config, "opening store");
        let store = SecureStore::open_with_audit(config, sink)?;
        if self.interactive {
            return Ok(store.with_lock_options(LockOptions::interactive_auth()));
        }
        Ok(store)
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Status => {
            let store = cli.opts.open()?;
            let config = cli.opts.config();
            let status = store.status();
            let report = serde_json::json!({
                "status": status,
                "summary": status.to_string(),
                "pqKeypair": config.pq_keypair_path(),
                "lockTimeoutMs": config.lock_timeout_ms,
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Put { path, value } => {
            let data = match value {
                Some(v) => v.into_bytes(),
                None => {
                    let mut buf = Vec::new();
                    std::io::stdin().read_to_end(&mut buf)?;
                    buf
                }
            };
            let store = cli.opts.open()?;
            store.save(&path, &data)?;
            if let Some(variant) = store.stored_variant(&path) {
                println!("{}", variant.path_for(&path).display());
            }
        }
        Commands::Get { path } => {
            let store = cli.opts.open()?;
            match store.load(&path)? {
                Some(data) => {
                    let mut out = std::io::stdout();
                    out.write_all(&data)?;
                    out.flush()?;
                }
                None => eprintln!("no saved state at {}", path.display()),
            }
        }
        Commands::Delete { path } => {
            let store = cli.opts.open()?;
            println!("{}", store.delete(&path)?);
        }
        Commands::Exists { path } => {
            let store = cli.opts.open()?;
            println!("{}", store.exists(&path));
        }
        Commands::GenerateKey => {
            println!("{}", generate_key());
        }
        Commands::LockStatus { path, stale_ms } => match lock::holder(&path)? {
            Some(record) => {
                let age = record.age();
                let stale = age > Duration::from_millis(stale_ms);
                let report = serde_json::json!({
                    "locked": !stale,
                    "stale": stale,
                    "holder": record,
                    "ageMs": age.as_millis() as u64,
                });
                println!("{}", serde_json::to_string_pretty(&report)?);
            }
            None => println!("{}", serde_json::json!({ "locked": false })),
        },
        Commands::ForceUnlock { path } => {
            let removed = lock::force_unlock(&path)?;
            println!("{removed}");
        }
        Commands::ResetPqKeys { yes } => {
            if !yes {
                return Err(anyhow!(
                    "refusing to reset the ML-KEM keypair without --yes; existing .pqenc files would become unreadable"
                ));
            }
            let store = cli.opts.open()?;
            store.reset_pq_keys()?;
            println!("{}", store.status());
        }
    }

    Ok(())
}

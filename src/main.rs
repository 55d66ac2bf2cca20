//! Zentinel session administration
//!
//! Maintenance commands for a redb-backed session store: mint ids, inspect or
//! revoke a session, and sweep expired entries.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use zentinel_oidc_session::storage::KeyValueStore;
use zentinel_oidc_session::{RedbStore, SessionConfig, SessionId, SessionStore};

/// Command line arguments
#[derive(Parser, Debug)]
#[command(name = "zentinel-session-admin")]
#[command(about = "Administration tool for Zentinel encrypted session stores")]
struct Args {
    /// Path to the redb session database
    #[arg(
        long,
        default_value = "/var/lib/zentinel/sessions.redb",
        env = "SESSION_STORE_PATH"
    )]
    store: PathBuf,

    /// Session encryption secret
    #[arg(long, env = "SESSION_SECRET", hide_env_values = true)]
    secret: Option<String>,

    /// Session salt
    #[arg(long, env = "SESSION_SALT", hide_env_values = true)]
    salt: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, env = "SESSION_ADMIN_VERBOSE")]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print a freshly generated session id
    NewId,
    /// Decrypt a session and print it as JSON, without renewing its TTL
    Inspect { id: String },
    /// Delete a session
    Revoke { id: String },
    /// Remove all expired entries
    Sweep,
}

impl Args {
    fn session_config(&self) -> Result<SessionConfig> {
        let secret = self
            .secret
            .clone()
            .context("--secret (or SESSION_SECRET) is required for this command")?;
        let salt = self
            .salt
            .clone()
            .context("--salt (or SESSION_SALT) is required for this command")?;
        Ok(SessionConfig::new(secret, salt))
    }

    fn open_sessions(&self, backend: Arc<RedbStore>) -> Result<SessionStore> {
        let config = self.session_config()?;
        SessionStore::new(backend, &config).context("Invalid session configuration")
    }
}

fn open_backend(path: &PathBuf) -> Result<Arc<RedbStore>> {
    let store = RedbStore::open(path.clone())
        .with_context(|| format!("Failed to open session store at {}", path.display()))?;
    info!(path = %path.display(), "Session store opened");
    Ok(Arc::new(store))
}

fn parse_id(candidate: &str) -> Result<SessionId> {
    SessionId::parse(candidate).with_context(|| format!("'{candidate}' is not a valid session id"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let log_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(format!(
            "{}={},zentinel_oidc_session={}",
            env!("CARGO_CRATE_NAME"),
            log_level,
            log_level
        ))
        .with_writer(std::io::stderr)
        .json()
        .init();

    match args.command {
        Command::NewId => {
            println!("{}", SessionId::generate());
        }
        Command::Inspect { ref id } => {
            let id = parse_id(id)?;
            let sessions = args.open_sessions(open_backend(&args.store)?)?;

            let record = sessions.peek(id.as_str()).await?;
            if record.is_empty() {
                warn!("Session not found, expired or unreadable with this secret");
            }
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        Command::Revoke { ref id } => {
            let id = parse_id(id)?;
            let sessions = args.open_sessions(open_backend(&args.store)?)?;

            let existed = sessions.has(id.as_str()).await?;
            sessions.delete(id.as_str()).await?;
            info!(existed, "Session revoked");
        }
        Command::Sweep => {
            let backend = open_backend(&args.store)?;
            let evicted = backend.evict_expired().await?;
            info!(
                evicted,
                remaining = backend.entry_count()?,
                "Expired entries swept"
            );
            println!("{evicted}");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_subcommands() {
        let args = Args::try_parse_from([
            "zentinel-session-admin",
            "--store",
            "/tmp/s.redb",
            "--secret",
            "s",
            "--salt",
            "t",
            "inspect",
            "0f8fad5b-d9cb-469f-a165-70867728950e",
        ])
        .unwrap();
        assert!(matches!(args.command, Command::Inspect { .. }));
        assert_eq!(args.session_config().unwrap().salt, "t");

        let args = Args::try_parse_from(["zentinel-session-admin", "sweep"]).unwrap();
        assert!(matches!(args.command, Command::Sweep));
    }

    #[test]
    fn test_missing_secret_reported() {
        let args = Args::try_parse_from(["zentinel-session-admin", "--salt", "t", "new-id"]).unwrap();
        if std::env::var("SESSION_SECRET").is_err() {
            assert!(args.session_config().is_err());
        }
    }

    #[test]
    fn test_parse_id() {
        assert!(parse_id("nope").is_err());
        assert!(parse_id("0f8fad5b-d9cb-469f-a165-70867728950e").is_ok());
    }

    #[tokio::test]
    async fn test_revoke_against_redb() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.redb");
        let args = Args::try_parse_from([
            "zentinel-session-admin",
            "--secret",
            "s",
            "--salt",
            "t",
            "revoke",
            "0f8fad5b-d9cb-469f-a165-70867728950e",
        ])
        .unwrap();

        let sessions = args.open_sessions(open_backend(&path).unwrap()).unwrap();
        let id = parse_id("0f8fad5b-d9cb-469f-a165-70867728950e").unwrap();
        sessions
            .set(&id, &zentinel_oidc_session::SessionRecord::pending_login("x"))
            .await
            .unwrap();
        assert!(sessions.has(id.as_str()).await.unwrap());

        sessions.delete(id.as_str()).await.unwrap();
        assert!(sessions.peek(id.as_str()).await.unwrap().is_empty());
    }
}

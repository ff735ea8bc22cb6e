//! CLI entry point for coffer.
//!
//! This binary provides the `coffer` command: path operations against the
//! flat-file JSON store, and `doc` subcommands against the SQLite document
//! store through the cache manager.

mod cli;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use coffer_store::{
    CacheManager, CallOptions, CompositeKey, Database, DotPath, EventBus, FileStore, Mutation,
    SqliteRemote, StoreConfig, StoreEvent,
};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Commands, DocAction};

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(if cli.verbose { "debug" } else { "warn" });

    let config = load_config(&cli)?;
    let reason = cli.reason.as_deref();

    match cli.command {
        Commands::Doc { action } => cmd_doc(&config, action, reason).await,
        command => cmd_file(&config, command, reason),
    }
}

fn load_config(cli: &Cli) -> Result<StoreConfig> {
    let mut config = match &cli.config {
        Some(path) => StoreConfig::load(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => {
            let mut config = StoreConfig::default();
            config.apply_env_overrides()?;
            config
        }
    };

    if let Some(file) = &cli.file {
        config.file.path = file.clone();
    }
    if let Some(db) = &cli.db {
        config.sqlite.path = db.clone();
    }
    debug!(?config, "configuration resolved");
    Ok(config)
}

// ---------------------------------------------------------------------------
// Flat-file subcommands
// ---------------------------------------------------------------------------

fn cmd_file(config: &StoreConfig, command: Commands, reason: Option<&str>) -> Result<()> {
    let bus = EventBus::new(config.events.capacity);
    let mut events = bus.subscribe();
    let store = FileStore::open(&config.file)
        .with_context(|| format!("failed to open {}", config.file.path.display()))?
        .with_events(bus);

    let output = match command {
        Commands::Get { path } => store.fetch(&path)?.unwrap_or(Value::Null),
        Commands::Dump => store.all()?,
        Commands::Set { path, value } => {
            let value = parse_value(&value);
            store.apply_with_reason(&path, Mutation::Set { value }, reason)?
        }
        Commands::Add { path, amount } => {
            store.apply_with_reason(&path, Mutation::Add { amount }, reason)?
        }
        Commands::Subtract { path, amount } => {
            store.apply_with_reason(&path, Mutation::Subtract { amount }, reason)?
        }
        Commands::Push { path, value } => {
            let item = parse_value(&value);
            store.apply_with_reason(&path, Mutation::Push { item }, reason)?
        }
        Commands::Pull { path, value } => {
            let value = parse_value(&value);
            store.apply_with_reason(&path, Mutation::Pull { value }, reason)?
        }
        Commands::Delete { path } => store.apply_with_reason(&path, Mutation::Delete, reason)?,
        Commands::Doc { .. } => anyhow::bail!("doc commands need the document store"),
    };

    log_events(&mut events);
    print_json(&output)
}

// ---------------------------------------------------------------------------
// Document subcommands
// ---------------------------------------------------------------------------

async fn cmd_doc(config: &StoreConfig, action: DocAction, reason: Option<&str>) -> Result<()> {
    let db = Database::open_and_migrate(config.sqlite.path.clone())
        .await
        .with_context(|| format!("failed to open {}", config.sqlite.path.display()))?;

    let bus = EventBus::new(config.events.capacity);
    let mut events = bus.subscribe();
    let manager = CacheManager::builder(Arc::new(SqliteRemote::new(db)))
        .config(config.cache.clone())
        .events(bus)
        .build();

    // Ctrl-C aborts whatever remote call is in flight.
    let on_signal = manager.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupted");
            on_signal.shutdown();
        }
    });

    let mut opts = CallOptions::new();
    if let Some(reason) = reason {
        opts = opts.with_reason(reason);
    }

    let output = match action {
        DocAction::Get {
            kind,
            guild,
            member,
            path,
        } => {
            let key = composite_key(guild, member);
            let document = manager.read_with(kind, &key, &opts).await?;
            match (document, path) {
                (Some(doc), Some(path)) => {
                    let path = DotPath::parse(&path)?;
                    coffer_store::document::read(&doc, Some(&path))
                        .cloned()
                        .unwrap_or(Value::Null)
                }
                (Some(doc), None) => doc,
                (None, _) => Value::Null,
            }
        }
        DocAction::Set {
            kind,
            guild,
            path,
            value,
            member,
        } => {
            let key = composite_key(guild, member);
            let value = parse_value(&value);
            manager
                .write_with(kind, &key, Some(&path), Mutation::Set { value }, &opts)
                .await?
        }
        DocAction::Add {
            kind,
            guild,
            path,
            amount,
            member,
        } => {
            let key = composite_key(guild, member);
            manager
                .write_with(kind, &key, Some(&path), Mutation::Add { amount }, &opts)
                .await?
        }
        DocAction::Remove {
            kind,
            guild,
            member,
        } => {
            let key = composite_key(guild, member);
            Value::Bool(manager.remove_with(kind, &key, &opts).await?)
        }
    };

    log_events(&mut events);
    print_json(&output)
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Initialize the tracing subscriber with the given default log level.
///
/// `RUST_LOG` takes precedence when set.
fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

/// Parse a command-line value as JSON, or take it verbatim as a string.
fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_owned()))
}

fn composite_key(guild: String, member: Option<String>) -> CompositeKey {
    match member {
        Some(member) => CompositeKey::member(guild, member),
        None => CompositeKey::guild(guild),
    }
}

fn log_events(events: &mut broadcast::Receiver<Arc<StoreEvent>>) {
    while let Ok(event) = events.try_recv() {
        info!(
            change = %event.change,
            guild = %event.guild_id,
            member = event.member_id.as_deref().unwrap_or("-"),
            path = %event.path,
            reason = event.reason.as_deref().unwrap_or("-"),
            "document changed"
        );
    }
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_value_prefers_json() {
        assert_eq!(parse_value("42"), json!(42));
        assert_eq!(parse_value("{\"a\":[1]}"), json!({"a": [1]}));
        assert_eq!(parse_value("\"quoted\""), json!("quoted"));
    }

    #[test]
    fn parse_value_falls_back_to_string() {
        assert_eq!(parse_value("!"), json!("!"));
        assert_eq!(parse_value("hello world"), json!("hello world"));
    }

    #[test]
    fn composite_key_scope() {
        assert_eq!(composite_key("g".into(), None), CompositeKey::guild("g"));
        assert_eq!(
            composite_key("g".into(), Some("m".into())),
            CompositeKey::member("g", "m")
        );
    }

    #[test]
    fn cli_parses_negative_amounts() {
        let cli = Cli::try_parse_from(["coffer", "add", "g1.alice.money", "-25"]).unwrap();
        match cli.command {
            Commands::Add { path, amount } => {
                assert_eq!(path, "g1.alice.money");
                assert_eq!(amount, -25.0);
            }
            _ => panic!("expected add"),
        }
    }

    #[test]
    fn cli_parses_doc_kind() {
        let cli = Cli::try_parse_from([
            "coffer", "doc", "get", "balances", "g1", "--member", "alice", "--path", "money",
        ])
        .unwrap();
        match cli.command {
            Commands::Doc {
                action: DocAction::Get { kind, member, path, .. },
            } => {
                assert_eq!(kind, coffer_store::EntityKind::Balances);
                assert_eq!(member.as_deref(), Some("alice"));
                assert_eq!(path.as_deref(), Some("money"));
            }
            _ => panic!("expected doc get"),
        }
        assert!(Cli::try_parse_from(["coffer", "doc", "get", "wallets", "g1"]).is_err());
    }
}

//! nodekernel CLI entry point.
//!
//! Read-side tooling around a node's recorded state: `verify` an exported
//! audit chain, `inspect` a snapshot, and `check-config` a node
//! configuration.
//!
//! Every subcommand loads the node configuration first so logging follows
//! `kernel.log_level` and, when `paths.logs_dir` is set, also writes
//! rotated JSON files there.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::json;

use nodekernel::config::NodeConfig;
use nodekernel::kernel::audit::AuditLog;
use nodekernel::kernel::handler::HandlerRegistry;
use nodekernel::kernel::{Node, NodeSnapshot};
use nodekernel::logging::{self, LoggingGuard};

/// nodekernel: policy-enforced syscall kernel tooling.
#[derive(Parser)]
#[command(name = "nodekernel", version, about)]
struct Cli {
    /// Config file (defaults to `$NODEKERNEL_CONFIG_PATH` or `./nodekernel.toml`).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// Verify the hash chain of a JSONL audit export.
    Verify {
        /// Audit file, one entry per line.
        path: PathBuf,
    },
    /// Replay a node snapshot and print a summary.
    Inspect {
        /// Snapshot JSON file.
        path: PathBuf,
    },
    /// Load and validate a node configuration.
    CheckConfig,
}

/// Console filter used when no config could be loaded.
const FALLBACK_LOG_LEVEL: &str = "warn";

fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref());
    let _guard = init_logging(config.as_ref().ok())?;
    if let Err(e) = &config {
        let detail = format!("{e:#}");
        tracing::warn!(error = %detail, "config not loaded; using console logging");
    }

    match cli.command {
        Command::Verify { path } => handle_verify(&path),
        Command::Inspect { path } => handle_inspect(&path),
        Command::CheckConfig => handle_check_config(config?),
    }
}

/// Load the config file and apply environment overrides.
fn load_config(path: Option<&Path>) -> anyhow::Result<NodeConfig> {
    let path = path.map_or_else(
        || NodeConfig::config_path_with(|key| std::env::var(key).ok()),
        Path::to_path_buf,
    );
    let mut config = NodeConfig::load_from(&path)?;
    config.apply_overrides(|key| std::env::var(key).ok());
    Ok(config)
}

/// Install the subscriber the config asks for. The returned guard must
/// outlive every log call.
fn init_logging(config: Option<&NodeConfig>) -> anyhow::Result<Option<LoggingGuard>> {
    let Some(config) = config else {
        logging::init_cli(FALLBACK_LOG_LEVEL);
        return Ok(None);
    };
    match &config.paths.logs_dir {
        Some(dir) => logging::init_production(Path::new(dir), &config.kernel.log_level).map(Some),
        None => {
            logging::init_cli(&config.kernel.log_level);
            Ok(None)
        }
    }
}

/// Verify an audit export. Exit code 1 on a broken chain.
fn handle_verify(path: &Path) -> anyhow::Result<ExitCode> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let log = AuditLog::from_jsonl(&contents)
        .with_context(|| format!("failed to decode {}", path.display()))?;

    println!("entries: {}", log.len());
    match log.verify_chain_detailed() {
        Ok(()) => {
            println!("chain: ok");
            Ok(ExitCode::SUCCESS)
        }
        Err(failure) => {
            println!("chain: broken at entry {} ({})", failure.index, failure.kind);
            Ok(ExitCode::from(1))
        }
    }
}

/// Replay a snapshot with no handlers and print state, counts and health.
fn handle_inspect(path: &Path) -> anyhow::Result<ExitCode> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let snapshot: NodeSnapshot = serde_json::from_str(&contents)
        .with_context(|| format!("failed to decode {}", path.display()))?;
    let node = Node::replay(snapshot, HandlerRegistry::new())
        .with_context(|| format!("failed to replay {}", path.display()))?;

    let incidents: BTreeMap<String, usize> = node
        .incidents()
        .counts_by_severity()
        .into_iter()
        .map(|(severity, count)| (severity.to_string(), count))
        .collect();
    let summary = json!({
        "node_id": node.identity().node_id(),
        "state": node.state().to_string(),
        "tick": node.tick(),
        "audit_len": node.audit().len(),
        "incidents": incidents,
        "health": node.health().snapshot(),
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(ExitCode::SUCCESS)
}

/// Validate a config and print the identity it derives.
fn handle_check_config(config: NodeConfig) -> anyhow::Result<ExitCode> {
    config.validate()?;
    let identity = config.identity()?;

    println!("node_id: {}", identity.node_id());
    println!("attestation: {:?}", identity.scheme());
    println!("public_key: {}", hex::encode(identity.public_key()));
    println!("policy rules: {}", config.policy.rules.len());
    println!("health thresholds: {}", config.health.thresholds.len());
    println!("config ok");
    Ok(ExitCode::SUCCESS)
}

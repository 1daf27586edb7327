//! Configuration loading for a node.
//!
//! Loads `NodeConfig` from `./nodekernel.toml` (or `$NODEKERNEL_CONFIG_PATH`).
//! Environment variables override file values; file values override defaults.
//!
//! Precedence: env vars > config file > defaults.

use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::kernel::clock::ClockKind;
use crate::kernel::health::{validate_thresholds, AlertThreshold};
use crate::kernel::identity::{
    AttestationScheme, Attestor, DigestAttestor, Ed25519Attestor, NodeIdentity,
};
use crate::kernel::node::{KernelSettings, Node, DEFAULT_HANDLER_TIMEOUT_MS};
use crate::kernel::policy::PolicySet;
use crate::types::domain_hash;

/// Env var naming the config file.
pub const CONFIG_PATH_ENV: &str = "NODEKERNEL_CONFIG_PATH";

/// Config file used when [`CONFIG_PATH_ENV`] is unset.
pub const DEFAULT_CONFIG_FILE: &str = "nodekernel.toml";

const SEED_PREFIX: &[u8] = b"NODEKERNEL-SEED\0";

// ── Top-level config ────────────────────────────────────────────

/// Top-level node configuration loaded from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Identity settings (`[node]`).
    pub node: NodeSection,
    /// Kernel settings (`[kernel]`).
    pub kernel: KernelConfig,
    /// Ordered policy rules (`[[policy.rules]]`).
    pub policy: PolicySet,
    /// Health thresholds (`[[health.thresholds]]`).
    pub health: HealthConfig,
    /// Filesystem paths (`[paths]`).
    pub paths: PathsConfig,
}

impl NodeConfig {
    /// Load with precedence env vars > TOML file > defaults.
    ///
    /// A missing config file yields defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load() -> Result<Self> {
        let path = Self::config_path_with(|key| std::env::var(key).ok());
        let mut config = Self::load_from(&path)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Load from a TOML file only, no env overrides. A missing file yields
    /// defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_from(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(contents) => {
                tracing::info!(path = %path.display(), "loading config from file");
                Self::from_toml(&contents)
                    .with_context(|| format!("failed to load {}", path.display()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "no config file found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(e).with_context(|| format!("failed to read {}", path.display())),
        }
    }

    /// Resolve the config path using a custom env resolver.
    pub fn config_path_with(env: impl Fn(&str) -> Option<String>) -> PathBuf {
        env(CONFIG_PATH_ENV).map_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE), PathBuf::from)
    }

    /// Apply environment variable overrides.
    ///
    /// Takes a resolver so tests never mutate the process environment.
    /// Unparseable values are ignored with a warning.
    pub fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(v) = env("NODEKERNEL_NODE_ID") {
            self.node.node_id = v;
        }
        if let Some(v) = env("NODEKERNEL_LOG_LEVEL") {
            self.kernel.log_level = v;
        }
        if let Some(v) = env("NODEKERNEL_CLOCK") {
            match v.parse() {
                Ok(clock) => self.kernel.clock = clock,
                Err(_) => tracing::warn!(
                    var = "NODEKERNEL_CLOCK",
                    value = %v,
                    "ignoring invalid env override"
                ),
            }
        }
        if let Some(v) = env("NODEKERNEL_HANDLER_TIMEOUT_MS") {
            match v.parse() {
                Ok(ms) => self.kernel.handler_timeout_ms = ms,
                Err(_) => tracing::warn!(
                    var = "NODEKERNEL_HANDLER_TIMEOUT_MS",
                    value = %v,
                    "ignoring invalid env override"
                ),
            }
        }
        if let Some(v) = env("NODEKERNEL_LOGS_DIR") {
            self.paths.logs_dir = Some(v);
        }
    }

    /// Parse a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed TOML, unknown enum values or invalid
    /// capability patterns.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str).context("failed to parse config TOML")
    }

    /// Check the configuration can bootstrap a node.
    ///
    /// # Errors
    ///
    /// Returns the first problem found: an unusable policy budget, a
    /// duplicate or non-alerting threshold, a malformed key seed, or a zero
    /// handler timeout.
    pub fn validate(&self) -> Result<()> {
        self.policy.validate().context("invalid policy")?;

        validate_thresholds(&self.health.thresholds)?;

        if self.kernel.handler_timeout_ms == 0 {
            bail!("kernel.handler_timeout_ms must be positive");
        }

        self.key_seed()?;
        Ok(())
    }

    /// 32-byte key seed: `node.key_seed` when set, otherwise derived from
    /// the node id. A derived seed is public and only suits local use.
    ///
    /// # Errors
    ///
    /// Returns an error if `node.key_seed` is not 64 hex characters.
    pub fn key_seed(&self) -> Result<[u8; 32]> {
        match &self.node.key_seed {
            Some(hex_seed) => {
                let bytes = hex::decode(hex_seed).context("node.key_seed is not valid hex")?;
                <[u8; 32]>::try_from(bytes.as_slice())
                    .map_err(|_| anyhow::anyhow!("node.key_seed must be 32 bytes, got {}", bytes.len()))
            }
            None => Ok(domain_hash(SEED_PREFIX, &[self.node.node_id.as_bytes()])),
        }
    }

    /// Attestor for the configured scheme and seed.
    ///
    /// # Errors
    ///
    /// Returns an error if the key seed is malformed.
    pub fn attestor(&self) -> Result<Box<dyn Attestor>> {
        let seed = self.key_seed()?;
        Ok(match self.node.attestation {
            AttestationScheme::Digest => Box::new(DigestAttestor::from_seed(&seed)),
            AttestationScheme::Ed25519 => Box::new(Ed25519Attestor::from_seed(&seed)),
        })
    }

    /// Build and attest the node identity.
    ///
    /// # Errors
    ///
    /// Returns an error for a malformed node id or key seed.
    pub fn identity(&self) -> Result<NodeIdentity> {
        let attestor = self.attestor()?;
        NodeIdentity::create(
            self.node.node_id.clone(),
            attestor.as_ref(),
            self.node.attestation_nonce,
        )
        .context("failed to create node identity")
    }

    /// Kernel settings recorded in the node's state.
    pub fn settings(&self) -> KernelSettings {
        KernelSettings {
            handler_timeout_ms: self.kernel.handler_timeout_ms,
            clock: self.kernel.clock,
        }
    }

    /// Validate and bootstrap a node in `Init` with no handlers.
    ///
    /// # Errors
    ///
    /// Returns an error if validation or bootstrap fails.
    pub fn build_node(&self) -> Result<Node> {
        self.validate()?;
        let node = Node::bootstrap(
            self.identity()?,
            self.policy.clone(),
            self.health.thresholds.clone(),
            self.settings(),
        )?;
        Ok(node)
    }
}

// ── Node identity ───────────────────────────────────────────────

/// Identity settings (`[node]`).
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    /// Node id.
    pub node_id: String,
    /// Attestation scheme.
    pub attestation: AttestationScheme,
    /// Hex-encoded 32-byte key seed.
    pub key_seed: Option<String>,
    /// Nonce bound into the attestation.
    pub attestation_nonce: u64,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            node_id: "node-1".to_owned(),
            attestation: AttestationScheme::Digest,
            key_seed: None,
            attestation_nonce: 0,
        }
    }
}

impl fmt::Debug for NodeSection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeSection")
            .field("node_id", &self.node_id)
            .field("attestation", &self.attestation)
            .field("key_seed", &self.key_seed.as_ref().map(|_| "__REDACTED__"))
            .field("attestation_nonce", &self.attestation_nonce)
            .finish()
    }
}

// ── Kernel config ───────────────────────────────────────────────

/// Kernel settings (`[kernel]`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Tracing filter used when `RUST_LOG` is unset.
    pub log_level: String,
    /// Timestamp source.
    pub clock: ClockKind,
    /// Advisory handler timeout.
    pub handler_timeout_ms: u64,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_owned(),
            clock: ClockKind::Logical,
            handler_timeout_ms: DEFAULT_HANDLER_TIMEOUT_MS,
        }
    }
}

// ── Health config ───────────────────────────────────────────────

/// Health settings (`[health]`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Alert thresholds.
    pub thresholds: Vec<AlertThreshold>,
}

// ── Paths config ────────────────────────────────────────────────

/// Filesystem paths (`[paths]`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Directory for rotated JSON log files. Console-only logging when unset.
    pub logs_dir: Option<String>,
}

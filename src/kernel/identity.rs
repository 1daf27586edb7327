//! Node identity and attestation.
//!
//! A [`NodeIdentity`] binds a node id to public key material through an
//! attestation produced by a swappable [`Attestor`]. Two schemes ship:
//!
//! - [`DigestAttestor`]: a keyed SHA-256 digest over public data. Anyone who
//!   knows the public key can produce a valid attestation, so this is a
//!   placeholder for tests and local tooling, not a signature scheme.
//! - [`Ed25519Attestor`]: a real Ed25519 signature over the same message.
//!
//! Both are deterministic: the same node id, key, and nonce always yield the
//! same attestation bytes.

use std::fmt;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::domain_hash;

/// Maximum node id length in bytes.
pub const MAX_NODE_ID_LEN: usize = 128;

/// Maximum public key length in bytes.
pub const MAX_PUBLIC_KEY_LEN: usize = 64;

const ATTEST_PREFIX: &[u8] = b"NODEKERNEL-ATTEST\0";
const DIGEST_KEY_PREFIX: &[u8] = b"NODEKERNEL-DIGEST-KEY\0";
const DIGEST_SIG_PREFIX: &[u8] = b"NODEKERNEL-DIGEST-SIG\0";

/// Identity construction errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    /// Node id or key material failed well-formedness checks.
    #[error("malformed identity: {field} {reason}")]
    MalformedIdentity {
        /// Offending field.
        field: &'static str,
        /// What was wrong with it.
        reason: String,
    },
    /// The attestor's key does not belong to this identity.
    #[error("attestor key does not match identity public key")]
    KeyMismatch,
    /// The stored attestation does not verify for this node id and key.
    #[error("attestation does not verify for node '{node_id}'")]
    AttestationInvalid {
        /// Node whose attestation failed.
        node_id: String,
    },
}

/// Attestation scheme tag stored alongside the identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttestationScheme {
    /// Keyed digest over public data. Not cryptographically sound.
    Digest,
    /// Ed25519 signature.
    Ed25519,
}

impl AttestationScheme {
    /// Verify `attestation` over `message` for `public_key` under this scheme.
    pub fn verify(self, public_key: &[u8], message: &[u8], attestation: &[u8]) -> bool {
        match self {
            Self::Digest => digest_sign(public_key, message).as_slice() == attestation,
            Self::Ed25519 => ed25519_verify(public_key, message, attestation),
        }
    }
}

/// Produces attestations for a node's public key.
pub trait Attestor: Send + Sync {
    /// Scheme tag recorded in the identity.
    fn scheme(&self) -> AttestationScheme;
    /// Public key bytes bound into the identity.
    fn public_key(&self) -> Vec<u8>;
    /// Deterministically sign `message`.
    fn sign(&self, message: &[u8]) -> Vec<u8>;
}

// ── Digest scheme ──────────────────────────────────────────────

/// Toy attestor: attestation is `SHA-256(prefix ∥ public_key ∥ message)`.
#[derive(Debug, Clone)]
pub struct DigestAttestor {
    public_key: Vec<u8>,
}

impl DigestAttestor {
    /// Derive a 32-byte public key from a seed.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            public_key: domain_hash(DIGEST_KEY_PREFIX, &[seed]).to_vec(),
        }
    }

    /// Use explicit public key bytes.
    pub fn with_public_key(public_key: Vec<u8>) -> Self {
        Self { public_key }
    }
}

impl Attestor for DigestAttestor {
    fn scheme(&self) -> AttestationScheme {
        AttestationScheme::Digest
    }

    fn public_key(&self) -> Vec<u8> {
        self.public_key.clone()
    }

    fn sign(&self, message: &[u8]) -> Vec<u8> {
        digest_sign(&self.public_key, message).to_vec()
    }
}

fn digest_sign(public_key: &[u8], message: &[u8]) -> [u8; 32] {
    domain_hash(DIGEST_SIG_PREFIX, &[public_key, message])
}

// ── Ed25519 scheme ─────────────────────────────────────────────

/// Ed25519 attestor backed by a signing key held in memory.
pub struct Ed25519Attestor {
    signing_key: SigningKey,
}

impl fmt::Debug for Ed25519Attestor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ed25519Attestor")
            .field("signing_key", &"__REDACTED__")
            .field("public_key", &hex::encode(self.signing_key.verifying_key().as_bytes()))
            .finish()
    }
}

impl Ed25519Attestor {
    /// Build from a 32-byte secret seed.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(seed),
        }
    }

    /// Generate a fresh key from the OS RNG.
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut rand::rngs::OsRng),
        }
    }
}

impl Attestor for Ed25519Attestor {
    fn scheme(&self) -> AttestationScheme {
        AttestationScheme::Ed25519
    }

    fn public_key(&self) -> Vec<u8> {
        self.signing_key.verifying_key().to_bytes().to_vec()
    }

    fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signing_key.sign(message).to_bytes().to_vec()
    }
}

fn ed25519_verify(public_key: &[u8], message: &[u8], attestation: &[u8]) -> bool {
    let Ok(key_bytes) = <[u8; 32]>::try_from(public_key) else {
        return false;
    };
    let Ok(verifying_key) = VerifyingKey::from_bytes(&key_bytes) else {
        return false;
    };
    let Ok(signature) = Signature::from_slice(attestation) else {
        return false;
    };
    verifying_key.verify(message, &signature).is_ok()
}

// ── NodeIdentity ───────────────────────────────────────────────

/// Immutable identity of a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeIdentity {
    node_id: String,
    #[serde(with = "b64")]
    public_key: Vec<u8>,
    #[serde(with = "b64")]
    attestation: Vec<u8>,
    scheme: AttestationScheme,
    nonce: u64,
}

impl NodeIdentity {
    /// Create an identity for `node_id`, attesting the attestor's public key.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::MalformedIdentity`] when the node id or key
    /// fails well-formedness checks.
    pub fn create(
        node_id: impl Into<String>,
        attestor: &dyn Attestor,
        nonce: u64,
    ) -> Result<Self, IdentityError> {
        let node_id = node_id.into();
        let public_key = attestor.public_key();
        let scheme = attestor.scheme();
        check_node_id(&node_id)?;
        check_public_key(&public_key, scheme)?;

        let attestation = attestor.sign(&attestation_message(&node_id, &public_key, nonce));
        Ok(Self {
            node_id,
            public_key,
            attestation,
            scheme,
            nonce,
        })
    }

    /// Recompute the attestation with `attestor`.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::KeyMismatch`] if the attestor holds a
    /// different key or scheme.
    pub fn attest(&self, attestor: &dyn Attestor) -> Result<Vec<u8>, IdentityError> {
        if attestor.scheme() != self.scheme || attestor.public_key() != self.public_key {
            return Err(IdentityError::KeyMismatch);
        }
        Ok(attestor.sign(&self.message()))
    }

    /// Whether the stored attestation verifies.
    pub fn is_valid(&self) -> bool {
        verify(self, &self.attestation)
    }

    /// Well-formedness checks plus attestation verification, for identities
    /// loaded from storage.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::MalformedIdentity`] or
    /// [`IdentityError::AttestationInvalid`].
    pub fn validate(&self) -> Result<(), IdentityError> {
        self.check_well_formed()?;
        if !self.is_valid() {
            return Err(IdentityError::AttestationInvalid {
                node_id: self.node_id.clone(),
            });
        }
        Ok(())
    }

    /// Re-run the well-formedness checks on a deserialised identity.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::MalformedIdentity`] on the first failed check.
    pub fn check_well_formed(&self) -> Result<(), IdentityError> {
        check_node_id(&self.node_id)?;
        check_public_key(&self.public_key, self.scheme)
    }

    /// Node id.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Public key bytes.
    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    /// Stored attestation bytes.
    pub fn attestation(&self) -> &[u8] {
        &self.attestation
    }

    /// Scheme used to produce the attestation.
    pub fn scheme(&self) -> AttestationScheme {
        self.scheme
    }

    /// Attestation nonce.
    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    fn message(&self) -> Vec<u8> {
        attestation_message(&self.node_id, &self.public_key, self.nonce)
    }
}

/// Verify `attestation` against the identity's node id and public key.
pub fn verify(identity: &NodeIdentity, attestation: &[u8]) -> bool {
    identity
        .scheme
        .verify(&identity.public_key, &identity.message(), attestation)
}

fn attestation_message(node_id: &str, public_key: &[u8], nonce: u64) -> Vec<u8> {
    let mut msg = Vec::with_capacity(
        ATTEST_PREFIX
            .len()
            .saturating_add(node_id.len())
            .saturating_add(public_key.len())
            .saturating_add(9),
    );
    msg.extend_from_slice(ATTEST_PREFIX);
    msg.extend_from_slice(node_id.as_bytes());
    msg.push(0);
    msg.extend_from_slice(public_key);
    msg.extend_from_slice(&nonce.to_le_bytes());
    msg
}

fn check_node_id(node_id: &str) -> Result<(), IdentityError> {
    if node_id.is_empty() {
        return Err(malformed("node_id", "is empty"));
    }
    if node_id.len() > MAX_NODE_ID_LEN {
        return Err(malformed(
            "node_id",
            format!("exceeds {MAX_NODE_ID_LEN} bytes"),
        ));
    }
    if !node_id
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b"._:-".contains(&b))
    {
        return Err(malformed("node_id", "contains characters outside [A-Za-z0-9._:-]"));
    }
    Ok(())
}

fn check_public_key(public_key: &[u8], scheme: AttestationScheme) -> Result<(), IdentityError> {
    if public_key.is_empty() {
        return Err(malformed("public_key", "is empty"));
    }
    if public_key.len() > MAX_PUBLIC_KEY_LEN {
        return Err(malformed(
            "public_key",
            format!("exceeds {MAX_PUBLIC_KEY_LEN} bytes"),
        ));
    }
    if scheme == AttestationScheme::Ed25519 && public_key.len() != 32 {
        return Err(malformed(
            "public_key",
            format!("must be 32 bytes for ed25519, got {}", public_key.len()),
        ));
    }
    Ok(())
}

fn malformed(field: &'static str, reason: impl Into<String>) -> IdentityError {
    IdentityError::MalformedIdentity {
        field,
        reason: reason.into(),
    }
}

/// Base64 (standard alphabet) serde adapter for byte fields.
mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

//! Policy store — loads, verifies, and caches the active policy document.
//!
//! A policy file is UTF-8 JSON; when verification is enabled a detached
//! signature lives next to it at `<path>.sig` (base64, RSA-SHA256 or Ed25519
//! over the exact file bytes). Any parse or verification failure refuses to
//! install the candidate and leaves the previous policy active.

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use base64::Engine as _;
use chrono::{DateTime, Utc};
use ed25519_dalek::pkcs8::DecodePublicKey as _;
use ed25519_dalek::Verifier as _;
use rsa::pkcs8::DecodePublicKey as _;
use rsa::signature::Verifier as _;
use tracing::{info, warn};

use crate::canonical::sha256_hex;
use crate::error::KernelError;
use crate::policy::document::Policy;

// ─── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("policy_signature_invalid")]
    SignatureInvalid,
    #[error("policy_verify_enabled_but_no_policy_path")]
    NoPolicyPath,
    #[error("policy_verify_enabled_but_no_public_key")]
    NoPublicKey,
    #[error("policy parse failed: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("policy read failed: {0}")]
    Io(#[from] std::io::Error),
}

impl PolicyError {
    /// Stable reason token for this failure.
    pub fn token(&self) -> &'static str {
        match self {
            PolicyError::SignatureInvalid => "policy_signature_invalid",
            PolicyError::NoPolicyPath => "policy_verify_enabled_but_no_policy_path",
            PolicyError::NoPublicKey => "policy_verify_enabled_but_no_public_key",
            PolicyError::Parse(_) => "policy_parse_failed",
            PolicyError::Io(_) => "policy_read_failed",
        }
    }
}

// ─── Active policy ────────────────────────────────────────────────────────────

/// The currently installed policy plus its provenance.
#[derive(Debug, Clone)]
pub struct ActivePolicy {
    pub policy: Arc<Policy>,
    /// SHA-256 of the exact policy file bytes — emitted with every
    /// proposal's provenance.
    pub sha256: String,
    /// Whether the install went through signature verification.
    pub signed: bool,
    pub loaded_at: DateTime<Utc>,
    pub source: Option<PathBuf>,
}

// ─── Store ────────────────────────────────────────────────────────────────────

/// Verification requirements, captured once at construction.
#[derive(Debug, Clone, Default)]
pub struct VerifyOptions {
    /// Require signature verification on every load.
    pub verify: bool,
    /// Dispatch fails closed unless a signed policy is installed.
    pub require_signed: bool,
    /// PEM-encoded public key (SPKI): Ed25519 or RSA.
    pub public_key_pem: Option<String>,
}

pub struct PolicyStore {
    opts: VerifyOptions,
    active: RwLock<Option<ActivePolicy>>,
}

impl PolicyStore {
    pub fn new(opts: VerifyOptions) -> Self {
        PolicyStore {
            opts,
            active: RwLock::new(None),
        }
    }

    /// Install `policy` directly, bypassing file I/O. Used by embedders and
    /// tests; the install is marked unsigned.
    pub fn install_unsigned(&self, policy: Policy) -> ActivePolicy {
        let bytes = serde_json::to_vec(&policy).unwrap_or_default();
        let active = ActivePolicy {
            policy: Arc::new(policy),
            sha256: sha256_hex(&bytes),
            signed: false,
            loaded_at: Utc::now(),
            source: None,
        };
        *self.active.write().expect("policy lock poisoned") = Some(active.clone());
        active
    }

    /// Load a policy from `path`, verifying `<path>.sig` when verification is
    /// enabled. On any failure the previous policy stays active.
    pub fn load(&self, path: &Path) -> Result<ActivePolicy, PolicyError> {
        let bytes = std::fs::read(path)?;

        let signed = if self.opts.verify {
            let pem = self
                .opts
                .public_key_pem
                .as_deref()
                .ok_or(PolicyError::NoPublicKey)?;
            let sig_path = sig_path_for(path);
            let sig_b64 = std::fs::read_to_string(&sig_path).map_err(|e| {
                warn!(path = %sig_path.display(), err = %e, "detached signature unreadable");
                PolicyError::SignatureInvalid
            })?;
            verify_detached(pem, &bytes, sig_b64.trim())?;
            true
        } else {
            false
        };

        let policy: Policy = serde_json::from_slice(&bytes)?;
        let active = ActivePolicy {
            policy: Arc::new(policy),
            sha256: sha256_hex(&bytes),
            signed,
            loaded_at: Utc::now(),
            source: Some(path.to_path_buf()),
        };
        info!(
            sha256 = %active.sha256,
            signed,
            path = %path.display(),
            "policy installed"
        );
        *self.active.write().expect("policy lock poisoned") = Some(active.clone());
        Ok(active)
    }

    /// Load from a configured path, honoring the verify options. A `None`
    /// path with verification enabled is its own failure mode.
    pub fn load_configured(&self, path: Option<&Path>) -> Result<ActivePolicy, PolicyError> {
        match path {
            Some(p) => self.load(p),
            None if self.opts.verify => Err(PolicyError::NoPolicyPath),
            None => Err(PolicyError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "no policy path configured",
            ))),
        }
    }

    /// The currently active policy, if any.
    pub fn active(&self) -> Option<ActivePolicy> {
        self.active.read().expect("policy lock poisoned").clone()
    }

    /// Active policy for dispatch. Fails closed when signed-policy mode is
    /// required and no signed policy is installed.
    pub fn active_for_dispatch(&self) -> Result<ActivePolicy, KernelError> {
        let active = self.active();
        if self.opts.require_signed {
            match active {
                Some(a) if a.signed => Ok(a),
                _ => Err(KernelError::denied(vec![
                    "policy:signed_policy_required".to_string()
                ])),
            }
        } else {
            active.ok_or_else(|| {
                KernelError::denied(vec!["policy:no_policy_installed".to_string()])
            })
        }
    }

    /// Strict intersection of the active policy with caller constraints.
    /// Never mutates the installed document.
    pub fn constrained(&self, constraints: &Policy) -> Result<Policy, KernelError> {
        let active = self.active_for_dispatch()?;
        Ok(active.policy.intersect(constraints))
    }

    /// Fingerprint of the active policy bytes.
    pub fn sha256(&self) -> Option<String> {
        self.active().map(|a| a.sha256)
    }
}

fn sig_path_for(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".sig");
    PathBuf::from(os)
}

// ─── Signature verification ───────────────────────────────────────────────────

/// Verify a base64 detached signature over `bytes` with a PEM public key.
/// Accepts Ed25519 or RSA-SHA256 (PKCS#1 v1.5), keyed off what the PEM
/// actually decodes to.
fn verify_detached(pem: &str, bytes: &[u8], sig_b64: &str) -> Result<(), PolicyError> {
    let sig = base64::engine::general_purpose::STANDARD
        .decode(sig_b64)
        .map_err(|_| PolicyError::SignatureInvalid)?;

    if let Ok(key) = ed25519_dalek::VerifyingKey::from_public_key_pem(pem) {
        let sig = ed25519_dalek::Signature::from_slice(&sig)
            .map_err(|_| PolicyError::SignatureInvalid)?;
        return key
            .verify(bytes, &sig)
            .map_err(|_| PolicyError::SignatureInvalid);
    }

    if let Ok(key) = rsa::RsaPublicKey::from_public_key_pem(pem) {
        let vk = rsa::pkcs1v15::VerifyingKey::<sha2::Sha256>::new(key);
        let sig = rsa::pkcs1v15::Signature::try_from(sig.as_slice())
            .map_err(|_| PolicyError::SignatureInvalid)?;
        return vk
            .verify(bytes, &sig)
            .map_err(|_| PolicyError::SignatureInvalid);
    }

    warn!("policy public key is neither Ed25519 nor RSA SPKI PEM");
    Err(PolicyError::SignatureInvalid)
}

//! Manifest signature verification and cache-path sanitization.
//!
//! Grounded on the teacher's own path-safety checks in its blob store and
//! its Ed25519 usage pattern: canonicalize first, verify against every
//! trusted key, accept on the first match.

use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use oneiric_model::{OneiricError, PathTraversalError, RemoteManifest, RemoteSyncError, RemoteSyncErrorReason};
use serde_json::Value;

use crate::environment::FactoryAllowlist;

/// Trusted Ed25519 public keys loaded from `ONEIRIC_TRUSTED_PUBLIC_KEYS`.
/// Malformed entries are skipped with a warning rather than failing parsing
/// outright.
#[derive(Default)]
pub struct TrustedKeySet {
    keys: Vec<VerifyingKey>,
}

impl TrustedKeySet {
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn from_keys(keys: Vec<VerifyingKey>) -> Self {
        Self { keys }
    }

    /// Parse `ONEIRIC_TRUSTED_PUBLIC_KEYS`: a comma-separated list of
    /// base64-encoded 32-byte Ed25519 public keys.
    pub fn parse(raw: &str) -> Self {
        let mut keys = Vec::new();
        for entry in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            match BASE64.decode(entry) {
                Ok(bytes) => match <[u8; 32]>::try_from(bytes.as_slice()) {
                    Ok(array) => match VerifyingKey::from_bytes(&array) {
                        Ok(key) => keys.push(key),
                        Err(_) => {
                            tracing::warn!(key = entry, "trusted key is not a valid ed25519 point");
                        }
                    },
                    Err(_) => {
                        tracing::warn!(key = entry, "trusted key is not 32 bytes after decoding");
                    }
                },
                Err(_) => {
                    tracing::warn!(key = entry, "trusted key is not valid base64");
                }
            }
        }
        Self { keys }
    }

    fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        self.keys.iter().any(|key| key.verify(message, signature).is_ok())
    }
}

/// Canonical signing payload: the manifest with `signature` and
/// `signature_algorithm` removed, serialized as sorted-key compact JSON.
pub fn canonical_payload(manifest: &RemoteManifest) -> Result<Vec<u8>, RemoteSyncError> {
    let mut value = serde_json::to_value(manifest)
        .map_err(|e| RemoteSyncError::new(RemoteSyncErrorReason::Schema, e.to_string()))?;
    if let Value::Object(map) = &mut value {
        map.remove("signature");
        map.remove("signature_algorithm");
    }
    let sorted = sort_keys(value);
    serde_json::to_vec(&sorted).map_err(|e| RemoteSyncError::new(RemoteSyncErrorReason::Schema, e.to_string()))
}

fn sort_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut sorted = serde_json::Map::new();
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for key in keys {
                sorted.insert(key.clone(), sort_keys(map[key].clone()));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_keys).collect()),
        other => other,
    }
}

/// Verify a manifest's signature against the trusted key set.
///
/// - No signature present: accepted with a warning, unless `require_signature`.
/// - Signature present: rejected unless at least one trusted key verifies it.
pub fn verify_manifest(
    manifest: &RemoteManifest,
    trusted: &TrustedKeySet,
    require_signature: bool,
) -> Result<(), RemoteSyncError> {
    let Some(signature_b64) = manifest.signature.as_ref() else {
        if require_signature {
            return Err(RemoteSyncError::new(
                RemoteSyncErrorReason::Signature,
                "manifest is unsigned and require_signature is set",
            ));
        }
        tracing::warn!(source = %manifest.source, "accepting unsigned manifest");
        return Ok(());
    };

    if manifest.signature_algorithm != "ed25519" {
        return Err(RemoteSyncError::new(
            RemoteSyncErrorReason::Signature,
            format!("unsupported signature algorithm {}", manifest.signature_algorithm),
        ));
    }

    let signature_bytes = BASE64
        .decode(signature_b64)
        .map_err(|e| RemoteSyncError::new(RemoteSyncErrorReason::Signature, e.to_string()))?;
    let signature_array = <[u8; 64]>::try_from(signature_bytes.as_slice())
        .map_err(|_| RemoteSyncError::new(RemoteSyncErrorReason::Signature, "signature is not 64 bytes"))?;
    let signature = Signature::from_bytes(&signature_array);

    let payload = canonical_payload(manifest)?;
    if trusted.verify(&payload, &signature) {
        Ok(())
    } else {
        Err(RemoteSyncError::new(
            RemoteSyncErrorReason::Signature,
            "no trusted key verified the manifest signature",
        ))
    }
}

/// Resolve `relative` against `cache_dir`, rejecting any path that would
/// escape it via an absolute path or `..` segment.
pub fn sanitize_cache_path(cache_dir: &Path, relative: &str) -> Result<PathBuf, PathTraversalError> {
    let candidate = Path::new(relative);
    if candidate.is_absolute() {
        return Err(PathTraversalError(format!("absolute path rejected: {relative}")));
    }
    let mut resolved = cache_dir.to_path_buf();
    for component in candidate.components() {
        use std::path::Component;
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                return Err(PathTraversalError(format!("parent-dir escape rejected: {relative}")))
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(PathTraversalError(format!("absolute path rejected: {relative}")))
            }
        }
    }
    if !resolved.starts_with(cache_dir) {
        return Err(PathTraversalError(format!("escapes cache directory: {relative}")));
    }
    Ok(resolved)
}

/// Validate an artifact URI: must be `http(s)://` or a file path that
/// passes the same cache-directory containment check.
pub fn validate_artifact_uri(cache_dir: &Path, uri: &str) -> Result<(), PathTraversalError> {
    if uri.starts_with("http://") || uri.starts_with("https://") {
        return Ok(());
    }
    sanitize_cache_path(cache_dir, uri).map(|_| ())
}

/// Reject a factory reference that the allowlist does not permit.
pub fn check_factory_allowed(allowlist: &FactoryAllowlist, factory_ref: &str) -> Result<(), OneiricError> {
    if allowlist.allows(factory_ref) {
        Ok(())
    } else {
        Err(OneiricError::FactoryForbidden(factory_ref.to_string()))
    }
}

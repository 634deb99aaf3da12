//! Signing and encryption of secure snapshot blobs.
//!
//! A [`SecureFilePolicy`] is built once from [`ProcessStateConfig`] when a
//! store is constructed. Blobs whose path matches one of the configured
//! patterns are sealed by the selected codec on import and verified on
//! export; a verification failure is reported as
//! [`ProcessStateError::IntegrityError`].

use crate::{ProcessStateConfig, ProcessStateError, StateResult};
use aes_gcm::{
    aead::{Aead, KeyInit, OsRng, Payload},
    Aes256Gcm,
};
use hmac::{Hmac, Mac};
use regex::Regex;
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;

pub const HMAC_SHA256: &str = "hmac-sha256";
pub const AES_256_GCM: &str = "aes-256-gcm";

const MIN_KEY_BYTES: usize = 16;
const AES_GCM_NONCE_BYTES: usize = 12;

/// Output of [`SecureBlobCodec::seal`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedBlob {
    pub data: Vec<u8>,
    pub tag: Option<Vec<u8>>,
}

/// Blob as persisted by a snapshot store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlob {
    pub data: Vec<u8>,
    pub mode: Option<u32>,
    /// Name of the codec that sealed the blob, if any.
    pub codec: Option<String>,
    pub tag: Option<Vec<u8>>,
}

/// Pluggable signing/encryption strategy for secure blobs. The blob path is
/// bound into the signature so a blob cannot be moved to another name.
pub trait SecureBlobCodec: fmt::Debug + Send + Sync {
    fn name(&self) -> &'static str;
    fn seal(&self, path: &str, data: &[u8]) -> StateResult<SealedBlob>;
    fn open(&self, path: &str, sealed: &SealedBlob) -> StateResult<Vec<u8>>;
}

fn integrity(path: &str, reason: impl Into<String>) -> ProcessStateError {
    ProcessStateError::IntegrityError {
        path: path.to_string(),
        reason: reason.into(),
    }
}

/// Detached HMAC-SHA256 signature; the blob itself is stored in clear.
pub struct HmacSha256Codec {
    key: Vec<u8>,
}

impl HmacSha256Codec {
    pub fn new(key: &[u8]) -> StateResult<Self> {
        ensure_key_length(key)?;
        Ok(Self { key: key.to_vec() })
    }

    fn mac(&self, path: &str, data: &[u8]) -> StateResult<Hmac<Sha256>> {
        let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(&self.key)
            .map_err(|_| ProcessStateError::Config("invalid HMAC key".to_string()))?;
        mac.update(path.as_bytes());
        mac.update(&[0]);
        mac.update(data);
        Ok(mac)
    }
}

impl fmt::Debug for HmacSha256Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HmacSha256Codec").finish_non_exhaustive()
    }
}

impl SecureBlobCodec for HmacSha256Codec {
    fn name(&self) -> &'static str {
        HMAC_SHA256
    }

    fn seal(&self, path: &str, data: &[u8]) -> StateResult<SealedBlob> {
        let tag = self.mac(path, data)?.finalize().into_bytes().to_vec();
        Ok(SealedBlob {
            data: data.to_vec(),
            tag: Some(tag),
        })
    }

    fn open(&self, path: &str, sealed: &SealedBlob) -> StateResult<Vec<u8>> {
        let Some(tag) = sealed.tag.as_deref() else {
            return Err(integrity(path, "missing signature"));
        };
        self.mac(path, &sealed.data)?
            .verify_slice(tag)
            .map_err(|_| integrity(path, "signature verification failed"))?;
        Ok(sealed.data.clone())
    }
}

/// AES-256-GCM encryption with a random nonce prepended to the ciphertext
/// and the blob path as associated data.
pub struct Aes256GcmCodec {
    cipher: Aes256Gcm,
}

impl Aes256GcmCodec {
    pub fn new(key: &[u8]) -> StateResult<Self> {
        ensure_key_length(key)?;
        let key_material = Sha256::digest(key);
        let cipher = Aes256Gcm::new_from_slice(&key_material)
            .map_err(|_| ProcessStateError::Config("invalid AES key material".to_string()))?;
        Ok(Self { cipher })
    }
}

impl fmt::Debug for Aes256GcmCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Aes256GcmCodec").finish_non_exhaustive()
    }
}

impl SecureBlobCodec for Aes256GcmCodec {
    fn name(&self) -> &'static str {
        AES_256_GCM
    }

    fn seal(&self, path: &str, data: &[u8]) -> StateResult<SealedBlob> {
        use aes_gcm::aead::rand_core::RngCore as _;
        let mut nonce = [0u8; AES_GCM_NONCE_BYTES];
        OsRng.fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher
            .encrypt(
                (&nonce).into(),
                Payload {
                    msg: data,
                    aad: path.as_bytes(),
                },
            )
            .map_err(|_| integrity(path, "encryption failed"))?;

        let mut sealed = Vec::with_capacity(AES_GCM_NONCE_BYTES + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(SealedBlob {
            data: sealed,
            tag: None,
        })
    }

    fn open(&self, path: &str, sealed: &SealedBlob) -> StateResult<Vec<u8>> {
        if sealed.data.len() <= AES_GCM_NONCE_BYTES {
            return Err(integrity(path, "ciphertext is truncated"));
        }
        let (nonce, ciphertext) = sealed.data.split_at(AES_GCM_NONCE_BYTES);
        self.cipher
            .decrypt(
                nonce.into(),
                Payload {
                    msg: ciphertext,
                    aad: path.as_bytes(),
                },
            )
            .map_err(|_| integrity(path, "decryption failed"))
    }
}

fn ensure_key_length(key: &[u8]) -> StateResult<()> {
    if key.len() < MIN_KEY_BYTES {
        return Err(ProcessStateError::Config(format!(
            "signing key must be at least {MIN_KEY_BYTES} bytes"
        )));
    }
    Ok(())
}

/// Decides which blobs are secure and seals/opens them.
#[derive(Debug, Clone, Default)]
pub struct SecureFilePolicy {
    patterns: Vec<Regex>,
    codec: Option<Arc<dyn SecureBlobCodec>>,
}

impl SecureFilePolicy {
    /// Policy that stores every blob as-is.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Builds the policy, failing on any inconsistent or unusable setting.
    pub fn from_config(config: &ProcessStateConfig) -> StateResult<Self> {
        let patterns = compile_patterns(&config.secure_files)?;
        let codec = match (&config.signing_algorithm, &config.signing_key_path) {
            (None, None) => None,
            (Some(_), None) => {
                return Err(ProcessStateError::Config(
                    "signing_algorithm requires signing_key_path".to_string(),
                ))
            }
            (None, Some(_)) => {
                return Err(ProcessStateError::Config(
                    "signing_key_path requires signing_algorithm".to_string(),
                ))
            }
            (Some(algorithm), Some(key_path)) => {
                let key = std::fs::read(key_path).map_err(|error| {
                    ProcessStateError::Config(format!(
                        "failed to read signing key '{}': {error}",
                        key_path.display()
                    ))
                })?;
                Some(codec_for(algorithm, &key)?)
            }
        };
        Ok(Self { patterns, codec })
    }

    pub fn with_codec(patterns: &[&str], codec: Arc<dyn SecureBlobCodec>) -> StateResult<Self> {
        let patterns: Vec<String> = patterns.iter().map(|pattern| pattern.to_string()).collect();
        Ok(Self {
            patterns: compile_patterns(&patterns)?,
            codec: Some(codec),
        })
    }

    pub fn codec_name(&self) -> Option<&'static str> {
        self.codec.as_ref().map(|codec| codec.name())
    }

    /// Returns true when `path` must be sealed under this policy.
    pub fn is_secure(&self, path: &str) -> bool {
        self.codec.is_some() && self.patterns.iter().any(|pattern| pattern.is_match(path))
    }

    pub fn seal(&self, path: &str, data: Vec<u8>, mode: Option<u32>) -> StateResult<StoredBlob> {
        match &self.codec {
            Some(codec) if self.is_secure(path) => {
                let sealed = codec.seal(path, &data)?;
                Ok(StoredBlob {
                    data: sealed.data,
                    mode,
                    codec: Some(codec.name().to_string()),
                    tag: sealed.tag,
                })
            }
            _ => Ok(StoredBlob {
                data,
                mode,
                codec: None,
                tag: None,
            }),
        }
    }

    /// Verifies and decodes a stored blob. A secure path stored without a
    /// seal, or sealed by a codec this policy does not hold, fails.
    pub fn open(&self, path: &str, blob: &StoredBlob) -> StateResult<Vec<u8>> {
        match (&blob.codec, &self.codec) {
            (None, _) if self.is_secure(path) => Err(integrity(path, "secure blob is not sealed")),
            (None, _) => Ok(blob.data.clone()),
            (Some(name), Some(codec)) if codec.name() == name => codec.open(
                path,
                &SealedBlob {
                    data: blob.data.clone(),
                    tag: blob.tag.clone(),
                },
            ),
            (Some(name), _) => Err(integrity(
                path,
                format!("no key configured for codec '{name}'"),
            )),
        }
    }
}

fn compile_patterns(patterns: &[String]) -> StateResult<Vec<Regex>> {
    patterns
        .iter()
        .map(|pattern| {
            Regex::new(pattern).map_err(|error| {
                ProcessStateError::Config(format!(
                    "invalid secure file pattern '{pattern}': {error}"
                ))
            })
        })
        .collect()
}

fn codec_for(algorithm: &str, key: &[u8]) -> StateResult<Arc<dyn SecureBlobCodec>> {
    match algorithm.trim().to_ascii_lowercase().as_str() {
        HMAC_SHA256 => Ok(Arc::new(HmacSha256Codec::new(key)?)),
        AES_256_GCM => Ok(Arc::new(Aes256GcmCodec::new(key)?)),
        other => Err(ProcessStateError::Config(format!(
            "unsupported signing algorithm '{other}'"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::{
        Aes256GcmCodec, HmacSha256Codec, SecureBlobCodec, SecureFilePolicy, AES_256_GCM,
        HMAC_SHA256,
    };
    use crate::{ProcessStateConfig, ProcessStateError};
    use std::sync::Arc;
    use tempfile::tempdir;

    const KEY: &[u8] = b"0123456789abcdef0123456789abcdef";

    #[test]
    fn hmac_detects_tampering_and_renames() {
        let codec = HmacSha256Codec::new(KEY).expect("codec");
        let mut sealed = codec.seal("a.secret", b"token").expect("seal");
        assert_eq!(codec.open("a.secret", &sealed).expect("open"), b"token");
        assert!(codec.open("b.secret", &sealed).is_err());

        sealed.data = b"t0ken".to_vec();
        let error = codec.open("a.secret", &sealed).expect_err("tampered");
        assert!(matches!(error, ProcessStateError::IntegrityError { .. }));
    }

    #[test]
    fn aes_gcm_round_trips_and_rejects_wrong_key() {
        let codec = Aes256GcmCodec::new(KEY).expect("codec");
        let sealed = codec.seal("vault/db.pass", b"hunter2").expect("seal");
        assert_ne!(sealed.data, b"hunter2");
        assert_eq!(codec.open("vault/db.pass", &sealed).expect("open"), b"hunter2");

        let other = Aes256GcmCodec::new(b"another-key-of-sixteen").expect("codec");
        assert!(matches!(
            other.open("vault/db.pass", &sealed),
            Err(ProcessStateError::IntegrityError { .. })
        ));
    }

    #[test]
    fn policy_seals_only_matching_paths() {
        let policy = SecureFilePolicy::with_codec(
            &[r"\.secret$"],
            Arc::new(HmacSha256Codec::new(KEY).expect("codec")),
        )
        .expect("policy");

        let plain = policy.seal("readme.md", b"hi".to_vec(), None).expect("seal");
        assert_eq!(plain.codec, None);
        let secure = policy.seal("x.secret", b"hi".to_vec(), None).expect("seal");
        assert_eq!(secure.codec.as_deref(), Some(HMAC_SHA256));

        let mut unsealed = secure.clone();
        unsealed.codec = None;
        assert!(policy.open("x.secret", &unsealed).is_err());
        assert!(SecureFilePolicy::disabled().open("x.secret", &secure).is_err());
    }

    #[test]
    fn from_config_rejects_inconsistent_settings() {
        let temp = tempdir().expect("create tempdir");
        let key_path = temp.path().join("signing.key");
        std::fs::write(&key_path, KEY).expect("write key");
        let short_key = temp.path().join("short.key");
        std::fs::write(&short_key, b"short").expect("write short key");

        let cases = [
            (Some(HMAC_SHA256), None),
            (None, Some(key_path.clone())),
            (Some("rot13"), Some(key_path.clone())),
            (Some(AES_256_GCM), Some(short_key)),
            (Some(AES_256_GCM), Some(temp.path().join("missing.key"))),
        ];
        for (algorithm, signing_key_path) in cases {
            let config = ProcessStateConfig {
                signing_algorithm: algorithm.map(str::to_string),
                signing_key_path,
                ..ProcessStateConfig::default()
            };
            assert!(
                matches!(
                    SecureFilePolicy::from_config(&config),
                    Err(ProcessStateError::Config(_))
                ),
                "{algorithm:?} must be rejected"
            );
        }

        let config = ProcessStateConfig {
            secure_files: vec!["(".to_string()],
            ..ProcessStateConfig::default()
        };
        assert!(SecureFilePolicy::from_config(&config).is_err());

        let config = ProcessStateConfig {
            secure_files: vec![r"\.pem$".to_string()],
            signing_algorithm: Some(AES_256_GCM.to_string()),
            signing_key_path: Some(key_path),
            ..ProcessStateConfig::default()
        };
        let policy = SecureFilePolicy::from_config(&config).expect("valid config");
        assert_eq!(policy.codec_name(), Some(AES_256_GCM));
        assert!(policy.is_secure("certs/server.pem"));
    }
}

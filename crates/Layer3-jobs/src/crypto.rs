//! Envelope encryption for offloaded payloads
//!
//! Each payload gets a fresh random 256-bit data key. The serialized payload
//! is sealed with AES-256-GCM under that key, and the data key itself is
//! wrapped by a [`KeyManager`]. Only the envelope is ever persisted.
//!
//! The local key manager derives a key-encryption key per wrap:
//! HKDF-SHA256(master key, random salt), then AES-256-GCM over the data key.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng, Payload as AeadPayload};
use aes_gcm::{Aes256Gcm, Nonce};
use async_trait::async_trait;
use hkdf::Hkdf;
use rand::RngCore;
use relay_foundation::secrecy::zeroize::Zeroizing;
use relay_foundation::secrecy::{ExposeSecret, SecretString};
use relay_foundation::{Error, KmsConfig, Payload, Result, TaskId};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;
use std::sync::Arc;

/// Envelope format version
pub const ENVELOPE_VERSION: u32 = 1;

const KEY_SIZE: usize = 32;
const NONCE_SIZE: usize = 12;
const SALT_SIZE: usize = 32;
const TAG_SIZE: usize = 16;

const WRAP_INFO: &[u8] = b"relay-key-wrap-v1";

/// Wraps and unwraps per-payload data keys
#[async_trait]
pub trait KeyManager: Send + Sync {
    /// Id recorded in every envelope this manager wraps
    fn key_id(&self) -> &str;

    async fn wrap_key(&self, data_key: &[u8]) -> Result<Vec<u8>>;

    async fn unwrap_key(&self, key_id: &str, wrapped: &[u8]) -> Result<Zeroizing<Vec<u8>>>;
}

// ============================================================================
// Local key manager
// ============================================================================

/// Key manager backed by a master key held in process memory
pub struct LocalKeyManager {
    key_id: String,
    master_key: SecretString,
}

impl LocalKeyManager {
    /// The master key must be at least 32 bytes
    pub fn new(key_id: impl Into<String>, master_key: SecretString) -> Result<Self> {
        if master_key.expose_secret().len() < KEY_SIZE {
            return Err(Error::Config(format!(
                "master key must be at least {} bytes",
                KEY_SIZE
            )));
        }
        Ok(Self {
            key_id: key_id.into(),
            master_key,
        })
    }

    pub fn from_config(config: &KmsConfig) -> Result<Self> {
        Self::new(config.key_id.clone(), config.master_key()?)
    }

    fn derive_kek(&self, salt: &[u8]) -> Result<Zeroizing<[u8; KEY_SIZE]>> {
        let hk = Hkdf::<Sha256>::new(Some(salt), self.master_key.expose_secret().as_bytes());
        let mut kek = Zeroizing::new([0u8; KEY_SIZE]);
        hk.expand(WRAP_INFO, &mut kek[..])
            .map_err(|_| Error::Confidentiality("key derivation failed".to_string()))?;
        Ok(kek)
    }
}

#[async_trait]
impl KeyManager for LocalKeyManager {
    fn key_id(&self) -> &str {
        &self.key_id
    }

    async fn wrap_key(&self, data_key: &[u8]) -> Result<Vec<u8>> {
        let mut salt = [0u8; SALT_SIZE];
        rand::thread_rng().fill_bytes(&mut salt);

        let kek = self.derive_kek(&salt)?;
        let cipher = Aes256Gcm::new_from_slice(&kek[..])
            .map_err(|e| Error::Confidentiality(format!("invalid wrapping key: {}", e)))?;
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let sealed = cipher
            .encrypt(
                &nonce,
                AeadPayload {
                    msg: data_key,
                    aad: self.key_id.as_bytes(),
                },
            )
            .map_err(|_| Error::Confidentiality("key wrap failed".to_string()))?;

        // salt || nonce || sealed key
        let mut out = Vec::with_capacity(SALT_SIZE + NONCE_SIZE + sealed.len());
        out.extend_from_slice(&salt);
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    async fn unwrap_key(&self, key_id: &str, wrapped: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        if key_id != self.key_id {
            return Err(Error::Confidentiality(format!(
                "envelope was wrapped with unknown key '{}'",
                key_id
            )));
        }
        if wrapped.len() < SALT_SIZE + NONCE_SIZE + TAG_SIZE {
            return Err(Error::Confidentiality("wrapped key is truncated".to_string()));
        }

        let (salt, rest) = wrapped.split_at(SALT_SIZE);
        let (nonce, sealed) = rest.split_at(NONCE_SIZE);

        let kek = self.derive_kek(salt)?;
        let cipher = Aes256Gcm::new_from_slice(&kek[..])
            .map_err(|e| Error::Confidentiality(format!("invalid wrapping key: {}", e)))?;
        let key = cipher
            .decrypt(
                Nonce::from_slice(nonce),
                AeadPayload {
                    msg: sealed,
                    aad: key_id.as_bytes(),
                },
            )
            .map_err(|_| Error::Confidentiality("key unwrap failed".to_string()))?;
        Ok(Zeroizing::new(key))
    }
}

impl fmt::Debug for LocalKeyManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalKeyManager")
            .field("key_id", &self.key_id)
            .field("master_key", &"[REDACTED]")
            .finish()
    }
}

// ============================================================================
// Envelope
// ============================================================================

/// Sealed payload as stored in `payload.enc`
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedPayload {
    pub version: u32,
    pub key_id: String,
    #[serde(with = "b64")]
    pub wrapped_key: Vec<u8>,
    #[serde(with = "b64")]
    pub nonce: Vec<u8>,
    #[serde(with = "b64")]
    pub ciphertext: Vec<u8>,
}

impl EncryptedPayload {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        serde_json::from_slice(raw)
            .map_err(|e| Error::Confidentiality(format!("malformed envelope: {}", e)))
    }
}

impl fmt::Debug for EncryptedPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptedPayload")
            .field("version", &self.version)
            .field("key_id", &self.key_id)
            .field("ciphertext_len", &self.ciphertext.len())
            .finish()
    }
}

/// Seals and opens payload envelopes
#[derive(Clone)]
pub struct EnvelopeCipher {
    keys: Arc<dyn KeyManager>,
}

impl EnvelopeCipher {
    pub fn new(keys: Arc<dyn KeyManager>) -> Self {
        Self { keys }
    }

    /// Seal the full payload. The envelope is bound to the payload's task id.
    pub async fn encrypt(&self, payload: &Payload) -> Result<EncryptedPayload> {
        let plaintext = Zeroizing::new(
            serde_json::to_vec(payload)
                .map_err(|e| Error::Confidentiality(format!("payload serialization: {}", e)))?,
        );

        let mut data_key = Zeroizing::new([0u8; KEY_SIZE]);
        rand::thread_rng().fill_bytes(&mut data_key[..]);

        let cipher = Aes256Gcm::new_from_slice(&data_key[..])
            .map_err(|e| Error::Confidentiality(format!("invalid data key: {}", e)))?;
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let aad = envelope_aad(&payload.task_id);
        let ciphertext = cipher
            .encrypt(
                &nonce,
                AeadPayload {
                    msg: plaintext.as_slice(),
                    aad: aad.as_bytes(),
                },
            )
            .map_err(|_| Error::Confidentiality("payload encryption failed".to_string()))?;

        let wrapped_key = self
            .keys
            .wrap_key(&data_key[..])
            .await
            .map_err(as_confidentiality)?;

        Ok(EncryptedPayload {
            version: ENVELOPE_VERSION,
            key_id: self.keys.key_id().to_string(),
            wrapped_key,
            nonce: nonce.to_vec(),
            ciphertext,
        })
    }

    /// Open an envelope stored for `task_id`
    pub async fn decrypt(&self, task_id: &TaskId, envelope: &EncryptedPayload) -> Result<Payload> {
        if envelope.version != ENVELOPE_VERSION {
            return Err(Error::Confidentiality(format!(
                "unsupported envelope version {}",
                envelope.version
            )));
        }
        if envelope.nonce.len() != NONCE_SIZE {
            return Err(Error::Confidentiality("envelope nonce has wrong length".to_string()));
        }

        let data_key = self
            .keys
            .unwrap_key(&envelope.key_id, &envelope.wrapped_key)
            .await
            .map_err(as_confidentiality)?;
        let cipher = Aes256Gcm::new_from_slice(data_key.as_slice())
            .map_err(|e| Error::Confidentiality(format!("invalid data key: {}", e)))?;

        let aad = envelope_aad(task_id);
        let plaintext = Zeroizing::new(
            cipher
                .decrypt(
                    Nonce::from_slice(&envelope.nonce),
                    AeadPayload {
                        msg: envelope.ciphertext.as_slice(),
                        aad: aad.as_bytes(),
                    },
                )
                .map_err(|_| Error::Confidentiality("payload decryption failed".to_string()))?,
        );

        let payload: Payload = serde_json::from_slice(&plaintext)
            .map_err(|e| Error::Confidentiality(format!("decrypted payload is malformed: {}", e)))?;
        if &payload.task_id != task_id {
            return Err(Error::Confidentiality(format!(
                "envelope belongs to task {}, not {}",
                payload.task_id, task_id
            )));
        }
        Ok(payload)
    }
}

fn envelope_aad(task_id: &TaskId) -> String {
    format!("relay-envelope-v{}:{}", ENVELOPE_VERSION, task_id)
}

fn as_confidentiality(err: Error) -> Error {
    match err {
        Error::Confidentiality(_) => err,
        other => Error::Confidentiality(other.to_string()),
    }
}

mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let raw = String::deserialize(de)?;
        STANDARD.decode(raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_foundation::RunRequest;

    const MASTER: &str = "0123456789abcdef0123456789abcdef";

    fn cipher(master: &str) -> EnvelopeCipher {
        let keys = LocalKeyManager::new("local-v1", SecretString::from(master.to_string())).unwrap();
        EnvelopeCipher::new(Arc::new(keys))
    }

    fn payload(task_id: &str) -> Payload {
        let raw = format!(
            r#"{{"mode":"offloaded","task_id":"{}","prompt":"fix the build","wait":true,
                "credentials":{{"api_key":"sk-ant-real-key"}},
                "options":{{"secrets":{{"GITHUB_TOKEN":"ghp_secretvalue"}}}}}}"#,
            task_id
        );
        RunRequest::from_json(&raw).unwrap().validate().unwrap()
    }

    #[tokio::test]
    async fn test_round_trip() {
        let cipher = cipher(MASTER);
        let original = payload("t-1");
        let envelope = cipher.encrypt(&original).await.unwrap();
        let opened = cipher.decrypt(&original.task_id, &envelope).await.unwrap();
        assert_eq!(opened.prompt, "fix the build");
        assert_eq!(opened.credential.secret().expose_secret(), "sk-ant-real-key");
        assert_eq!(opened.options.secrets["GITHUB_TOKEN"].expose_secret(), "ghp_secretvalue");
    }

    #[tokio::test]
    async fn test_envelope_never_holds_plaintext() {
        let envelope = cipher(MASTER).encrypt(&payload("t-1")).await.unwrap();
        let stored = String::from_utf8(envelope.to_bytes().unwrap()).unwrap();
        assert!(!stored.contains("sk-ant-real-key"));
        assert!(!stored.contains("ghp_secretvalue"));
        assert!(!stored.contains("fix the build"));
        assert!(stored.contains("\"keyId\": \"local-v1\""));
        assert_eq!(EncryptedPayload::from_bytes(stored.as_bytes()).unwrap(), envelope);
    }

    #[tokio::test]
    async fn test_fresh_data_key_per_payload() {
        let cipher = cipher(MASTER);
        let a = cipher.encrypt(&payload("t-1")).await.unwrap();
        let b = cipher.encrypt(&payload("t-1")).await.unwrap();
        assert_ne!(a.wrapped_key, b.wrapped_key);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[tokio::test]
    async fn test_tampered_ciphertext_fails() {
        let cipher = cipher(MASTER);
        let original = payload("t-1");
        let mut envelope = cipher.encrypt(&original).await.unwrap();
        if let Some(byte) = envelope.ciphertext.last_mut() {
            *byte ^= 0xFF;
        }
        let err = cipher.decrypt(&original.task_id, &envelope).await.unwrap_err();
        assert!(matches!(err, Error::Confidentiality(_)));
    }

    #[tokio::test]
    async fn test_envelope_bound_to_task() {
        let cipher = cipher(MASTER);
        let envelope = cipher.encrypt(&payload("t-1")).await.unwrap();
        let other = TaskId::parse("t-2").unwrap();
        assert!(cipher.decrypt(&other, &envelope).await.is_err());
    }

    #[tokio::test]
    async fn test_wrong_master_key_fails() {
        let original = payload("t-1");
        let envelope = cipher(MASTER).encrypt(&original).await.unwrap();
        let other = cipher("ffffffffffffffffffffffffffffffff");
        assert!(other.decrypt(&original.task_id, &envelope).await.is_err());
    }

    #[tokio::test]
    async fn test_unknown_key_id_and_version() {
        let cipher = cipher(MASTER);
        let original = payload("t-1");
        let envelope = cipher.encrypt(&original).await.unwrap();

        let mut renamed = envelope.clone();
        renamed.key_id = "kms-prod".into();
        assert!(cipher.decrypt(&original.task_id, &renamed).await.is_err());

        let mut future = envelope;
        future.version = 2;
        assert!(cipher.decrypt(&original.task_id, &future).await.is_err());
    }

    #[test]
    fn test_short_master_key_rejected() {
        let err = LocalKeyManager::new("k", SecretString::from("tooshort".to_string())).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_debug_redacts_master_key() {
        let keys = LocalKeyManager::new("k", SecretString::from(MASTER.to_string())).unwrap();
        assert!(!format!("{:?}", keys).contains(MASTER));
    }
}

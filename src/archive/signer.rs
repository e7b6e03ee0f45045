//! Archive record signing
//!
//! Signatures chain each archived record to its parent: the signed
//! message is the canonical byte form of the record, which embeds the
//! parent's signature string (empty for chain heads). Keys are ECDSA
//! P-384; signatures are encoded as `v1.<kid>.<base64url(sig)>` so a
//! verifier can pick the right public key for any record in the
//! chain, including ones signed before a rotation.

use std::collections::BTreeMap;
use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ring::rand::SystemRandom;
use ring::signature::{
    EcdsaKeyPair, KeyPair, UnparsedPublicKey, ECDSA_P384_SHA384_FIXED,
    ECDSA_P384_SHA384_FIXED_SIGNING,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Signature string version prefix
const SIGNATURE_VERSION: &str = "v1";

#[derive(Debug, Error)]
pub enum SignerError {
    #[error("no signing key available")]
    NoKey,

    #[error("unknown signing key {0}")]
    UnknownKey(String),

    #[error("malformed signature string")]
    MalformedSignature,

    #[error("signature verification failed")]
    VerificationFailed,

    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("signing failed")]
    SigningFailed,
}

impl From<SignerError> for crate::core::error::RepoError {
    fn from(e: SignerError) -> Self {
        crate::core::error::RepoError::Internal(Box::new(e))
    }
}

/// Stored form of a signing key: base64url PKCS#8 private half plus
/// the uncompressed public point. Verification-only entries carry no
/// private half.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SigningKeySpec {
    pub alg: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private: Option<String>,
    pub public: String,
}

/// One signing key. Holds the public half always and the key pair
/// when the private half is known.
pub struct SigningKey {
    kid: String,
    public: Vec<u8>,
    keypair: Option<EcdsaKeyPair>,
}

impl SigningKey {
    pub fn kid(&self) -> &str {
        &self.kid
    }

    pub fn can_sign(&self) -> bool {
        self.keypair.is_some()
    }

    /// Generate a fresh P-384 key pair.
    pub fn generate(kid: &str) -> Result<(Self, SigningKeySpec), SignerError> {
        let rng = SystemRandom::new();

        let pkcs8 = EcdsaKeyPair::generate_pkcs8(&ECDSA_P384_SHA384_FIXED_SIGNING, &rng)
            .map_err(|_| SignerError::SigningFailed)?;

        Self::from_private_der(kid, pkcs8.as_ref())
    }

    /// Load a key from its base64url PKCS#8 private form (the
    /// `SIGNING_KEY` configuration value).
    pub fn from_private_b64(kid: &str, b64: &str) -> Result<(Self, SigningKeySpec), SignerError> {
        let der = URL_SAFE_NO_PAD
            .decode(b64.trim())
            .map_err(|e| SignerError::InvalidKey(format!("bad base64 private key: {e}")))?;

        Self::from_private_der(kid, &der)
    }

    fn from_private_der(kid: &str, der: &[u8]) -> Result<(Self, SigningKeySpec), SignerError> {
        let rng = SystemRandom::new();

        let keypair = EcdsaKeyPair::from_pkcs8(&ECDSA_P384_SHA384_FIXED_SIGNING, der, &rng)
            .map_err(|e| SignerError::InvalidKey(e.to_string()))?;

        let public = keypair.public_key().as_ref().to_vec();

        let spec = SigningKeySpec {
            alg: "ES384".to_string(),
            private: Some(URL_SAFE_NO_PAD.encode(der)),
            public: URL_SAFE_NO_PAD.encode(&public),
        };

        Ok((
            Self {
                kid: kid.to_string(),
                public,
                keypair: Some(keypair),
            },
            spec,
        ))
    }

    /// Load a key from its stored spec.
    pub fn from_spec(kid: &str, spec: &SigningKeySpec) -> Result<Self, SignerError> {
        if spec.alg != "ES384" {
            return Err(SignerError::InvalidKey(format!(
                "unsupported algorithm {}",
                spec.alg
            )));
        }

        let public = URL_SAFE_NO_PAD
            .decode(&spec.public)
            .map_err(|e| SignerError::InvalidKey(format!("bad base64 public key: {e}")))?;

        let keypair = match &spec.private {
            None => None,
            Some(b64) => {
                let der = URL_SAFE_NO_PAD
                    .decode(b64)
                    .map_err(|e| SignerError::InvalidKey(format!("bad base64 private key: {e}")))?;
                let rng = SystemRandom::new();

                Some(
                    EcdsaKeyPair::from_pkcs8(&ECDSA_P384_SHA384_FIXED_SIGNING, &der, &rng)
                        .map_err(|e| SignerError::InvalidKey(e.to_string()))?,
                )
            }
        };

        Ok(Self {
            kid: kid.to_string(),
            public,
            keypair,
        })
    }
}

/// The process-wide key set. The most recent key signs; any known
/// key id verifies. Rotation appends a key with a higher id.
pub struct SigningKeySet {
    keys: BTreeMap<String, Arc<SigningKey>>,
    rng: SystemRandom,
}

impl SigningKeySet {
    pub fn new() -> Self {
        Self {
            keys: BTreeMap::new(),
            rng: SystemRandom::new(),
        }
    }

    pub fn insert(&mut self, key: SigningKey) {
        self.keys.insert(key.kid.clone(), Arc::new(key));
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Key id one past the highest numeric id in the set.
    pub fn next_kid(&self) -> String {
        let max = self
            .keys
            .keys()
            .filter_map(|k| k.parse::<u64>().ok())
            .max()
            .unwrap_or(0);

        (max + 1).to_string()
    }

    /// The key used for new signatures: the highest numeric id that
    /// carries a private half.
    pub fn current(&self) -> Option<&Arc<SigningKey>> {
        self.keys
            .values()
            .filter(|k| k.can_sign())
            .max_by_key(|k| k.kid.parse::<u64>().unwrap_or(0))
    }

    /// Sign a canonical record. Returns `v1.<kid>.<base64url(sig)>`.
    pub fn sign(&self, message: &[u8]) -> Result<String, SignerError> {
        let key = self.current().ok_or(SignerError::NoKey)?;
        let keypair = key.keypair.as_ref().ok_or(SignerError::NoKey)?;

        let sig = keypair
            .sign(&self.rng, message)
            .map_err(|_| SignerError::SigningFailed)?;

        Ok(format!(
            "{SIGNATURE_VERSION}.{}.{}",
            key.kid,
            URL_SAFE_NO_PAD.encode(sig.as_ref())
        ))
    }

    /// Verify a signature string against a canonical record.
    pub fn verify(&self, signature: &str, message: &[u8]) -> Result<(), SignerError> {
        let mut parts = signature.splitn(3, '.');

        let (version, kid, sig) = match (parts.next(), parts.next(), parts.next()) {
            (Some(v), Some(k), Some(s)) => (v, k, s),
            _ => return Err(SignerError::MalformedSignature),
        };

        if version != SIGNATURE_VERSION {
            return Err(SignerError::MalformedSignature);
        }

        let key = self
            .keys
            .get(kid)
            .ok_or_else(|| SignerError::UnknownKey(kid.to_string()))?;

        let sig = URL_SAFE_NO_PAD
            .decode(sig)
            .map_err(|_| SignerError::MalformedSignature)?;

        UnparsedPublicKey::new(&ECDSA_P384_SHA384_FIXED, &key.public)
            .verify(message, &sig)
            .map_err(|_| SignerError::VerificationFailed)
    }
}

impl Default for SigningKeySet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify_roundtrip() {
        let (key, _) = SigningKey::generate("1").unwrap();
        let mut set = SigningKeySet::new();
        set.insert(key);

        let sig = set.sign(b"record-bytes").unwrap();
        assert!(sig.starts_with("v1.1."));

        set.verify(&sig, b"record-bytes").unwrap();
        assert!(matches!(
            set.verify(&sig, b"tampered-bytes"),
            Err(SignerError::VerificationFailed)
        ));
    }

    #[test]
    fn key_spec_roundtrip_preserves_signing() {
        let (key, spec) = SigningKey::generate("1").unwrap();

        let restored = SigningKey::from_spec("1", &spec).unwrap();
        assert!(restored.can_sign());

        let mut signer = SigningKeySet::new();
        signer.insert(key);
        let sig = signer.sign(b"payload").unwrap();

        // The restored key verifies what the original signed.
        let mut verifier = SigningKeySet::new();
        verifier.insert(restored);
        verifier.verify(&sig, b"payload").unwrap();
    }

    #[test]
    fn rotation_signs_with_newest_key() {
        let (first, _) = SigningKey::generate("1").unwrap();
        let (second, _) = SigningKey::generate("2").unwrap();

        let mut set = SigningKeySet::new();
        set.insert(first);
        assert_eq!(set.next_kid(), "2");
        set.insert(second);

        let sig = set.sign(b"data").unwrap();
        assert!(sig.starts_with("v1.2."));

        // Old signatures stay verifiable after rotation.
        set.verify(&sig, b"data").unwrap();
    }

    #[test]
    fn verify_rejects_unknown_kid_and_garbage() {
        let (key, _) = SigningKey::generate("1").unwrap();
        let mut set = SigningKeySet::new();
        set.insert(key);

        let sig = set.sign(b"data").unwrap();
        let forged = sig.replacen("v1.1.", "v1.9.", 1);

        assert!(matches!(
            set.verify(&forged, b"data"),
            Err(SignerError::UnknownKey(_))
        ));
        assert!(matches!(
            set.verify("not-a-signature", b"data"),
            Err(SignerError::MalformedSignature)
        ));
    }

    #[test]
    fn empty_set_cannot_sign() {
        let set = SigningKeySet::new();
        assert!(matches!(set.sign(b"data"), Err(SignerError::NoKey)));
    }
}

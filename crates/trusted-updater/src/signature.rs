//! Threshold verification of signed metadata envelopes.

use std::collections::HashSet;
use std::convert::TryInto;

use base64::{engine::general_purpose, Engine as _};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::SignatureError;
use crate::metadata::{Role, RoleDocument, RootMetadata};

/// One signature over an envelope's `signed` payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnvelopeSignature {
    pub keyid: String,
    /// Base64 encoded ed25519 signature.
    pub sig: String,
}

/// Wire form of every metadata document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SignedEnvelope {
    pub signed: serde_json::Value,
    pub signatures: Vec<EnvelopeSignature>,
}

impl SignedEnvelope {
    /// Decode an envelope from raw bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, SignatureError> {
        serde_json::from_slice(bytes).map_err(|err| SignatureError::Malformed(err.to_string()))
    }

    /// Sign `payload` with every key in `keys`.
    pub fn sign<T: Serialize>(payload: &T, keys: &[&SigningKey]) -> Result<Self, serde_json::Error> {
        let signed = serde_json::to_value(payload)?;
        let message = canonical_bytes(&signed)?;
        let signatures = keys
            .iter()
            .map(|key| EnvelopeSignature {
                keyid: key_id(&key.verifying_key()),
                sig: general_purpose::STANDARD.encode(key.sign(&message).to_bytes()),
            })
            .collect();
        Ok(SignedEnvelope { signed, signatures })
    }

    pub fn to_vec(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// The `_type` declared inside the payload.
    pub fn declared_type(&self) -> Option<&str> {
        self.signed.get("_type").and_then(|value| value.as_str())
    }

    /// Verify that the payload is a `T` document signed by at least the
    /// threshold of keys `root` assigns to `T::ROLE`, then decode it.
    pub fn verify_as<T: RoleDocument>(&self, root: &RootMetadata) -> Result<T, SignatureError> {
        self.verify_role(root, T::ROLE)?;
        self.decode()
    }

    /// Decode the payload as `T` after checking its `_type`, without checking
    /// signatures.
    pub fn decode<T: RoleDocument>(&self) -> Result<T, SignatureError> {
        self.check_type(T::ROLE)?;
        serde_json::from_value(self.signed.clone())
            .map_err(|err| SignatureError::Malformed(err.to_string()))
    }

    fn check_type(&self, expected: Role) -> Result<(), SignatureError> {
        match self.declared_type() {
            Some(found) if found == expected.as_str() => Ok(()),
            found => Err(SignatureError::WrongType {
                expected,
                found: found.unwrap_or("<missing>").to_string(),
            }),
        }
    }

    /// Count distinct authorised keys with a valid signature for `role`.
    pub fn verify_role(&self, root: &RootMetadata, role: Role) -> Result<(), SignatureError> {
        self.check_type(role)?;
        let assignment = root.roles.get(&role).ok_or(SignatureError::UnknownRole(role))?;
        let message = canonical_bytes(&self.signed)
            .map_err(|err| SignatureError::Malformed(err.to_string()))?;

        let authorised: HashSet<&str> = assignment.keyids.iter().map(String::as_str).collect();
        let mut counted: HashSet<&str> = HashSet::new();

        for entry in &self.signatures {
            let keyid = entry.keyid.as_str();
            if !authorised.contains(keyid) || counted.contains(keyid) {
                continue;
            }
            let Some(encoded_key) = root.keys.get(keyid) else {
                continue;
            };
            let Some(key) = parse_public_key(encoded_key) else {
                tracing::warn!(%keyid, "ignoring malformed public key in root");
                continue;
            };
            // a key id that does not hash to its key must not be counted
            if key_id(&key) != keyid {
                continue;
            }
            let Some(signature) = parse_signature(&entry.sig) else {
                continue;
            };
            if key.verify(&message, &signature).is_ok() {
                counted.insert(keyid);
            }
        }

        let threshold = assignment.threshold.max(1);
        if counted.len() >= threshold as usize {
            Ok(())
        } else {
            Err(SignatureError::BelowThreshold {
                role,
                valid: counted.len(),
                threshold,
            })
        }
    }
}

/// Key id: lowercase hex SHA-256 of the raw public key.
pub fn key_id(key: &VerifyingKey) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

/// Hex encoding of a public key as stored in root documents.
pub fn encode_public_key(key: &VerifyingKey) -> String {
    hex::encode(key.as_bytes())
}

fn parse_public_key(encoded: &str) -> Option<VerifyingKey> {
    let raw = hex::decode(encoded).ok()?;
    let array: [u8; 32] = raw.try_into().ok()?;
    VerifyingKey::from_bytes(&array).ok()
}

fn parse_signature(encoded: &str) -> Option<Signature> {
    let raw = general_purpose::STANDARD.decode(encoded.as_bytes()).ok()?;
    let array: [u8; 64] = raw.try_into().ok()?;
    Some(Signature::from_bytes(&array))
}

/// serde_json maps are ordered by key, so re-serialising a value is stable.
fn canonical_bytes(value: &serde_json::Value) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(value)
}

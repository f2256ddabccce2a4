//! Payload codec seam
//!
//! Payload frames carry a `body.syncPushPackage.data` array whose first item
//! holds an opaque `data` string. Plaintext system notices are base64-encoded
//! JSON and are not routed further; anything else is handed to a [`Decryptor`]
//! which produces the JSON message object.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde_json::Value;

use crate::envelope::Envelope;
use crate::errors::DecodeError;

// ----------------------------------------------------------------------------
// Traits
// ----------------------------------------------------------------------------

/// Turns an opaque payload string into a JSON document
pub trait Decryptor: Send + Sync {
    fn decrypt(&self, payload: &str) -> Result<String, DecodeError>;
}

/// Turns an inbound envelope into a structured message
pub trait EnvelopeCodec: Send + Sync {
    /// Returns `Ok(None)` when the envelope does not carry a routable message
    fn decode(&self, envelope: &Envelope) -> Result<Option<Value>, DecodeError>;
}

// ----------------------------------------------------------------------------
// Sync Package Codec
// ----------------------------------------------------------------------------

/// Codec for `syncPushPackage` frames backed by a pluggable decryptor
#[derive(Clone)]
pub struct SyncPackageCodec {
    decryptor: Arc<dyn Decryptor>,
}

impl SyncPackageCodec {
    pub fn new(decryptor: Arc<dyn Decryptor>) -> Self {
        Self { decryptor }
    }

    /// Opaque payload of the first sync item, if the envelope is a sync package
    pub fn sync_payload(envelope: &Envelope) -> Option<&str> {
        envelope
            .body
            .as_ref()?
            .get("syncPushPackage")?
            .get("data")?
            .as_array()?
            .first()?
            .get("data")?
            .as_str()
    }
}

impl EnvelopeCodec for SyncPackageCodec {
    fn decode(&self, envelope: &Envelope) -> Result<Option<Value>, DecodeError> {
        let Some(payload) = Self::sync_payload(envelope) else {
            return Ok(None);
        };

        // Plaintext notices decode straight to JSON and carry no chat content
        if let Ok(bytes) = BASE64.decode(payload) {
            if serde_json::from_slice::<Value>(&bytes).is_ok() {
                return Ok(None);
            }
        }

        let decrypted = self.decryptor.decrypt(payload)?;
        Ok(Some(serde_json::from_str(&decrypted)?))
    }
}

/// Decryptor for deployments that have not plugged one in; every opaque
/// payload is reported as undecodable.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDecryptor;

impl Decryptor for NoDecryptor {
    fn decrypt(&self, _payload: &str) -> Result<String, DecodeError> {
        Err(DecodeError::Unsupported)
    }
}

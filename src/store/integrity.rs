//! Keyed integrity tags for honeycomb documents.
//!
//! Every persisted document carries an HMAC-SHA256 tag bound to its name,
//! version, and payload. A tag mismatch on read means the document was
//! altered outside `StateStore::commit` and must be treated as corruption,
//! not as data.

use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone)]
pub struct IntegrityKeyer {
    key: Vec<u8>,
}

impl std::fmt::Debug for IntegrityKeyer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntegrityKeyer").finish_non_exhaustive()
    }
}

impl IntegrityKeyer {
    pub fn new(key: &[u8]) -> Self {
        Self { key: key.to_vec() }
    }

    /// Compute the hex tag over `(name, version, payload)`.
    ///
    /// `serde_json` maps are ordered (BTreeMap-backed), so serializing the
    /// payload yields a canonical byte string.
    pub fn tag(&self, name: &str, version: u64, payload: &Value) -> String {
        let mut mac = HmacSha256::new_from_slice(&self.key)
            .unwrap_or_else(|_| unreachable!("hmac accepts any key length"));
        mac.update(name.as_bytes());
        mac.update(&version.to_be_bytes());
        mac.update(payload.to_string().as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Recompute and compare in constant time.
    pub fn verify(&self, name: &str, version: u64, payload: &Value, tag: &str) -> bool {
        let Ok(expected) = hex::decode(tag) else {
            return false;
        };

        let mut mac = HmacSha256::new_from_slice(&self.key)
            .unwrap_or_else(|_| unreachable!("hmac accepts any key length"));
        mac.update(name.as_bytes());
        mac.update(&version.to_be_bytes());
        mac.update(payload.to_string().as_bytes());

        // Constant-time comparison
        mac.verify_slice(&expected).is_ok()
    }
}

//! Request signatures.
//!
//! The remote service authenticates every call with an `api_sig` parameter:
//! the MD5 digest of the shared secret followed by each parameter name and
//! value, parameters sorted by name, no separators, encoded as lowercase hex.
//! MD5 is what the service recomputes on its side; it is kept here for wire
//! compatibility only.

use md5::{Digest, Md5};
use std::collections::BTreeMap;

use crate::store::Secret;

/// Name of the signature parameter.
pub const SIGNATURE_PARAM: &str = "api_sig";

/// Computes request signatures with a shared secret.
#[derive(Debug, Clone)]
pub struct RequestSigner {
    shared_secret: Secret,
}

impl RequestSigner {
    pub fn new(shared_secret: Secret) -> Self {
        Self { shared_secret }
    }

    /// Sign a parameter set.
    ///
    /// The result depends only on the set of pairs, never on the order they
    /// were supplied in.
    pub fn sign<I, K, V>(&self, params: I) -> String
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let sorted: BTreeMap<String, String> = params
            .into_iter()
            .map(|(k, v)| (k.as_ref().to_string(), v.as_ref().to_string()))
            .collect();

        let mut hasher = Md5::new();
        hasher.update(self.shared_secret.expose().as_bytes());
        for (name, value) in &sorted {
            hasher.update(name.as_bytes());
            hasher.update(value.as_bytes());
        }

        format!("{:x}", hasher.finalize())
    }

    /// Return `params` with the signature appended, sorted by name.
    pub fn signed(&self, params: BTreeMap<String, String>) -> Vec<(String, String)> {
        let signature = self.sign(params.iter());
        let mut pairs: Vec<(String, String)> = params.into_iter().collect();
        pairs.push((SIGNATURE_PARAM.to_string(), signature));
        pairs
    }
}

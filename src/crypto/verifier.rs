/*
 * Copyright 2019-2021 Wren Powell
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */
use std::sync::Once;

use sodiumoxide::crypto::pwhash::argon2id13::{pwhash, pwhash_verify, HashedPassword};

use super::config::CryptoConfig;

static VERIFIER_INIT: Once = Once::new();

fn init() {
    VERIFIER_INIT.call_once(|| {
        sodiumoxide::init().expect("Failed to initialize encryption.");
    });
}

/// A password verifier: suitable for [`verify`], unsuitable for decryption.
///
/// This is what gets persisted in a `password_identity` metadata row. It never allows the
/// original password to be recovered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verifier(String);

impl Verifier {
    /// Render this verifier as the opaque string stored in `meta_value`.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parse a verifier string previously produced by [`hash`].
    pub fn parse(value: &str) -> Option<Self> {
        // `HashedPassword` is a fixed-width, null-padded byte buffer; round-trip through it to
        // confirm the string we were given is well-formed before trusting it.
        let mut bytes = [0u8; sodiumoxide::crypto::pwhash::argon2id13::HASHEDPASSWORDBYTES];
        let value_bytes = value.as_bytes();
        if value_bytes.len() > bytes.len() {
            return None;
        }
        bytes[..value_bytes.len()].copy_from_slice(value_bytes);
        let _ = HashedPassword::from_slice(&bytes)?;
        Some(Verifier(value.to_string()))
    }
}

impl std::fmt::Display for Verifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Derive a password verifier suitable for later [`verify`] calls.
///
/// This uses a memory-hard password hash (Argon2id), not the AEAD key-derivation path in
/// [`crate::crypto::aead`] — the verifier can confirm a password but cannot decrypt anything.
pub fn hash(password: &[u8], config: CryptoConfig) -> Verifier {
    init();
    let hashed = pwhash(
        password,
        config.operations_limit.to_ops_limit(),
        config.memory_limit.to_mem_limit(),
    )
    .expect("Failed to hash password.");

    let raw = hashed.as_ref();
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    let text = std::str::from_utf8(&raw[..end])
        .expect("argon2id13 verifier is not valid UTF-8")
        .to_string();
    Verifier(text)
}

/// Check whether `password` matches a previously derived `verifier`.
///
/// This is constant-time in the verifier length because `pwhash_verify` is.
pub fn verify(password: &[u8], verifier: &Verifier) -> bool {
    init();
    let mut bytes = [0u8; sodiumoxide::crypto::pwhash::argon2id13::HASHEDPASSWORDBYTES];
    let value_bytes = verifier.0.as_bytes();
    if value_bytes.len() > bytes.len() {
        return false;
    }
    bytes[..value_bytes.len()].copy_from_slice(value_bytes);
    match HashedPassword::from_slice(&bytes) {
        Some(hashed) => pwhash_verify(&hashed, password),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_accepts_correct_password() {
        let config = CryptoConfig::default();
        let verifier = hash(b"correct horse battery staple", config);
        assert!(verify(b"correct horse battery staple", &verifier));
    }

    #[test]
    fn verify_rejects_wrong_password() {
        let config = CryptoConfig::default();
        let verifier = hash(b"right", config);
        assert!(!verify(b"wrong", &verifier));
    }

    #[test]
    fn verifier_round_trips_through_parse() {
        let config = CryptoConfig::default();
        let verifier = hash(b"a password", config);
        let parsed = Verifier::parse(verifier.as_str()).unwrap();
        assert!(verify(b"a password", &parsed));
    }
}

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
use std::fmt::{self, Debug, Formatter};
use std::sync::Once;

use secrecy::{DebugSecret, ExposeSecret, Secret, SecretVec};
use sodiumoxide::crypto::aead::xchacha20poly1305_ietf::{
    gen_nonce, open, seal, Key as ChaChaKey, Nonce, KEYBYTES, NONCEBYTES,
};
use sodiumoxide::crypto::pwhash::argon2id13::{derive_key, gen_salt, Salt, SALTBYTES};

use super::config::CryptoConfig;

static CRYPTO_INIT: Once = Once::new();

/// Initialize libsodium. Safe to call repeatedly; the underlying call only runs once.
fn init() {
    CRYPTO_INIT.call_once(|| {
        sodiumoxide::init().expect("Failed to initialize encryption.");
    });
}

/// A key derived from a password. Zeroed in memory on drop.
pub(crate) struct DerivedKey(SecretVec<u8>);

impl DebugSecret for DerivedKey {}

impl Debug for DerivedKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Self::debug_secret(f)
    }
}

impl DerivedKey {
    fn derive(password: &[u8], salt: &Salt, config: CryptoConfig) -> Self {
        init();
        let mut bytes = vec![0u8; KEYBYTES];
        derive_key(
            &mut bytes,
            password,
            salt,
            config.operations_limit.to_ops_limit(),
            config.memory_limit.to_mem_limit(),
        )
        .expect("Failed to derive an encryption key from the given password.");
        DerivedKey(Secret::new(bytes))
    }
}

/// An opaque failure from the crypto primitive wrapper.
///
/// This never distinguishes a wrong password from corrupt ciphertext, a failed authentication
/// tag, or an unrecognized format, per the contract in [`crate::crypto`].
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("decryption failed")]
pub struct DecryptionError;

/// Authenticated, password-derived encryption of record values.
///
/// `encode` embeds a fresh random salt and nonce in its output, so two calls with identical
/// inputs never produce the same ciphertext. `decode` fails with a single opaque
/// [`DecryptionError`] for every failure mode.
pub fn encode(plaintext: &[u8], password: &[u8], config: CryptoConfig) -> Vec<u8> {
    init();
    let salt = gen_salt();
    let key = DerivedKey::derive(password, &salt, config);
    let nonce = gen_nonce();
    let chacha_key = ChaChaKey::from_slice(key.0.expose_secret()).expect("key has wrong length");
    let ciphertext = seal(plaintext, None, &nonce, &chacha_key);

    let mut output = Vec::with_capacity(SALTBYTES + NONCEBYTES + ciphertext.len());
    output.extend_from_slice(salt.as_ref());
    output.extend_from_slice(nonce.as_ref());
    output.extend_from_slice(&ciphertext);
    output
}

/// Decrypt a value produced by [`encode`] with the same password.
pub fn decode(ciphertext: &[u8], password: &[u8], config: CryptoConfig) -> Result<Vec<u8>, DecryptionError> {
    init();
    if ciphertext.len() < SALTBYTES + NONCEBYTES {
        return Err(DecryptionError);
    }
    let (salt_bytes, rest) = ciphertext.split_at(SALTBYTES);
    let (nonce_bytes, sealed) = rest.split_at(NONCEBYTES);

    let salt = Salt::from_slice(salt_bytes).ok_or(DecryptionError)?;
    let nonce = Nonce::from_slice(nonce_bytes).ok_or(DecryptionError)?;
    let key = DerivedKey::derive(password, &salt, config);
    let chacha_key = ChaChaKey::from_slice(key.0.expose_secret()).ok_or(DecryptionError)?;

    open(sealed, None, &nonce, &chacha_key).map_err(|_| DecryptionError)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_encode_decode() {
        let config = CryptoConfig::default();
        let ciphertext = encode(b"hello vault", b"correct horse", config);
        let plaintext = decode(&ciphertext, b"correct horse", config).unwrap();
        assert_eq!(plaintext, b"hello vault");
    }

    #[test]
    fn distinct_calls_yield_distinct_ciphertexts() {
        let config = CryptoConfig::default();
        let a = encode(b"same value", b"same password", config);
        let b = encode(b"same value", b"same password", config);
        assert_ne!(a, b);
    }

    #[test]
    fn wrong_password_fails_to_decrypt() {
        let config = CryptoConfig::default();
        let ciphertext = encode(b"hello vault", b"right", config);
        assert!(decode(&ciphertext, b"wrong", config).is_err());
    }

    #[test]
    fn corrupt_ciphertext_fails_to_decrypt() {
        let config = CryptoConfig::default();
        let mut ciphertext = encode(b"hello vault", b"password", config);
        let last = ciphertext.len() - 1;
        ciphertext[last] ^= 0xff;
        assert!(decode(&ciphertext, b"password", config).is_err());
    }

    #[test]
    fn empty_plaintext_round_trips() {
        let config = CryptoConfig::default();
        let ciphertext = encode(b"", b"password", config);
        assert_eq!(decode(&ciphertext, b"password", config).unwrap(), b"");
    }
}

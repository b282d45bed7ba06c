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

//! The crypto primitive wrapper (component A): password-derived authenticated encryption plus
//! a password-verification hash. The rest of the crate never touches keys or salts directly —
//! everything goes through [`CryptoProvider`].

mod aead;
mod config;
mod verifier;

pub use aead::DecryptionError;
pub use config::{CryptoConfig, ResourceLimit};
pub use verifier::Verifier;

/// The capability the rekey engine and identity layer depend on for encryption and password
/// verification. The default implementation (`SodiumCrypto`) wraps XChaCha20-Poly1305 and
/// Argon2id; embedders could swap in another primitive by implementing this trait.
pub trait CryptoProvider: Send + Sync {
    /// Authenticated, password-derived encryption with a fresh salt/nonce per call.
    fn encode(&self, plaintext: &[u8], password: &[u8]) -> Vec<u8>;

    /// Decrypt a value produced by `encode` with the same password.
    fn decode(&self, ciphertext: &[u8], password: &[u8]) -> Result<Vec<u8>, DecryptionError>;

    /// Derive a password verifier suitable for later `verify` calls.
    fn hash(&self, password: &[u8]) -> Verifier;

    /// Check whether `password` matches a previously derived `verifier`.
    fn verify(&self, password: &[u8], verifier: &Verifier) -> bool;
}

/// The libsodium-backed [`CryptoProvider`]: XChaCha20-Poly1305 for `encode`/`decode`, Argon2id
/// for both key derivation and `hash`/`verify`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SodiumCrypto {
    config: CryptoConfig,
}

impl SodiumCrypto {
    /// Create a crypto provider using the given cost parameters.
    pub fn new(config: CryptoConfig) -> Self {
        SodiumCrypto { config }
    }
}

impl CryptoProvider for SodiumCrypto {
    fn encode(&self, plaintext: &[u8], password: &[u8]) -> Vec<u8> {
        aead::encode(plaintext, password, self.config)
    }

    fn decode(&self, ciphertext: &[u8], password: &[u8]) -> Result<Vec<u8>, DecryptionError> {
        aead::decode(ciphertext, password, self.config)
    }

    fn hash(&self, password: &[u8]) -> Verifier {
        verifier::hash(password, self.config)
    }

    fn verify(&self, password: &[u8], verifier: &Verifier) -> bool {
        verifier::verify(password, verifier)
    }
}

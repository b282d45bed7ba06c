/*
 * Copyright 2019 Garrett Powell
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
use std::result;

use thiserror::Error as DeriveError;

/// The error type for operations against the vault core.
///
/// `DecryptionError` never appears here: the rekey engine and the crypto
/// wrapper consume it internally and never let a caller distinguish a wrong
/// password from corrupt ciphertext.
#[derive(Debug, DeriveError)]
pub enum Error {
    /// An argument was invalid (empty password, negative limit/offset, unknown sort column, ...).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// No record or metadata row matched the lookup.
    #[error("not found")]
    NotFound,

    /// The operation was cancelled; `committed` is the number of records already
    /// rekeyed with the new password before cancellation was observed.
    #[error("cancelled after committing {committed} record(s): {cause}")]
    Cancelled {
        /// Records already committed with the new password before cancellation.
        committed: i64,
        /// Human-readable cancellation cause.
        cause: String,
    },

    /// The underlying storage layer returned an error.
    #[error("storage error during {operation}: {source}")]
    Storage {
        /// The operation that failed, for diagnostics.
        operation: String,
        #[source]
        source: anyhow::Error,
    },

    /// An invariant was violated that should never occur in correct code, such as a
    /// `DecryptionError` surfacing during the re-encode step of a rekey.
    #[error("internal invariant violated: {0}")]
    Internal(String),

    #[doc(hidden)]
    #[error("")]
    __NonExhaustive,
}

impl Error {
    /// Wrap a storage-layer error with the name of the operation that failed.
    pub fn storage(operation: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        Error::Storage {
            operation: operation.into(),
            source: source.into(),
        }
    }
}

#[cfg(feature = "store-postgres")]
impl From<sqlx::Error> for Error {
    fn from(source: sqlx::Error) -> Self {
        Error::storage("sqlx query", source)
    }
}

/// The result type for operations against the vault core.
pub type Result<T> = result::Result<T, Error>;

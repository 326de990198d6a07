// Copyright 2025 The Matrix.org Foundation C.I.C.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Error conditions.

use thiserror::Error;

/// Result type of the pantalaimon daemon.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Top level error enum for the daemon.
#[derive(Error, Debug)]
pub enum Error {
    /// An error in the persistent store holding our known servers, users and
    /// access tokens.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// An error in the OS keyring holding the access tokens of our background
    /// sync clients.
    #[error(transparent)]
    Keyring(#[from] KeyringError),

    /// An error a background sync client ran into while it was talking to the
    /// homeserver.
    #[error(transparent)]
    Client(#[from] ClientError),

    /// An error forwarding a request to the homeserver.
    #[error(transparent)]
    Http(#[from] reqwest::Error),

    /// An I/O error while a file or the data directory was touched.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A JSON body couldn't be serialized or deserialized.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// A homeserver or proxy URL couldn't be parsed.
    #[error(transparent)]
    Url(#[from] url::ParseError),

    /// An access token couldn't be turned into a valid header value.
    #[error(transparent)]
    HeaderValue(#[from] http::header::InvalidHeaderValue),
}

/// Error type for the operations of a background sync client.
///
/// The variants mirror the ways the underlying Matrix client implementation
/// can fail, so the proxy can translate them into the HTTP status codes and
/// daemon responses the downstream side expects.
#[derive(Error, Debug)]
pub enum ClientError {
    /// The connection to the homeserver failed or was interrupted.
    #[error("connection error: {0}")]
    Connection(String),

    /// A room message couldn't be sent even after the configured number of
    /// retries.
    #[error("sending failed after retrying: {0}")]
    SendRetry(String),

    /// One or more events couldn't be decrypted with the key material we
    /// currently hold.
    #[error("unable to decrypt event: {0}")]
    Decryption(String),

    /// A key export couldn't be decrypted or created with the given
    /// passphrase.
    #[error("invalid key export: {0}")]
    Encryption(String),

    /// The login request was rejected by the homeserver.
    #[error("login failed: {0}")]
    LoginFailure(String),

    /// An I/O error while keys were imported or exported.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Any other error the client implementation ran into.
    #[error("{0}")]
    Other(String),
}

/// Error type for the sled backed persistent store.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The underlying database returned an error.
    #[error(transparent)]
    Database(#[from] sled::Error),

    /// A stored value couldn't be serialized or deserialized.
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

/// Error type for the host keyring holding our access tokens.
#[derive(Error, Debug)]
pub enum KeyringError {
    /// The platform specific credential store reported an error.
    #[error(transparent)]
    Platform(#[from] keyring::Error),
}

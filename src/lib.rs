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

//! This crate implements pantalaimon, an E2EE aware reverse proxy daemon for
//! [Matrix](https://matrix.org/).
//!
//! The daemon sits between an unmodified Matrix client and a homeserver and
//! forwards all traffic verbatim, except that responses are transparently
//! decrypted and messages into encrypted rooms transparently encrypted, so
//! the downstream client only ever sees cleartext.
//!
//! To do so the daemon runs a background sync client per logged in user, the
//! [`PanClient`], which owns the cryptographic device identity and the
//! encryption store of that user. The client side of the Matrix protocol is
//! abstracted behind the [`MatrixClient`] trait, the daemon itself only
//! contains the proxying and coordination logic.

#![warn(missing_docs)]

pub mod client;
pub mod config;
pub mod daemon;
pub mod error;
pub mod keyring;
pub mod matrix;
pub mod messages;
pub mod store;

pub use crate::{
    client::{DecryptionMode, PanClient},
    config::ProxyConfig,
    daemon::ProxyDaemon,
    error::{ClientError, Error, KeyringError, Result, StoreError},
    keyring::{MemoryKeyring, NativeKeyring, TokenStore},
    matrix::{ClientConfig, ClientFactory, DeviceInfo, LoginInfo, MatrixClient, SendResponse},
    messages::{ControlMessage, DaemonResponse, ResponseCode},
    store::{ClientInfo, PanStore},
};

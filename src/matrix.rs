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

//! Abstraction around the Matrix client layer.
//!
//! The daemon doesn't talk the client-server protocol itself, it drives an
//! implementation of [`MatrixClient`] that owns the device identity, the
//! Olm/Megolm sessions and the on-disk encryption store of a single user.
//! This allows implementors to plug in different Matrix client libraries and
//! lets the test suite script the client side of the proxy.

use std::{fmt::Debug, path::{Path, PathBuf}, sync::Arc};

use async_trait::async_trait;
use http::StatusCode;
use serde_json::Value;
use url::Url;

use crate::error::ClientError;

/// The result of a successful login of a background sync client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoginInfo {
    /// The fully qualified id of the user that logged in.
    pub user_id: String,
    /// The device id the homeserver assigned to this login.
    pub device_id: String,
    /// The access token of this login.
    pub access_token: String,
}

/// A device of a user, as found in the client's device store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceInfo {
    /// The id of the user the device belongs to.
    pub user_id: String,
    /// The unique id of the device.
    pub device_id: String,
    /// The human readable name of the device, if any.
    pub display_name: Option<String>,
}

/// The transport level response the client received when it sent a room
/// message on our behalf.
#[derive(Clone, Debug)]
pub struct SendResponse {
    /// The HTTP status code of the response.
    pub status: StatusCode,
    /// The content type of the response body, if the server sent one.
    pub content_type: Option<String>,
    /// The raw response body.
    pub body: Vec<u8>,
}

/// Settings a [`ClientFactory`] uses to build a client for a single user.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// The homeserver the client should connect to.
    pub homeserver: Url,
    /// The directory where the client should keep its encryption store.
    pub store_path: PathBuf,
    /// An optional outbound proxy the client should use.
    pub proxy: Option<Url>,
    /// Whether TLS certificate verification should be disabled.
    pub disable_ssl_verification: bool,
}

/// The method abstracting a per-user authenticated Matrix session.
///
/// Implementations own the cryptographic device identity and are expected to
/// ingest new key material whenever [`sync`] completes, so that a later
/// decryption call sees everything that arrived in that cycle.
///
/// [`sync`]: MatrixClient::sync
#[async_trait]
pub trait MatrixClient: Send + Sync + Debug {
    /// Log in to the homeserver, creating a new device.
    async fn login(
        &self,
        user: &str,
        password: &str,
        device_name: &str,
    ) -> Result<LoginInfo, ClientError>;

    /// Restore a previous login from a persisted user id, device id and
    /// access token, without talking to the homeserver.
    async fn restore_login(
        &self,
        user_id: &str,
        device_id: &str,
        access_token: &str,
    ) -> Result<(), ClientError>;

    /// Load the on-disk encryption store of a restored login.
    async fn load_store(&self) -> Result<(), ClientError>;

    /// Run one sync cycle against the homeserver.
    ///
    /// All key material received in the cycle must be visible to decryption
    /// calls once this returns.
    async fn sync(&self) -> Result<(), ClientError>;

    /// Replace the encrypted events of a sync response body with their
    /// plaintext form.
    ///
    /// If `ignore_failures` is false the call must fail with
    /// [`ClientError::Decryption`] when any event can't be decrypted,
    /// otherwise undecryptable events are left in place.
    async fn decrypt_sync_body(
        &self,
        body: &Value,
        ignore_failures: bool,
    ) -> Result<Value, ClientError>;

    /// Replace the encrypted events of a room messages response body with
    /// their plaintext form, with the same failure rules as
    /// [`decrypt_sync_body`].
    ///
    /// [`decrypt_sync_body`]: MatrixClient::decrypt_sync_body
    async fn decrypt_messages_body(
        &self,
        body: &Value,
        ignore_failures: bool,
    ) -> Result<Value, ClientError>;

    /// Encrypt and send a room message, transparently establishing the
    /// needed Olm sessions and sharing the group session.
    async fn room_send(
        &self,
        room_id: &str,
        event_type: &str,
        content: &Value,
        txn_id: &str,
    ) -> Result<SendResponse, ClientError>;

    /// Whether the given room is encrypted. `None` if the room isn't in the
    /// client's room list.
    async fn is_room_encrypted(&self, room_id: &str) -> Option<bool>;

    /// Look a device up in the client's device store.
    async fn get_device(&self, user_id: &str, device_id: &str) -> Option<DeviceInfo>;

    /// Mark the given device as verified.
    ///
    /// Returns true if the trust state changed, false if the device was
    /// already verified.
    async fn verify_device(&self, device: &DeviceInfo) -> Result<bool, ClientError>;

    /// Mark the given device as unverified.
    ///
    /// Returns true if the trust state changed, false if the device was
    /// already unverified.
    async fn unverify_device(&self, device: &DeviceInfo) -> Result<bool, ClientError>;

    /// Accept a pending interactive short auth string verification with the
    /// given device.
    async fn accept_sas(&self, user_id: &str, device_id: &str) -> Result<(), ClientError>;

    /// Confirm that the short auth strings match for the pending
    /// verification with the given device.
    async fn confirm_sas(&self, user_id: &str, device_id: &str) -> Result<(), ClientError>;

    /// Export the room encryption keys to the given file, protected by the
    /// given passphrase.
    async fn export_keys(&self, path: &Path, passphrase: &str) -> Result<(), ClientError>;

    /// Import room encryption keys from the given file.
    async fn import_keys(&self, path: &Path, passphrase: &str) -> Result<(), ClientError>;

    /// Shut the client down, flushing and closing its stores.
    async fn close(&self) -> Result<(), ClientError>;
}

/// Factory that builds [`MatrixClient`] handles for the daemon.
///
/// One client is created per logged in user, either when a login passes
/// through the proxy or when a persisted session is restored on startup.
#[async_trait]
pub trait ClientFactory: Send + Sync + Debug {
    /// Build a new, not yet authenticated client.
    async fn create(&self, config: &ClientConfig) -> Result<Arc<dyn MatrixClient>, ClientError>;
}

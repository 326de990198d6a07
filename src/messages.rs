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

//! Messages that are exchanged between the UI side of pantalaimon and the
//! daemon.
//!
//! The UI process puts [`ControlMessage`]s on the daemon's receive queue to
//! drive out-of-band operations on the background sync clients, the daemon
//! answers with [`DaemonResponse`]s on its send queue.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A message the UI sends to the daemon to act on one of the background sync
/// clients.
///
/// Every variant carries a `message_id` which the daemon echoes back in the
/// matching [`DaemonResponse`] and the `pan_user` whose background sync
/// client should perform the operation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Mark a device as verified.
    DeviceVerify {
        /// Unique id of this message.
        message_id: u64,
        /// The user whose background sync client should act.
        pan_user: String,
        /// The owner of the device that should be verified.
        user_id: String,
        /// The id of the device that should be verified.
        device_id: String,
    },
    /// Undo a previous device verification.
    DeviceUnverify {
        /// Unique id of this message.
        message_id: u64,
        /// The user whose background sync client should act.
        pan_user: String,
        /// The owner of the device that should be unverified.
        user_id: String,
        /// The id of the device that should be unverified.
        device_id: String,
    },
    /// Accept an incoming interactive short auth string verification.
    AcceptSas {
        /// Unique id of this message.
        message_id: u64,
        /// The user whose background sync client should act.
        pan_user: String,
        /// The owner of the device we're verifying with.
        user_id: String,
        /// The id of the device we're verifying with.
        device_id: String,
    },
    /// Confirm that the short auth strings match on both sides.
    ConfirmSas {
        /// Unique id of this message.
        message_id: u64,
        /// The user whose background sync client should act.
        pan_user: String,
        /// The owner of the device we're verifying with.
        user_id: String,
        /// The id of the device we're verifying with.
        device_id: String,
    },
    /// Export the room encryption keys to a passphrase protected file.
    ExportKeys {
        /// Unique id of this message.
        message_id: u64,
        /// The user whose background sync client should act.
        pan_user: String,
        /// The file the keys should be written to, `~` is expanded.
        path: String,
        /// The passphrase the export should be encrypted with.
        passphrase: String,
    },
    /// Import room encryption keys from a passphrase protected file.
    ImportKeys {
        /// Unique id of this message.
        message_id: u64,
        /// The user whose background sync client should act.
        pan_user: String,
        /// The file the keys should be read from, `~` is expanded.
        path: String,
        /// The passphrase the export was encrypted with.
        passphrase: String,
    },
}

impl ControlMessage {
    /// The unique id of this message.
    pub fn message_id(&self) -> u64 {
        match self {
            ControlMessage::DeviceVerify { message_id, .. }
            | ControlMessage::DeviceUnverify { message_id, .. }
            | ControlMessage::AcceptSas { message_id, .. }
            | ControlMessage::ConfirmSas { message_id, .. }
            | ControlMessage::ExportKeys { message_id, .. }
            | ControlMessage::ImportKeys { message_id, .. } => *message_id,
        }
    }

    /// The user whose background sync client should handle this message.
    pub fn pan_user(&self) -> &str {
        match self {
            ControlMessage::DeviceVerify { pan_user, .. }
            | ControlMessage::DeviceUnverify { pan_user, .. }
            | ControlMessage::AcceptSas { pan_user, .. }
            | ControlMessage::ConfirmSas { pan_user, .. }
            | ControlMessage::ExportKeys { pan_user, .. }
            | ControlMessage::ImportKeys { pan_user, .. } => pan_user,
        }
    }
}

/// Symbolic result code of a [`DaemonResponse`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseCode {
    /// The operation completed, the accompanying message describes the
    /// outcome.
    #[serde(rename = "m.ok")]
    Ok,
    /// The device the message referred to isn't known to the background sync
    /// client.
    #[serde(rename = "m.unknown_device")]
    UnknownDevice,
    /// An I/O or decryption error happened while keys were imported or
    /// exported.
    #[serde(rename = "m.os_error")]
    OsError,
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = match self {
            ResponseCode::Ok => "m.ok",
            ResponseCode::UnknownDevice => "m.unknown_device",
            ResponseCode::OsError => "m.os_error",
        };

        write!(f, "{code}")
    }
}

/// The answer the daemon produces for a [`ControlMessage`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonResponse {
    /// The id of the message this is an answer to.
    pub message_id: u64,
    /// The user whose background sync client handled the message.
    pub pan_user: String,
    /// Symbolic result code.
    pub code: ResponseCode,
    /// Human readable description of the outcome.
    pub message: String,
}

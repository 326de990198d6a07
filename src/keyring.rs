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

//! Secure storage for the access tokens of the background sync clients.

use std::fmt::Debug;

use dashmap::DashMap;
use keyring::Entry;

use crate::error::KeyringError;

const KEYRING_SERVICE: &str = "pantalaimon";

fn token_account(user_id: &str, device_id: &str) -> String {
    format!("{user_id}-{device_id}-token")
}

/// Abstraction around the credential store holding the access tokens of our
/// background sync clients, keyed by the user and device they belong to.
pub trait TokenStore: Send + Sync + Debug {
    /// Fetch the access token for the given user and device. `None` if no
    /// token is stored.
    fn get_token(&self, user_id: &str, device_id: &str) -> Result<Option<String>, KeyringError>;

    /// Store the access token for the given user and device, replacing any
    /// previous one.
    fn set_token(
        &self,
        user_id: &str,
        device_id: &str,
        token: &str,
    ) -> Result<(), KeyringError>;
}

/// A [`TokenStore`] backed by the OS keyring.
///
/// Tokens are stored under the service name `pantalaimon` with the account
/// set to `<user_id>-<device_id>-token`.
#[derive(Clone, Copy, Debug, Default)]
pub struct NativeKeyring;

impl TokenStore for NativeKeyring {
    fn get_token(&self, user_id: &str, device_id: &str) -> Result<Option<String>, KeyringError> {
        let entry = Entry::new(KEYRING_SERVICE, &token_account(user_id, device_id))?;

        match entry.get_password() {
            Ok(token) => Ok(Some(token)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set_token(
        &self,
        user_id: &str,
        device_id: &str,
        token: &str,
    ) -> Result<(), KeyringError> {
        let entry = Entry::new(KEYRING_SERVICE, &token_account(user_id, device_id))?;
        entry.set_password(token)?;

        Ok(())
    }
}

/// An in-memory [`TokenStore`] that will forget all the tokens once it's
/// dropped.
///
/// Useful on headless hosts without a secret service and in tests.
#[derive(Debug, Default)]
pub struct MemoryKeyring {
    tokens: DashMap<String, String>,
}

impl MemoryKeyring {
    /// Create a new, empty in-memory token store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl TokenStore for MemoryKeyring {
    fn get_token(&self, user_id: &str, device_id: &str) -> Result<Option<String>, KeyringError> {
        Ok(self
            .tokens
            .get(&token_account(user_id, device_id))
            .map(|token| token.clone()))
    }

    fn set_token(
        &self,
        user_id: &str,
        device_id: &str,
        token: &str,
    ) -> Result<(), KeyringError> {
        self.tokens.insert(token_account(user_id, device_id), token.to_owned());

        Ok(())
    }
}

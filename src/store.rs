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

//! Persistent storage for the users and access tokens the proxy knows about.

use std::{collections::HashMap, path::Path};

use serde::{Deserialize, Serialize};
use sled::{Config, Db, Tree};

use crate::error::StoreError;

const DATABASE_NAME: &str = "pan.db";

/// Result type of the store.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Segment separator for composite sled keys. 0xff can't appear in the
/// UTF-8 encoded hostnames, user ids and access tokens we key by, so a
/// one-segment prefix never collides with a longer key.
const KEY_SEPARATOR: u8 = 0xff;

trait EncodeKey {
    fn segments(&self) -> Vec<&[u8]>;

    fn encode(&self) -> Vec<u8> {
        let segments = self.segments();
        let length = segments.iter().map(|s| s.len() + 1).sum();

        let mut key = Vec::with_capacity(length);

        for segment in segments {
            key.extend_from_slice(segment);
            key.push(KEY_SEPARATOR);
        }

        key
    }
}

impl EncodeKey for &str {
    fn segments(&self) -> Vec<&[u8]> {
        vec![self.as_bytes()]
    }
}

impl EncodeKey for (&str, &str) {
    fn segments(&self) -> Vec<&[u8]> {
        vec![self.0.as_bytes(), self.1.as_bytes()]
    }
}

/// The binding of an access token the downstream client presented to us to
/// the Matrix user it belongs to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    /// The fully qualified id of the user the token belongs to.
    pub user_id: String,
    /// The access token as it was observed at login time.
    pub access_token: String,
}

impl ClientInfo {
    /// Create a new token binding for the given user.
    pub fn new(user_id: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self { user_id: user_id.into(), access_token: access_token.into() }
    }
}

/// Sled backed store holding, per homeserver hostname, the users we run
/// background sync clients for and the downstream access token bindings.
///
/// The access tokens of the background sync clients themselves never end up
/// here, those live in the [`TokenStore`].
///
/// [`TokenStore`]: crate::keyring::TokenStore
#[derive(Clone, Debug)]
pub struct PanStore {
    inner: Db,
    accounts: Tree,
    clients: Tree,
}

impl PanStore {
    /// Open the store inside the given data directory, creating the database
    /// if it doesn't exist yet.
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self> {
        let path = data_dir.as_ref().join(DATABASE_NAME);
        let db = Config::new().path(path).open()?;

        let accounts = db.open_tree("accounts")?;
        let clients = db.open_tree("clients")?;

        Ok(Self { inner: db, accounts, clients })
    }

    /// Remember that the given user has a background sync client on the
    /// given server.
    ///
    /// The device id becomes known only once the client's own login
    /// succeeds; passing `None` records the user without clobbering an
    /// already stored device id.
    pub fn save_server_user(
        &self,
        hostname: &str,
        user_id: &str,
        device_id: Option<&str>,
    ) -> Result<()> {
        let key = (hostname, user_id).encode();

        match device_id {
            Some(device_id) => {
                self.accounts.insert(key, device_id.as_bytes())?;
            }
            None => {
                if self.accounts.get(&key)?.is_none() {
                    self.accounts.insert(key, &b""[..])?;
                }
            }
        }

        self.inner.flush()?;

        Ok(())
    }

    /// Load the `(user_id, device_id)` pairs of every user that has a
    /// background sync client on the given server.
    ///
    /// Users whose device id was never recorded are skipped, there is no
    /// session that could be restored for them.
    pub fn load_users(&self, hostname: &str) -> Result<Vec<(String, String)>> {
        let prefix = hostname.encode();
        let mut users = Vec::new();

        for entry in self.accounts.scan_prefix(&prefix) {
            let (key, value) = entry?;

            if value.is_empty() {
                continue;
            }

            let user_id = String::from_utf8_lossy(
                key.get(prefix.len()..key.len().saturating_sub(1)).unwrap_or_default(),
            )
            .into_owned();
            let device_id = String::from_utf8_lossy(&value).into_owned();

            users.push((user_id, device_id));
        }

        Ok(users)
    }

    /// Persist a downstream access token binding.
    pub fn save_client(&self, hostname: &str, client: &ClientInfo) -> Result<()> {
        self.clients.insert(
            (hostname, client.access_token.as_str()).encode(),
            serde_json::to_vec(client)?,
        )?;
        self.inner.flush()?;

        Ok(())
    }

    /// Load every downstream access token binding known for the given
    /// server, keyed by the access token.
    pub fn load_clients(&self, hostname: &str) -> Result<HashMap<String, ClientInfo>> {
        let prefix = hostname.encode();
        let mut clients = HashMap::new();

        for entry in self.clients.scan_prefix(&prefix) {
            let (_, value) = entry?;
            let client: ClientInfo = serde_json::from_slice(&value)?;

            clients.insert(client.access_token.clone(), client);
        }

        Ok(clients)
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn server_user_round_trip() {
        let dir = tempdir().unwrap();
        let store = PanStore::open(dir.path()).unwrap();

        store.save_server_user("example.org", "@alice:example.org", None).unwrap();
        assert!(store.load_users("example.org").unwrap().is_empty());

        store
            .save_server_user("example.org", "@alice:example.org", Some("ALICEDEVICE"))
            .unwrap();

        assert_eq!(
            store.load_users("example.org").unwrap(),
            [("@alice:example.org".to_owned(), "ALICEDEVICE".to_owned())]
        );
    }

    #[test]
    fn device_id_isnt_clobbered() {
        let dir = tempdir().unwrap();
        let store = PanStore::open(dir.path()).unwrap();

        store
            .save_server_user("example.org", "@alice:example.org", Some("ALICEDEVICE"))
            .unwrap();
        store.save_server_user("example.org", "@alice:example.org", None).unwrap();

        assert_eq!(
            store.load_users("example.org").unwrap(),
            [("@alice:example.org".to_owned(), "ALICEDEVICE".to_owned())]
        );
    }

    #[test]
    fn users_are_scoped_per_server() {
        let dir = tempdir().unwrap();
        let store = PanStore::open(dir.path()).unwrap();

        store
            .save_server_user("example.org", "@alice:example.org", Some("ALICEDEVICE"))
            .unwrap();

        assert!(store.load_users("example.com").unwrap().is_empty());
    }

    #[test]
    fn client_round_trip() {
        let dir = tempdir().unwrap();
        let store = PanStore::open(dir.path()).unwrap();

        let client = ClientInfo::new("@alice:example.org", "secret-token");
        store.save_client("example.org", &client).unwrap();

        let clients = store.load_clients("example.org").unwrap();
        assert_eq!(clients.get("secret-token"), Some(&client));

        drop(store);

        // A fresh store sees the same binding after a restart.
        let store = PanStore::open(dir.path()).unwrap();
        let clients = store.load_clients("example.org").unwrap();
        assert_eq!(clients.get("secret-token"), Some(&client));
    }
}

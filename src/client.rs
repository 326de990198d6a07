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

//! The background sync client the proxy runs for every logged in user.

use std::{
    path::Path,
    sync::{Arc, Mutex},
    time::Duration,
};

use serde_json::Value;
use tokio::{
    sync::{futures::Notified, Notify},
    task::JoinHandle,
    time,
};
use tracing::{debug, info, warn};

use crate::{
    error::ClientError,
    matrix::{DeviceInfo, LoginInfo, MatrixClient, SendResponse},
};

/// How long the sync loop waits before it retries after a failed sync cycle.
const SYNC_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Which kind of response body is being decrypted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecryptionMode {
    /// The body of a sync response.
    Sync,
    /// The body of a room messages response.
    Messages,
}

/// A long lived, authenticated Matrix session the daemon runs in the
/// background on behalf of a downstream client.
///
/// The pan client owns the device identity and the encryption store of its
/// user. Its sync loop continuously pulls new events and key material from
/// the homeserver; every completed cycle fires the `synced` edge which the
/// decryption coordinator in [`decrypt_body`] waits on.
#[derive(Debug)]
pub struct PanClient {
    inner: Arc<dyn MatrixClient>,
    user_id: String,
    device_id: String,
    access_token: String,
    synced: Notify,
    sync_task: Mutex<Option<JoinHandle<()>>>,
}

impl PanClient {
    /// Wrap an authenticated [`MatrixClient`] into a pan client.
    pub fn new(inner: Arc<dyn MatrixClient>, login: LoginInfo) -> Self {
        Self {
            inner,
            user_id: login.user_id,
            device_id: login.device_id,
            access_token: login.access_token,
            synced: Notify::new(),
            sync_task: Mutex::new(None),
        }
    }

    /// The fully qualified id of the user this client belongs to.
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// The device id of this client's own login.
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// The access token of this client's own login.
    ///
    /// This is the token the proxy uses upstream where the pan client is the
    /// canonical identity, e.g. when a sync request is forwarded.
    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    /// A future that completes once the next sync cycle finishes.
    ///
    /// The returned future needs to be enabled before the decryption attempt
    /// it guards, otherwise an edge firing between the attempt and the await
    /// would be missed.
    pub(crate) fn synced(&self) -> Notified<'_> {
        self.synced.notified()
    }

    /// Start the background sync loop.
    ///
    /// Transient sync failures are retried after a short delay; only a
    /// completed cycle fires the synced edge.
    pub fn start_loop(self: &Arc<Self>) {
        let mut guard = self.sync_task.lock().unwrap();

        if guard.is_some() {
            return;
        }

        let client = self.clone();

        *guard = Some(tokio::spawn(async move {
            info!(user_id = client.user_id.as_str(), "Starting sync loop");

            loop {
                match client.inner.sync().await {
                    Ok(()) => client.synced.notify_waiters(),
                    Err(e) => {
                        warn!(
                            user_id = client.user_id.as_str(),
                            "Error syncing, retrying: {e}"
                        );
                        time::sleep(SYNC_RETRY_DELAY).await;
                    }
                }
            }
        }));
    }

    /// Stop the background sync loop.
    pub fn stop_loop(&self) {
        if let Some(task) = self.sync_task.lock().unwrap().take() {
            task.abort();
        }
    }

    /// Shut the client down, flushing and closing its stores.
    ///
    /// The sync loop needs to be stopped before this is called.
    pub async fn close(&self) -> Result<(), ClientError> {
        self.inner.close().await
    }

    pub(crate) async fn decrypt(
        &self,
        mode: DecryptionMode,
        body: &Value,
        ignore_failures: bool,
    ) -> Result<Value, ClientError> {
        match mode {
            DecryptionMode::Sync => self.inner.decrypt_sync_body(body, ignore_failures).await,
            DecryptionMode::Messages => {
                self.inner.decrypt_messages_body(body, ignore_failures).await
            }
        }
    }

    /// Replace the encrypted events of a sync response body with their
    /// plaintext form.
    pub async fn decrypt_sync_body(
        &self,
        body: &Value,
        ignore_failures: bool,
    ) -> Result<Value, ClientError> {
        self.decrypt(DecryptionMode::Sync, body, ignore_failures).await
    }

    /// Replace the encrypted events of a room messages response body with
    /// their plaintext form.
    pub async fn decrypt_messages_body(
        &self,
        body: &Value,
        ignore_failures: bool,
    ) -> Result<Value, ClientError> {
        self.decrypt(DecryptionMode::Messages, body, ignore_failures).await
    }

    /// Encrypt and send a room message through this client.
    pub async fn room_send(
        &self,
        room_id: &str,
        event_type: &str,
        content: &Value,
        txn_id: &str,
    ) -> Result<SendResponse, ClientError> {
        self.inner.room_send(room_id, event_type, content, txn_id).await
    }

    /// Whether the given room is encrypted, `None` if the room isn't known.
    pub async fn is_room_encrypted(&self, room_id: &str) -> Option<bool> {
        self.inner.is_room_encrypted(room_id).await
    }

    /// Look a device up in this client's device store.
    pub async fn get_device(&self, user_id: &str, device_id: &str) -> Option<DeviceInfo> {
        self.inner.get_device(user_id, device_id).await
    }

    /// Mark the given device as verified, returning true if the trust state
    /// changed.
    pub async fn verify_device(&self, device: &DeviceInfo) -> Result<bool, ClientError> {
        self.inner.verify_device(device).await
    }

    /// Mark the given device as unverified, returning true if the trust
    /// state changed.
    pub async fn unverify_device(&self, device: &DeviceInfo) -> Result<bool, ClientError> {
        self.inner.unverify_device(device).await
    }

    /// Accept a pending interactive short auth string verification.
    pub async fn accept_sas(&self, user_id: &str, device_id: &str) -> Result<(), ClientError> {
        self.inner.accept_sas(user_id, device_id).await
    }

    /// Confirm a pending interactive short auth string verification.
    pub async fn confirm_sas(&self, user_id: &str, device_id: &str) -> Result<(), ClientError> {
        self.inner.confirm_sas(user_id, device_id).await
    }

    /// Export this client's room encryption keys into a passphrase protected
    /// file.
    pub async fn export_keys(&self, path: &Path, passphrase: &str) -> Result<(), ClientError> {
        self.inner.export_keys(path, passphrase).await
    }

    /// Import room encryption keys from a passphrase protected file.
    pub async fn import_keys(&self, path: &Path, passphrase: &str) -> Result<(), ClientError> {
        self.inner.import_keys(path, passphrase).await
    }
}

/// Try to decrypt a sync or messages response body, retrying as new key
/// material arrives.
///
/// Decryption is attempted in strict mode; every failed attempt waits for
/// the pan client's next sync cycle and tries again. Once the given timeout
/// elapses a single lenient pass is made, leaving the events we still can't
/// decrypt untouched.
///
/// The attempt is abandoned without affecting the pan client when the caller
/// is dropped.
pub(crate) async fn decrypt_body(
    client: &PanClient,
    body: &Value,
    mode: DecryptionMode,
    timeout: Duration,
) -> Value {
    let decrypt_loop = async {
        loop {
            let notified = client.synced();
            tokio::pin!(notified);
            notified.as_mut().enable();

            debug!("Trying to decrypt the response");

            match client.decrypt(mode, body, false).await {
                Ok(decrypted) => return decrypted,
                Err(e) => {
                    debug!("Error decrypting the response, waiting for the next sync: {e}");
                    notified.await;
                    debug!("Pan client synced, retrying decryption");
                }
            }
        }
    };

    match time::timeout(timeout, decrypt_loop).await {
        Ok(decrypted) => decrypted,
        Err(_) => {
            info!("Decryption attempt timed out, decrypting with failures");

            client
                .decrypt(mode, body, true)
                .await
                .unwrap_or_else(|_| body.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::error::ClientError;

    #[derive(Debug, Default)]
    struct FakeClient {
        has_keys: AtomicBool,
        sync_count: AtomicUsize,
        sync_delay: Option<Duration>,
    }

    impl FakeClient {
        fn with_key_arrival(delay: Duration) -> Self {
            Self { sync_delay: Some(delay), ..Self::default() }
        }

        fn decrypted() -> Value {
            json!({"decrypted": true})
        }
    }

    #[async_trait]
    impl MatrixClient for FakeClient {
        async fn login(
            &self,
            _: &str,
            _: &str,
            _: &str,
        ) -> Result<LoginInfo, ClientError> {
            Err(ClientError::Other("not scripted".to_owned()))
        }

        async fn restore_login(&self, _: &str, _: &str, _: &str) -> Result<(), ClientError> {
            Ok(())
        }

        async fn load_store(&self) -> Result<(), ClientError> {
            Ok(())
        }

        async fn sync(&self) -> Result<(), ClientError> {
            self.sync_count.fetch_add(1, Ordering::SeqCst);

            match self.sync_delay {
                Some(delay) => {
                    time::sleep(delay).await;
                    self.has_keys.store(true, Ordering::SeqCst);
                    Ok(())
                }
                // Keep the loop quiet once the interesting cycle ran.
                None => {
                    time::sleep(Duration::from_secs(3600)).await;
                    Ok(())
                }
            }
        }

        async fn decrypt_sync_body(
            &self,
            body: &Value,
            ignore_failures: bool,
        ) -> Result<Value, ClientError> {
            if self.has_keys.load(Ordering::SeqCst) {
                Ok(Self::decrypted())
            } else if ignore_failures {
                Ok(body.clone())
            } else {
                Err(ClientError::Decryption("missing room key".to_owned()))
            }
        }

        async fn decrypt_messages_body(
            &self,
            body: &Value,
            ignore_failures: bool,
        ) -> Result<Value, ClientError> {
            self.decrypt_sync_body(body, ignore_failures).await
        }

        async fn room_send(
            &self,
            _: &str,
            _: &str,
            _: &Value,
            _: &str,
        ) -> Result<SendResponse, ClientError> {
            Err(ClientError::Other("not scripted".to_owned()))
        }

        async fn is_room_encrypted(&self, _: &str) -> Option<bool> {
            None
        }

        async fn get_device(&self, _: &str, _: &str) -> Option<DeviceInfo> {
            None
        }

        async fn verify_device(&self, _: &DeviceInfo) -> Result<bool, ClientError> {
            Ok(false)
        }

        async fn unverify_device(&self, _: &DeviceInfo) -> Result<bool, ClientError> {
            Ok(false)
        }

        async fn accept_sas(&self, _: &str, _: &str) -> Result<(), ClientError> {
            Ok(())
        }

        async fn confirm_sas(&self, _: &str, _: &str) -> Result<(), ClientError> {
            Ok(())
        }

        async fn export_keys(&self, _: &Path, _: &str) -> Result<(), ClientError> {
            Ok(())
        }

        async fn import_keys(&self, _: &Path, _: &str) -> Result<(), ClientError> {
            Ok(())
        }

        async fn close(&self) -> Result<(), ClientError> {
            Ok(())
        }
    }

    fn login_info() -> LoginInfo {
        LoginInfo {
            user_id: "@alice:example.org".to_owned(),
            device_id: "ALICEDEVICE".to_owned(),
            access_token: "pan-token".to_owned(),
        }
    }

    fn pan_client(inner: Arc<FakeClient>) -> Arc<PanClient> {
        Arc::new(PanClient::new(inner, login_info()))
    }

    #[tokio::test(start_paused = true)]
    async fn decryption_succeeds_once_keys_arrive() {
        let client =
            pan_client(Arc::new(FakeClient::with_key_arrival(Duration::from_millis(300))));
        client.start_loop();

        let body = json!({"rooms": {}});
        let start = time::Instant::now();

        let decrypted =
            decrypt_body(&client, &body, DecryptionMode::Sync, Duration::from_secs(10)).await;

        assert_eq!(decrypted, FakeClient::decrypted());
        assert!(start.elapsed() >= Duration::from_millis(300));
        assert!(start.elapsed() < Duration::from_secs(10));

        client.stop_loop();
    }

    #[tokio::test(start_paused = true)]
    async fn decryption_times_out_leniently() {
        // No sync loop is running, the synced edge never fires and the keys
        // never arrive.
        let client = pan_client(Arc::new(FakeClient::default()));

        let body = json!({"rooms": {"join": {}}});
        let start = time::Instant::now();

        let decrypted =
            decrypt_body(&client, &body, DecryptionMode::Sync, Duration::from_secs(10)).await;

        assert_eq!(decrypted, body);
        assert!(start.elapsed() >= Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn messages_mode_uses_the_same_retry_logic() {
        let client =
            pan_client(Arc::new(FakeClient::with_key_arrival(Duration::from_millis(100))));
        client.start_loop();

        let body = json!({"chunk": []});
        let decrypted =
            decrypt_body(&client, &body, DecryptionMode::Messages, Duration::from_secs(10)).await;

        assert_eq!(decrypted, FakeClient::decrypted());

        client.stop_loop();
    }

    #[tokio::test(start_paused = true)]
    async fn starting_the_loop_twice_is_a_no_op() {
        let inner = Arc::new(FakeClient::with_key_arrival(Duration::from_millis(100)));
        let client = pan_client(inner.clone());

        client.start_loop();
        client.start_loop();

        time::sleep(Duration::from_millis(150)).await;

        // A single loop finished one cycle at 100ms and started the next
        // one; a second loop would have doubled the count.
        assert_eq!(inner.sync_count.load(Ordering::SeqCst), 2);

        client.stop_loop();
    }
}

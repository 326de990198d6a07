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

//! The HTTP proxy daemon sitting between unmodified Matrix clients and the
//! homeserver.
//!
//! All traffic is forwarded verbatim except for the handful of endpoints
//! where the daemon steps in to transparently decrypt responses, encrypt
//! room messages, or widen filters so encrypted events stay visible to us.

use std::{path::PathBuf, sync::Arc};

use axum::{
    body::{Body, Bytes},
    extract::{Path, Request, State},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use serde_json::{json, Value};
use tokio::{
    net::TcpListener,
    sync::{mpsc, Mutex},
};
use tracing::{info, warn};
use url::form_urlencoded;

use crate::{
    client::{decrypt_body, DecryptionMode, PanClient},
    config::ProxyConfig,
    error::{ClientError, Result},
    keyring::TokenStore,
    matrix::{ClientConfig, ClientFactory, DeviceInfo, LoginInfo},
    messages::{ControlMessage, DaemonResponse, ResponseCode},
    store::{ClientInfo, PanStore},
};

/// The device display name our background sync clients log in with.
const DEVICE_NAME: &str = "pantalaimon";

/// An E2EE aware reverse proxy for a single homeserver.
///
/// The daemon owns one [`PanClient`] per logged in user, the persistent
/// store remembering those users across restarts and the client session
/// used to forward requests upstream.
#[derive(Debug)]
pub struct ProxyDaemon {
    config: ProxyConfig,
    hostname: String,
    store: PanStore,
    keyring: Arc<dyn TokenStore>,
    factory: Arc<dyn ClientFactory>,
    pan_clients: DashMap<String, Arc<PanClient>>,
    client_info: DashMap<String, ClientInfo>,
    send_queue: mpsc::Sender<DaemonResponse>,
    recv_queue: Mutex<Option<mpsc::Receiver<ControlMessage>>>,
    http_client: OnceCell<reqwest::Client>,
}

impl ProxyDaemon {
    /// Create a new proxy daemon for the homeserver in the given config.
    ///
    /// Previously known users are restored from the store and their
    /// background sync clients are started, skipping users whose access
    /// token can't be found in the keyring.
    pub async fn new(
        config: ProxyConfig,
        factory: Arc<dyn ClientFactory>,
        keyring: Arc<dyn TokenStore>,
        send_queue: mpsc::Sender<DaemonResponse>,
        recv_queue: mpsc::Receiver<ControlMessage>,
    ) -> Result<Self> {
        let hostname = config
            .homeserver
            .host_str()
            .ok_or(url::ParseError::EmptyHost)?
            .to_owned();

        let store = PanStore::open(&config.data_dir)?;
        let client_info: DashMap<_, _> = store.load_clients(&hostname)?.into_iter().collect();

        let daemon = Self {
            hostname,
            store,
            keyring,
            factory,
            pan_clients: DashMap::new(),
            client_info,
            send_queue,
            recv_queue: Mutex::new(Some(recv_queue)),
            http_client: OnceCell::new(),
            config,
        };

        daemon.restore_clients().await?;

        Ok(daemon)
    }

    /// The axum router serving the proxy.
    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/_matrix/client/:version/login", post(login))
            .route("/_matrix/client/:version/sync", get(sync))
            .route("/_matrix/client/:version/rooms/:room_id/messages", get(messages))
            .route(
                "/_matrix/client/:version/rooms/:room_id/send/:event_type/:txn_id",
                put(send_message),
            )
            .route("/_matrix/client/:version/user/:user_id/filter", post(filter))
            .fallback(forward)
            .with_state(self.clone())
    }

    /// Serve the proxy on the given listener until the task is cancelled.
    pub async fn serve(self: &Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        info!(
            proxy = self.config.name.as_str(),
            "Starting the daemon for {}", self.config.homeserver
        );

        axum::serve(listener, self.router()).await
    }

    /// Shut the daemon down, stopping and closing every background sync
    /// client it owns.
    pub async fn shutdown(&self) {
        let clients: Vec<_> = self.pan_clients.iter().map(|entry| entry.value().clone()).collect();
        self.pan_clients.clear();

        for client in clients {
            client.stop_loop();

            if let Err(e) = client.close().await {
                warn!("Error closing the client for {}: {e}", client.user_id());
            }
        }
    }

    fn client_config(&self) -> ClientConfig {
        ClientConfig {
            homeserver: self.config.homeserver.clone(),
            store_path: self.config.data_dir.clone(),
            proxy: self.config.proxy.clone(),
            disable_ssl_verification: self.config.disable_ssl_verification,
        }
    }

    async fn restore_clients(&self) -> Result<()> {
        for (user_id, device_id) in self.store.load_users(&self.hostname)? {
            let token = match self.keyring.get_token(&user_id, &device_id) {
                Ok(Some(token)) => token,
                Ok(None) => {
                    warn!(
                        "Not restoring the client for {user_id} {device_id}, \
                         missing access token"
                    );
                    continue;
                }
                Err(e) => {
                    warn!(
                        "Not restoring the client for {user_id} {device_id}, \
                         the keyring reported an error: {e}"
                    );
                    continue;
                }
            };

            info!("Restoring the client for {user_id} {device_id}");

            let client = match self.factory.create(&self.client_config()).await {
                Ok(client) => client,
                Err(e) => {
                    warn!("Unable to create a client for {user_id}: {e}");
                    continue;
                }
            };

            if let Err(e) = client.restore_login(&user_id, &device_id, &token).await {
                warn!("Unable to restore the login of {user_id}: {e}");
                let _ = client.close().await;
                continue;
            }

            if let Err(e) = client.load_store().await {
                warn!("Unable to load the encryption store of {user_id}: {e}");
                let _ = client.close().await;
                continue;
            }

            let login = LoginInfo { user_id: user_id.clone(), device_id, access_token: token };
            let pan_client = Arc::new(PanClient::new(client, login));

            pan_client.start_loop();
            self.pan_clients.insert(user_id, pan_client);
        }

        Ok(())
    }

    /// Record a token binding for the given user and make sure a background
    /// sync client is running for them.
    ///
    /// If a client already exists the token is merely aliased to it,
    /// otherwise a new client logs in with the given credentials, its own
    /// access token is put into the keyring and its sync loop is started.
    pub async fn start_pan_client(
        &self,
        access_token: &str,
        user: &str,
        user_id: &str,
        password: &str,
    ) -> Result<()> {
        let client_info = ClientInfo::new(user_id, access_token);

        self.client_info.insert(access_token.to_owned(), client_info.clone());
        self.store.save_client(&self.hostname, &client_info)?;
        self.store.save_server_user(&self.hostname, user_id, None)?;

        if self.pan_clients.contains_key(user_id) {
            info!("A background sync client already exists for {user_id}, not starting a new one");
            return Ok(());
        }

        let client = self.factory.create(&self.client_config()).await?;

        let login = match client.login(user, password, DEVICE_NAME).await {
            Ok(login) => login,
            Err(e) => {
                let _ = client.close().await;
                return Err(e.into());
            }
        };

        info!("Successfully started a new background sync client for {user_id}");

        self.store.save_server_user(&self.hostname, user_id, Some(&login.device_id))?;
        self.keyring.set_token(user_id, &login.device_id, &login.access_token)?;

        let pan_client = Arc::new(PanClient::new(client, login));

        pan_client.start_loop();
        self.pan_clients.insert(user_id.to_owned(), pan_client);

        Ok(())
    }

    /// Resolve the access token of a downstream request to the pan client
    /// that should handle it.
    fn auth_client(
        &self,
        query: Option<&str>,
        headers: &HeaderMap,
    ) -> std::result::Result<Arc<PanClient>, Response> {
        let Some(token) = access_token(query, headers) else {
            return Err(missing_token());
        };

        let Some(user_id) = self.client_info.get(&token).map(|info| info.user_id.clone()) else {
            return Err(unknown_token());
        };

        match self.pan_clients.get(&user_id) {
            Some(client) => Ok(client.value().clone()),
            None => Err(unknown_token()),
        }
    }

    fn http_client(&self) -> Result<&reqwest::Client> {
        Ok(self.http_client.get_or_try_init(|| {
            let mut builder = reqwest::Client::builder()
                .user_agent(concat!("pantalaimon/", env!("CARGO_PKG_VERSION")));

            if self.config.disable_ssl_verification {
                builder = builder.danger_accept_invalid_certs(true);
            }

            if let Some(proxy) = &self.config.proxy {
                builder = builder.proxy(reqwest::Proxy::all(proxy.as_str())?);
            }

            builder.build()
        })?)
    }

    /// Forward a request to our configured homeserver.
    ///
    /// The Host header is dropped, the Content-Length is recomputed for the
    /// body we actually send. If a token is given, both the Authorization
    /// header and the `access_token` query parameter are rewritten to it
    /// wherever they are present.
    async fn forward_request(
        &self,
        method: Method,
        path: &str,
        query: Option<&str>,
        mut headers: HeaderMap,
        body: Bytes,
        token: Option<&str>,
    ) -> Result<reqwest::Response> {
        headers.remove(header::HOST);
        headers.remove(header::CONTENT_LENGTH);

        let query = match (query, token) {
            (Some(query), Some(token)) => Some(rewrite_query_token(query, token)),
            (query, _) => query.map(ToOwned::to_owned),
        };

        if let Some(token) = token {
            if headers.contains_key(header::AUTHORIZATION) {
                headers.insert(
                    header::AUTHORIZATION,
                    HeaderValue::from_str(&format!("Bearer {token}"))?,
                );
            }
        }

        let mut url = self.config.homeserver.clone();
        url.set_path(path);
        url.set_query(query.as_deref());

        Ok(self.http_client()?.request(method, url).headers(headers).body(body).send().await?)
    }

    /// Forward the given request and convert the upstream answer into a
    /// downstream response, mapping connection failures to a 500.
    async fn forward_to_web(
        &self,
        method: Method,
        uri: &Uri,
        headers: HeaderMap,
        body: Bytes,
        token: Option<&str>,
    ) -> Response {
        match self.forward_request(method, uri.path(), uri.query(), headers, body, token).await {
            Ok(response) => {
                let status = response.status();
                let content_type = response.headers().get(header::CONTENT_TYPE).cloned();

                match response.bytes().await {
                    Ok(body) => relay_response(status, content_type, body),
                    Err(e) => connection_error(e),
                }
            }
            Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
        }
    }

    async fn decrypt_body(&self, client: &PanClient, body: &Value, mode: DecryptionMode) -> Value {
        decrypt_body(client, body, mode, self.config.decryption_timeout).await
    }

    /// Run the control message loop, consuming messages from the UI until
    /// the queue is closed.
    ///
    /// Failures are answered with a [`DaemonResponse`] carrying a symbolic
    /// error code, the loop itself never terminates on them.
    pub async fn message_loop(&self) {
        let receiver = self.recv_queue.lock().await.take();

        let Some(mut receiver) = receiver else {
            warn!("The control message loop was already started");
            return;
        };

        while let Some(message) = receiver.recv().await {
            self.receive_message(message).await;
        }
    }

    async fn receive_message(&self, message: ControlMessage) {
        let client = self.pan_clients.get(message.pan_user()).map(|c| c.value().clone());

        let Some(client) = client else {
            warn!("No background sync client found for {}", message.pan_user());
            return;
        };

        match message {
            ControlMessage::DeviceVerify { message_id, pan_user, user_id, device_id } => {
                match client.get_device(&user_id, &device_id).await {
                    Some(device) => self.verify_device(message_id, &client, device).await,
                    None => self.unknown_device(message_id, &pan_user, &user_id, &device_id).await,
                }
            }
            ControlMessage::DeviceUnverify { message_id, pan_user, user_id, device_id } => {
                match client.get_device(&user_id, &device_id).await {
                    Some(device) => self.unverify_device(message_id, &client, device).await,
                    None => self.unknown_device(message_id, &pan_user, &user_id, &device_id).await,
                }
            }
            ControlMessage::AcceptSas { user_id, device_id, .. } => {
                if let Err(e) = client.accept_sas(&user_id, &device_id).await {
                    warn!("Error accepting the verification with {user_id} {device_id}: {e}");
                }
            }
            ControlMessage::ConfirmSas { user_id, device_id, .. } => {
                if let Err(e) = client.confirm_sas(&user_id, &device_id).await {
                    warn!("Error confirming the verification with {user_id} {device_id}: {e}");
                }
            }
            ControlMessage::ExportKeys { message_id, pan_user, path, passphrase } => {
                let path = expand_path(&path);
                info!("Exporting keys to {}", path.display());

                match client.export_keys(&path, &passphrase).await {
                    Ok(()) => {
                        let msg = format!(
                            "Successfully exported keys for {} to {}",
                            client.user_id(),
                            path.display()
                        );
                        info!("{msg}");
                        self.send_response(message_id, &pan_user, ResponseCode::Ok, msg).await;
                    }
                    Err(e) => {
                        info!(
                            "Error exporting keys for {} to {}: {e}",
                            client.user_id(),
                            path.display()
                        );
                        self.send_response(
                            message_id,
                            &pan_user,
                            ResponseCode::OsError,
                            e.to_string(),
                        )
                        .await;
                    }
                }
            }
            ControlMessage::ImportKeys { message_id, pan_user, path, passphrase } => {
                let path = expand_path(&path);
                info!("Importing keys from {}", path.display());

                match client.import_keys(&path, &passphrase).await {
                    Ok(()) => {
                        let msg = format!(
                            "Successfully imported keys for {} from {}",
                            client.user_id(),
                            path.display()
                        );
                        info!("{msg}");
                        self.send_response(message_id, &pan_user, ResponseCode::Ok, msg).await;
                    }
                    Err(e) => {
                        info!(
                            "Error importing keys for {} from {}: {e}",
                            client.user_id(),
                            path.display()
                        );
                        self.send_response(
                            message_id,
                            &pan_user,
                            ResponseCode::OsError,
                            e.to_string(),
                        )
                        .await;
                    }
                }
            }
        }
    }

    async fn unknown_device(&self, message_id: u64, pan_user: &str, user_id: &str, device_id: &str) {
        let msg = format!("No device found for {user_id} and {device_id}");
        info!("{msg}");

        self.send_response(message_id, pan_user, ResponseCode::UnknownDevice, msg).await;
    }

    async fn verify_device(&self, message_id: u64, client: &PanClient, device: DeviceInfo) {
        let msg = match client.verify_device(&device).await {
            Ok(true) => format!(
                "Device {} of user {} successfully verified",
                device.device_id, device.user_id
            ),
            Ok(false) => {
                format!("Device {} of user {} already verified", device.device_id, device.user_id)
            }
            Err(e) => {
                warn!("Error verifying device {} of user {}: {e}", device.device_id, device.user_id);
                self.send_response(message_id, client.user_id(), ResponseCode::OsError, e.to_string())
                    .await;
                return;
            }
        };

        info!("{msg}");
        self.send_response(message_id, client.user_id(), ResponseCode::Ok, msg).await;
    }

    async fn unverify_device(&self, message_id: u64, client: &PanClient, device: DeviceInfo) {
        let msg = match client.unverify_device(&device).await {
            Ok(true) => format!(
                "Device {} of user {} successfully unverified",
                device.device_id, device.user_id
            ),
            Ok(false) => {
                format!("Device {} of user {} already unverified", device.device_id, device.user_id)
            }
            Err(e) => {
                warn!(
                    "Error unverifying device {} of user {}: {e}",
                    device.device_id, device.user_id
                );
                self.send_response(message_id, client.user_id(), ResponseCode::OsError, e.to_string())
                    .await;
                return;
            }
        };

        info!("{msg}");
        self.send_response(message_id, client.user_id(), ResponseCode::Ok, msg).await;
    }

    async fn send_response(
        &self,
        message_id: u64,
        pan_user: &str,
        code: ResponseCode,
        message: impl Into<String>,
    ) {
        let response = DaemonResponse {
            message_id,
            pan_user: pan_user.to_owned(),
            code,
            message: message.into(),
        };

        if self.send_queue.send(response).await.is_err() {
            warn!("The UI side of the message queue was dropped");
        }
    }
}

async fn login(State(daemon): State<Arc<ProxyDaemon>>, request: Request) -> Response {
    let (parts, body) = request.into_parts();

    let body = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(body) => body,
        Err(e) => return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    };

    let Ok(json_body) = serde_json::from_slice::<Value>(&body) else {
        return not_json();
    };

    let user = login_user(&json_body).to_owned();
    let password =
        json_body.get("password").and_then(Value::as_str).unwrap_or_default().to_owned();

    info!("New user logging in: {user}");

    let response = match daemon
        .forward_request(parts.method, parts.uri.path(), parts.uri.query(), parts.headers, body, None)
        .await
    {
        Ok(response) => response,
        Err(e) => return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    };

    let status = response.status();
    let content_type = response.headers().get(header::CONTENT_TYPE).cloned();

    let body = match response.bytes().await {
        Ok(body) => body,
        Err(e) => return connection_error(e),
    };

    if status == StatusCode::OK {
        if let Ok(json_response) = serde_json::from_slice::<Value>(&body) {
            let user_id = json_response.get("user_id").and_then(Value::as_str);
            let access_token = json_response.get("access_token").and_then(Value::as_str);

            if let (Some(user_id), Some(access_token)) = (user_id, access_token) {
                info!("User: {user} successfully logged in, starting a background sync client");

                if let Err(e) =
                    daemon.start_pan_client(access_token, &user, user_id, &password).await
                {
                    warn!("Unable to start a background sync client for {user_id}: {e}");
                }
            }
        }
    }

    relay_response(status, content_type, body)
}

async fn sync(State(daemon): State<Arc<ProxyDaemon>>, request: Request) -> Response {
    let (parts, body) = request.into_parts();

    let client = match daemon.auth_client(parts.uri.query(), &parts.headers) {
        Ok(client) => client,
        Err(response) => return response,
    };

    let body = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(body) => body,
        Err(e) => return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    };

    // The pan client is the identity that syncs against the homeserver, its
    // token replaces the downstream one. Filters that would hide encrypted
    // events from us are widened before they leave.
    let query = parts.uri.query().map(sanitize_filter_param);

    let response = match daemon
        .forward_request(
            parts.method,
            parts.uri.path(),
            query.as_deref(),
            parts.headers,
            body,
            Some(client.access_token()),
        )
        .await
    {
        Ok(response) => response,
        Err(e) => return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    };

    let status = response.status();
    let content_type = response.headers().get(header::CONTENT_TYPE).cloned();

    let body = match response.bytes().await {
        Ok(body) => body,
        Err(e) => return connection_error(e),
    };

    if status == StatusCode::OK {
        if let Ok(json_response) = serde_json::from_slice::<Value>(&body) {
            let decrypted = daemon.decrypt_body(&client, &json_response, DecryptionMode::Sync).await;

            return (status, Json(decrypted)).into_response();
        }
    }

    relay_response(status, content_type, body)
}

async fn messages(State(daemon): State<Arc<ProxyDaemon>>, request: Request) -> Response {
    let (parts, body) = request.into_parts();

    let client = match daemon.auth_client(parts.uri.query(), &parts.headers) {
        Ok(client) => client,
        Err(response) => return response,
    };

    let body = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(body) => body,
        Err(e) => return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    };

    // Unlike sync, pagination happens with the downstream token.
    let response = match daemon
        .forward_request(parts.method, parts.uri.path(), parts.uri.query(), parts.headers, body, None)
        .await
    {
        Ok(response) => response,
        Err(e) => return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    };

    let status = response.status();
    let content_type = response.headers().get(header::CONTENT_TYPE).cloned();

    let body = match response.bytes().await {
        Ok(body) => body,
        Err(e) => return connection_error(e),
    };

    if status == StatusCode::OK {
        if let Ok(json_response) = serde_json::from_slice::<Value>(&body) {
            let decrypted =
                daemon.decrypt_body(&client, &json_response, DecryptionMode::Messages).await;

            return (status, Json(decrypted)).into_response();
        }
    }

    relay_response(status, content_type, body)
}

async fn send_message(
    State(daemon): State<Arc<ProxyDaemon>>,
    Path((_version, room_id, event_type, txn_id)): Path<(String, String, String, String)>,
    request: Request,
) -> Response {
    let (parts, body) = request.into_parts();

    let client = match daemon.auth_client(parts.uri.query(), &parts.headers) {
        Ok(client) => client,
        Err(response) => return response,
    };

    let body = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(body) => body,
        Err(e) => return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    };

    let encrypted = match client.is_room_encrypted(&room_id).await {
        Some(encrypted) => encrypted,
        // The pan client doesn't know the room, let the homeserver deal
        // with the request.
        None => return daemon.forward_to_web(parts.method, &parts.uri, parts.headers, body, None).await,
    };

    if !encrypted {
        return daemon
            .forward_to_web(
                parts.method,
                &parts.uri,
                parts.headers,
                body,
                Some(client.access_token()),
            )
            .await;
    }

    let Ok(content) = serde_json::from_slice::<Value>(&body) else {
        return not_json();
    };

    match client.room_send(&room_id, &event_type, &content, &txn_id).await {
        Ok(response) => {
            let mut builder = Response::builder().status(response.status);

            if let Some(content_type) =
                response.content_type.as_deref().and_then(|c| HeaderValue::from_str(c).ok())
            {
                builder = builder.header(header::CONTENT_TYPE, content_type);
            }

            builder
                .body(Body::from(response.body))
                .expect("Can't construct a response from the transport response")
        }
        Err(ClientError::SendRetry(e)) => (StatusCode::SERVICE_UNAVAILABLE, e).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn filter(State(daemon): State<Arc<ProxyDaemon>>, request: Request) -> Response {
    let (parts, body) = request.into_parts();

    if let Err(response) = daemon.auth_client(parts.uri.query(), &parts.headers) {
        return response;
    }

    let body = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(body) => body,
        Err(e) => return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    };

    let Ok(mut content) = serde_json::from_slice::<Value>(&body) else {
        return not_json();
    };

    sanitize_filter(&mut content);

    let body = Bytes::from(serde_json::to_vec(&content).expect("Can't serialize a filter"));

    daemon.forward_to_web(parts.method, &parts.uri, parts.headers, body, None).await
}

/// Catchall handler forwarding everything we don't intercept.
async fn forward(State(daemon): State<Arc<ProxyDaemon>>, request: Request) -> Response {
    let (parts, body) = request.into_parts();

    let body = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(body) => body,
        Err(e) => return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    };

    daemon.forward_to_web(parts.method, &parts.uri, parts.headers, body, None).await
}

fn missing_token() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({
            "errcode": "M_MISSING_TOKEN",
            "error": "Missing access token."
        })),
    )
        .into_response()
}

fn unknown_token() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({
            "errcode": "M_UNKNOWN_TOKEN",
            "error": "Unrecognised access token."
        })),
    )
        .into_response()
}

fn not_json() -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({
            "errcode": "M_NOT_JSON",
            "error": "Request did not contain valid JSON."
        })),
    )
        .into_response()
}

fn connection_error(e: reqwest::Error) -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
}

fn relay_response(
    status: StatusCode,
    content_type: Option<HeaderValue>,
    body: Bytes,
) -> Response {
    let mut builder = Response::builder().status(status);

    if let Some(content_type) = content_type {
        builder = builder.header(header::CONTENT_TYPE, content_type);
    }

    builder.body(Body::from(body)).expect("Can't construct a response from the upstream body")
}

/// Strip a `Bearer ` prefix off an Authorization header value.
fn strip_bearer(value: &str) -> &str {
    value.strip_prefix("Bearer ").unwrap_or(value)
}

/// Extract the access token of a request from its query string or its
/// Authorization header.
fn access_token(query: Option<&str>, headers: &HeaderMap) -> Option<String> {
    if let Some(query) = query {
        for (key, value) in form_urlencoded::parse(query.as_bytes()) {
            if key == "access_token" && !value.is_empty() {
                return Some(value.into_owned());
            }
        }
    }

    let header = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let token = strip_bearer(header);

    (!token.is_empty()).then(|| token.to_owned())
}

/// The user a login request is for, either from the identifier object or the
/// deprecated top level field.
fn login_user(body: &Value) -> &str {
    body.pointer("/identifier/user")
        .and_then(Value::as_str)
        .filter(|user| !user.is_empty())
        .or_else(|| body.get("user").and_then(Value::as_str))
        .unwrap_or_default()
}

/// Make sure that a filter isn't filtering out encrypted messages.
///
/// We always need to see encrypted events, otherwise we would have nothing
/// to decrypt for the downstream client.
fn sanitize_filter(filter: &mut Value) {
    let Some(timeline) = filter.pointer_mut("/room/timeline") else {
        return;
    };

    if let Some(types) = timeline.get_mut("types").and_then(Value::as_array_mut) {
        if !types.iter().any(|t| t == "m.room.encrypted") {
            types.push("m.room.encrypted".into());
        }
    }

    if let Some(not_types) = timeline.get_mut("not_types").and_then(Value::as_array_mut) {
        not_types.retain(|t| t != "m.room.encrypted");
    }
}

/// Rewrite the inline filter of a sync query string, leaving filter ids and
/// anything else untouched.
fn sanitize_filter_param(query: &str) -> String {
    let mut serializer = form_urlencoded::Serializer::new(String::new());

    for (key, value) in form_urlencoded::parse(query.as_bytes()) {
        if key == "filter" {
            if let Ok(mut filter) = serde_json::from_str::<Value>(&value) {
                if filter.is_object() {
                    sanitize_filter(&mut filter);
                    serializer.append_pair(&key, &filter.to_string());
                    continue;
                }
            }
        }

        serializer.append_pair(&key, &value);
    }

    serializer.finish()
}

fn rewrite_query_token(query: &str, token: &str) -> String {
    let mut serializer = form_urlencoded::Serializer::new(String::new());

    for (key, value) in form_urlencoded::parse(query.as_bytes()) {
        if key == "access_token" {
            serializer.append_pair(&key, token);
        } else {
            serializer.append_pair(&key, &value);
        }
    }

    serializer.finish()
}

/// Expand `~` and make the given path absolute without touching the
/// filesystem.
fn expand_path(path: &str) -> PathBuf {
    let path = if path == "~" || path.starts_with("~/") {
        match dirs::home_dir() {
            Some(home) => home.join(path.trim_start_matches(['~', '/'])),
            None => PathBuf::from(path),
        }
    } else {
        PathBuf::from(path)
    };

    if path.is_absolute() {
        path
    } else {
        match std::env::current_dir() {
            Ok(cwd) => cwd.join(path),
            Err(_) => path,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn bearer_is_a_prefix_strip() {
        assert_eq!(strip_bearer("Bearer XXX"), "XXX");
        assert_eq!(strip_bearer("BearXXX"), "BearXXX");
        assert_eq!(strip_bearer("XXXBearer "), "XXXBearer ");
    }

    #[test]
    fn token_from_query_wins_over_header() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer header-token"));

        assert_eq!(
            access_token(Some("access_token=query-token"), &headers).as_deref(),
            Some("query-token")
        );
    }

    #[test]
    fn empty_query_token_falls_back_to_the_header() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer header-token"));

        assert_eq!(
            access_token(Some("access_token="), &headers).as_deref(),
            Some("header-token")
        );
    }

    #[test]
    fn absent_token_is_none() {
        assert_eq!(access_token(None, &HeaderMap::new()), None);
        assert_eq!(access_token(Some("since=s123"), &HeaderMap::new()), None);
    }

    #[test]
    fn login_user_prefers_the_identifier() {
        let body = json!({
            "identifier": {"type": "m.id.user", "user": "alice"},
            "user": "bob",
        });
        assert_eq!(login_user(&body), "alice");

        let body = json!({"user": "bob"});
        assert_eq!(login_user(&body), "bob");

        let body = json!({"password": "p"});
        assert_eq!(login_user(&body), "");
    }

    #[test]
    fn filter_types_are_widened() {
        let mut filter = json!({
            "room": {
                "timeline": {
                    "types": ["m.room.message"],
                    "not_types": ["m.room.encrypted"],
                }
            }
        });

        sanitize_filter(&mut filter);

        assert_eq!(
            filter,
            json!({
                "room": {
                    "timeline": {
                        "types": ["m.room.message", "m.room.encrypted"],
                        "not_types": [],
                    }
                }
            })
        );
    }

    #[test]
    fn filter_sanitizing_is_idempotent() {
        let mut filter = json!({
            "room": {
                "timeline": {
                    "types": ["m.room.message"],
                    "not_types": ["m.room.encrypted", "m.room.member"],
                }
            }
        });

        sanitize_filter(&mut filter);
        let once = filter.clone();
        sanitize_filter(&mut filter);

        assert_eq!(filter, once);
    }

    #[test]
    fn filters_without_a_timeline_pass_through() {
        let mut filter = json!({"presence": {"types": []}});
        let expected = filter.clone();

        sanitize_filter(&mut filter);

        assert_eq!(filter, expected);

        let mut filter = json!("not-even-an-object");
        let expected = filter.clone();

        sanitize_filter(&mut filter);

        assert_eq!(filter, expected);
    }

    #[test]
    fn inline_filters_are_rewritten() {
        let query = format!(
            "since=s123&filter={}",
            form_urlencoded::byte_serialize(
                json!({"room": {"timeline": {"types": ["m.room.message"]}}})
                    .to_string()
                    .as_bytes()
            )
            .collect::<String>()
        );

        let sanitized = sanitize_filter_param(&query);

        let filter = form_urlencoded::parse(sanitized.as_bytes())
            .find(|(key, _)| key == "filter")
            .map(|(_, value)| value.into_owned())
            .unwrap();

        let filter: Value = serde_json::from_str(&filter).unwrap();
        assert_eq!(
            filter,
            json!({"room": {"timeline": {"types": ["m.room.message", "m.room.encrypted"]}}})
        );
    }

    #[test]
    fn filter_ids_pass_through() {
        assert_eq!(sanitize_filter_param("filter=some_filter_id"), "filter=some_filter_id");
    }

    #[test]
    fn query_tokens_are_rewritten() {
        assert_eq!(
            rewrite_query_token("access_token=old&since=s1", "new"),
            "access_token=new&since=s1"
        );
        assert_eq!(rewrite_query_token("since=s1", "new"), "since=s1");
    }

    #[test]
    fn tilde_paths_are_expanded() {
        let home = dirs::home_dir().unwrap();

        assert_eq!(expand_path("~/keys.txt"), home.join("keys.txt"));
        assert_eq!(expand_path("/tmp/keys.txt"), PathBuf::from("/tmp/keys.txt"));
    }
}

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

//! Configuration for a proxy instance.

use std::{path::PathBuf, time::Duration};

use url::Url;

const DEFAULT_DECRYPTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration for a [`ProxyDaemon`] serving a single homeserver.
///
/// # Example
///
/// ```
/// use pantalaimon::ProxyConfig;
/// use std::time::Duration;
/// use url::Url;
///
/// let homeserver = Url::parse("https://example.org").unwrap();
/// let config = ProxyConfig::new("example", homeserver, "/var/lib/pantalaimon")
///     .disable_ssl_verification()
///     .decryption_timeout(Duration::from_secs(30));
/// ```
///
/// [`ProxyDaemon`]: crate::ProxyDaemon
#[derive(Clone, Debug)]
pub struct ProxyConfig {
    pub(crate) name: String,
    pub(crate) homeserver: Url,
    pub(crate) data_dir: PathBuf,
    pub(crate) proxy: Option<Url>,
    pub(crate) disable_ssl_verification: bool,
    pub(crate) decryption_timeout: Duration,
}

impl ProxyConfig {
    /// Create a new configuration for the given homeserver.
    ///
    /// # Arguments
    ///
    /// * `name` - A human readable name for this proxy instance, used in log
    /// messages.
    ///
    /// * `homeserver` - The URL of the homeserver every request will be
    /// forwarded to.
    ///
    /// * `data_dir` - The directory where the proxy keeps its database and
    /// where the client implementation keeps its encryption store.
    pub fn new(name: impl Into<String>, homeserver: Url, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            homeserver,
            data_dir: data_dir.into(),
            proxy: None,
            disable_ssl_verification: false,
            decryption_timeout: DEFAULT_DECRYPTION_TIMEOUT,
        }
    }

    /// Forward requests to the homeserver through the given outbound proxy.
    #[must_use]
    pub fn proxy(mut self, proxy: Url) -> Self {
        self.proxy = Some(proxy);
        self
    }

    /// Disable TLS certificate verification for the connection to the
    /// homeserver.
    #[must_use]
    pub fn disable_ssl_verification(mut self) -> Self {
        self.disable_ssl_verification = true;
        self
    }

    /// Set how long a response may be delayed while we wait for the key
    /// material that is needed to decrypt it. The default is 10 seconds.
    #[must_use]
    pub fn decryption_timeout(mut self, timeout: Duration) -> Self {
        self.decryption_timeout = timeout;
        self
    }
}

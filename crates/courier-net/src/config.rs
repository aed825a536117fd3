//! Engine configuration.
//!
//! [`ConnectionSettings`] carries what the transport needs to open
//! connections. [`EngineConfiguration`] bundles those settings with the
//! pluggable pieces of the engine: the transport, codec registry, endpoint
//! resolver, optional session delegate and the dispatch context on which
//! every callback is delivered.
//!
//! # Example
//!
//! ```ignore
//! use courier_net::{ConnectionSettings, EngineConfiguration, NetworkManager, ReqwestTransport};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let settings = ConnectionSettings::default()
//!     .timeout(Duration::from_secs(15))
//!     .user_agent("MyApp/1.0");
//!
//! let config = EngineConfiguration::builder(Arc::new(ReqwestTransport::new()))
//!     .base_url("https://api.example.com/v1/")
//!     .settings(settings)
//!     .build()?;
//!
//! let manager = NetworkManager::new();
//! manager.configure(config)?;
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use courier_core::{DispatchContext, SerialQueue};
use http::header::{HeaderMap, HeaderName, HeaderValue};
use serde::Deserialize;
use url::Url;

use crate::codec::CodecRegistry;
use crate::delegate::DelegateMulticaster;
use crate::error::{NetworkError, Result};
use crate::resolver::{EndpointResolver, TemplateResolver};
use crate::transport::Transport;

/// Connection settings applied by the transport.
#[derive(Clone, Debug)]
pub struct ConnectionSettings {
    /// Base URL that relative descriptor paths are resolved against.
    pub base_url: Option<Url>,
    /// Request timeout.
    pub timeout: Option<Duration>,
    /// Connect timeout.
    pub connect_timeout: Option<Duration>,
    /// Whether to follow redirects.
    pub follow_redirects: bool,
    /// Maximum number of redirects to follow.
    pub max_redirects: usize,
    /// Whether to enable cookie storage.
    pub cookies_enabled: bool,
    /// Default user agent.
    pub user_agent: Option<String>,
    /// Proxy URL.
    pub proxy: Option<String>,
    /// Headers sent with every request.
    pub default_headers: HeaderMap,
    /// Directory for background downloads. `None` uses the system temp dir.
    pub download_dir: Option<PathBuf>,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout: Some(Duration::from_secs(30)),
            connect_timeout: Some(Duration::from_secs(10)),
            follow_redirects: true,
            max_redirects: 10,
            cookies_enabled: true,
            user_agent: Some(format!("Courier/{} (Rust)", env!("CARGO_PKG_VERSION"))),
            proxy: None,
            default_headers: HeaderMap::new(),
            download_dir: None,
        }
    }
}

impl ConnectionSettings {
    /// Set the base URL.
    pub fn base_url(mut self, url: Url) -> Self {
        self.base_url = Some(url);
        self
    }

    /// Set the request timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Disable request timeout.
    pub fn no_timeout(mut self) -> Self {
        self.timeout = None;
        self
    }

    /// Set the connect timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Disable redirect following.
    pub fn no_redirects(mut self) -> Self {
        self.follow_redirects = false;
        self
    }

    /// Set the maximum number of redirects to follow.
    pub fn max_redirects(mut self, max: usize) -> Self {
        self.max_redirects = max;
        self
    }

    /// Disable cookie storage.
    pub fn no_cookies(mut self) -> Self {
        self.cookies_enabled = false;
        self
    }

    /// Set the user agent string.
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    /// Set a proxy URL.
    pub fn proxy(mut self, proxy_url: impl Into<String>) -> Self {
        self.proxy = Some(proxy_url.into());
        self
    }

    /// Add a header sent with every request.
    pub fn default_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.default_headers.insert(name, value);
        self
    }

    /// Set the directory for background downloads.
    pub fn download_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.download_dir = Some(dir.into());
        self
    }

    /// Load settings from TOML, starting from the defaults.
    ///
    /// Durations are given in seconds. Unknown keys are rejected.
    ///
    /// ```
    /// use courier_net::ConnectionSettings;
    /// use std::time::Duration;
    ///
    /// let settings = ConnectionSettings::from_toml_str(r#"
    ///     base_url = "https://api.example.com/v1/"
    ///     timeout = 5
    ///     follow_redirects = false
    ///
    ///     [default_headers]
    ///     x-api-key = "secret"
    /// "#).unwrap();
    ///
    /// assert_eq!(settings.timeout, Some(Duration::from_secs(5)));
    /// assert!(!settings.follow_redirects);
    /// assert_eq!(settings.default_headers["x-api-key"], "secret");
    /// ```
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let file: SettingsFile =
            toml::from_str(source).map_err(|e| NetworkError::Configuration(e.to_string()))?;
        file.apply(Self::default())
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct SettingsFile {
    base_url: Option<String>,
    timeout: Option<f64>,
    connect_timeout: Option<f64>,
    follow_redirects: Option<bool>,
    max_redirects: Option<usize>,
    cookies_enabled: Option<bool>,
    user_agent: Option<String>,
    proxy: Option<String>,
    default_headers: BTreeMap<String, String>,
    download_dir: Option<PathBuf>,
}

impl SettingsFile {
    fn apply(self, mut settings: ConnectionSettings) -> Result<ConnectionSettings> {
        if let Some(base_url) = self.base_url {
            settings.base_url = Some(parse_base_url(&base_url)?);
        }
        if let Some(secs) = self.timeout {
            settings.timeout = Some(seconds("timeout", secs)?);
        }
        if let Some(secs) = self.connect_timeout {
            settings.connect_timeout = Some(seconds("connect_timeout", secs)?);
        }
        if let Some(follow) = self.follow_redirects {
            settings.follow_redirects = follow;
        }
        if let Some(max) = self.max_redirects {
            settings.max_redirects = max;
        }
        if let Some(cookies) = self.cookies_enabled {
            settings.cookies_enabled = cookies;
        }
        if self.user_agent.is_some() {
            settings.user_agent = self.user_agent;
        }
        if self.proxy.is_some() {
            settings.proxy = self.proxy;
        }
        for (name, value) in self.default_headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| NetworkError::Configuration(format!("header '{name}': {e}")))?;
            let value = HeaderValue::from_str(&value)
                .map_err(|e| NetworkError::Configuration(format!("header '{name}': {e}")))?;
            settings.default_headers.insert(name, value);
        }
        if self.download_dir.is_some() {
            settings.download_dir = self.download_dir;
        }
        Ok(settings)
    }
}

fn seconds(field: &str, secs: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(secs)
        .map_err(|e| NetworkError::Configuration(format!("{field}: {e}")))
}

fn parse_base_url(raw: &str) -> Result<Url> {
    let url = Url::parse(raw)
        .map_err(|e| NetworkError::Configuration(format!("invalid base URL '{raw}': {e}")))?;
    if url.cannot_be_a_base() {
        return Err(NetworkError::Configuration(format!(
            "base URL '{raw}' cannot be a base"
        )));
    }
    Ok(url)
}

/// Everything the engine needs to process requests.
///
/// Installed as an immutable snapshot by
/// [`NetworkManager::configure`](crate::NetworkManager::configure);
/// requests keep the snapshot they were submitted with.
#[derive(Clone)]
pub struct EngineConfiguration {
    settings: ConnectionSettings,
    codecs: Arc<CodecRegistry>,
    session_delegate: Option<Arc<DelegateMulticaster>>,
    transport: Arc<dyn Transport>,
    resolver: Arc<dyn EndpointResolver>,
    dispatcher: Arc<dyn DispatchContext>,
}

impl EngineConfiguration {
    /// Start building a configuration around a transport.
    pub fn builder(transport: Arc<dyn Transport>) -> EngineConfigurationBuilder {
        EngineConfigurationBuilder {
            transport,
            settings: ConnectionSettings::default(),
            base_url: None,
            codecs: None,
            session_delegate: None,
            resolver: None,
            dispatcher: None,
        }
    }

    /// The connection settings.
    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    /// The default codec registry.
    pub fn codecs(&self) -> &Arc<CodecRegistry> {
        &self.codecs
    }

    /// The session delegate override, if any.
    pub fn session_delegate(&self) -> Option<&Arc<DelegateMulticaster>> {
        self.session_delegate.as_ref()
    }

    /// The transport.
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// The endpoint resolver.
    pub fn resolver(&self) -> &Arc<dyn EndpointResolver> {
        &self.resolver
    }

    /// The dispatch context for callbacks.
    pub fn dispatcher(&self) -> &Arc<dyn DispatchContext> {
        &self.dispatcher
    }
}

impl fmt::Debug for EngineConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineConfiguration")
            .field("settings", &self.settings)
            .field("codecs", &self.codecs)
            .field("session_delegate", &self.session_delegate.is_some())
            .finish_non_exhaustive()
    }
}

/// Builder for [`EngineConfiguration`].
pub struct EngineConfigurationBuilder {
    transport: Arc<dyn Transport>,
    settings: ConnectionSettings,
    base_url: Option<String>,
    codecs: Option<Arc<CodecRegistry>>,
    session_delegate: Option<Arc<DelegateMulticaster>>,
    resolver: Option<Arc<dyn EndpointResolver>>,
    dispatcher: Option<Arc<dyn DispatchContext>>,
}

impl EngineConfigurationBuilder {
    /// Set the base URL. Parsed and validated by [`build`](Self::build).
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    /// Set the connection settings.
    ///
    /// A base URL given with [`base_url`](Self::base_url) takes precedence
    /// over the one in `settings`.
    pub fn settings(mut self, settings: ConnectionSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Set the default codec registry. Defaults to [`CodecRegistry::standard`].
    pub fn codecs(mut self, codecs: Arc<CodecRegistry>) -> Self {
        self.codecs = Some(codecs);
        self
    }

    /// Send session events to this multicaster instead of the manager's own.
    pub fn session_delegate(mut self, delegate: Arc<DelegateMulticaster>) -> Self {
        self.session_delegate = Some(delegate);
        self
    }

    /// Set the endpoint resolver. Defaults to [`TemplateResolver`].
    pub fn resolver(mut self, resolver: Arc<dyn EndpointResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Set the dispatch context for callbacks.
    ///
    /// Defaults to a new [`SerialQueue`] named `courier-callbacks`.
    pub fn dispatcher(mut self, dispatcher: Arc<dyn DispatchContext>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Validate and build the configuration.
    pub fn build(self) -> Result<EngineConfiguration> {
        let mut settings = self.settings;
        if let Some(raw) = self.base_url {
            settings.base_url = Some(parse_base_url(&raw)?);
        }

        let dispatcher = match self.dispatcher {
            Some(dispatcher) => dispatcher,
            None => Arc::new(
                SerialQueue::spawn_named("courier-callbacks")
                    .map_err(|e| NetworkError::Configuration(e.to_string()))?,
            ),
        };

        Ok(EngineConfiguration {
            settings,
            codecs: self
                .codecs
                .unwrap_or_else(|| Arc::new(CodecRegistry::standard())),
            session_delegate: self.session_delegate,
            transport: self.transport,
            resolver: self.resolver.unwrap_or_else(|| Arc::new(TemplateResolver)),
            dispatcher,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::ContentType;
    use crate::task::Cancelable;
    use crate::transport::{TransportCompletion, TransportRequest};
    use courier_core::PumpedQueue;
    use std::path::Path;

    struct NullTransport;

    struct Noop;

    impl Cancelable for Noop {
        fn cancel(&self) {}
    }

    impl Transport for NullTransport {
        fn configure(&self, _: &ConnectionSettings, _: Arc<DelegateMulticaster>) -> Result<()> {
            Ok(())
        }

        fn submit(&self, _: TransportRequest, _: TransportCompletion) -> Box<dyn Cancelable> {
            Box::new(Noop)
        }

        fn submit_background_upload(&self, _: TransportRequest, _: &Path) -> Result<Box<dyn Cancelable>> {
            Ok(Box::new(Noop))
        }

        fn submit_background_download(&self, _: TransportRequest) -> Result<Box<dyn Cancelable>> {
            Ok(Box::new(Noop))
        }
    }

    #[test]
    fn test_settings_defaults() {
        let settings = ConnectionSettings::default();
        assert_eq!(settings.timeout, Some(Duration::from_secs(30)));
        assert!(settings.follow_redirects);
        assert!(settings.cookies_enabled);
        assert!(settings.base_url.is_none());
        assert!(settings.user_agent.unwrap().starts_with("Courier/"));
    }

    #[test]
    fn test_settings_chain() {
        let settings = ConnectionSettings::default()
            .no_timeout()
            .no_redirects()
            .no_cookies()
            .max_redirects(3)
            .proxy("http://proxy.local:3128")
            .download_dir("/tmp/downloads");
        assert_eq!(settings.timeout, None);
        assert!(!settings.follow_redirects);
        assert!(!settings.cookies_enabled);
        assert_eq!(settings.max_redirects, 3);
        assert_eq!(settings.proxy.as_deref(), Some("http://proxy.local:3128"));
        assert_eq!(settings.download_dir, Some(PathBuf::from("/tmp/downloads")));
    }

    #[test]
    fn test_settings_from_toml() {
        let settings = ConnectionSettings::from_toml_str(
            r#"
            base_url = "https://api.example.com/"
            connect_timeout = 2.5
            max_redirects = 4
            cookies_enabled = false
            user_agent = "Test/1"
            "#,
        )
        .unwrap();
        assert_eq!(settings.base_url.unwrap().as_str(), "https://api.example.com/");
        assert_eq!(settings.connect_timeout, Some(Duration::from_millis(2500)));
        assert_eq!(settings.timeout, Some(Duration::from_secs(30)));
        assert_eq!(settings.max_redirects, 4);
        assert!(!settings.cookies_enabled);
        assert_eq!(settings.user_agent.as_deref(), Some("Test/1"));
    }

    #[test]
    fn test_settings_from_toml_errors() {
        for source in [
            "timeout = -1",
            "base_url = \"not a url\"",
            "unknown_key = true",
            "[default_headers]\n\"bad header\" = \"x\"",
        ] {
            let err = ConnectionSettings::from_toml_str(source).unwrap_err();
            assert!(matches!(err, NetworkError::Configuration(_)), "{source}");
        }
    }

    #[test]
    fn test_builder_defaults() {
        let config = EngineConfiguration::builder(Arc::new(NullTransport))
            .dispatcher(Arc::new(PumpedQueue::new()))
            .build()
            .unwrap();
        assert!(config.settings().base_url.is_none());
        assert!(config.session_delegate().is_none());
        assert!(config.codecs().decoder(&ContentType::Json).is_some());
    }

    #[test]
    fn test_builder_base_url_overrides_settings() {
        let settings = ConnectionSettings::default()
            .base_url(Url::parse("https://old.example.com").unwrap());
        let config = EngineConfiguration::builder(Arc::new(NullTransport))
            .settings(settings)
            .base_url("https://new.example.com/api/")
            .dispatcher(Arc::new(PumpedQueue::new()))
            .build()
            .unwrap();
        assert_eq!(
            config.settings().base_url.as_ref().unwrap().as_str(),
            "https://new.example.com/api/"
        );
    }

    #[test]
    fn test_builder_rejects_bad_base_url() {
        let err = EngineConfiguration::builder(Arc::new(NullTransport))
            .base_url("::nope")
            .dispatcher(Arc::new(PumpedQueue::new()))
            .build()
            .unwrap_err();
        assert!(matches!(err, NetworkError::Configuration(_)));
    }

    #[test]
    fn test_builder_spawns_default_dispatcher() {
        let config = EngineConfiguration::builder(Arc::new(NullTransport))
            .build()
            .unwrap();
        assert!(!config.dispatcher().is_current());
    }
}

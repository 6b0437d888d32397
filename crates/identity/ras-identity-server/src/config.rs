//! Server client configuration.
//!
//! Keys are snake_case. The camelCase spellings used by other SDKs
//! (`clientId`, `clientSecret`, `redirectUri`, `authorizationParams`) are
//! accepted as aliases when deserializing. Values inside
//! `authorization_params` are sent to the provider unchanged, so they use the
//! provider's own parameter names (`redirect_uri`, `audience`, `scope`, ...).
//!
//! [`ServerClientConfig::load`] reads an optional TOML file followed by
//! `AUTH0_*` environment variables, the latter taking precedence.

use crate::error::{ServerClientError, ServerClientResult};
use config::{Config as ConfigBuilder, Environment, File};
use ras_identity_store::MAX_LIFETIME_SECONDS;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info};
use url::Url;

/// Extra query parameters for the authorization and backchannel endpoints
pub type AuthorizationParams = BTreeMap<String, String>;

pub const DEFAULT_SCOPE: &str = "openid profile email offline_access";
pub const DEFAULT_AUDIENCE: &str = "default";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerClientConfig {
    /// Tenant domain, e.g. `example.auth0.com`. A scheme may be given to
    /// point at a non-HTTPS provider during development.
    pub domain: String,

    #[serde(alias = "clientId")]
    pub client_id: String,

    #[serde(alias = "clientSecret")]
    pub client_secret: String,

    #[serde(default)]
    pub audience: Option<String>,

    #[serde(default, alias = "redirectUri")]
    pub redirect_uri: Option<String>,

    /// Defaults merged into every authorization request; per-call values win
    #[serde(default, alias = "authorizationParams")]
    pub authorization_params: AuthorizationParams,

    #[serde(default = "default_transaction_identifier")]
    pub transaction_identifier: String,

    #[serde(default = "default_transaction_ttl")]
    pub transaction_ttl_seconds: u64,

    #[serde(default = "default_http_timeout")]
    pub http_timeout_seconds: u64,

    /// Tokens expiring within this window are refreshed rather than served
    #[serde(default = "default_token_expiry_skew")]
    pub token_expiry_skew_seconds: u64,

    /// Poll interval used when the provider does not send one
    #[serde(default = "default_backchannel_interval")]
    pub backchannel_default_interval_seconds: u64,

    /// Clock leeway for ID and logout token validation
    #[serde(default = "default_token_leeway")]
    pub token_leeway_seconds: u64,
}

fn default_transaction_identifier() -> String {
    "_a0_tx".to_string()
}

fn default_transaction_ttl() -> u64 {
    600 // 10 minutes
}

fn default_http_timeout() -> u64 {
    30
}

fn default_token_expiry_skew() -> u64 {
    60
}

fn default_backchannel_interval() -> u64 {
    5
}

fn default_token_leeway() -> u64 {
    60
}

impl ServerClientConfig {
    pub fn new(
        domain: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        Self {
            domain: domain.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            audience: None,
            redirect_uri: None,
            authorization_params: AuthorizationParams::new(),
            transaction_identifier: default_transaction_identifier(),
            transaction_ttl_seconds: default_transaction_ttl(),
            http_timeout_seconds: default_http_timeout(),
            token_expiry_skew_seconds: default_token_expiry_skew(),
            backchannel_default_interval_seconds: default_backchannel_interval(),
            token_leeway_seconds: default_token_leeway(),
        }
    }

    pub fn with_redirect_uri(mut self, redirect_uri: impl Into<String>) -> Self {
        self.redirect_uri = Some(redirect_uri.into());
        self
    }

    pub fn with_audience(mut self, audience: impl Into<String>) -> Self {
        self.audience = Some(audience.into());
        self
    }

    pub fn with_authorization_param(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.authorization_params.insert(key.into(), value.into());
        self
    }

    pub fn with_transaction_ttl(mut self, seconds: u64) -> Self {
        self.transaction_ttl_seconds = seconds;
        self
    }

    pub fn with_http_timeout(mut self, seconds: u64) -> Self {
        self.http_timeout_seconds = seconds;
        self
    }

    pub fn with_token_expiry_skew(mut self, seconds: u64) -> Self {
        self.token_expiry_skew_seconds = seconds;
        self
    }

    /// Load configuration from `AUTH0_CONFIG_FILE` (or `auth0.toml`) and the environment
    pub fn load() -> ServerClientResult<Self> {
        let config_path =
            std::env::var("AUTH0_CONFIG_FILE").unwrap_or_else(|_| "auth0.toml".to_string());
        Self::load_from(Some(Path::new(&config_path)))
    }

    pub fn load_from(path: Option<&Path>) -> ServerClientResult<Self> {
        let mut builder = ConfigBuilder::builder();

        match path {
            Some(path) if path.exists() => {
                info!("Loading server client configuration from {}", path.display());
                builder = builder.add_source(File::from(path));
            }
            Some(path) => debug!("No config file found at {}", path.display()),
            None => {}
        }

        builder = builder.add_source(Environment::with_prefix("AUTH0"));

        let settings: ServerClientConfig = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> ServerClientResult<()> {
        if self.domain.trim().is_empty() {
            return Err(ServerClientError::MissingRequiredArgument("domain"));
        }
        if self.client_id.trim().is_empty() {
            return Err(ServerClientError::MissingRequiredArgument("client_id"));
        }
        if self.client_secret.is_empty() {
            return Err(ServerClientError::MissingRequiredArgument("client_secret"));
        }
        if self.transaction_ttl_seconds == 0 {
            return Err(ServerClientError::ConfigError(
                "transaction_ttl_seconds must be positive".to_string(),
            ));
        }
        if self.backchannel_default_interval_seconds == 0 {
            return Err(ServerClientError::ConfigError(
                "backchannel_default_interval_seconds must be positive".to_string(),
            ));
        }
        self.base_url()?;
        Ok(())
    }

    /// Provider base URL derived from the domain
    pub fn base_url(&self) -> ServerClientResult<Url> {
        let domain = self.domain.trim_end_matches('/');
        let url = if domain.starts_with("http://") || domain.starts_with("https://") {
            Url::parse(&format!("{}/", domain))?
        } else {
            Url::parse(&format!("https://{}/", domain))?
        };
        Ok(url)
    }

    /// Expected `iss` claim of tokens minted by the provider
    pub fn issuer(&self) -> ServerClientResult<String> {
        Ok(self.base_url()?.to_string())
    }

    pub fn endpoint(&self, path: &str) -> ServerClientResult<Url> {
        Ok(self.base_url()?.join(path.trim_start_matches('/'))?)
    }

    /// Audience for a request: explicit value, then configured defaults
    pub fn resolve_audience(&self, requested: Option<&str>) -> Option<String> {
        requested
            .map(String::from)
            .or_else(|| self.authorization_params.get("audience").cloned())
            .or_else(|| self.audience.clone())
    }

    pub fn resolve_scope(&self, requested: Option<&str>) -> String {
        requested
            .map(String::from)
            .or_else(|| self.authorization_params.get("scope").cloned())
            .unwrap_or_else(|| DEFAULT_SCOPE.to_string())
    }

    pub fn token_expiry_skew(&self) -> chrono::Duration {
        let seconds = self.token_expiry_skew_seconds.min(MAX_LIFETIME_SECONDS) as i64;
        chrono::Duration::seconds(seconds)
    }
}

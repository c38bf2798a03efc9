//! # configs
//!
//! Runtime settings of the server. Values come from an optional `rusty-comments.toml`,
//! overridden by `RC__SECTION__KEY` environment variables; a `.env` file is read first.
//! Durations are given in seconds and converted by the accessor methods.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use config::{Config, Environment, File};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

pub const DEFAULT_CONFIG_FILE: &str = "rusty-comments.toml";
pub const ENV_PREFIX: &str = "RC";
const ENV_SEPARATOR: &str = "__";

/// Keys holding comma separated lists when given through the environment.
const LIST_KEYS: &[&str] = &["server.sites", "comments.restricted_words", "notify.webhook.headers"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load settings: {0}")]
    Load(#[from] config::ConfigError),
    #[error("invalid settings: {0}")]
    Invalid(String),
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    /// Site id to admin user ids.
    pub admins: HashMap<String, Vec<String>>,
    /// Admins of every site.
    pub shared_admins: Vec<String>,
    pub admin_email: String,
    pub comments: CommentSettings,
    pub cache: CacheSettings,
    pub notify: NotifySettings,
    pub auth: AuthSettings,
    pub avatar: AvatarSettings,
    pub image_proxy: ImageProxySettings,
    pub stream: StreamSettings,
    pub search: SearchSettings,
    pub log: LogSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings::default(),
            admins: HashMap::new(),
            shared_admins: Vec::new(),
            admin_email: String::new(),
            comments: CommentSettings::default(),
            cache: CacheSettings::default(),
            notify: NotifySettings::default(),
            auth: AuthSettings::default(),
            avatar: AvatarSettings::default(),
            image_proxy: ImageProxySettings::default(),
            stream: StreamSettings::default(),
            search: SearchSettings::default(),
            log: LogSettings::default(),
        }
    }
}

impl Settings {
    /// Reads `.env`, then [`DEFAULT_CONFIG_FILE`] (or `RC_CONFIG`) and the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        if let Ok(path) = dotenvy::dotenv() {
            debug!("environment loaded from {}", path.display());
        }
        let file = std::env::var("RC_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());
        Self::from_sources(Some(Path::new(&file)), None)
    }

    /// `env` replaces the process environment when given.
    pub fn from_sources(file: Option<&Path>, env: Option<HashMap<String, String>>) -> Result<Self, ConfigError> {
        let mut environment = Environment::with_prefix(ENV_PREFIX)
            .prefix_separator(ENV_SEPARATOR)
            .separator(ENV_SEPARATOR)
            .try_parsing(true)
            .list_separator(",")
            .source(env);
        for key in LIST_KEYS {
            environment = environment.with_list_parse_key(key);
        }

        let mut builder = Config::builder();
        if let Some(file) = file {
            builder = builder.add_source(File::from(file).required(false));
        }
        let settings: Settings = builder.add_source(environment).build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let secret = self.server.secret.as_ref().map(|s| s.expose_secret().len()).unwrap_or_default();
        if secret == 0 {
            return Err(ConfigError::Invalid("server.secret is required".into()));
        }
        if self.server.sites.is_empty() {
            return Err(ConfigError::Invalid("server.sites needs at least one site".into()));
        }
        if self.comments.max_comment_size == 0 {
            return Err(ConfigError::Invalid("comments.max_comment_size must be positive".into()));
        }
        if self.comments.critical_score > self.comments.low_score {
            return Err(ConfigError::Invalid("comments.critical_score must not exceed low_score".into()));
        }
        if !matches!(self.auth.same_site.as_str(), "" | "lax" | "strict" | "none") {
            return Err(ConfigError::Invalid(format!("auth.same_site {:?} is not lax, strict or none", self.auth.same_site)));
        }
        Ok(())
    }
}

fn secs(n: u64) -> Duration {
    Duration::from_secs(n)
}

fn chrono_secs(n: u64) -> chrono::Duration {
    chrono::Duration::seconds(i64::try_from(n).unwrap_or(i64::MAX))
}

/// The exposed secret, empty when unset.
pub fn expose(secret: &Option<SecretString>) -> &str {
    secret.as_ref().map(|s| s.expose_secret()).unwrap_or_default()
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub address: String,
    pub port: u16,
    /// Public URL of the server, used in links and OAuth callbacks.
    pub remark_url: String,
    /// Signs tokens and hashes client addresses.
    pub secret: Option<SecretString>,
    /// Enables basic auth as the `dev` admin with this password.
    pub dev_passwd: Option<SecretString>,
    pub sites: Vec<String>,
    pub max_last: usize,
    pub delete_me_ttl: u64,
    pub subscribe_ttl: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            address: "0.0.0.0".to_string(),
            port: 8080,
            remark_url: "http://localhost:8080".to_string(),
            secret: None,
            dev_passwd: None,
            sites: vec!["remark".to_string()],
            max_last: 100,
            delete_me_ttl: 90 * 24 * 3600,
            subscribe_ttl: 30 * 60,
        }
    }
}

impl ServerSettings {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    pub fn delete_me_ttl(&self) -> chrono::Duration {
        chrono_secs(self.delete_me_ttl)
    }

    pub fn subscribe_ttl(&self) -> chrono::Duration {
        chrono_secs(self.subscribe_ttl)
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct CommentSettings {
    pub edit_duration: u64,
    pub max_comment_size: usize,
    /// Zero disables the cap.
    pub max_votes: usize,
    pub low_score: i64,
    pub critical_score: i64,
    pub positive_score: bool,
    pub min_score: Option<i64>,
    pub restricted_words: Vec<String>,
    /// Zero keeps posts writable forever.
    pub read_only_age: u64,
    pub vote_ip_window: u64,
}

impl Default for CommentSettings {
    fn default() -> Self {
        Self {
            edit_duration: 5 * 60,
            max_comment_size: 2048,
            max_votes: 0,
            low_score: -5,
            critical_score: -10,
            positive_score: false,
            min_score: None,
            restricted_words: Vec::new(),
            read_only_age: 0,
            vote_ip_window: 5 * 60,
        }
    }
}

impl CommentSettings {
    pub fn edit_duration(&self) -> chrono::Duration {
        chrono_secs(self.edit_duration)
    }

    pub fn read_only_age(&self) -> chrono::Duration {
        chrono_secs(self.read_only_age)
    }

    pub fn vote_ip_window(&self) -> chrono::Duration {
        chrono_secs(self.vote_ip_window)
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub max_keys: usize,
    pub max_value_size: usize,
    pub max_size: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self { max_keys: 1000, max_value_size: 64 * 1024, max_size: 50 * 1024 * 1024 }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct NotifySettings {
    pub queue_size: usize,
    /// Timeout of outbound HTTP calls.
    pub timeout: u64,
    pub email: Option<EmailSettings>,
    pub telegram: Option<TelegramSettings>,
    pub slack: Option<SlackSettings>,
    pub webhook: Option<WebhookSettings>,
}

impl Default for NotifySettings {
    fn default() -> Self {
        Self { queue_size: 100, timeout: 10, email: None, telegram: None, slack: None, webhook: None }
    }
}

impl NotifySettings {
    pub fn timeout(&self) -> Duration {
        secs(self.timeout)
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct EmailSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: Option<SecretString>,
    pub tls: bool,
    pub starttls: bool,
    pub timeout: u64,
    /// Idle time before the pooled SMTP connection is dropped.
    pub keep_alive: u64,
    pub from: String,
    pub subject: String,
    pub verification_subject: String,
    /// Send every new comment to `admin_email` too.
    pub admin_notifications: bool,
}

impl Default for EmailSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 25,
            username: String::new(),
            password: None,
            tls: false,
            starttls: false,
            timeout: 10,
            keep_alive: 30,
            from: String::new(),
            subject: "New comment".to_string(),
            verification_subject: "Email verification".to_string(),
            admin_notifications: false,
        }
    }
}

impl EmailSettings {
    pub fn timeout(&self) -> Duration {
        secs(self.timeout)
    }

    pub fn keep_alive(&self) -> Duration {
        secs(self.keep_alive)
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct TelegramSettings {
    pub token: Option<SecretString>,
    pub api_url: String,
    /// Chat receiving every comment, empty for none.
    pub admin_channel: String,
    pub user_notifications: bool,
    /// Long-poll period of the update dispatcher.
    pub poll_period: u64,
}

impl Default for TelegramSettings {
    fn default() -> Self {
        Self {
            token: None,
            api_url: "https://api.telegram.org".to_string(),
            admin_channel: String::new(),
            user_notifications: true,
            poll_period: 5,
        }
    }
}

impl TelegramSettings {
    pub fn poll_period(&self) -> Duration {
        secs(self.poll_period)
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SlackSettings {
    pub token: Option<SecretString>,
    pub channel: String,
    pub api_url: String,
}

impl Default for SlackSettings {
    fn default() -> Self {
        Self { token: None, channel: "general".to_string(), api_url: "https://slack.com/api".to_string() }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct WebhookSettings {
    pub url: String,
    /// Body template; the built-in JSON body when unset.
    pub template: Option<String>,
    /// `Name:value` pairs.
    pub headers: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct AuthSettings {
    pub token_duration: u64,
    pub cookie_duration: u64,
    pub secure_cookies: bool,
    /// `lax`, `strict`, `none` or empty.
    pub same_site: String,
    /// Timeout of calls to identity providers.
    pub timeout: u64,
    /// OAuth providers by name, e.g. `github`, `google` or `twitter`.
    pub providers: HashMap<String, ProviderSettings>,
    pub email: EmailLoginSettings,
    /// Login through the notification bot.
    pub telegram: bool,
    pub apple: Option<AppleSettings>,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            token_duration: 5 * 60,
            cookie_duration: 31 * 24 * 3600,
            secure_cookies: false,
            same_site: String::new(),
            timeout: 10,
            providers: HashMap::new(),
            email: EmailLoginSettings::default(),
            telegram: false,
            apple: None,
        }
    }
}

impl AuthSettings {
    pub fn token_duration(&self) -> chrono::Duration {
        chrono_secs(self.token_duration)
    }

    pub fn cookie_duration(&self) -> chrono::Duration {
        chrono_secs(self.cookie_duration)
    }

    pub fn timeout(&self) -> Duration {
        secs(self.timeout)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    pub client_id: String,
    pub client_secret: Option<SecretString>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct EmailLoginSettings {
    pub enabled: bool,
    /// Look avatars up on Gravatar.
    pub gravatar: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct AppleSettings {
    pub client_id: String,
    pub team_id: String,
    pub key_id: String,
    /// Path of the PKCS8 PEM private key.
    pub private_key_file: String,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct AvatarSettings {
    /// Directory of stored avatars; avatars are not stored when empty.
    pub dir: String,
    /// Larger images are scaled down to this many pixels per side.
    pub resize_limit: u32,
}

impl Default for AvatarSettings {
    fn default() -> Self {
        Self { dir: "./var/avatars".to_string(), resize_limit: 0 }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ImageProxySettings {
    /// Serve plain http images through the proxy.
    pub http2https: bool,
    pub timeout: u64,
}

impl Default for ImageProxySettings {
    fn default() -> Self {
        Self { http2https: false, timeout: 30 }
    }
}

impl ImageProxySettings {
    pub fn timeout(&self) -> Duration {
        secs(self.timeout)
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct StreamSettings {
    pub refresh: u64,
    pub timeout: u64,
    pub max_active: usize,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self { refresh: 1, timeout: 15 * 60, max_active: 500 }
    }
}

impl StreamSettings {
    pub fn refresh(&self) -> Duration {
        secs(self.refresh)
    }

    pub fn timeout(&self) -> Duration {
        secs(self.timeout)
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SearchSettings {
    pub enabled: bool,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    pub json: bool,
    /// `tracing_subscriber::EnvFilter` directives; `RUST_LOG` wins when set.
    pub filter: Option<String>,
}

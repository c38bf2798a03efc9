use std::sync::Arc;
use std::time::Duration;

use auth_adapters::{AuthService, AuthState, TokenService};
use domains::AvatarStore;
use notify_adapters::TelegramDestination;
use services::{DataService, NotifyService, SearchService, Streamer};
use storage_adapters::LoadingCache;

use crate::metrics::Metrics;
use crate::proxy::ImageProxy;

/// Values the handlers need that are not owned by any service.
#[derive(Debug, Clone)]
pub struct ApiSettings {
    /// Public base URL, e.g. `https://comments.example.com`.
    pub remark_url: String,
    pub version: String,
    /// Key for hashing client addresses.
    pub secret: String,
    pub low_score: i64,
    pub critical_score: i64,
    /// How long delete-me links stay valid.
    pub delete_me_ttl: chrono::Duration,
    /// How long email confirmation tokens stay valid.
    pub subscribe_ttl: chrono::Duration,
    /// Upper bound on `/last/{limit}`.
    pub max_last: usize,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            remark_url: "http://localhost:8080".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            secret: String::new(),
            low_score: -5,
            critical_score: -10,
            delete_me_ttl: chrono::Duration::days(90),
            subscribe_ttl: chrono::Duration::minutes(30),
            max_last: 100,
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub data: Arc<DataService>,
    pub cache: Arc<LoadingCache>,
    pub notify: Arc<NotifyService>,
    pub auth: AuthState,
    pub auth_service: Arc<AuthService>,
    pub avatars: Option<Arc<dyn AvatarStore>>,
    pub images: Option<Arc<ImageProxy>>,
    pub streamer: Arc<Streamer>,
    pub search: Option<Arc<SearchService>>,
    pub telegram: Option<Arc<TelegramDestination>>,
    pub metrics: Arc<Metrics>,
    pub settings: Arc<ApiSettings>,
}

impl AppState {
    /// State with the mandatory collaborators. Everything optional starts disabled and
    /// notifications are discarded until [`AppState::with_notify`].
    pub fn new(data: Arc<DataService>, cache: Arc<LoadingCache>, auth_service: Arc<AuthService>) -> Self {
        let ctx = auth_service.context();
        let auth = AuthState { tokens: ctx.tokens.clone(), data: data.clone(), dev_passwd: None };
        Self {
            data,
            cache,
            notify: Arc::new(NotifyService::nop()),
            auth,
            auth_service,
            avatars: None,
            images: None,
            streamer: Arc::new(Streamer::new(Duration::from_secs(1), Duration::from_secs(15 * 60), 500)),
            search: None,
            telegram: None,
            metrics: Arc::new(Metrics::new()),
            settings: Arc::new(ApiSettings::default()),
        }
    }

    pub fn with_notify(mut self, notify: Arc<NotifyService>) -> Self {
        self.notify = notify;
        self
    }

    pub fn with_dev_passwd(mut self, passwd: impl Into<String>) -> Self {
        self.auth.dev_passwd = Some(passwd.into());
        self
    }

    pub fn with_avatars(mut self, avatars: Arc<dyn AvatarStore>) -> Self {
        self.avatars = Some(avatars);
        self
    }

    pub fn with_images(mut self, images: Arc<ImageProxy>) -> Self {
        self.images = Some(images);
        self
    }

    pub fn with_streamer(mut self, streamer: Arc<Streamer>) -> Self {
        self.streamer = streamer;
        self
    }

    pub fn with_search(mut self, search: Arc<SearchService>) -> Self {
        self.search = Some(search);
        self
    }

    pub fn with_telegram(mut self, telegram: Arc<TelegramDestination>) -> Self {
        self.telegram = Some(telegram);
        self
    }

    pub fn with_settings(mut self, settings: ApiSettings) -> Self {
        self.settings = Arc::new(settings);
        self
    }

    pub fn tokens(&self) -> &TokenService {
        &self.auth.tokens
    }
}

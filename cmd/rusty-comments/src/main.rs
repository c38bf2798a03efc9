//! # rusty-comments
//!
//! Assembles the comment server from its settings and serves it until SIGINT or SIGTERM.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use api_adapters::{ApiSettings, AppState, HttpTitleExtractor, ImageProxy, IMAGE_ROUTE};
use auth_adapters::providers::oauth1::twitter;
use auth_adapters::providers::oauth2::builtin;
use auth_adapters::providers::verify::DEFAULT_GRAVATAR_URL;
use auth_adapters::{
    AppleParams, AppleProvider, AuthContext, AuthService, AvatarProxy, Channel, OAuth1Provider, OAuth2Provider, SameSite,
    SiteKeys, TelegramLogin, TokenParams, TokenService, VerifyProvider,
};
use configs::{expose, Settings};
use domains::{AvatarStore, Destination, Engine, UpdateReceiver};
use notify_adapters::{
    EmailDestination, EmailParams, EmailSender, SlackDestination, SmtpMailer, SmtpParams, TelegramClient,
    TelegramDestination, TelegramParams, TelegramUpdateDispatcher, WebhookDestination,
};
use services::{CommentConverter, CommentFormatter, DataService, DataServiceConfig, NotifyService, SearchService, Streamer};
use storage_adapters::{CacheLimits, FsAvatarStore, LoadingCache, MemoryEngine, MemoryIndex, StaticAdminStore};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

fn init_tracing(settings: &Settings) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(settings.log.filter.as_deref().unwrap_or("info")))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    if settings.log.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Long-running pieces that need an orderly stop.
struct Daemons {
    notify: Arc<NotifyService>,
    email: Option<Arc<EmailDestination>>,
    dispatcher: Option<tokio::task::JoinHandle<()>>,
    shutdown: watch::Sender<bool>,
}

impl Daemons {
    async fn close(self) {
        let _ = self.shutdown.send(true);
        if let Some(dispatcher) = self.dispatcher {
            if let Err(e) = dispatcher.await {
                warn!("telegram dispatcher failed, {e}");
            }
        }
        self.notify.close().await;
        if let Some(email) = self.email {
            email.sender().close().await;
        }
        info!("background tasks stopped");
    }
}

fn token_params(settings: &Settings) -> TokenParams {
    let auth = &settings.auth;
    let same_site = match auth.same_site.as_str() {
        "lax" => SameSite::Lax,
        "strict" => SameSite::Strict,
        "none" => SameSite::None,
        _ => SameSite::Unset,
    };
    TokenParams {
        token_duration: auth.token_duration(),
        cookie_duration: auth.cookie_duration(),
        secure_cookies: auth.secure_cookies,
        same_site,
        ..TokenParams::default()
    }
}

async fn destinations(
    settings: &Settings,
    telegram: Option<&Arc<TelegramDestination>>,
) -> anyhow::Result<(Vec<Arc<dyn Destination>>, Option<Arc<EmailDestination>>)> {
    let notify = &settings.notify;
    let mut out: Vec<Arc<dyn Destination>> = Vec::new();

    let email = match &notify.email {
        Some(cfg) => {
            let smtp = SmtpParams {
                host: cfg.host.clone(),
                port: cfg.port,
                username: cfg.username.clone(),
                password: expose(&cfg.password).to_string(),
                tls: cfg.tls,
                starttls: cfg.starttls,
                timeout: cfg.timeout(),
            };
            // fail early on bad relay settings
            SmtpMailer::new(&smtp).context("smtp settings")?;
            // a failed test is logged by the sender; delivery retries per message
            let (sender, _) = EmailSender::connect(SmtpMailer::connector(smtp), cfg.keep_alive()).await;
            let admin_emails = if cfg.admin_notifications && !settings.admin_email.is_empty() {
                vec![settings.admin_email.clone()]
            } else {
                Vec::new()
            };
            let params = EmailParams {
                from: cfg.from.clone(),
                subject: cfg.subject.clone(),
                verification_subject: cfg.verification_subject.clone(),
                admin_emails,
            };
            let email = Arc::new(EmailDestination::new(sender, params));
            out.push(email.clone());
            Some(email)
        }
        None => None,
    };
    if let Some(telegram) = telegram {
        out.push(telegram.clone());
    }
    if let Some(cfg) = &notify.slack {
        out.push(Arc::new(SlackDestination::new(&cfg.api_url, expose(&cfg.token), &cfg.channel, notify.timeout())?));
    }
    if let Some(cfg) = &notify.webhook {
        out.push(Arc::new(WebhookDestination::new(&cfg.url, cfg.template.clone(), &cfg.headers, notify.timeout())?));
    }
    Ok((out, email))
}

async fn auth_service(
    settings: &Settings,
    ctx: AuthContext,
    notify: Arc<NotifyService>,
    telegram_login: Option<Arc<TelegramLogin>>,
) -> anyhow::Result<AuthService> {
    let auth = &settings.auth;
    let timeout = auth.timeout();
    let mut service = AuthService::new(ctx);

    let mut names: Vec<&String> = auth.providers.keys().collect();
    names.sort();
    for name in names {
        let cfg = &auth.providers[name];
        let secret = expose(&cfg.client_secret);
        if name == "twitter" {
            service = service.with_provider(Arc::new(OAuth1Provider::new(twitter(&cfg.client_id, secret), timeout)?));
            continue;
        }
        let params = builtin(name, &cfg.client_id, secret).with_context(|| format!("unknown auth provider {name}"))?;
        service = service.with_provider(Arc::new(OAuth2Provider::new(params, timeout)?));
    }
    if let Some(cfg) = &auth.apple {
        let key = tokio::fs::read_to_string(&cfg.private_key_file)
            .await
            .with_context(|| format!("reading apple key {}", cfg.private_key_file))?;
        let params = AppleParams::new(&cfg.client_id, &cfg.team_id, &cfg.key_id, &key);
        service = service.with_provider(Arc::new(AppleProvider::new(params, timeout)?));
    }
    if auth.email.enabled {
        let mut verify = VerifyProvider::new("email", Channel::Email, notify, timeout)?;
        if auth.email.gravatar {
            verify = verify.with_gravatar(DEFAULT_GRAVATAR_URL);
        }
        service = service.with_provider(Arc::new(verify));
    }
    if let Some(login) = telegram_login {
        service = service.with_provider(login);
    }
    Ok(service)
}

async fn build(settings: &Settings) -> anyhow::Result<(AppState, Daemons)> {
    let server = &settings.server;
    let secret = expose(&server.secret).to_string();
    let remark_url = server.remark_url.trim_end_matches('/').to_string();

    let engine: Arc<dyn Engine> = Arc::new(MemoryEngine::new(server.sites.iter().cloned()));
    let admins = Arc::new(StaticAdminStore::new(
        settings.admins.clone(),
        settings.shared_admins.clone(),
        settings.admin_email.clone(),
    ));

    let cache = Arc::new(
        LoadingCache::new(CacheLimits {
            max_keys: settings.cache.max_keys,
            max_value_size: settings.cache.max_value_size,
            max_size: settings.cache.max_size,
        })
        .with_flush_callback(|req| debug!(site = %req.site_id, scopes = ?req.scopes, "response cache flushed")),
    );

    let images = if settings.image_proxy.http2https {
        let proxy = ImageProxy::new(format!("{remark_url}{IMAGE_ROUTE}"), settings.image_proxy.timeout())?;
        Some(Arc::new(proxy))
    } else {
        None
    };
    let converters: Vec<Arc<dyn CommentConverter>> =
        images.iter().map(|p| p.clone() as Arc<dyn CommentConverter>).collect();

    let comments = &settings.comments;
    let config = DataServiceConfig {
        edit_duration: comments.edit_duration(),
        max_comment_size: comments.max_comment_size,
        max_votes: comments.max_votes,
        positive_score: comments.positive_score,
        min_score: comments.min_score,
        restricted_words: comments.restricted_words.clone(),
        read_only_age: comments.read_only_age(),
        vote_ip_window: comments.vote_ip_window(),
    };
    let search = settings.search.enabled.then(|| {
        Arc::new(SearchService::new(Arc::new(MemoryIndex::new()), engine.clone(), server.sites.iter().cloned()))
    });
    let title = HttpTitleExtractor::new(settings.notify.timeout(), api_adapters::title::DEFAULT_CACHE_SIZE)?;
    let mut data = DataService::new(engine.clone(), admins, config)
        .with_formatter(CommentFormatter::new(converters))
        .with_flusher(cache.clone())
        .with_title_extractor(Arc::new(title));
    if let Some(search) = &search {
        data = data.with_search(search.clone());
    }
    let data = Arc::new(data);

    let (shutdown, shutdown_rx) = watch::channel(false);
    let telegram = match &settings.notify.telegram {
        Some(cfg) => {
            let client = TelegramClient::new(&cfg.api_url, expose(&cfg.token), settings.notify.timeout())?;
            let params =
                TelegramParams { admin_channel: cfg.admin_channel.clone(), user_notifications: cfg.user_notifications };
            Some((client.clone(), Arc::new(TelegramDestination::new(client, params)), cfg.poll_period()))
        }
        None => None,
    };
    let telegram_login = match (&telegram, settings.auth.telegram) {
        (Some((client, ..)), true) => Some(Arc::new(TelegramLogin::new(client.clone()))),
        (None, true) => anyhow::bail!("telegram login needs notify.telegram settings"),
        _ => None,
    };
    let dispatcher = telegram.as_ref().map(|(client, destination, period)| {
        let mut receivers: Vec<Arc<dyn UpdateReceiver>> = vec![destination.clone()];
        if let Some(login) = &telegram_login {
            receivers.push(login.clone());
        }
        TelegramUpdateDispatcher::new(client.clone(), receivers, *period).spawn(shutdown_rx.clone())
    });
    let telegram = telegram.map(|(_, destination, _)| destination);

    let (destinations, email) = destinations(settings, telegram.as_ref()).await?;
    let destination_names: Vec<String> = destinations.iter().map(|d| d.name()).collect();
    let notify = Arc::new(NotifyService::new(engine.clone(), destinations, settings.notify.queue_size));

    let keys = Arc::new(SiteKeys::new(secret.clone(), server.sites.clone()));
    let tokens = Arc::new(TokenService::new(keys, token_params(settings)));
    let mut ctx = AuthContext::new(tokens, data.clone(), &remark_url);
    let avatars: Option<Arc<dyn AvatarStore>> = if settings.avatar.dir.is_empty() {
        None
    } else {
        let store: Arc<dyn AvatarStore> = Arc::new(FsAvatarStore::new(&settings.avatar.dir, settings.avatar.resize_limit));
        let proxy = AvatarProxy::new(store.clone(), format!("{remark_url}/api/v1/avatar"), settings.auth.timeout())?;
        ctx = ctx.with_avatars(Arc::new(proxy));
        Some(store)
    };
    let auth_service = Arc::new(auth_service(settings, ctx, notify.clone(), telegram_login).await?);

    let api_settings = ApiSettings {
        remark_url,
        version: env!("CARGO_PKG_VERSION").to_string(),
        secret,
        low_score: comments.low_score,
        critical_score: comments.critical_score,
        delete_me_ttl: server.delete_me_ttl(),
        subscribe_ttl: server.subscribe_ttl(),
        max_last: server.max_last,
    };
    let stream = &settings.stream;
    let mut state = AppState::new(data, cache, auth_service)
        .with_notify(notify.clone())
        .with_streamer(Arc::new(Streamer::new(stream.refresh(), stream.timeout(), stream.max_active)))
        .with_settings(api_settings);
    let dev_passwd = expose(&server.dev_passwd);
    if !dev_passwd.is_empty() {
        warn!("dev user enabled, don't use in production");
        state = state.with_dev_passwd(dev_passwd);
    }
    if let Some(avatars) = avatars {
        state = state.with_avatars(avatars);
    }
    if let Some(images) = images {
        state = state.with_images(images);
    }
    if let Some(search) = search {
        state = state.with_search(search);
    }
    if let Some(telegram) = telegram {
        state = state.with_telegram(telegram);
    }

    info!(
        providers = ?state.auth_service.providers(),
        destinations = ?destination_names,
        sites = ?server.sites,
        "server assembled"
    );
    Ok((state, Daemons { notify, email, dispatcher, shutdown }))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("can't listen for ctrl-c, {e}");
            std::future::pending::<()>().await;
        }
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("can't listen for SIGTERM, {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown requested");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::load()?;
    init_tracing(&settings);

    let (state, daemons) = build(&settings).await?;
    let app = api_adapters::router(state);

    let addr = settings.server.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr).await.with_context(|| format!("binding {addr}"))?;
    info!("listening on http://{addr}, public url {}", settings.server.remark_url);

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    daemons.close().await;
    Ok(())
}

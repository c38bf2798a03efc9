//! # Email
//!
//! Outbound mail goes through [`EmailSender`], a daemon task that owns the SMTP
//! connection. It connects on the first message and drops the connection after
//! `keep_alive` without traffic. [`EmailDestination`] renders the askama templates and
//! feeds the sender.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use askama::Template;
use async_trait::async_trait;
use domains::{Destination, NotifyRequest, VerificationRequest};
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::PoolConfig;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use services::formatter::snippet;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::SendErrors;

pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(30);
const SENDER_QUEUE: usize = 64;
const PARENT_SNIPPET_LEN: i64 = 300;

/// An open SMTP session.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, message: Message) -> anyhow::Result<()>;
    async fn test_connection(&self) -> anyhow::Result<()>;
}

/// Opens a new [`Mailer`].
pub type Connector = Arc<dyn Fn() -> anyhow::Result<Box<dyn Mailer>> + Send + Sync>;

#[derive(Debug, Clone, Default)]
pub struct SmtpParams {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Implicit TLS (usually port 465).
    pub tls: bool,
    pub starttls: bool,
    pub timeout: Duration,
}

pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpMailer {
    pub fn new(params: &SmtpParams) -> anyhow::Result<Self> {
        let builder = if params.tls {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&params.host)?
        } else if params.starttls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&params.host)?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&params.host)
        };
        let mut builder = builder
            .port(params.port)
            .timeout(Some(params.timeout))
            .pool_config(PoolConfig::new().max_size(1));
        if !params.username.is_empty() {
            builder = builder.credentials(Credentials::new(params.username.clone(), params.password.clone()));
        }
        Ok(Self { transport: builder.build() })
    }

    pub fn connector(params: SmtpParams) -> Connector {
        Arc::new(move || Ok(Box::new(SmtpMailer::new(&params)?) as Box<dyn Mailer>))
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, message: Message) -> anyhow::Result<()> {
        self.transport.send(message).await?;
        Ok(())
    }

    async fn test_connection(&self) -> anyhow::Result<()> {
        if !self.transport.test_connection().await? {
            anyhow::bail!("smtp server did not answer NOOP");
        }
        Ok(())
    }
}

struct Job {
    message: Message,
    done: oneshot::Sender<anyhow::Result<()>>,
}

/// Serializes every outbound message through one connection-owning task.
pub struct EmailSender {
    connector: Connector,
    jobs: Mutex<Option<mpsc::Sender<Job>>>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl EmailSender {
    pub fn new(connector: Connector, keep_alive: Duration) -> Self {
        let keep_alive = if keep_alive.is_zero() { DEFAULT_KEEP_ALIVE } else { keep_alive };
        let (tx, rx) = mpsc::channel(SENDER_QUEUE);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run_sender(rx, connector.clone(), keep_alive, shutdown_rx));
        Self { connector, jobs: Mutex::new(Some(tx)), shutdown, task: Mutex::new(Some(task)) }
    }

    /// Starts the sender and tests the SMTP server once. A failed test is logged and
    /// returned beside the sender, which keeps working and reconnects per message.
    pub async fn connect(connector: Connector, keep_alive: Duration) -> (Self, anyhow::Result<()>) {
        let sender = Self::new(connector, keep_alive);
        let check = sender.test_connection().await;
        match &check {
            Ok(()) => debug!("smtp connection test passed"),
            Err(e) => warn!("smtp connection test failed, {e:#}"),
        }
        (sender, check)
    }

    /// Queues the message and waits for the daemon to deliver it.
    pub async fn send(&self, message: Message) -> anyhow::Result<()> {
        let (done, result) = oneshot::channel();
        let jobs = self.jobs.lock().await.clone();
        let Some(jobs) = jobs else {
            anyhow::bail!("email sender is closed");
        };
        jobs.send(Job { message, done }).await.map_err(|_| anyhow::anyhow!("email sender is closed"))?;
        result.await.map_err(|_| anyhow::anyhow!("email sender stopped before delivery"))?
    }

    /// Dials a separate connection and issues NOOP.
    pub async fn test_connection(&self) -> anyhow::Result<()> {
        (self.connector)()?.test_connection().await
    }

    pub async fn close(&self) {
        self.jobs.lock().await.take();
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.lock().await.take() {
            if let Err(e) = task.await {
                warn!("email sender task failed, {e}");
            }
        }
    }
}

async fn run_sender(
    mut jobs: mpsc::Receiver<Job>,
    connector: Connector,
    keep_alive: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut conn: Option<Box<dyn Mailer>> = None;
    let idle = tokio::time::sleep(keep_alive);
    tokio::pin!(idle);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = &mut idle, if conn.is_some() => {
                conn = None;
                debug!("smtp connection closed after {keep_alive:?} idle");
            }
            job = jobs.recv() => {
                let Some(job) = job else { break };
                if conn.is_none() {
                    match connector() {
                        Ok(c) => {
                            debug!("smtp connection opened");
                            conn = Some(c);
                        }
                        Err(e) => {
                            warn!("can't open smtp connection, {e:#}");
                            let _ = job.done.send(Err(e));
                            continue;
                        }
                    }
                }
                let Some(mailer) = conn.as_ref() else { continue };
                let result = mailer.send(job.message).await;
                if let Err(e) = &result {
                    warn!("can't send email, {e:#}");
                }
                idle.as_mut().reset(tokio::time::Instant::now() + keep_alive);
                let _ = job.done.send(result);
            }
        }
    }
    if conn.take().is_some() {
        debug!("smtp connection closed on shutdown");
    }
}

#[derive(Template)]
#[template(path = "email_reply.html")]
struct ReplyTemplate<'a> {
    subject: &'a str,
    user_name: &'a str,
    parent_user_name: &'a str,
    post_title: &'a str,
    post_url: &'a str,
    comment_url: String,
    text: &'a str,
    parent_text: String,
}

#[derive(Template)]
#[template(path = "email_verify.html")]
struct VerifyTemplate<'a> {
    subject: &'a str,
    user: &'a str,
    site: &'a str,
    token: &'a str,
}

#[derive(Debug, Clone)]
pub struct EmailParams {
    pub from: String,
    pub subject: String,
    pub verification_subject: String,
    /// Receive every new comment.
    pub admin_emails: Vec<String>,
}

impl Default for EmailParams {
    fn default() -> Self {
        Self {
            from: String::new(),
            subject: "New comment".to_string(),
            verification_subject: "Email verification".to_string(),
            admin_emails: Vec::new(),
        }
    }
}

pub struct EmailDestination {
    sender: EmailSender,
    params: EmailParams,
}

impl EmailDestination {
    pub fn new(sender: EmailSender, params: EmailParams) -> Self {
        Self { sender, params }
    }

    pub fn sender(&self) -> &EmailSender {
        &self.sender
    }

    fn message(&self, to: &str, subject: &str, html: String) -> anyhow::Result<Message> {
        Ok(Message::builder()
            .from(self.params.from.parse::<Mailbox>()?)
            .to(to.parse::<Mailbox>()?)
            .subject(subject)
            .header(ContentType::TEXT_HTML)
            .body(html)?)
    }

    pub fn render_reply(&self, request: &NotifyRequest) -> anyhow::Result<String> {
        let comment = &request.comment;
        let tpl = ReplyTemplate {
            subject: &self.params.subject,
            user_name: &comment.user.name,
            parent_user_name: &request.parent.user.name,
            post_title: &comment.post_title,
            post_url: &comment.locator.url,
            comment_url: format!("{}#comments__comment-{}", comment.locator.url, comment.id),
            text: &comment.text,
            parent_text: snippet(&request.parent.text, PARENT_SNIPPET_LEN),
        };
        Ok(tpl.render()?)
    }
}

#[async_trait]
impl Destination for EmailDestination {
    async fn send(&self, request: &NotifyRequest) -> anyhow::Result<()> {
        let recipients: BTreeSet<&str> = request
            .emails
            .iter()
            .chain(self.params.admin_emails.iter())
            .map(String::as_str)
            .filter(|e| !e.is_empty())
            .collect();
        if recipients.is_empty() {
            return Ok(());
        }
        let html = self.render_reply(request)?;

        let mut errors = Vec::new();
        for to in recipients {
            let result = match self.message(to, &self.params.subject, html.clone()) {
                Ok(msg) => self.sender.send(msg).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => debug!(to, id = %request.comment.id, "email notification sent"),
                Err(e) => errors.push(e.context(format!("email to {to}"))),
            }
        }
        SendErrors::into_result(errors)
    }

    async fn send_verification(&self, request: &VerificationRequest) -> anyhow::Result<()> {
        if request.email.is_empty() {
            return Ok(());
        }
        let html = VerifyTemplate {
            subject: &self.params.verification_subject,
            user: &request.user,
            site: &request.site_id,
            token: &request.token,
        }
        .render()?;
        let msg = self.message(&request.email, &self.params.verification_subject, html)?;
        self.sender.send(msg).await
    }

    fn name(&self) -> String {
        format!("email: from {}", self.params.from)
    }
}

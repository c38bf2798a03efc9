//! # Notification service
//!
//! Two bounded queues (comments and verifications) drained by one worker each. Every
//! dequeued item is sent to all destinations concurrently; the next item waits for the
//! slowest destination. A full queue drops the request.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use domains::{Comment, Destination, Engine, NotifyRequest, UserDetail, VerificationRequest, VerificationSender};
use futures::future::join_all;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub const DEFAULT_QUEUE_SIZE: usize = 100;

pub struct NotifyService {
    inner: Option<Inner>,
}

/// Counters since start; verifications included.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NotifyStats {
    pub queued: u64,
    pub dropped: u64,
}

struct Inner {
    store: Arc<dyn Engine>,
    comments: Mutex<Option<mpsc::Sender<NotifyRequest>>>,
    verifications: Mutex<Option<mpsc::Sender<VerificationRequest>>>,
    closed: AtomicBool,
    queued: AtomicU64,
    dropped: AtomicU64,
    shutdown: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl NotifyService {
    /// Starts the workers. Without destinations the service does nothing.
    pub fn new(store: Arc<dyn Engine>, destinations: Vec<Arc<dyn Destination>>, queue_size: usize) -> Self {
        if destinations.is_empty() {
            return Self::nop();
        }
        let queue_size = if queue_size == 0 { DEFAULT_QUEUE_SIZE } else { queue_size };
        let (comments_tx, comments_rx) = mpsc::channel(queue_size);
        let (verify_tx, verify_rx) = mpsc::channel(queue_size);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let destinations: Arc<[Arc<dyn Destination>]> = destinations.into();
        debug!(?destinations, queue_size, "notify service started");
        let workers = vec![
            tokio::spawn(comment_worker(comments_rx, destinations.clone(), shutdown_rx.clone())),
            tokio::spawn(verification_worker(verify_rx, destinations, shutdown_rx)),
        ];

        Self {
            inner: Some(Inner {
                store,
                comments: Mutex::new(Some(comments_tx)),
                verifications: Mutex::new(Some(verify_tx)),
                closed: AtomicBool::new(false),
                queued: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
                shutdown,
                workers: Mutex::new(workers),
            }),
        }
    }

    /// A service that accepts and discards everything.
    pub fn nop() -> Self {
        Self { inner: None }
    }

    pub fn is_nop(&self) -> bool {
        self.inner.is_none()
    }

    pub fn stats(&self) -> NotifyStats {
        match &self.inner {
            Some(inner) => NotifyStats {
                queued: inner.queued.load(Ordering::Relaxed),
                dropped: inner.dropped.load(Ordering::Relaxed),
            },
            None => NotifyStats::default(),
        }
    }

    /// Resolves the parent and the recipients of `comment`, then enqueues without waiting.
    pub async fn submit(&self, comment: Comment) {
        let Some(inner) = &self.inner else { return };
        if inner.closed.load(Ordering::Acquire) {
            return;
        }
        let request = inner.build_request(comment).await;
        let guard = inner.comments.lock().await;
        let Some(tx) = guard.as_ref() else { return };
        match tx.try_send(request) {
            Ok(()) => inner.queued.fetch_add(1, Ordering::Relaxed),
            Err(mpsc::error::TrySendError::Full(req)) => {
                warn!("notification queue is full, comment {} dropped", req.comment.id);
                inner.dropped.fetch_add(1, Ordering::Relaxed)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => 0,
        };
    }

    pub async fn submit_verification(&self, request: VerificationRequest) {
        let Some(inner) = &self.inner else { return };
        if inner.closed.load(Ordering::Acquire) {
            return;
        }
        let guard = inner.verifications.lock().await;
        let Some(tx) = guard.as_ref() else { return };
        match tx.try_send(request) {
            Ok(()) => inner.queued.fetch_add(1, Ordering::Relaxed),
            Err(mpsc::error::TrySendError::Full(req)) => {
                warn!("verification queue is full, request for {} dropped", req.user);
                inner.dropped.fetch_add(1, Ordering::Relaxed)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => 0,
        };
    }

    /// Stops accepting requests, cancels in-flight sends and waits for the workers.
    /// Calling it again is a no-op.
    pub async fn close(&self) {
        let Some(inner) = &self.inner else { return };
        if inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        inner.comments.lock().await.take();
        inner.verifications.lock().await.take();
        let _ = inner.shutdown.send(true);
        let workers: Vec<JoinHandle<()>> = inner.workers.lock().await.drain(..).collect();
        for worker in workers {
            if let Err(e) = worker.await {
                warn!("notification worker failed, {e}");
            }
        }
        debug!("notify service closed");
    }
}

impl Inner {
    async fn build_request(&self, comment: Comment) -> NotifyRequest {
        let mut request = NotifyRequest { comment, ..Default::default() };
        if request.comment.parent_id.is_empty() {
            return request;
        }

        let site = request.comment.locator.site_id.clone();
        let author = request.comment.user.id.clone();
        let mut visited = HashSet::new();
        let mut notified_users = HashSet::new();
        let mut next = request.comment.parent_id.clone();

        while !next.is_empty() && visited.insert(next.clone()) {
            let ancestor = match self.store.get(&request.comment.locator, &next).await {
                Ok(c) => c,
                Err(e) => {
                    debug!("can't load ancestor {next} of {}, {e}", request.comment.id);
                    break;
                }
            };
            if request.parent.id.is_empty() {
                request.parent = ancestor.clone();
            }
            let user = ancestor.user.id.clone();
            if user != author && !ancestor.is_hard_deleted() && notified_users.insert(user.clone()) {
                if let Some(email) = self.detail(&site, &user, UserDetail::Email).await {
                    if !request.emails.contains(&email) {
                        request.emails.push(email);
                    }
                }
                if let Some(telegram) = self.detail(&site, &user, UserDetail::Telegram).await {
                    if !request.telegrams.contains(&telegram) {
                        request.telegrams.push(telegram);
                    }
                }
            }
            next = ancestor.parent_id;
        }
        request
    }

    async fn detail(&self, site: &str, user: &str, detail: UserDetail) -> Option<String> {
        match self.store.user_detail(site, user, detail).await {
            Ok(v) if !v.is_empty() => Some(v),
            Ok(_) => None,
            Err(e) => {
                debug!("can't get {detail:?} of {user}, {e}");
                None
            }
        }
    }
}

async fn comment_worker(
    mut rx: mpsc::Receiver<NotifyRequest>,
    destinations: Arc<[Arc<dyn Destination>]>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let request = tokio::select! {
            _ = shutdown.changed() => break,
            item = rx.recv() => match item {
                Some(request) => request,
                None => break,
            },
        };
        let sends = join_all(destinations.iter().map(|d| {
            let request = &request;
            async move {
                if let Err(e) = d.send(request).await {
                    warn!("failed to send notification to {}, {e:#}", d.name());
                }
            }
        }));
        tokio::select! {
            _ = sends => {}
            _ = shutdown.changed() => break,
        }
    }
}

async fn verification_worker(
    mut rx: mpsc::Receiver<VerificationRequest>,
    destinations: Arc<[Arc<dyn Destination>]>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let request = tokio::select! {
            _ = shutdown.changed() => break,
            item = rx.recv() => match item {
                Some(request) => request,
                None => break,
            },
        };
        let sends = join_all(destinations.iter().map(|d| {
            let request = &request;
            async move {
                if let Err(e) = d.send_verification(request).await {
                    warn!("failed to send verification to {}, {e:#}", d.name());
                }
            }
        }));
        tokio::select! {
            _ = sends => {}
            _ = shutdown.changed() => break,
        }
    }
}

#[async_trait]
impl VerificationSender for NotifyService {
    async fn send_verification(&self, request: VerificationRequest) -> anyhow::Result<()> {
        self.submit_verification(request).await;
        Ok(())
    }
}

//! # Streamer
//!
//! Polls a value source and emits it whenever it changes. The number of concurrently
//! open streams is capped and a stream ends after `timeout` without a change.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, BoxStream, StreamExt};
use tokio::time::Instant;

#[derive(Debug)]
pub struct Streamer {
    refresh: Duration,
    timeout: Duration,
    max_active: usize,
    active: Arc<AtomicUsize>,
}

/// Keeps one slot of the active-stream budget; released on drop.
#[derive(Debug)]
pub struct StreamSlot(Arc<AtomicUsize>);

impl Drop for StreamSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Streamer {
    pub fn new(refresh: Duration, timeout: Duration, max_active: usize) -> Self {
        Self { refresh, timeout, max_active, active: Arc::new(AtomicUsize::new(0)) }
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Reserves a stream slot, `None` when the cap is reached.
    pub fn try_acquire(&self) -> Option<StreamSlot> {
        self.active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < self.max_active).then_some(n + 1))
            .ok()
            .map(|_| StreamSlot(self.active.clone()))
    }

    /// Emits the first value immediately and then every change. `fetch` returning `None`
    /// ends the stream.
    pub fn updates<T, F, Fut>(&self, slot: StreamSlot, fetch: F) -> BoxStream<'static, T>
    where
        T: PartialEq + Clone + Send + 'static,
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Option<T>> + Send + 'static,
    {
        struct State<T, F> {
            fetch: F,
            last: Option<T>,
            changed_at: Instant,
            _slot: StreamSlot,
        }

        let (refresh, timeout) = (self.refresh, self.timeout);
        let state = State { fetch, last: None, changed_at: Instant::now(), _slot: slot };
        stream::unfold(state, move |mut st| async move {
            loop {
                if st.last.is_some() {
                    tokio::time::sleep(refresh).await;
                    if st.changed_at.elapsed() >= timeout {
                        return None;
                    }
                }
                let current = (st.fetch)().await?;
                if st.last.as_ref() != Some(&current) {
                    st.last = Some(current.clone());
                    st.changed_at = Instant::now();
                    return Some((current, st));
                }
            }
        })
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[tokio::test(start_paused = true)]
    async fn emits_changes_until_idle() {
        let streamer = Streamer::new(Duration::from_millis(100), Duration::from_millis(350), 2);
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let slot = streamer.try_acquire().unwrap();
        let values: Vec<u32> = streamer
            .updates(slot, move || {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move { Some(if n < 3 { n / 2 } else { 1 }) }
            })
            .collect()
            .await;
        assert_eq!(values, vec![0, 1]);
        assert_eq!(streamer.active(), 0);
    }

    #[test]
    fn caps_active_streams() {
        let streamer = Streamer::new(Duration::from_secs(1), Duration::from_secs(10), 1);
        let slot = streamer.try_acquire();
        assert!(slot.is_some());
        assert!(streamer.try_acquire().is_none());
        drop(slot);
        assert!(streamer.try_acquire().is_some());
    }
}

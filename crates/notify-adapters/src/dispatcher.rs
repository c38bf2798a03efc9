//! # Telegram update dispatcher
//!
//! Single long-poll caller shared by every component interested in bot updates. Each
//! tick fetches the updates after the last seen id and hands the raw batch to all
//! receivers.

use std::sync::Arc;
use std::time::Duration;

use domains::UpdateReceiver;
use futures::future::join_all;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::telegram::TelegramClient;

pub struct TelegramUpdateDispatcher {
    client: TelegramClient,
    receivers: Vec<Arc<dyn UpdateReceiver>>,
    period: Duration,
    offset: i64,
}

impl TelegramUpdateDispatcher {
    pub fn new(client: TelegramClient, receivers: Vec<Arc<dyn UpdateReceiver>>, period: Duration) -> Self {
        Self { client, receivers, period, offset: 0 }
    }

    /// One poll. Returns the number of updates forwarded.
    pub async fn poll(&mut self) -> anyhow::Result<usize> {
        let updates = self.client.get_updates(self.offset).await?;
        if updates.is_empty() {
            return Ok(0);
        }
        if let Some(max) = updates.iter().filter_map(|u| u.get("update_id").and_then(|id| id.as_i64())).max() {
            self.offset = self.offset.max(max + 1);
        }

        let raw = serde_json::to_string(&updates)?;
        let results = join_all(self.receivers.iter().map(|r| {
            let raw = raw.as_str();
            async move { (r.name(), r.process_update(raw).await) }
        }))
        .await;
        for (name, result) in results {
            if let Err(e) = result {
                warn!("telegram update receiver {name} failed, {e:#}");
            }
        }
        Ok(updates.len())
    }

    /// Polls every `period` until `shutdown` flips.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        debug!(receivers = self.receivers.len(), period = ?self.period, "telegram dispatcher started");
        let mut ticker = tokio::time::interval(self.period);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.poll().await {
                        warn!("telegram getUpdates failed, {e:#}");
                    }
                }
            }
        }
        debug!("telegram dispatcher stopped");
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domains::MockUpdateReceiver;
    use serde_json::json;
    use wiremock::matchers::{path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn updates(ids: &[i64]) -> ResponseTemplate {
        let result: Vec<_> = ids.iter().map(|id| json!({"update_id": id, "message": {"chat": {"id": 1}, "text": "hi"}})).collect();
        ResponseTemplate::new(200).set_body_json(json!({"ok": true, "result": result}))
    }

    #[tokio::test]
    async fn forwards_batches_and_advances_offset() {
        let server = MockServer::start().await;
        Mock::given(path("/botT/getUpdates"))
            .and(query_param("offset", "0"))
            .respond_with(updates(&[5, 7]))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(path("/botT/getUpdates"))
            .and(query_param("offset", "8"))
            .respond_with(updates(&[]))
            .expect(1)
            .mount(&server)
            .await;

        let mut ok = MockUpdateReceiver::new();
        ok.expect_name().return_const("ok".to_string());
        ok.expect_process_update()
            .withf(|raw| raw.contains("\"update_id\":5") && raw.contains("\"update_id\":7"))
            .times(1)
            .returning(|_| Ok(()));
        let mut failing = MockUpdateReceiver::new();
        failing.expect_name().return_const("failing".to_string());
        failing.expect_process_update().times(1).returning(|_| Err(anyhow::anyhow!("boom")));

        let client = TelegramClient::new(server.uri(), "T", Duration::from_secs(5)).unwrap();
        let mut dispatcher =
            TelegramUpdateDispatcher::new(client, vec![Arc::new(ok), Arc::new(failing)], Duration::from_millis(10));

        assert_eq!(dispatcher.poll().await.unwrap(), 2);
        assert_eq!(dispatcher.offset(), 8);
        assert_eq!(dispatcher.poll().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn stops_on_shutdown() {
        let server = MockServer::start().await;
        Mock::given(path("/botT/getUpdates")).respond_with(updates(&[])).mount(&server).await;

        let client = TelegramClient::new(server.uri(), "T", Duration::from_secs(5)).unwrap();
        let (tx, rx) = watch::channel(false);
        let handle = TelegramUpdateDispatcher::new(client, vec![], Duration::from_millis(5)).spawn(rx);
        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }
}

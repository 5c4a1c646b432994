//! Webhook Dispatcher
//! Mission: signed, retried, bounded fire-and-forget delivery of high-risk
//! verdicts; never on the scoring hot path

use chrono::{DateTime, Utc};
use crossbeam::queue::ArrayQueue;
use hmac::{Hmac, Mac};
use metrics::counter;
use rand::Rng;
use reqwest::Client;
use serde::Serialize;
use sha2::Sha256;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{info, warn};

type HmacSha256 = Hmac<Sha256>;

/// Per-delivery HTTP timeout.
const DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);
/// Attempts per event; 4xx responses stop early.
const MAX_ATTEMPTS: u32 = 3;
/// First retry delay; doubles per retry, capped below.
const BACKOFF_BASE: Duration = Duration::from_secs(2);
const BACKOFF_CAP: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct WebhookEvent {
    pub event_id: String,
    pub event_type: String,
    pub created_at: DateTime<Utc>,
    pub tenant_id: String,
    pub url: String,
    pub secret: String,
    pub data: serde_json::Value,
}

#[derive(Serialize)]
struct WebhookBody<'a> {
    event_id: &'a str,
    event_type: &'a str,
    created_at: String,
    data: &'a serde_json::Value,
}

/// `sha256=<hex>` over the exact body bytes, keyed by the tenant secret.
pub fn signature(secret: &str, body: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts any key length");
    mac.update(body.as_bytes());
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// Retry delay before the given attempt (2-based): 2s, 4s, ... capped.
fn backoff_delay(next_attempt: u32) -> Duration {
    let exp = next_attempt.saturating_sub(2).min(10);
    let delay = BACKOFF_BASE * 2u32.pow(exp);
    delay.min(BACKOFF_CAP)
}

pub struct WebhookDispatcher {
    queue: Arc<ArrayQueue<WebhookEvent>>,
    notify: Arc<Notify>,
    shutdown: Arc<AtomicBool>,
    client: Client,
}

impl Clone for WebhookDispatcher {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            notify: self.notify.clone(),
            shutdown: self.shutdown.clone(),
            client: self.client.clone(),
        }
    }
}

impl WebhookDispatcher {
    pub fn new(capacity: usize) -> Self {
        let client = Client::builder()
            .timeout(DELIVERY_TIMEOUT)
            .pool_max_idle_per_host(10)
            .user_agent("Sentinel/1.0 (webhook dispatcher)")
            .build()
            .unwrap_or_default();

        Self {
            queue: Arc::new(ArrayQueue::new(capacity.max(1))),
            notify: Arc::new(Notify::new()),
            shutdown: Arc::new(AtomicBool::new(false)),
            client,
        }
    }

    /// Non-blocking enqueue. On overflow the oldest pending delivery is
    /// dropped and counted; the caller is never slowed down.
    pub fn enqueue(&self, event: WebhookEvent) {
        if let Some(dropped) = self.queue.force_push(event) {
            counter!("webhook_overflow_total", 1);
            warn!(
                tenant_id = %dropped.tenant_id,
                event_id = %dropped.event_id,
                "webhook queue full, oldest pending delivery dropped"
            );
        }
        self.notify.notify_one();
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Stop the worker pool after the queue drains from the workers'
    /// perspective (in-flight deliveries finish their retries).
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Fixed pool of consumer tasks.
    pub fn spawn_workers(&self, count: usize) {
        for worker in 0..count.max(1) {
            let dispatcher = self.clone();
            tokio::spawn(async move {
                loop {
                    match dispatcher.queue.pop() {
                        Some(event) => dispatcher.deliver(event).await,
                        None => {
                            if dispatcher.shutdown.load(Ordering::SeqCst) {
                                info!(worker, "webhook worker exiting");
                                break;
                            }
                            dispatcher.notify.notified().await;
                        }
                    }
                }
            });
        }
    }

    async fn deliver(&self, event: WebhookEvent) {
        let body = WebhookBody {
            event_id: &event.event_id,
            event_type: &event.event_type,
            created_at: event.created_at.to_rfc3339(),
            data: &event.data,
        };
        let body = match serde_json::to_string(&body) {
            Ok(body) => body,
            Err(e) => {
                warn!(event_id = %event.event_id, error = %e, "webhook body serialisation failed");
                return;
            }
        };
        let sig = signature(&event.secret, &body);

        for attempt in 1..=MAX_ATTEMPTS {
            if attempt > 1 {
                let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..500));
                tokio::time::sleep(backoff_delay(attempt) + jitter).await;
            }

            let result = self
                .client
                .post(&event.url)
                .header("Content-Type", "application/json")
                .header("X-Sentinel-Signature", &sig)
                .header("X-Sentinel-Event", &event.event_type)
                .body(body.clone())
                .send()
                .await;

            match result {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        counter!("webhook_delivered_total", 1);
                        info!(
                            tenant_id = %event.tenant_id,
                            event_id = %event.event_id,
                            attempt,
                            status = status.as_u16(),
                            "webhook delivered"
                        );
                        return;
                    }
                    if status.is_client_error() {
                        counter!("webhook_failed_total", 1);
                        warn!(
                            tenant_id = %event.tenant_id,
                            event_id = %event.event_id,
                            attempt,
                            status = status.as_u16(),
                            "webhook rejected by receiver, not retrying"
                        );
                        return;
                    }
                    warn!(
                        tenant_id = %event.tenant_id,
                        event_id = %event.event_id,
                        attempt,
                        status = status.as_u16(),
                        "webhook delivery failed"
                    );
                }
                Err(e) => {
                    warn!(
                        tenant_id = %event.tenant_id,
                        event_id = %event.event_id,
                        attempt,
                        error = %e,
                        "webhook transport error"
                    );
                }
            }
        }
        counter!("webhook_failed_total", 1);
        warn!(
            tenant_id = %event.tenant_id,
            event_id = %event.event_id,
            attempts = MAX_ATTEMPTS,
            "webhook delivery abandoned"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{extract::State, http::HeaderMap, routing::post, Router};
    use parking_lot::Mutex;

    fn event(id: &str, url: &str) -> WebhookEvent {
        WebhookEvent {
            event_id: id.to_string(),
            event_type: "transaction.high_risk".to_string(),
            created_at: Utc::now(),
            tenant_id: "t1".to_string(),
            url: url.to_string(),
            secret: "whsec_test".to_string(),
            data: serde_json::json!({"risk_score": 82}),
        }
    }

    #[test]
    fn signature_matches_manual_hmac() {
        let body = r#"{"hello":"world"}"#;
        let sig = signature("secret", body);
        assert!(sig.starts_with("sha256="));

        let mut mac = HmacSha256::new_from_slice(b"secret").unwrap();
        mac.update(body.as_bytes());
        let expected = format!("sha256={}", hex::encode(mac.finalize().into_bytes()));
        assert_eq!(sig, expected);

        // Different secret, different signature.
        assert_ne!(signature("other", body), sig);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(backoff_delay(2), Duration::from_secs(2));
        assert_eq!(backoff_delay(3), Duration::from_secs(4));
        assert_eq!(backoff_delay(8), Duration::from_secs(60));
    }

    #[test]
    fn overflow_drops_oldest() {
        let dispatcher = WebhookDispatcher::new(2);
        dispatcher.enqueue(event("e1", "http://localhost/never"));
        dispatcher.enqueue(event("e2", "http://localhost/never"));
        dispatcher.enqueue(event("e3", "http://localhost/never"));

        assert_eq!(dispatcher.pending(), 2);
        let first = dispatcher.queue.pop().unwrap();
        assert_eq!(first.event_id, "e2");
    }

    #[derive(Clone, Default)]
    struct Captured {
        requests: Arc<Mutex<Vec<(String, String)>>>,
    }

    async fn receiver(
        State(captured): State<Captured>,
        headers: HeaderMap,
        body: String,
    ) -> &'static str {
        let sig = headers
            .get("X-Sentinel-Signature")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        captured.requests.lock().push((sig, body));
        "ok"
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn delivers_signed_payload() {
        let captured = Captured::default();
        let app = Router::new()
            .route("/hook", post(receiver))
            .with_state(captured.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });

        let dispatcher = WebhookDispatcher::new(16);
        dispatcher.spawn_workers(1);
        dispatcher.enqueue(event("e1", &format!("http://{}/hook", addr)));

        // Wait for the worker to deliver.
        for _ in 0..50 {
            if !captured.requests.lock().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let requests = captured.requests.lock();
        assert_eq!(requests.len(), 1, "webhook was not delivered");
        let (sig, body) = &requests[0];
        assert_eq!(sig, &signature("whsec_test", body));

        let parsed: serde_json::Value = serde_json::from_str(body).unwrap();
        assert_eq!(parsed["event_type"], "transaction.high_risk");
        assert_eq!(parsed["data"]["risk_score"], 82);
        assert_eq!(parsed["event_id"], "e1");

        dispatcher.shutdown();
    }
}

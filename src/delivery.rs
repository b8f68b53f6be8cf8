//! Webhook delivery with bounded retry and linear backoff
//!
//! Two request shapes share one retry loop:
//! - JSON body containing the record
//! - multipart/form-data with the files plus a `payload` field holding the record
//!
//! Delivery is best effort. Exhausted retries are logged and the outcome is
//! returned for observability only; callers never requeue.

use std::future::Future;
use std::time::Duration;

use reqwest::multipart::{Form, Part};
use reqwest::{Client, Response};
use serde_json::Value;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::media::MediaItem;
use crate::metrics;
use crate::record::DeliveryRecord;

const DEFAULT_MIME: &str = "application/octet-stream";
const MAX_LOGGED_BODY: usize = 300;

/// Attempt bound and backoff unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// Sleep after failed attempt number `attempt` (1-based): `backoff × attempt`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.backoff * attempt
    }

    /// Every sleep a fully failing delivery goes through, in order.
    pub fn schedule(&self) -> Vec<Duration> {
        (1..self.max_attempts).map(|a| self.delay_after(a)).collect()
    }
}

/// Result of one logical delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryOutcome {
    pub delivered: bool,
    pub attempts: u32,
}

/// HTTP client for the configured webhook.
#[derive(Debug, Clone)]
pub struct WebhookClient {
    http: Client,
    url: String,
    policy: RetryPolicy,
}

impl WebhookClient {
    pub fn new(url: impl Into<String>, timeout: Duration, policy: RetryPolicy) -> Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("telegram_forwarder/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|e| Error::HttpError(format!("HTTP client error: {}", e)))?;

        Ok(Self {
            http,
            url: url.into(),
            policy,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(
            config.webhook_url.clone(),
            config.http_timeout,
            RetryPolicy::new(config.http_max_retries, config.http_backoff),
        )
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// POST the record as `application/json`.
    pub async fn send_json(&self, record: &DeliveryRecord) -> DeliveryOutcome {
        let outcome = self
            .with_retry("json", record.message_id, |_| {
                self.http.post(&self.url).json(record).send()
            })
            .await;

        if outcome.delivered {
            info!(message_id = record.message_id, channel = %record.channel, "Sent message");
        }
        outcome
    }

    /// POST the record with attached files. Falls back to JSON without files.
    pub async fn send_with_files(
        &self,
        record: &DeliveryRecord,
        files: &[MediaItem],
    ) -> DeliveryOutcome {
        if files.is_empty() {
            return self.send_json(record).await;
        }

        let payload = match multipart_payload(record, files) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(message_id = record.message_id, error = %err, "Failed to encode payload");
                return DeliveryOutcome {
                    delivered: false,
                    attempts: 0,
                };
            }
        };

        let outcome = self
            .with_retry("multipart", record.message_id, |_| {
                let payload = payload.clone();
                async move {
                    // Files are read fresh on every attempt and dropped right after.
                    let form = build_form(payload, files).await?;
                    self.http
                        .post(&self.url)
                        .multipart(form)
                        .send()
                        .await
                        .map_err(Error::from)
                }
            })
            .await;

        if outcome.delivered {
            info!(
                message_id = record.message_id,
                files = files.len(),
                "Sent batch with file(s) and payload"
            );
        }
        outcome
    }

    async fn with_retry<F, Fut, E>(
        &self,
        shape: &'static str,
        message_id: i32,
        mut attempt_fn: F,
    ) -> DeliveryOutcome
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = std::result::Result<Response, E>>,
        E: std::fmt::Display,
    {
        let max_attempts = self.policy.max_attempts;

        for attempt in 1..=max_attempts {
            match attempt_fn(attempt).await {
                Ok(response) if response.status().is_success() => {
                    metrics::record_delivery_attempt(shape, true);
                    return DeliveryOutcome {
                        delivered: true,
                        attempts: attempt,
                    };
                }
                Ok(response) => {
                    metrics::record_delivery_attempt(shape, false);
                    let status = response.status();
                    let body = response.text().await.unwrap_or_default();
                    warn!(
                        message_id,
                        attempt,
                        %status,
                        body = %truncate(&body, MAX_LOGGED_BODY),
                        "Webhook responded with error status"
                    );
                }
                Err(err) => {
                    metrics::record_delivery_attempt(shape, false);
                    warn!(message_id, attempt, error = %err, "Error sending webhook");
                }
            }

            if attempt < max_attempts {
                let delay = self.policy.delay_after(attempt);
                debug!(message_id, attempt, delay_ms = delay.as_millis() as u64, "Backing off");
                sleep(delay).await;
            }
        }

        warn!(message_id, attempts = max_attempts, "Giving up on webhook delivery");
        DeliveryOutcome {
            delivered: false,
            attempts: max_attempts,
        }
    }
}

/// JSON text of the `payload` field. A single file adds its metadata.
fn multipart_payload(record: &DeliveryRecord, files: &[MediaItem]) -> Result<String> {
    let mut value = serde_json::to_value(record)?;
    if let ([item], Value::Object(map)) = (files, &mut value) {
        map.insert("media_filename".into(), Value::from(item.filename.clone()));
        map.insert("media_mimetype".into(), Value::from(item.mimetype.clone()));
        map.insert("media_filesize".into(), Value::from(item.filesize));
    }
    Ok(serde_json::to_string(&value)?)
}

async fn build_form(payload: String, files: &[MediaItem]) -> Result<Form> {
    let field = if files.len() == 1 { "file" } else { "files[]" };
    let mut form = Form::new();

    for item in files {
        let bytes = tokio::fs::read(&item.file_path).await?;
        let part = Part::bytes(bytes)
            .file_name(item.filename.clone())
            .mime_str(item.mimetype.as_deref().unwrap_or(DEFAULT_MIME))?;
        form = form.part(field, part);
    }

    Ok(form.text("payload", payload))
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::IncomingMessage;
    use chrono::Utc;
    use httpmock::prelude::*;
    use std::path::Path;
    use std::time::Instant;
    use tempfile::tempdir;

    fn record(id: i32) -> DeliveryRecord {
        DeliveryRecord::from_message("news", &IncomingMessage::new(id, "text", Utc::now()))
    }

    fn client(url: String, attempts: u32) -> WebhookClient {
        let retry = RetryPolicy::new(attempts, Duration::from_millis(10));
        WebhookClient::new(url, Duration::from_secs(2), retry).expect("client")
    }

    fn media_file(dir: &Path, name: &str, mime: Option<&str>) -> MediaItem {
        let path = dir.join(name);
        std::fs::write(&path, b"binary-bytes").unwrap();
        MediaItem {
            file_path: path,
            filename: name.to_string(),
            mimetype: mime.map(str::to_string),
            filesize: 12,
        }
    }

    #[test]
    fn backoff_is_linear_in_attempt_number() {
        let policy = RetryPolicy::new(5, Duration::from_secs(2));
        let secs: Vec<u64> = policy.schedule().iter().map(Duration::as_secs).collect();
        assert_eq!(secs, vec![2, 4, 6, 8]);
    }

    #[test]
    fn zero_attempts_still_tries_once() {
        assert_eq!(RetryPolicy::new(0, Duration::from_secs(1)).max_attempts, 1);
    }

    #[tokio::test]
    async fn json_delivery_posts_record() {
        let server = MockServer::start_async().await;
        let hook = server.mock(|when, then| {
            when.method(POST)
                .path("/hook")
                .header("content-type", "application/json")
                .is_true(|req| {
                    let body = String::from_utf8_lossy(req.body().as_ref());
                    body.contains("\"url\":\"https://t.me/news/100\"")
                });
            then.status(200);
        });

        let outcome = client(server.url("/hook"), 5).send_json(&record(100)).await;
        assert_eq!(outcome, DeliveryOutcome { delivered: true, attempts: 1 });
        hook.assert_calls(1);
    }

    #[tokio::test]
    async fn delivery_stops_after_max_attempts() {
        let server = MockServer::start_async().await;
        let hook = server.mock(|when, then| {
            when.method(POST).path("/hook");
            then.status(500).body("boom");
        });

        let start = Instant::now();
        let outcome = client(server.url("/hook"), 3).send_json(&record(1)).await;
        assert_eq!(outcome, DeliveryOutcome { delivered: false, attempts: 3 });
        hook.assert_calls(3);
        // 10ms after attempt 1 and 20ms after attempt 2, none after the last.
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn transport_errors_are_retried_then_dropped() {
        let outcome = client("http://127.0.0.1:9/hook".to_string(), 2)
            .send_json(&record(1))
            .await;
        assert_eq!(outcome, DeliveryOutcome { delivered: false, attempts: 2 });
    }

    #[tokio::test]
    async fn single_file_uses_file_field_and_metadata() {
        let dir = tempdir().unwrap();
        let item = media_file(dir.path(), "photo.jpg", Some("image/jpeg"));

        let server = MockServer::start_async().await;
        let hook = server.mock(|when, then| {
            when.method(POST).path("/hook").is_true(|req| {
                let body = String::from_utf8_lossy(req.body().as_ref());
                body.contains("name=\"file\"")
                    && body.contains("filename=\"photo.jpg\"")
                    && body.contains("name=\"payload\"")
                    && body.contains("\"media_filename\":\"photo.jpg\"")
                    && body.contains("\"media_filesize\":12")
                    && body.contains("binary-bytes")
            });
            then.status(201);
        });

        let outcome = client(server.url("/hook"), 2)
            .send_with_files(&record(5), &[item])
            .await;
        assert!(outcome.delivered);
        hook.assert_calls(1);
    }

    #[tokio::test]
    async fn several_files_use_array_field() {
        let dir = tempdir().unwrap();
        let files = vec![
            media_file(dir.path(), "a.jpg", None),
            media_file(dir.path(), "b.mp4", Some("video/mp4")),
        ];

        let server = MockServer::start_async().await;
        let hook = server.mock(|when, then| {
            when.method(POST).path("/hook").is_true(|req| {
                let body = String::from_utf8_lossy(req.body().as_ref());
                body.matches("name=\"files[]\"").count() == 2
                    && body.contains("application/octet-stream")
                    && !body.contains("media_filename")
            });
            then.status(200);
        });

        let outcome = client(server.url("/hook"), 2)
            .send_with_files(&record(6), &files)
            .await;
        assert!(outcome.delivered);
        hook.assert_calls(1);
    }

    #[tokio::test]
    async fn files_are_reread_on_every_attempt() {
        let dir = tempdir().unwrap();
        let item = media_file(dir.path(), "gone.jpg", None);
        std::fs::remove_file(&item.file_path).unwrap();

        let server = MockServer::start_async().await;
        let hook = server.mock(|when, then| {
            when.method(POST).path("/hook");
            then.status(200);
        });

        // Missing file fails each attempt before any request is made.
        let outcome = client(server.url("/hook"), 2)
            .send_with_files(&record(7), &[item])
            .await;
        assert_eq!(outcome, DeliveryOutcome { delivered: false, attempts: 2 });
        hook.assert_calls(0);
    }

    #[tokio::test]
    async fn empty_file_list_falls_back_to_json() {
        let server = MockServer::start_async().await;
        let hook = server.mock(|when, then| {
            when.method(POST)
                .path("/hook")
                .header("content-type", "application/json");
            then.status(200);
        });

        let outcome = client(server.url("/hook"), 1).send_with_files(&record(8), &[]).await;
        assert!(outcome.delivered);
        hook.assert_calls(1);
    }

    #[tokio::test]
    async fn recovers_after_two_server_errors() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer as WireServer, ResponseTemplate};

        let server = WireServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let outcome = client(format!("{}/hook", server.uri()), 5)
            .send_json(&record(100))
            .await;
        assert_eq!(outcome, DeliveryOutcome { delivered: true, attempts: 3 });

        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 3);
    }
}

//! Delivery of extracted codes to the chat destination.
//!
//! [`TelegramNotifier`] posts to the Bot API. Transient failures (transport
//! errors, HTTP 429 and 5xx) are retried with exponential delay; the API
//! refusing a message is final.

use crate::config::{DeliveryConfig, RelayConfig};
use crate::error::{Error, Result};
use crate::shutdown::Shutdown;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Text an expired code message is replaced with.
pub const EXPIRED_TEXT: &str = "_Expired_";

/// Where an extracted code came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryContext {
    /// UID of the originating message.
    pub uid: u32,
    /// Arrival time of the originating message.
    pub received_at: DateTime<Utc>,
}

/// A successful delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    /// Identifier of the sent chat message, when the API reported one.
    pub message_id: Option<i64>,
    /// Attempts it took, including the successful one.
    pub attempts: u32,
}

/// Sends codes to the destination.
#[allow(async_fn_in_trait)]
pub trait Notifier {
    /// Delivers `code`, retrying transient failures.
    ///
    /// Retry waits end early on shutdown with [`Error::DeliveryInterrupted`];
    /// a request already in flight is allowed to finish.
    async fn send(
        &self,
        code: &str,
        context: &DeliveryContext,
        shutdown: &Shutdown,
    ) -> Result<Delivery>;

    /// Marks a previously sent message as expired.
    async fn expire(&self, message_id: i64) -> Result<()>;
}

impl<T: Notifier + ?Sized> Notifier for &T {
    async fn send(
        &self,
        code: &str,
        context: &DeliveryContext,
        shutdown: &Shutdown,
    ) -> Result<Delivery> {
        (**self).send(code, context, shutdown).await
    }

    async fn expire(&self, message_id: i64) -> Result<()> {
        (**self).expire(message_id).await
    }
}

/// Telegram Bot API notifier.
pub struct TelegramNotifier {
    client: reqwest::Client,
    api_url: String,
    bot_token: SecretString,
    chat_id: String,
    policy: DeliveryConfig,
}

#[derive(Debug, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
struct ApiResponse<T> {
    ok: bool,
    #[serde(default)]
    result: Option<T>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SentMessage {
    message_id: i64,
}

/// Outcome of one failed API call.
#[derive(Debug)]
enum Failure {
    Transient(String),
    Rejected { status: StatusCode, description: String },
}

impl TelegramNotifier {
    /// Creates a notifier from the relay configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::HttpClient`] if the HTTP client cannot be built.
    pub fn new(config: &RelayConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.delivery.request_timeout)
            .build()
            .map_err(|source| Error::HttpClient { source })?;

        Ok(Self {
            client,
            api_url: config.telegram_api_url.clone(),
            bot_token: SecretString::from(config.bot_token().to_string()),
            chat_id: config.chat_id.clone(),
            policy: config.delivery.clone(),
        })
    }

    /// Delay before retry number `attempt` (1-based count of failures so far).
    fn retry_delay(&self, attempt: u32) -> Duration {
        self.policy
            .retry_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        payload: &serde_json::Value,
    ) -> std::result::Result<Option<T>, Failure> {
        let url = format!(
            "{}/bot{}/{method}",
            self.api_url,
            self.bot_token.expose_secret()
        );

        let response = self
            .client
            .post(url)
            .json(payload)
            .send()
            .await
            .map_err(|e| Failure::Transient(e.without_url().to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Failure::Transient(e.without_url().to_string()))?;
        let parsed: Option<ApiResponse<T>> = serde_json::from_str(&body).ok();

        if status.is_success() {
            return match parsed {
                Some(api) if api.ok => Ok(api.result),
                Some(api) => Err(Failure::Rejected {
                    status,
                    description: api.description.unwrap_or_default(),
                }),
                None => Err(Failure::Transient(format!(
                    "HTTP {status} with unreadable body"
                ))),
            };
        }

        let description = parsed
            .and_then(|api| api.description)
            .unwrap_or_else(|| status.to_string());
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            Err(Failure::Transient(format!("HTTP {status}: {description}")))
        } else {
            Err(Failure::Rejected {
                status,
                description,
            })
        }
    }
}

impl Notifier for TelegramNotifier {
    #[instrument(name = "TelegramNotifier::send", skip_all, fields(uid = context.uid))]
    async fn send(
        &self,
        code: &str,
        context: &DeliveryContext,
        shutdown: &Shutdown,
    ) -> Result<Delivery> {
        let payload = json!({ "chat_id": self.chat_id, "text": code });
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self.call::<SentMessage>("sendMessage", &payload).await {
                Ok(sent) => {
                    let message_id = sent.map(|m| m.message_id);
                    debug!(code, ?message_id, "Chat API accepted message");
                    return Ok(Delivery {
                        message_id,
                        attempts: attempt,
                    });
                }
                Err(Failure::Rejected {
                    status,
                    description,
                }) => {
                    return Err(Error::DeliveryRejected {
                        status: status.as_u16(),
                        description,
                    });
                }
                Err(Failure::Transient(reason)) => {
                    if attempt >= max_attempts {
                        return Err(Error::DeliveryFailed {
                            attempts: attempt,
                            reason,
                        });
                    }

                    let delay = self.retry_delay(attempt);
                    warn!(
                        attempt,
                        max_attempts,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        reason = %reason,
                        "Delivery attempt failed, retrying"
                    );

                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        () = shutdown.cancelled() => {
                            return Err(Error::DeliveryInterrupted { attempts: attempt });
                        }
                    }
                }
            }
        }
    }

    #[instrument(name = "TelegramNotifier::expire", skip(self))]
    async fn expire(&self, message_id: i64) -> Result<()> {
        let payload = json!({
            "chat_id": self.chat_id,
            "message_id": message_id,
            "text": EXPIRED_TEXT,
            "parse_mode": "Markdown",
        });

        match self
            .call::<serde_json::Value>("editMessageText", &payload)
            .await
        {
            Ok(_) => {
                info!("Marked message as expired");
                Ok(())
            }
            Err(Failure::Rejected {
                status,
                description,
            }) if status == StatusCode::BAD_REQUEST
                && description.contains("message is not modified") =>
            {
                warn!("Message was already marked as expired");
                Ok(())
            }
            Err(Failure::Rejected {
                status,
                description,
            }) => Err(Error::DeliveryRejected {
                status: status.as_u16(),
                description,
            }),
            Err(Failure::Transient(reason)) => Err(Error::DeliveryFailed {
                attempts: 1,
                reason,
            }),
        }
    }
}

impl std::fmt::Debug for TelegramNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramNotifier")
            .field("api_url", &self.api_url)
            .field("bot_token", &"[REDACTED]")
            .field("chat_id", &self.chat_id)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    const TOKEN: &str = "123456:SECRET-token";

    // ─────────────────────────────────────────────────────────────────────────
    // Stub Bot API
    // ─────────────────────────────────────────────────────────────────────────

    /// Serves one scripted response per connection and records each request.
    async fn stub_api(responses: Vec<(u16, &'static str)>) -> (String, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&requests);

        tokio::spawn(async move {
            for (status, body) in responses {
                let (mut socket, _) = listener.accept().await.unwrap();
                let request = read_request(&mut socket).await;
                recorded.lock().unwrap().push(request);
                let response = format!(
                    "HTTP/1.1 {status} Stub\r\ncontent-type: application/json\r\n\
                     content-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                socket.write_all(response.as_bytes()).await.unwrap();
                let _ = socket.shutdown().await;
            }
        });

        (format!("http://{addr}"), requests)
    }

    async fn read_request(socket: &mut TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let n = socket.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
            if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                let head = String::from_utf8_lossy(&buf[..end]).to_lowercase();
                let length = head
                    .lines()
                    .find_map(|line| line.strip_prefix("content-length:"))
                    .and_then(|value| value.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if buf.len() >= end + 4 + length {
                    break;
                }
            }
        }
        String::from_utf8_lossy(&buf).into_owned()
    }

    fn notifier(api_url: &str, max_attempts: u32, retry_delay: Duration) -> TelegramNotifier {
        let config = RelayConfig::builder()
            .email("watcher@example.com")
            .password("secret")
            .allowed_sender("sender@example.com")
            .bot_token(TOKEN)
            .chat_id("-100200")
            .telegram_api_url(api_url)
            .delivery(DeliveryConfig {
                request_timeout: Duration::from_secs(5),
                max_attempts,
                retry_delay,
            })
            .build()
            .unwrap();
        TelegramNotifier::new(&config).unwrap()
    }

    fn context() -> DeliveryContext {
        DeliveryContext {
            uid: 9,
            received_at: Utc::now(),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // send
    // ─────────────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_send_retries_server_error_then_succeeds() {
        let (url, requests) = stub_api(vec![
            (500, r#"{"ok":false,"description":"Internal"}"#),
            (200, r#"{"ok":true,"result":{"message_id":77}}"#),
        ])
        .await;
        let (_trigger, shutdown) = crate::shutdown::channel();

        let delivery = notifier(&url, 5, Duration::from_millis(10))
            .send("482917", &context(), &shutdown)
            .await
            .unwrap();

        assert_eq!(
            delivery,
            Delivery {
                message_id: Some(77),
                attempts: 2
            }
        );
        let requests = requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        assert!(requests[1].starts_with(&format!("POST /bot{TOKEN}/sendMessage ")));
        assert!(requests[1].contains(r#""text":"482917""#));
        assert!(requests[1].contains(r#""chat_id":"-100200""#));
    }

    #[tokio::test]
    async fn test_api_rejection_is_not_retried() {
        let (url, requests) = stub_api(vec![(
            400,
            r#"{"ok":false,"error_code":400,"description":"Bad Request: chat not found"}"#,
        )])
        .await;
        let (_trigger, shutdown) = crate::shutdown::channel();

        let err = notifier(&url, 5, Duration::from_millis(10))
            .send("482917", &context(), &shutdown)
            .await
            .unwrap_err();

        match &err {
            Error::DeliveryRejected {
                status,
                description,
            } => {
                assert_eq!(*status, 400);
                assert!(description.contains("chat not found"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!err.is_retryable());
        assert_eq!(requests.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_ok_false_with_success_status_is_rejection() {
        let (url, _requests) =
            stub_api(vec![(200, r#"{"ok":false,"description":"Forbidden"}"#)]).await;
        let (_trigger, shutdown) = crate::shutdown::channel();

        let err = notifier(&url, 5, Duration::from_millis(10))
            .send("1", &context(), &shutdown)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DeliveryRejected { status: 200, .. }));
    }

    #[tokio::test]
    async fn test_exhausted_retries_report_attempts_without_token() {
        let (url, requests) = stub_api(vec![
            (503, "unavailable"),
            (429, r#"{"ok":false,"description":"Too Many Requests"}"#),
            (502, ""),
        ])
        .await;
        let (_trigger, shutdown) = crate::shutdown::channel();

        let err = notifier(&url, 3, Duration::from_millis(5))
            .send("482917", &context(), &shutdown)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::DeliveryFailed { attempts: 3, .. }));
        assert!(err.is_retryable());
        assert!(!err.to_string().contains("SECRET"));
        assert_eq!(requests.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_transport_error_is_retried_and_hides_token() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);
        let (_trigger, shutdown) = crate::shutdown::channel();

        let err = notifier(&url, 2, Duration::from_millis(5))
            .send("482917", &context(), &shutdown)
            .await
            .unwrap_err();

        match err {
            Error::DeliveryFailed { attempts, reason } => {
                assert_eq!(attempts, 2);
                assert!(!reason.contains("SECRET"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_shutdown_cuts_retry_wait() {
        let (url, requests) = stub_api(vec![(500, "{}"), (200, "{}")]).await;
        let (trigger, shutdown) = crate::shutdown::channel();
        trigger.trigger();

        let started = std::time::Instant::now();
        let err = notifier(&url, 5, Duration::from_secs(60))
            .send("482917", &context(), &shutdown)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::DeliveryInterrupted { attempts: 1 }));
        assert!(started.elapsed() < Duration::from_secs(30));
        assert_eq!(requests.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_retry_delay_doubles() {
        let notifier = notifier("http://localhost", 5, Duration::from_secs(1));
        assert_eq!(notifier.retry_delay(1), Duration::from_secs(1));
        assert_eq!(notifier.retry_delay(2), Duration::from_secs(2));
        assert_eq!(notifier.retry_delay(4), Duration::from_secs(8));
    }

    // ─────────────────────────────────────────────────────────────────────────
    // expire
    // ─────────────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_expire_edits_message() {
        let (url, requests) = stub_api(vec![(200, r#"{"ok":true,"result":true}"#)]).await;

        notifier(&url, 1, Duration::from_millis(5))
            .expire(77)
            .await
            .unwrap();

        let requests = requests.lock().unwrap();
        assert!(requests[0].starts_with(&format!("POST /bot{TOKEN}/editMessageText ")));
        assert!(requests[0].contains(r#""message_id":77"#));
        assert!(requests[0].contains(EXPIRED_TEXT));
    }

    #[tokio::test]
    async fn test_expire_tolerates_unmodified_message() {
        let (url, _requests) = stub_api(vec![
            (
                400,
                r#"{"ok":false,"description":"Bad Request: message is not modified"}"#,
            ),
            (
                400,
                r#"{"ok":false,"description":"Bad Request: message to edit not found"}"#,
            ),
        ])
        .await;
        let notifier = notifier(&url, 1, Duration::from_millis(5));

        assert!(notifier.expire(77).await.is_ok());
        assert!(matches!(
            notifier.expire(78).await,
            Err(Error::DeliveryRejected { status: 400, .. })
        ));
    }

    #[test]
    fn test_debug_redacts_token() {
        let debug_str = format!("{:?}", notifier("http://localhost", 1, Duration::ZERO));
        assert!(!debug_str.contains("SECRET"));
    }
}

//! Live tests against a real IMAP server and Telegram bot.
//!
//! Disabled by default. To run them:
//!
//! ```bash
//! export OTP_RELAY_TEST_EMAIL="your@email.com"
//! export OTP_RELAY_TEST_PASSWORD="your-app-password"
//! export OTP_RELAY_TEST_SENDER="noreply@service.example"
//!
//! # Optional: proxy configuration
//! export OTP_RELAY_TEST_PROXY_HOST="proxy.example.com"
//! export OTP_RELAY_TEST_PROXY_PORT="1080"
//!
//! # Optional: delivery to a real chat
//! export OTP_RELAY_TEST_BOT_TOKEN="123456:ABC"
//! export OTP_RELAY_TEST_CHAT_ID="-1001234567890"
//!
//! cargo test --features integration-tests -- --ignored
//! ```

use chrono::Utc;
use otp_relay::{
    DeliveryContext, ImapMailbox, MailboxSession, Notification, Notifier, RelayConfig,
    Socks5Proxy, TelegramNotifier,
};
use std::env;
use std::time::Duration;

// ─────────────────────────────────────────────────────────────────────────────
// Test Configuration Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn test_proxy() -> Option<Socks5Proxy> {
    let host = env::var("OTP_RELAY_TEST_PROXY_HOST").ok()?;
    let port: u16 = env::var("OTP_RELAY_TEST_PROXY_PORT").ok()?.parse().ok()?;

    let proxy = match (
        env::var("OTP_RELAY_TEST_PROXY_USER").ok(),
        env::var("OTP_RELAY_TEST_PROXY_PASS").ok(),
    ) {
        (Some(user), Some(pass)) => Socks5Proxy::with_auth(&host, port, user, pass),
        _ => Socks5Proxy::new(host, port),
    };

    Some(proxy)
}

fn test_config() -> Option<RelayConfig> {
    dotenvy::dotenv().ok();
    let email = env::var("OTP_RELAY_TEST_EMAIL").ok()?;
    let password = env::var("OTP_RELAY_TEST_PASSWORD").ok()?;
    let sender = env::var("OTP_RELAY_TEST_SENDER").unwrap_or_else(|_| email.clone());

    let mut builder = RelayConfig::builder()
        .email(email)
        .password(password)
        .allowed_sender(sender)
        .bot_token(env::var("OTP_RELAY_TEST_BOT_TOKEN").unwrap_or_else(|_| "0:unused".into()))
        .chat_id(env::var("OTP_RELAY_TEST_CHAT_ID").unwrap_or_else(|_| "0".into()))
        .idle_timeout(Duration::from_secs(5));

    if let Some(proxy) = test_proxy() {
        builder = builder.proxy(proxy);
    }

    builder.build().ok()
}

// ─────────────────────────────────────────────────────────────────────────────
// Mailbox Tests
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
#[ignore = "requires real IMAP server"]
async fn test_connect_select_and_close() {
    let config = test_config().expect("Test config from environment variables");
    let folder = config.folder.clone();
    let mut mailbox = ImapMailbox::new(config);

    mailbox.connect().await.expect("Failed to connect");
    assert!(mailbox.is_connected());

    let status = mailbox
        .select_folder(&folder)
        .await
        .expect("Failed to select folder");
    println!("Selected {folder}: {status:?}");

    mailbox.close().await;
    assert!(!mailbox.is_connected());
}

#[tokio::test]
#[ignore = "requires real IMAP server"]
async fn test_fetch_unseen_from_sender() {
    let config = test_config().expect("Test config from environment variables");
    let folder = config.folder.clone();
    let mut mailbox = ImapMailbox::new(config);

    mailbox.connect().await.expect("Failed to connect");
    mailbox
        .select_folder(&folder)
        .await
        .expect("Failed to select folder");

    let records = mailbox
        .fetch_unseen_since(0)
        .await
        .expect("Failed to fetch");
    assert!(records.windows(2).all(|pair| pair[0].uid < pair[1].uid));
    println!("Found {} unseen message(s) from the sender", records.len());

    mailbox.close().await;
}

#[tokio::test]
#[ignore = "requires real IMAP server"]
async fn test_idle_times_out_or_reports_activity() {
    let config = test_config().expect("Test config from environment variables");
    let folder = config.folder.clone();
    let mut mailbox = ImapMailbox::new(config);
    let (_trigger, shutdown) = otp_relay::shutdown::channel();

    mailbox.connect().await.expect("Failed to connect");
    mailbox
        .select_folder(&folder)
        .await
        .expect("Failed to select folder");

    match mailbox
        .await_notification(Duration::from_secs(5), &shutdown)
        .await
    {
        Notification::TimedOut | Notification::NewActivity => {}
        other => panic!("unexpected notification: {other:?}"),
    }

    mailbox.close().await;
}

// ─────────────────────────────────────────────────────────────────────────────
// Error Handling Tests
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
#[ignore = "requires intentionally wrong credentials"]
async fn test_invalid_credentials() {
    let config = RelayConfig::builder()
        .email("test@gmail.com")
        .password("wrong-password")
        .allowed_sender("noreply@service.example")
        .bot_token("0:unused")
        .chat_id("0")
        .build()
        .expect("valid config structure");

    let mut mailbox = ImapMailbox::new(config);
    let err = mailbox.connect().await.unwrap_err();

    println!("Connection error: {err}");
    println!("Category: {}", err.category());
    assert!(err.is_retryable());
}

// ─────────────────────────────────────────────────────────────────────────────
// Delivery Tests
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
#[ignore = "requires real Telegram bot"]
async fn test_send_and_expire_code() {
    let config = test_config().expect("Test config from environment variables");
    let notifier = TelegramNotifier::new(&config).expect("notifier");
    let (_trigger, shutdown) = otp_relay::shutdown::channel();

    let context = DeliveryContext {
        uid: 0,
        received_at: Utc::now(),
    };
    let delivery = notifier
        .send("000000", &context, &shutdown)
        .await
        .expect("Failed to deliver");
    assert_eq!(delivery.attempts, 1);

    let message_id = delivery.message_id.expect("message id in response");
    notifier.expire(message_id).await.expect("Failed to expire");
}

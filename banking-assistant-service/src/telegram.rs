use async_trait::async_trait;
use banking_flow::{FlowError, MessagingGateway, Result, RetryPolicy};
use reqwest::StatusCode;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::models::{SendMessageRequest, TelegramApiResponse};

/// Longest text the Bot API accepts in one message
pub const MAX_MESSAGE_CHARS: usize = 4096;
const TRUNCATION_MARKER: &str = "…";
/// Upper bound on a server-requested pause before the next attempt
const MAX_RETRY_AFTER: Duration = Duration::from_secs(30);

/// Sends replies with the Telegram Bot API `sendMessage` method
pub struct TelegramGateway {
    client: reqwest::Client,
    send_message_url: String,
    retry: RetryPolicy,
}

impl TelegramGateway {
    pub fn new(api_base: &str, bot_token: &str, retry: RetryPolicy) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| FlowError::DeliveryFailed(format!("could not build HTTP client: {e}")))?;

        Ok(Self {
            client,
            send_message_url: format!(
                "{}/bot{}/sendMessage",
                api_base.trim_end_matches('/'),
                bot_token
            ),
            retry,
        })
    }

    async fn send_once(&self, chat_id: &str, text: &str) -> Result<()> {
        let response = self
            .client
            .post(&self.send_message_url)
            .json(&SendMessageRequest { chat_id, text })
            .send()
            .await
            .map_err(|e| FlowError::UpstreamUnavailable(format!("sendMessage failed: {e}")))?;

        let status = response.status();
        let body = response.json::<TelegramApiResponse>().await.ok();

        let outcome = classify_response(status, body.as_ref());
        if let Outcome::RetryAfter(pause) = &outcome {
            warn!(
                chat_id = %chat_id,
                retry_after_secs = pause.as_secs(),
                "Telegram rate limit hit"
            );
        }
        outcome.into_result(status)
    }
}

#[async_trait]
impl MessagingGateway for TelegramGateway {
    async fn send(&self, chat_id: &str, text: &str) -> Result<()> {
        let text = truncate_message(text);
        let text = text.as_str();

        self.retry
            .run("telegram_send_message", move || self.send_once(chat_id, text))
            .await?;
        debug!(chat_id = %chat_id, "Reply delivered");
        Ok(())
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Outcome {
    Delivered,
    RetryAfter(Duration),
    Transient,
    Rejected(String),
}

impl Outcome {
    /// The retry loop does the waiting, so a rate limit only carries its pause
    fn into_result(self, status: StatusCode) -> Result<()> {
        match self {
            Outcome::Delivered => Ok(()),
            Outcome::RetryAfter(retry_after) => Err(FlowError::RateLimited { retry_after }),
            Outcome::Transient => Err(FlowError::UpstreamUnavailable(format!(
                "sendMessage returned {status}"
            ))),
            Outcome::Rejected(description) => Err(FlowError::DeliveryFailed(format!(
                "sendMessage returned {status}: {description}"
            ))),
        }
    }
}

fn classify_response(status: StatusCode, body: Option<&TelegramApiResponse>) -> Outcome {
    if status.is_success() && body.is_none_or(|body| body.ok) {
        return Outcome::Delivered;
    }

    if status == StatusCode::TOO_MANY_REQUESTS {
        let pause = body
            .and_then(|body| body.parameters.as_ref())
            .and_then(|parameters| parameters.retry_after)
            .map(Duration::from_secs)
            .unwrap_or_default()
            .min(MAX_RETRY_AFTER);
        return Outcome::RetryAfter(pause);
    }

    if status.is_server_error() {
        return Outcome::Transient;
    }

    Outcome::Rejected(
        body.and_then(|body| body.description.clone())
            .unwrap_or_else(|| "no description".to_string()),
    )
}

/// Cut a reply down to what one message can carry, on a char boundary
pub fn truncate_message(text: &str) -> String {
    if text.chars().count() <= MAX_MESSAGE_CHARS {
        return text.to_string();
    }
    let keep = MAX_MESSAGE_CHARS - TRUNCATION_MARKER.chars().count();
    let mut truncated: String = text.chars().take(keep).collect();
    truncated.push_str(TRUNCATION_MARKER);
    truncated
}

/// Used when no bot token is configured: replies only show up in the logs
pub struct LoggingGateway;

#[async_trait]
impl MessagingGateway for LoggingGateway {
    async fn send(&self, chat_id: &str, text: &str) -> Result<()> {
        info!(chat_id = %chat_id, reply = %text, "Reply (no Telegram token configured)");
        Ok(())
    }
}

//! Pushover HTTP notifier
//!
//! One form POST per message to the Pushover messages API. The reply body is
//! JSON with `"status": 1` on success; anything else is treated as an error
//! reply, and a body that is not JSON at all as malformed.

use crate::domain::errors::NotifierError;
use crate::services::dispatcher::{Credentials, Notifier, NotifierReply, ReplyStatus};
use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Deserialize)]
struct PushoverResponse {
    status: Option<i64>,
    #[serde(default)]
    errors: Vec<String>,
}

/// Classify a Pushover reply body
pub fn parse_reply(body: &str) -> NotifierReply {
    let status = match serde_json::from_str::<PushoverResponse>(body) {
        Ok(PushoverResponse { status: Some(1), .. }) => ReplyStatus::Ok,
        Ok(PushoverResponse { status: Some(_), errors }) => {
            debug!(errors = ?errors, "pushover_error_reply");
            ReplyStatus::Error
        }
        Ok(PushoverResponse { status: None, .. }) | Err(_) => ReplyStatus::Malformed,
    };
    NotifierReply { status, raw: body.to_string() }
}

pub struct PushoverNotifier {
    client: reqwest::Client,
    api_url: String,
}

impl PushoverNotifier {
    pub fn new(api_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        // Create HTTP client once for reuse (connection pooling)
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build Pushover HTTP client")?;
        Ok(Self { client, api_url: api_url.to_string() })
    }
}

#[async_trait]
impl Notifier for PushoverNotifier {
    async fn send(
        &self,
        credentials: &Credentials,
        title: &str,
        body: &str,
    ) -> Result<NotifierReply, NotifierError> {
        let form = [
            ("token", credentials.api_token.as_str()),
            ("user", credentials.user_key.as_str()),
            ("title", title),
            ("message", body),
            ("priority", "0"),
        ];

        let response = self
            .client
            .post(&self.api_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| NotifierError::Request(e.to_string()))?;

        let status = response.status();
        let text = response.text().await.map_err(|e| NotifierError::Request(e.to_string()))?;
        let reply = parse_reply(&text);

        // 4xx replies still carry a JSON error body worth reporting
        if !status.is_success() && reply.status == ReplyStatus::Malformed {
            return Err(NotifierError::HttpStatus { status: status.as_u16() });
        }
        Ok(reply)
    }
}

//! Outbound send capability.
//!
//! The worker only depends on the [`Mailer`] trait. [`HttpMailer`] talks to
//! a Resend-compatible JSON API.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::MailConfig;
use crate::config::secrets::{ExposeSecret, SecretString};
use crate::error::{Error, Result};

#[async_trait]
pub trait Mailer: Send + Sync {
    /// Send one HTML message. Returns the provider's message id.
    async fn send(&self, to: &str, subject: &str, html: &str) -> Result<String>;
}

/// Build the configured mailer. `None` means the send capability is not
/// configured.
pub fn from_config(config: &MailConfig) -> Result<Option<Arc<dyn Mailer>>> {
    match &config.api_key {
        Some(key) => {
            let mailer = HttpMailer::new(&config.api_url, key.clone(), &config.from)?;
            Ok(Some(Arc::new(mailer)))
        }
        None => Ok(None),
    }
}

pub struct HttpMailer {
    client: reqwest::Client,
    api_url: String,
    api_key: SecretString,
    from: String,
}

#[derive(Serialize)]
struct SendRequest<'a> {
    from: &'a str,
    to: [&'a str; 1],
    subject: &'a str,
    html: &'a str,
}

#[derive(Deserialize)]
struct SendResponse {
    id: String,
}

impl HttpMailer {
    pub fn new(api_url: &str, api_key: SecretString, from: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            api_url: api_url.to_string(),
            api_key,
            from: from.to_string(),
        })
    }
}

#[async_trait]
impl Mailer for HttpMailer {
    async fn send(&self, to: &str, subject: &str, html: &str) -> Result<String> {
        let response = self
            .client
            .post(&self.api_url)
            .bearer_auth(self.api_key.expose_secret())
            .json(&SendRequest {
                from: &self.from,
                to: [to],
                subject,
                html,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Delivery(describe_failure(status, &body)));
        }

        let sent: SendResponse = response.json().await?;
        debug!(to, message_id = %sent.id, "mail accepted by provider");
        Ok(sent.id)
    }
}

fn describe_failure(status: StatusCode, body: &str) -> String {
    let body = body.trim();
    if body.is_empty() {
        format!("provider returned {status}")
    } else {
        let snippet: String = body.chars().take(200).collect();
        format!("provider returned {status}: {snippet}")
    }
}

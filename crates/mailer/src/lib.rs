//! Client for the HTTP mail relay that delivers rendered loyalty notifications.

use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// Client for the mail relay's message submission endpoint.
#[derive(Clone)]
pub struct RelayClient {
    http: Client,
    base_url: Url,
    token: Option<String>,
    from: String,
}

impl RelayClient {
    /// Creates a new relay client with the provided configuration.
    pub fn new(base_url: Url, token: Option<String>, from: impl Into<String>, http: Client) -> Self {
        Self {
            http,
            base_url,
            token: token.filter(|token| !token.trim().is_empty()),
            from: from.into(),
        }
    }

    pub fn from_address(&self) -> &str {
        &self.from
    }

    /// Submits one fully rendered message. Any non-2xx answer is a delivery failure.
    pub async fn send(&self, email: &OutboundEmail<'_>) -> Result<SendReceipt, MailError> {
        let url = self.base_url.join("messages")?;
        let body = RelayMessage {
            from: &self.from,
            to: email.to,
            subject: email.subject,
            html: email.html,
        };

        let mut request = self.http.post(url).json(&body);
        if let Some(token) = &self.token {
            request = request.header("Authorization", format!("Bearer {token}"));
        }
        let response = request.send().await?;

        parse_receipt(response).await
    }
}

/// Message handed to the relay.
#[derive(Debug, Clone, Copy)]
pub struct OutboundEmail<'a> {
    pub to: &'a str,
    pub subject: &'a str,
    pub html: &'a str,
}

#[derive(Serialize)]
struct RelayMessage<'a> {
    from: &'a str,
    to: &'a str,
    subject: &'a str,
    html: &'a str,
}

/// Relay acknowledgement. The message id is absent when the relay answers without a body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SendReceipt {
    #[serde(default)]
    pub id: Option<String>,
}

/// Errors produced by the relay client.
#[derive(Debug, Error)]
pub enum MailError {
    #[error("failed to build url: {0}")]
    Url(#[from] url::ParseError),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {status}: {body}")]
    Status { status: StatusCode, body: String },
}

async fn parse_receipt(response: Response) -> Result<SendReceipt, MailError> {
    let status = response.status();
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| String::from("<unavailable>"));
    if !status.is_success() {
        return Err(MailError::Status { status, body });
    }

    Ok(serde_json::from_str(&body).unwrap_or_default())
}

pub mod attachment;
pub mod mime;

use crate::auth::credentials::CredentialStore;
use crate::campaign::plan::MAX_RECIPIENTS_PER_MESSAGE;
use crate::config::GmailConfig;
use async_trait::async_trait;
use attachment::Attachment;
use lettre::address::AddressError;
use lettre::message::Mailbox;
use log::{debug, warn};
use reqwest::{Client, StatusCode};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

const SEND_PATH: &str = "/gmail/v1/users/me/messages/send";
const DEFAULT_API_ERROR: &str = "Failed to send email";

// --- Error Handling ---
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Not authenticated. Please connect your Gmail account.")]
    NotAuthenticated,

    #[error("Gmail rejected the access token: {0}")]
    Unauthorized(String),

    #[error("Too many recipients. Gmail allows maximum {max} recipients per email (got {count}).")]
    TooManyRecipients { count: usize, max: usize },

    #[error("No recipients given for this message")]
    NoRecipients,

    #[error("Failed to parse email address: {0}")]
    Address(#[from] AddressError),

    #[error("Failed to build email message: {0}")]
    MessageBuild(#[from] lettre::error::Error),

    #[error("Attachment '{filename}' has an unusable content type: {reason}")]
    InvalidAttachment { filename: String, reason: String },

    #[error("Failed to render email template: {0}")]
    Template(#[from] crate::template::TemplateError),

    #[error("Network error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Gmail API error ({status}): {message}")]
    Api { status: u16, message: String },
}

impl TransportError {
    /// Absent or rejected credentials; sending cannot continue until the
    /// user reconnects.
    pub fn is_authentication(&self) -> bool {
        matches!(
            self,
            TransportError::NotAuthenticated | TransportError::Unauthorized(_)
        )
    }
}

/// Everything about a message except who it goes to.
#[derive(Debug, Clone, Copy)]
pub struct MailContent<'a> {
    pub from: &'a Mailbox,
    pub subject: &'a str,
    pub html_body: &'a str,
    pub attachments: &'a [Attachment],
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendReceipt {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub thread_id: String,
}

/// Sends one message per call. Implemented by `GmailClient` in production
/// and by fakes in the campaign tests.
#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send_one(&self, to: &str, content: &MailContent<'_>)
        -> Result<SendReceipt, TransportError>;

    async fn send_bulk(
        &self,
        to: &[String],
        content: &MailContent<'_>,
    ) -> Result<SendReceipt, TransportError>;
}

#[derive(Serialize)]
struct SendRequest<'a> {
    raw: &'a str,
}

#[derive(Debug, Default, Deserialize)]
struct ApiErrorEnvelope {
    error: Option<ApiErrorBody>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    message: Option<String>,
}

/// Profile returned by the OpenID userinfo endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct Identity {
    pub sub: String,
    pub email: String,
    #[serde(default)]
    pub name: Option<String>,
}

pub struct GmailClient {
    http_client: Client,
    base_url: String,
    userinfo_url: String,
    credentials: Arc<CredentialStore>,
}

impl GmailClient {
    pub fn new(config: &GmailConfig, credentials: Arc<CredentialStore>) -> Result<Self, TransportError> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self {
            http_client,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            userinfo_url: config.userinfo_url.clone(),
            credentials,
        })
    }

    pub fn credentials(&self) -> &Arc<CredentialStore> {
        &self.credentials
    }

    async fn submit(&self, to: &[String], content: &MailContent<'_>) -> Result<SendReceipt, TransportError> {
        // Checked before building anything so a missing token never costs a request.
        let token = self
            .credentials
            .access_token()
            .ok_or(TransportError::NotAuthenticated)?;

        let message = mime::build_message(to, content)?;
        let raw = mime::encode_raw(&message);

        let url = format!("{}{}", self.base_url, SEND_PATH);
        debug!("Submitting message to {} recipient(s) via {}", to.len(), url);
        let response = self
            .http_client
            .post(&url)
            .bearer_auth(token.expose_secret())
            .json(&SendRequest { raw: &raw })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let envelope: ApiErrorEnvelope = response.json().await.unwrap_or_default();
            let message = envelope
                .error
                .and_then(|e| e.message)
                .unwrap_or_else(|| DEFAULT_API_ERROR.to_string());
            warn!("Gmail API returned {}: {}", status, message);
            if status == StatusCode::UNAUTHORIZED {
                return Err(TransportError::Unauthorized(message));
            }
            return Err(TransportError::Api {
                status: status.as_u16(),
                message,
            });
        }

        Ok(response.json::<SendReceipt>().await?)
    }

    /// Looks up who the stored token belongs to.
    pub async fn fetch_identity(&self) -> Result<Identity, TransportError> {
        let token = self
            .credentials
            .access_token()
            .ok_or(TransportError::NotAuthenticated)?;

        let response = self
            .http_client
            .get(&self.userinfo_url)
            .bearer_auth(token.expose_secret())
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(TransportError::Unauthorized(
                "userinfo request was not authorized".to_string(),
            ));
        }
        if !status.is_success() {
            return Err(TransportError::Api {
                status: status.as_u16(),
                message: "Failed to fetch account profile".to_string(),
            });
        }
        Ok(response.json::<Identity>().await?)
    }
}

#[async_trait]
impl MailTransport for GmailClient {
    async fn send_one(&self, to: &str, content: &MailContent<'_>) -> Result<SendReceipt, TransportError> {
        self.submit(&[to.to_string()], content).await
    }

    async fn send_bulk(
        &self,
        to: &[String],
        content: &MailContent<'_>,
    ) -> Result<SendReceipt, TransportError> {
        if to.len() > MAX_RECIPIENTS_PER_MESSAGE {
            return Err(TransportError::TooManyRecipients {
                count: to.len(),
                max: MAX_RECIPIENTS_PER_MESSAGE,
            });
        }
        self.submit(to, content).await
    }
}

use super::{AuthError, AuthFlow};
use async_trait::async_trait;
use log::{info, warn};
use secrecy::SecretString;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use yup_oauth2::authenticator_delegate::InstalledFlowDelegate;
use yup_oauth2::{AuthorizedUserAuthenticator, InstalledFlowAuthenticator, InstalledFlowReturnMethod};

pub const GMAIL_SEND_SCOPE: &str = "https://www.googleapis.com/auth/gmail.send";

/// Gmail send access plus enough identity to name the account.
pub const SCOPES: [&str; 4] = [GMAIL_SEND_SCOPE, "openid", "email", "profile"];

/// Opens the consent page in the user's browser instead of printing it.
struct BrowserDelegate;

impl InstalledFlowDelegate for BrowserDelegate {
    fn present_user_url<'a>(
        &'a self,
        url: &'a str,
        _need_code: bool,
    ) -> Pin<Box<dyn Future<Output = Result<String, String>> + Send + 'a>> {
        Box::pin(async move {
            if let Err(e) = webbrowser::open(url) {
                warn!("Could not open a browser ({}); visit this URL to continue: {}", e, url);
            }
            // The HTTP redirect delivers the code, nothing to return here.
            Ok(String::new())
        })
    }
}

/// Browser consent with a local redirect listener receiving the callback.
pub struct InteractiveRedirectFlow {
    client_secret_path: PathBuf,
    token_cache_path: PathBuf,
}

impl InteractiveRedirectFlow {
    pub fn new(client_secret_path: PathBuf, token_cache_path: PathBuf) -> Self {
        InteractiveRedirectFlow {
            client_secret_path,
            token_cache_path,
        }
    }
}

#[async_trait]
impl AuthFlow for InteractiveRedirectFlow {
    fn name(&self) -> &'static str {
        "interactive redirect"
    }

    async fn authorize(&self) -> Result<SecretString, AuthError> {
        let secret = yup_oauth2::read_application_secret(&self.client_secret_path)
            .await
            .map_err(|e| AuthError::Secret {
                path: self.client_secret_path.display().to_string(),
                source: e,
            })?;

        let authenticator =
            InstalledFlowAuthenticator::builder(secret, InstalledFlowReturnMethod::HTTPRedirect)
                .persist_tokens_to_disk(self.token_cache_path.clone())
                .flow_delegate(Box::new(BrowserDelegate))
                .build()
                .await
                .map_err(AuthError::Setup)?;

        info!("Requesting Gmail consent through the browser");
        let token = authenticator.token(&SCOPES).await?;
        token
            .token()
            .map(|t| SecretString::from(t.to_string()))
            .ok_or(AuthError::MissingToken)
    }
}

/// Credentials the platform already holds for the user, e.g. gcloud
/// application-default credentials.
pub struct PlatformIdentityFlow {
    authorized_user_path: PathBuf,
}

impl PlatformIdentityFlow {
    pub fn new(authorized_user_path: PathBuf) -> Self {
        PlatformIdentityFlow {
            authorized_user_path,
        }
    }
}

#[async_trait]
impl AuthFlow for PlatformIdentityFlow {
    fn name(&self) -> &'static str {
        "platform identity"
    }

    async fn authorize(&self) -> Result<SecretString, AuthError> {
        let secret = yup_oauth2::read_authorized_user_secret(&self.authorized_user_path)
            .await
            .map_err(|e| AuthError::Secret {
                path: self.authorized_user_path.display().to_string(),
                source: e,
            })?;

        let authenticator = AuthorizedUserAuthenticator::builder(secret)
            .build()
            .await
            .map_err(AuthError::Setup)?;

        info!("Exchanging platform credentials for a Gmail token");
        let token = authenticator.token(&SCOPES).await?;
        token
            .token()
            .map(|t| SecretString::from(t.to_string()))
            .ok_or(AuthError::MissingToken)
    }
}

pub mod credentials;
pub mod flows;

use crate::config::{AuthFlowKind, OAuthConfig};
use crate::gmail::{GmailClient, TransportError};
use async_trait::async_trait;
use credentials::{CredentialStore, StoreError};
use lettre::address::AddressError;
use lettre::message::Mailbox;
use flows::{InteractiveRedirectFlow, PlatformIdentityFlow};
use log::info;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Failed to read OAuth secret '{path}': {source}")]
    Secret {
        path: String,
        source: std::io::Error,
    },
    #[error("Failed to set up the OAuth authenticator: {0}")]
    Setup(std::io::Error),
    #[error("OAuth error: {0}")]
    OAuth(#[from] yup_oauth2::Error),
    #[error("The OAuth provider returned no access token")]
    MissingToken,
    #[error("Failed to store credentials: {0}")]
    Store(#[from] StoreError),
    #[error("Failed to look up the connected account: {0}")]
    Identity(#[from] TransportError),
}

/// A Gmail account that can be picked as the sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub email: String,
    pub name: String,
}

impl Account {
    /// The From mailbox. lettre quotes the display name when it needs it.
    pub fn mailbox(&self) -> Result<Mailbox, AddressError> {
        let name = Some(self.name.trim())
            .filter(|name| !name.is_empty())
            .map(str::to_string);
        Ok(Mailbox::new(name, self.email.parse()?))
    }

    /// `Name <email>` as shown in the account picker.
    pub fn label(&self) -> String {
        if self.name.is_empty() {
            self.email.clone()
        } else {
            format!("{} <{}>", self.name, self.email)
        }
    }
}

/// The accounts offered when demo mode is on.
pub fn demo_accounts() -> Vec<Account> {
    vec![
        Account {
            id: "1".to_string(),
            email: "demo@gmail.com".to_string(),
            name: "Demo Account".to_string(),
        },
        Account {
            id: "2".to_string(),
            email: "test@gmail.com".to_string(),
            name: "Test Account".to_string(),
        },
    ]
}

/// How an access token is obtained. Picked once at startup.
#[async_trait]
pub trait AuthFlow: Send + Sync {
    fn name(&self) -> &'static str;

    async fn authorize(&self) -> Result<SecretString, AuthError>;
}

pub fn flow_for(config: &OAuthConfig) -> Box<dyn AuthFlow> {
    match config.flow {
        AuthFlowKind::InteractiveRedirect => Box::new(InteractiveRedirectFlow::new(
            config.client_secret_path.clone(),
            config.token_cache_path(),
        )),
        AuthFlowKind::PlatformIdentity => {
            Box::new(PlatformIdentityFlow::new(config.authorized_user_path()))
        }
    }
}

/// Runs the flow, stores the token, and records and selects the account it
/// belongs to.
pub async fn connect_account(
    flow: &dyn AuthFlow,
    store: &CredentialStore,
    client: &GmailClient,
) -> Result<Account, AuthError> {
    info!("Connecting a Gmail account via {}", flow.name());
    let token = flow.authorize().await?;
    store.set_access_token(token)?;

    let identity = client.fetch_identity().await?;
    let account = Account {
        name: identity.name.unwrap_or_else(|| identity.email.clone()),
        id: identity.sub,
        email: identity.email,
    };
    store.add_account(account.clone())?;
    store.select_account(&account.id)?;
    Ok(account)
}

use crate::auth::credentials::{FileStore, KeyValueStore, KeyringStore, MemoryStore, StoreError};
use crate::campaign::settings::CampaignConfig;
use config::{Config, ConfigError, Environment, File}; // Use the config crate
use directories_next::{BaseDirs, ProjectDirs};
use serde::Deserialize;
use std::path::PathBuf;

const KEYRING_SERVICE: &str = "rapidmail";

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("com", "RapidMail", "rapidmail")
}

/// Falls back to the working directory when no home directory is known.
fn data_file(name: &str) -> PathBuf {
    project_dirs()
        .map(|dirs| dirs.data_dir().join(name))
        .unwrap_or_else(|| PathBuf::from(name))
}

// Gmail REST endpoints
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct GmailConfig {
    pub api_base_url: String,
    pub userinfo_url: String,
    pub request_timeout_secs: u64,
}

impl Default for GmailConfig {
    fn default() -> Self {
        GmailConfig {
            api_base_url: "https://www.googleapis.com".to_string(),
            userinfo_url: "https://openidconnect.googleapis.com/v1/userinfo".to_string(),
            request_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AuthFlowKind {
    #[default]
    InteractiveRedirect,
    PlatformIdentity,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct OAuthConfig {
    pub flow: AuthFlowKind,
    /// Installed-app client secret downloaded from the Google Cloud console.
    pub client_secret_path: PathBuf,
    pub token_cache_path: Option<PathBuf>,
    /// Authorized-user credentials for the platform identity flow.
    pub authorized_user_path: Option<PathBuf>,
}

impl Default for OAuthConfig {
    fn default() -> Self {
        OAuthConfig {
            flow: AuthFlowKind::default(),
            client_secret_path: PathBuf::from("client_secret.json"),
            token_cache_path: None,
            authorized_user_path: None,
        }
    }
}

impl OAuthConfig {
    pub fn token_cache_path(&self) -> PathBuf {
        self.token_cache_path
            .clone()
            .unwrap_or_else(|| data_file("oauth_tokens.json"))
    }

    /// Defaults to gcloud's application-default credentials file.
    pub fn authorized_user_path(&self) -> PathBuf {
        self.authorized_user_path.clone().unwrap_or_else(|| {
            BaseDirs::new()
                .map(|dirs| {
                    dirs.config_dir()
                        .join("gcloud")
                        .join("application_default_credentials.json")
                })
                .unwrap_or_else(|| PathBuf::from("application_default_credentials.json"))
        })
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    File,
    Keyring,
    Memory,
}

// Where the token and connected accounts are kept between sessions
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub path: Option<PathBuf>,
}

impl StorageConfig {
    pub fn open_backend(&self) -> Result<Box<dyn KeyValueStore>, StoreError> {
        Ok(match self.backend {
            StorageBackend::File => {
                let path = self
                    .path
                    .clone()
                    .unwrap_or_else(|| data_file("credentials.json"));
                Box::new(FileStore::open(&path)?)
            }
            StorageBackend::Keyring => Box::new(KeyringStore::new(KEYRING_SERVICE)),
            StorageBackend::Memory => Box::new(MemoryStore::default()),
        })
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AccountsConfig {
    /// Offer the built-in demo accounts in the account picker.
    pub demo: bool,
}

// Structure for sender information
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct SenderConfig {
    /// Optional `Subject:` / `---` / body file preloaded into the composer.
    pub template_path: Option<PathBuf>,
}

// Top-level application configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub gmail: GmailConfig,
    pub oauth: OAuthConfig,
    pub storage: StorageConfig,
    pub accounts: AccountsConfig,
    pub sender: SenderConfig,
    pub campaign: CampaignConfig,
}

impl AppConfig {
    /// Loads configuration from files and environment variables.
    ///
    /// Reads configuration from:
    /// 1. `config.toml` in the working directory (optional)
    /// 2. Environment variables prefixed with `RAPIDMAIL__`
    ///    (e.g., `RAPIDMAIL__CAMPAIGN__BATCH_SIZE=20`)
    pub fn load() -> Result<Self, ConfigError> {
        let builder = Config::builder()
            .add_source(File::with_name("config").required(false))
            .add_source(
                Environment::with_prefix("RAPIDMAIL")
                    .prefix_separator("__")
                    .separator("__"),
            );

        let mut config: AppConfig = builder.build()?.try_deserialize()?;
        config.campaign = config.campaign.clamped();
        Ok(config)
    }
}

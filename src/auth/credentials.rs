use super::Account;
use log::{debug, info, warn};
use secrecy::{ExposeSecret, SecretString};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError, RwLock};
use thiserror::Error;

const TOKEN_KEY: &str = "gmail_access_token";
const ACCOUNTS_KEY: &str = "connected_accounts";
const SELECTED_KEY: &str = "selected_account_id";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Credential file error at '{path}': {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("Stored data is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("OS keyring error: {0}")]
    Keyring(#[from] keyring::Error),
}

/// Durable string key-value persistence behind the credential store.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    fn remove(&self, key: &str) -> Result<(), StoreError>;
}

/// Process-local store, used in tests and for throwaway sessions.
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, String>>,
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(values.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        values.remove(key);
        Ok(())
    }
}

/// A JSON object on disk, rewritten whole on every change.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    values: Mutex<HashMap<String, String>>,
}

impl FileStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let values = match fs::read_to_string(path) {
            Ok(content) if content.trim().is_empty() => HashMap::new(),
            Ok(content) => serde_json::from_str(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                return Err(StoreError::Io {
                    path: path.display().to_string(),
                    source: e,
                })
            }
        };
        debug!("Opened credential file {} ({} keys)", path.display(), values.len());
        Ok(FileStore {
            path: path.to_path_buf(),
            values: Mutex::new(values),
        })
    }

    fn flush(&self, values: &HashMap<String, String>) -> Result<(), StoreError> {
        let io_err = |source| StoreError::Io {
            path: self.path.display().to_string(),
            source,
        };
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let content = serde_json::to_string_pretty(values)?;
        fs::write(&self.path, content).map_err(io_err)
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(values.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        values.insert(key.to_string(), value.to_string());
        self.flush(&values)
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        if values.remove(key).is_some() {
            self.flush(&values)?;
        }
        Ok(())
    }
}

/// One OS keyring entry per key, all under the same service name.
#[derive(Debug, Clone)]
pub struct KeyringStore {
    service: String,
}

impl KeyringStore {
    pub fn new(service: impl Into<String>) -> Self {
        KeyringStore {
            service: service.into(),
        }
    }
}

impl KeyValueStore for KeyringStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let entry = keyring::Entry::new(&self.service, key)?;
        match entry.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        keyring::Entry::new(&self.service, key)?.set_password(value)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        match keyring::Entry::new(&self.service, key)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Bearer token, connected accounts and the last selected account.
///
/// The token is cached in memory after the first read so the transport can
/// ask for it on every send without touching the backend.
pub struct CredentialStore {
    backend: Box<dyn KeyValueStore>,
    token: RwLock<Option<SecretString>>,
}

impl CredentialStore {
    pub fn open(backend: Box<dyn KeyValueStore>) -> Result<Self, StoreError> {
        let token = backend.get(TOKEN_KEY)?.map(SecretString::from);
        if token.is_some() {
            info!("Loaded stored Gmail access token");
        }
        Ok(CredentialStore {
            backend,
            token: RwLock::new(token),
        })
    }

    pub fn access_token(&self) -> Option<SecretString> {
        self.token
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn has_token(&self) -> bool {
        self.token
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub fn set_access_token(&self, token: SecretString) -> Result<(), StoreError> {
        self.backend.set(TOKEN_KEY, token.expose_secret())?;
        *self.token.write().unwrap_or_else(PoisonError::into_inner) = Some(token);
        Ok(())
    }

    pub fn clear_access_token(&self) -> Result<(), StoreError> {
        self.backend.remove(TOKEN_KEY)?;
        *self.token.write().unwrap_or_else(PoisonError::into_inner) = None;
        Ok(())
    }

    pub fn accounts(&self) -> Result<Vec<Account>, StoreError> {
        match self.backend.get(ACCOUNTS_KEY)? {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Ok(Vec::new()),
        }
    }

    /// Adds the account, replacing any stored account with the same id.
    pub fn add_account(&self, account: Account) -> Result<(), StoreError> {
        let mut accounts = self.accounts()?;
        accounts.retain(|existing| existing.id != account.id);
        info!("Connected account {}", account.email);
        accounts.push(account);
        self.backend
            .set(ACCOUNTS_KEY, &serde_json::to_string(&accounts)?)
    }

    pub fn remove_account(&self, id: &str) -> Result<(), StoreError> {
        let mut accounts = self.accounts()?;
        let before = accounts.len();
        accounts.retain(|existing| existing.id != id);
        if accounts.len() == before {
            warn!("Tried to remove unknown account {}", id);
            return Ok(());
        }
        self.backend
            .set(ACCOUNTS_KEY, &serde_json::to_string(&accounts)?)?;
        if self.backend.get(SELECTED_KEY)?.as_deref() == Some(id) {
            self.backend.remove(SELECTED_KEY)?;
        }
        Ok(())
    }

    pub fn select_account(&self, id: &str) -> Result<(), StoreError> {
        self.backend.set(SELECTED_KEY, id)
    }

    pub fn selected_account_id(&self) -> Result<Option<String>, StoreError> {
        self.backend.get(SELECTED_KEY)
    }

    /// The selected account, if it is still among the stored accounts.
    pub fn selected_account(&self) -> Result<Option<Account>, StoreError> {
        let Some(id) = self.selected_account_id()? else {
            return Ok(None);
        };
        Ok(self.accounts()?.into_iter().find(|account| account.id == id))
    }
}

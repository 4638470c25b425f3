#[cfg(test)]
use std::collections::HashMap;
#[cfg(test)]
use std::sync::Arc;

#[cfg(test)]
use parking_lot::Mutex;
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info};

use crate::errors::{AppError, AppResult};

pub const GEMINI_KEY_ACCOUNT: &str = "gemini-api-key";
pub const GOOGLE_MAPS_KEY_ACCOUNT: &str = "google-maps-api-key";

/// Service credentials the pipeline needs at startup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Credential {
    Gemini,
    GoogleMaps,
}

impl Credential {
    pub fn account(&self) -> &'static str {
        match self {
            Credential::Gemini => GEMINI_KEY_ACCOUNT,
            Credential::GoogleMaps => GOOGLE_MAPS_KEY_ACCOUNT,
        }
    }

    pub fn env_var(&self) -> &'static str {
        match self {
            Credential::Gemini => "GEMINI_API_KEY",
            Credential::GoogleMaps => "GOOGLE_MAPS_API_KEY",
        }
    }

    pub fn parse(value: &str) -> AppResult<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "gemini" => Ok(Credential::Gemini),
            "google-maps" | "google_maps" | "maps" => Ok(Credential::GoogleMaps),
            _ => Err(AppError::Config(format!("unknown credential: {value}"))),
        }
    }
}

#[derive(Clone)]
pub struct SecretVault {
    service_name: String,
    backend: SecretBackend,
}

#[derive(Clone)]
enum SecretBackend {
    Keyring,
    #[cfg(test)]
    Memory(Arc<Mutex<HashMap<String, SecretString>>>),
}

impl SecretVault {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            backend: SecretBackend::Keyring,
        }
    }

    #[cfg(test)]
    pub fn in_memory() -> Self {
        Self {
            service_name: "in-memory".to_string(),
            backend: SecretBackend::Memory(Arc::new(Mutex::new(HashMap::new()))),
        }
    }

    pub fn read(&self, credential: Credential) -> AppResult<Option<SecretString>> {
        let account = credential.account();
        let secret = match &self.backend {
            SecretBackend::Keyring => {
                let entry = keyring::Entry::new(&self.service_name, account)?;
                match entry.get_password() {
                    Ok(value) => Some(SecretString::new(value.into())),
                    Err(keyring::Error::NoEntry) => None,
                    Err(err) => return Err(AppError::from(err)),
                }
            }
            #[cfg(test)]
            SecretBackend::Memory(store) => store.lock().get(account).cloned(),
        };
        debug!(
            target: "secret_vault",
            service = %self.service_name,
            account,
            found = secret.is_some(),
            "looked up credential in secure backend"
        );
        Ok(secret.filter(|value| !value.expose_secret().trim().is_empty()))
    }

    pub fn store(&self, credential: Credential, secret: &SecretString) -> AppResult<()> {
        let account = credential.account();
        if secret.expose_secret().trim().is_empty() {
            return Err(AppError::Config(format!("refusing to store empty {account}")));
        }
        match &self.backend {
            SecretBackend::Keyring => {
                let entry = keyring::Entry::new(&self.service_name, account)?;
                entry.set_password(secret.expose_secret().trim())?;
            }
            #[cfg(test)]
            SecretBackend::Memory(store) => {
                store.lock().insert(account.to_string(), secret.clone());
            }
        }
        info!(
            target: "secret_vault",
            service = %self.service_name,
            account,
            "stored credential in secure backend"
        );
        Ok(())
    }
}

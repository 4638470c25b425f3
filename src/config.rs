use std::path::PathBuf;
use std::{env, io};

use secrecy::SecretString;
use serde::Serialize;
use tracing::{debug, warn};

use crate::errors::{AppError, AppResult};
use crate::secrets::{Credential, SecretVault};

/// Monthly ceiling on geocoding requests.
pub const REQUEST_LIMIT: u32 = 9800;

const DEFAULT_GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
const DEFAULT_GEOCODING_ENDPOINT: &str = "https://maps.googleapis.com/maps/api/geocode/json";
const DEFAULT_MODEL: &str = "gemini-2.0-flash";
const DEFAULT_COUNTRY: &str = "JP";
const DEFAULT_ADDRESS_COLUMNS: &[&str] = &["address", "住所", "所在地"];
const DEFAULT_JOURNAL_MAX_BYTES: u64 = 5 * 1024 * 1024;
const DEFAULT_JOURNAL_MAX_FILES: usize = 5;
const MAX_GEOCODE_QPS: u32 = 50;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub quota_file_name: String,
    pub request_limit: u32,
    pub gemini_api_base: String,
    pub geocoding_endpoint: String,
    pub normalize_model: String,
    pub refine_model: String,
    pub country: String,
    pub address_columns: Vec<String>,
    pub http_timeout_secs: u64,
    pub geocode_rate_limit_qps: u32,
    pub journal_enabled: bool,
    pub journal_max_bytes: u64,
    pub journal_max_files: usize,
    pub gemini_api_key: Option<SecretString>,
    pub google_maps_api_key: Option<SecretString>,
}

#[derive(Clone, Debug, Serialize)]
pub struct PublicAppConfig {
    pub data_dir: String,
    pub quota_file_name: String,
    pub request_limit: u32,
    pub gemini_api_base: String,
    pub geocoding_endpoint: String,
    pub normalize_model: String,
    pub refine_model: String,
    pub country: String,
    pub address_columns: Vec<String>,
    pub http_timeout_secs: u64,
    pub geocode_rate_limit_qps: u32,
    pub journal_enabled: bool,
    pub journal_max_bytes: u64,
    pub journal_max_files: usize,
    pub has_gemini_key: bool,
    pub has_google_maps_key: bool,
}

impl AppConfig {
    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        Self {
            data_dir: env::var("GEOCODER_DATA_DIR")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
            quota_file_name: parse_string("QUOTA_FILE_NAME", "request_count.json"),
            request_limit: REQUEST_LIMIT,
            gemini_api_base: parse_string("GEMINI_API_BASE", DEFAULT_GEMINI_API_BASE),
            geocoding_endpoint: parse_string("GOOGLE_GEOCODING_ENDPOINT", DEFAULT_GEOCODING_ENDPOINT),
            normalize_model: parse_string("NORMALIZE_MODEL", DEFAULT_MODEL),
            refine_model: parse_string("REFINE_MODEL", DEFAULT_MODEL),
            country: parse_string("GEOCODE_COUNTRY", DEFAULT_COUNTRY).to_ascii_uppercase(),
            address_columns: parse_list("ADDRESS_COLUMNS", DEFAULT_ADDRESS_COLUMNS),
            http_timeout_secs: parse_u64("HTTP_TIMEOUT_SECS", 30).max(1),
            geocode_rate_limit_qps: parse_u32("GEOCODE_RATE_LIMIT_QPS", 10)
                .clamp(1, MAX_GEOCODE_QPS),
            journal_enabled: parse_bool("JOURNAL_ENABLED", true),
            journal_max_bytes: parse_u64("JOURNAL_MAX_BYTES", DEFAULT_JOURNAL_MAX_BYTES),
            journal_max_files: parse_usize("JOURNAL_MAX_FILES", DEFAULT_JOURNAL_MAX_FILES).max(1),
            gemini_api_key: parse_secret(Credential::Gemini.env_var()),
            google_maps_api_key: parse_secret(Credential::GoogleMaps.env_var()),
        }
    }

    /// Fills credentials missing from the environment with keychain entries.
    /// Keychain failures leave the slot empty; `require_credentials` reports it.
    pub fn resolve_credentials(&mut self, vault: &SecretVault) {
        if self.gemini_api_key.is_none() {
            self.gemini_api_key = read_vault(vault, Credential::Gemini);
        }
        if self.google_maps_api_key.is_none() {
            self.google_maps_api_key = read_vault(vault, Credential::GoogleMaps);
        }
    }

    pub fn require_credentials(&self) -> AppResult<(SecretString, SecretString)> {
        let gemini = self.gemini_api_key.clone().ok_or_else(|| {
            AppError::Config(format!(
                "missing {}; set it or run `store-key gemini`",
                Credential::Gemini.env_var()
            ))
        })?;
        let maps = self.google_maps_api_key.clone().ok_or_else(|| {
            AppError::Config(format!(
                "missing {}; set it or run `store-key google-maps`",
                Credential::GoogleMaps.env_var()
            ))
        })?;
        Ok((gemini, maps))
    }

    pub fn quota_path(&self) -> PathBuf {
        self.data_dir.join(&self.quota_file_name)
    }

    pub fn public_profile(&self) -> PublicAppConfig {
        PublicAppConfig {
            data_dir: self.data_dir.to_string_lossy().to_string(),
            quota_file_name: self.quota_file_name.clone(),
            request_limit: self.request_limit,
            gemini_api_base: self.gemini_api_base.clone(),
            geocoding_endpoint: self.geocoding_endpoint.clone(),
            normalize_model: self.normalize_model.clone(),
            refine_model: self.refine_model.clone(),
            country: self.country.clone(),
            address_columns: self.address_columns.clone(),
            http_timeout_secs: self.http_timeout_secs,
            geocode_rate_limit_qps: self.geocode_rate_limit_qps,
            journal_enabled: self.journal_enabled,
            journal_max_bytes: self.journal_max_bytes,
            journal_max_files: self.journal_max_files,
            has_gemini_key: self.gemini_api_key.is_some(),
            has_google_maps_key: self.google_maps_api_key.is_some(),
        }
    }
}

fn read_vault(vault: &SecretVault, credential: Credential) -> Option<SecretString> {
    match vault.read(credential) {
        Ok(secret) => secret,
        Err(err) => {
            warn!(?err, account = credential.account(), "keychain lookup failed");
            None
        }
    }
}

fn load_dotenv_if_applicable() {
    if !should_load_dotenv() {
        debug!("skipping .env load outside dev mode");
        return;
    }

    if let Err(err) = dotenvy::dotenv() {
        match &err {
            dotenvy::Error::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
            _ => debug!(?err, "unable to load .env file"),
        }
    }
}

fn should_load_dotenv() -> bool {
    cfg!(debug_assertions) || parse_bool("ALLOW_DOTENV", false)
}

fn parse_secret(key: &str) -> Option<SecretString> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .map(|v| SecretString::new(v.into()))
}

fn parse_string(key: &str, default: &str) -> String {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn parse_list(key: &str, default: &[&str]) -> Vec<String> {
    let parsed: Vec<String> = env::var(key)
        .map(|v| {
            v.split(',')
                .map(|item| item.trim().to_string())
                .filter(|item| !item.is_empty())
                .collect()
        })
        .unwrap_or_default();
    if parsed.is_empty() {
        default.iter().map(|item| item.to_string()).collect()
    } else {
        parsed
    }
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

fn parse_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn parse_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
}

fn parse_u32(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(default)
}

/// Fixed configuration for unit tests; never reads the environment.
#[cfg(test)]
pub(crate) fn test_config() -> AppConfig {
    AppConfig {
        data_dir: PathBuf::from("."),
        quota_file_name: "request_count.json".into(),
        request_limit: REQUEST_LIMIT,
        gemini_api_base: DEFAULT_GEMINI_API_BASE.into(),
        geocoding_endpoint: DEFAULT_GEOCODING_ENDPOINT.into(),
        normalize_model: DEFAULT_MODEL.into(),
        refine_model: DEFAULT_MODEL.into(),
        country: DEFAULT_COUNTRY.into(),
        address_columns: vec!["address".into()],
        http_timeout_secs: 5,
        geocode_rate_limit_qps: 10,
        journal_enabled: false,
        journal_max_bytes: DEFAULT_JOURNAL_MAX_BYTES,
        journal_max_files: DEFAULT_JOURNAL_MAX_FILES,
        gemini_api_key: Some(SecretString::new("gm".into())),
        google_maps_api_key: Some(SecretString::new("maps".into())),
    }
}

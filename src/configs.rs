//! Service configuration
//!
//! Settings come from an optional TOML file and are then overridden by
//! `REGISTRATION_SERVICE_*` environment variables. Every value has a default so
//! the service can start with no configuration at all.

use crate::error::DurationParseError;
use crate::generate_csr::SubjectTemplate;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "config.toml";

pub const CA_FILE_ENV_NAME: &str = "REGISTRATION_SERVICE_CA_FILE";
pub const CA_KEY_FILE_ENV_NAME: &str = "REGISTRATION_SERVICE_CA_KEY_FILE";
pub const CERT_EXPIRATION_ENV_NAME: &str = "REGISTRATION_SERVICE_CERT_EXPIRATION";
pub const CERT_COUNTRY_ENV_NAME: &str = "REGISTRATION_SERVICE_CERT_COUNTRY";
pub const CERT_PROVINCE_ENV_NAME: &str = "REGISTRATION_SERVICE_CERT_PROVINCE";
pub const CERT_LOCALITY_ENV_NAME: &str = "REGISTRATION_SERVICE_CERT_LOCALITY";
pub const CERT_ORG_ENV_NAME: &str = "REGISTRATION_SERVICE_CERT_ORG";
pub const CERT_ORG_UNIT_ENV_NAME: &str = "REGISTRATION_SERVICE_CERT_ORG_UNIT";
pub const AUTH_TOKEN_ENV_NAME: &str = "REGISTRATION_SERVICE_AUTH_TOKEN";
pub const HOST_ENV_NAME: &str = "REGISTRATION_SERVICE_HOST";
pub const PORT_ENV_NAME: &str = "REGISTRATION_SERVICE_PORT";
pub const PROJECTID_ENV_NAME: &str = "REGISTRATION_SERVICE_PROJECTID";
pub const LOCATIONID_ENV_NAME: &str = "REGISTRATION_SERVICE_LOCATIONID";
pub const REGISTRYID_ENV_NAME: &str = "REGISTRATION_SERVICE_REGISTRYID";
pub const REGISTRY_EXPIRATION_ENV_NAME: &str = "REGISTRATION_SERVICE_REGISTRY_EXPIRATION";
pub const REGISTRY_ACCESS_TOKEN_ENV_NAME: &str = "REGISTRATION_SERVICE_REGISTRY_ACCESS_TOKEN";

pub const CERT_EXPIRATION_DEFAULT: &str = "1440h";
pub const REGISTRY_EXPIRATION_DEFAULT: &str = "720h";
pub const AUTH_TOKEN_DEFAULT: &str = "awfulsecurity";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub ca: CaConfig,
    #[serde(default)]
    pub certificate: CertificateConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CaConfig {
    #[serde(default = "default_ca_file")]
    pub certificate_path: PathBuf,
    #[serde(default = "default_ca_key_file")]
    pub key_path: PathBuf,
}

impl Default for CaConfig {
    fn default() -> Self {
        Self {
            certificate_path: default_ca_file(),
            key_path: default_ca_key_file(),
        }
    }
}

fn default_ca_file() -> PathBuf {
    PathBuf::from("ca.pem")
}

fn default_ca_key_file() -> PathBuf {
    PathBuf::from("ca-key.pem")
}

/// Lifetime and fixed subject attributes of every issued certificate
#[derive(Debug, Deserialize, Clone)]
pub struct CertificateConfig {
    /// Go-style duration string, e.g. `1440h`
    #[serde(default = "default_cert_expiration")]
    pub expiration: String,
    #[serde(default = "default_country")]
    pub country: String,
    #[serde(default = "default_province")]
    pub province: String,
    #[serde(default = "default_locality")]
    pub locality: String,
    #[serde(default = "default_organization")]
    pub organization: String,
    #[serde(default = "default_organizational_unit")]
    pub organizational_unit: String,
}

impl Default for CertificateConfig {
    fn default() -> Self {
        Self {
            expiration: default_cert_expiration(),
            country: default_country(),
            province: default_province(),
            locality: default_locality(),
            organization: default_organization(),
            organizational_unit: default_organizational_unit(),
        }
    }
}

fn default_cert_expiration() -> String {
    CERT_EXPIRATION_DEFAULT.to_string()
}

fn default_country() -> String {
    "US".to_string()
}

fn default_province() -> String {
    "California".to_string()
}

fn default_locality() -> String {
    "Irvine".to_string()
}

fn default_organization() -> String {
    "Neudesic".to_string()
}

fn default_organizational_unit() -> String {
    "GCP".to_string()
}

impl CertificateConfig {
    /// Resolved certificate lifetime; malformed values fall back to `1440h`
    pub fn expiration(&self) -> Duration {
        duration_or_default("certificate.expiration", &self.expiration, CERT_EXPIRATION_DEFAULT)
    }

    pub fn subject_template(&self) -> SubjectTemplate {
        SubjectTemplate {
            country: self.country.clone(),
            province: self.province.clone(),
            locality: self.locality.clone(),
            organization: self.organization.clone(),
            organizational_unit: self.organizational_unit.clone(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_server_host")]
    pub host: String,
    #[serde(default = "default_server_port")]
    pub port: u16,
    #[serde(default = "default_auth_token")]
    pub auth_token: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_server_host(),
            port: default_server_port(),
            auth_token: default_auth_token(),
        }
    }
}

fn default_server_host() -> String {
    "0.0.0.0".to_string()
}

fn default_server_port() -> u16 {
    8080
}

fn default_auth_token() -> String {
    AUTH_TOKEN_DEFAULT.to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct RegistryConfig {
    #[serde(default = "default_project_id")]
    pub project_id: String,
    #[serde(default = "default_location_id")]
    pub location_id: String,
    #[serde(default = "default_registry_id")]
    pub registry_id: String,
    /// Credential expiry recorded in the registry; `0` disables it
    #[serde(default = "default_registry_expiration")]
    pub expiration: String,
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    #[serde(default = "default_device_base_url")]
    pub device_base_url: String,
    #[serde(default)]
    pub access_token: Option<String>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            project_id: default_project_id(),
            location_id: default_location_id(),
            registry_id: default_registry_id(),
            expiration: default_registry_expiration(),
            api_base_url: default_api_base_url(),
            device_base_url: default_device_base_url(),
            access_token: None,
        }
    }
}

fn default_project_id() -> String {
    "memes-sandbox".to_string()
}

fn default_location_id() -> String {
    "us-central1".to_string()
}

fn default_registry_id() -> String {
    "memes-registry".to_string()
}

fn default_registry_expiration() -> String {
    REGISTRY_EXPIRATION_DEFAULT.to_string()
}

fn default_api_base_url() -> String {
    "https://cloudiot.googleapis.com".to_string()
}

fn default_device_base_url() -> String {
    "https://cloudiotdevice.googleapis.com".to_string()
}

impl RegistryConfig {
    pub fn expiration(&self) -> Duration {
        duration_or_default("registry.expiration", &self.expiration, REGISTRY_EXPIRATION_DEFAULT)
    }

    /// `projects/{p}/locations/{l}/registries/{r}`
    pub fn parent(&self) -> String {
        format!(
            "projects/{}/locations/{}/registries/{}",
            self.project_id, self.location_id, self.registry_id
        )
    }
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let config_str = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: AppConfig =
            toml::from_str(&config_str).context("Failed to parse config file")?;

        Ok(config)
    }

    /// Load from `path` (or `config.toml` when present) and apply environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_PATH))?
            }
            None => Self::default(),
        };
        config.apply_env_overrides(|name| std::env::var(name).ok());
        Ok(config)
    }

    /// Override fields from an environment lookup. Empty values count as unset.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|value| !value.is_empty());

        if let Some(v) = get(CA_FILE_ENV_NAME) {
            self.ca.certificate_path = PathBuf::from(v);
        }
        if let Some(v) = get(CA_KEY_FILE_ENV_NAME) {
            self.ca.key_path = PathBuf::from(v);
        }
        if let Some(v) = get(CERT_EXPIRATION_ENV_NAME) {
            self.certificate.expiration = v;
        }
        if let Some(v) = get(CERT_COUNTRY_ENV_NAME) {
            self.certificate.country = v;
        }
        if let Some(v) = get(CERT_PROVINCE_ENV_NAME) {
            self.certificate.province = v;
        }
        if let Some(v) = get(CERT_LOCALITY_ENV_NAME) {
            self.certificate.locality = v;
        }
        if let Some(v) = get(CERT_ORG_ENV_NAME) {
            self.certificate.organization = v;
        }
        if let Some(v) = get(CERT_ORG_UNIT_ENV_NAME) {
            self.certificate.organizational_unit = v;
        }
        if let Some(v) = get(AUTH_TOKEN_ENV_NAME) {
            self.server.auth_token = v;
        }
        if let Some(v) = get(HOST_ENV_NAME) {
            self.server.host = v;
        }
        if let Some(v) = get(PORT_ENV_NAME) {
            match v.parse() {
                Ok(port) => self.server.port = port,
                Err(e) => tracing::warn!(value = %v, error = %e, "ignoring invalid {PORT_ENV_NAME}"),
            }
        }
        if let Some(v) = get(PROJECTID_ENV_NAME) {
            self.registry.project_id = v;
        }
        if let Some(v) = get(LOCATIONID_ENV_NAME) {
            self.registry.location_id = v;
        }
        if let Some(v) = get(REGISTRYID_ENV_NAME) {
            self.registry.registry_id = v;
        }
        if let Some(v) = get(REGISTRY_EXPIRATION_ENV_NAME) {
            self.registry.expiration = v;
        }
        if let Some(v) = get(REGISTRY_ACCESS_TOKEN_ENV_NAME) {
            self.registry.access_token = Some(v);
        }
    }
}

fn duration_or_default(field: &str, value: &str, default: &str) -> Duration {
    match parse_go_duration(value) {
        Ok(duration) => duration,
        Err(e) => {
            tracing::warn!(field, value, error = %e, default, "invalid duration, using default");
            // The defaults are constants known to parse.
            parse_go_duration(default).unwrap_or_default()
        }
    }
}

/// Parse a Go-style duration such as `1440h`, `1h30m`, `1.5h` or `0`
///
/// Accepted units are `ns`, `us` (`µs`), `ms`, `s`, `m` and `h`. A leading `+`
/// is allowed; negative durations are rejected.
pub fn parse_go_duration(input: &str) -> Result<Duration, DurationParseError> {
    let trimmed = input.trim();
    let mut rest = trimmed.strip_prefix('+').unwrap_or(trimmed);
    if rest.is_empty() {
        return Err(DurationParseError::Empty);
    }
    if rest == "0" {
        return Ok(Duration::ZERO);
    }

    let invalid = || DurationParseError::Invalid(input.to_string());
    let overflow = || DurationParseError::Overflow(input.to_string());

    let mut total_nanos: u128 = 0;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        let (number, tail) = rest.split_at(number_len);
        let unit_len = tail
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(tail.len());
        let (unit, tail) = tail.split_at(unit_len);

        let scale: u128 = match unit {
            "ns" => 1,
            "us" | "µs" | "μs" => 1_000,
            "ms" => 1_000_000,
            "s" => 1_000_000_000,
            "m" => 60 * 1_000_000_000,
            "h" => 3_600 * 1_000_000_000,
            "" => return Err(DurationParseError::MissingUnit(input.to_string())),
            other => {
                return Err(DurationParseError::UnknownUnit {
                    unit: other.to_string(),
                    input: input.to_string(),
                })
            }
        };

        let (whole, fraction) = number.split_once('.').unwrap_or((number, ""));
        if whole.is_empty() && fraction.is_empty() {
            return Err(invalid());
        }
        if fraction.contains('.') {
            return Err(invalid());
        }

        let whole_value: u128 = if whole.is_empty() {
            0
        } else {
            whole.parse().map_err(|_| overflow())?
        };
        let mut component = whole_value.checked_mul(scale).ok_or_else(overflow)?;

        // Digits beyond nanosecond precision of the largest unit do not matter.
        let fraction = &fraction[..fraction.len().min(18)];
        if !fraction.is_empty() {
            let digits = u32::try_from(fraction.len()).map_err(|_| overflow())?;
            let fraction_value: u128 = fraction.parse().map_err(|_| invalid())?;
            component = component
                .checked_add(fraction_value * scale / 10u128.pow(digits))
                .ok_or_else(overflow)?;
        }

        total_nanos = total_nanos.checked_add(component).ok_or_else(overflow)?;
        rest = tail;
    }

    let nanos = u64::try_from(total_nanos).map_err(|_| overflow())?;
    Ok(Duration::from_nanos(nanos))
}

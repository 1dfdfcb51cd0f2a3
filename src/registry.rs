//! Device Registry Module
//!
//! After a certificate is issued the device has to be known to the registry
//! that will authenticate it. The registry is an external service; the core
//! only needs [`DeviceRegistry::register_device`], which takes the device name
//! and certificate PEM and hands back the resource path the device should use.

use crate::configs::RegistryConfig;
use crate::error::RegistryError;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const CLOUD_IOT_API_VERSION: &str = "v1";
const CREDENTIAL_FORMAT: &str = "RSA_X509_PEM";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    /// Register `name` with `certificate_pem` as its credential, returning the
    /// device resource path
    async fn register_device(
        &self,
        name: &str,
        certificate_pem: &str,
    ) -> Result<String, RegistryError>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceResource<'a> {
    pub id: &'a str,
    pub credentials: Vec<DeviceCredential<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceCredential<'a> {
    pub public_key: PublicKeyCredential<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiration_time: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PublicKeyCredential<'a> {
    pub format: &'static str,
    pub key: &'a str,
}

#[derive(Debug, Deserialize)]
struct CreatedDevice {
    name: Option<String>,
}

/// Registry client for the Cloud IoT Core device manager REST API
pub struct CloudIotRegistry {
    client: reqwest::Client,
    config: RegistryConfig,
}

impl CloudIotRegistry {
    pub fn new(config: RegistryConfig) -> Result<Self, RegistryError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self { client, config })
    }

    /// `{api_base}/v1/projects/{p}/locations/{l}/registries/{r}/devices`
    pub fn devices_url(&self) -> String {
        format!(
            "{}/{}/{}/devices",
            self.config.api_base_url.trim_end_matches('/'),
            CLOUD_IOT_API_VERSION,
            self.config.parent()
        )
    }

    /// Device body sent to the registry; the credential expires after the
    /// configured registry expiration unless that is zero
    pub fn device_resource<'a>(
        &self,
        name: &'a str,
        certificate_pem: &'a str,
        now: DateTime<Utc>,
    ) -> DeviceResource<'a> {
        let expiration = self.config.expiration();
        let expiration_time = if expiration.is_zero() {
            None
        } else {
            TimeDelta::from_std(expiration)
                .ok()
                .and_then(|lifetime| now.checked_add_signed(lifetime))
                .map(|at| at.to_rfc3339_opts(SecondsFormat::AutoSi, true))
        };

        DeviceResource {
            id: name,
            credentials: vec![DeviceCredential {
                public_key: PublicKeyCredential {
                    format: CREDENTIAL_FORMAT,
                    key: certificate_pem,
                },
                expiration_time,
            }],
        }
    }

    /// Public path of a created device, e.g.
    /// `https://cloudiotdevice.googleapis.com/v1/projects/.../devices/123`
    pub fn device_path(&self, resource_name: &str) -> String {
        format!(
            "{}/{}/{}",
            self.config.device_base_url.trim_end_matches('/'),
            CLOUD_IOT_API_VERSION,
            resource_name
        )
    }
}

#[async_trait]
impl DeviceRegistry for CloudIotRegistry {
    async fn register_device(
        &self,
        name: &str,
        certificate_pem: &str,
    ) -> Result<String, RegistryError> {
        let body = self.device_resource(name, certificate_pem, Utc::now());
        let mut request = self.client.post(self.devices_url()).json(&body);
        if let Some(token) = &self.config.access_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| {
            tracing::error!(device = name, error = %e, "registry request failed");
            e
        })?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(device = name, %status, "registry rejected device");
            return Err(RegistryError::Rejected {
                device: name.to_string(),
                status: status.as_u16(),
                body,
            });
        }

        let created: CreatedDevice = response.json().await?;
        let resource_name = created.name.ok_or(RegistryError::MissingResourceName)?;
        let path = self.device_path(&resource_name);
        tracing::debug!(device = name, %path, "device created");
        Ok(path)
    }
}

// =============================================================================
// provision.rs - THE DEVICE MIDWIFE
// =============================================================================
//
// Before a fleet can stress a broker it has to exist. This module talks to
// the ThingsBoard REST API and births the devices: log in for a tenant
// JWT, find the default device profile, upsert each device by name, fetch
// its ACCESS_TOKEN credentials, and stamp server-scope attributes so a
// human can later tell batch 2026-08-01 from batch 2026-07-31.
//
// Provisioning failures are fatal by policy: a load test against a
// half-provisioned fleet measures nothing anyone wants measured. Every
// error funnels into ProvisionError and the process exits with code 2.
// =============================================================================

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::models::utcnow;

const PROVISION_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("provisioning requires {0}")]
    MissingConfig(&'static str),
    #[error("ThingsBoard request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("ThingsBoard API error ({status}): {body}")]
    Api { status: u16, body: String },
    #[error("login response contained no JWT token")]
    MissingJwt,
    #[error("device {0} credentials are not of type ACCESS_TOKEN")]
    WrongCredentialType(String),
    #[error("device {0} has an empty credentials id")]
    EmptyCredentials(String),
    #[error("could not write tokens file {path}: {source}")]
    TokenFile {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Everything the provisioner needs to know, resolved from CLI/env by the
/// configuration layer.
pub struct ProvisionSettings {
    pub base_url: String,
    pub username: String,
    pub password: String,
    pub device_prefix: String,
    pub device_count: usize,
    pub device_label: String,
    pub device_type: String,
    pub device_profile_id: Option<String>,
}

#[derive(Deserialize)]
struct LoginResponse {
    token: Option<String>,
}

#[derive(Deserialize)]
struct EntityId {
    id: String,
}

#[derive(Deserialize)]
struct DeviceInfo {
    id: EntityId,
    #[serde(default)]
    name: String,
}

#[derive(Deserialize)]
struct PageData<T> {
    #[serde(default = "Vec::new")]
    data: Vec<T>,
}

#[derive(Deserialize)]
struct ProfileInfo {
    id: EntityId,
    #[serde(default, rename = "default")]
    is_default: bool,
}

#[derive(Deserialize)]
struct CredentialsResponse {
    #[serde(rename = "credentialsType")]
    credentials_type: Option<String>,
    #[serde(rename = "credentialsId")]
    credentials_id: Option<String>,
}

/// Authenticated ThingsBoard client. Short, shared calls; one JWT for the
/// whole provisioning pass.
pub struct ThingsBoardClient {
    base: String,
    http: reqwest::Client,
    jwt: String,
}

impl ThingsBoardClient {
    /// Log in and hold the tenant JWT.
    pub async fn login(settings: &ProvisionSettings) -> Result<Self, ProvisionError> {
        if settings.base_url.is_empty() {
            return Err(ProvisionError::MissingConfig("--tb-url (TB_URL)"));
        }
        if settings.username.is_empty() {
            return Err(ProvisionError::MissingConfig("--tb-username (TB_USERNAME)"));
        }
        if settings.password.is_empty() {
            return Err(ProvisionError::MissingConfig("--tb-password (TB_PASSWORD)"));
        }
        let base = settings.base_url.trim_end_matches('/').to_string();
        let http = reqwest::Client::builder()
            .timeout(PROVISION_TIMEOUT)
            .build()?;
        let response = http
            .post(format!("{base}/api/auth/login"))
            .json(&serde_json::json!({
                "username": settings.username,
                "password": settings.password,
            }))
            .send()
            .await?;
        let response = check(response).await?;
        let login: LoginResponse = response.json().await?;
        let jwt = login.token.ok_or(ProvisionError::MissingJwt)?;
        info!(url = %base, "logged in to ThingsBoard");
        Ok(Self { base, http, jwt })
    }

    fn auth(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request.header("X-Authorization", format!("Bearer {}", self.jwt))
    }

    /// The tenant's default device profile id, if one is marked default.
    pub async fn default_profile(&self) -> Result<Option<String>, ProvisionError> {
        for endpoint in ["deviceProfileInfos", "deviceProfiles"] {
            let response = self
                .auth(self.http.get(format!(
                    "{}/api/{endpoint}?pageSize=100&page=0",
                    self.base
                )))
                .send()
                .await?;
            if !response.status().is_success() {
                continue;
            }
            let page: PageData<ProfileInfo> = response.json().await?;
            if let Some(profile) = page.data.into_iter().find(|p| p.is_default) {
                return Ok(Some(profile.id.id));
            }
        }
        Ok(None)
    }

    /// Create the device, or fetch it if a previous run already did.
    pub async fn upsert_device(
        &self,
        name: &str,
        label: &str,
        device_type: &str,
        profile_id: Option<&str>,
    ) -> Result<String, ProvisionError> {
        let mut payload = serde_json::json!({
            "name": name,
            "label": label,
            "type": device_type,
        });
        if let Some(profile) = profile_id {
            payload["deviceProfileId"] =
                serde_json::json!({ "id": profile, "entityType": "DEVICE_PROFILE" });
        }
        let response = self
            .auth(self.http.post(format!("{}/api/device", self.base)))
            .json(&payload)
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            let device: DeviceInfo = response.json().await?;
            return Ok(device.id.id);
        }
        let body = response.text().await.unwrap_or_default();
        if status.as_u16() == 400 && body.to_lowercase().contains("already") {
            if let Some(existing) = self.find_device(name).await? {
                return Ok(existing);
            }
        }
        Err(ProvisionError::Api {
            status: status.as_u16(),
            body,
        })
    }

    async fn find_device(&self, name: &str) -> Result<Option<String>, ProvisionError> {
        let response = self
            .auth(self.http.get(format!("{}/api/tenant/devices", self.base)))
            .query(&[("deviceName", name)])
            .send()
            .await?;
        if response.status().is_success() {
            let body = response.text().await?;
            if !body.is_empty() && body != "null" {
                if let Ok(device) = serde_json::from_str::<DeviceInfo>(&body) {
                    return Ok(Some(device.id.id));
                }
            }
        }
        let response = self
            .auth(self.http.get(format!("{}/api/tenant/devices", self.base)))
            .query(&[("pageSize", "100"), ("page", "0"), ("textSearch", name)])
            .send()
            .await?;
        if response.status().is_success() {
            let page: PageData<DeviceInfo> = response.json().await?;
            return Ok(page
                .data
                .into_iter()
                .find(|device| device.name == name)
                .map(|device| device.id.id));
        }
        Ok(None)
    }

    /// The device's ACCESS_TOKEN. Any other credential type is a hard
    /// error; the MQTT workers authenticate by token-as-username.
    pub async fn credentials(&self, device_id: &str, name: &str) -> Result<String, ProvisionError> {
        let response = self
            .auth(self.http.get(format!(
                "{}/api/device/{device_id}/credentials",
                self.base
            )))
            .send()
            .await?;
        let response = check(response).await?;
        let credentials: CredentialsResponse = response.json().await?;
        if credentials.credentials_type.as_deref() != Some("ACCESS_TOKEN") {
            return Err(ProvisionError::WrongCredentialType(name.to_string()));
        }
        credentials
            .credentials_id
            .filter(|token| !token.is_empty())
            .ok_or_else(|| ProvisionError::EmptyCredentials(name.to_string()))
    }

    /// Attach server-scope attributes. Best-effort: a missing attribute is
    /// an inconvenience, not a failed fleet.
    pub async fn set_server_attributes(
        &self,
        device_id: &str,
        attrs: &serde_json::Value,
    ) -> Result<(), ProvisionError> {
        let response = self
            .auth(self.http.post(format!(
                "{}/api/plugins/telemetry/DEVICE/{device_id}/SERVER_SCOPE",
                self.base
            )))
            .json(attrs)
            .send()
            .await?;
        if !response.status().is_success() {
            warn!(
                device = device_id,
                status = response.status().as_u16(),
                "could not save server attributes"
            );
        }
        Ok(())
    }
}

async fn check(response: reqwest::Response) -> Result<reqwest::Response, ProvisionError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ProvisionError::Api {
        status: status.as_u16(),
        body,
    })
}

/// Provision the whole fleet and return the (name -> token) map.
pub async fn provision_fleet(
    settings: &ProvisionSettings,
) -> Result<BTreeMap<String, String>, ProvisionError> {
    let client = ThingsBoardClient::login(settings).await?;
    let profile_id = match &settings.device_profile_id {
        Some(id) => Some(id.clone()),
        None => client.default_profile().await?,
    };
    let batch = batch_label(utcnow());
    let mut tokens = BTreeMap::new();
    for index in 0..settings.device_count {
        let name = format!("{}{}", settings.device_prefix, index);
        let device_id = client
            .upsert_device(
                &name,
                &settings.device_label,
                &settings.device_type,
                profile_id.as_deref(),
            )
            .await?;
        let token = client.credentials(&device_id, &name).await?;
        client
            .set_server_attributes(
                &device_id,
                &serde_json::json!({
                    "batch": batch,
                    "group": settings.device_prefix,
                    "index": index,
                }),
            )
            .await?;
        tokens.insert(name, token);
        if (index + 1) % 50 == 0 {
            info!(provisioned = index + 1, total = settings.device_count, "provisioning fleet");
        }
    }
    info!(devices = tokens.len(), "fleet provisioned");
    Ok(tokens)
}

/// Persist the provisioner's output where the token store will read it.
pub fn write_tokens_file(
    path: &Path,
    tokens: &BTreeMap<String, String>,
) -> Result<(), ProvisionError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| ProvisionError::TokenFile {
            path: path.display().to_string(),
            source,
        })?;
    }
    let body = serde_json::to_vec_pretty(tokens).expect("token map serializes");
    std::fs::write(path, body).map_err(|source| ProvisionError::TokenFile {
        path: path.display().to_string(),
        source,
    })
}

fn batch_label(now: DateTime<Utc>) -> String {
    format!("sim-{}", now.format("%Y%m%d"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_batch_label_is_day_scoped() {
        let day = Utc.with_ymd_and_hms(2026, 8, 1, 13, 37, 0).unwrap();
        assert_eq!(batch_label(day), "sim-20260801");
    }

    #[test]
    fn test_tokens_file_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("provisioning").join("tokens.json");
        let mut tokens = BTreeMap::new();
        tokens.insert("sim-0".to_string(), "tok-a".to_string());
        tokens.insert("sim-1".to_string(), "tok-b".to_string());
        write_tokens_file(&path, &tokens).expect("write");

        let loaded = crate::tokens::load_tokens_from_file(&path).expect("load");
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].device_id, "sim-0");
        assert_eq!(loaded[0].token, "tok-a");
    }

    #[test]
    fn test_login_rejects_missing_settings() {
        let settings = ProvisionSettings {
            base_url: String::new(),
            username: "tenant@example.com".to_string(),
            password: "hunter2".to_string(),
            device_prefix: "sim".to_string(),
            device_count: 1,
            device_label: "sim-lab".to_string(),
            device_type: "sensor".to_string(),
            device_profile_id: None,
        };
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let result = runtime.block_on(ThingsBoardClient::login(&settings));
        assert!(matches!(result, Err(ProvisionError::MissingConfig(_))));
    }
}

//! The remote Client System API, as this agent consumes it.
//!
//! Engines depend on the [`RemoteClient`] trait; [`HttpRemoteClient`] is the
//! reqwest implementation with the bearer token injected on every call.

pub mod sync;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::AgentConfig;
use crate::error::RemoteError;

/// Reachability probes get a short leash regardless of the general timeout.
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteTenant {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub street: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub postal_code: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default = "default_true")]
    pub active: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteDeviceModel {
    pub id: String,
    pub manufacturer: String,
    pub model_number: String,
    #[serde(rename = "type")]
    pub device_type: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteRegister {
    pub id: String,
    pub device_model_id: String,
    pub register_number: i32,
    pub field_name: String,
    pub unit: String,
    pub data_type: String,
    pub bacnet_object_type: u16,
    pub bacnet_instance: u32,
    pub property: u32,
    /// Some deployments embed the owning device model; mirrored when present.
    #[serde(default)]
    pub device_model: Option<RemoteDeviceModel>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteMeterElement {
    pub element_id: i32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteMeter {
    pub meter_id: String,
    pub name: String,
    pub ip: String,
    pub port: u16,
    #[serde(default = "default_true")]
    pub active: bool,
    pub device_model_id: String,
    pub tenant_id: String,
    #[serde(default)]
    pub location_id: Option<String>,
    #[serde(default)]
    pub elements: Vec<RemoteMeterElement>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteDeviceRegister {
    pub device_model_id: String,
    pub register_id: String,
}

/// One reading in the bulk upload body.
#[derive(Debug, Clone, Serialize)]
pub struct ReadingUpload {
    pub meter_id: String,
    pub element_id: i32,
    pub timestamp: DateTime<Utc>,
    pub data_point: String,
    pub value: f64,
    pub unit: String,
}

#[derive(Serialize)]
struct BulkUploadBody<'a> {
    readings: &'a [ReadingUpload],
}

/// Key that makes re-posting the same claimed batch safe upstream.
pub fn idempotency_key(ids: &[i64]) -> String {
    let mut hasher = blake3::Hasher::new();
    for id in ids {
        hasher.update(&id.to_le_bytes());
    }
    hasher.finalize().to_hex().to_string()
}

#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// Reachability probe; any 2xx counts.
    async fn health(&self) -> Result<(), RemoteError>;

    async fn fetch_tenant(&self) -> Result<RemoteTenant, RemoteError>;

    async fn fetch_registers(&self) -> Result<Vec<RemoteRegister>, RemoteError>;

    /// Meters with their elements included.
    async fn fetch_meters(&self) -> Result<Vec<RemoteMeter>, RemoteError>;

    async fn fetch_device_registers(&self) -> Result<Vec<RemoteDeviceRegister>, RemoteError>;

    async fn upload_readings(
        &self,
        readings: &[ReadingUpload],
        idempotency_key: &str,
    ) -> Result<(), RemoteError>;
}

pub struct HttpRemoteClient {
    base_url: String,
    client: reqwest::Client,
}

impl HttpRemoteClient {
    pub fn new(config: &AgentConfig) -> Result<Self, RemoteError> {
        let mut headers = reqwest::header::HeaderMap::new();
        let mut auth = reqwest::header::HeaderValue::from_str(&format!(
            "Bearer {}",
            config.client_api_key
        ))
        .map_err(|_| RemoteError::Transport("API key is not a valid header value".into()))?;
        auth.set_sensitive(true);
        headers.insert(reqwest::header::AUTHORIZATION, auth);

        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .default_headers(headers)
            .build()
            .map_err(|e| RemoteError::Transport(e.to_string()))?;

        Ok(Self {
            base_url: config.client_api_url.trim_end_matches('/').to_owned(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, RemoteError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(RemoteError::Unauthorized);
        }
        let body = response.text().await.unwrap_or_default();
        let body: String = body.chars().take(512).collect();
        Err(RemoteError::Status {
            status: status.as_u16(),
            body,
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, RemoteError> {
        let response = self
            .client
            .get(self.url(path))
            .send()
            .await
            .map_err(RemoteError::from_reqwest)?;
        Self::check(response)
            .await?
            .json()
            .await
            .map_err(RemoteError::from_reqwest)
    }
}

#[async_trait]
impl RemoteClient for HttpRemoteClient {
    async fn health(&self) -> Result<(), RemoteError> {
        let response = self
            .client
            .get(self.url("/health"))
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await
            .map_err(RemoteError::from_reqwest)?;
        Self::check(response).await.map(|_| ())
    }

    async fn fetch_tenant(&self) -> Result<RemoteTenant, RemoteError> {
        self.get_json("/api/tenant").await
    }

    async fn fetch_registers(&self) -> Result<Vec<RemoteRegister>, RemoteError> {
        self.get_json("/api/registers").await
    }

    async fn fetch_meters(&self) -> Result<Vec<RemoteMeter>, RemoteError> {
        self.get_json("/api/meters?includeElements=true").await
    }

    async fn fetch_device_registers(&self) -> Result<Vec<RemoteDeviceRegister>, RemoteError> {
        self.get_json("/api/device-registers").await
    }

    async fn upload_readings(
        &self,
        readings: &[ReadingUpload],
        idempotency_key: &str,
    ) -> Result<(), RemoteError> {
        let response = self
            .client
            .post(self.url("/api/meter-readings/bulk"))
            .header("Idempotency-Key", idempotency_key)
            .json(&BulkUploadBody { readings })
            .send()
            .await
            .map_err(RemoteError::from_reqwest)?;
        Self::check(response).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idempotency_key_is_stable_and_order_sensitive() {
        let a = idempotency_key(&[1, 2, 3]);
        assert_eq!(a, idempotency_key(&[1, 2, 3]));
        assert_ne!(a, idempotency_key(&[3, 2, 1]));
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn meter_payload_tolerates_missing_optionals() {
        let meter: RemoteMeter = serde_json::from_str(
            r#"{
                "meter_id": "m-10",
                "name": "Main feed",
                "ip": "10.0.0.17",
                "port": 47808,
                "device_model_id": "dm-1",
                "tenant_id": "t-1",
                "elements": [{"element_id": 1}, {"element_id": 2}]
            }"#,
        )
        .unwrap();
        assert!(meter.active);
        assert_eq!(meter.elements.len(), 2);
        assert_eq!(meter.location_id, None);
    }
}

//! API client for the autorange agent

use anyhow::{Context, Result};
use reqwest::{Client, Response, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use url::Url;

/// Per-category settings and learned values, keyed by category name
pub type AutoRange = BTreeMap<String, BTreeMap<String, String>>;

/// API client for the agent HTTP API
pub struct ApiClient {
    client: Client,
    base_url: Url,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        let base_url = Url::parse(base_url).context("Invalid API URL")?;

        Ok(Self { client, base_url })
    }

    /// Make a GET request
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.base_url.join(path).context("Invalid path")?;

        let response = self
            .client
            .get(url)
            .send()
            .await
            .context("Failed to send request")?;

        Self::parse(response).await
    }

    /// Make a POST request without a body
    pub async fn post<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.base_url.join(path).context("Invalid path")?;

        let response = self
            .client
            .post(url)
            .send()
            .await
            .context("Failed to send request")?;

        Self::parse(response).await
    }

    /// Fetch agent health; an unhealthy agent answers 503 with the same body
    pub async fn health(&self) -> Result<HealthResponse> {
        let url = self.base_url.join("healthz").context("Invalid path")?;

        let response = self
            .client
            .get(url)
            .send()
            .await
            .context("Failed to send request")?;

        if response.status() == StatusCode::SERVICE_UNAVAILABLE {
            return response.json().await.context("Failed to parse response");
        }
        Self::parse(response).await
    }

    pub async fn list_watchers(&self) -> Result<WatcherList> {
        self.get("api/v1/watchers").await
    }

    pub async fn get_watcher(&self, workload_id: &str) -> Result<WatcherDetail> {
        self.get(&format!("api/v1/watchers/{}", workload_id)).await
    }

    pub async fn pause_watcher(&self, workload_id: &str) -> Result<ControlResponse> {
        self.post(&format!("api/v1/watchers/{}/pause", workload_id))
            .await
    }

    pub async fn resume_watcher(&self, workload_id: &str) -> Result<ControlResponse> {
        self.post(&format!("api/v1/watchers/{}/resume", workload_id))
            .await
    }

    async fn parse<T: DeserializeOwned>(response: Response) -> Result<T> {
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorResponse>(&body)
                .map(|e| e.error)
                .unwrap_or(body);
            anyhow::bail!("API error ({}): {}", status, message);
        }

        response.json().await.context("Failed to parse response")
    }
}

// API response types

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workload {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    pub cgroup_path: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LimitUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_limit_bytes: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_reservation_bytes: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_swap_bytes: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpuset_cpus: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_realtime_runtime_us: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherReport {
    pub workload: Workload,
    pub phase: String,
    pub ticks: u64,
    pub memory_windows: usize,
    pub cpu_windows: usize,
    pub memory_done: bool,
    pub cpu_done: bool,
    pub autorange: AutoRange,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub applied: Option<LimitUpdate>,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherList {
    pub watchers: Vec<WatcherReport>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatestSample {
    pub read_at: String,
    pub memory_usage_bytes: u64,
    pub cpu_total_usage: u64,
    pub system_cpu_usage: u64,
    pub online_cpus: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherDetail {
    #[serde(flatten)]
    pub report: WatcherReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest: Option<LatestSample>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlResponse {
    pub workload_id: String,
    pub state: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub last_check_timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub components: HashMap<String, ComponentHealth>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

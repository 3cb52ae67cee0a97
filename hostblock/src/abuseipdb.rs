//! AbuseIPDB API client.
//!
//! Two endpoints are used: `GET /blacklist` for the reputation list the
//! syncer applies, and `POST /report` for the worker's abuse reports.
//! HTTP 429 responses are surfaced as [`HostblockError::RateLimited`]
//! with the `Retry-After` hint so the report worker can arm its gate.

use hostblock_shared::errors::{HostblockError, HostblockResult};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::Config;

/// One address from the remote blacklist payload.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteRecord {
    #[serde(rename = "ipAddress")]
    pub ip_address: String,
    #[serde(rename = "totalReports", default)]
    pub total_reports: u32,
    #[serde(rename = "abuseConfidenceScore")]
    pub abuse_confidence_score: u8,
}

#[derive(Debug, Deserialize)]
struct BlacklistMeta {
    #[serde(rename = "generatedAt")]
    generated_at: String,
}

#[derive(Debug, Deserialize)]
struct BlacklistPayload {
    meta: BlacklistMeta,
    data: Vec<RemoteRecord>,
}

/// Parsed `GET /blacklist` response.
#[derive(Debug, Clone)]
pub struct RemoteBlacklist {
    /// Remote generation time as unix seconds; 0 when unparseable.
    pub generated_at: u64,
    pub records: Vec<RemoteRecord>,
}

pub struct AbuseIpdbClient {
    http: reqwest::Client,
    api_url: String,
    api_key: String,
    datetime_format: String,
}

impl AbuseIpdbClient {
    pub fn new(config: &Config) -> HostblockResult<Self> {
        let http = reqwest::Client::builder().build()?;
        Ok(AbuseIpdbClient {
            http,
            api_url: config.abuseipdb_url.clone(),
            api_key: config.abuseipdb_key.clone(),
            datetime_format: config.abuseipdb_datetime_format.clone(),
        })
    }

    /// Fetch the full remote blacklist above the given confidence.
    pub async fn fetch_blacklist(&self, confidence_minimum: u8) -> HostblockResult<RemoteBlacklist> {
        let url = format!("{}/blacklist", self.api_url);
        debug!("fetching remote blacklist from {url}");
        let response = self
            .http
            .get(&url)
            .header("Key", &self.api_key)
            .header("Accept", "application/json")
            .query(&[("confidenceMinimum", confidence_minimum.to_string())])
            .send()
            .await?;
        let response = check_status(response)?;
        let payload: BlacklistPayload = response
            .json()
            .await
            .map_err(|e| HostblockError::Protocol(format!("malformed blacklist payload: {e}")))?;
        Ok(RemoteBlacklist {
            generated_at: self.parse_generated_at(&payload.meta.generated_at),
            records: payload.data,
        })
    }

    /// Report one address.
    pub async fn report(
        &self,
        address: &str,
        categories: &[u32],
        comment: &str,
    ) -> HostblockResult<()> {
        let url = format!("{}/report", self.api_url);
        let categories = categories
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let mut form = vec![
            ("ip", address.to_string()),
            ("categories", categories),
        ];
        if !comment.is_empty() {
            form.push(("comment", comment.to_string()));
        }
        let response = self
            .http
            .post(&url)
            .header("Key", &self.api_key)
            .header("Accept", "application/json")
            .form(&form)
            .send()
            .await?;
        check_status(response)?;
        Ok(())
    }

    /// Parse the remote generation timestamp with the configured format,
    /// falling back to RFC 3339.
    fn parse_generated_at(&self, value: &str) -> u64 {
        if let Ok(dt) = chrono::DateTime::parse_from_str(value, &self.datetime_format) {
            return dt.timestamp().max(0) as u64;
        }
        if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(value) {
            return dt.timestamp().max(0) as u64;
        }
        warn!("unparseable remote generation timestamp: {value}");
        0
    }
}

fn check_status(response: reqwest::Response) -> HostblockResult<reqwest::Response> {
    let status = response.status();
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok());
        return Err(HostblockError::RateLimited { retry_after });
    }
    if !status.is_success() {
        return Err(HostblockError::Protocol(format!(
            "remote service returned HTTP {status}"
        )));
    }
    Ok(response)
}

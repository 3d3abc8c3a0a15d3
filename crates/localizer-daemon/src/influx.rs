//! InfluxDB v2 write sink over the HTTP line protocol API

use anyhow::{Context, Result};
use async_trait::async_trait;
use localizer_core::{SinkError, StorageSink, WritePoint};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::Url;
use std::time::Duration;
use tracing::trace;

use crate::config::InfluxConfig;

const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Writes one point per matched reading
pub struct InfluxSink {
    client: reqwest::Client,
    write_url: Url,
    token: String,
}

impl InfluxSink {
    pub fn new(config: &InfluxConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(WRITE_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        let token = config
            .token
            .clone()
            .context("InfluxDB token not resolved")?;

        Ok(Self {
            client,
            write_url: write_url(config)?,
            token,
        })
    }
}

/// `<url>/api/v2/write?org=..&bucket=..&precision=ns`
pub fn write_url(config: &InfluxConfig) -> Result<Url> {
    let base = format!("{}/api/v2/write", config.url.trim_end_matches('/'));
    Url::parse_with_params(
        &base,
        &[
            ("org", config.organization.as_str()),
            ("bucket", config.bucket.as_str()),
            ("precision", "ns"),
        ],
    )
    .with_context(|| format!("Invalid InfluxDB URL {:?}", config.url))
}

#[async_trait]
impl StorageSink for InfluxSink {
    async fn write(&self, point: &WritePoint) -> Result<(), SinkError> {
        let body = point.to_line_protocol();
        trace!(line = %body, "Writing point");

        let response = self
            .client
            .post(self.write_url.clone())
            .header(AUTHORIZATION, format!("Token {}", self.token))
            .header(CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(body)
            .send()
            .await
            .map_err(|e| SinkError::Write(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(SinkError::Write(format!("{}: {}", status, detail.trim())));
        }
        Ok(())
    }
}

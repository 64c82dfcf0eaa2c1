// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Destinations for flattened metrics.
//!
//! Reporting is fire-and-forget: [`MetricsSink::report`] returns immediately
//! and failures are only logged, so a slow or unreachable collector never
//! stalls the reporting loop.

use std::{
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use serde_json::json;
use tracing::{debug, error, warn};

use crate::{config::Config, flatten::FlatMetrics};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

pub trait MetricsSink: Send + Sync {
    fn report(&self, metrics: FlatMetrics);
}

/// Picks the sink described by `config`.
///
/// Without a `reportingEndpoint` and a `bucket` metrics are only logged.
pub fn sink_for(config: &Config) -> Arc<dyn MetricsSink> {
    match (config.reporting_endpoint(), config.bucket()) {
        (Some(endpoint), Some(bucket)) => Arc::new(HttpSink::new(
            endpoint,
            config.reporting_api_version(),
            bucket,
            config.token(),
            DEFAULT_TIMEOUT,
        )),
        (Some(endpoint), None) => {
            warn!("No bucket configured for {endpoint}, metrics will only be logged");
            Arc::new(LogSink)
        }
        _ => Arc::new(LogSink),
    }
}

/// Writes every report to the debug log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl MetricsSink for LogSink {
    fn report(&self, metrics: FlatMetrics) {
        debug!(
            "Metrics | {}",
            serde_json::to_string(&metrics).unwrap_or_default()
        );
    }
}

/// POSTs reports to a collector bucket.
///
/// ```text
/// POST <endpoint>/<api version>/bucket/<bucket>/index
/// Authorization: Bearer <token>
///
/// { "timestamp": 1700000000000, "metrics": { "cpu.system.count": 8, ... } }
/// ```
#[derive(Debug, Clone)]
pub struct HttpSink {
    client: reqwest::Client,
    url: String,
    token: Option<String>,
}

impl HttpSink {
    pub fn new(
        endpoint: &str,
        api_version: &str,
        bucket: &str,
        token: Option<&str>,
        timeout: Duration,
    ) -> Self {
        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                error!("Unable to build HTTP client: {e}, falling back to defaults");
                reqwest::Client::new()
            });
        let url = format!(
            "{}/{api_version}/bucket/{bucket}/index",
            endpoint.trim_end_matches('/')
        );
        Self {
            client,
            url,
            token: token.map(str::to_string),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Sends one report and waits for the response.
    pub async fn send(&self, metrics: FlatMetrics) {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        let body = json!({ "timestamp": timestamp, "metrics": metrics });

        let mut request = self.client.post(&self.url).json(&body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let time = std::time::Instant::now();
        match request.send().await {
            Ok(response) if response.status().is_success() => {
                debug!(
                    "Http Sink | Sent {} metrics in {} ms",
                    metrics_len(&body),
                    time.elapsed().as_millis()
                );
            }
            Ok(response) => {
                let status = response.status();
                let text = response.text().await;
                error!("Http Sink | Report failed with status {status}: {text:?}");
            }
            Err(e) => {
                error!("Http Sink | Network error: {e:?}");
            }
        }
    }
}

fn metrics_len(body: &serde_json::Value) -> usize {
    body["metrics"].as_object().map_or(0, serde_json::Map::len)
}

impl MetricsSink for HttpSink {
    fn report(&self, metrics: FlatMetrics) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let sink = self.clone();
                handle.spawn(async move { sink.send(metrics).await });
            }
            Err(_) => warn!("Http Sink | No async runtime, dropping report"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};

    fn metrics() -> FlatMetrics {
        [
            ("cpu.system.count".to_string(), json!(8)),
            ("memory.process.bytes".to_string(), json!(1024)),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn test_url_layout() {
        let sink = HttpSink::new("http://localhost:3000/", "v0", "abc", None, DEFAULT_TIMEOUT);
        assert_eq!(sink.url(), "http://localhost:3000/v0/bucket/abc/index");
    }

    #[tokio::test]
    async fn test_send_posts_metrics() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/v0/bucket/abc/index")
            .match_header("Authorization", "Bearer secret")
            .match_header("Content-Type", "application/json")
            .match_body(Matcher::PartialJson(json!({
                "metrics": { "cpu.system.count": 8, "memory.process.bytes": 1024 }
            })))
            .with_status(200)
            .create_async()
            .await;

        let sink = HttpSink::new(&server.url(), "v0", "abc", Some("secret"), DEFAULT_TIMEOUT);
        sink.send(metrics()).await;
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_report_is_fire_and_forget() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/bucket/xyz/index")
            .match_header("Authorization", Matcher::Missing)
            .with_status(500)
            .create_async()
            .await;

        let sink = HttpSink::new(&server.url(), "v1", "xyz", None, DEFAULT_TIMEOUT);
        sink.report(metrics());

        let waited = tokio::time::timeout(Duration::from_secs(5), async {
            while !mock.matched_async().await {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        assert!(waited.is_ok(), "timed out before the report was sent");
    }

    #[test]
    fn test_sink_for_without_endpoint_logs() {
        let config = Config::default();
        // LogSink::report never panics without a runtime
        sink_for(&config).report(metrics());
    }
}

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use crate::error::NodeLookupError;
use crate::types::{Coordinate, TrafficNode};

pub const DEFAULT_OVERPASS_URL: &str = "https://overpass-api.de/api/interpreter";

/// Remote lookup of physical traffic-signal nodes around a coordinate
#[async_trait]
pub trait NodeSource: Send + Sync {
    async fn fetch_traffic_signal_nodes(
        &self,
        coordinate: Coordinate,
        radius_m: f64,
    ) -> Result<Vec<TrafficNode>, NodeLookupError>;
}

/// Rate limiter for Overpass API requests
struct RateLimit {
    last_request: Option<Instant>,
    min_interval: Duration,
}

impl RateLimit {
    fn new(min_interval: Duration) -> Self {
        RateLimit {
            last_request: None,
            min_interval,
        }
    }
}

/// Overpass API client for traffic-signal nodes
///
/// # Rate Limiting
/// - Minimum 1 second between requests
/// - HTTP 429 is reported as `RateLimited`, the caller decides when to retry
/// - Overpass-side query timeouts are retried with a short backoff
///
/// # Query Strategy
/// - `node["highway"="traffic_signals"]` inside an `around:` circle
/// - 10-second server and client timeout
pub struct OverpassClient {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
    rate_limit: Mutex<RateLimit>,
}

impl OverpassClient {
    pub fn new() -> Self {
        Self::with_config(DEFAULT_OVERPASS_URL, Duration::from_secs(10))
    }

    pub fn with_config(base_url: impl Into<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("signal_timing/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        OverpassClient {
            client,
            base_url: base_url.into(),
            timeout,
            rate_limit: Mutex::new(RateLimit::new(Duration::from_secs(1))),
        }
    }

    /// Build Overpass QL query for a circle around `coordinate`
    ///
    /// # Query Format
    /// ```text
    /// [out:json][timeout:10];
    /// node["highway"="traffic_signals"](around:R,lat,lon);
    /// out body;
    /// ```
    pub fn build_query(&self, coordinate: &Coordinate, radius_m: f64) -> String {
        format!(
            "[out:json][timeout:{}];\n\
            node[\"highway\"=\"traffic_signals\"](around:{:.0},{:.7},{:.7});\n\
            out body;",
            self.timeout.as_secs(),
            radius_m.max(0.0),
            coordinate.latitude,
            coordinate.longitude
        )
    }

    async fn respect_rate_limit(&self) {
        let mut limit = self.rate_limit.lock().await;
        if let Some(last) = limit.last_request {
            let elapsed = last.elapsed();
            if elapsed < limit.min_interval {
                tokio::time::sleep(limit.min_interval - elapsed).await;
            }
        }
        limit.last_request = Some(Instant::now());
    }
}

impl Default for OverpassClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NodeSource for OverpassClient {
    async fn fetch_traffic_signal_nodes(
        &self,
        coordinate: Coordinate,
        radius_m: f64,
    ) -> Result<Vec<TrafficNode>, NodeLookupError> {
        const MAX_ATTEMPTS: u32 = 2;

        let url = reqwest::Url::parse(&self.base_url)
            .map_err(|e| NodeLookupError::InvalidUrl(format!("{}: {}", self.base_url, e)))?;

        for attempt in 0..MAX_ATTEMPTS {
            self.respect_rate_limit().await;

            let query = self.build_query(&coordinate, radius_m);
            let response = self
                .client
                .post(url.clone())
                .form(&[("data", query)])
                .send()
                .await
                .map_err(|e| {
                    if e.is_timeout() {
                        NodeLookupError::Timeout
                    } else {
                        NodeLookupError::Network(e.to_string())
                    }
                })?;

            let status = response.status();
            if status.as_u16() == 429 {
                log::warn!("Rate limited by Overpass API");
                return Err(NodeLookupError::RateLimited);
            } else if !status.is_success() {
                return Err(NodeLookupError::HttpStatus(status.as_u16()));
            }

            let body = response
                .text()
                .await
                .map_err(|e| NodeLookupError::Network(format!("Failed to read response: {}", e)))?;

            let parsed = parse_overpass_json(&body)?;
            if parsed.timed_out && attempt + 1 < MAX_ATTEMPTS {
                log::warn!(
                    "Overpass timeout on attempt {}/{}, retrying",
                    attempt + 1,
                    MAX_ATTEMPTS
                );
                tokio::time::sleep(Duration::from_secs(2)).await;
                continue;
            }

            log::debug!(
                "Overpass returned {} signal nodes within {:.0} m of ({:.5}, {:.5})",
                parsed.nodes.len(),
                radius_m,
                coordinate.latitude,
                coordinate.longitude
            );
            return Ok(parsed.nodes);
        }

        Err(NodeLookupError::Timeout)
    }
}

#[derive(Deserialize)]
struct OverpassResponse {
    #[serde(default)]
    elements: Vec<OverpassElement>,
    #[serde(default)]
    remark: Option<String>,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum OverpassElement {
    Node {
        id: i64,
        lat: f64,
        lon: f64,
        #[serde(default)]
        tags: HashMap<String, String>,
    },
    #[serde(other)]
    Other,
}

/// Decoded Overpass answer
#[derive(Debug, Default)]
pub struct OverpassNodes {
    pub nodes: Vec<TrafficNode>,
    /// Server reported a query timeout; `nodes` may be partial
    pub timed_out: bool,
}

/// Parse an Overpass JSON body into traffic nodes
///
/// Non-node elements and nodes with out-of-range coordinates are skipped.
pub fn parse_overpass_json(body: &str) -> Result<OverpassNodes, NodeLookupError> {
    let response: OverpassResponse =
        serde_json::from_str(body).map_err(|e| NodeLookupError::Parse(e.to_string()))?;

    let timed_out = response
        .remark
        .as_deref()
        .map(|r| r.to_ascii_lowercase().contains("timed out") || r.contains("timeout"))
        .unwrap_or(false);

    let nodes = response
        .elements
        .into_iter()
        .filter_map(|element| match element {
            OverpassElement::Node { id, lat, lon, tags } => {
                let coordinate = Coordinate::new(lat, lon);
                coordinate
                    .is_valid()
                    .then(|| TrafficNode::new(format!("osm-{}", id), coordinate, id).with_tags(tags))
            }
            OverpassElement::Other => None,
        })
        .collect();

    Ok(OverpassNodes { nodes, timed_out })
}

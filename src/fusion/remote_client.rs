use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::RemoteSignalError;
use crate::types::{Coordinate, SignalPhase, TrafficSignal};

pub const DEFAULT_REMOTE_TIMEOUT: Duration = Duration::from_secs(3);

/// Remote "next signal for this coordinate" service
#[async_trait]
pub trait RemoteSignalSource: Send + Sync {
    async fn fetch_signal(&self, coordinate: Coordinate) -> Result<TrafficSignalDto, RemoteSignalError>;
}

/// Wire shape of the backend prediction
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrafficSignalDto {
    #[serde(rename = "intersectionID")]
    pub intersection_id: String,
    pub intersection_name: String,
    pub latitude: f64,
    pub longitude: f64,
    pub phase: String,
    #[serde(default)]
    pub next_green_epoch_ms: Option<i64>,
    #[serde(default)]
    pub phase_ends_epoch_ms: Option<i64>,
    pub confidence: f64,
    pub source: String,
    pub server_epoch_ms: i64,
}

impl TrafficSignalDto {
    /// Decode into the domain type; fails on out-of-range timestamps
    pub fn into_domain(self) -> Result<TrafficSignal, RemoteSignalError> {
        let server_timestamp = epoch_ms(self.server_epoch_ms)?;
        let next_green_at = self.next_green_epoch_ms.map(epoch_ms).transpose()?;
        let phase_ends_at = self.phase_ends_epoch_ms.map(epoch_ms).transpose()?;

        Ok(TrafficSignal {
            id: TrafficSignal::signal_id(&self.intersection_id, server_timestamp),
            phase: SignalPhase::from_wire(&self.phase),
            coordinate: Coordinate::new(self.latitude, self.longitude),
            intersection_id: self.intersection_id,
            intersection_name: self.intersection_name,
            next_green_at,
            phase_ends_at,
            confidence: self.confidence.clamp(0.0, 1.0),
            source: self.source,
            server_timestamp,
        })
    }
}

fn epoch_ms(millis: i64) -> Result<DateTime<Utc>, RemoteSignalError> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| RemoteSignalError::InvalidResponse(format!("timestamp out of range: {}", millis)))
}

/// HTTP client for `GET {base}/v1/signals/next?lat=..&lon=..`
pub struct TrafficSignalApiClient {
    client: reqwest::Client,
    base_url: Option<String>,
}

impl TrafficSignalApiClient {
    pub fn new(base_url: Option<String>) -> Self {
        Self::with_timeout(base_url, DEFAULT_REMOTE_TIMEOUT)
    }

    pub fn with_timeout(base_url: Option<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        TrafficSignalApiClient { client, base_url }
    }

    pub fn endpoint(&self, coordinate: &Coordinate) -> Result<reqwest::Url, RemoteSignalError> {
        let base = self
            .base_url
            .as_deref()
            .filter(|url| !url.trim().is_empty())
            .ok_or(RemoteSignalError::MissingConfiguration)?;

        let joined = format!("{}/v1/signals/next", base.trim_end_matches('/'));
        reqwest::Url::parse_with_params(
            &joined,
            &[
                ("lat", coordinate.latitude.to_string()),
                ("lon", coordinate.longitude.to_string()),
            ],
        )
        .map_err(|e| RemoteSignalError::InvalidResponse(format!("invalid endpoint {}: {}", joined, e)))
    }
}

#[async_trait]
impl RemoteSignalSource for TrafficSignalApiClient {
    async fn fetch_signal(&self, coordinate: Coordinate) -> Result<TrafficSignalDto, RemoteSignalError> {
        let url = self.endpoint(&coordinate)?;

        let response = self
            .client
            .get(url)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    RemoteSignalError::Timeout
                } else {
                    RemoteSignalError::Network(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(RemoteSignalError::BadStatus(status.as_u16()));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| RemoteSignalError::Network(e.to_string()))?;
        serde_json::from_slice(&body).map_err(|e| RemoteSignalError::InvalidResponse(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BODY: &str = r#"{
        "intersectionID": "sf-0042",
        "intersectionName": "Market & 5th",
        "latitude": 37.7841,
        "longitude": -122.4075,
        "phase": "RED",
        "nextGreenEpochMs": 1700000012500,
        "phaseEndsEpochMs": null,
        "confidence": 0.91,
        "source": "spat-map",
        "serverEpochMs": 1700000000000
    }"#;

    #[test]
    fn test_decode_and_convert() {
        let dto: TrafficSignalDto = serde_json::from_str(BODY).unwrap();
        assert_eq!(dto.intersection_id, "sf-0042");

        let signal = dto.into_domain().unwrap();
        assert_eq!(signal.phase, SignalPhase::Red);
        assert_eq!(signal.id, "sf-0042@1700000000000");
        assert_eq!(signal.server_timestamp.timestamp_millis(), 1_700_000_000_000);
        assert_eq!(signal.next_green_at.map(|t| t.timestamp_millis()), Some(1_700_000_012_500));
        assert!(signal.phase_ends_at.is_none());
        assert_eq!(signal.countdown_to_green(signal.server_timestamp), Some(12));
    }

    #[test]
    fn test_unknown_phase_and_missing_optionals() {
        let body = r#"{"intersectionID": "x", "intersectionName": "X", "latitude": 0.0,
            "longitude": 0.0, "phase": "flashing", "confidence": 0.4, "source": "heuristic",
            "serverEpochMs": 0}"#;
        let signal = serde_json::from_str::<TrafficSignalDto>(body)
            .unwrap()
            .into_domain()
            .unwrap();
        assert_eq!(signal.phase, SignalPhase::Unknown);
        assert!(signal.next_green_at.is_none());
    }

    #[test]
    fn test_out_of_range_timestamp() {
        let mut dto: TrafficSignalDto = serde_json::from_str(BODY).unwrap();
        dto.server_epoch_ms = i64::MAX;
        assert!(matches!(dto.into_domain(), Err(RemoteSignalError::InvalidResponse(_))));
    }

    #[test]
    fn test_endpoint() {
        let client = TrafficSignalApiClient::new(Some("https://signals.example.com/api/".to_string()));
        let url = client.endpoint(&Coordinate::new(37.5, -122.25)).unwrap();
        assert_eq!(url.path(), "/api/v1/signals/next");
        assert_eq!(url.query(), Some("lat=37.5&lon=-122.25"));
    }

    #[tokio::test]
    async fn test_missing_configuration() {
        for base in [None, Some("  ".to_string())] {
            let client = TrafficSignalApiClient::new(base);
            let result = client.fetch_signal(Coordinate::new(0.0, 0.0)).await;
            assert_eq!(result, Err(RemoteSignalError::MissingConfiguration));
        }
    }
}

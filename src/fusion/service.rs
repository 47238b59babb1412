use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use super::{RemoteSignalSource, SignalObservationSource, DEFAULT_REMOTE_TIMEOUT};
use crate::error::{ConfigError, RemoteSignalError};
use crate::types::{Coordinate, TrafficSignal};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PredictionMode {
    #[default]
    #[serde(alias = "ondevice")]
    OnDevice,
    Backend,
    Hybrid,
}

impl FromStr for PredictionMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "on-device" | "ondevice" | "on_device" => Ok(PredictionMode::OnDevice),
            "backend" => Ok(PredictionMode::Backend),
            "hybrid" => Ok(PredictionMode::Hybrid),
            other => Err(ConfigError::InvalidMode(other.to_string())),
        }
    }
}

impl Display for PredictionMode {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        let name = match self {
            PredictionMode::OnDevice => "on-device",
            PredictionMode::Backend => "backend",
            PredictionMode::Hybrid => "hybrid",
        };
        write!(f, "{}", name)
    }
}

/// Merges on-device and remote predictions under a prediction mode
///
/// # Modes
/// - `OnDevice`: local engine only
/// - `Backend`: remote first, local when the remote has nothing
/// - `Hybrid`: both concurrently, higher confidence wins, ties go to remote
///
/// Remote failures (including timeouts) are logged and treated as "no remote
/// result"; they never reach the caller.
pub struct PredictionFusionService {
    mode: PredictionMode,
    local: Arc<dyn SignalObservationSource>,
    remote: Option<Arc<dyn RemoteSignalSource>>,
    remote_timeout: Duration,
}

impl PredictionFusionService {
    pub fn new(
        mode: PredictionMode,
        local: Arc<dyn SignalObservationSource>,
        remote: Option<Arc<dyn RemoteSignalSource>>,
    ) -> Self {
        PredictionFusionService {
            mode,
            local,
            remote,
            remote_timeout: DEFAULT_REMOTE_TIMEOUT,
        }
    }

    pub fn with_remote_timeout(mut self, timeout: Duration) -> Self {
        self.remote_timeout = timeout;
        self
    }

    pub fn mode(&self) -> PredictionMode {
        self.mode
    }

    pub async fn signal_prediction(&self, coordinate: Option<Coordinate>) -> Option<TrafficSignal> {
        self.signal_prediction_at(coordinate, Utc::now()).await
    }

    /// Best prediction for `coordinate` at `now`; `None` without a coordinate
    pub async fn signal_prediction_at(
        &self,
        coordinate: Option<Coordinate>,
        now: DateTime<Utc>,
    ) -> Option<TrafficSignal> {
        let coordinate = coordinate?;

        match self.mode {
            PredictionMode::OnDevice => self.local.predict_signal(coordinate, now).await,
            PredictionMode::Backend => match self.remote_prediction(coordinate).await {
                Some(signal) => Some(signal),
                None => self.local.predict_signal(coordinate, now).await,
            },
            PredictionMode::Hybrid => {
                let (remote, local) = futures::future::join(
                    self.remote_prediction(coordinate),
                    self.local.predict_signal(coordinate, now),
                )
                .await;
                pick_best(remote, local)
            }
        }
    }

    async fn remote_prediction(&self, coordinate: Coordinate) -> Option<TrafficSignal> {
        let remote = self.remote.as_ref()?;

        let result = match tokio::time::timeout(self.remote_timeout, remote.fetch_signal(coordinate)).await {
            Ok(result) => result.and_then(|dto| dto.into_domain()),
            Err(_) => Err(RemoteSignalError::Timeout),
        };

        match result {
            Ok(signal) => Some(signal),
            Err(e) => {
                log::warn!("Remote signal prediction unavailable: {}", e);
                None
            }
        }
    }
}

/// Higher confidence wins; ties favour the remote result
fn pick_best(remote: Option<TrafficSignal>, local: Option<TrafficSignal>) -> Option<TrafficSignal> {
    match (remote, local) {
        (Some(remote), Some(local)) => {
            if remote.confidence >= local.confidence {
                Some(remote)
            } else {
                Some(local)
            }
        }
        (remote, local) => remote.or(local),
    }
}

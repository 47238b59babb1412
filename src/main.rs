use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

use signal_timing_rs::config::AppConfig;
use signal_timing_rs::coordinator::{FlowEvent, StopWaitLaunchCoordinator};
use signal_timing_rs::cycle_estimator::{CycleEstimator, FilePatternStore, MemoryPatternStore, PatternStore};
use signal_timing_rs::fusion::{
    CyclePhaseSimulator, LearnedCycleSource, MemoryProfileStore, OnDeviceEngine, PredictionFusionService,
    PredictionMode, RemoteSignalSource, TrafficSignalApiClient,
};
use signal_timing_rs::node_directory::{NodeDirectory, OverpassClient, SignalNodeDirectory};
use signal_timing_rs::samples;
use signal_timing_rs::status::{current_timestamp, PipelineStatus};
use signal_timing_rs::types::{Coordinate, TrafficSignal, VehicleSample};
use signal_timing_rs::vehicle_tracker;

const SAMPLE_CHANNEL_CAPACITY: usize = 256;
const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Parser, Debug)]
#[command(name = "signal_timing")]
#[command(about = "Learn traffic-signal cycles from telematics and predict the next green", long_about = None)]
struct Args {
    /// JSON config file; environment variables override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Prediction mode (on-device, backend, hybrid)
    #[arg(long, global = true)]
    mode: Option<PredictionMode>,

    /// Directory for learned cycle patterns
    #[arg(long, global = true)]
    pattern_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Replay a recorded sample log through the stop/launch pipeline
    Replay {
        /// JSON-lines sample log (.jsonl or .jsonl.gz)
        #[arg(long)]
        log: PathBuf,

        /// Write a status snapshot here when the replay finishes
        #[arg(long)]
        status_out: Option<PathBuf>,
    },
    /// Print one fused signal prediction as JSON
    Predict {
        #[arg(long, allow_negative_numbers = true)]
        lat: f64,
        #[arg(long, allow_negative_numbers = true)]
        lon: f64,
    },
    /// Poll predictions at the configured interval
    Watch {
        #[arg(long, allow_negative_numbers = true)]
        lat: f64,
        #[arg(long, allow_negative_numbers = true)]
        lon: f64,

        /// Number of polls (0 = until interrupted)
        #[arg(long, default_value = "0")]
        count: u64,
    },
}

/// Long-lived components shared by the subcommands
struct Pipeline {
    config: AppConfig,
    directory: Arc<dyn NodeDirectory>,
    estimator: Arc<CycleEstimator>,
    fusion: PredictionFusionService,
}

impl Pipeline {
    fn build(config: AppConfig) -> Result<Self> {
        let source = OverpassClient::with_config(config.overpass_url.clone(), config.node_lookup_timeout());
        let directory: Arc<dyn NodeDirectory> = Arc::new(SignalNodeDirectory::new(Arc::new(source)));

        let store: Arc<dyn PatternStore> = match &config.pattern_dir {
            Some(dir) => {
                log::info!("Persisting signal patterns under {}", dir.display());
                Arc::new(FilePatternStore::new(dir.clone()))
            }
            None => Arc::new(MemoryPatternStore::new()),
        };
        let estimator = Arc::new(CycleEstimator::with_clock(store, config.day_clock()?));

        let simulator = Arc::new(CyclePhaseSimulator::new(Arc::new(MemoryProfileStore::new())));
        let learned = LearnedCycleSource::new(directory.clone(), estimator.clone());
        let local = OnDeviceEngine::new(Some(Arc::new(learned)), simulator);

        let remote = config.backend_base_url.clone().map(|base| {
            Arc::new(TrafficSignalApiClient::with_timeout(Some(base), config.remote_timeout()))
                as Arc<dyn RemoteSignalSource>
        });
        let fusion = PredictionFusionService::new(config.prediction_mode, Arc::new(local), remote)
            .with_remote_timeout(config.remote_timeout());

        Ok(Pipeline {
            config,
            directory,
            estimator,
            fusion,
        })
    }
}

fn load_config(args: &Args) -> Result<AppConfig> {
    let mut config = match &args.config {
        Some(path) => AppConfig::from_json_file(path).with_context(|| format!("loading {}", path.display()))?,
        None => AppConfig::default(),
    };
    config.apply_env(|key| std::env::var(key).ok())?;

    if let Some(mode) = args.mode {
        config.prediction_mode = mode;
    }
    if let Some(dir) = &args.pattern_dir {
        config.pattern_dir = Some(dir.clone());
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = load_config(&args)?;
    log::info!(
        "Signal timing starting (mode: {}, backend: {})",
        config.prediction_mode,
        config.backend_base_url.as_deref().unwrap_or("none")
    );

    let pipeline = Pipeline::build(config)?;

    match args.command {
        Command::Replay { log, status_out } => replay(&pipeline, &log, status_out.as_deref()).await,
        Command::Predict { lat, lon } => predict(&pipeline, Coordinate::new(lat, lon)).await,
        Command::Watch { lat, lon, count } => watch(&pipeline, Coordinate::new(lat, lon), count).await,
    }
}

async fn replay(pipeline: &Pipeline, log_path: &Path, status_out: Option<&Path>) -> Result<()> {
    let started_at = current_timestamp();
    let samples = samples::read_samples(log_path).with_context(|| format!("reading {}", log_path.display()))?;
    log::info!("Replaying {} samples from {}", samples.len(), log_path.display());

    let coordinator = Arc::new(StopWaitLaunchCoordinator::new(
        pipeline.directory.clone(),
        pipeline.estimator.clone(),
    ));
    let flow_rx = coordinator.subscribe();

    let (sample_tx, sample_rx) = mpsc::channel::<VehicleSample>(SAMPLE_CHANNEL_CAPACITY);
    let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

    let tracker_handle = tokio::spawn(vehicle_tracker::tracker_loop(sample_rx, event_tx));
    // The run task owns the last coordinator handle; the flow channel closes when it ends
    let coordinator_handle = tokio::spawn(coordinator.run(event_rx));
    let status_handle = tokio::spawn(collect_status(flow_rx));

    let mut delivered = 0u64;
    for sample in samples {
        if sample_tx.send(sample).await.is_err() {
            break;
        }
        delivered += 1;
    }
    drop(sample_tx);

    tracker_handle.await?;
    coordinator_handle.await?;
    let mut status = status_handle.await?;
    status.record_samples(delivered);
    status.learned_nodes = pipeline.estimator.node_count().await;

    log::info!(
        "Replay done: {} hard stops ({} at signals), {} launches, {} predictions, {} learned nodes",
        status.hard_stops,
        status.signal_stops,
        status.launches,
        status.predictions_issued,
        status.learned_nodes
    );

    if let Some(path) = status_out {
        status
            .save(path, started_at)
            .with_context(|| format!("writing {}", path.display()))?;
        log::info!("Status written to {}", path.display());
    }
    Ok(())
}

async fn collect_status(mut flow_rx: broadcast::Receiver<FlowEvent>) -> PipelineStatus {
    let mut status = PipelineStatus::new();
    loop {
        match flow_rx.recv().await {
            Ok(event) => {
                log_flow(&event);
                status.record_flow(&event);
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                log::warn!("Status collector lagged, {} flow events not counted", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    status
}

fn log_flow(event: &FlowEvent) {
    match event {
        FlowEvent::StoppedAtSignal { node, timestamp } => {
            log::info!("[{}] Stopped at signal {}", timestamp.format("%H:%M:%S"), node.id)
        }
        FlowEvent::LaunchedFromSignal {
            node,
            prediction,
            timestamp,
        } => log::info!(
            "[{}] Launched from {}: cycle {:.1}s, next green {} (confidence {:.2})",
            timestamp.format("%H:%M:%S"),
            node.id,
            prediction.cycle_length,
            prediction.next_green_time.format("%H:%M:%S"),
            prediction.confidence
        ),
        FlowEvent::Launched { timestamp, .. } => log::info!("[{}] Launched", timestamp.format("%H:%M:%S")),
        FlowEvent::StoppedInTraffic { location } => log::debug!(
            "Stopped away from any signal at {:.5},{:.5}",
            location.latitude,
            location.longitude
        ),
        FlowEvent::Waiting { .. } | FlowEvent::Moving { .. } => log::trace!("{:?}", event),
    }
}

async fn predict(pipeline: &Pipeline, coordinate: Coordinate) -> Result<()> {
    match pipeline.fusion.signal_prediction(Some(coordinate)).await {
        Some(signal) => {
            warn_if_untrusted(&signal, pipeline.config.low_confidence_threshold);
            println!("{}", serde_json::to_string_pretty(&signal)?);
        }
        None => log::warn!("No signal prediction available"),
    }
    Ok(())
}

async fn watch(pipeline: &Pipeline, coordinate: Coordinate, count: u64) -> Result<()> {
    let mut interval = tokio::time::interval(pipeline.config.polling_interval());
    let mut polls = 0u64;

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                log::info!("Interrupted, stopping");
                break;
            }
        }

        if let Some(signal) = pipeline.fusion.signal_prediction(Some(coordinate)).await {
            warn_if_untrusted(&signal, pipeline.config.low_confidence_threshold);
            println!("{}", serde_json::to_string(&signal)?);
        }

        polls += 1;
        if count > 0 && polls >= count {
            break;
        }
    }
    Ok(())
}

fn warn_if_untrusted(signal: &TrafficSignal, threshold: f64) {
    if signal.confidence < threshold {
        log::warn!(
            "{} prediction for {} below confidence threshold ({:.2} < {:.2})",
            signal.source,
            signal.intersection_name,
            signal.confidence,
            threshold
        );
    }
}

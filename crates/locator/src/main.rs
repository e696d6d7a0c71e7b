use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use clap::Parser;
use tracing_subscriber::{fmt, EnvFilter};

use locator::adaptive::{AdaptiveConfig, AdaptiveController, MatchParams};
use locator::camera::{FileFrameSource, FrameSource};
use locator::config::{Cli, Command, LocatorConfig};
use locator::dead_reckoning::DeadReckonParams;
use locator::error::{LocatorError, Result};
use locator::feature::{ClassicalMatcher, FeatureMatcher, LearnedMatcher};
use locator::filter::FilterParams;
use locator::fusion::FusionEngine;
use locator::geo::{self, GeoPoint};
use locator::health::{HealthConfig, HealthMonitor};
use locator::homography::{self, HomographyParams};
#[cfg(feature = "metrics")]
use locator::metrics;
use locator::preprocess;
use locator::rate_limiter::{RateLimiter, RateLimiterConfig};
use locator::telemetry::{TelemetryRow, TelemetrySink};
use locator::tile_store::{MapPack, TileStore};
use locator::transport::{Transport, TransportConfig};

const TILE_CACHE_CAPACITY: usize = 100;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::CheckConfig { config } => {
            let loaded = LocatorConfig::load(&config)?;
            println!("config at {} is valid", config.display());
            println!("  map_pack: {}", loaded.map_pack.display());
            println!("  target_hz: {}", loaded.target_hz);
            println!("  uart: {} @ {} (enabled={})", loaded.uart.port, loaded.uart.baudrate, loaded.uart.enabled);
            Ok(())
        }
        Command::Run { config } => {
            let config = match config {
                Some(path) => LocatorConfig::load(&path)?,
                None => LocatorConfig::default(),
            };

            fmt()
                .with_env_filter(EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info")))
                .json()
                .init();

            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?;
            runtime.block_on(run(config))
        }
    }
}

/// Owns every component the frame loop touches exclusively; nothing here is
/// shared with another task.
struct Locator {
    config: LocatorConfig,
    tile_store: TileStore,
    matcher: FeatureMatcher,
    adaptive: AdaptiveController,
    homography_params: HomographyParams,
    fusion: FusionEngine,
    rate_limiter: RateLimiter,
    transport: Option<Transport>,
    health: HealthMonitor,
    telemetry: Option<TelemetrySink>,
    flight_recorder: Option<vpsf::FlightRecorder>,
    frame_source: Box<dyn FrameSource>,
    frames_total: u64,
    fixes_total: u64,
    #[cfg(feature = "metrics")]
    metrics: metrics::LocatorMetrics,
}

impl Locator {
    fn new(config: LocatorConfig) -> Result<Self> {
        tracing::info!(map_pack = %config.map_pack.display(), "loading map pack");
        let pack = MapPack::load(&config.map_pack)?;
        tracing::info!(tiles = pack.len(), "map pack loaded");
        let tile_store = TileStore::new(pack, TILE_CACHE_CAPACITY);

        let matcher = if config.matcher.use_classical_fallback {
            tracing::info!("using classical FAST/BRIEF matcher");
            FeatureMatcher::Classical(ClassicalMatcher::new())
        } else {
            tracing::info!("loading learned matcher models");
            FeatureMatcher::Learned(LearnedMatcher::load(
                &config.matcher.superpoint_onnx,
                &config.matcher.lightglue_onnx,
            )?)
        };

        let match_defaults = MatchParams {
            min_matches: config.matcher.min_matches,
            min_inlier_ratio: config.matcher.confidence_threshold,
            ..MatchParams::default()
        };
        let adaptive = AdaptiveController::new(AdaptiveConfig::default(), match_defaults);

        let filter_params = FilterParams {
            r: config.ekf_measurement_noise,
            gate_threshold: config.ekf_gate_threshold,
            ..FilterParams::default()
        };
        let fusion = FusionEngine::new(filter_params, DeadReckonParams::default(), None);

        let rate_limiter = RateLimiter::new(RateLimiterConfig {
            max_hz: config.target_hz,
            ..RateLimiterConfig::default()
        });

        let transport = if config.uart.enabled {
            let transport_config = TransportConfig {
                port: config.uart.port.clone(),
                baud_rate: config.uart.baudrate,
                protocol: config.uart.protocol.into(),
                ..TransportConfig::default()
            };
            let mut t = Transport::new(transport_config);
            t.connect()?;
            tracing::info!(port = %config.uart.port, baud = config.uart.baudrate, "uart open");
            Some(t)
        } else {
            None
        };

        let telemetry = match &config.telemetry_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                let path = dir.join("telemetry.csv");
                Some(TelemetrySink::create(&path)?)
            }
            None => None,
        };

        let flight_recorder = match &config.flight_record_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                let path = dir.join("flight.vpsf");
                Some(vpsf::FlightRecorder::start(&path)?)
            }
            None => None,
        };

        let mut frame_source: Box<dyn FrameSource> = match &config.replay_frames_dir {
            Some(dir) => Box::new(FileFrameSource::new(dir, 1.0 / config.target_hz)?),
            None => {
                return Err(LocatorError::ResourceUnavailable(
                    "no frame source configured: set replay_frames_dir (a live camera backend is out of scope)".into(),
                ))
            }
        };
        frame_source.open()?;

        Ok(Self {
            config,
            tile_store,
            matcher,
            adaptive,
            homography_params: HomographyParams::default(),
            fusion,
            rate_limiter,
            transport,
            health: HealthMonitor::new(HealthConfig::default()),
            telemetry,
            flight_recorder,
            frame_source,
            frames_total: 0,
            fixes_total: 0,
            #[cfg(feature = "metrics")]
            metrics: metrics::LocatorMetrics::new(),
        })
    }

    /// Runs one tick. `t` is a Unix timestamp (seconds) shared across grab,
    /// match, fusion, the rate limiter, and NMEA/MSP encoding.
    fn tick(&mut self, t: f64) -> Result<()> {
        let tick_start = Instant::now();

        let frame = match self.frame_source.grab() {
            Ok(frame) => frame,
            Err(LocatorError::Transient(msg)) => {
                tracing::warn!(error = %msg, "frame capture failed");
                self.health.record_tick(false, 100.0, false, false);
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let preprocessor = preprocess::Preprocessor::new(preprocess::PreprocessConfig::default());
        let (frame_gray, sharpness, _brightness) = preprocessor.process(&frame.image)?;

        let blur_skip = sharpness < self.adaptive.params().blur_reject;
        let mut visual: Option<(GeoPoint, f64)> = None;
        let mut match_count = 0u32;
        let mut inlier_ratio = 0f64;
        let mut candidate_tile = String::new();

        if !blur_skip {
            let params = *self.adaptive.params();
            let descriptor = self.matcher.extract_global_descriptor(&frame_gray, &params);
            let neighbors = self.tile_store.pack().index().search(&descriptor, self.config.matcher.max_candidates);

            for neighbor in &neighbors {
                let Some(entry) = self.tile_store.pack().tile(neighbor.row).cloned() else {
                    continue;
                };
                let tile_image = match self.tile_store.load_image(&entry) {
                    Ok(img) => img.clone(),
                    Err(e) => {
                        tracing::debug!(error = %e, "tile image unavailable");
                        continue;
                    }
                };
                let (tile_gray, _, _) = match preprocessor.process(&tile_image) {
                    Ok(v) => v,
                    Err(_) => continue,
                };

                let correspondences = self.matcher.match_images(&frame_gray, &tile_gray, &params);
                if correspondences.len() < params.min_matches as usize {
                    continue;
                }

                let estimate = homography::estimate(&correspondences.pts_a, &correspondences.pts_b, self.homography_params);
                let Ok(result) = estimate else {
                    continue;
                };

                let (w, h) = frame_gray.dimensions();
                let center = (w as f64 / 2.0, h as f64 / 2.0);
                if let Some(position) = geo::homography_to_gps(&result.h, entry.coord, center) {
                    match_count = correspondences.len() as u32;
                    inlier_ratio = result.inlier_ratio;
                    candidate_tile = format!("{}/{}/{}", entry.coord.z, entry.coord.x, entry.coord.y);
                    let hdop = (5.0 * (1.0 - result.inlier_ratio)).max(0.5);
                    visual = Some((position, hdop));
                    break;
                }
            }
        }

        let had_visual_candidate = visual.is_some();
        let out = self.fusion.update(visual, t);
        let outlier_rejected = had_visual_candidate && !out.ekf_accepted;

        self.adaptive.record(out.position.is_some(), inlier_ratio, sharpness);

        if self.rate_limiter.allow(t) {
            if let Some(transport) = self.transport.as_mut() {
                if let Err(e) = transport.send_fix(&out, t) {
                    tracing::warn!(error = %e, "transport send failed");
                }
            }
        }

        self.frames_total += 1;
        if out.position.is_some() {
            self.fixes_total += 1;
        }

        let latency_ms = tick_start.elapsed().as_secs_f64() * 1000.0;
        self.health
            .record_tick(out.position.is_some(), latency_ms, outlier_rejected, !out.geofence_ok);

        if let Some(sink) = self.telemetry.as_mut() {
            let (vn, ve) = self.fusion.filter().velocity_mps();
            let row = TelemetryRow::from_output(
                &out,
                t,
                vn,
                ve,
                match_count,
                inlier_ratio,
                latency_ms,
                blur_skip,
                self.health.snapshot().outliers_rejected_total,
                self.frames_total,
                self.fixes_total,
                self.fusion.filter().last_innovation(),
                candidate_tile.clone(),
            );
            if let Err(e) = sink.write_row(&row) {
                tracing::warn!(error = %e, "telemetry write failed");
            }
        }

        if let Some(recorder) = self.flight_recorder.as_mut() {
            let (vn, ve) = self.fusion.filter().velocity_mps();
            let (lat, lon) = out.position.map(|p| (p.lat, p.lon)).unwrap_or((0.0, 0.0));
            let mut flags = 0u16;
            if out.geofence_ok {
                flags |= vpsf::FLAG_GEOFENCE_OK;
            }
            if out.ekf_accepted {
                flags |= vpsf::FLAG_EKF_ACCEPTED;
            }
            if blur_skip {
                flags |= vpsf::FLAG_BLUR_SKIP;
            }
            let record = vpsf::FlightRecord {
                timestamp: t,
                lat,
                lon,
                vn_mps: vn as f32,
                ve_mps: ve as f32,
                hdop: out.hdop as f32,
                speed_mps: out.speed_mps as f32,
                heading_deg: out.heading_deg as f32,
                fix_quality: out.fix_quality,
                source: out.fix_quality,
                match_count: match_count.min(u16::MAX as u32) as u16,
                inlier_ratio: inlier_ratio as f32,
                latency_ms: latency_ms.min(u16::MAX as f64) as u16,
                flags,
            };
            if let Err(e) = recorder.record(&record) {
                tracing::warn!(error = %e, "flight record write failed");
            }
        }

        if self.frames_total % 100 == 0 {
            self.health.log_status();
        }

        #[cfg(feature = "metrics")]
        {
            let status = self.health.snapshot();
            let reconnects = self.transport.as_ref().map(|t| t.reconnect_count()).unwrap_or(0);
            let throttled = self.rate_limiter.stats().throttled;
            self.metrics.observe(&status, reconnects, throttled);
        }

        Ok(())
    }

    #[cfg(feature = "metrics")]
    fn metrics(&self) -> &metrics::LocatorMetrics {
        &self.metrics
    }

    fn shutdown(mut self) {
        if let Err(e) = self.frame_source.close() {
            tracing::warn!(error = %e, "error closing frame source");
        }
        self.transport = None;
        if let Some(recorder) = self.flight_recorder.take() {
            if let Err(e) = recorder.stop() {
                tracing::warn!(error = %e, "error stopping flight recorder");
            }
        }
        if let Some(sink) = self.telemetry.take() {
            if let Err(e) = sink.close() {
                tracing::warn!(error = %e, "error closing telemetry sink");
            }
        }
        tracing::info!(
            frames_total = self.frames_total,
            fixes_total = self.fixes_total,
            "locator shutdown"
        );
    }
}

async fn run(config: LocatorConfig) -> anyhow::Result<()> {
    tracing::info!(config = ?serde_json::to_value(&config).ok(), "locator starting");

    let mut locator = Locator::new(config.clone())?;

    #[cfg(feature = "metrics")]
    {
        let listener = tokio::net::TcpListener::bind(&config.metrics_addr).await?;
        let router = locator.metrics().router();
        tracing::info!(addr = %config.metrics_addr, "metrics endpoint listening");
        tokio::task::spawn(async move {
            if let Err(e) = axum::serve(listener, router).await {
                tracing::warn!(error = %e, "metrics server stopped");
            }
        });
    }

    let period = Duration::from_secs_f64(1.0 / config.target_hz);

    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown_signal() => {
                tracing::info!("shutdown signal received");
                break;
            }
            _ = interval.tick() => {
                let t = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_secs_f64();
                if let Err(e) = locator.tick(t) {
                    tracing::error!(error = %e, "fatal error in frame loop");
                    locator.shutdown();
                    return Err(e.into());
                }
            }
        }
    }

    locator.shutdown();
    Ok(())
}

/// Resolves on SIGINT or SIGTERM so the loop can drain owned resources
/// before exiting instead of dying mid-tick.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

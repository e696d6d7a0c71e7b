//! Runtime configuration for the onboard locator.
//!
//! A single JSON-backed struct, overridable by CLI flags and environment
//! variables via `clap`'s `env` feature. `check-config` loads and validates
//! this struct without starting the frame loop.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};

use crate::error::{LocatorError, Result};
use crate::transport::Protocol;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraConfig {
    /// OpenCV-style device index, or a path such as `/dev/video0`.
    pub device: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Selects the `picamera2` backend over the generic one. Out of scope
    /// for this crate: only the file-replay `FrameSource` is implemented,
    /// so this flag is carried for configuration-surface parity but has no
    /// effect until a real backend exists.
    pub use_picamera2: bool,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            device: "0".to_string(),
            width: 640,
            height: 640,
            fps: 10,
            use_picamera2: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolConfig {
    Nmea,
    Msp,
}

impl From<ProtocolConfig> for Protocol {
    fn from(p: ProtocolConfig) -> Self {
        match p {
            ProtocolConfig::Nmea => Protocol::Nmea,
            ProtocolConfig::Msp => Protocol::Msp,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UartConfig {
    pub port: String,
    pub baudrate: u32,
    pub enabled: bool,
    pub protocol: ProtocolConfig,
}

impl Default for UartConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyAMA0".to_string(),
            baudrate: 9600,
            enabled: true,
            protocol: ProtocolConfig::Nmea,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatcherConfig {
    pub superpoint_onnx: PathBuf,
    pub lightglue_onnx: PathBuf,
    /// Minimum inlier matches to accept a fix.
    pub min_matches: u32,
    /// Minimum inlier ratio (confidence).
    pub confidence_threshold: f64,
    /// Top-k tiles pulled from the retrieval index per frame.
    pub max_candidates: usize,
    /// Use the classical FAST/BRIEF matcher instead of the learned backend.
    pub use_classical_fallback: bool,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            superpoint_onnx: PathBuf::from("models/superpoint.onnx"),
            lightglue_onnx: PathBuf::from("models/lightglue.onnx"),
            min_matches: 15,
            confidence_threshold: 0.3,
            max_candidates: 5,
            use_classical_fallback: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocatorConfig {
    pub map_pack: PathBuf,
    pub camera: CameraConfig,
    pub uart: UartConfig,
    pub matcher: MatcherConfig,
    /// Target position-update rate in Hz.
    pub target_hz: f64,
    pub log_level: String,

    /// Position measurement noise, deg^2 (EKF `R`).
    pub ekf_measurement_noise: f64,
    /// Mahalanobis gate threshold (chi-sq, 2 DoF).
    pub ekf_gate_threshold: f64,

    /// Directory to write CSV telemetry into; unset disables the sink.
    pub telemetry_dir: Option<PathBuf>,
    /// Directory to write VPSF flight recordings into; unset disables it.
    pub flight_record_dir: Option<PathBuf>,

    /// Replays frames from a directory of images instead of opening a
    /// camera; used for offline testing. A real camera backend is out of
    /// scope for this crate.
    pub replay_frames_dir: Option<PathBuf>,

    /// Bind address for the Prometheus `/metrics` endpoint. Only read when
    /// the crate is built with the `metrics` feature.
    pub metrics_addr: String,
}

impl Default for LocatorConfig {
    fn default() -> Self {
        Self {
            map_pack: PathBuf::from("/opt/vps/maps/map_pack"),
            camera: CameraConfig::default(),
            uart: UartConfig::default(),
            matcher: MatcherConfig::default(),
            target_hz: 3.0,
            log_level: "INFO".to_string(),
            ekf_measurement_noise: 1e-8,
            ekf_gate_threshold: 9.0,
            telemetry_dir: None,
            flight_record_dir: None,
            replay_frames_dir: None,
            metrics_addr: "0.0.0.0:9090".to_string(),
        }
    }
}

impl LocatorConfig {
    /// Loads configuration from `path` (JSON). The file must be a complete
    /// document; unlike `Default`, partial JSON does not fall back field by
    /// field.
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .map_err(|e| LocatorError::InvalidInput(format!("cannot read config {}: {e}", path.display())))?;
        let config: LocatorConfig = serde_json::from_slice(&bytes)
            .map_err(|e| LocatorError::InvalidInput(format!("parsing config {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects configurations that would fail at start-up anyway, so
    /// `check-config` can catch them without opening a camera or port.
    pub fn validate(&self) -> Result<()> {
        if self.target_hz <= 0.0 {
            return Err(LocatorError::InvalidInput("target_hz must be positive".into()));
        }
        if self.matcher.max_candidates == 0 {
            return Err(LocatorError::InvalidInput("matcher.max_candidates must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.matcher.confidence_threshold) {
            return Err(LocatorError::InvalidInput(
                "matcher.confidence_threshold must be in [0, 1]".into(),
            ));
        }
        if !self.matcher.use_classical_fallback {
            if !self.matcher.superpoint_onnx.exists() {
                return Err(LocatorError::InvalidInput(format!(
                    "superpoint_onnx model not found at {}",
                    self.matcher.superpoint_onnx.display()
                )));
            }
            if !self.matcher.lightglue_onnx.exists() {
                return Err(LocatorError::InvalidInput(format!(
                    "lightglue_onnx model not found at {}",
                    self.matcher.lightglue_onnx.display()
                )));
            }
        }
        Ok(())
    }
}

#[derive(Parser, Debug)]
#[command(name = "locator", about = "Onboard GPS-denied visual positioning service")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Starts the frame-loop scheduler and runs until a shutdown signal.
    Run {
        #[arg(long, env = "LOCATOR_CONFIG")]
        config: Option<PathBuf>,
    },
    /// Validates a config file and exits without starting the loop.
    CheckConfig {
        #[arg(long, env = "LOCATOR_CONFIG")]
        config: PathBuf,
    },
}

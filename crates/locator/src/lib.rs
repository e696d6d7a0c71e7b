//! Onboard GPS-denied visual positioning: tile retrieval, feature matching,
//! homography-based geolocation, EKF fusion, and flight-controller transport.
//!
//! `main.rs` wires these modules into the frame-loop binary; this library
//! target exists so integration tests (and, eventually, other binaries) can
//! exercise the same components directly.

pub mod adaptive;
pub mod camera;
pub mod config;
pub mod dead_reckoning;
pub mod error;
pub mod feature;
pub mod filter;
pub mod fusion;
pub mod geo;
pub mod geofence;
pub mod health;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod homography;
pub mod preprocess;
pub mod rate_limiter;
pub mod telemetry;
pub mod tile_cache;
pub mod tile_index;
pub mod tile_store;
pub mod transport;

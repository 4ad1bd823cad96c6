//! A tightly-coupled LiDAR-inertial odometry and mapping engine core.
//!
//! Given a stream of LiDAR point clouds and inertial measurements from a
//! rigidly-coupled sensor pair, `Engine` estimates the 6-DoF pose of the
//! inertial sensor and incrementally builds a downsampled point-cloud map.
//! Sensor decoding, pose publication, and map persistence beyond the raw
//! dump in [`persist`] are left to the embedding application.

#![warn(missing_docs)]
#![warn(unused_extern_crates)]

pub mod config;
pub mod engine;
pub mod error;
pub mod geometry;
pub mod iekf;
pub mod imu;
pub mod kdtree;
pub mod map_window;
pub mod measurement;
pub mod persist;
pub mod sync;
pub mod types;

pub use config::EngineConfig;
pub use engine::{Engine, EngineHandle};
pub use error::EngineError;
pub use types::{ImuSample, MeasurePackage, Point, PointCloud, Pose};

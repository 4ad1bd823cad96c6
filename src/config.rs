//! Engine configuration: small serde-derived structs with `Default` impls,
//! loadable from a YAML file the way the teacher's `CoreConfig`/
//! `NavigationConfig` are.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::ConfigError;

/// k-d tree rebalance and downsampling parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KdTreeConfig {
    /// Voxel side used when downsampling points on insertion into the map.
    pub filter_size_map_min: f64,
    /// Max allowed left/right subtree size imbalance fraction.
    pub alpha_bal: f64,
    /// Max allowed fraction of deleted points in a subtree before rebuild.
    pub alpha_del: f64,
    /// Subtrees smaller than this are never rebalanced.
    pub min_rebuild_size: usize,
    /// Subtrees at or above this size are rebuilt on the background worker
    /// instead of inline.
    pub background_rebuild_size: usize,
}

impl Default for KdTreeConfig {
    fn default() -> Self {
        KdTreeConfig {
            filter_size_map_min: 0.5,
            alpha_bal: 0.65,
            alpha_del: 0.5,
            min_rebuild_size: 64,
            background_rebuild_size: 2000,
        }
    }
}

/// IMU process-noise and initialization parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImuConfig {
    /// Gyroscope measurement noise variance.
    pub gyr_cov: f64,
    /// Accelerometer measurement noise variance.
    pub acc_cov: f64,
    /// Gyroscope bias random-walk variance.
    pub b_gyr_cov: f64,
    /// Accelerometer bias random-walk variance.
    pub b_acc_cov: f64,
    /// Warm-up window, seconds, before the filter is considered inited.
    pub init_time: f64,
    /// Number of leading IMU samples averaged during initialization.
    pub init_samples: usize,
    /// LiDAR-to-IMU extrinsic translation.
    pub extrinsic_t: [f64; 3],
    /// LiDAR-to-IMU extrinsic rotation, row-major 3x3.
    pub extrinsic_r: [f64; 9],
}

impl Default for ImuConfig {
    fn default() -> Self {
        ImuConfig {
            gyr_cov: 0.1,
            acc_cov: 0.1,
            b_gyr_cov: 0.0001,
            b_acc_cov: 0.0001,
            init_time: 0.1,
            init_samples: 20,
            extrinsic_t: [0.04165, 0.02326, -0.0284],
            extrinsic_r: [1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0],
        }
    }
}

/// Point-to-plane measurement model parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeasurementConfig {
    /// Number of map neighbors used to fit the local plane.
    pub num_match_points: usize,
    /// Maximum squared distance (m^2) a neighbor may have to be used.
    pub max_neighbor_sq_dist: f64,
    /// Maximum perpendicular distance (m) a neighbor may have to the
    /// fitted plane for the plane to be accepted.
    pub plane_fit_tolerance: f64,
    /// Per-residual observation noise variance.
    pub laser_point_cov: f64,
}

impl Default for MeasurementConfig {
    fn default() -> Self {
        MeasurementConfig {
            num_match_points: 5,
            max_neighbor_sq_dist: 25.0,
            plane_fit_tolerance: 0.1,
            laser_point_cov: 0.001,
        }
    }
}

/// Bounded map-window parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapWindowConfig {
    /// Side length of the bounded map cube, meters.
    pub cube_len: f64,
    /// Nominal LiDAR range used to size the cube-sliding margin.
    pub det_range: f64,
    /// Fraction of `det_range` from a face that triggers a slide.
    pub mov_threshold: f64,
}

impl Default for MapWindowConfig {
    fn default() -> Self {
        MapWindowConfig {
            cube_len: 1000.0,
            det_range: 450.0,
            mov_threshold: 1.5,
        }
    }
}

/// Iterated Kalman filter iteration control.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IekfConfig {
    /// Maximum number of Gauss-Newton iterations per update.
    pub num_max_iterations: usize,
    /// Convergence threshold on the tangent-space update norm.
    pub converge_epsilon: f64,
}

impl Default for IekfConfig {
    fn default() -> Self {
        IekfConfig {
            num_max_iterations: 3,
            converge_epsilon: 0.001,
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EngineConfig {
    /// Voxel size for per-scan downsampling before the filter update.
    #[serde(default = "default_filter_size_surf_min")]
    pub filter_size_surf_min: f64,
    /// How many scans between two stored poses in the output path.
    #[serde(default = "default_path_sample_stride")]
    pub path_sample_stride: usize,
    /// k-d tree parameters.
    #[serde(default)]
    pub kdtree: KdTreeConfig,
    /// IMU processor parameters.
    #[serde(default)]
    pub imu: ImuConfig,
    /// Measurement model parameters.
    #[serde(default)]
    pub measurement: MeasurementConfig,
    /// Map window parameters.
    #[serde(default)]
    pub map_window: MapWindowConfig,
    /// IEKF iteration parameters.
    #[serde(default)]
    pub iekf: IekfConfig,
    /// Path the cumulative world-frame map is dumped to on a clean
    /// shutdown. `None` skips persistence entirely.
    #[serde(default)]
    pub map_save_path: Option<String>,
}

fn default_filter_size_surf_min() -> f64 {
    0.5
}

fn default_path_sample_stride() -> usize {
    10
}

impl EngineConfig {
    /// Loads configuration from a YAML file, falling back to per-field
    /// defaults for anything omitted.
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let file = std::fs::File::open(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        serde_yaml::from_reader(file).map_err(|e| ConfigError::Parse(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_documented_constants() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.filter_size_surf_min, 0.5);
        assert_eq!(cfg.kdtree.filter_size_map_min, 0.5);
        assert_eq!(cfg.map_window.cube_len, 1000.0);
        assert_eq!(cfg.map_window.det_range, 450.0);
        assert_eq!(cfg.iekf.num_max_iterations, 3);
        assert_eq!(cfg.measurement.num_match_points, 5);
    }
}

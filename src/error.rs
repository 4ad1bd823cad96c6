//! Top-level error type wrapping each component's own error enum.

use crate::imu::ImuError;
use crate::kdtree::KdTreeError;
use crate::iekf::IekfError;

/// Configuration load/parse failure.
#[derive(Debug)]
pub enum ConfigError {
    /// The config file could not be read from disk.
    Io(String),
    /// The file contents did not parse as valid config YAML.
    Parse(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ConfigError::Io(msg) => write!(f, "config io error: {}", msg),
            ConfigError::Parse(msg) => write!(f, "config parse error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Any error the engine's orchestrator may surface to a caller. Most of
/// these are recoverable at the call site the way the originating module
/// documents (see each variant's source); the orchestrator itself treats
/// all of them as "skip this scan and continue" rather than fatal.
#[derive(Debug)]
pub enum EngineError {
    /// A k-d tree operation failed.
    KdTree(KdTreeError),
    /// The IMU processor could not propagate or de-skew a scan.
    Imu(ImuError),
    /// The iterated Kalman filter failed to produce a valid update.
    Iekf(IekfError),
    /// Configuration could not be loaded.
    Config(ConfigError),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            EngineError::KdTree(e) => write!(f, "kd-tree error: {}", e),
            EngineError::Imu(e) => write!(f, "imu error: {}", e),
            EngineError::Iekf(e) => write!(f, "iekf error: {}", e),
            EngineError::Config(e) => write!(f, "config error: {}", e),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<KdTreeError> for EngineError {
    fn from(e: KdTreeError) -> Self {
        EngineError::KdTree(e)
    }
}

impl From<ImuError> for EngineError {
    fn from(e: ImuError) -> Self {
        EngineError::Imu(e)
    }
}

impl From<IekfError> for EngineError {
    fn from(e: IekfError) -> Self {
        EngineError::Iekf(e)
    }
}

impl From<ConfigError> for EngineError {
    fn from(e: ConfigError) -> Self {
        EngineError::Config(e)
    }
}

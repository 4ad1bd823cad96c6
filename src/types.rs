//! Shared data types flowing between the engine's components: raw sensor
//! samples, point clouds, synchronized packages, and pose outputs.

use nalgebra::{Matrix6, UnitQuaternion, Vector3};

/// A single LiDAR return, in the LiDAR's own frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    /// Cartesian coordinates in the LiDAR frame.
    pub position: Vector3<f64>,
    /// Return intensity, sensor-dependent units.
    pub intensity: f32,
    /// Offset from scan start, in milliseconds.
    pub time_offset_ms: f32,
}

impl Point {
    /// Builds a point with zero intensity and zero time offset.
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Point {
            position: Vector3::new(x, y, z),
            intensity: 0.0,
            time_offset_ms: 0.0,
        }
    }

    /// True if every coordinate is finite; non-finite points are rejected
    /// by the map on insertion.
    pub fn is_finite(&self) -> bool {
        self.position.iter().all(|v| v.is_finite())
    }
}

/// An ordered batch of points sharing one scan window. `start_time` is the
/// timestamp of the first point; the scan's end time is derived from the
/// last point's `time_offset_ms`.
#[derive(Debug, Clone, Default)]
pub struct PointCloud {
    /// Points in acquisition order.
    pub points: Vec<Point>,
    /// Timestamp (seconds) of the first point in the scan.
    pub start_time: f64,
}

impl PointCloud {
    /// Timestamp of the scan's last point, or `start_time` if empty.
    pub fn last_point_time(&self) -> f64 {
        match self.points.last() {
            Some(p) => self.start_time + p.time_offset_ms as f64 / 1000.0,
            None => self.start_time,
        }
    }

    /// Number of points currently held.
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// True when the cloud carries no points.
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// One inertial sample: angular velocity and specific force at a timestamp.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImuSample {
    /// Seconds, monotonic within a stream.
    pub timestamp: f64,
    /// Gyroscope reading, rad/s, in the IMU frame.
    pub angular_velocity: Vector3<f64>,
    /// Accelerometer reading, m/s^2, in the IMU frame (includes gravity).
    pub linear_acceleration: Vector3<f64>,
}

/// One LiDAR scan paired with every IMU sample covering its time window.
#[derive(Debug, Clone)]
pub struct MeasurePackage {
    /// The raw (not yet de-skewed) scan.
    pub cloud: PointCloud,
    /// Start of the scan window, seconds.
    pub scan_begin: f64,
    /// End of the scan window, seconds.
    pub scan_end: f64,
    /// IMU samples with `scan_begin <= ts <= scan_end`, in order.
    pub imu: Vec<ImuSample>,
}

/// A world-frame pose with orientation and position covariance, the shape
/// the engine reports to callers after each processed scan.
#[derive(Debug, Clone)]
pub struct Pose {
    /// Timestamp this pose is valid at (the scan's end time).
    pub time: f64,
    /// Position of the IMU frame in world coordinates.
    pub position: Vector3<f64>,
    /// Orientation of the IMU frame in world coordinates.
    pub orientation: UnitQuaternion<f64>,
    /// 6x6 covariance, ordered position-then-orientation (see `geometry`
    /// for the tangent-space ordering this is converted from).
    pub covariance: Matrix6<f64>,
}

/// A bounded history of poses, sampled every `sample_stride` scans to
/// keep memory use flat over long runs.
#[derive(Debug, Clone, Default)]
pub struct Path {
    /// Stored poses, oldest first.
    pub poses: Vec<Pose>,
    /// How many scans occur between two stored poses.
    pub sample_stride: usize,
    scans_since_sample: usize,
}

impl Path {
    /// Creates an empty path sampling one pose every `stride` scans.
    pub fn new(stride: usize) -> Self {
        Path {
            poses: Vec::new(),
            sample_stride: stride.max(1),
            scans_since_sample: 0,
        }
    }

    /// Offers a pose; it is stored only once `sample_stride` scans have
    /// elapsed since the last stored one.
    pub fn push_scan(&mut self, pose: Pose) {
        if self.scans_since_sample == 0 {
            self.poses.push(pose);
        }
        self.scans_since_sample = (self.scans_since_sample + 1) % self.sample_stride;
    }
}

//! IMU processing: stationary-window gravity/bias initialization, forward
//! propagation of the filter state across a scan, and backward de-skewing
//! of the raw points to the scan's end time.
//!
//! Grounded on `original_source/src/laserMapping.cpp`'s `ImuProcess`
//! (`imu_init`, the forward propagation loop, and `UndistortPcl`'s
//! backward integration).

use nalgebra::{UnitQuaternion, Vector3};

use crate::config::ImuConfig;
use crate::geometry::State;
use crate::iekf::{Cov, Iekf, Input, ProcessNoise};
use crate::types::{ImuSample, MeasurePackage, Point, PointCloud};

/// Errors the IMU processor can report.
#[derive(Debug)]
pub enum ImuError {
    /// No IMU samples cover the scan window at all.
    EmptyWindow,
    /// IMU samples exist but do not extend to the scan's end time.
    InsufficientCoverage,
}

impl std::fmt::Display for ImuError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ImuError::EmptyWindow => write!(f, "no imu samples cover the scan window"),
            ImuError::InsufficientCoverage => {
                write!(f, "imu samples do not extend to the scan's end time")
            }
        }
    }
}

impl std::error::Error for ImuError {}

/// One step of the forward-propagated trajectory, recorded so backward
/// de-skew can interpolate pose at any point timestamp within the scan.
#[derive(Debug, Clone)]
struct TrajectoryPoint {
    time: f64,
    rot: UnitQuaternion<f64>,
    pos: Vector3<f64>,
}

/// Initializes the filter state from a stationary window, then
/// propagates and de-skews subsequent scans.
pub struct ImuProcessor {
    cfg: ImuConfig,
    init_samples: Vec<ImuSample>,
    initialized: bool,
    last_sample: Option<ImuSample>,
}

impl ImuProcessor {
    /// Builds a processor with the given configuration.
    pub fn new(cfg: ImuConfig) -> Self {
        ImuProcessor {
            cfg,
            init_samples: Vec::new(),
            initialized: false,
            last_sample: None,
        }
    }

    fn extrinsic_rot(&self) -> UnitQuaternion<f64> {
        let r = &self.cfg.extrinsic_r;
        let m = nalgebra::Matrix3::new(
            r[0], r[1], r[2], //
            r[3], r[4], r[5], //
            r[6], r[7], r[8],
        );
        UnitQuaternion::from_matrix(&m)
    }

    fn extrinsic_trans(&self) -> Vector3<f64> {
        Vector3::from_row_slice(&self.cfg.extrinsic_t)
    }

    /// True once the stationary-window initialization has completed and
    /// `process` will run full propagation/de-skew.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Feeds IMU samples from one package into the initialization window.
    /// Once enough samples are collected, returns the initial `State`
    /// seeded with the averaged gravity direction and gyro bias.
    pub fn try_initialize(&mut self, pkg: &MeasurePackage) -> Option<State> {
        if self.initialized {
            return None;
        }
        self.init_samples.extend_from_slice(&pkg.imu);
        if self.init_samples.len() < self.cfg.init_samples {
            return None;
        }
        let n = self.init_samples.len() as f64;
        let mean_acc = self
            .init_samples
            .iter()
            .fold(Vector3::zeros(), |acc, s| acc + s.linear_acceleration)
            / n;
        let mean_gyro = self
            .init_samples
            .iter()
            .fold(Vector3::zeros(), |acc, s| acc + s.angular_velocity)
            / n;

        let mut state = State::identity();
        let g_norm = mean_acc.norm().max(1e-6);
        let gravity_dir = -mean_acc / g_norm;
        state.grav = gravity_dir * 9.81;
        // Align the world frame so +z is "up": rotate the identity frame
        // so that the measured -gravity direction becomes world z.
        state.rot = UnitQuaternion::rotation_between(&gravity_dir, &-Vector3::z())
            .unwrap_or_else(UnitQuaternion::identity)
            .inverse();
        state.bg = mean_gyro;
        state.offset_r = self.extrinsic_rot();
        state.offset_t = self.extrinsic_trans();

        self.initialized = true;
        self.last_sample = self.init_samples.last().copied();
        Some(state)
    }

    /// Forward-propagates `(state, cov)` across `pkg`'s IMU samples up to
    /// `pkg.scan_end`, recording the trajectory, then backward de-skews
    /// `pkg.cloud` against that trajectory. Returns the de-skewed cloud
    /// and the propagated `(state, cov)`.
    pub fn process(
        &mut self,
        state: &State,
        cov: &Cov,
        pkg: &MeasurePackage,
        iekf: &Iekf,
        noise: &ProcessNoise,
    ) -> Result<(PointCloud, State, Cov), ImuError> {
        if pkg.imu.is_empty() {
            return Err(ImuError::EmptyWindow);
        }
        if pkg.imu.last().unwrap().timestamp < pkg.scan_end - 1e-6 {
            return Err(ImuError::InsufficientCoverage);
        }

        let mut x = state.clone();
        let mut p = *cov;
        let mut trajectory = Vec::with_capacity(pkg.imu.len() + 1);
        trajectory.push(TrajectoryPoint {
            time: pkg.scan_begin,
            rot: x.rot,
            pos: x.pos,
        });

        let mut t_prev = pkg.scan_begin;
        for sample in &pkg.imu {
            let dt = (sample.timestamp - t_prev).max(0.0);
            if dt > 0.0 {
                let input = Input {
                    gyro: sample.angular_velocity,
                    accel: sample.linear_acceleration,
                };
                let (nx, np) = iekf.propagate(&x, &p, &input, dt, noise);
                x = nx;
                p = np;
            }
            trajectory.push(TrajectoryPoint {
                time: sample.timestamp,
                rot: x.rot,
                pos: x.pos,
            });
            t_prev = sample.timestamp;
        }

        let tail_dt = (pkg.scan_end - t_prev).max(0.0);
        if tail_dt > 0.0 {
            let last = pkg.imu.last().unwrap();
            let input = Input {
                gyro: last.angular_velocity,
                accel: last.linear_acceleration,
            };
            let (nx, np) = iekf.propagate(&x, &p, &input, tail_dt, noise);
            x = nx;
            p = np;
            trajectory.push(TrajectoryPoint {
                time: pkg.scan_end,
                rot: x.rot,
                pos: x.pos,
            });
        }

        let deskewed = self.deskew(&pkg.cloud, pkg.scan_begin, &x, &trajectory);
        self.last_sample = pkg.imu.last().copied();
        Ok((deskewed, x, p))
    }

    fn pose_at(&self, t: f64, trajectory: &[TrajectoryPoint]) -> (UnitQuaternion<f64>, Vector3<f64>) {
        if trajectory.len() == 1 {
            return (trajectory[0].rot, trajectory[0].pos);
        }
        let idx = trajectory.partition_point(|tp| tp.time <= t);
        let (a, b) = if idx == 0 {
            (&trajectory[0], &trajectory[1])
        } else if idx >= trajectory.len() {
            (&trajectory[trajectory.len() - 2], &trajectory[trajectory.len() - 1])
        } else {
            (&trajectory[idx - 1], &trajectory[idx])
        };
        let span = (b.time - a.time).max(1e-9);
        let ratio = ((t - a.time) / span).clamp(0.0, 1.0);
        let rot = a.rot.slerp(&b.rot, ratio);
        let pos = a.pos + (b.pos - a.pos) * ratio;
        (rot, pos)
    }

    /// Re-expresses every point of `cloud` (timestamped relative to
    /// `scan_begin`) as if it had been captured at `end_state`'s time,
    /// using the forward trajectory to interpolate the sensor pose at the
    /// point's own capture time.
    fn deskew(
        &self,
        cloud: &PointCloud,
        scan_begin: f64,
        end_state: &State,
        trajectory: &[TrajectoryPoint],
    ) -> PointCloud {
        let offset_r = end_state.offset_r;
        let offset_t = end_state.offset_t;
        let offset_r_inv = offset_r.inverse();
        let end_rot_inv = end_state.rot.inverse();

        let points = cloud
            .points
            .iter()
            .map(|pt| {
                let t = scan_begin + pt.time_offset_ms as f64 / 1000.0;
                let (rot_t, pos_t) = self.pose_at(t, trajectory);
                let p_world = rot_t * (offset_r * pt.position + offset_t) + pos_t;
                let p_end_body = end_rot_inv * (p_world - end_state.pos);
                let p_end_lidar = offset_r_inv * (p_end_body - offset_t);
                Point {
                    position: p_end_lidar,
                    intensity: pt.intensity,
                    time_offset_ms: 0.0,
                }
            })
            .collect();

        PointCloud {
            points,
            start_time: trajectory.last().map(|tp| tp.time).unwrap_or(scan_begin),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iekf::Iekf;

    fn noise() -> ProcessNoise {
        ProcessNoise {
            gyr_cov: 0.1,
            acc_cov: 0.1,
            b_gyr_cov: 0.0001,
            b_acc_cov: 0.0001,
        }
    }

    fn stationary_samples(n: usize, start: f64, dt: f64) -> Vec<ImuSample> {
        (0..n)
            .map(|i| ImuSample {
                timestamp: start + dt * i as f64,
                angular_velocity: Vector3::zeros(),
                linear_acceleration: Vector3::new(0.0, 0.0, 9.81),
            })
            .collect()
    }

    #[test]
    fn initializes_after_enough_samples() {
        let mut proc = ImuProcessor::new(ImuConfig {
            init_samples: 5,
            ..ImuConfig::default()
        });
        let pkg = MeasurePackage {
            cloud: PointCloud::default(),
            scan_begin: 0.0,
            scan_end: 0.1,
            imu: stationary_samples(5, 0.0, 0.01),
        };
        let state = proc.try_initialize(&pkg).expect("should initialize");
        assert!(proc.is_initialized());
        assert!((state.grav.norm() - 9.81).abs() < 1e-6);
    }

    #[test]
    fn zero_motion_deskew_is_near_identity() {
        let mut proc = ImuProcessor::new(ImuConfig {
            init_samples: 3,
            ..ImuConfig::default()
        });
        let warm = MeasurePackage {
            cloud: PointCloud::default(),
            scan_begin: 0.0,
            scan_end: 0.03,
            imu: stationary_samples(3, 0.0, 0.01),
        };
        let state = proc.try_initialize(&warm).unwrap();
        let cov = Cov::identity() * 1e-6;
        let iekf = Iekf::new(3, 0.001);

        let mut cloud = PointCloud {
            points: vec![Point::new(1.0, 0.0, 0.0)],
            start_time: 0.03,
        };
        cloud.points[0].time_offset_ms = 50.0;
        let pkg = MeasurePackage {
            cloud,
            scan_begin: 0.03,
            scan_end: 0.1,
            imu: stationary_samples(7, 0.03, 0.01),
        };
        let (deskewed, _, _) = proc.process(&state, &cov, &pkg, &iekf, &noise()).unwrap();
        assert_eq!(deskewed.points.len(), 1);
        assert!((deskewed.points[0].position - Vector3::new(1.0, 0.0, 0.0)).norm() < 1e-3);
    }

    #[test]
    fn missing_coverage_is_reported() {
        let mut proc = ImuProcessor::new(ImuConfig {
            init_samples: 1,
            ..ImuConfig::default()
        });
        let warm = MeasurePackage {
            cloud: PointCloud::default(),
            scan_begin: 0.0,
            scan_end: 0.01,
            imu: stationary_samples(1, 0.0, 0.01),
        };
        let state = proc.try_initialize(&warm).unwrap();
        let cov = Cov::identity() * 1e-6;
        let iekf = Iekf::new(3, 0.001);
        let pkg = MeasurePackage {
            cloud: PointCloud::default(),
            scan_begin: 0.01,
            scan_end: 1.0,
            imu: stationary_samples(2, 0.01, 0.01),
        };
        let err = proc.process(&state, &cov, &pkg, &iekf, &noise()).unwrap_err();
        matches!(err, ImuError::InsufficientCoverage);
    }
}

//! Sensor-stream synchronizer: pairs one LiDAR scan with all IMU samples
//! covering its window, tracks mean scan time, and clears queues on
//! out-of-order data.
//!
//! Grounded on `original_source/src/laserMapping.cpp`'s `sync_packages`,
//! `livox_pcl_cbk`, and `imu_cbk`.

use std::collections::VecDeque;

use crate::types::{ImuSample, MeasurePackage, PointCloud};

const TIME_SKEW_WARN_SECS: f64 = 10.0;

/// Buffers raw LiDAR and IMU streams and produces `MeasurePackage`s as
/// soon as enough IMU coverage has arrived for the oldest pending scan.
pub struct Synchronizer {
    lidar_queue: VecDeque<PointCloud>,
    imu_queue: VecDeque<ImuSample>,
    last_lidar_ts: Option<f64>,
    last_imu_ts: Option<f64>,
    mean_scan_time: f64,
    scan_count: u64,
    lidar_pushed: bool,
    scan_end_cache: Option<f64>,
}

impl Default for Synchronizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Synchronizer {
    /// Builds an empty synchronizer.
    pub fn new() -> Self {
        Synchronizer {
            lidar_queue: VecDeque::new(),
            imu_queue: VecDeque::new(),
            last_lidar_ts: None,
            last_imu_ts: None,
            mean_scan_time: 0.1,
            scan_count: 0,
            lidar_pushed: false,
            scan_end_cache: None,
        }
    }

    /// Enqueues a raw scan. If its start time is earlier than the last
    /// one seen, the LiDAR queue is cleared and a warning logged.
    pub fn push_lidar(&mut self, cloud: PointCloud) {
        if let Some(last) = self.last_lidar_ts {
            if cloud.start_time < last {
                log::warn!(
                    "lidar timestamp {} precedes last seen {}, clearing queue",
                    cloud.start_time,
                    last
                );
                self.lidar_queue.clear();
                self.lidar_pushed = false;
                self.scan_end_cache = None;
            }
        }
        self.last_lidar_ts = Some(cloud.start_time);
        self.lidar_queue.push_back(cloud);
    }

    /// Enqueues an IMU sample, applying the same out-of-order policy.
    pub fn push_imu(&mut self, sample: ImuSample) {
        if let Some(last) = self.last_imu_ts {
            if sample.timestamp < last {
                log::warn!(
                    "imu timestamp {} precedes last seen {}, clearing queue",
                    sample.timestamp,
                    last
                );
                self.imu_queue.clear();
            } else if sample.timestamp - last > TIME_SKEW_WARN_SECS {
                log::warn!(
                    "imu stream skewed by {:.1}s since last sample",
                    sample.timestamp - last
                );
            }
        }
        self.last_imu_ts = Some(sample.timestamp);
        self.imu_queue.push_back(sample);
    }

    /// Attempts to produce the next `MeasurePackage`. Returns `None` when
    /// there is no pending scan, or when IMU coverage has not yet
    /// extended to the scan's end time (not an error, simply "not ready
    /// yet").
    pub fn try_pop(&mut self) -> Option<MeasurePackage> {
        let cloud = self.lidar_queue.front()?;
        let scan_begin = cloud.start_time;

        let scan_end = if !self.lidar_pushed {
            let last_offset_s = cloud
                .points
                .last()
                .map(|p| p.time_offset_ms as f64 / 1000.0)
                .unwrap_or(0.0);
            let end = if last_offset_s < 0.5 * self.mean_scan_time {
                scan_begin + self.mean_scan_time
            } else {
                scan_begin + last_offset_s
            };
            self.scan_end_cache = Some(end);
            self.lidar_pushed = true;
            end
        } else {
            self.scan_end_cache.unwrap_or(scan_begin + self.mean_scan_time)
        };

        match self.last_imu_ts {
            Some(ts) if ts >= scan_end => {}
            _ => return None,
        }

        let cloud = self.lidar_queue.pop_front().expect("checked non-empty above");
        let mut imu = Vec::new();
        while let Some(front) = self.imu_queue.front() {
            if front.timestamp > scan_end {
                break;
            }
            imu.push(self.imu_queue.pop_front().expect("front just peeked"));
        }

        self.scan_count += 1;
        let n = self.scan_count as f64;
        self.mean_scan_time += ((scan_end - scan_begin) - self.mean_scan_time) / n;
        self.lidar_pushed = false;
        self.scan_end_cache = None;

        Some(MeasurePackage {
            cloud,
            scan_begin,
            scan_end,
            imu,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Point;
    use nalgebra::Vector3;

    fn imu_at(t: f64) -> ImuSample {
        ImuSample {
            timestamp: t,
            angular_velocity: Vector3::zeros(),
            linear_acceleration: Vector3::new(0.0, 0.0, 9.81),
        }
    }

    #[test]
    fn waits_until_imu_covers_scan_end() {
        let mut sync = Synchronizer::new();
        sync.push_lidar(PointCloud {
            points: vec![Point::new(1.0, 0.0, 0.0)],
            start_time: 0.0,
        });
        sync.push_imu(imu_at(0.01));
        assert!(sync.try_pop().is_none());
        sync.push_imu(imu_at(0.2));
        let pkg = sync.try_pop().expect("should be ready now");
        assert_eq!(pkg.scan_begin, 0.0);
        assert!(!pkg.imu.is_empty());
        assert!(pkg.imu.iter().all(|s| s.timestamp <= pkg.scan_end));
    }

    #[test]
    fn backward_lidar_timestamp_clears_queue() {
        let mut sync = Synchronizer::new();
        sync.push_lidar(PointCloud {
            points: vec![],
            start_time: 1.0,
        });
        sync.push_lidar(PointCloud {
            points: vec![],
            start_time: 0.5,
        });
        assert_eq!(sync.lidar_queue.len(), 1);
        assert_eq!(sync.lidar_queue.front().unwrap().start_time, 0.5);
    }
}

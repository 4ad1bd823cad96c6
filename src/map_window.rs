//! Keeps the map bounded to a cube around the sensor, trimming via lazy
//! box deletion on the k-d tree.
//!
//! Grounded on `original_source/src/laserMapping.cpp`'s
//! `lasermap_fov_segment`.

use nalgebra::Vector3;

use crate::config::MapWindowConfig;
use crate::kdtree::BoundingBox;

/// Tracks the current bounded-map cube and decides when/how to slide it.
pub struct MapWindow {
    cfg: MapWindowConfig,
    center: Option<Vector3<f64>>,
}

impl MapWindow {
    /// Builds a window manager with no cube established yet; the first
    /// call to `segment` centers the cube on the sensor.
    pub fn new(cfg: MapWindowConfig) -> Self {
        MapWindow { cfg, center: None }
    }

    /// Given the sensor's current world position, returns the boxes (if
    /// any) that should be deleted from the map to keep it bounded, and
    /// updates the tracked cube center.
    pub fn segment(&mut self, sensor_pos: &Vector3<f64>) -> Vec<BoundingBox> {
        let half = self.cfg.cube_len / 2.0;
        let center = match self.center {
            Some(c) => c,
            None => {
                self.center = Some(*sensor_pos);
                return Vec::new();
            }
        };

        let margin = self.cfg.mov_threshold * self.cfg.det_range;
        let mov = ((self.cfg.cube_len - 2.0 * margin) * 0.5 * 0.9)
            .max(self.cfg.det_range * (self.cfg.mov_threshold - 1.0));

        let mut new_center = center;
        let mut boxes = Vec::new();
        for axis in 0..3 {
            let dist_to_min = sensor_pos[axis] - (center[axis] - half);
            let dist_to_max = (center[axis] + half) - sensor_pos[axis];
            if dist_to_min < margin {
                new_center[axis] -= mov;
                boxes.push(Self::sliver(&new_center, &self.cfg, axis, false));
            } else if dist_to_max < margin {
                new_center[axis] += mov;
                boxes.push(Self::sliver(&new_center, &self.cfg, axis, true));
            }
        }
        self.center = Some(new_center);
        boxes
    }

    /// The box covering the strip the cube left behind when it slid along
    /// `axis` (towards the positive direction if `positive`).
    fn sliver(new_center: &Vector3<f64>, cfg: &MapWindowConfig, axis: usize, positive: bool) -> BoundingBox {
        let half = cfg.cube_len / 2.0;
        let mut min = [
            new_center.x - half,
            new_center.y - half,
            new_center.z - half,
        ];
        let mut max = [
            new_center.x + half,
            new_center.y + half,
            new_center.z + half,
        ];
        if positive {
            min[axis] = max[axis];
            max[axis] = f64::INFINITY;
        } else {
            max[axis] = min[axis];
            min[axis] = f64::NEG_INFINITY;
        }
        BoundingBox { min, max }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_call_only_centers_the_cube() {
        let mut win = MapWindow::new(MapWindowConfig::default());
        let boxes = win.segment(&Vector3::new(0.0, 0.0, 0.0));
        assert!(boxes.is_empty());
    }

    #[test]
    fn approaching_a_face_triggers_a_slide() {
        let cfg = MapWindowConfig {
            cube_len: 1000.0,
            det_range: 450.0,
            mov_threshold: 1.5,
        };
        let mut win = MapWindow::new(cfg);
        win.segment(&Vector3::new(0.0, 0.0, 0.0));
        let boxes = win.segment(&Vector3::new(450.0, 0.0, 0.0));
        assert!(!boxes.is_empty());
    }
}

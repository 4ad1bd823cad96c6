//! Binary point-cloud dump written once at shutdown, the one piece of
//! state this crate persists to disk.
//!
//! The teacher persists its topological map as YAML
//! (`src/core/memory.rs`'s `save`/`load`); a cumulative world-frame point
//! cloud doesn't serialize sensibly that way, so this is a flat binary
//! dump of `x,y,z,intensity` records instead (little-endian f32s,
//! following the convention of the PCD-style dumps `main()` writes on
//! exit in `original_source/src/laserMapping.cpp`).

use std::io::{self, Write};
use std::path::Path;

use crate::types::Point;

/// Writes `points` to `path` as a flat sequence of
/// `(x, y, z, intensity)` little-endian f32 records.
pub fn write_points<P: AsRef<Path>>(path: P, points: &[Point]) -> io::Result<()> {
    let mut file = io::BufWriter::new(std::fs::File::create(path)?);
    for p in points {
        file.write_all(&(p.position.x as f32).to_le_bytes())?;
        file.write_all(&(p.position.y as f32).to_le_bytes())?;
        file.write_all(&(p.position.z as f32).to_le_bytes())?;
        file.write_all(&p.intensity.to_le_bytes())?;
    }
    file.flush()
}

/// Reads back records written by `write_points`.
pub fn read_points<P: AsRef<Path>>(path: P) -> io::Result<Vec<Point>> {
    let bytes = std::fs::read(path)?;
    let record_size = 4 * 4;
    let mut points = Vec::with_capacity(bytes.len() / record_size);
    for chunk in bytes.chunks_exact(record_size) {
        let x = f32::from_le_bytes(chunk[0..4].try_into().unwrap());
        let y = f32::from_le_bytes(chunk[4..8].try_into().unwrap());
        let z = f32::from_le_bytes(chunk[8..12].try_into().unwrap());
        let intensity = f32::from_le_bytes(chunk[12..16].try_into().unwrap());
        points.push(Point {
            position: nalgebra::Vector3::new(x as f64, y as f64, z as f64),
            intensity,
            time_offset_ms: 0.0,
        });
    }
    Ok(points)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_a_temp_file() {
        let dir = std::env::temp_dir();
        let path = dir.join("lio_core_persist_test.bin");
        let points = vec![Point::new(1.0, 2.0, 3.0), Point::new(-1.5, 0.0, 4.25)];
        write_points(&path, &points).unwrap();
        let back = read_points(&path).unwrap();
        assert_eq!(back.len(), points.len());
        for (a, b) in points.iter().zip(back.iter()) {
            assert!((a.position - b.position).norm() < 1e-5);
        }
        let _ = std::fs::remove_file(&path);
    }
}

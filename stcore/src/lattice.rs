//! Spot coordinates and hexagonal lattice correction.
//!
//! Raw pixel coordinates from an imaging platform are close to, but not exactly on, a regular
//! lattice. Every [`CoordinateTable`] therefore carries a `unit_step` (the inter-spot spacing) so
//! that neighbour radii can be expressed in lattice steps instead of pixels. Hex correction snaps
//! spots onto an ideal hexagonal lattice with unit spacing.

use std::f64::consts::PI;

use log::{debug, warn};
use nalgebra::Point2;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use statrs::statistics::{Data, Median};

use crate::error::{Result, SpatialError};
use crate::neighbors::SpatialGrid;
use crate::table::index_ids;

/// Row pitch of a unit-spaced hexagonal lattice.
pub const HEX_ROW_PITCH: f64 = 0.866_025_403_784_438_6;

/// Acquisition platform; decides whether hex correction is applied by default.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Platform {
    /// Hexagonal spot array, rows horizontal.
    Visium,
    /// Irregular bead array.
    SlideSeq,
    Generic,
}

impl Platform {
    pub fn default_hex_axis(&self) -> Option<HexAxis> {
        match self {
            Platform::Visium => Some(HexAxis::Horizontal),
            Platform::SlideSeq | Platform::Generic => None,
        }
    }
}

/// Orientation of the straight lattice lines.
///
/// `Horizontal`: spots sit on horizontal rows and every other row is shifted by half a step.
/// `Vertical`: the transpose.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum HexAxis {
    Horizontal,
    Vertical,
}

/// One candidate place to read coordinates from.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum CoordinateSource {
    /// Two metadata columns.
    Metadata { x: Vec<f64>, y: Vec<f64> },
    /// Full-resolution pixel positions from an image descriptor, multiplied by `scale`.
    Image {
        pixel_x: Vec<f64>,
        pixel_y: Vec<f64>,
        scale: f64,
    },
    /// Column-major two-column buffer: `n` x values followed by `n` y values.
    Packed { values: Vec<f64> },
}

impl CoordinateSource {
    fn name(&self) -> &'static str {
        match self {
            CoordinateSource::Metadata { .. } => "metadata",
            CoordinateSource::Image { .. } => "image",
            CoordinateSource::Packed { .. } => "packed",
        }
    }

    /// Points for `n` spots, or why this source cannot provide them.
    fn points(&self, n: usize) -> std::result::Result<Vec<Point2<f64>>, String> {
        let (xs, ys, scale): (&[f64], &[f64], f64) = match self {
            CoordinateSource::Metadata { x, y } => (x, y, 1.0),
            CoordinateSource::Image {
                pixel_x,
                pixel_y,
                scale,
            } => {
                if !(scale.is_finite() && *scale > 0.0) {
                    return Err(format!("scale factor {} is not positive", scale));
                }
                (pixel_x, pixel_y, *scale)
            }
            CoordinateSource::Packed { values } => {
                if values.len() != 2 * n {
                    return Err(format!("{} packed values for {} spots", values.len(), n));
                }
                let (xs, ys) = values.split_at(n);
                (xs, ys, 1.0)
            }
        };
        if xs.len() != n || ys.len() != n {
            return Err(format!("{}/{} values for {} spots", xs.len(), ys.len(), n));
        }
        let mut out = Vec::with_capacity(n);
        for (i, (&x, &y)) in xs.iter().zip(ys).enumerate() {
            if !(x.is_finite() && y.is_finite()) {
                return Err(format!("non-finite coordinate at row {}", i));
            }
            out.push(Point2::new(x * scale, y * scale));
        }
        Ok(out)
    }
}

/// Canonical spot coordinates, shared read-only by every downstream analysis.
#[derive(Clone, Debug, PartialEq)]
pub struct CoordinateTable {
    ids: Vec<String>,
    points: Vec<Point2<f64>>,
    unit_step: f64,
    hex_axis: Option<HexAxis>,
}

impl CoordinateTable {
    /// Builds a table from raw points, estimating the unit step from the data.
    pub fn new(ids: Vec<String>, points: Vec<Point2<f64>>) -> Result<Self> {
        if ids.is_empty() {
            return Err(SpatialError::EmptyCoordinates);
        }
        if ids.len() != points.len() {
            return Err(SpatialError::mismatch(
                "coordinates",
                format!("{} ids but {} points", ids.len(), points.len()),
            ));
        }
        index_ids(&ids)?;
        if let Some(i) = points.iter().position(|p| !(p.x.is_finite() && p.y.is_finite())) {
            return Err(SpatialError::MissingCoordinates(format!(
                "non-finite coordinate for spot '{}'",
                ids[i]
            )));
        }
        let unit_step = estimate_unit_step(&points);
        Ok(CoordinateTable {
            ids,
            points,
            unit_step,
            hex_axis: None,
        })
    }

    /// Builds a table with a caller-supplied unit step.
    pub fn with_unit_step(ids: Vec<String>, points: Vec<Point2<f64>>, unit_step: f64) -> Result<Self> {
        if !(unit_step.is_finite() && unit_step > 0.0) {
            return Err(SpatialError::parameter("unit_step", "must be positive and finite"));
        }
        let mut table = CoordinateTable::new(ids, points)?;
        table.unit_step = unit_step;
        Ok(table)
    }

    /// Reads coordinates from the first usable source, then applies the platform's default hex
    /// correction.
    pub fn resolve(ids: Vec<String>, sources: &[CoordinateSource], platform: Platform) -> Result<Self> {
        CoordinateTable::resolve_with_axis(ids, sources, platform.default_hex_axis())
    }

    /// [`CoordinateTable::resolve`] with an explicit correction axis, `None` keeps raw positions.
    pub fn resolve_with_axis(ids: Vec<String>, sources: &[CoordinateSource], axis: Option<HexAxis>) -> Result<Self> {
        if ids.is_empty() {
            return Err(SpatialError::EmptyCoordinates);
        }
        let mut reasons = Vec::new();
        for source in sources {
            match source.points(ids.len()) {
                Ok(points) => {
                    debug!("coordinates taken from {} source", source.name());
                    let table = CoordinateTable::new(ids, points)?;
                    return match axis {
                        Some(axis) => table.hex_corrected(axis),
                        None => Ok(table),
                    };
                }
                Err(reason) => {
                    warn!("skipping {} coordinate source: {}", source.name(), reason);
                    reasons.push(format!("{}: {}", source.name(), reason));
                }
            }
        }
        if reasons.is_empty() {
            reasons.push("no sources supplied".to_string());
        }
        Err(SpatialError::MissingCoordinates(reasons.join("; ")))
    }

    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    pub fn points(&self) -> &[Point2<f64>] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Inter-spot spacing in coordinate units.
    pub fn unit_step(&self) -> f64 {
        self.unit_step
    }

    /// Axis of the last hex correction, if any.
    pub fn hex_axis(&self) -> Option<HexAxis> {
        self.hex_axis
    }

    /// New table with every spot snapped to the nearest unit-spaced hexagonal lattice site.
    ///
    /// Fails when two spots land on the same site, which usually means the wrong axis.
    pub fn hex_corrected(&self, axis: HexAxis) -> Result<Self> {
        let step = self.unit_step;
        if !(step.is_finite() && step > 0.0) {
            return Err(SpatialError::parameter(
                "unit_step",
                "cannot hex-correct coordinates without a positive spacing",
            ));
        }
        let oriented: Vec<(f64, f64)> = self
            .points
            .iter()
            .map(|p| match axis {
                HexAxis::Horizontal => (p.x / step, p.y / step),
                HexAxis::Vertical => (p.y / step, p.x / step),
            })
            .collect();

        let snapped = snap_rows(&oriented);
        let mut sites: FxHashMap<(i64, i64), usize> = FxHashMap::default();
        for (i, (u, v)) in snapped.iter().enumerate() {
            let site = ((2.0 * u).round() as i64, (v / HEX_ROW_PITCH).round() as i64);
            if let Some(first) = sites.insert(site, i) {
                return Err(SpatialError::parameter(
                    "hex_axis",
                    format!(
                        "spots '{}' and '{}' snap onto the same {:?} lattice site",
                        self.ids[first], self.ids[i], axis
                    ),
                ));
            }
        }
        let points = snapped
            .into_iter()
            .map(|(u, v)| match axis {
                HexAxis::Horizontal => Point2::new(u, v),
                HexAxis::Vertical => Point2::new(v, u),
            })
            .collect();

        debug!("hex-corrected {} spots along {:?} axis (step {:.3})", self.len(), axis, step);
        Ok(CoordinateTable {
            ids: self.ids.clone(),
            points,
            unit_step: 1.0,
            hex_axis: Some(axis),
        })
    }

    /// Hex correction that overwrites the stored coordinates.
    pub fn hex_correct_in_place(&mut self, axis: HexAxis) -> Result<()> {
        *self = self.hex_corrected(axis)?;
        Ok(())
    }
}

/// Snaps unit-scaled `(u, v)` points (rows along `u`) onto a hexagonal lattice.
fn snap_rows(points: &[(f64, f64)]) -> Vec<(f64, f64)> {
    let v0 = points.iter().map(|p| p.1).fold(f64::INFINITY, f64::min);
    let rows: Vec<i64> = points
        .iter()
        .map(|p| ((p.1 - v0) / HEX_ROW_PITCH).round() as i64)
        .collect();
    let offset = |r: i64| if r.rem_euclid(2) == 1 { 0.5 } else { 0.0 };

    // common phase of all columns once the half-step row shift is removed
    let (mut s, mut c) = (0.0, 0.0);
    for (p, &r) in points.iter().zip(&rows) {
        let a = 2.0 * PI * (p.0 - offset(r));
        s += a.sin();
        c += a.cos();
    }
    let phase = s.atan2(c) / (2.0 * PI);

    points
        .iter()
        .zip(&rows)
        .map(|(p, &r)| {
            let off = offset(r);
            let col = (p.0 - phase - off).round();
            (col + off, r as f64 * HEX_ROW_PITCH)
        })
        .collect()
}

/// Median nearest-neighbour distance, 1.0 for a single spot.
pub fn estimate_unit_step(points: &[Point2<f64>]) -> f64 {
    if points.len() < 2 {
        return 1.0;
    }
    let grid = SpatialGrid::with_auto_cell(points);
    let nearest: Vec<f64> = (0..points.len())
        .filter_map(|i| grid.nearest_distance(points, i))
        .filter(|d| *d > 0.0)
        .collect();
    if nearest.is_empty() {
        return 1.0;
    }
    Data::new(nearest).median()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("s{}", i)).collect()
    }

    /// Jittered horizontal hex lattice with spacing `step`.
    fn noisy_hex(rows: usize, cols: usize, step: f64) -> Vec<Point2<f64>> {
        let mut pts = Vec::new();
        for r in 0..rows {
            for c in 0..cols {
                let off = if r % 2 == 1 { 0.5 } else { 0.0 };
                let jitter = ((r * 31 + c * 17) % 7) as f64 * 0.01 - 0.03;
                pts.push(Point2::new(
                    (c as f64 + off + jitter) * step + 100.0,
                    (r as f64 * HEX_ROW_PITCH - jitter) * step + 40.0,
                ));
            }
        }
        pts
    }

    #[test]
    fn test_unit_step_estimate() {
        let pts = noisy_hex(6, 6, 138.0);
        let step = estimate_unit_step(&pts);
        assert!((step - 138.0).abs() < 138.0 * 0.1, "step {}", step);
    }

    #[test]
    fn test_hex_correction_normalizes_spacing() {
        let pts = noisy_hex(5, 5, 80.0);
        let table = CoordinateTable::new(ids(pts.len()), pts).unwrap();
        let hex = table.hex_corrected(HexAxis::Horizontal).unwrap();
        assert_eq!(hex.unit_step(), 1.0);
        assert_eq!(hex.hex_axis(), Some(HexAxis::Horizontal));

        let p = hex.points();
        // same row neighbours exactly one step apart
        assert!(((p[1].x - p[0].x) - 1.0).abs() < 1e-9);
        assert!((p[1].y - p[0].y).abs() < 1e-9);
        // next row offset by half a step at row pitch
        assert!(((p[5].x - p[0].x).abs() - 0.5).abs() < 1e-9);
        assert!(((p[5].y - p[0].y) - HEX_ROW_PITCH).abs() < 1e-9);
        // input untouched
        assert!(table.unit_step() > 1.0);
    }

    #[test]
    fn test_vertical_axis_is_transpose() {
        let pts: Vec<Point2<f64>> = noisy_hex(4, 4, 10.0)
            .into_iter()
            .map(|p| Point2::new(p.y, p.x))
            .collect();
        let table = CoordinateTable::new(ids(pts.len()), pts).unwrap();
        let hex = table.hex_corrected(HexAxis::Vertical).unwrap();
        let p = hex.points();
        assert!(((p[1].y - p[0].y) - 1.0).abs() < 1e-9);
        assert!((p[1].x - p[0].x).abs() < 1e-9);
    }

    /// Noise-free lattice with vertical lines: columns `pitch * step` apart, odd columns shifted.
    fn vertical_hex(rows: usize, cols: usize, step: f64) -> Vec<Point2<f64>> {
        let mut pts = Vec::new();
        for c in 0..cols {
            for r in 0..rows {
                let off = if c % 2 == 1 { 0.5 } else { 0.0 };
                pts.push(Point2::new(c as f64 * HEX_ROW_PITCH * step, (r as f64 + off) * step));
            }
        }
        pts
    }

    #[test]
    fn test_wrong_axis_collapses_spots_and_fails() {
        let pts = vertical_hex(8, 8, 100.0);
        let table = CoordinateTable::new(ids(pts.len()), pts).unwrap();
        let err = table.hex_corrected(HexAxis::Horizontal).unwrap_err();
        assert!(matches!(err, SpatialError::InvalidParameter { .. }));

        let hex = table.hex_corrected(HexAxis::Vertical).unwrap();
        assert_eq!(hex.len(), 64);
    }

    #[test]
    fn test_resolve_with_axis_overrides_platform() {
        let pts = vertical_hex(8, 8, 100.0);
        let sources = vec![CoordinateSource::Metadata {
            x: pts.iter().map(|p| p.x).collect(),
            y: pts.iter().map(|p| p.y).collect(),
        }];
        assert!(CoordinateTable::resolve(ids(64), &sources, Platform::Visium).is_err());
        let table = CoordinateTable::resolve_with_axis(ids(64), &sources, Some(HexAxis::Vertical)).unwrap();
        assert_eq!(table.hex_axis(), Some(HexAxis::Vertical));
        let raw = CoordinateTable::resolve_with_axis(ids(64), &sources, None).unwrap();
        assert_eq!(raw.hex_axis(), None);
    }

    #[test]
    fn test_in_place_reset() {
        let pts = noisy_hex(3, 3, 50.0);
        let mut table = CoordinateTable::new(ids(pts.len()), pts).unwrap();
        table.hex_correct_in_place(HexAxis::Horizontal).unwrap();
        assert_eq!(table.unit_step(), 1.0);
    }

    #[test]
    fn test_resolve_skips_unusable_sources() {
        let sources = vec![
            CoordinateSource::Metadata {
                x: vec![0.0, 1.0],
                y: vec![0.0],
            },
            CoordinateSource::Packed {
                values: vec![0.0, 2.0, 5.0, 5.0],
            },
        ];
        let table = CoordinateTable::resolve(ids(2), &sources, Platform::Generic).unwrap();
        assert_eq!(table.points()[1], Point2::new(2.0, 5.0));
        assert!((table.unit_step() - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_resolve_image_scale() {
        let sources = vec![CoordinateSource::Image {
            pixel_x: vec![0.0, 100.0],
            pixel_y: vec![0.0, 0.0],
            scale: 0.5,
        }];
        let table = CoordinateTable::resolve(ids(2), &sources, Platform::SlideSeq).unwrap();
        assert_eq!(table.points()[1], Point2::new(50.0, 0.0));
    }

    #[test]
    fn test_resolve_without_usable_source_fails() {
        let sources = vec![CoordinateSource::Metadata {
            x: vec![0.0, f64::NAN],
            y: vec![0.0, 1.0],
        }];
        let err = CoordinateTable::resolve(ids(2), &sources, Platform::Generic).unwrap_err();
        assert!(matches!(err, SpatialError::MissingCoordinates(_)));

        let err = CoordinateTable::resolve(ids(2), &[], Platform::Generic).unwrap_err();
        assert!(matches!(err, SpatialError::MissingCoordinates(_)));
    }

    #[test]
    fn test_empty_table_rejected() {
        assert_eq!(
            CoordinateTable::new(vec![], vec![]).unwrap_err(),
            SpatialError::EmptyCoordinates
        );
    }
}

//! Radius neighbour queries over spot coordinates.
//!
//! A [`NeighborIndex`] is built once per (coordinate table, radius) and then reused for any
//! number of signals. Queries go through a uniform bucket grid whose cell edge equals the
//! distance cutoff, so each spot only inspects the 3x3 block of cells around it. Tables of at
//! most [`PAIRWISE_LIMIT`] spots use a plain pairwise scan instead.

use log::debug;
use nalgebra::{distance, Point2};
use ordered_float::OrderedFloat;
use rayon::prelude::*;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SpatialError};
use crate::lattice::CoordinateTable;
use crate::table::index_ids;

/// Inputs up to this size are searched pairwise.
pub const PAIRWISE_LIMIT: usize = 64;

/// Coarse 2D bucketing of point indices (closed cells, row-major).
#[derive(Clone, Debug)]
pub struct SpatialGrid {
    lo: (f64, f64),
    inv_cell: f64,
    cell: f64,
    cols: usize,
    rows: usize,
    buckets: Vec<Vec<usize>>,
}

impl SpatialGrid {
    pub fn build(points: &[Point2<f64>], cell: f64) -> Self {
        let (mut x0, mut y0) = (f64::INFINITY, f64::INFINITY);
        let (mut x1, mut y1) = (f64::NEG_INFINITY, f64::NEG_INFINITY);
        for p in points {
            x0 = x0.min(p.x);
            y0 = y0.min(p.y);
            x1 = x1.max(p.x);
            y1 = y1.max(p.y);
        }
        if !x0.is_finite() {
            x0 = 0.0;
            y0 = 0.0;
            x1 = 0.0;
            y1 = 0.0;
        }

        // keep the cell count proportional to the point count
        let extent = (x1 - x0).max(y1 - y0);
        let floor = extent / (2.0 * (points.len().max(1) as f64).sqrt()).max(1.0);
        let cell = cell.max(floor).max(f64::EPSILON);

        let inv_cell = 1.0 / cell;
        let cols = (((x1 - x0) * inv_cell).floor() as usize) + 1;
        let rows = (((y1 - y0) * inv_cell).floor() as usize) + 1;
        let mut buckets = vec![Vec::<usize>::new(); cols * rows];

        let mut grid = SpatialGrid {
            lo: (x0, y0),
            inv_cell,
            cell,
            cols,
            rows,
            buckets: Vec::new(),
        };
        for (i, p) in points.iter().enumerate() {
            let (c, r) = grid.cell_of(p);
            buckets[r * cols + c].push(i);
        }
        grid.buckets = buckets;
        grid
    }

    /// Grid whose cells hold about one point each on average.
    pub fn with_auto_cell(points: &[Point2<f64>]) -> Self {
        let n = points.len().max(1) as f64;
        let (mut x0, mut y0) = (f64::INFINITY, f64::INFINITY);
        let (mut x1, mut y1) = (f64::NEG_INFINITY, f64::NEG_INFINITY);
        for p in points {
            x0 = x0.min(p.x);
            y0 = y0.min(p.y);
            x1 = x1.max(p.x);
            y1 = y1.max(p.y);
        }
        let (w, h) = ((x1 - x0).max(0.0), (y1 - y0).max(0.0));
        let cell = if w > 0.0 && h > 0.0 {
            (w * h / n).sqrt()
        } else {
            (w.max(h) / n).max(f64::EPSILON)
        };
        SpatialGrid::build(points, cell)
    }

    pub fn cell_size(&self) -> f64 {
        self.cell
    }

    #[inline]
    fn cell_of(&self, p: &Point2<f64>) -> (usize, usize) {
        let clamp = |v: f64, lo: f64, n: usize| -> usize {
            if v <= lo {
                0
            } else {
                (((v - lo) * self.inv_cell).floor() as usize).min(n - 1)
            }
        };
        (clamp(p.x, self.lo.0, self.cols), clamp(p.y, self.lo.1, self.rows))
    }

    /// Append indices from every cell touching the square of half-width `reach` around `p`.
    #[inline]
    pub fn gather(&self, p: &Point2<f64>, reach: f64, out: &mut Vec<usize>) {
        let (c0, r0) = self.cell_of(&Point2::new(p.x - reach, p.y - reach));
        let (c1, r1) = self.cell_of(&Point2::new(p.x + reach, p.y + reach));
        for r in r0..=r1 {
            for c in c0..=c1 {
                out.extend_from_slice(&self.buckets[r * self.cols + c]);
            }
        }
    }

    /// Distance from `points[i]` to its closest other point, searching rings of cells outward.
    pub fn nearest_distance(&self, points: &[Point2<f64>], i: usize) -> Option<f64> {
        let p = &points[i];
        let (pc, pr) = self.cell_of(p);
        let max_ring = self.cols.max(self.rows);
        let mut best: Option<f64> = None;

        for ring in 0..=max_ring {
            let c0 = pc.saturating_sub(ring);
            let r0 = pr.saturating_sub(ring);
            let c1 = (pc + ring).min(self.cols - 1);
            let r1 = (pr + ring).min(self.rows - 1);
            for r in r0..=r1 {
                for c in c0..=c1 {
                    let on_ring = r.abs_diff(pr) == ring || c.abs_diff(pc) == ring;
                    if !on_ring {
                        continue;
                    }
                    for &j in &self.buckets[r * self.cols + c] {
                        if j == i {
                            continue;
                        }
                        let d = distance(p, &points[j]);
                        if best.map_or(true, |b| d < b) {
                            best = Some(d);
                        }
                    }
                }
            }
            // anything in the next ring is at least `ring * cell` away
            if let Some(b) = best {
                if b <= ring as f64 * self.cell {
                    break;
                }
            }
        }
        best
    }
}

/// Radius query parameters.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NeighborQuery {
    /// Radius in lattice steps (1 = immediate ring).
    pub radius: f64,
    /// Whether every spot lists itself (at distance 0).
    pub include_self: bool,
    /// Relative slack on the distance cutoff for imperfect lattices.
    pub tolerance: f64,
}

impl Default for NeighborQuery {
    fn default() -> Self {
        NeighborQuery {
            radius: 1.0,
            include_self: false,
            tolerance: 0.05,
        }
    }
}

impl NeighborQuery {
    pub fn radius(radius: f64) -> Self {
        NeighborQuery {
            radius,
            ..Default::default()
        }
    }

    pub fn with_self(mut self) -> Self {
        self.include_self = true;
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Neighbor {
    /// Row in the coordinate table.
    pub index: usize,
    /// Euclidean distance in coordinate units.
    pub distance: f64,
}

/// Neighbour lists for every spot, ordered by (distance, index).
#[derive(Clone, Debug)]
pub struct NeighborIndex {
    ids: Vec<String>,
    positions: FxHashMap<String, usize>,
    unit_step: f64,
    radius: f64,
    include_self: bool,
    lists: Vec<Vec<Neighbor>>,
}

impl NeighborIndex {
    pub fn build(coords: &CoordinateTable, query: &NeighborQuery) -> Result<Self> {
        let n = coords.len();
        if n == 0 {
            return Err(SpatialError::EmptyCoordinates);
        }
        if !(query.radius.is_finite() && query.radius >= 0.0) {
            return Err(SpatialError::parameter("radius", format!("{} is not a non-negative number", query.radius)));
        }
        if !(query.tolerance.is_finite() && query.tolerance >= 0.0) {
            return Err(SpatialError::parameter("tolerance", "must be non-negative"));
        }

        let points = coords.points();
        let cutoff = query.radius * coords.unit_step() * (1.0 + query.tolerance);

        let mut lists: Vec<Vec<Neighbor>> = if query.radius == 0.0 {
            vec![Vec::new(); n]
        } else if n <= PAIRWISE_LIMIT {
            (0..n)
                .map(|i| {
                    (0..n)
                        .filter(|&j| j != i)
                        .map(|j| Neighbor { index: j, distance: distance(&points[i], &points[j]) })
                        .filter(|nb| nb.distance <= cutoff)
                        .collect()
                })
                .collect()
        } else {
            let grid = SpatialGrid::build(points, cutoff);
            (0..n)
                .into_par_iter()
                .map(|i| {
                    let mut cand = Vec::new();
                    grid.gather(&points[i], cutoff, &mut cand);
                    cand.into_iter()
                        .filter(|&j| j != i)
                        .map(|j| Neighbor { index: j, distance: distance(&points[i], &points[j]) })
                        .filter(|nb| nb.distance <= cutoff)
                        .collect()
                })
                .collect()
        };

        lists.par_iter_mut().enumerate().for_each(|(i, list)| {
            list.sort_by_key(|nb| (OrderedFloat(nb.distance), nb.index));
            if query.include_self {
                list.insert(0, Neighbor { index: i, distance: 0.0 });
            }
        });

        let positions = index_ids(coords.ids())?
            .into_iter()
            .map(|(id, i)| (id.to_string(), i))
            .collect();
        let index = NeighborIndex {
            ids: coords.ids().to_vec(),
            positions,
            unit_step: coords.unit_step(),
            radius: query.radius,
            include_self: query.include_self,
            lists,
        };
        debug!(
            "neighbour index: {} spots, radius {}, mean degree {:.2}",
            n,
            query.radius,
            index.mean_degree()
        );
        Ok(index)
    }

    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn radius(&self) -> f64 {
        self.radius
    }

    pub fn unit_step(&self) -> f64 {
        self.unit_step
    }

    pub fn includes_self(&self) -> bool {
        self.include_self
    }

    #[inline]
    pub fn neighbors(&self, row: usize) -> &[Neighbor] {
        &self.lists[row]
    }

    pub fn neighbors_of(&self, id: &str) -> Option<&[Neighbor]> {
        self.position(id).map(|i| self.neighbors(i))
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        self.positions.get(id).copied()
    }

    /// Neighbour count per spot.
    pub fn degrees(&self) -> Vec<usize> {
        self.lists.iter().map(|l| l.len()).collect()
    }

    pub fn mean_degree(&self) -> f64 {
        if self.lists.is_empty() {
            return 0.0;
        }
        self.lists.iter().map(|l| l.len()).sum::<usize>() as f64 / self.lists.len() as f64
    }

    /// True when every neighbour relation is reciprocated.
    pub fn is_symmetric(&self) -> bool {
        self.lists.par_iter().enumerate().all(|(i, list)| {
            list.iter()
                .all(|nb| self.lists[nb.index].iter().any(|back| back.index == i))
        })
    }

    /// Rows of this index for each id in `ids`, validating that both cover the same spots.
    pub fn rows_for(&self, ids: &[String], table: &str) -> Result<Vec<usize>> {
        if ids.len() != self.ids.len() {
            return Err(SpatialError::mismatch(
                table,
                format!("{} spots, neighbour index has {}", ids.len(), self.ids.len()),
            ));
        }
        if ids == self.ids.as_slice() {
            return Ok((0..ids.len()).collect());
        }
        ids.iter()
            .map(|id| {
                self.position(id).ok_or_else(|| {
                    SpatialError::mismatch(table, format!("spot '{}' not in neighbour index", id))
                })
            })
            .collect()
    }
}

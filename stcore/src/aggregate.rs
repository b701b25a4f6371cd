//! Neighbourhood aggregation of per-spot signals.
//!
//! Every score engine smooths its inputs through [`Aggregator`]: a neighbour index, a weighting
//! policy and an optional neighbour filter. The center spot always contributes. Missing values are
//! skipped unless [`MissingPolicy::ZeroFill`] is requested, and a spot whose whole neighbourhood is
//! missing stays missing. Vector signals are aggregated component-wise.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SpatialError};
use crate::neighbors::NeighborIndex;
use crate::table::{LabelTable, Signal, SignalMatrix, SpotSignal};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggregationMethod {
    /// Arithmetic mean over the spot and its neighbours.
    Mean,
    /// Inverse-distance weighted mean, weight = 1 / d^exponent.
    Weighted,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MissingPolicy {
    Skip,
    ZeroFill,
}

/// Aggregation knobs.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationOpts {
    pub method: AggregationMethod,
    /// Distance exponent for [`AggregationMethod::Weighted`] (default: 1.0)
    pub exponent: f64,
    /// Stand-in distance of a spot to itself, in lattice steps (default: 0.5)
    pub self_distance: f64,
    pub missing: MissingPolicy,
}

impl Default for AggregationOpts {
    fn default() -> Self {
        AggregationOpts {
            method: AggregationMethod::Weighted,
            exponent: 1.0,
            self_distance: 0.5,
            missing: MissingPolicy::Skip,
        }
    }
}

impl AggregationOpts {
    pub fn mean() -> Self {
        AggregationOpts {
            method: AggregationMethod::Mean,
            ..Default::default()
        }
    }

    pub fn weighted(exponent: f64) -> Self {
        AggregationOpts {
            method: AggregationMethod::Weighted,
            exponent,
            ..Default::default()
        }
    }

    fn validate(&self) -> Result<()> {
        if !(self.exponent.is_finite() && self.exponent >= 0.0) {
            return Err(SpatialError::parameter("exponent", format!("{} must be >= 0", self.exponent)));
        }
        if !(self.self_distance.is_finite() && self.self_distance > 0.0) {
            return Err(SpatialError::parameter(
                "self_distance",
                format!("{} must be > 0", self.self_distance),
            ));
        }
        Ok(())
    }
}

/// Which neighbours take part, relative to the center spot.
///
/// Labels are compared by value; rows are positions in the neighbour index.
#[derive(Clone, Copy, Debug)]
pub enum NeighborFilter<'l> {
    All,
    /// Only neighbours carrying the center's label.
    SameLabel(&'l LabelTable),
    /// Only neighbours carrying a different label. The center still contributes.
    OtherLabel(&'l LabelTable),
}

/// Aggregation bound to one neighbour index.
#[derive(Clone, Debug)]
pub struct Aggregator<'a> {
    index: &'a NeighborIndex,
    opts: AggregationOpts,
}

impl<'a> Aggregator<'a> {
    pub fn new(index: &'a NeighborIndex, opts: AggregationOpts) -> Result<Self> {
        opts.validate()?;
        Ok(Aggregator { index, opts })
    }

    pub fn index(&self) -> &NeighborIndex {
        self.index
    }

    pub fn opts(&self) -> &AggregationOpts {
        &self.opts
    }

    #[inline]
    fn weight(&self, distance_steps: f64) -> f64 {
        match self.opts.method {
            AggregationMethod::Mean => 1.0,
            AggregationMethod::Weighted => {
                let d = if distance_steps > 0.0 { distance_steps } else { self.opts.self_distance };
                1.0 / d.powf(self.opts.exponent)
            }
        }
    }

    /// Smooths a scalar signal; `labels` restricts each neighbourhood to the center's domain.
    pub fn smooth(&self, signal: &Signal, labels: Option<&LabelTable>) -> Result<Signal> {
        let filter = labels.map_or(NeighborFilter::All, NeighborFilter::SameLabel);
        let values = self.aggregate_with(signal, filter)?;
        Ok(signal.with_values(values))
    }

    /// Component-wise smoothing of a matrix signal.
    pub fn smooth_matrix(&self, signal: &SignalMatrix, labels: Option<&LabelTable>) -> Result<SignalMatrix> {
        let filter = labels.map_or(NeighborFilter::All, NeighborFilter::SameLabel);
        let data = self.aggregate_with(signal, filter)?;
        SignalMatrix::new(signal.ids().to_vec(), signal.columns().to_vec(), data)
    }

    /// Row-major aggregate of any signal, in the signal's own row order.
    pub fn aggregate_with<S: SpotSignal>(&self, signal: &S, filter: NeighborFilter<'_>) -> Result<Vec<Option<f64>>> {
        let ids = signal.spot_ids();
        let k = signal.n_components();
        if ids.is_empty() {
            return Err(SpatialError::empty("signal"));
        }
        let rows = self.index.rows_for(ids, "signal")?;
        let mut signal_row = vec![0usize; rows.len()];
        for (r, &i) in rows.iter().enumerate() {
            signal_row[i] = r;
        }

        // labels in index order
        let label_of: Option<Vec<&str>> = match filter {
            NeighborFilter::All => None,
            NeighborFilter::SameLabel(l) | NeighborFilter::OtherLabel(l) => {
                let lr = self.index.rows_for(l.ids(), "labels")?;
                let mut by_index = vec![""; lr.len()];
                for (r, &i) in lr.iter().enumerate() {
                    by_index[i] = l.values()[r].as_str();
                }
                Some(by_index)
            }
        };
        let want_same = matches!(filter, NeighborFilter::SameLabel(_));

        let mut out = vec![None; ids.len() * k];
        if k == 0 {
            return Ok(out);
        }
        let step = self.index.unit_step();
        let self_w = self.weight(0.0);

        out.par_chunks_mut(k).enumerate().for_each(|(r, cells)| {
            let center = rows[r];
            let members: Vec<(usize, f64)> = self
                .index
                .neighbors(center)
                .iter()
                .filter(|nb| nb.index != center)
                .filter(|nb| match &label_of {
                    None => true,
                    Some(lab) => (lab[nb.index] == lab[center]) == want_same,
                })
                .map(|nb| (signal_row[nb.index], self.weight(nb.distance / step)))
                .collect();

            for (c, cell) in cells.iter_mut().enumerate() {
                let mut num = 0.0;
                let mut den = 0.0;
                let mut add = |v: Option<f64>, w: f64| {
                    let v = match (v, self.opts.missing) {
                        (Some(v), _) => v,
                        (None, MissingPolicy::ZeroFill) => 0.0,
                        (None, MissingPolicy::Skip) => return,
                    };
                    num += w * v;
                    den += w;
                };
                add(signal.component(r, c), self_w);
                for &(row, w) in &members {
                    add(signal.component(row, c), w);
                }
                *cell = if den > 0.0 { Some(num / den) } else { None };
            }
        });
        Ok(out)
    }

    /// Mean over neighbours carrying a label different from the center's, excluding the center.
    /// `None` when no such neighbour has a value.
    pub fn cross_label_mean(&self, signal: &Signal, labels: &LabelTable) -> Result<Signal> {
        let rows = self.index.rows_for(signal.ids(), "signal")?;
        let mut signal_row = vec![0usize; rows.len()];
        for (r, &i) in rows.iter().enumerate() {
            signal_row[i] = r;
        }
        let lr = self.index.rows_for(labels.ids(), "labels")?;
        let mut label_of = vec![""; lr.len()];
        for (r, &i) in lr.iter().enumerate() {
            label_of[i] = labels.values()[r].as_str();
        }
        let step = self.index.unit_step();

        let values: Vec<Option<f64>> = (0..signal.len())
            .into_par_iter()
            .map(|r| {
                let center = rows[r];
                let mut num = 0.0;
                let mut den = 0.0;
                for nb in self.index.neighbors(center) {
                    if nb.index == center || label_of[nb.index] == label_of[center] {
                        continue;
                    }
                    let v = match (signal.values()[signal_row[nb.index]], self.opts.missing) {
                        (Some(v), _) => v,
                        (None, MissingPolicy::ZeroFill) => 0.0,
                        (None, MissingPolicy::Skip) => continue,
                    };
                    let w = self.weight(nb.distance / step);
                    num += w * v;
                    den += w;
                }
                if den > 0.0 { Some(num / den) } else { None }
            })
            .collect();
        Ok(signal.with_values(values))
    }
}

/// One-shot aggregation of a scalar signal.
pub fn aggregate(
    signal: &Signal,
    index: &NeighborIndex,
    opts: &AggregationOpts,
    labels: Option<&LabelTable>,
) -> Result<Signal> {
    Aggregator::new(index, opts.clone())?.smooth(signal, labels)
}

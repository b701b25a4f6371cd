//! Tertiary lymphoid structure score.
//!
//! Three inputs (two gene-signature scores and a B/plasma x T-cell co-distribution signal) are
//! each smoothed within their tissue domain, optionally rescaled to [0, 1], and merged per spot
//! by a pluggable [`ScoreCombiner`].

use log::debug;
use serde::{Deserialize, Serialize};

use crate::aggregate::{AggregationOpts, Aggregator};
use crate::error::{Result, SpatialError};
use crate::neighbors::NeighborIndex;
use crate::scores::rescale_unit;
use crate::table::{align_rows, LabelTable, Signal};

/// Merges the per-spot component values into one score.
pub trait ScoreCombiner: Send + Sync {
    fn combine(&self, parts: &[f64]) -> f64;

    fn name(&self) -> &str;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ArithmeticMean;

impl ScoreCombiner for ArithmeticMean {
    fn combine(&self, parts: &[f64]) -> f64 {
        if parts.is_empty() {
            return 0.0;
        }
        parts.iter().sum::<f64>() / parts.len() as f64
    }

    fn name(&self) -> &str {
        "arithmetic_mean"
    }
}

/// Zero in any component gives zero; negative parts are clamped to zero.
#[derive(Clone, Copy, Debug, Default)]
pub struct GeometricMean;

impl ScoreCombiner for GeometricMean {
    fn combine(&self, parts: &[f64]) -> f64 {
        if parts.is_empty() {
            return 0.0;
        }
        let log_sum: f64 = parts.iter().map(|p| p.max(0.0).ln()).sum();
        (log_sum / parts.len() as f64).exp()
    }

    fn name(&self) -> &str {
        "geometric_mean"
    }
}

/// Weighted mean with weights normalised to sum 1.
#[derive(Clone, Debug)]
pub struct WeightedMean {
    weights: Vec<f64>,
}

impl WeightedMean {
    pub fn new(weights: Vec<f64>) -> Result<Self> {
        let sum: f64 = weights.iter().sum();
        if weights.iter().any(|w| !(w.is_finite() && *w >= 0.0)) || sum <= 0.0 {
            return Err(SpatialError::parameter("weights", "need non-negative weights with a positive sum"));
        }
        Ok(WeightedMean {
            weights: weights.into_iter().map(|w| w / sum).collect(),
        })
    }
}

impl ScoreCombiner for WeightedMean {
    fn combine(&self, parts: &[f64]) -> f64 {
        parts.iter().zip(&self.weights).map(|(p, w)| p * w).sum()
    }

    fn name(&self) -> &str {
        "weighted_mean"
    }
}

/// Serializable choice of combiner.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum CombineRule {
    ArithmeticMean,
    GeometricMean,
    WeightedMean(Vec<f64>),
}

impl CombineRule {
    pub fn combiner(&self) -> Result<Box<dyn ScoreCombiner>> {
        Ok(match self {
            CombineRule::ArithmeticMean => Box::new(ArithmeticMean),
            CombineRule::GeometricMean => Box::new(GeometricMean),
            CombineRule::WeightedMean(w) => {
                if w.len() != 3 {
                    return Err(SpatialError::parameter(
                        "weights",
                        format!("TLS combines 3 components, got {} weights", w.len()),
                    ));
                }
                Box::new(WeightedMean::new(w.clone())?)
            }
        })
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsOpts {
    pub aggregation: AggregationOpts,
    /// Min-max rescale each smoothed component before combining (default: true)
    pub rescale_components: bool,
    pub combine: CombineRule,
}

impl Default for TlsOpts {
    fn default() -> Self {
        TlsOpts {
            aggregation: AggregationOpts::default(),
            rescale_components: true,
            combine: CombineRule::ArithmeticMean,
        }
    }
}

/// The three smoothed components and the combined score, keyed like `signature_a`.
#[derive(Clone, Debug, PartialEq)]
pub struct TlsScores {
    pub signature_a: Signal,
    pub signature_b: Signal,
    pub codistribution: Signal,
    pub score: Signal,
}

pub fn tls_score(
    signature_a: &Signal,
    signature_b: &Signal,
    codistribution: &Signal,
    domains: &LabelTable,
    index: &NeighborIndex,
    opts: &TlsOpts,
) -> Result<TlsScores> {
    let combiner = opts.combine.combiner()?;
    tls_score_with(signature_a, signature_b, codistribution, domains, index, opts, combiner.as_ref())
}

/// [`tls_score`] with an explicit combiner; `opts.combine` is ignored.
pub fn tls_score_with(
    signature_a: &Signal,
    signature_b: &Signal,
    codistribution: &Signal,
    domains: &LabelTable,
    index: &NeighborIndex,
    opts: &TlsOpts,
    combiner: &dyn ScoreCombiner,
) -> Result<TlsScores> {
    if signature_a.is_empty() {
        return Err(SpatialError::empty("TLS signature"));
    }
    let agg = Aggregator::new(index, opts.aggregation.clone())?;
    let smooth = |s: &Signal| -> Result<Signal> {
        let out = agg.smooth(s, Some(domains))?;
        Ok(if opts.rescale_components { rescale_unit(&out) } else { out })
    };
    let a = smooth(signature_a)?;
    let b = smooth(signature_b)?;
    let c = smooth(codistribution)?;

    let rows_b = align_rows(b.ids(), a.ids(), "signature_b")?;
    let rows_c = align_rows(c.ids(), a.ids(), "codistribution")?;
    let values: Vec<Option<f64>> = (0..a.len())
        .map(|r| {
            let parts = [a.values()[r]?, b.values()[rows_b[r]]?, c.values()[rows_c[r]]?];
            Some(combiner.combine(&parts))
        })
        .collect();
    let score = a.with_values(values);

    debug!("TLS score ({}) over {} spots", combiner.name(), score.len());
    Ok(TlsScores {
        signature_a: a,
        signature_b: b,
        codistribution: c,
        score,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lattice::CoordinateTable;
    use crate::neighbors::NeighborQuery;
    use nalgebra::Point2;

    fn line(n: usize) -> (CoordinateTable, LabelTable) {
        let ids: Vec<String> = (0..n).map(|i| format!("s{}", i)).collect();
        let pts = (0..n).map(|i| Point2::new(i as f64, 0.0)).collect();
        let coords = CoordinateTable::with_unit_step(ids.clone(), pts, 1.0).unwrap();
        let dom = LabelTable::new(ids, vec!["D".to_string(); n]).unwrap();
        (coords, dom)
    }

    #[test]
    fn test_combiners() {
        assert!((ArithmeticMean.combine(&[0.0, 0.5, 1.0]) - 0.5).abs() < 1e-12);
        assert!((GeometricMean.combine(&[0.25, 1.0, 1.0]) - 0.25f64.powf(1.0 / 3.0)).abs() < 1e-12);
        assert_eq!(GeometricMean.combine(&[0.0, 1.0, 1.0]), 0.0);
        let w = WeightedMean::new(vec![2.0, 1.0, 1.0]).unwrap();
        assert!((w.combine(&[1.0, 0.0, 0.0]) - 0.5).abs() < 1e-12);
        assert!(WeightedMean::new(vec![0.0, 0.0]).is_err());
        assert!(CombineRule::WeightedMean(vec![1.0]).combiner().is_err());
    }

    #[test]
    fn test_tls_score_bounded_and_components_returned() {
        let (coords, dom) = line(8);
        let idx = NeighborIndex::build(&coords, &NeighborQuery::radius(1.0)).unwrap();
        let ids = coords.ids().to_vec();
        let a = Signal::from_dense(ids.clone(), vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0]).unwrap();
        let b = Signal::from_dense(ids.clone(), vec![7.0, 6.0, 5.0, 4.0, 3.0, 2.0, 1.0, 0.0]).unwrap();
        let c = Signal::from_dense(ids, vec![0.1; 8]).unwrap();

        let s = tls_score(&a, &b, &c, &dom, &idx, &TlsOpts::default()).unwrap();
        assert_eq!(s.signature_a.len(), 8);
        assert!(s.score.values().iter().flatten().all(|v| (0.0..=1.0).contains(v)));
        assert_eq!(s.signature_a.max_value(), Some(1.0));
        // constant co-distribution rescales to 0
        assert!(s.codistribution.values().iter().all(|v| *v == Some(0.0)));
    }

    #[test]
    fn test_missing_component_gives_missing_score() {
        let (coords, dom) = line(3);
        let idx = NeighborIndex::build(&coords, &NeighborQuery::radius(0.0)).unwrap();
        let ids = coords.ids().to_vec();
        let a = Signal::new(ids.clone(), vec![Some(1.0), None, Some(0.0)]).unwrap();
        let b = Signal::from_dense(ids.clone(), vec![1.0, 1.0, 0.0]).unwrap();
        let c = Signal::from_dense(ids, vec![1.0, 1.0, 0.0]).unwrap();
        let opts = TlsOpts {
            rescale_components: false,
            ..Default::default()
        };
        let s = tls_score_with(&a, &b, &c, &dom, &idx, &opts, &GeometricMean).unwrap();
        assert_eq!(s.score.values(), &[Some(1.0), None, Some(0.0)]);
    }
}

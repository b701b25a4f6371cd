//! Tumor-normal interface score.
//!
//! The score blends two aggregates of the tumor enrichment signal:
//! the spot's own domain level (domain-restricted weighted mean) and the level of the
//! neighbouring spots that belong to *other* domains. Deep inside a domain there are no
//! other-domain neighbours and the score equals the domain level, so pure tumor stays near the
//! top and pure normal near zero. At a domain boundary the other side pulls the score towards
//! the middle of the range, which is what the band threshold in [`crate::region`] picks up.

use log::debug;
use serde::{Deserialize, Serialize};

use crate::aggregate::{AggregationOpts, Aggregator};
use crate::error::{Result, SpatialError};
use crate::neighbors::NeighborIndex;
use crate::table::{align_rows, LabelTable, Signal};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TniOpts {
    pub aggregation: AggregationOpts,
    /// Share of the other-domain level in the final score (default: 0.4)
    pub contrast_weight: f64,
}

impl Default for TniOpts {
    fn default() -> Self {
        TniOpts {
            aggregation: AggregationOpts::default(),
            contrast_weight: 0.4,
        }
    }
}

/// TNI score plus the two aggregates it was built from, all keyed like the input.
#[derive(Clone, Debug, PartialEq)]
pub struct TniScores {
    pub within_domain: Signal,
    pub across_domain: Signal,
    pub score: Signal,
}

/// Tumor enrichment: abundance over total signal per spot, missing where the total is not positive.
pub fn tumor_enrichment(abundance: &Signal, total: &Signal) -> Result<Signal> {
    let rows = align_rows(total.ids(), abundance.ids(), "total signal")?;
    let values = abundance
        .values()
        .iter()
        .zip(&rows)
        .map(|(a, &r)| match (a, total.values()[r]) {
            (Some(a), Some(t)) if t > 0.0 => Some(a / t),
            _ => None,
        })
        .collect();
    Signal::new(abundance.ids().to_vec(), values)
}

pub fn tni_score(
    enrichment: &Signal,
    domains: &LabelTable,
    index: &NeighborIndex,
    opts: &TniOpts,
) -> Result<TniScores> {
    if enrichment.is_empty() {
        return Err(SpatialError::empty("tumor enrichment"));
    }
    let alpha = opts.contrast_weight;
    if !(0.0..=1.0).contains(&alpha) {
        return Err(SpatialError::parameter("contrast_weight", format!("{} not in [0, 1]", alpha)));
    }

    let agg = Aggregator::new(index, opts.aggregation.clone())?;
    let within = agg.smooth(enrichment, Some(domains))?;
    let across = agg.cross_label_mean(enrichment, domains)?;

    let values: Vec<Option<f64>> = within
        .values()
        .iter()
        .zip(across.values())
        .map(|(w, a)| {
            let w = (*w)?;
            let a = a.unwrap_or(w);
            Some(((1.0 - alpha) * w + alpha * a).max(0.0))
        })
        .collect();
    let score = enrichment.with_values(values);

    debug!(
        "TNI score over {} spots, max {:?}, {} missing",
        score.len(),
        score.max_value(),
        score.n_missing()
    );
    Ok(TniScores {
        within_domain: within,
        across_domain: across,
        score,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lattice::{CoordinateTable, HEX_ROW_PITCH};
    use crate::neighbors::NeighborQuery;
    use nalgebra::Point2;

    /// Hex grid split at column `split`: tumor domain left (ES 1), normal right (ES 0).
    fn two_domains(rows: usize, cols: usize, split: usize) -> (CoordinateTable, Signal, LabelTable) {
        let mut ids = Vec::new();
        let mut pts = Vec::new();
        let mut es = Vec::new();
        let mut dom = Vec::new();
        for r in 0..rows {
            for c in 0..cols {
                let off = if r % 2 == 1 { 0.5 } else { 0.0 };
                ids.push(format!("r{}c{}", r, c));
                pts.push(Point2::new(c as f64 + off, r as f64 * HEX_ROW_PITCH));
                let tumor = c < split;
                es.push(if tumor { 1.0 } else { 0.0 });
                dom.push(if tumor { "Domain_1" } else { "Domain_2" }.to_string());
            }
        }
        let coords = CoordinateTable::with_unit_step(ids.clone(), pts, 1.0).unwrap();
        (
            coords,
            Signal::from_dense(ids.clone(), es).unwrap(),
            LabelTable::new(ids, dom).unwrap(),
        )
    }

    #[test]
    fn test_interior_keeps_domain_level_boundary_moves_inward() {
        let (coords, es, dom) = two_domains(6, 10, 5);
        let idx = NeighborIndex::build(&coords, &NeighborQuery::radius(1.0)).unwrap();
        let s = tni_score(&es, &dom, &idx, &TniOpts::default()).unwrap();

        assert_eq!(s.score.get("r2c0"), Some(&Some(1.0)));
        assert_eq!(s.score.get("r2c9"), Some(&Some(0.0)));
        // r2c4 is tumor touching normal, r2c5 normal touching tumor
        assert!((s.score.get("r2c4").unwrap().unwrap() - 0.6).abs() < 1e-12);
        assert!((s.score.get("r2c5").unwrap().unwrap() - 0.4).abs() < 1e-12);
        assert_eq!(s.across_domain.get("r2c0"), Some(&None));
    }

    #[test]
    fn test_score_bounded_by_max_enrichment() {
        let (coords, _, dom) = two_domains(5, 8, 3);
        let es = Signal::from_dense(
            coords.ids().to_vec(),
            (0..coords.len()).map(|i| ((i * 7) % 11) as f64 / 10.0).collect(),
        )
        .unwrap();
        let idx = NeighborIndex::build(&coords, &NeighborQuery::radius(2.0)).unwrap();
        let s = tni_score(&es, &dom, &idx, &TniOpts::default()).unwrap();
        let max = es.max_value().unwrap();
        assert!(s.score.values().iter().flatten().all(|v| *v >= 0.0 && *v <= max + 1e-12));
    }

    #[test]
    fn test_tumor_enrichment() {
        let ids: Vec<String> = vec!["a".into(), "b".into(), "c".into()];
        let ab = Signal::new(ids.clone(), vec![Some(2.0), Some(1.0), None]).unwrap();
        let total = Signal::new(vec!["c".into(), "b".into(), "a".into()], vec![Some(1.0), Some(0.0), Some(4.0)]).unwrap();
        let es = tumor_enrichment(&ab, &total).unwrap();
        assert_eq!(es.values(), &[Some(0.5), None, None]);
    }

    #[test]
    fn test_bad_contrast_weight() {
        let (coords, es, dom) = two_domains(2, 2, 1);
        let idx = NeighborIndex::build(&coords, &NeighborQuery::radius(1.0)).unwrap();
        let opts = TniOpts { contrast_weight: 1.5, ..Default::default() };
        assert!(tni_score(&es, &dom, &idx, &opts).is_err());
    }
}

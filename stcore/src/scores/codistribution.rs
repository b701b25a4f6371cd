//! Cell-type co-distribution scores.
//!
//! For every unordered pair of cell types in a proportion table, a per-spot score that is high
//! only when both types are present at that spot. Both rules are symmetric in the pair.

use itertools::Itertools;
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::aggregate::{Aggregator, NeighborFilter};
use crate::error::{Result, SpatialError};
use crate::table::{Signal, SignalMatrix};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoDistributionRule {
    /// p_a * p_b
    Product,
    /// min(p_a, p_b)
    MinOverlap,
}

impl CoDistributionRule {
    #[inline]
    pub fn apply(&self, a: f64, b: f64) -> f64 {
        match self {
            CoDistributionRule::Product => a * b,
            CoDistributionRule::MinOverlap => a.min(b),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CoDistributionOpts {
    pub rule: CoDistributionRule,
    /// Order output pairs by name instead of table column order (default: false)
    pub sort_pairs: bool,
    /// Smooth proportions over the neighbourhood before pairing (default: false)
    pub smooth: bool,
}

impl Default for CoDistributionOpts {
    fn default() -> Self {
        CoDistributionOpts {
            rule: CoDistributionRule::Product,
            sort_pairs: false,
            smooth: false,
        }
    }
}

/// Column name for a pair of cell types.
pub fn pair_name(a: &str, b: &str) -> String {
    format!("{}_{}", a, b)
}

/// Warns about rows that are not proportions (negative cells or row sums above 1).
fn check_proportions(props: &SignalMatrix) {
    let bad = (0..props.n_rows())
        .filter(|&r| {
            let row = props.row(r);
            row.iter().flatten().any(|v| *v < 0.0) || row.iter().flatten().sum::<f64>() > 1.0 + 1e-6
        })
        .count();
    if bad > 0 {
        warn!("{} of {} spots have proportions outside [0, 1] or rows summing above 1", bad, props.n_rows());
    }
}

fn smoothed(props: &SignalMatrix, smoother: Option<&Aggregator>) -> Result<SignalMatrix> {
    match smoother {
        Some(agg) => {
            let data = agg.aggregate_with(props, NeighborFilter::All)?;
            SignalMatrix::new(props.ids().to_vec(), props.columns().to_vec(), data)
        }
        None => Ok(props.clone()),
    }
}

/// Co-distribution of every cell-type pair. `smoother` is used when `opts.smooth` is set.
pub fn codistribution(
    props: &SignalMatrix,
    opts: &CoDistributionOpts,
    smoother: Option<&Aggregator>,
) -> Result<SignalMatrix> {
    if props.n_rows() == 0 {
        return Err(SpatialError::empty("cell-type proportions"));
    }
    if props.n_cols() < 2 {
        return Err(SpatialError::mismatch(
            "cell-type proportions",
            format!("need at least 2 cell types, got {}", props.n_cols()),
        ));
    }
    check_proportions(props);
    if opts.smooth && smoother.is_none() {
        return Err(SpatialError::parameter("smooth", "requested without a neighbour aggregator"));
    }
    let props = if opts.smooth { smoothed(props, smoother)? } else { props.clone() };

    let mut pairs: Vec<(usize, usize, String)> = (0..props.n_cols())
        .tuple_combinations()
        .map(|(a, b)| {
            let (na, nb) = (&props.columns()[a], &props.columns()[b]);
            // inner order by name so sorted output is stable regardless of column order
            if opts.sort_pairs && nb < na {
                (b, a, pair_name(nb, na))
            } else {
                (a, b, pair_name(na, nb))
            }
        })
        .collect();
    if opts.sort_pairs {
        pairs.sort_by(|x, y| x.2.cmp(&y.2));
    }

    let columns = pairs
        .into_iter()
        .map(|(a, b, name)| {
            let values = (0..props.n_rows())
                .map(|r| Some(opts.rule.apply(props.get(r, a)?, props.get(r, b)?)))
                .collect();
            (name, values)
        })
        .collect();

    let out = SignalMatrix::from_columns(props.ids().to_vec(), columns)?;
    debug!("co-distribution: {} pairs over {} spots", out.n_cols(), out.n_rows());
    Ok(out)
}

/// Co-distribution of one named pair.
pub fn pair_codistribution(props: &SignalMatrix, a: &str, b: &str, rule: CoDistributionRule) -> Result<Signal> {
    let col = |name: &str| {
        props.column_index(name).ok_or_else(|| {
            SpatialError::mismatch("cell-type proportions", format!("cell type '{}' not present", name))
        })
    };
    let (ca, cb) = (col(a)?, col(b)?);
    let values = (0..props.n_rows())
        .map(|r| Some(rule.apply(props.get(r, ca)?, props.get(r, cb)?)))
        .collect();
    Signal::new(props.ids().to_vec(), values)
}

/// Summed proportion of several cell types per spot; missing cells are skipped.
pub fn combined_proportion(props: &SignalMatrix, types: &[String]) -> Result<Signal> {
    let cols: Vec<usize> = types
        .iter()
        .map(|t| {
            props.column_index(t).ok_or_else(|| {
                SpatialError::mismatch("cell-type proportions", format!("cell type '{}' not present", t))
            })
        })
        .collect::<Result<_>>()?;
    let values = (0..props.n_rows())
        .map(|r| {
            let present: Vec<f64> = cols.iter().filter_map(|&c| props.get(r, c)).collect();
            if present.is_empty() { None } else { Some(present.iter().sum()) }
        })
        .collect();
    Signal::new(props.ids().to_vec(), values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::AggregationOpts;
    use crate::lattice::CoordinateTable;
    use crate::neighbors::{NeighborIndex, NeighborQuery};
    use nalgebra::Point2;

    fn props() -> SignalMatrix {
        let ids = vec!["s0".to_string(), "s1".to_string(), "s2".to_string()];
        SignalMatrix::from_columns(
            ids,
            vec![
                ("T".into(), vec![Some(0.5), Some(0.0), Some(0.2)]),
                ("B".into(), vec![Some(0.4), Some(0.9), None]),
                ("Plasma".into(), vec![Some(0.1), Some(0.1), Some(0.3)]),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_all_pairs_in_column_order() {
        let out = codistribution(&props(), &CoDistributionOpts::default(), None).unwrap();
        assert_eq!(out.columns(), &["T_B", "T_Plasma", "B_Plasma"]);
        assert!((out.get(0, 0).unwrap() - 0.2).abs() < 1e-12);
        assert_eq!(out.get(1, 0), Some(0.0));
        assert_eq!(out.get(2, 0), None);
    }

    #[test]
    fn test_sorted_pairs() {
        let opts = CoDistributionOpts {
            sort_pairs: true,
            ..Default::default()
        };
        let out = codistribution(&props(), &opts, None).unwrap();
        assert_eq!(out.columns(), &["B_Plasma", "B_T", "Plasma_T"]);
    }

    #[test]
    fn test_symmetric() {
        for rule in [CoDistributionRule::Product, CoDistributionRule::MinOverlap] {
            let ab = pair_codistribution(&props(), "T", "Plasma", rule).unwrap();
            let ba = pair_codistribution(&props(), "Plasma", "T", rule).unwrap();
            assert_eq!(ab, ba);
        }
        let m = pair_codistribution(&props(), "T", "B", CoDistributionRule::MinOverlap).unwrap();
        assert_eq!(m.values(), &[Some(0.4), Some(0.0), None]);
    }

    #[test]
    fn test_unknown_type_and_single_column() {
        assert!(pair_codistribution(&props(), "T", "NK", CoDistributionRule::Product).is_err());
        let one = SignalMatrix::from_columns(vec!["s".into()], vec![("T".into(), vec![Some(1.0)])]).unwrap();
        assert!(codistribution(&one, &CoDistributionOpts::default(), None).is_err());
    }

    #[test]
    fn test_smoothing_needs_aggregator() {
        let opts = CoDistributionOpts {
            smooth: true,
            ..Default::default()
        };
        assert!(codistribution(&props(), &opts, None).is_err());

        let ids = props().ids().to_vec();
        let pts = (0..3).map(|i| Point2::new(i as f64 * 10.0, 0.0)).collect();
        let coords = CoordinateTable::with_unit_step(ids, pts, 1.0).unwrap();
        let idx = NeighborIndex::build(&coords, &NeighborQuery::radius(1.0)).unwrap();
        let agg = Aggregator::new(&idx, AggregationOpts::mean()).unwrap();
        // isolated spots: smoothing is the identity
        let smoothed = codistribution(&props(), &opts, Some(&agg)).unwrap();
        let plain = codistribution(&props(), &CoDistributionOpts::default(), None).unwrap();
        assert_eq!(smoothed, plain);
    }

    #[test]
    fn test_combined_proportion() {
        let s = combined_proportion(&props(), &["B".to_string(), "Plasma".to_string()]).unwrap();
        assert!((s.values()[0].unwrap() - 0.5).abs() < 1e-12);
        assert!((s.values()[2].unwrap() - 0.3).abs() < 1e-12);
    }
}

pub mod codistribution;
pub mod infiltration;
pub mod lr;
pub mod tls;
pub mod tni;

use crate::table::Signal;

/// Spread below this fraction of the signal's magnitude counts as rounding noise.
const FLAT_TOLERANCE: f64 = 1e-12;

/// Min-max rescale of the present values to [0, 1]. A constant signal maps to 0.
///
/// Smoothing a constant leaves a spread of a few ulps; that is treated as constant too.
pub fn rescale_unit(signal: &Signal) -> Signal {
    let (lo, hi) = match (signal.min_value(), signal.max_value()) {
        (Some(lo), Some(hi)) => (lo, hi),
        _ => return signal.clone(),
    };
    let range = hi - lo;
    let flat = range <= FLAT_TOLERANCE * hi.abs().max(lo.abs()).max(1.0);
    signal.map(|v| v.map(|v| if flat { 0.0 } else { (v - lo) / range }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::{AggregationMethod, AggregationOpts, Aggregator};
    use crate::lattice::CoordinateTable;
    use crate::neighbors::{NeighborIndex, NeighborQuery};
    use nalgebra::Point2;

    #[test]
    fn test_rescale_unit() {
        let ids = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let s = Signal::new(ids.clone(), vec![Some(2.0), None, Some(6.0)]).unwrap();
        assert_eq!(rescale_unit(&s).values(), &[Some(0.0), None, Some(1.0)]);

        let flat = Signal::from_dense(ids, vec![3.0; 3]).unwrap();
        assert!(rescale_unit(&flat).values().iter().all(|v| *v == Some(0.0)));
    }

    #[test]
    fn test_rescale_ignores_rounding_spread() {
        let ids: Vec<String> = (0..4).map(|i| format!("s{}", i)).collect();
        let noisy = Signal::from_dense(ids.clone(), vec![0.1, 0.1 + 1e-17, 0.1 - 2e-17, 0.1]).unwrap();
        assert!(rescale_unit(&noisy).values().iter().all(|v| *v == Some(0.0)));

        let big = Signal::from_dense(ids, vec![1e6, 1e6 + 1e-7, 1e6, 1e6]).unwrap();
        assert!(rescale_unit(&big).values().iter().all(|v| *v == Some(0.0)));
    }

    #[test]
    fn test_smoothed_constant_rescales_to_zero() {
        let n = 8;
        let ids: Vec<String> = (0..n).map(|i| format!("s{}", i)).collect();
        let points = (0..n).map(|i| Point2::new(i as f64, 0.0)).collect();
        let coords = CoordinateTable::new(ids.clone(), points).unwrap();
        let index = NeighborIndex::build(&coords, &NeighborQuery::radius(1.0)).unwrap();
        let constant = Signal::from_dense(ids, vec![0.1; n]).unwrap();
        for method in [AggregationMethod::Mean, AggregationMethod::Weighted] {
            let opts = AggregationOpts {
                method,
                ..Default::default()
            };
            let smoothed = Aggregator::new(&index, opts).unwrap().smooth(&constant, None).unwrap();
            assert!(rescale_unit(&smoothed).values().iter().all(|v| *v == Some(0.0)));
        }
    }
}

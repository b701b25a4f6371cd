//! Immune infiltration indices.
//!
//! Enrichment is the summed proportion of the immune cell types at a spot. Diversity is the
//! Shannon entropy (natural log) of the immune types whose proportion reaches
//! `min_proportion`, after renormalising those proportions to sum 1. A spot with no qualifying
//! type has diversity 0.

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::aggregate::{Aggregator, NeighborFilter};
use crate::error::{Result, SpatialError};
use crate::table::{Signal, SignalMatrix};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct InfiltrationOpts {
    /// Cell types counted as immune; absent types are skipped with a warning.
    pub immune_types: Vec<String>,
    /// Minimum proportion for a type to count towards diversity (default: 0.01)
    pub min_proportion: f64,
    /// Divide entropy by ln(k) for k qualifying types (default: false)
    pub normalize_diversity: bool,
    /// Smooth proportions over the neighbourhood first (default: false)
    pub smooth: bool,
}

impl Default for InfiltrationOpts {
    fn default() -> Self {
        InfiltrationOpts {
            immune_types: [
                "B cell",
                "Plasma",
                "CD4 T cell",
                "CD8 T cell",
                "NK",
                "Macrophage",
                "Dendritic cell",
                "Neutrophil",
                "Mast",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            min_proportion: 0.01,
            normalize_diversity: false,
            smooth: false,
        }
    }
}

/// Two aligned per-spot vectors.
#[derive(Clone, Debug, PartialEq)]
pub struct InfiltrationIndices {
    pub enrichment: Signal,
    pub diversity: Signal,
}

fn entropy(parts: &[f64], normalize: bool) -> f64 {
    let total: f64 = parts.iter().sum();
    if parts.is_empty() || total <= 0.0 {
        return 0.0;
    }
    let h: f64 = parts
        .iter()
        .map(|p| p / total)
        .filter(|q| *q > 0.0)
        .map(|q| -q * q.ln())
        .sum();
    if normalize {
        if parts.len() > 1 { h / (parts.len() as f64).ln() } else { 0.0 }
    } else {
        h
    }
}

pub fn infiltration(
    props: &SignalMatrix,
    opts: &InfiltrationOpts,
    smoother: Option<&Aggregator>,
) -> Result<InfiltrationIndices> {
    if props.n_rows() == 0 {
        return Err(SpatialError::empty("cell-type proportions"));
    }
    if opts.immune_types.is_empty() {
        return Err(SpatialError::empty("immune cell-type list"));
    }
    if !(opts.min_proportion.is_finite() && opts.min_proportion >= 0.0) {
        return Err(SpatialError::parameter("min_proportion", "must be >= 0"));
    }

    let mut cols = Vec::new();
    for t in &opts.immune_types {
        match props.column_index(t) {
            Some(c) => cols.push(c),
            None => warn!("immune cell type '{}' not in proportion table, skipped", t),
        }
    }
    if cols.is_empty() {
        return Err(SpatialError::mismatch(
            "cell-type proportions",
            format!("none of the immune types {:?} present", opts.immune_types),
        ));
    }

    let smoothed;
    let props = if opts.smooth {
        let agg = smoother
            .ok_or_else(|| SpatialError::parameter("smooth", "requested without a neighbour aggregator"))?;
        let data = agg.aggregate_with(props, NeighborFilter::All)?;
        smoothed = SignalMatrix::new(props.ids().to_vec(), props.columns().to_vec(), data)?;
        &smoothed
    } else {
        props
    };

    let mut enrichment = Vec::with_capacity(props.n_rows());
    let mut diversity = Vec::with_capacity(props.n_rows());
    for r in 0..props.n_rows() {
        let present: Vec<f64> = cols.iter().filter_map(|&c| props.get(r, c)).collect();
        if present.is_empty() {
            enrichment.push(None);
            diversity.push(None);
            continue;
        }
        enrichment.push(Some(present.iter().sum()));
        let qualifying: Vec<f64> = present.into_iter().filter(|p| *p >= opts.min_proportion && *p > 0.0).collect();
        diversity.push(Some(entropy(&qualifying, opts.normalize_diversity)));
    }

    debug!("infiltration indices over {} spots using {} immune types", props.n_rows(), cols.len());
    Ok(InfiltrationIndices {
        enrichment: Signal::new(props.ids().to_vec(), enrichment)?,
        diversity: Signal::new(props.ids().to_vec(), diversity)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props() -> SignalMatrix {
        SignalMatrix::from_columns(
            vec!["s0".into(), "s1".into(), "s2".into(), "s3".into()],
            vec![
                ("Tumor".into(), vec![Some(0.6), Some(1.0), Some(0.2), None]),
                ("B".into(), vec![Some(0.2), Some(0.0), Some(0.4), None]),
                ("T".into(), vec![Some(0.2), Some(0.0), Some(0.005), None]),
            ],
        )
        .unwrap()
    }

    fn opts() -> InfiltrationOpts {
        InfiltrationOpts {
            immune_types: vec!["B".into(), "T".into(), "Mast".into()],
            ..Default::default()
        }
    }

    #[test]
    fn test_enrichment_and_diversity() {
        let out = infiltration(&props(), &opts(), None).unwrap();
        assert!((out.enrichment.values()[0].unwrap() - 0.4).abs() < 1e-12);
        // two equal types -> ln 2
        assert!((out.diversity.values()[0].unwrap() - 2f64.ln()).abs() < 1e-12);
        // no immune signal
        assert_eq!(out.enrichment.values()[1], Some(0.0));
        assert_eq!(out.diversity.values()[1], Some(0.0));
        // T below threshold: a single qualifying type
        assert_eq!(out.diversity.values()[2], Some(0.0));
        assert_eq!(out.enrichment.values()[3], None);
        assert_eq!(out.diversity.values()[3], None);
    }

    #[test]
    fn test_normalized_diversity() {
        let mut o = opts();
        o.normalize_diversity = true;
        let out = infiltration(&props(), &o, None).unwrap();
        assert!((out.diversity.values()[0].unwrap() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_no_immune_types_present() {
        let o = InfiltrationOpts {
            immune_types: vec!["NK".into()],
            ..Default::default()
        };
        assert!(matches!(
            infiltration(&props(), &o, None),
            Err(SpatialError::DimensionMismatch { .. })
        ));
    }
}

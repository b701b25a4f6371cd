use serde::Serialize;

use crate::data::handle::{SpatialDataHandle, TABLES};
use crate::error::Result;

/// What a store holds, for `stdata inspect`.
#[derive(Debug, Clone, Serialize)]
pub struct StoreSummary {
    pub row_counts: Vec<(String, i64)>,
    pub signals: Vec<String>,
    pub labels: Vec<String>,
    pub cell_types: Vec<String>,
    pub n_genes: usize,
    pub n_lr_pairs: usize,
}

pub fn summarize(handle: &SpatialDataHandle) -> Result<StoreSummary> {
    let row_counts = TABLES
        .iter()
        .map(|t| Ok((t.to_string(), handle.count_rows(t)?)))
        .collect::<Result<Vec<_>>>()?;
    let proportions = handle.read_proportions()?;
    let expression = handle.read_expression()?;
    let n_lr_pairs = handle.read_lr_catalog("_")?.len();

    Ok(StoreSummary {
        row_counts,
        signals: handle.names_in("signals")?,
        labels: handle.names_in("labels")?,
        cell_types: proportions.columns().to_vec(),
        n_genes: expression.n_cols(),
        n_lr_pairs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::handle::SpotRecord;
    use stcore::Signal;

    #[test]
    fn test_summary_of_small_store() {
        let mut h = SpatialDataHandle::in_memory().unwrap();
        h.insert_spots(&[SpotRecord::new("a", 0.0, 0.0)]).unwrap();
        h.insert_signal("tumor", &Signal::from_dense(vec!["a".into()], vec![1.0]).unwrap())
            .unwrap();
        let s = summarize(&h).unwrap();
        assert_eq!(s.row_counts[0], ("spots".to_string(), 1));
        assert_eq!(s.signals, vec!["tumor".to_string()]);
        assert!(s.cell_types.is_empty());
        assert_eq!(s.n_lr_pairs, 0);
    }
}

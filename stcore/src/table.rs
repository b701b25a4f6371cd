//! Spot-keyed tables shared by every analysis.
//!
//! All tables carry their spot ids next to the values so results can always be handed back in
//! the caller's order. Nothing here is mutated after construction; analyses build new tables.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SpatialError};

/// Ids plus one value per id, in caller order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SpotTable<T> {
    ids: Vec<String>,
    values: Vec<T>,
}

/// Per-spot scalar, `None` marks a missing measurement.
pub type Signal = SpotTable<Option<f64>>;

/// Per-spot categorical label (domain, cluster, region), treated as an opaque string.
pub type LabelTable = SpotTable<String>;

impl<T> SpotTable<T> {
    pub fn new(ids: Vec<String>, values: Vec<T>) -> Result<Self> {
        if ids.len() != values.len() {
            return Err(SpatialError::mismatch(
                "spot table",
                format!("{} ids but {} values", ids.len(), values.len()),
            ));
        }
        index_ids(&ids)?;
        Ok(SpotTable { ids, values })
    }

    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    pub fn values(&self) -> &[T] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Value of one spot. Linear in the table length; use [`SpotTable::lookup`] for repeated access.
    pub fn get(&self, id: &str) -> Option<&T> {
        self.ids.iter().position(|s| s == id).map(|i| &self.values[i])
    }

    /// Id to value map for many lookups against the same table.
    pub fn lookup(&self) -> FxHashMap<&str, &T> {
        self.iter().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &T)> {
        self.ids.iter().map(|s| s.as_str()).zip(self.values.iter())
    }

    pub fn map<U, F: FnMut(&T) -> U>(&self, f: F) -> SpotTable<U> {
        SpotTable {
            ids: self.ids.clone(),
            values: self.values.iter().map(f).collect(),
        }
    }

    pub fn map_with_ids<U, F: FnMut(&str, &T) -> U>(&self, mut f: F) -> SpotTable<U> {
        SpotTable {
            ids: self.ids.clone(),
            values: self.iter().map(|(id, v)| f(id, v)).collect(),
        }
    }

    /// Same ids, new values. Used by analyses that compute one value per input row.
    pub(crate) fn with_values<U>(&self, values: Vec<U>) -> SpotTable<U> {
        debug_assert_eq!(values.len(), self.ids.len());
        SpotTable {
            ids: self.ids.clone(),
            values,
        }
    }

    pub fn into_parts(self) -> (Vec<String>, Vec<T>) {
        (self.ids, self.values)
    }
}

impl SpotTable<Option<f64>> {
    /// Builds a signal from dense values, mapping non-finite entries to missing.
    pub fn from_dense(ids: Vec<String>, values: Vec<f64>) -> Result<Self> {
        let values = values
            .into_iter()
            .map(|v| if v.is_finite() { Some(v) } else { None })
            .collect();
        SpotTable::new(ids, values)
    }

    /// Largest non-missing value, `None` if every value is missing.
    pub fn max_value(&self) -> Option<f64> {
        self.values.iter().flatten().copied().fold(None, |acc, v| match acc {
            Some(m) if m >= v => Some(m),
            _ => Some(v),
        })
    }

    pub fn min_value(&self) -> Option<f64> {
        self.values.iter().flatten().copied().fold(None, |acc, v| match acc {
            Some(m) if m <= v => Some(m),
            _ => Some(v),
        })
    }

    pub fn n_missing(&self) -> usize {
        self.values.iter().filter(|v| v.is_none()).count()
    }
}

/// Spot × named column matrix, row-major, missing cells as `None`.
///
/// Used for cell-type proportions, gene expression and every multi-column score output.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SignalMatrix {
    ids: Vec<String>,
    columns: Vec<String>,
    data: Vec<Option<f64>>,
}

impl SignalMatrix {
    pub fn new(ids: Vec<String>, columns: Vec<String>, data: Vec<Option<f64>>) -> Result<Self> {
        if data.len() != ids.len() * columns.len() {
            return Err(SpatialError::mismatch(
                "signal matrix",
                format!(
                    "{} cells for {} spots x {} columns",
                    data.len(),
                    ids.len(),
                    columns.len()
                ),
            ));
        }
        index_ids(&ids)?;
        Ok(SignalMatrix { ids, columns, data })
    }

    /// Assembles a matrix from per-column vectors, each aligned with `ids`.
    pub fn from_columns(ids: Vec<String>, columns: Vec<(String, Vec<Option<f64>>)>) -> Result<Self> {
        let n = ids.len();
        for (name, col) in &columns {
            if col.len() != n {
                return Err(SpatialError::mismatch(
                    format!("column '{}'", name),
                    format!("{} values for {} spots", col.len(), n),
                ));
            }
        }
        let mut data = Vec::with_capacity(n * columns.len());
        for row in 0..n {
            for (_, col) in &columns {
                data.push(col[row]);
            }
        }
        let names = columns.into_iter().map(|(name, _)| name).collect();
        SignalMatrix::new(ids, names, data)
    }

    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn n_rows(&self) -> usize {
        self.ids.len()
    }

    pub fn n_cols(&self) -> usize {
        self.columns.len()
    }

    #[inline]
    pub fn get(&self, row: usize, col: usize) -> Option<f64> {
        self.data[row * self.columns.len() + col]
    }

    pub fn row(&self, row: usize) -> &[Option<f64>] {
        let k = self.columns.len();
        &self.data[row * k..(row + 1) * k]
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn column_values(&self, col: usize) -> Vec<Option<f64>> {
        (0..self.n_rows()).map(|r| self.get(r, col)).collect()
    }

    /// Extracts one named column as a scalar signal.
    pub fn column(&self, name: &str) -> Option<Signal> {
        let col = self.column_index(name)?;
        Some(SpotTable {
            ids: self.ids.clone(),
            values: self.column_values(col),
        })
    }
}

/// Read access the aggregation primitive needs from any signal shape.
pub trait SpotSignal: Sync {
    fn spot_ids(&self) -> &[String];
    fn n_components(&self) -> usize;
    fn component(&self, row: usize, k: usize) -> Option<f64>;
}

impl SpotSignal for Signal {
    fn spot_ids(&self) -> &[String] {
        &self.ids
    }

    fn n_components(&self) -> usize {
        1
    }

    #[inline]
    fn component(&self, row: usize, _k: usize) -> Option<f64> {
        self.values[row]
    }
}

impl SpotSignal for SignalMatrix {
    fn spot_ids(&self) -> &[String] {
        &self.ids
    }

    fn n_components(&self) -> usize {
        self.columns.len()
    }

    #[inline]
    fn component(&self, row: usize, k: usize) -> Option<f64> {
        self.get(row, k)
    }
}

/// Maps every id to its row, rejecting duplicates.
pub fn index_ids(ids: &[String]) -> Result<FxHashMap<&str, usize>> {
    let mut map = FxHashMap::default();
    map.reserve(ids.len());
    for (i, id) in ids.iter().enumerate() {
        if map.insert(id.as_str(), i).is_some() {
            return Err(SpatialError::DuplicateSpot { id: id.clone() });
        }
    }
    Ok(map)
}

/// For every id in `target`, the row holding the same id in `source`.
///
/// Both sides must cover the same spot set. `table` names the source in the error.
pub fn align_rows(source: &[String], target: &[String], table: &str) -> Result<Vec<usize>> {
    if source.len() != target.len() {
        return Err(SpatialError::mismatch(
            table,
            format!("{} spots, expected {}", source.len(), target.len()),
        ));
    }
    if source == target {
        return Ok((0..source.len()).collect());
    }
    let lookup = index_ids(source)?;
    target
        .iter()
        .map(|id| {
            lookup.get(id.as_str()).copied().ok_or_else(|| {
                SpatialError::mismatch(table, format!("spot '{}' not present", id))
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("s{}", i)).collect()
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let r = Signal::new(vec!["a".into(), "a".into()], vec![Some(1.0), None]);
        assert_eq!(r.unwrap_err(), SpatialError::DuplicateSpot { id: "a".into() });
    }

    #[test]
    fn test_lookup_matches_get() {
        let s = Signal::from_dense(ids(50), (0..50).map(|i| i as f64).collect()).unwrap();
        let lookup = s.lookup();
        assert_eq!(lookup.len(), 50);
        assert_eq!(lookup["s17"], &Some(17.0));
        assert_eq!(s.get("s17"), Some(&Some(17.0)));
        assert!(lookup.get("s50").is_none());
    }

    #[test]
    fn test_from_dense_maps_nan_to_missing() {
        let s = Signal::from_dense(ids(3), vec![1.0, f64::NAN, 3.0]).unwrap();
        assert_eq!(s.values(), &[Some(1.0), None, Some(3.0)]);
        assert_eq!(s.max_value(), Some(3.0));
        assert_eq!(s.min_value(), Some(1.0));
        assert_eq!(s.n_missing(), 1);
    }

    #[test]
    fn test_matrix_from_columns_is_row_major() {
        let m = SignalMatrix::from_columns(
            ids(2),
            vec![
                ("B".into(), vec![Some(0.1), Some(0.2)]),
                ("T".into(), vec![Some(0.3), None]),
            ],
        )
        .unwrap();
        assert_eq!(m.row(0), &[Some(0.1), Some(0.3)]);
        assert_eq!(m.get(1, 1), None);
        assert_eq!(m.column("B").unwrap().values(), &[Some(0.1), Some(0.2)]);
        assert!(m.column("NK").is_none());
    }

    #[test]
    fn test_align_rows_permutation() {
        let source = vec!["b".to_string(), "c".to_string(), "a".to_string()];
        let target = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        assert_eq!(align_rows(&source, &target, "t").unwrap(), vec![2, 0, 1]);
    }

    #[test]
    fn test_align_rows_reports_missing_spot() {
        let source = vec!["a".to_string(), "x".to_string()];
        let target = vec!["a".to_string(), "b".to_string()];
        let err = align_rows(&source, &target, "labels").unwrap_err();
        assert!(err.to_string().contains("'b'"));
    }
}

use std::path::Path;

use log::{debug, warn};
use rusqlite::{params, Connection};
use rustc_hash::FxHashMap;

use stcore::lattice::{CoordinateSource, CoordinateTable, HexAxis, Platform};
use stcore::scores::lr::LrCatalog;
use stcore::{LabelTable, Signal, SignalMatrix};

use crate::error::{Result, StDataError};

/// Every table the store schema creates.
pub const TABLES: [&str; 8] = [
    "spots",
    "signals",
    "labels",
    "proportions",
    "expression",
    "lr_pairs",
    "scores",
    "regions",
];

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS spots (id TEXT PRIMARY KEY, x REAL NOT NULL, y REAL NOT NULL);
CREATE TABLE IF NOT EXISTS signals (spot TEXT NOT NULL, name TEXT NOT NULL, value REAL);
CREATE TABLE IF NOT EXISTS labels (spot TEXT NOT NULL, name TEXT NOT NULL, label TEXT NOT NULL);
CREATE TABLE IF NOT EXISTS proportions (spot TEXT NOT NULL, cell_type TEXT NOT NULL, value REAL);
CREATE TABLE IF NOT EXISTS expression (spot TEXT NOT NULL, gene TEXT NOT NULL, value REAL);
CREATE TABLE IF NOT EXISTS lr_pairs (ligand TEXT NOT NULL, receptor TEXT NOT NULL, kind TEXT NOT NULL);
CREATE TABLE IF NOT EXISTS scores (analysis TEXT NOT NULL, name TEXT NOT NULL, spot TEXT NOT NULL, value REAL);
CREATE TABLE IF NOT EXISTS regions (analysis TEXT NOT NULL, spot TEXT NOT NULL, label TEXT NOT NULL);
CREATE INDEX IF NOT EXISTS signals_name ON signals (name);
CREATE INDEX IF NOT EXISTS labels_name ON labels (name);
CREATE INDEX IF NOT EXISTS scores_analysis ON scores (analysis, name);
";

#[derive(Debug, Clone, PartialEq)]
pub struct SpotRecord {
    pub id: String,
    pub x: f64,
    pub y: f64,
}

impl SpotRecord {
    pub fn new(id: &str, x: f64, y: f64) -> Self {
        SpotRecord { id: id.to_string(), x, y }
    }
}

/// Long-format spot x column tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatrixTable {
    Proportions,
    Expression,
}

impl MatrixTable {
    fn table(&self) -> &'static str {
        match self {
            MatrixTable::Proportions => "proportions",
            MatrixTable::Expression => "expression",
        }
    }

    fn key(&self) -> &'static str {
        match self {
            MatrixTable::Proportions => "cell_type",
            MatrixTable::Expression => "gene",
        }
    }
}

/// Connection to a spatial store. Every reader returns spots in `spots` insertion order.
#[derive(Debug)]
pub struct SpatialDataHandle {
    pub connection: Connection,
}

impl SpatialDataHandle {
    /// Opens an existing store.
    pub fn new(path: &Path) -> Result<Self> {
        let connection = Connection::open(path)?;
        Ok(Self { connection })
    }

    /// Opens or creates a store and makes sure all tables exist.
    pub fn create(path: &Path) -> Result<Self> {
        let handle = Self::new(path)?;
        handle.init_schema()?;
        Ok(handle)
    }

    pub fn in_memory() -> Result<Self> {
        let handle = Self {
            connection: Connection::open_in_memory()?,
        };
        handle.init_schema()?;
        Ok(handle)
    }

    pub fn init_schema(&self) -> Result<()> {
        self.connection.execute_batch(SCHEMA)?;
        Ok(())
    }

    pub fn read_spots(&self) -> Result<Vec<SpotRecord>> {
        let mut stmt = self.connection.prepare("SELECT id, x, y FROM spots ORDER BY rowid")?;
        let spots_iter = stmt.query_map([], |row| {
            Ok(SpotRecord {
                id: row.get(0)?,
                x: row.get(1)?,
                y: row.get(2)?,
            })
        })?;
        let mut spots = Vec::new();
        for spot in spots_iter {
            spots.push(spot?);
        }
        Ok(spots)
    }

    pub fn spot_ids(&self) -> Result<Vec<String>> {
        let mut stmt = self.connection.prepare("SELECT id FROM spots ORDER BY rowid")?;
        let ids: rusqlite::Result<Vec<String>> = stmt.query_map([], |row| row.get(0))?.collect();
        Ok(ids?)
    }

    /// Coordinate table with the platform's default correction applied.
    /// Spot positions, hex-corrected along `hex_axis` or else the platform's default axis.
    pub fn read_coordinates(&self, platform: Platform, hex_axis: Option<HexAxis>) -> Result<CoordinateTable> {
        let spots = self.read_spots()?;
        let (x, y) = spots.iter().map(|s| (s.x, s.y)).unzip();
        let ids = spots.into_iter().map(|s| s.id).collect();
        let axis = hex_axis.or(platform.default_hex_axis());
        Ok(CoordinateTable::resolve_with_axis(ids, &[CoordinateSource::Metadata { x, y }], axis)?)
    }

    /// Named scalar for every spot; spots without a row are missing.
    pub fn read_signal(&self, name: &str) -> Result<Signal> {
        self.read_keyed_signal("SELECT spot, value FROM signals WHERE name = ?1", params![name], "signal", name)
    }

    fn read_keyed_signal(&self, sql: &str, args: &[&dyn rusqlite::ToSql], kind: &str, name: &str) -> Result<Signal> {
        let ids = self.spot_ids()?;
        let position: FxHashMap<&str, usize> = ids.iter().enumerate().map(|(i, id)| (id.as_str(), i)).collect();
        let mut values: Vec<Option<f64>> = vec![None; ids.len()];

        let mut stmt = self.connection.prepare(sql)?;
        let rows = stmt.query_map(args, |row| Ok((row.get::<_, String>(0)?, row.get::<_, Option<f64>>(1)?)))?;
        let (mut seen, mut orphaned) = (0usize, 0usize);
        for row in rows {
            let (spot, value) = row?;
            seen += 1;
            match position.get(spot.as_str()) {
                Some(&i) => values[i] = value,
                None => orphaned += 1,
            }
        }
        if seen == 0 {
            return Err(StDataError::not_found(kind, name));
        }
        if orphaned > 0 {
            warn!("{} '{}': {} rows reference unknown spots", kind, name, orphaned);
        }
        Ok(Signal::new(ids, values)?)
    }

    /// Named categorical label; only labelled spots are returned.
    pub fn read_labels(&self, name: &str) -> Result<LabelTable> {
        let mut stmt = self.connection.prepare(
            "SELECT l.spot, l.label FROM labels l JOIN spots s ON s.id = l.spot WHERE l.name = ?1 ORDER BY s.rowid",
        )?;
        let rows = stmt.query_map(params![name], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;
        let mut ids = Vec::new();
        let mut labels = Vec::new();
        for row in rows {
            let (spot, label) = row?;
            ids.push(spot);
            labels.push(label);
        }
        if ids.is_empty() {
            return Err(StDataError::not_found("label", name));
        }
        Ok(LabelTable::new(ids, labels)?)
    }

    /// Spot x column matrix, columns in first-insertion order.
    pub fn read_matrix(&self, table: MatrixTable) -> Result<SignalMatrix> {
        let ids = self.spot_ids()?;
        let position: FxHashMap<&str, usize> = ids.iter().enumerate().map(|(i, id)| (id.as_str(), i)).collect();

        let query = format!(
            "SELECT {key} FROM {table} GROUP BY {key} ORDER BY MIN(rowid)",
            key = table.key(),
            table = table.table()
        );
        let mut stmt = self.connection.prepare(&query)?;
        let columns: rusqlite::Result<Vec<String>> = stmt.query_map([], |row| row.get(0))?.collect();
        let columns = columns?;
        let column_of: FxHashMap<&str, usize> = columns.iter().enumerate().map(|(i, c)| (c.as_str(), i)).collect();

        let mut data: Vec<Option<f64>> = vec![None; ids.len() * columns.len()];
        let query = format!("SELECT spot, {}, value FROM {}", table.key(), table.table());
        let mut stmt = self.connection.prepare(&query)?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, Option<f64>>(2)?))
        })?;
        for row in rows {
            let (spot, key, value) = row?;
            if let (Some(&r), Some(&c)) = (position.get(spot.as_str()), column_of.get(key.as_str())) {
                data[r * columns.len() + c] = value;
            }
        }
        debug!("{}: {} spots x {} columns", table.table(), ids.len(), columns.len());
        Ok(SignalMatrix::new(ids, columns, data)?)
    }

    pub fn read_proportions(&self) -> Result<SignalMatrix> {
        self.read_matrix(MatrixTable::Proportions)
    }

    pub fn read_expression(&self) -> Result<SignalMatrix> {
        self.read_matrix(MatrixTable::Expression)
    }

    pub fn read_lr_catalog(&self, separator: &str) -> Result<LrCatalog> {
        let mut stmt = self.connection.prepare("SELECT ligand, receptor, kind FROM lr_pairs ORDER BY rowid")?;
        let records: rusqlite::Result<Vec<(String, String, String)>> =
            stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?.collect();
        let records = records?;
        Ok(LrCatalog::from_records(
            records.iter().map(|(l, r, k)| (l.as_str(), r.as_str(), k.as_str())),
            separator,
        )?)
    }

    /// Distinct names in the `signals` or `labels` table.
    pub fn names_in(&self, table: &str) -> Result<Vec<String>> {
        let table = match table {
            "signals" | "labels" => table,
            other => return Err(StDataError::not_found("named table", other)),
        };
        let mut stmt = self.connection.prepare(&format!("SELECT DISTINCT name FROM {} ORDER BY name", table))?;
        let names: rusqlite::Result<Vec<String>> = stmt.query_map([], |row| row.get(0))?.collect();
        Ok(names?)
    }

    pub fn count_rows(&self, table: &str) -> Result<i64> {
        if !TABLES.contains(&table) {
            return Err(StDataError::not_found("table", table));
        }
        Ok(self
            .connection
            .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))?)
    }

    pub fn insert_spots(&mut self, spots: &[SpotRecord]) -> Result<()> {
        let tx = self.connection.transaction()?;
        {
            let mut stmt = tx.prepare("INSERT INTO spots (id, x, y) VALUES (?1, ?2, ?3)")?;
            for s in spots {
                stmt.execute(params![s.id, s.x, s.y])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn insert_signal(&mut self, name: &str, signal: &Signal) -> Result<()> {
        let tx = self.connection.transaction()?;
        {
            let mut stmt = tx.prepare("INSERT INTO signals (spot, name, value) VALUES (?1, ?2, ?3)")?;
            for (id, value) in signal.iter() {
                stmt.execute(params![id, name, value])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn insert_labels(&mut self, name: &str, labels: &LabelTable) -> Result<()> {
        let tx = self.connection.transaction()?;
        {
            let mut stmt = tx.prepare("INSERT INTO labels (spot, name, label) VALUES (?1, ?2, ?3)")?;
            for (id, label) in labels.iter() {
                stmt.execute(params![id, name, label])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn insert_matrix(&mut self, table: MatrixTable, matrix: &SignalMatrix) -> Result<()> {
        let query = format!("INSERT INTO {} (spot, {}, value) VALUES (?1, ?2, ?3)", table.table(), table.key());
        let tx = self.connection.transaction()?;
        {
            let mut stmt = tx.prepare(&query)?;
            for c in 0..matrix.n_cols() {
                for r in 0..matrix.n_rows() {
                    stmt.execute(params![matrix.ids()[r], matrix.columns()[c], matrix.get(r, c)])?;
                }
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn insert_lr_pairs(&mut self, pairs: &[(&str, &str, &str)]) -> Result<()> {
        let tx = self.connection.transaction()?;
        {
            let mut stmt = tx.prepare("INSERT INTO lr_pairs (ligand, receptor, kind) VALUES (?1, ?2, ?3)")?;
            for (l, r, k) in pairs {
                stmt.execute(params![l, r, k])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Removes every output row of `analysis`.
    pub fn clear_analysis(&mut self, analysis: &str) -> Result<()> {
        let tx = self.connection.transaction()?;
        let scores = tx.execute("DELETE FROM scores WHERE analysis = ?1", params![analysis])?;
        let regions = tx.execute("DELETE FROM regions WHERE analysis = ?1", params![analysis])?;
        tx.commit()?;
        if scores + regions > 0 {
            debug!("cleared {} score and {} region rows of '{}'", scores, regions, analysis);
        }
        Ok(())
    }

    pub fn write_scores(&mut self, analysis: &str, name: &str, signal: &Signal) -> Result<()> {
        let tx = self.connection.transaction()?;
        {
            let mut stmt = tx.prepare("INSERT INTO scores (analysis, name, spot, value) VALUES (?1, ?2, ?3, ?4)")?;
            for (id, value) in signal.iter() {
                stmt.execute(params![analysis, name, id, value])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// One score per matrix column, named after the column.
    pub fn write_score_matrix(&mut self, analysis: &str, matrix: &SignalMatrix) -> Result<()> {
        let tx = self.connection.transaction()?;
        {
            let mut stmt = tx.prepare("INSERT INTO scores (analysis, name, spot, value) VALUES (?1, ?2, ?3, ?4)")?;
            for c in 0..matrix.n_cols() {
                for r in 0..matrix.n_rows() {
                    stmt.execute(params![analysis, matrix.columns()[c], matrix.ids()[r], matrix.get(r, c)])?;
                }
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn write_regions(&mut self, analysis: &str, labels: &LabelTable) -> Result<()> {
        let tx = self.connection.transaction()?;
        {
            let mut stmt = tx.prepare("INSERT INTO regions (analysis, spot, label) VALUES (?1, ?2, ?3)")?;
            for (id, label) in labels.iter() {
                stmt.execute(params![analysis, id, label])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn read_scores(&self, analysis: &str, name: &str) -> Result<Signal> {
        self.read_keyed_signal(
            "SELECT spot, value FROM scores WHERE analysis = ?1 AND name = ?2",
            params![analysis, name],
            "score",
            &format!("{}/{}", analysis, name),
        )
    }

    pub fn read_regions(&self, analysis: &str) -> Result<LabelTable> {
        let mut stmt = self.connection.prepare(
            "SELECT r.spot, r.label FROM regions r JOIN spots s ON s.id = r.spot WHERE r.analysis = ?1 ORDER BY s.rowid",
        )?;
        let rows = stmt.query_map(params![analysis], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;
        let mut ids = Vec::new();
        let mut labels = Vec::new();
        for row in rows {
            let (spot, label) = row?;
            ids.push(spot);
            labels.push(label);
        }
        if ids.is_empty() {
            return Err(StDataError::not_found("region analysis", analysis));
        }
        Ok(LabelTable::new(ids, labels)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store() -> SpatialDataHandle {
        let mut h = SpatialDataHandle::in_memory().unwrap();
        h.insert_spots(&[
            SpotRecord::new("a", 0.0, 0.0),
            SpotRecord::new("b", 1.0, 0.0),
            SpotRecord::new("c", 2.0, 0.0),
        ])
        .unwrap();
        h
    }

    #[test]
    fn test_signal_fills_missing_spots() {
        let mut h = store();
        let s = Signal::new(vec!["c".into(), "a".into()], vec![Some(3.0), None]).unwrap();
        h.insert_signal("tumor", &s).unwrap();
        let back = h.read_signal("tumor").unwrap();
        assert_eq!(back.ids(), &["a", "b", "c"]);
        assert_eq!(back.values(), &[None, None, Some(3.0)]);
        assert!(matches!(h.read_signal("absent"), Err(StDataError::NotFound { .. })));
    }

    #[test]
    fn test_matrix_and_labels() {
        let mut h = store();
        let m = SignalMatrix::from_columns(
            vec!["a".into(), "b".into(), "c".into()],
            vec![
                ("T".into(), vec![Some(0.1), Some(0.2), None]),
                ("B".into(), vec![Some(0.9), Some(0.8), Some(1.0)]),
            ],
        )
        .unwrap();
        h.insert_matrix(MatrixTable::Proportions, &m).unwrap();
        let back = h.read_proportions().unwrap();
        assert_eq!(back, m);

        let l = LabelTable::new(vec!["b".into(), "a".into()], vec!["D2".into(), "D1".into()]).unwrap();
        h.insert_labels("domain", &l).unwrap();
        let back = h.read_labels("domain").unwrap();
        assert_eq!(back.ids(), &["a", "b"]);
        assert_eq!(h.names_in("labels").unwrap(), vec!["domain".to_string()]);
    }

    #[test]
    fn test_catalog_and_outputs_on_disk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.db");
        {
            let mut h = SpatialDataHandle::create(&path).unwrap();
            h.insert_spots(&[SpotRecord::new("a", 0.0, 0.0), SpotRecord::new("b", 1.0, 0.0)]).unwrap();
            h.insert_lr_pairs(&[("CXCL13", "CXCR5", "Secreted Signaling"), ("ITGA4_ITGB1", "VCAM1", "Cell-Cell Contact")])
                .unwrap();
        }
        let mut h = SpatialDataHandle::new(&path).unwrap();
        let catalog = h.read_lr_catalog("_").unwrap();
        assert_eq!(catalog.len(), 2);
        assert!(catalog.pairs()[1].ligand.is_complex());

        let s = Signal::from_dense(vec!["a".into(), "b".into()], vec![0.5, 1.0]).unwrap();
        h.write_scores("tni", "score", &s).unwrap();
        h.clear_analysis("tni").unwrap();
        h.write_scores("tni", "score", &s).unwrap();
        assert_eq!(h.count_rows("scores").unwrap(), 2);
        assert!(matches!(
            h.count_rows("scores; DROP TABLE spots"),
            Err(StDataError::NotFound { .. })
        ));
        assert_eq!(h.count_rows("spots").unwrap(), 2);
        assert_eq!(h.read_scores("tni", "score").unwrap(), s);
    }

    #[test]
    fn test_coordinates_generic_keep_raw_positions() {
        let h = store();
        let coords = h.read_coordinates(Platform::Generic, None).unwrap();
        assert_eq!(coords.len(), 3);
        assert!((coords.unit_step() - 1.0).abs() < 1e-12);
        assert_eq!(coords.hex_axis(), None);
    }
}

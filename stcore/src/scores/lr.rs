//! Ligand-receptor diffusion and interaction scores.
//!
//! Stage 1 turns raw expression into *effective* expression: each gene is smoothed with
//! inverse-distance weights over a neighbourhood whose size depends on how the protein reaches
//! its partner. Secreted ligands use the long-range index, membrane-bound ligands and all
//! receptors use the contact index. Complexes resolve to the minimum (or geometric mean) over
//! their subunits.
//!
//! Stage 2 combines ligand and receptor effective expression into one intensity per pair and
//! spot. A pair with an unknown gene is reported as skipped and scores missing everywhere.

use std::fmt;
use std::str::FromStr;

use log::{debug, info, warn};
use rayon::prelude::*;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};

use crate::aggregate::{AggregationOpts, Aggregator, NeighborFilter};
use crate::error::{Result, SpatialError};
use crate::lattice::CoordinateTable;
use crate::neighbors::{NeighborIndex, NeighborQuery};
use crate::progress::{ProgressObserver, Tally};
use crate::table::{Signal, SignalMatrix};

/// How a ligand reaches its receptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignalingKind {
    /// Diffusing protein, long range.
    Secreted,
    /// Membrane-bound, immediate neighbours only.
    Contact,
}

impl SignalingKind {
    fn tag(&self) -> &'static str {
        match self {
            SignalingKind::Secreted => "secreted",
            SignalingKind::Contact => "contact",
        }
    }
}

impl FromStr for SignalingKind {
    type Err = SpatialError;

    /// Accepts the usual catalog annotations.
    fn from_str(s: &str) -> Result<Self> {
        let key = s.trim().to_ascii_lowercase();
        match key.as_str() {
            "secreted" | "secreted signaling" | "paracrine" | "ecm-receptor" | "ecm" => Ok(SignalingKind::Secreted),
            "contact" | "cell-cell contact" | "membrane" | "juxtacrine" => Ok(SignalingKind::Contact),
            _ => Err(SpatialError::parameter("signaling kind", format!("unknown annotation '{}'", s))),
        }
    }
}

/// A gene or a multi-subunit complex, e.g. `ITGA4_ITGB1`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GeneComplex {
    pub name: String,
    pub subunits: Vec<String>,
}

impl GeneComplex {
    pub fn parse(name: &str, separator: &str) -> Result<Self> {
        let name = name.trim();
        let subunits: Vec<String> = if separator.is_empty() {
            vec![name.to_string()]
        } else {
            name.split(separator)
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect()
        };
        if subunits.is_empty() {
            return Err(SpatialError::empty(format!("gene name '{}'", name)));
        }
        Ok(GeneComplex {
            name: name.to_string(),
            subunits,
        })
    }

    pub fn single(gene: &str) -> Self {
        GeneComplex {
            name: gene.to_string(),
            subunits: vec![gene.to_string()],
        }
    }

    pub fn is_complex(&self) -> bool {
        self.subunits.len() > 1
    }
}

impl fmt::Display for GeneComplex {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LrPair {
    pub ligand: GeneComplex,
    pub receptor: GeneComplex,
    pub kind: SignalingKind,
}

impl LrPair {
    pub fn name(&self) -> String {
        format!("{}->{}", self.ligand.name, self.receptor.name)
    }
}

/// Ligand-receptor pairs in catalog order, without duplicates.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LrCatalog {
    pairs: Vec<LrPair>,
}

impl LrCatalog {
    pub fn new(pairs: Vec<LrPair>) -> Self {
        let mut seen = FxHashSet::default();
        let before = pairs.len();
        let pairs: Vec<LrPair> = pairs.into_iter().filter(|p| seen.insert(p.name())).collect();
        if pairs.len() < before {
            warn!("dropped {} duplicate ligand-receptor pairs", before - pairs.len());
        }
        LrCatalog { pairs }
    }

    /// Builds a catalog from `(ligand, receptor, annotation)` records.
    pub fn from_records<'r, I>(records: I, separator: &str) -> Result<Self>
    where
        I: IntoIterator<Item = (&'r str, &'r str, &'r str)>,
    {
        let pairs = records
            .into_iter()
            .map(|(l, r, k)| {
                Ok(LrPair {
                    ligand: GeneComplex::parse(l, separator)?,
                    receptor: GeneComplex::parse(r, separator)?,
                    kind: k.parse()?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(LrCatalog::new(pairs))
    }

    pub fn pairs(&self) -> &[LrPair] {
        &self.pairs
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComplexRule {
    Min,
    GeometricMean,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum InteractionRule {
    Product,
    Mean,
    GeometricMean,
}

impl InteractionRule {
    #[inline]
    pub fn apply(&self, ligand: f64, receptor: f64) -> f64 {
        match self {
            InteractionRule::Product => ligand * receptor,
            InteractionRule::Mean => 0.5 * (ligand + receptor),
            InteractionRule::GeometricMean => (ligand.max(0.0) * receptor.max(0.0)).sqrt(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LrOpts {
    /// Neighbourhood of secreted ligands, in lattice steps (default: 3.0)
    pub secreted_radius: f64,
    /// Neighbourhood of membrane proteins, in lattice steps (default: 1.0)
    pub contact_radius: f64,
    pub aggregation: AggregationOpts,
    pub complex: ComplexRule,
    pub interaction: InteractionRule,
}

impl Default for LrOpts {
    fn default() -> Self {
        LrOpts {
            secreted_radius: 3.0,
            contact_radius: 1.0,
            aggregation: AggregationOpts::default(),
            complex: ComplexRule::Min,
            interaction: InteractionRule::Product,
        }
    }
}

/// Output of [`LrEngine::run`].
#[derive(Clone, Debug)]
pub struct LrResult {
    /// Spot x pair intensity, columns named `ligand->receptor` in catalog order.
    pub scores: SignalMatrix,
    /// Spot x gene effective expression, columns named `gene@secreted` / `gene@contact`.
    pub effective: SignalMatrix,
    /// Pairs left unscored and the gene that caused it.
    pub skipped: Vec<(String, SpatialError)>,
}

type GeneKey = (String, SignalingKind);

/// The two aggregators of one LR analysis.
pub struct LrEngine<'a> {
    secreted: Aggregator<'a>,
    contact: Aggregator<'a>,
    opts: LrOpts,
}

impl<'a> LrEngine<'a> {
    pub fn new(secreted: &'a NeighborIndex, contact: &'a NeighborIndex, opts: LrOpts) -> Result<Self> {
        Ok(LrEngine {
            secreted: Aggregator::new(secreted, opts.aggregation.clone())?,
            contact: Aggregator::new(contact, opts.aggregation.clone())?,
            opts,
        })
    }

    fn aggregator(&self, kind: SignalingKind) -> &Aggregator<'a> {
        match kind {
            SignalingKind::Secreted => &self.secreted,
            SignalingKind::Contact => &self.contact,
        }
    }

    /// Effective expression of one gene over the range of `kind`. `None` if the gene is absent.
    pub fn effective_gene(&self, expr: &SignalMatrix, gene: &str, kind: SignalingKind) -> Result<Option<Vec<Option<f64>>>> {
        let column = match expr.column(gene) {
            Some(c) => c,
            None => return Ok(None),
        };
        let values = self.aggregator(kind).aggregate_with(&column, NeighborFilter::All)?;
        Ok(Some(values))
    }

    fn resolve_complex(&self, complex: &GeneComplex, kind: SignalingKind, effective: &FxHashMap<GeneKey, Vec<Option<f64>>>, n: usize) -> Option<Vec<Option<f64>>> {
        let parts: Vec<&Vec<Option<f64>>> = complex
            .subunits
            .iter()
            .map(|g| effective.get(&(g.clone(), kind)))
            .collect::<Option<_>>()?;
        let m = parts.len() as f64;
        Some(
            (0..n)
                .map(|r| {
                    let vals: Vec<f64> = parts.iter().map(|p| p[r]).collect::<Option<_>>()?;
                    Some(match self.opts.complex {
                        ComplexRule::Min => vals.iter().copied().fold(f64::INFINITY, f64::min),
                        ComplexRule::GeometricMean => {
                            (vals.iter().map(|v| v.max(0.0).ln()).sum::<f64>() / m).exp()
                        }
                    })
                })
                .collect(),
        )
    }

    pub fn run(&self, expr: &SignalMatrix, catalog: &LrCatalog, progress: &dyn ProgressObserver) -> Result<LrResult> {
        let n = expr.n_rows();
        if n == 0 {
            return Err(SpatialError::empty("expression table"));
        }
        if catalog.is_empty() {
            return Err(SpatialError::empty("ligand-receptor catalog"));
        }

        // every (gene, range) needed, in first-use order
        let mut needed: Vec<GeneKey> = Vec::new();
        let mut seen: FxHashSet<GeneKey> = FxHashSet::default();
        for pair in catalog.pairs() {
            let ligand = pair.ligand.subunits.iter().map(|g| (g.clone(), pair.kind));
            let receptor = pair.receptor.subunits.iter().map(|g| (g.clone(), SignalingKind::Contact));
            for key in ligand.chain(receptor) {
                if seen.insert(key.clone()) {
                    needed.push(key);
                }
            }
        }

        let tally = Tally::new(progress, "effective expression", needed.len());
        let computed: Vec<(GeneKey, Option<Vec<Option<f64>>>)> = needed
            .par_iter()
            .map(|key| {
                let v = self.effective_gene(expr, &key.0, key.1);
                tally.tick();
                v.map(|v| (key.clone(), v))
            })
            .collect::<Result<_>>()?;
        tally.finish();

        let mut effective: FxHashMap<GeneKey, Vec<Option<f64>>> = FxHashMap::default();
        let mut missing: FxHashSet<String> = FxHashSet::default();
        let mut effective_columns = Vec::new();
        for (key, values) in computed {
            match values {
                Some(v) => {
                    effective_columns.push((format!("{}@{}", key.0, key.1.tag()), v.clone()));
                    effective.insert(key, v);
                }
                None => {
                    missing.insert(key.0);
                }
            }
        }
        if !missing.is_empty() {
            let mut genes: Vec<&String> = missing.iter().collect();
            genes.sort();
            warn!("{} catalog genes absent from expression table: {:?}", genes.len(), genes);
        }

        let tally = Tally::new(progress, "interaction scores", catalog.len());
        let scored: Vec<(String, Vec<Option<f64>>, Option<SpatialError>)> = catalog
            .pairs()
            .par_iter()
            .map(|pair| {
                let name = pair.name();
                let absent = pair
                    .ligand
                    .subunits
                    .iter()
                    .chain(&pair.receptor.subunits)
                    .find(|g| missing.contains(*g));
                let out = match absent {
                    Some(gene) => (name, vec![None; n], Some(SpatialError::MissingGene { gene: gene.clone() })),
                    None => {
                        let l = self.resolve_complex(&pair.ligand, pair.kind, &effective, n);
                        let r = self.resolve_complex(&pair.receptor, SignalingKind::Contact, &effective, n);
                        match (l, r) {
                            (Some(l), Some(r)) => {
                                let v = l
                                    .iter()
                                    .zip(&r)
                                    .map(|(a, b)| Some(self.opts.interaction.apply((*a)?, (*b)?)))
                                    .collect();
                                (name, v, None)
                            }
                            _ => (
                                name,
                                vec![None; n],
                                Some(SpatialError::MissingGene { gene: pair.ligand.name.clone() }),
                            ),
                        }
                    }
                };
                tally.tick();
                out
            })
            .collect();
        tally.finish();

        let mut skipped = Vec::new();
        let mut columns = Vec::with_capacity(scored.len());
        for (name, values, err) in scored {
            if let Some(e) = err {
                debug!("pair {} skipped: {}", name, e);
                skipped.push((name.clone(), e));
            }
            columns.push((name, values));
        }

        info!(
            "scored {} ligand-receptor pairs over {} spots ({} skipped)",
            columns.len() - skipped.len(),
            n,
            skipped.len()
        );
        Ok(LrResult {
            scores: SignalMatrix::from_columns(expr.ids().to_vec(), columns)?,
            effective: SignalMatrix::from_columns(expr.ids().to_vec(), effective_columns)?,
            skipped,
        })
    }
}

/// Builds both neighbour indices from `coords` and runs the full analysis.
pub fn lr_scores(
    expr: &SignalMatrix,
    catalog: &LrCatalog,
    coords: &CoordinateTable,
    opts: &LrOpts,
    progress: &dyn ProgressObserver,
) -> Result<LrResult> {
    let secreted = NeighborIndex::build(coords, &NeighborQuery::radius(opts.secreted_radius))?;
    let contact = NeighborIndex::build(coords, &NeighborQuery::radius(opts.contact_radius))?;
    LrEngine::new(&secreted, &contact, opts.clone())?.run(expr, catalog, progress)
}

/// One pair's scores as a signal, if the pair was scored.
pub fn pair_signal(result: &LrResult, pair: &str) -> Option<Signal> {
    result.scores.column(pair)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NoProgress;
    use nalgebra::Point2;

    fn line(n: usize) -> CoordinateTable {
        let ids = (0..n).map(|i| format!("s{}", i)).collect();
        let pts = (0..n).map(|i| Point2::new(i as f64, 0.0)).collect();
        CoordinateTable::with_unit_step(ids, pts, 1.0).unwrap()
    }

    fn expression(coords: &CoordinateTable) -> SignalMatrix {
        let n = coords.len();
        SignalMatrix::from_columns(
            coords.ids().to_vec(),
            vec![
                // ligand only at s0
                ("CXCL13".into(), (0..n).map(|i| Some(if i == 0 { 4.0 } else { 0.0 })).collect()),
                ("CXCR5".into(), vec![Some(1.0); n]),
                ("ITGA4".into(), vec![Some(2.0); n]),
                ("ITGB1".into(), vec![Some(0.5); n]),
                ("VCAM1".into(), vec![Some(1.0); n]),
            ],
        )
        .unwrap()
    }

    fn catalog() -> LrCatalog {
        LrCatalog::from_records(
            vec![
                ("CXCL13", "CXCR5", "Secreted Signaling"),
                ("VCAM1", "ITGA4_ITGB1", "Cell-Cell Contact"),
                ("CCL19", "CCR7", "secreted"),
            ],
            "_",
        )
        .unwrap()
    }

    #[test]
    fn test_catalog_parsing() {
        let c = catalog();
        assert_eq!(c.len(), 3);
        assert_eq!(c.pairs()[1].receptor.subunits, vec!["ITGA4", "ITGB1"]);
        assert!(c.pairs()[1].receptor.is_complex());
        assert_eq!(c.pairs()[1].kind, SignalingKind::Contact);
        assert!(LrCatalog::from_records(vec![("A", "B", "telepathy")], "_").is_err());

        let dup = LrCatalog::from_records(vec![("A", "B", "contact"), ("A", "B", "contact")], "_").unwrap();
        assert_eq!(dup.len(), 1);
    }

    #[test]
    fn test_secreted_ligand_reaches_further_than_contact() {
        let coords = line(6);
        let res = lr_scores(&expression(&coords), &catalog(), &coords, &LrOpts::default(), &NoProgress).unwrap();
        let s = res.scores.column("CXCL13->CXCR5").unwrap();
        // s3 is within the secreted radius of s0, s4 is not
        assert!(s.values()[3].unwrap() > 0.0);
        assert_eq!(s.values()[4], Some(0.0));
        assert!(res.effective.column_index("CXCL13@secreted").is_some());
        assert!(res.effective.column_index("CXCR5@contact").is_some());
    }

    #[test]
    fn test_complex_resolves_to_min() {
        let coords = line(4);
        let res = lr_scores(&expression(&coords), &catalog(), &coords, &LrOpts::default(), &NoProgress).unwrap();
        let s = res.scores.column("VCAM1->ITGA4_ITGB1").unwrap();
        assert!(s.values().iter().all(|v| (v.unwrap() - 0.5).abs() < 1e-12));

        let opts = LrOpts {
            complex: ComplexRule::GeometricMean,
            interaction: InteractionRule::Mean,
            ..Default::default()
        };
        let res = lr_scores(&expression(&coords), &catalog(), &coords, &opts, &NoProgress).unwrap();
        let s = res.scores.column("VCAM1->ITGA4_ITGB1").unwrap();
        // geometric mean of 2.0 and 0.5 is 1.0, mean with ligand 1.0 is 1.0
        assert!(s.values().iter().all(|v| (v.unwrap() - 1.0).abs() < 1e-12));
    }

    #[test]
    fn test_missing_receptor_is_skipped_not_fatal() {
        let coords = line(4);
        let res = lr_scores(&expression(&coords), &catalog(), &coords, &LrOpts::default(), &NoProgress).unwrap();
        let s = res.scores.column("CCL19->CCR7").unwrap();
        assert!(s.values().iter().all(|v| v.is_none()));
        assert_eq!(res.skipped.len(), 1);
        assert_eq!(res.skipped[0].0, "CCL19->CCR7");
        assert!(res.skipped[0].1.is_recoverable());
        assert_eq!(res.scores.columns().len(), 3);
    }

    #[test]
    fn test_interaction_rules() {
        assert_eq!(InteractionRule::Product.apply(2.0, 3.0), 6.0);
        assert_eq!(InteractionRule::Mean.apply(2.0, 3.0), 2.5);
        assert_eq!(InteractionRule::GeometricMean.apply(4.0, 1.0), 2.0);
    }
}

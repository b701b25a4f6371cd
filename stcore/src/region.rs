//! Region classification of continuous scores.
//!
//! Three stages, each consuming the previous one:
//!
//! 1. [`define_tni_region`] band-passes a score: spots with `minval <= score <= maxval` are TNI,
//!    everything else (interior tumor above, interior normal below, missing) is nTNI. An optional
//!    despeckle pass demotes TNI spots without enough TNI neighbours.
//! 2. [`Thresholded::group`] names every TNI spot after the sorted set of domains found in its
//!    neighbourhood. Spots that only see their own domain are not transitional and drop out.
//! 3. [`Grouped::classify`] compares each grouped spot's tumor abundance with a reference level
//!    and assigns the tumor-facing or normal-facing side of its interface. Everything else is
//!    `others`.

use std::collections::BTreeSet;
use std::fmt;

use itertools::Itertools;
use log::{debug, info};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use statrs::statistics::{Data, Median};

use crate::error::{Result, SpatialError};
use crate::neighbors::NeighborIndex;
use crate::table::{align_rows, LabelTable, Signal, SpotTable};

pub const OTHERS: &str = "others";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TniLabel {
    Tni,
    NonTni,
}

impl fmt::Display for TniLabel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TniLabel::Tni => write!(f, "TNI"),
            TniLabel::NonTni => write!(f, "nTNI"),
        }
    }
}

/// Closed score band `[minval, maxval]`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Band {
    pub minval: f64,
    pub maxval: f64,
}

impl Default for Band {
    fn default() -> Self {
        Band {
            minval: 0.2,
            maxval: 0.8,
        }
    }
}

impl Band {
    pub fn new(minval: f64, maxval: f64) -> Result<Self> {
        let band = Band { minval, maxval };
        band.validate()?;
        Ok(band)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.minval.is_finite() && self.maxval.is_finite()) || self.minval > self.maxval {
            return Err(SpatialError::InvalidThreshold {
                minval: self.minval,
                maxval: self.maxval,
            });
        }
        Ok(())
    }

    #[inline]
    pub fn contains(&self, v: f64) -> bool {
        v >= self.minval && v <= self.maxval
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BoundarySide {
    Tumor,
    Normal,
}

impl fmt::Display for BoundarySide {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BoundarySide::Tumor => write!(f, "tumor_boundary"),
            BoundarySide::Normal => write!(f, "normal_boundary"),
        }
    }
}

/// Final per-spot class.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TniClass {
    Boundary { group: String, side: BoundarySide },
    Others,
}

impl TniClass {
    pub fn label(&self) -> String {
        match self {
            TniClass::Boundary { group, side } => format!("{}_{}", group, side),
            TniClass::Others => OTHERS.to_string(),
        }
    }

    pub fn side(&self) -> Option<BoundarySide> {
        match self {
            TniClass::Boundary { side, .. } => Some(*side),
            TniClass::Others => None,
        }
    }
}

/// Level a grouped spot's abundance is compared against.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReferencePolicy {
    /// Mean over neighbours in the same group, falling back to the group median.
    NeighborMean,
    GroupMedian,
    /// Median over all grouped spots.
    GlobalMedian,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RegionOpts {
    pub band: Band,
    /// Minimum TNI neighbours a TNI spot needs to keep its label; `None` disables despeckling.
    pub min_same_neighbors: Option<usize>,
    pub reference: ReferencePolicy,
    /// Joins domain names into group names (default: "_")
    pub group_separator: String,
}

impl Default for RegionOpts {
    fn default() -> Self {
        RegionOpts {
            band: Band::default(),
            min_same_neighbors: None,
            reference: ReferencePolicy::NeighborMean,
            group_separator: "_".to_string(),
        }
    }
}

/// Stage 1 output.
#[derive(Clone, Debug, PartialEq)]
pub struct Thresholded {
    labels: SpotTable<TniLabel>,
}

/// Band-pass of `score`, optionally despeckled over `despeckle = (index, min_same_neighbors)`.
pub fn define_tni_region(
    score: &Signal,
    band: &Band,
    despeckle: Option<(&NeighborIndex, usize)>,
) -> Result<Thresholded> {
    if score.is_empty() {
        return Err(SpatialError::empty("score vector"));
    }
    band.validate()?;

    let raw: Vec<TniLabel> = score
        .values()
        .iter()
        .map(|v| match v {
            Some(v) if band.contains(*v) => TniLabel::Tni,
            _ => TniLabel::NonTni,
        })
        .collect();

    let labels = match despeckle {
        None => raw,
        Some((index, min_same)) => {
            let rows = index.rows_for(score.ids(), "score")?;
            let mut by_index = vec![TniLabel::NonTni; index.len()];
            for (r, &i) in rows.iter().enumerate() {
                by_index[i] = raw[r];
            }
            let demoted = raw
                .iter()
                .zip(&rows)
                .map(|(l, &i)| {
                    if *l != TniLabel::Tni {
                        return *l;
                    }
                    let same = index
                        .neighbors(i)
                        .iter()
                        .filter(|nb| nb.index != i && by_index[nb.index] == TniLabel::Tni)
                        .count();
                    if same >= min_same { TniLabel::Tni } else { TniLabel::NonTni }
                })
                .collect::<Vec<_>>();
            let n_demoted = raw.iter().zip(&demoted).filter(|(a, b)| a != b).count();
            debug!("despeckle demoted {} isolated TNI spots", n_demoted);
            demoted
        }
    };

    let out = Thresholded {
        labels: score.with_values(labels),
    };
    info!(
        "TNI band [{}, {}]: {} of {} spots",
        band.minval,
        band.maxval,
        out.n_tni(),
        out.labels.len()
    );
    Ok(out)
}

impl Thresholded {
    pub fn labels(&self) -> &SpotTable<TniLabel> {
        &self.labels
    }

    pub fn n_tni(&self) -> usize {
        self.labels.values().iter().filter(|l| **l == TniLabel::Tni).count()
    }

    /// Stage 2: names TNI spots after the domains in their neighbourhood.
    pub fn group(self, domains: &LabelTable, index: &NeighborIndex, separator: &str) -> Result<Grouped> {
        let groups = group_tni_types(&self.labels, domains, index, separator)?;
        Ok(Grouped {
            labels: self.labels,
            groups,
        })
    }
}

/// Group name per transitional TNI spot, in the order of `labels`. Single-domain spots are
/// left out.
pub fn group_tni_types(
    labels: &SpotTable<TniLabel>,
    domains: &LabelTable,
    index: &NeighborIndex,
    separator: &str,
) -> Result<LabelTable> {
    let rows = index.rows_for(labels.ids(), "TNI labels")?;
    let dom_rows = index.rows_for(domains.ids(), "domains")?;
    let mut domain_of = vec![""; index.len()];
    for (r, &i) in dom_rows.iter().enumerate() {
        domain_of[i] = domains.values()[r].as_str();
    }

    let mut ids = Vec::new();
    let mut names = Vec::new();
    for ((id, label), &i) in labels.iter().zip(&rows) {
        if *label != TniLabel::Tni {
            continue;
        }
        let present: BTreeSet<&str> = std::iter::once(domain_of[i])
            .chain(index.neighbors(i).iter().map(|nb| domain_of[nb.index]))
            .collect();
        if present.len() < 2 {
            continue;
        }
        ids.push(id.to_string());
        names.push(present.into_iter().join(separator));
    }
    debug!("{} transitional TNI spots in {} groups", ids.len(), names.iter().unique().count());
    LabelTable::new(ids, names)
}

/// Stage 2 output.
#[derive(Clone, Debug, PartialEq)]
pub struct Grouped {
    labels: SpotTable<TniLabel>,
    groups: LabelTable,
}

impl Grouped {
    pub fn labels(&self) -> &SpotTable<TniLabel> {
        &self.labels
    }

    /// Group per transitional spot; only those spots are present.
    pub fn groups(&self) -> &LabelTable {
        &self.groups
    }

    /// Distinct group names, sorted.
    pub fn group_names(&self) -> Vec<String> {
        self.groups.values().iter().cloned().sorted().dedup().collect()
    }

    /// Group per spot of the full table, `others` for ungrouped spots.
    pub fn group_labels(&self) -> LabelTable {
        let lookup = self.groups.lookup();
        self.labels.map_with_ids(|id, _| lookup.get(id).map_or(OTHERS, |g| g.as_str()).to_string())
    }

    /// Stage 3: tumor-side / normal-side per grouped spot from the tumor abundance `es`.
    pub fn classify(self, es: &Signal, index: &NeighborIndex, policy: ReferencePolicy) -> Result<Classified> {
        let classes = tni_class(&self.labels, &self.groups, es, index, policy)?;
        Ok(Classified {
            labels: self.labels,
            groups: self.groups,
            classes,
        })
    }
}

fn median(values: Vec<f64>) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(Data::new(values).median())
    }
}

/// Directional class for every spot of `labels`.
pub fn tni_class(
    labels: &SpotTable<TniLabel>,
    groups: &LabelTable,
    es: &Signal,
    index: &NeighborIndex,
    policy: ReferencePolicy,
) -> Result<SpotTable<TniClass>> {
    let es_rows = align_rows(es.ids(), labels.ids(), "tumor abundance")?;
    let rows = index.rows_for(labels.ids(), "TNI labels")?;

    // per index row: group and abundance
    let group_lookup = groups.lookup();
    let mut group_of: Vec<Option<&str>> = vec![None; index.len()];
    let mut es_of: Vec<Option<f64>> = vec![None; index.len()];
    for (r, (id, _)) in labels.iter().enumerate() {
        group_of[rows[r]] = group_lookup.get(id).copied().map(String::as_str);
        es_of[rows[r]] = es.values()[es_rows[r]];
    }
    if group_lookup.len() > group_of.iter().flatten().count() {
        return Err(SpatialError::mismatch("TNI groups", "group table names spots outside the label table"));
    }

    let mut per_group: FxHashMap<&str, Vec<f64>> = FxHashMap::default();
    for (g, e) in group_of.iter().zip(&es_of) {
        if let (Some(g), Some(e)) = (g, e) {
            per_group.entry(*g).or_default().push(*e);
        }
    }
    let group_median: FxHashMap<&str, f64> = per_group
        .iter()
        .filter_map(|(g, v)| median(v.clone()).map(|m| (*g, m)))
        .collect();
    let global_median = median(per_group.values().flatten().copied().collect());

    let classes: Vec<TniClass> = rows
        .iter()
        .map(|&i| {
            let (group, own) = match (group_of[i], es_of[i]) {
                (Some(g), Some(e)) => (g, e),
                _ => return TniClass::Others,
            };
            let reference = match policy {
                ReferencePolicy::GroupMedian => group_median.get(group).copied(),
                ReferencePolicy::GlobalMedian => global_median,
                ReferencePolicy::NeighborMean => {
                    let peers: Vec<f64> = index
                        .neighbors(i)
                        .iter()
                        .filter(|nb| nb.index != i && group_of[nb.index] == Some(group))
                        .filter_map(|nb| es_of[nb.index])
                        .collect();
                    if peers.is_empty() {
                        group_median.get(group).copied()
                    } else {
                        Some(peers.iter().sum::<f64>() / peers.len() as f64)
                    }
                }
            };
            match reference {
                Some(reference) => TniClass::Boundary {
                    group: group.to_string(),
                    side: if own >= reference { BoundarySide::Tumor } else { BoundarySide::Normal },
                },
                None => TniClass::Others,
            }
        })
        .collect();

    Ok(labels.with_values(classes))
}

/// Stage 3 output.
#[derive(Clone, Debug, PartialEq)]
pub struct Classified {
    labels: SpotTable<TniLabel>,
    groups: LabelTable,
    classes: SpotTable<TniClass>,
}

impl Classified {
    pub fn labels(&self) -> &SpotTable<TniLabel> {
        &self.labels
    }

    pub fn groups(&self) -> &LabelTable {
        &self.groups
    }

    pub fn classes(&self) -> &SpotTable<TniClass> {
        &self.classes
    }

    /// Class labels as strings (`<group>_tumor_boundary`, `<group>_normal_boundary`, `others`).
    pub fn class_labels(&self) -> LabelTable {
        self.classes.map(|c| c.label())
    }

    /// Spot count per class label, sorted by label.
    pub fn counts(&self) -> Vec<(String, usize)> {
        self.classes.values().iter().map(|c| c.label()).counts().into_iter().sorted().collect()
    }
}

/// All three stages with one set of options.
#[derive(Clone, Debug, Default)]
pub struct RegionClassifier {
    pub opts: RegionOpts,
}

impl RegionClassifier {
    pub fn new(opts: RegionOpts) -> Self {
        RegionClassifier { opts }
    }

    pub fn run(&self, score: &Signal, domains: &LabelTable, es: &Signal, index: &NeighborIndex) -> Result<Classified> {
        let despeckle = self.opts.min_same_neighbors.map(|k| (index, k));
        define_tni_region(score, &self.opts.band, despeckle)?
            .group(domains, index, &self.opts.group_separator)?
            .classify(es, index, self.opts.reference)
    }
}

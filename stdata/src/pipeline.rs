//! Runs the configured analyses against a store and writes their outputs back.
//!
//! Output layout, one `analysis` key per result family:
//! - `scores`: `tni`, `tls`, `lr`, `lr_effective`, `codistribution`, `infiltration`
//! - `regions`: `tni_label`, `tni_group`, `tni_class`
//!
//! Rerunning an analysis replaces its earlier rows.

use std::collections::BTreeMap;

use log::{info, warn};
use serde::Serialize;

use stcore::aggregate::Aggregator;
use stcore::lattice::CoordinateTable;
use stcore::neighbors::NeighborIndex;
use stcore::palette::palette;
use stcore::progress::ProgressObserver;
use stcore::region::RegionClassifier;
use stcore::scores::codistribution::{codistribution, combined_proportion};
use stcore::scores::infiltration::infiltration;
use stcore::scores::lr::lr_scores;
use stcore::scores::rescale_unit;
use stcore::scores::tls::tls_score;
use stcore::scores::tni::{tni_score, tumor_enrichment};
use stcore::Signal;

use crate::config::{AnalysisConfig, CoDistributionConfig, InfiltrationConfig, LrConfig, TlsConfig, TniConfig};
use crate::data::handle::SpatialDataHandle;
use crate::error::Result;

/// What one analysis wrote.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AnalysisReport {
    pub analysis: String,
    /// Score or region names written
    pub outputs: Vec<String>,
    /// Recovered problems, e.g. skipped LR pairs
    pub notes: Vec<String>,
    /// Colour per region label, only for region outputs
    pub palette: BTreeMap<String, String>,
}

impl AnalysisReport {
    fn new(analysis: &str) -> Self {
        AnalysisReport {
            analysis: analysis.to_string(),
            ..Default::default()
        }
    }
}

/// Loads the lattice, hex-corrected along the configured axis or the platform default.
pub fn load_coordinates(handle: &SpatialDataHandle, config: &AnalysisConfig) -> Result<CoordinateTable> {
    let coords = handle.read_coordinates(config.platform, config.hex_axis)?;
    info!("{} spots, unit step {:.3}", coords.len(), coords.unit_step());
    Ok(coords)
}

pub fn run(
    handle: &mut SpatialDataHandle,
    config: &AnalysisConfig,
    progress: &dyn ProgressObserver,
) -> Result<Vec<AnalysisReport>> {
    let coords = load_coordinates(handle, config)?;
    let index = NeighborIndex::build(&coords, &config.neighbors)?;
    info!(
        "neighbour index: radius {}, mean degree {:.2}",
        index.radius(),
        index.mean_degree()
    );

    let total = config.n_analyses();
    let mut reports = Vec::with_capacity(total);
    let stage = "analyses";

    if let Some(cfg) = &config.tni {
        reports.push(run_tni(handle, &index, cfg)?);
        progress.on_progress(stage, reports.len(), total);
    }
    if let Some(cfg) = &config.tls {
        reports.push(run_tls(handle, &index, cfg)?);
        progress.on_progress(stage, reports.len(), total);
    }
    if let Some(cfg) = &config.lr {
        reports.push(run_lr(handle, &coords, cfg, progress)?);
        progress.on_progress(stage, reports.len(), total);
    }
    if let Some(cfg) = &config.codistribution {
        reports.push(run_codistribution(handle, &index, cfg)?);
        progress.on_progress(stage, reports.len(), total);
    }
    if let Some(cfg) = &config.infiltration {
        reports.push(run_infiltration(handle, &index, cfg)?);
        progress.on_progress(stage, reports.len(), total);
    }
    progress.on_finish(stage);
    Ok(reports)
}

fn write_signals(handle: &mut SpatialDataHandle, report: &mut AnalysisReport, signals: &[(&str, &Signal)]) -> Result<()> {
    handle.clear_analysis(&report.analysis)?;
    for (name, signal) in signals {
        handle.write_scores(&report.analysis, name, signal)?;
        report.outputs.push(name.to_string());
    }
    Ok(())
}

pub fn run_tni(handle: &mut SpatialDataHandle, index: &NeighborIndex, cfg: &TniConfig) -> Result<AnalysisReport> {
    let abundance = handle.read_signal(&cfg.tumor_signal)?;
    let enrichment = match &cfg.total_signal {
        Some(total) => tumor_enrichment(&abundance, &handle.read_signal(total)?)?,
        None => abundance,
    };
    let domains = handle.read_labels(&cfg.domain_label)?;
    let scores = tni_score(&enrichment, &domains, index, &cfg.opts)?;
    let score = if cfg.rescale {
        rescale_unit(&scores.score)
    } else {
        scores.score.clone()
    };

    let mut report = AnalysisReport::new("tni");
    write_signals(
        handle,
        &mut report,
        &[
            ("enrichment", &enrichment),
            ("within_domain", &scores.within_domain),
            ("across_domain", &scores.across_domain),
            ("score", &score),
        ],
    )?;

    if let Some(region) = &cfg.region {
        let classified = RegionClassifier::new(region.clone()).run(&score, &domains, &enrichment, index)?;
        let labels = classified.labels().map(|l| l.to_string());
        let classes = classified.class_labels();
        for (analysis, table) in [("tni_label", &labels), ("tni_group", classified.groups()), ("tni_class", &classes)] {
            handle.clear_analysis(analysis)?;
            handle.write_regions(analysis, table)?;
            report.outputs.push(analysis.to_string());
        }
        for (label, n) in classified.counts() {
            info!("  {}: {} spots", label, n);
        }
        report.palette = palette(classes.values().iter().map(|s| s.as_str()));
    }
    Ok(report)
}

pub fn run_tls(handle: &mut SpatialDataHandle, index: &NeighborIndex, cfg: &TlsConfig) -> Result<AnalysisReport> {
    let a = handle.read_signal(&cfg.signature_a)?;
    let b = handle.read_signal(&cfg.signature_b)?;
    let props = handle.read_proportions()?;
    let b_side = combined_proportion(&props, &cfg.b_cell_types)?;
    let t_side = combined_proportion(&props, &cfg.t_cell_types)?;
    let rule = cfg.codistribution_rule;
    let codist = Signal::new(
        b_side.ids().to_vec(),
        b_side
            .values()
            .iter()
            .zip(t_side.values())
            .map(|(b, t)| Some(rule.apply((*b)?, (*t)?)))
            .collect(),
    )?;
    let domains = handle.read_labels(&cfg.domain_label)?;
    let scores = tls_score(&a, &b, &codist, &domains, index, &cfg.opts)?;

    let mut report = AnalysisReport::new("tls");
    write_signals(
        handle,
        &mut report,
        &[
            ("signature_a", &scores.signature_a),
            ("signature_b", &scores.signature_b),
            ("codistribution", &scores.codistribution),
            ("score", &scores.score),
        ],
    )?;
    Ok(report)
}

pub fn run_lr(
    handle: &mut SpatialDataHandle,
    coords: &CoordinateTable,
    cfg: &LrConfig,
    progress: &dyn ProgressObserver,
) -> Result<AnalysisReport> {
    let expr = handle.read_expression()?;
    let catalog = handle.read_lr_catalog(&cfg.separator)?;
    let result = lr_scores(&expr, &catalog, coords, &cfg.opts, progress)?;

    let mut report = AnalysisReport::new("lr");
    for (pair, err) in &result.skipped {
        warn!("LR pair {} skipped: {}", pair, err);
        report.notes.push(format!("{}: {}", pair, err));
    }
    for (analysis, matrix) in [("lr", &result.scores), ("lr_effective", &result.effective)] {
        handle.clear_analysis(analysis)?;
        handle.write_score_matrix(analysis, matrix)?;
    }
    report.outputs = result.scores.columns().to_vec();
    Ok(report)
}

pub fn run_codistribution(
    handle: &mut SpatialDataHandle,
    index: &NeighborIndex,
    cfg: &CoDistributionConfig,
) -> Result<AnalysisReport> {
    let props = handle.read_proportions()?;
    let smoother = if cfg.opts.smooth {
        Some(Aggregator::new(index, cfg.aggregation.clone())?)
    } else {
        None
    };
    let pairs = codistribution(&props, &cfg.opts, smoother.as_ref())?;

    let mut report = AnalysisReport::new("codistribution");
    handle.clear_analysis(&report.analysis)?;
    handle.write_score_matrix(&report.analysis, &pairs)?;
    report.outputs = pairs.columns().to_vec();
    Ok(report)
}

pub fn run_infiltration(
    handle: &mut SpatialDataHandle,
    index: &NeighborIndex,
    cfg: &InfiltrationConfig,
) -> Result<AnalysisReport> {
    let props = handle.read_proportions()?;
    let smoother = if cfg.opts.smooth {
        Some(Aggregator::new(index, cfg.aggregation.clone())?)
    } else {
        None
    };
    let indices = infiltration(&props, &cfg.opts, smoother.as_ref())?;

    let mut report = AnalysisReport::new("infiltration");
    write_signals(
        handle,
        &mut report,
        &[("enrichment", &indices.enrichment), ("diversity", &indices.diversity)],
    )?;
    Ok(report)
}

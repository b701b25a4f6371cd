use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use serde::{Deserialize, Serialize};

use stcore::aggregate::AggregationOpts;
use stcore::lattice::{HexAxis, Platform};
use stcore::neighbors::NeighborQuery;
use stcore::region::RegionOpts;
use stcore::scores::codistribution::{CoDistributionOpts, CoDistributionRule};
use stcore::scores::infiltration::InfiltrationOpts;
use stcore::scores::lr::LrOpts;
use stcore::scores::tls::TlsOpts;
use stcore::scores::tni::TniOpts;

use crate::error::Result;

/// One JSON document driving `stdata run`. A missing analysis section skips that analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Acquisition platform, Visium coordinates are hex-corrected on load (default: Visium)
    pub platform: Platform,
    /// Hex correction axis, overrides the platform default
    pub hex_axis: Option<HexAxis>,
    /// Neighbourhood used by TNI, TLS, region classification and smoothing
    pub neighbors: NeighborQuery,
    pub tni: Option<TniConfig>,
    pub tls: Option<TlsConfig>,
    pub lr: Option<LrConfig>,
    pub codistribution: Option<CoDistributionConfig>,
    pub infiltration: Option<InfiltrationConfig>,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        AnalysisConfig {
            platform: Platform::Visium,
            hex_axis: None,
            neighbors: NeighborQuery::default(),
            tni: None,
            tls: None,
            lr: None,
            codistribution: None,
            infiltration: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TniConfig {
    /// Signal with tumor abundance (default: "tumor")
    pub tumor_signal: String,
    /// Total signal to divide by, the raw abundance is used when absent
    pub total_signal: Option<String>,
    /// Label with tissue domains (default: "domain")
    pub domain_label: String,
    pub opts: TniOpts,
    /// Min-max rescale the score to [0, 1] before it is written and thresholded (default: true)
    pub rescale: bool,
    /// Region classification on top of the TNI score
    pub region: Option<RegionOpts>,
}

impl Default for TniConfig {
    fn default() -> Self {
        TniConfig {
            tumor_signal: "tumor".to_string(),
            total_signal: None,
            domain_label: "domain".to_string(),
            opts: TniOpts::default(),
            rescale: true,
            region: Some(RegionOpts::default()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    pub signature_a: String,
    pub signature_b: String,
    /// Cell types pooled on the B side of the co-distribution component
    pub b_cell_types: Vec<String>,
    /// Cell types pooled on the T side of the co-distribution component
    pub t_cell_types: Vec<String>,
    pub codistribution_rule: CoDistributionRule,
    pub domain_label: String,
    pub opts: TlsOpts,
}

impl Default for TlsConfig {
    fn default() -> Self {
        TlsConfig {
            signature_a: "tls_b_signature".to_string(),
            signature_b: "tls_t_signature".to_string(),
            b_cell_types: vec!["B cell".to_string(), "Plasma".to_string()],
            t_cell_types: vec!["CD4 T cell".to_string(), "CD8 T cell".to_string()],
            codistribution_rule: CoDistributionRule::Product,
            domain_label: "domain".to_string(),
            opts: TlsOpts::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LrConfig {
    /// Complex subunit separator in the catalog (default: "_")
    pub separator: String,
    pub opts: LrOpts,
}

impl Default for LrConfig {
    fn default() -> Self {
        LrConfig {
            separator: "_".to_string(),
            opts: LrOpts::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoDistributionConfig {
    pub opts: CoDistributionOpts,
    /// Smoothing applied when `opts.smooth` is set
    pub aggregation: AggregationOpts,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InfiltrationConfig {
    pub opts: InfiltrationOpts,
    /// Smoothing applied when `opts.smooth` is set
    pub aggregation: AggregationOpts,
}

impl AnalysisConfig {
    /// Every analysis enabled with default settings; what `stdata init-config` prints.
    pub fn template() -> Self {
        AnalysisConfig {
            tni: Some(TniConfig::default()),
            tls: Some(TlsConfig::default()),
            lr: Some(LrConfig::default()),
            codistribution: Some(CoDistributionConfig::default()),
            infiltration: Some(InfiltrationConfig::default()),
            ..Default::default()
        }
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        Ok(serde_json::from_reader(reader)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn n_analyses(&self) -> usize {
        [
            self.tni.is_some(),
            self.tls.is_some(),
            self.lr.is_some(),
            self.codistribution.is_some(),
            self.infiltration.is_some(),
        ]
        .iter()
        .filter(|x| **x)
        .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stcore::region::ReferencePolicy;
    use stcore::scores::lr::ComplexRule;

    #[test]
    fn test_empty_document_runs_nothing() {
        let c = AnalysisConfig::from_json("{}").unwrap();
        assert_eq!(c.n_analyses(), 0);
        assert_eq!(c.platform, Platform::Visium);
        assert!((c.neighbors.radius - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_partial_sections_take_defaults() {
        let c = AnalysisConfig::from_json(
            r#"{
                "platform": "Generic",
                "tni": { "tumor_signal": "ES", "opts": { "contrast_weight": 0.5 } },
                "lr": { "opts": { "complex": "GeometricMean" } }
            }"#,
        )
        .unwrap();
        let tni = c.tni.unwrap();
        assert_eq!(tni.tumor_signal, "ES");
        assert_eq!(tni.domain_label, "domain");
        assert!((tni.opts.contrast_weight - 0.5).abs() < 1e-12);
        assert!(tni.rescale);
        assert_eq!(tni.region.unwrap().reference, ReferencePolicy::NeighborMean);
        let lr = c.lr.unwrap();
        assert_eq!(lr.opts.complex, ComplexRule::GeometricMean);
        assert!((lr.opts.secreted_radius - 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_template_round_trip() {
        let json = AnalysisConfig::template().to_json_pretty().unwrap();
        let back = AnalysisConfig::from_json(&json).unwrap();
        assert_eq!(back.n_analyses(), 5);
    }

    #[test]
    fn test_bad_json_is_config_error() {
        assert!(matches!(
            AnalysisConfig::from_json("{ \"tni\": 3 }"),
            Err(crate::error::StDataError::Config(_))
        ));
    }
}

//! Engine configuration surface.

use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;

const DEFAULT_CONFIG_PATH: &str = "/etc/redshow/redshow.toml";
const ENV_CONFIG_PATH: &str = "REDSHOW_CONFIG";

/// Default value for a memory instruction's data type when inference leaves
/// it unresolved.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum DefaultDataType {
    #[default]
    Int,
    Float,
}

/// Float quantization precision levels for the value-pattern approximate
/// pass.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum PrecisionLevel {
    Max,
    High,
    Mid,
    Low,
    Min,
    Valid,
}

impl PrecisionLevel {
    /// Mantissa bits kept for an f32 value at this precision level.
    pub fn f32_precision(self) -> u32 {
        match self {
            PrecisionLevel::Max => 23,
            PrecisionLevel::High => 20,
            PrecisionLevel::Mid => 15,
            PrecisionLevel::Low => 11,
            PrecisionLevel::Min => 7,
            PrecisionLevel::Valid => 3,
        }
    }

    /// Mantissa bits kept for an f64 value at this precision level.
    pub fn f64_precision(self) -> u32 {
        match self {
            PrecisionLevel::Max => 52,
            PrecisionLevel::High => 46,
            PrecisionLevel::Mid => 36,
            PrecisionLevel::Low => 28,
            PrecisionLevel::Min => 20,
            PrecisionLevel::Valid => 12,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnalysisType {
    TemporalRedundancy,
    SpatialRedundancy,
    ValuePattern,
    DataFlow,
    MemoryLiveness,
    MemoryHeatmap,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Config {
    pub output_dir: PathBuf,
    pub enabled_analyses: HashSet<AnalysisType>,
    pub default_data_type: DefaultDataType,
    pub approximate_precision: PrecisionLevel,
    pub pc_views_limit: usize,
    pub mem_views_limit: usize,
    /// Data-flow and liveness: skip accumulating per-kernel read ranges
    /// beyond the first (`REDSHOW_ANALYSIS_READ_TRACE_IGNORE`).
    pub read_trace_ignore: bool,
    /// Enable sha256 content hashing for data-flow duplicate detection.
    pub content_hashing: bool,
    pub float_decimal_eps_f32: f64,
    pub float_decimal_eps_f64: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("."),
            enabled_analyses: HashSet::from([
                AnalysisType::TemporalRedundancy,
                AnalysisType::SpatialRedundancy,
                AnalysisType::ValuePattern,
                AnalysisType::DataFlow,
            ]),
            default_data_type: DefaultDataType::default(),
            approximate_precision: PrecisionLevel::Mid,
            pc_views_limit: default_pc_views_limit(),
            mem_views_limit: default_mem_views_limit(),
            read_trace_ignore: false,
            content_hashing: true,
            float_decimal_eps_f32: 1e-6,
            float_decimal_eps_f64: 1e-14,
        }
    }
}

fn default_pc_views_limit() -> usize {
    10
}

fn default_mem_views_limit() -> usize {
    10
}

impl Config {
    /// Load configuration from file. The path can be overridden with the
    /// `REDSHOW_CONFIG` environment variable. If the file is missing or
    /// fails to parse, defaults are returned.
    pub fn load() -> Self {
        let path =
            std::env::var(ENV_CONFIG_PATH).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        match fs::read_to_string(&path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_default(),
            Err(_) => Config::default(),
        }
    }

    pub fn is_enabled(&self, analysis: AnalysisType) -> bool {
        self.enabled_analyses.contains(&analysis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn parse_config_defaults() {
        let toml = r#"
output_dir = "/tmp/redshow-out"
enabled_analyses = ["TEMPORAL_REDUNDANCY", "DATA_FLOW"]
default_data_type = "FLOAT"
approximate_precision = "HIGH"
pc_views_limit = 5
mem_views_limit = 8
read_trace_ignore = true
content_hashing = false
float_decimal_eps_f32 = 1e-5
float_decimal_eps_f64 = 1e-13
"#;
        let cfg: Config = toml::from_str(toml).unwrap();
        assert_eq!(cfg.output_dir, PathBuf::from("/tmp/redshow-out"));
        assert!(cfg.is_enabled(AnalysisType::TemporalRedundancy));
        assert!(cfg.is_enabled(AnalysisType::DataFlow));
        assert!(!cfg.is_enabled(AnalysisType::SpatialRedundancy));
        assert_eq!(cfg.default_data_type, DefaultDataType::Float);
        assert_eq!(cfg.pc_views_limit, 5);
        assert!(cfg.read_trace_ignore);
        assert!(!cfg.content_hashing);
    }

    #[test]
    fn defaults_enable_core_four_analyzers() {
        let cfg = Config::default();
        assert!(cfg.is_enabled(AnalysisType::TemporalRedundancy));
        assert!(cfg.is_enabled(AnalysisType::SpatialRedundancy));
        assert!(cfg.is_enabled(AnalysisType::ValuePattern));
        assert!(cfg.is_enabled(AnalysisType::DataFlow));
        assert!(!cfg.is_enabled(AnalysisType::MemoryLiveness));
    }

    #[test]
    fn env_override() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "pc_views_limit = 42").unwrap();
        std::env::set_var(ENV_CONFIG_PATH, file.path());
        let cfg = Config::load();
        assert_eq!(cfg.pc_views_limit, 42);
        std::env::remove_var(ENV_CONFIG_PATH);
    }

    #[test]
    fn precision_levels_narrow_monotonically() {
        assert!(PrecisionLevel::Max.f32_precision() > PrecisionLevel::Min.f32_precision());
        assert!(PrecisionLevel::Max.f64_precision() > PrecisionLevel::Min.f64_precision());
    }
}

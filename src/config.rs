//! Export configuration
//!
//! Every knob of a pipeline run lives in [`ExportConfig`]. The defaults are the
//! constants the Android app was built against, so running without a config
//! file reproduces the bundled assets.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::labels::LabelSet;
use crate::utils::error::{ExportError, Result};

/// Extension burn's compact recorder appends to a checkpoint stem
pub const CHECKPOINT_EXTENSION: &str = "mpk.gz";

/// Upper bound on conv blocks; each one halves the spatial size
pub const MAX_NUM_BLOCKS: usize = 16;

/// Complete configuration of one pipeline run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    /// Which bridge failures may be replaced by the untrained placeholder
    pub fallback: FallbackPolicy,
    /// Class names in output-index order
    pub labels: LabelSet,
    /// Seed for the placeholder's weight initialisation
    pub placeholder_seed: u64,
    /// Seed for the smoke-test input
    pub validation_seed: u64,
    pub paths: PathConfig,
    pub architecture: ArchitectureConfig,
    pub input: InputConfig,
    pub interchange: InterchangeOptions,
    pub optimization: OptimizationPolicy,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            fallback: FallbackPolicy::default(),
            labels: LabelSet::rice_diseases(),
            placeholder_seed: 42,
            validation_seed: 42,
            paths: PathConfig::default(),
            architecture: ArchitectureConfig::default(),
            input: InputConfig::default(),
            interchange: InterchangeOptions::default(),
            optimization: OptimizationPolicy::default(),
        }
    }
}

impl ExportConfig {
    /// Number of output classes, taken from the label set
    pub fn num_classes(&self) -> usize {
        self.labels.len()
    }

    /// Source-framework input shape `[1, C, H, W]` used for the trace pass
    pub fn dummy_input_shape(&self) -> [usize; 4] {
        [1, self.input.channels, self.input.image_size, self.input.image_size]
    }

    /// Mobile input shape `[1, H, W, C]`
    pub fn mobile_input_shape(&self) -> [usize; 4] {
        [1, self.input.image_size, self.input.image_size, self.input.channels]
    }

    /// Mobile output shape `[1, classes]`
    pub fn mobile_output_shape(&self) -> [usize; 2] {
        [1, self.num_classes()]
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let arch = &self.architecture;
        if arch.name.trim().is_empty() {
            return Err(ExportError::Config("architecture name must not be empty".to_string()));
        }
        if arch.num_blocks == 0 || arch.num_blocks > MAX_NUM_BLOCKS {
            return Err(ExportError::Config(format!(
                "num_blocks must be in range [1, {}], got {}",
                MAX_NUM_BLOCKS, arch.num_blocks
            )));
        }
        if arch.base_filters == 0 || arch.hidden_units == 0 {
            return Err(ExportError::Config(
                "base_filters and hidden_units must be greater than 0".to_string(),
            ));
        }
        // Filters double per block
        if arch
            .base_filters
            .checked_mul(1 << (arch.num_blocks - 1))
            .is_none()
        {
            return Err(ExportError::Config(format!(
                "base_filters {} overflows after {} doubling blocks",
                arch.base_filters, arch.num_blocks
            )));
        }
        if !(0.0..1.0).contains(&arch.dropout) {
            return Err(ExportError::Config("dropout must be in range [0.0, 1.0)".to_string()));
        }

        if self.input.channels == 0 {
            return Err(ExportError::Config("channels must be greater than 0".to_string()));
        }
        // Every block halves the spatial size; the last one must keep at least one pixel
        if self.input.image_size >> arch.num_blocks == 0 {
            return Err(ExportError::Config(format!(
                "image_size {} is too small for {} pooling blocks",
                self.input.image_size, arch.num_blocks
            )));
        }
        if self.input.image_size < 4 {
            return Err(ExportError::Config(
                "image_size must be at least 4 for the placeholder model".to_string(),
            ));
        }

        if self.interchange.opset_version < 7 {
            return Err(ExportError::Config("opset_version must be at least 7".to_string()));
        }

        let paths = &self.paths;
        if paths.artifact_file.is_empty() || paths.labels_file.is_empty() {
            return Err(ExportError::Config("output file names must not be empty".to_string()));
        }
        if paths.artifact_file == paths.labels_file {
            return Err(ExportError::Config(
                "artifact and labels must be different files".to_string(),
            ));
        }

        Ok(())
    }

    /// Load configuration from a TOML file; missing keys keep their defaults
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            ExportError::Config(format!("Failed to read config {}: {e}", path.display()))
        })?;

        toml::from_str(&content)
            .map_err(|e| ExportError::Config(format!("Failed to parse config {}: {e}", path.display())))
    }

    /// Render the configuration as TOML
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| ExportError::Serialization(e.to_string()))
    }

    /// Save configuration to a JSON file
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Load configuration from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }
}

/// Input and output locations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathConfig {
    /// Checkpoint stem; the record lives at `<stem>.mpk.gz`, metadata at `<stem>.json`
    pub checkpoint: PathBuf,
    /// App asset directory receiving the artifact and labels
    pub assets_dir: PathBuf,
    pub artifact_file: String,
    pub labels_file: String,
    /// Temporary interchange graph location
    pub interchange: PathBuf,
}

impl Default for PathConfig {
    fn default() -> Self {
        Self {
            checkpoint: PathBuf::from(
                "app/src/main/java/com/zynt/sumviltadconnect/rice-disease-api/rice_disease_model_final",
            ),
            assets_dir: PathBuf::from("app/src/main/assets"),
            artifact_file: "rice_disease_model.mgph".to_string(),
            labels_file: "labels.txt".to_string(),
            interchange: PathBuf::from("rice_disease_model.ixg"),
        }
    }
}

impl PathConfig {
    pub fn artifact_path(&self) -> PathBuf {
        self.assets_dir.join(&self.artifact_file)
    }

    pub fn labels_path(&self) -> PathBuf {
        self.assets_dir.join(&self.labels_file)
    }

    /// Checkpoint path with any recorder extension removed
    pub fn checkpoint_stem(&self) -> PathBuf {
        let raw = self.checkpoint.to_string_lossy();
        let suffix = format!(".{}", CHECKPOINT_EXTENSION);
        match raw.strip_suffix(&suffix) {
            Some(stem) => PathBuf::from(stem),
            None => self.checkpoint.clone(),
        }
    }

    /// File the compact recorder reads
    pub fn checkpoint_record_path(&self) -> PathBuf {
        self.checkpoint_stem().with_extension(CHECKPOINT_EXTENSION)
    }

    /// Optional JSON sidecar describing the checkpoint
    pub fn checkpoint_metadata_path(&self) -> PathBuf {
        self.checkpoint_stem().with_extension("json")
    }
}

/// Declared architecture of the trained source model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchitectureConfig {
    /// Identifier stored in checkpoint metadata
    pub name: String,
    /// Conv blocks, each halving the spatial size
    pub num_blocks: usize,
    /// Filters of the first block; doubled every block
    pub base_filters: usize,
    /// Width of the hidden fully connected layer
    pub hidden_units: usize,
    pub dropout: f64,
}

impl Default for ArchitectureConfig {
    fn default() -> Self {
        Self {
            name: "rice_disease_cnn".to_string(),
            num_blocks: 4,
            base_filters: 32,
            hidden_units: 256,
            dropout: 0.3,
        }
    }
}

/// Image geometry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InputConfig {
    pub image_size: usize,
    pub channels: usize,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            image_size: 224,
            channels: 3,
        }
    }
}

/// Options of the source-to-interchange export
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterchangeOptions {
    pub opset_version: u32,
    /// Fold batch-norm into the preceding convolution
    pub constant_folding: bool,
    /// Emit probabilities instead of logits
    pub append_softmax: bool,
    /// Keep the interchange file after conversion
    pub keep_file: bool,
}

impl Default for InterchangeOptions {
    fn default() -> Self {
        Self {
            opset_version: 11,
            constant_folding: true,
            append_softmax: true,
            keep_file: false,
        }
    }
}

/// Operator sets an artifact may use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupportedOps {
    BuiltinsOnly,
    BuiltinsAndSelect,
}

/// Storage precision of float weights
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightPrecision {
    Float32,
    Float16,
}

impl std::fmt::Display for WeightPrecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WeightPrecision::Float32 => write!(f, "float32"),
            WeightPrecision::Float16 => write!(f, "float16"),
        }
    }
}

/// Size/precision/operator-compatibility choices applied to an artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizationPolicy {
    /// Dynamic-range int8 weights when precision is float32
    pub default_quantization: bool,
    pub supported_ops: SupportedOps,
    pub weight_precision: WeightPrecision,
}

impl Default for OptimizationPolicy {
    fn default() -> Self {
        Self {
            default_quantization: true,
            supported_ops: SupportedOps::BuiltinsOnly,
            weight_precision: WeightPrecision::Float16,
        }
    }
}

/// Which bridge failures are answered with the untrained placeholder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackPolicy {
    /// Only a missing converter
    #[default]
    BridgeUnavailable,
    /// A missing converter or a structural conversion failure
    AnyBridgeFailure,
}

impl FallbackPolicy {
    /// Whether `err` may be replaced by the placeholder artifact
    pub fn allows(&self, err: &ExportError) -> bool {
        match err {
            ExportError::BridgeUnavailable(_) => true,
            ExportError::ConversionError(_) => *self == FallbackPolicy::AnyBridgeFailure,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config_is_valid() {
        let config = ExportConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.num_classes(), 4);
        assert_eq!(config.dummy_input_shape(), [1, 3, 224, 224]);
        assert_eq!(config.mobile_input_shape(), [1, 224, 224, 3]);
        assert_eq!(config.mobile_output_shape(), [1, 4]);
    }

    #[test]
    fn test_config_validation() {
        let mut config = ExportConfig::default();
        config.architecture.num_blocks = 0;
        assert!(config.validate().is_err());

        config = ExportConfig::default();
        config.input.image_size = 8; // 4 blocks would pool below one pixel
        assert!(config.validate().is_err());

        config = ExportConfig::default();
        config.architecture.dropout = 1.5;
        assert!(config.validate().is_err());

        config = ExportConfig::default();
        config.paths.labels_file = config.paths.artifact_file.clone();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_oversized_architecture_is_rejected() {
        let mut config = ExportConfig::default();
        config.architecture.num_blocks = 64;
        assert!(matches!(config.validate(), Err(ExportError::Config(_))));

        config.architecture.num_blocks = MAX_NUM_BLOCKS + 1;
        assert!(matches!(config.validate(), Err(ExportError::Config(_))));

        config = ExportConfig::default();
        config.architecture.base_filters = usize::MAX / 2;
        assert!(matches!(config.validate(), Err(ExportError::Config(_))));

        let parsed: ExportConfig = toml::from_str("[architecture]\nnum_blocks = 1000\n").unwrap();
        assert!(parsed.validate().is_err());
    }

    #[test]
    fn test_default_policy_stores_half_precision() {
        let policy = OptimizationPolicy::default();
        assert_eq!(policy.weight_precision, WeightPrecision::Float16);
        assert!(policy.default_quantization);
        assert_eq!(policy.supported_ops, SupportedOps::BuiltinsOnly);
    }

    #[test]
    fn test_checkpoint_paths() {
        let mut paths = PathConfig::default();
        paths.checkpoint = PathBuf::from("models/final.mpk.gz");
        assert_eq!(paths.checkpoint_stem(), PathBuf::from("models/final"));
        assert_eq!(paths.checkpoint_record_path(), PathBuf::from("models/final.mpk.gz"));
        assert_eq!(paths.checkpoint_metadata_path(), PathBuf::from("models/final.json"));

        paths.checkpoint = PathBuf::from("models/final");
        assert_eq!(paths.checkpoint_record_path(), PathBuf::from("models/final.mpk.gz"));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("export.toml");
        fs::write(
            &path,
            r#"
fallback = "any_bridge_failure"

[optimization]
weight_precision = "float32"

[paths]
assets_dir = "out/assets"
"#,
        )
        .unwrap();

        let config = ExportConfig::from_toml_file(&path).unwrap();
        assert_eq!(config.fallback, FallbackPolicy::AnyBridgeFailure);
        assert_eq!(config.optimization.weight_precision, WeightPrecision::Float32);
        assert!(config.optimization.default_quantization);
        assert_eq!(config.paths.artifact_path(), PathBuf::from("out/assets/rice_disease_model.mgph"));
        assert_eq!(config.labels, LabelSet::rice_diseases());
    }

    #[test]
    fn test_toml_rejects_bad_labels() {
        let result: std::result::Result<ExportConfig, _> =
            toml::from_str(r#"labels = ["Blast", "Blast"]"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_json_save_load() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("export.json");

        let mut config = ExportConfig::default();
        config.optimization.supported_ops = SupportedOps::BuiltinsAndSelect;
        config.save(&path).unwrap();

        assert_eq!(ExportConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_fallback_policy_routing() {
        let unavailable = ExportError::BridgeUnavailable("feature off".to_string());
        let conversion = ExportError::ConversionError("bad graph".to_string());
        let mismatch = ExportError::ArchitectureMismatch("fc2".to_string());
        let missing = ExportError::CheckpointNotFound(PathBuf::from("x"));

        let strict = FallbackPolicy::BridgeUnavailable;
        assert!(strict.allows(&unavailable));
        assert!(!strict.allows(&conversion));
        assert!(!strict.allows(&mismatch));
        assert!(!strict.allows(&missing));

        let lenient = FallbackPolicy::AnyBridgeFailure;
        assert!(lenient.allows(&unavailable));
        assert!(lenient.allows(&conversion));
        assert!(!lenient.allows(&mismatch));
        assert!(!lenient.allows(&missing));
    }
}

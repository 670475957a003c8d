//! Model artifact pipeline
//!
//! Checkpoint → interchange graph → mobile graph → artifact + labels →
//! smoke test. Each stage finishes before the next one starts.
//!
//! When the bridge fails, the configured [`FallbackPolicy`] decides whether
//! the untrained placeholder is written instead. A placeholder run is always
//! announced with a warning and reported with [`ArtifactOrigin::Placeholder`];
//! every other failure is returned to the caller.
//!
//! [`FallbackPolicy`]: crate::config::FallbackPolicy

use std::fs;
use std::path::PathBuf;

use burn::tensor::backend::Backend;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::backend::{default_device, DefaultBackend};
use crate::config::ExportConfig;
use crate::convert::{default_converter, MobileConverter};
use crate::fallback::synthesize_placeholder;
use crate::graph::interchange::export_model;
use crate::graph::mobile::{ArtifactOrigin, MobileGraph};
use crate::model::checkpoint::load_source_model;
use crate::model::cnn::RiceDiseaseCnn;
use crate::utils::error::{ExportError, Result};
use crate::utils::logging::StageLogger;
use crate::validate::{validate_artifact_on, ValidationReport};

/// Exit status for a trained artifact
pub const EXIT_BRIDGED: u8 = 0;
/// Exit status when the placeholder was written
pub const EXIT_PLACEHOLDER: u8 = 2;
/// Exit status for any error
pub const EXIT_FAILURE: u8 = 1;

/// Result of a completed pipeline run
#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub origin: ArtifactOrigin,
    pub artifact_path: PathBuf,
    pub artifact_bytes: usize,
    pub labels_path: PathBuf,
    /// Interchange file left on disk when `keep_file` is set
    pub interchange_path: Option<PathBuf>,
    /// Why the bridge was abandoned for the placeholder
    pub fallback_reason: Option<String>,
    pub validation: ValidationReport,
    pub elapsed_secs: f64,
    /// Local wall-clock time the run finished; never written into the artifact
    pub finished_at: String,
}

impl PipelineReport {
    pub fn is_placeholder(&self) -> bool {
        self.origin == ArtifactOrigin::Placeholder
    }

    /// Process exit status for this outcome
    pub fn exit_code(&self) -> u8 {
        if self.is_placeholder() {
            EXIT_PLACEHOLDER
        } else {
            EXIT_BRIDGED
        }
    }
}

/// Converts the trained checkpoint into the app's mobile artifact and labels
pub struct ModelArtifactPipeline<B: Backend = DefaultBackend> {
    config: ExportConfig,
    converter: Box<dyn MobileConverter>,
    device: B::Device,
}

impl ModelArtifactPipeline<DefaultBackend> {
    /// Pipeline on the default backend and device
    pub fn with_defaults(config: ExportConfig) -> Result<Self> {
        Self::new(config, &default_device())
    }
}

impl<B: Backend> ModelArtifactPipeline<B> {
    /// Validate `config` and set up the pipeline with the default converter
    pub fn new(config: ExportConfig, device: &B::Device) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            converter: default_converter(),
            device: device.clone(),
        })
    }

    /// Replace the interchange-to-mobile converter
    pub fn with_converter(mut self, converter: Box<dyn MobileConverter>) -> Self {
        self.converter = converter;
        self
    }

    pub fn config(&self) -> &ExportConfig {
        &self.config
    }

    /// Run the full conversion
    pub fn run(&self) -> Result<PipelineReport> {
        let mut stages = StageLogger::new(5);

        stages.begin("Loading checkpoint");
        let model = load_source_model::<B>(&self.config, &self.device)?;
        stages.end(&format!("{} classes", model.num_classes()));

        let (graph, interchange_path, fallback_reason) = match self.bridge(&model, &mut stages) {
            Ok((graph, kept)) => (graph, kept, None),
            Err(err) if self.config.fallback.allows(&err) => {
                warn!(
                    "{} ({}); writing UNTRAINED placeholder instead of the trained model",
                    err,
                    err.kind()
                );
                (synthesize_placeholder(&self.config)?, None, Some(err.to_string()))
            }
            Err(err) => return Err(err),
        };

        self.finish(graph, interchange_path, fallback_reason, &mut stages)
    }

    /// Write the untrained placeholder on purpose
    pub fn run_placeholder(&self) -> Result<PipelineReport> {
        let mut stages = StageLogger::new(3);

        stages.begin("Building placeholder model");
        let graph = synthesize_placeholder(&self.config)?;
        stages.end(&format!("{} operators", graph.operators.len()));

        self.finish(graph, None, Some("placeholder requested".to_string()), &mut stages)
    }

    /// Write only the label file
    pub fn write_labels(&self) -> Result<PathBuf> {
        let path = self.config.paths.labels_path();
        self.config.labels.write(&path)?;
        Ok(path)
    }

    /// Export, store and convert the interchange graph
    fn bridge(
        &self,
        model: &RiceDiseaseCnn<B>,
        stages: &mut StageLogger,
    ) -> Result<(MobileGraph, Option<PathBuf>)> {
        stages.begin("Exporting interchange graph");
        let interchange = export_model(model, &self.config, &self.device)?;
        let path = self.config.paths.interchange.clone();
        let size = interchange.write(&path)?;
        stages.end(&format!("{} nodes, {} bytes", interchange.nodes.len(), size));

        stages.begin(&format!("Converting with {}", self.converter.name()));
        let converted = self.converter.convert(&path, &self.config);

        let kept = if self.config.interchange.keep_file {
            info!("Keeping interchange graph at {:?}", path);
            Some(path)
        } else {
            match fs::remove_file(&path) {
                Ok(()) => debug!("Removed interchange graph {:?}", path),
                Err(e) => warn!("Could not remove interchange graph {:?}: {}", path, e),
            }
            None
        };

        let graph = converted?;
        let summary = graph.summary();
        stages.end(&format!(
            "{} operators, {} parameters, {}",
            summary.operators, summary.parameters, summary.precision
        ));
        Ok((graph, kept))
    }

    fn finish(
        &self,
        graph: MobileGraph,
        interchange_path: Option<PathBuf>,
        fallback_reason: Option<String>,
        stages: &mut StageLogger,
    ) -> Result<PipelineReport> {
        let paths = &self.config.paths;
        let artifact_path = paths.artifact_path();
        let labels_path = paths.labels_path();

        stages.begin("Writing artifact and labels");
        let artifact_bytes = graph.write(&artifact_path)?;
        self.config.labels.write(&labels_path)?;
        stages.end(&format!("{} labels", self.config.labels.len()));

        stages.begin("Validating artifact");
        let validation = validate_artifact_on::<B>(&artifact_path, &self.config, &self.device)?;
        if validation.origin != graph.origin {
            return Err(ExportError::ArtifactValidationFailure(format!(
                "artifact on disk reports origin {}, expected {}",
                validation.origin, graph.origin
            )));
        }
        stages.end("smoke test passed");

        if graph.is_placeholder() {
            warn!("Artifact at {:?} is an UNTRAINED placeholder", artifact_path);
        }

        Ok(PipelineReport {
            origin: graph.origin,
            artifact_path,
            artifact_bytes,
            labels_path,
            interchange_path,
            fallback_reason,
            validation,
            elapsed_secs: stages.total_elapsed_secs(),
            finished_at: chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FallbackPolicy, WeightPrecision};
    use crate::convert::UnavailableConverter;
    use crate::labels::LabelSet;
    use crate::model::checkpoint::{save_checkpoint, CheckpointMetadata};
    use crate::model::cnn::RiceDiseaseCnnConfig;
    use crate::runtime::Interpreter;
    use burn::tensor::{Tensor, TensorData};
    use burn_ndarray::NdArray;
    use std::path::Path;
    use tempfile::TempDir;

    type TestBackend = NdArray;

    /// Converter that always fails structurally
    struct BrokenConverter;

    impl MobileConverter for BrokenConverter {
        fn name(&self) -> &str {
            "broken"
        }

        fn convert(&self, _interchange: &Path, _config: &ExportConfig) -> Result<MobileGraph> {
            Err(ExportError::ConversionError("unsupported operator".to_string()))
        }
    }

    fn small_config(dir: &Path) -> ExportConfig {
        let mut config = ExportConfig::default();
        config.input.image_size = 16;
        config.architecture.num_blocks = 2;
        config.architecture.base_filters = 4;
        config.architecture.hidden_units = 8;
        config.paths.checkpoint = dir.join("ckpt").join("rice_disease_model_final");
        config.paths.assets_dir = dir.join("app").join("assets");
        config.paths.interchange = dir.join("rice_disease_model.ixg");
        config
    }

    fn write_checkpoint(config: &ExportConfig) -> RiceDiseaseCnn<TestBackend> {
        let device = Default::default();
        let model = RiceDiseaseCnn::<TestBackend>::new(&RiceDiseaseCnnConfig::from_export(config), &device);
        save_checkpoint(model, &config.paths, Some(&CheckpointMetadata::for_config(config))).unwrap();
        load_source_model::<TestBackend>(config, &device).unwrap()
    }

    fn pipeline(config: ExportConfig) -> ModelArtifactPipeline<TestBackend> {
        ModelArtifactPipeline::new(config, &Default::default()).unwrap()
    }

    /// Run a batch of two images through a written artifact
    fn batched_output_shape(artifact: &Path) -> Vec<usize> {
        let mut interpreter = Interpreter::<TestBackend>::from_file(artifact, &Default::default()).unwrap();
        interpreter.allocate_tensors().unwrap();
        interpreter
            .set_input(0, vec![0.5; 2 * 16 * 16 * 3], &[2, 16, 16, 3])
            .unwrap();
        interpreter.invoke().unwrap();
        interpreter.output(0).unwrap().shape
    }

    fn label_lines(path: &Path) -> Vec<String> {
        fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[cfg(feature = "bridge")]
    #[test]
    fn test_bridged_run_meets_io_contract() {
        let temp_dir = TempDir::new().unwrap();
        let config = small_config(temp_dir.path());
        write_checkpoint(&config);

        let report = pipeline(config.clone()).run().unwrap();

        assert!(!report.is_placeholder());
        assert_eq!(report.exit_code(), EXIT_BRIDGED);
        assert_eq!(report.validation.input_shape, vec![1, 16, 16, 3]);
        assert_eq!(report.validation.input_signature, vec![-1, 16, 16, 3]);
        assert_eq!(report.validation.output_shape, vec![1, 4]);
        assert_eq!(report.validation.output_signature, vec![-1, 4]);
        assert_eq!(batched_output_shape(&report.artifact_path), vec![2, 4]);
        assert_eq!(label_lines(&report.labels_path), ["Bacterialblight", "Blast", "Brownspot", "Tungro"]);

        // The interchange file is temporary
        assert!(report.interchange_path.is_none());
        assert!(!config.paths.interchange.exists());
    }

    #[cfg(feature = "bridge")]
    #[test]
    fn test_runs_are_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let config = small_config(temp_dir.path());
        write_checkpoint(&config);
        let pipeline = pipeline(config.clone());

        let first = pipeline.run().unwrap();
        let first_bytes = fs::read(&first.artifact_path).unwrap();
        let first_labels = fs::read(&first.labels_path).unwrap();

        let second = pipeline.run().unwrap();
        assert_eq!(fs::read(&second.artifact_path).unwrap(), first_bytes);
        assert_eq!(fs::read(&second.labels_path).unwrap(), first_labels);
    }

    #[cfg(feature = "bridge")]
    #[test]
    fn test_bridged_artifact_matches_source_model() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = small_config(temp_dir.path());
        config.optimization.weight_precision = WeightPrecision::Float32;
        config.optimization.default_quantization = false;
        let model = write_checkpoint(&config);
        let report = pipeline(config.clone()).run().unwrap();

        let device = Default::default();
        let nhwc: Vec<f32> = (0..16 * 16 * 3).map(|i| ((i % 17) as f32) / 17.0).collect();
        let nchw = Tensor::<TestBackend, 4>::from_data(TensorData::new(nhwc.clone(), [1, 16, 16, 3]), &device)
            .permute([0, 3, 1, 2]);
        let expected = model
            .forward_softmax(nchw)
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .unwrap();

        let mut interpreter = Interpreter::<TestBackend>::from_file(&report.artifact_path, &device).unwrap();
        interpreter.allocate_tensors().unwrap();
        interpreter.set_input(0, nhwc, &[1, 16, 16, 3]).unwrap();
        interpreter.invoke().unwrap();
        let actual = interpreter.output(0).unwrap().data;

        for (a, e) in actual.iter().zip(&expected) {
            assert!((a - e).abs() < 1e-4, "artifact {} vs source {}", a, e);
        }
    }

    #[test]
    fn test_missing_checkpoint_writes_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let config = small_config(temp_dir.path());

        let err = pipeline(config.clone()).run().unwrap_err();
        assert!(matches!(err, ExportError::CheckpointNotFound(_)));
        assert!(!config.paths.artifact_path().exists());
    }

    #[test]
    fn test_unavailable_bridge_falls_back_to_placeholder() {
        let temp_dir = TempDir::new().unwrap();
        let config = small_config(temp_dir.path());
        write_checkpoint(&config);

        let report = pipeline(config.clone())
            .with_converter(Box::new(UnavailableConverter::new("converter not installed")))
            .run()
            .unwrap();

        assert!(report.is_placeholder());
        assert_eq!(report.exit_code(), EXIT_PLACEHOLDER);
        assert!(report.fallback_reason.unwrap().contains("converter not installed"));
        assert_eq!(report.validation.output_shape, vec![1, 4]);
        assert_eq!(report.validation.output_signature, vec![-1, 4]);
        assert_eq!(batched_output_shape(&report.artifact_path), vec![2, 4]);
        assert_eq!(label_lines(&report.labels_path), ["Bacterialblight", "Blast", "Brownspot", "Tungro"]);
        assert!(MobileGraph::read(&report.artifact_path).unwrap().is_placeholder());
        assert!(!config.paths.interchange.exists());
    }

    #[test]
    fn test_conversion_error_follows_fallback_policy() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = small_config(temp_dir.path());
        write_checkpoint(&config);

        let err = pipeline(config.clone())
            .with_converter(Box::new(BrokenConverter))
            .run()
            .unwrap_err();
        assert!(matches!(err, ExportError::ConversionError(_)));
        assert!(!config.paths.artifact_path().exists());

        config.fallback = FallbackPolicy::AnyBridgeFailure;
        let report = pipeline(config)
            .with_converter(Box::new(BrokenConverter))
            .run()
            .unwrap();
        assert!(report.is_placeholder());
    }

    #[test]
    fn test_keep_interchange_file() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = small_config(temp_dir.path());
        config.interchange.keep_file = true;
        config.fallback = FallbackPolicy::AnyBridgeFailure;
        write_checkpoint(&config);

        // The kept path is only reported for a bridged artifact
        let report = pipeline(config.clone())
            .with_converter(Box::new(BrokenConverter))
            .run()
            .unwrap();
        assert!(report.interchange_path.is_none());
        assert!(config.paths.interchange.is_file());
    }

    #[test]
    fn test_placeholder_run_with_custom_labels() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = small_config(temp_dir.path());
        config.labels = LabelSet::new(["Healthy", "Blast", "Tungro"]).unwrap();

        let report = pipeline(config.clone()).run_placeholder().unwrap();
        assert_eq!(report.validation.output_shape, vec![1, 3]);
        assert_eq!(label_lines(&report.labels_path), ["Healthy", "Blast", "Tungro"]);
        assert_eq!(report.validation.summary.precision, "float16");

        config.optimization.weight_precision = WeightPrecision::Float32;
        let report = pipeline(config).run_placeholder().unwrap();
        assert_eq!(report.validation.summary.precision, "int8 weights / float32");
    }

    #[test]
    fn test_invalid_config_is_rejected_up_front() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = small_config(temp_dir.path());
        config.architecture.num_blocks = 0;

        let result = ModelArtifactPipeline::<TestBackend>::new(config.clone(), &Default::default());
        assert!(matches!(result, Err(ExportError::Config(_))));

        config.architecture.num_blocks = 64;
        let result = load_source_model::<TestBackend>(&config, &Default::default());
        assert!(matches!(result, Err(ExportError::Config(_))));
    }
}

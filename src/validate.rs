//! Artifact smoke test
//!
//! Reloads a written artifact, checks its declared I/O contract and runs one
//! forward pass on random input. Passing proves the artifact loads and runs;
//! it says nothing about prediction quality.

use std::fs;
use std::path::{Path, PathBuf};

use burn::tensor::backend::Backend;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use tracing::{debug, info};

use crate::backend::{default_device, DefaultBackend};
use crate::config::ExportConfig;
use crate::graph::mobile::{ArtifactOrigin, GraphSummary};
use crate::runtime::{Interpreter, OutputTensor};
use crate::utils::error::{ExportError, Result};

/// Outcome of a successful smoke test
#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub artifact: PathBuf,
    pub origin: ArtifactOrigin,
    pub size_bytes: usize,
    pub input_shape: Vec<usize>,
    pub input_signature: Vec<i64>,
    pub output_shape: Vec<usize>,
    pub output_signature: Vec<i64>,
    /// Output row for the random input
    pub sample_output: Vec<f32>,
    pub summary: GraphSummary,
}

impl ValidationReport {
    /// Index and value of the largest entry in the sample row
    pub fn top_class(&self) -> Option<(usize, f32)> {
        self.sample_output
            .iter()
            .copied()
            .enumerate()
            .fold(None, |best, (i, v)| match best {
                Some((_, b)) if b >= v => best,
                _ => Some((i, v)),
            })
    }
}

/// Smoke-test the artifact at `path` on the default backend
pub fn validate_artifact(path: &Path, config: &ExportConfig) -> Result<ValidationReport> {
    validate_artifact_on::<DefaultBackend>(path, config, &default_device())
}

/// Smoke-test the artifact at `path` on backend `B`
///
/// Every failure, including an unreadable file, is reported as
/// [`ExportError::ArtifactValidationFailure`].
pub fn validate_artifact_on<B: Backend>(
    path: &Path,
    config: &ExportConfig,
    device: &B::Device,
) -> Result<ValidationReport> {
    run_smoke_test::<B>(path, config, device).map_err(|e| match e {
        ExportError::ArtifactValidationFailure(_) => e,
        other => ExportError::ArtifactValidationFailure(format!("{:?}: {}", path, other)),
    })
}

/// Batch size of the second pass that exercises the dynamic batch dimension
const DYNAMIC_BATCH: usize = 2;

fn run_smoke_test<B: Backend>(
    path: &Path,
    config: &ExportConfig,
    device: &B::Device,
) -> Result<ValidationReport> {
    info!("Validating artifact {:?}", path);
    let size_bytes = fs::metadata(path)?.len() as usize;
    let mut interpreter = Interpreter::<B>::from_file(path, device)?;
    interpreter.allocate_tensors()?;
    let summary = interpreter.graph().summary();

    let input = single(interpreter.input_details(), "input")?;
    let output = single(interpreter.output_details(), "output")?;

    let expected_input = config.mobile_input_shape();
    let expected_input_signature = dynamic_batch(&expected_input);
    if input.shape != expected_input || input.shape_signature != expected_input_signature {
        return Err(ExportError::ArtifactValidationFailure(format!(
            "input '{}' is {:?} (signature {:?}), expected {:?} (signature {:?})",
            input.name, input.shape, input.shape_signature, expected_input, expected_input_signature
        )));
    }
    let expected_output = config.mobile_output_shape();
    let expected_output_signature = dynamic_batch(&expected_output);
    if output.shape != expected_output || output.shape_signature != expected_output_signature {
        return Err(ExportError::ArtifactValidationFailure(format!(
            "output '{}' is {:?} (signature {:?}), expected {:?} (signature {:?})",
            output.name, output.shape, output.shape_signature, expected_output, expected_output_signature
        )));
    }
    debug!("Input {:?}, output {:?}", input.shape_signature, output.shape_signature);

    let mut rng = ChaCha8Rng::seed_from_u64(config.validation_seed);
    let result = run_batch(&mut interpreter, &mut rng, &input.shape)?;
    if result.shape != output.shape {
        return Err(ExportError::ArtifactValidationFailure(format!(
            "invoke produced {:?}, declared {:?}",
            result.shape, output.shape
        )));
    }

    let mut batched_input = input.shape.clone();
    batched_input[0] = DYNAMIC_BATCH;
    let batched = run_batch(&mut interpreter, &mut rng, &batched_input)?;
    let mut batched_output = output.shape.clone();
    batched_output[0] = DYNAMIC_BATCH;
    if batched.shape != batched_output {
        return Err(ExportError::ArtifactValidationFailure(format!(
            "batch of {} produced {:?}, expected {:?}",
            DYNAMIC_BATCH, batched.shape, batched_output
        )));
    }

    info!("Smoke test passed: output {:?} = {:?}", result.shape, result.data);
    Ok(ValidationReport {
        artifact: path.to_path_buf(),
        origin: summary.origin.clone(),
        size_bytes,
        input_shape: input.shape,
        input_signature: input.shape_signature,
        output_shape: result.shape,
        output_signature: output.shape_signature,
        sample_output: result.data,
        summary,
    })
}

/// `shape` with its batch dimension marked dynamic
fn dynamic_batch(shape: &[usize]) -> Vec<i64> {
    shape
        .iter()
        .enumerate()
        .map(|(axis, &d)| if axis == 0 { -1 } else { d as i64 })
        .collect()
}

/// One invoke on uniform random input of `shape`; output must be finite
fn run_batch<B: Backend>(
    interpreter: &mut Interpreter<B>,
    rng: &mut ChaCha8Rng,
    shape: &[usize],
) -> Result<OutputTensor> {
    let count: usize = shape.iter().product();
    let sample: Vec<f32> = (0..count).map(|_| rng.gen::<f32>()).collect();

    interpreter.set_input(0, sample, shape)?;
    interpreter.invoke()?;
    let result = interpreter.output(0)?;

    if let Some(bad) = result.data.iter().find(|v| !v.is_finite()) {
        return Err(ExportError::ArtifactValidationFailure(format!(
            "output for {:?} contains non-finite value {}",
            shape, bad
        )));
    }
    Ok(result)
}

fn single<T>(mut items: Vec<T>, what: &str) -> Result<T> {
    match items.len() {
        1 => Ok(items.remove(0)),
        n => Err(ExportError::ArtifactValidationFailure(format!(
            "expected one {}, found {}",
            what, n
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fallback::synthesize_placeholder;
    use burn_ndarray::NdArray;
    use tempfile::TempDir;

    type TestBackend = NdArray;

    fn small_config() -> ExportConfig {
        let mut config = ExportConfig::default();
        config.input.image_size = 16;
        config.architecture.num_blocks = 2;
        config
    }

    #[test]
    fn test_placeholder_passes_smoke_test() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("model.mgph");
        let config = small_config();
        synthesize_placeholder(&config).unwrap().write(&path).unwrap();

        let report = validate_artifact_on::<TestBackend>(&path, &config, &Default::default()).unwrap();
        assert_eq!(report.origin, ArtifactOrigin::Placeholder);
        assert_eq!(report.input_signature, vec![-1, 16, 16, 3]);
        assert_eq!(report.output_shape, vec![1, 4]);
        assert_eq!(report.output_signature, vec![-1, 4]);
        assert_eq!(report.size_bytes as u64, fs::metadata(&path).unwrap().len());

        // Softmax output
        let total: f32 = report.sample_output.iter().sum();
        assert!((total - 1.0).abs() < 1e-4);
        assert!(report.top_class().is_some());
    }

    #[test]
    fn test_missing_artifact_is_a_validation_failure() {
        let temp_dir = TempDir::new().unwrap();
        let err = validate_artifact_on::<TestBackend>(
            &temp_dir.path().join("absent.mgph"),
            &small_config(),
            &Default::default(),
        )
        .unwrap_err();
        assert!(matches!(err, ExportError::ArtifactValidationFailure(_)));
    }

    #[test]
    fn test_corrupt_artifact_is_a_validation_failure() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("model.mgph");
        fs::write(&path, b"MGPH garbage").unwrap();

        let err = validate_artifact_on::<TestBackend>(&path, &small_config(), &Default::default()).unwrap_err();
        assert!(matches!(err, ExportError::ArtifactValidationFailure(_)));
    }

    #[test]
    fn test_shape_contract_is_checked() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("model.mgph");
        let config = small_config();
        synthesize_placeholder(&config).unwrap().write(&path).unwrap();

        let mut other = config.clone();
        other.input.image_size = 32;
        let err = validate_artifact_on::<TestBackend>(&path, &other, &Default::default()).unwrap_err();
        assert!(err.to_string().contains("expected"));
    }

    #[test]
    fn test_reshaped_filter_is_a_validation_failure() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("model.mgph");
        let config = small_config();
        let mut graph = synthesize_placeholder(&config).unwrap();
        let kernel = graph.tensors.iter().position(|t| t.name == "conv1/kernel").unwrap();
        // Same element count as [32, 3, 3, 3], wrong input channels
        graph.tensors[kernel].shape = vec![32, 3, 1, 9];
        graph.write(&path).unwrap();

        let err = validate_artifact_on::<TestBackend>(&path, &config, &Default::default()).unwrap_err();
        assert!(matches!(err, ExportError::ArtifactValidationFailure(_)));
    }

    #[test]
    fn test_fixed_batch_output_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("model.mgph");
        let config = small_config();
        let mut graph = synthesize_placeholder(&config).unwrap();
        let output = graph.outputs[0];
        graph.tensors[output].shape_signature = vec![1, 4];
        graph.write(&path).unwrap();

        let err = validate_artifact_on::<TestBackend>(&path, &config, &Default::default()).unwrap_err();
        assert!(err.to_string().contains("signature"));
    }
}

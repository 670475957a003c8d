//! Checkpoint loading
//!
//! A checkpoint is the burn record of a trained [`RiceDiseaseCnn`] written with
//! the compact recorder, optionally accompanied by a JSON sidecar naming the
//! architecture it was trained with.

use std::fs;
use std::path::Path;

use burn::{module::Module, record::CompactRecorder, record::RecorderError, tensor::backend::Backend};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::{ExportConfig, PathConfig};
use crate::model::cnn::{RiceDiseaseCnn, RiceDiseaseCnnConfig};
use crate::utils::error::{ExportError, Result};

/// Metadata stored next to a checkpoint record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub model_architecture: String,
    pub num_classes: usize,
    pub num_blocks: usize,
    pub base_filters: usize,
}

impl CheckpointMetadata {
    /// Metadata describing the architecture declared in `config`
    pub fn for_config(config: &ExportConfig) -> Self {
        Self {
            model_architecture: config.architecture.name.clone(),
            num_classes: config.num_classes(),
            num_blocks: config.architecture.num_blocks,
            base_filters: config.architecture.base_filters,
        }
    }

    /// Save metadata to a JSON file
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Load metadata from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Check the sidecar against the declared architecture
    pub fn check_against(&self, config: &ExportConfig) -> Result<()> {
        let declared = Self::for_config(config);

        if self.model_architecture != declared.model_architecture {
            return Err(ExportError::ArchitectureMismatch(format!(
                "checkpoint was trained as '{}', expected '{}'",
                self.model_architecture, declared.model_architecture
            )));
        }
        if self.num_classes != declared.num_classes {
            return Err(ExportError::ArchitectureMismatch(format!(
                "checkpoint has {} classes, label set has {}",
                self.num_classes, declared.num_classes
            )));
        }
        if self.num_blocks != declared.num_blocks || self.base_filters != declared.base_filters {
            return Err(ExportError::ArchitectureMismatch(format!(
                "checkpoint uses {} blocks of base width {}, expected {} blocks of base width {}",
                self.num_blocks, self.base_filters, declared.num_blocks, declared.base_filters
            )));
        }

        Ok(())
    }
}

/// Load the trained source model named by `config`
///
/// The returned module lives on a non-autodiff backend and is therefore in
/// evaluation mode.
pub fn load_source_model<B: Backend>(
    config: &ExportConfig,
    device: &B::Device,
) -> Result<RiceDiseaseCnn<B>> {
    config.validate()?;
    let paths = &config.paths;
    let record_path = paths.checkpoint_record_path();

    info!("Loading checkpoint from: {:?}", record_path);
    if !record_path.is_file() {
        return Err(ExportError::CheckpointNotFound(record_path));
    }

    let metadata_path = paths.checkpoint_metadata_path();
    if metadata_path.is_file() {
        let metadata = CheckpointMetadata::load(&metadata_path)?;
        metadata.check_against(config)?;
        debug!("Checkpoint metadata matches '{}'", metadata.model_architecture);
    } else {
        debug!("No checkpoint metadata at {:?}, relying on parameter shapes", metadata_path);
    }

    let model_config = RiceDiseaseCnnConfig::from_export(config);
    let recorder = CompactRecorder::new();
    let model = RiceDiseaseCnn::<B>::new(&model_config, device)
        .load_file(paths.checkpoint_stem(), &recorder, device)
        .map_err(|e| match e {
            RecorderError::FileNotFound(_) => ExportError::CheckpointNotFound(record_path.clone()),
            other => ExportError::ArchitectureMismatch(format!(
                "record does not decode as '{}': {:?}",
                config.architecture.name, other
            )),
        })?;

    check_param_shapes(&model, &model_config)?;

    info!("Source model loaded successfully!");
    Ok(model)
}

/// Compare every parameter shape with what the declared architecture expects
pub fn check_param_shapes<B: Backend>(
    model: &RiceDiseaseCnn<B>,
    config: &RiceDiseaseCnnConfig,
) -> Result<()> {
    let expected = config.expected_param_shapes();
    let actual = model.param_shapes();

    if expected.len() != actual.len() {
        return Err(ExportError::ArchitectureMismatch(format!(
            "expected {} parameter tensors, checkpoint has {}",
            expected.len(),
            actual.len()
        )));
    }

    for ((name, want), (_, got)) in expected.iter().zip(actual.iter()) {
        if want != got {
            return Err(ExportError::ArchitectureMismatch(format!(
                "{}: expected shape {:?}, checkpoint has {:?}",
                name, want, got
            )));
        }
    }

    Ok(())
}

/// Write `model` as a checkpoint at the configured location
pub fn save_checkpoint<B: Backend>(
    model: RiceDiseaseCnn<B>,
    paths: &PathConfig,
    metadata: Option<&CheckpointMetadata>,
) -> Result<()> {
    let stem = paths.checkpoint_stem();
    if let Some(parent) = stem.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    model
        .save_file(stem, &CompactRecorder::new())
        .map_err(|e| ExportError::Serialization(format!("Failed to save checkpoint: {:?}", e)))?;

    if let Some(metadata) = metadata {
        metadata.save(&paths.checkpoint_metadata_path())?;
    }

    info!("Checkpoint saved to {:?}", paths.checkpoint_record_path());
    Ok(())
}

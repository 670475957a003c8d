//! Source model
//!
//! - `cnn`: the rice-disease CNN the checkpoint was trained with
//! - `checkpoint`: loading (and, for fixtures, saving) burn checkpoints

pub mod checkpoint;
pub mod cnn;

pub use checkpoint::{load_source_model, CheckpointMetadata};
pub use cnn::{RiceDiseaseCnn, RiceDiseaseCnnConfig};

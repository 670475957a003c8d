//! # Rice Disease Model Export
//!
//! Converts the trained rice-disease CNN into the mobile graph artifact and
//! label file bundled with the Android app, using the Burn framework.
//!
//! ## Pipeline
//!
//! 1. Load the burn checkpoint into the declared architecture
//! 2. Export an interchange graph with a dynamic batch dimension
//! 3. Lower it to a mobile graph and apply the optimization policy
//! 4. Write the artifact and `labels.txt` to the app's assets
//! 5. Smoke-test the written artifact
//!
//! If the interchange-to-mobile converter is unavailable (the `bridge`
//! feature is off), an untrained placeholder with the same input/output
//! contract is written instead and the run is reported as such. Which other
//! failures may do the same is set by [`config::FallbackPolicy`].
//!
//! ## Modules
//!
//! - `config`: export configuration and policies
//! - `model`: source CNN and checkpoint loading
//! - `graph`: interchange and mobile graph formats
//! - `convert`: lowering and optimization
//! - `fallback`: untrained placeholder model
//! - `runtime`: minimal mobile-graph interpreter
//! - `validate`: artifact smoke test
//! - `pipeline`: the end-to-end run
//! - `utils`: logging, errors, and formatting helpers
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use rice_model_export::{ExportConfig, ModelArtifactPipeline};
//!
//! let pipeline = ModelArtifactPipeline::with_defaults(ExportConfig::default())?;
//! let report = pipeline.run()?;
//! println!("{} written ({})", report.artifact_path.display(), report.origin);
//! ```

pub mod backend;
pub mod config;
pub mod convert;
pub mod fallback;
pub mod graph;
pub mod labels;
pub mod model;
pub mod pipeline;
pub mod runtime;
pub mod utils;
pub mod validate;

// Re-export commonly used items for convenience
pub use config::{ExportConfig, FallbackPolicy, OptimizationPolicy, SupportedOps, WeightPrecision};
pub use convert::{InterchangeConverter, MobileConverter, UnavailableConverter};
pub use graph::{ArtifactOrigin, InterchangeGraph, MobileGraph};
pub use labels::LabelSet;
pub use pipeline::{ModelArtifactPipeline, PipelineReport};
pub use utils::error::{ExportError, Result};
pub use validate::{validate_artifact, ValidationReport};

/// Version of the library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Whether the interchange-to-mobile converter is compiled in
pub const BRIDGE_ENABLED: bool = cfg!(feature = "bridge");

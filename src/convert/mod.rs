//! Interchange-to-mobile conversion
//!
//! The pipeline only talks to a [`MobileConverter`]. The real converter
//! lowers the interchange graph and applies the optimization policy; it is
//! compiled in with the `bridge` feature. Without it, or with
//! [`UnavailableConverter`] injected, conversion reports
//! [`ExportError::BridgeUnavailable`] and the pipeline decides whether the
//! placeholder may stand in.

#[cfg(feature = "bridge")]
pub mod lowering;
pub mod optimize;

use std::fs;
use std::path::Path;

use tracing::info;

use crate::config::ExportConfig;
use crate::graph::interchange::InterchangeGraph;
use crate::graph::mobile::MobileGraph;
use crate::utils::error::{ExportError, Result};

pub use optimize::apply_policy;

/// Converts a stored interchange graph into an optimized mobile graph
pub trait MobileConverter {
    /// Human-readable converter name for logs
    fn name(&self) -> &str;

    /// Convert the interchange file at `interchange`
    fn convert(&self, interchange: &Path, config: &ExportConfig) -> Result<MobileGraph>;
}

/// Converter backed by the in-crate lowering pass
#[derive(Debug, Clone, Copy, Default)]
pub struct InterchangeConverter;

impl InterchangeConverter {
    pub fn new() -> Self {
        Self
    }
}

impl MobileConverter for InterchangeConverter {
    fn name(&self) -> &str {
        "interchange-lowering"
    }

    #[cfg(feature = "bridge")]
    fn convert(&self, interchange: &Path, config: &ExportConfig) -> Result<MobileGraph> {
        let bytes = fs::read(interchange)?;
        let graph = InterchangeGraph::from_bytes(&bytes)
            .map_err(|e| ExportError::ConversionError(format!("unreadable interchange graph: {}", e)))?;

        info!(
            "Converting {} interchange nodes (opset {})",
            graph.nodes.len(),
            graph.opset_version
        );
        let mut mobile = lowering::lower(&graph, config)?;
        apply_policy(&mut mobile, &config.optimization)?;
        Ok(mobile)
    }

    #[cfg(not(feature = "bridge"))]
    fn convert(&self, interchange: &Path, _config: &ExportConfig) -> Result<MobileGraph> {
        info!("Skipping conversion of {:?}", interchange);
        // The interchange file is still checked so a corrupt export is not hidden
        InterchangeGraph::from_bytes(&fs::read(interchange)?)?;
        Err(ExportError::BridgeUnavailable(
            "built without the `bridge` feature".to_string(),
        ))
    }
}

/// Converter standing in for a missing toolchain
#[derive(Debug, Clone)]
pub struct UnavailableConverter {
    reason: String,
}

impl UnavailableConverter {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl MobileConverter for UnavailableConverter {
    fn name(&self) -> &str {
        "unavailable"
    }

    fn convert(&self, _interchange: &Path, _config: &ExportConfig) -> Result<MobileGraph> {
        Err(ExportError::BridgeUnavailable(self.reason.clone()))
    }
}

/// Converter the CLI uses
pub fn default_converter() -> Box<dyn MobileConverter> {
    Box::new(InterchangeConverter::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FallbackPolicy;
    use tempfile::TempDir;

    #[test]
    fn test_unavailable_converter_is_fallback_eligible() {
        let temp_dir = TempDir::new().unwrap();
        let err = UnavailableConverter::new("no toolchain")
            .convert(&temp_dir.path().join("model.ixg"), &ExportConfig::default())
            .unwrap_err();

        assert!(matches!(err, ExportError::BridgeUnavailable(ref reason) if reason == "no toolchain"));
        assert!(FallbackPolicy::BridgeUnavailable.allows(&err));
    }

    #[cfg(feature = "bridge")]
    #[test]
    fn test_corrupt_interchange_is_a_conversion_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("model.ixg");
        fs::write(&path, b"not a graph").unwrap();

        let err = InterchangeConverter::new()
            .convert(&path, &ExportConfig::default())
            .unwrap_err();
        assert!(matches!(err, ExportError::ConversionError(_)));
    }
}

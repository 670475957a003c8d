//! Label file handling
//!
//! The label file is bundled next to the artifact in the app's assets. Line
//! `i` names output index `i` of the model, so the order here is load-bearing.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::utils::error::{ExportError, Result};

/// Rice disease classes in output-tensor index order
pub const CLASS_NAMES: [&str; 4] = ["Bacterialblight", "Blast", "Brownspot", "Tungro"];

/// Ordered class names matching the model's output indices
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct LabelSet {
    names: Vec<String>,
}

impl LabelSet {
    /// Build a label set, rejecting names that cannot round-trip through a
    /// newline-delimited ASCII file
    pub fn new<S: Into<String>>(names: impl IntoIterator<Item = S>) -> Result<Self> {
        let names: Vec<String> = names.into_iter().map(Into::into).collect();

        if names.is_empty() {
            return Err(ExportError::Config("label set must not be empty".to_string()));
        }

        for (idx, name) in names.iter().enumerate() {
            if name.trim().is_empty() {
                return Err(ExportError::Config(format!("label {} is blank", idx)));
            }
            if name.trim() != name {
                return Err(ExportError::Config(format!(
                    "label {:?} has surrounding whitespace",
                    name
                )));
            }
            if !name.is_ascii() || name.chars().any(|c| c.is_ascii_control()) {
                return Err(ExportError::Config(format!(
                    "label {:?} must be printable ASCII",
                    name
                )));
            }
            if names[..idx].contains(name) {
                return Err(ExportError::Config(format!("duplicate label {:?}", name)));
            }
        }

        Ok(Self { names })
    }

    /// The four rice disease classes
    pub fn rice_diseases() -> Self {
        Self {
            names: CLASS_NAMES.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.names.get(index).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }

    /// One name per line, each line newline-terminated
    pub fn to_text(&self) -> String {
        let mut text = String::new();
        for name in &self.names {
            text.push_str(name);
            text.push('\n');
        }
        text
    }

    /// Write the label file, replacing any previous one
    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        fs::write(path, self.to_text())?;
        info!("Labels file saved to: {:?}", path);
        Ok(())
    }

    /// Read a label file written by [`LabelSet::write`]
    pub fn read(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::new(text.lines().filter(|line| !line.is_empty()))
    }
}

impl Default for LabelSet {
    fn default() -> Self {
        Self::rice_diseases()
    }
}

impl TryFrom<Vec<String>> for LabelSet {
    type Error = ExportError;

    fn try_from(names: Vec<String>) -> Result<Self> {
        Self::new(names)
    }
}

impl From<LabelSet> for Vec<String> {
    fn from(labels: LabelSet) -> Self {
        labels.names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_rice_disease_order() {
        let labels = LabelSet::rice_diseases();
        assert_eq!(labels.len(), 4);
        assert_eq!(labels.get(0), Some("Bacterialblight"));
        assert_eq!(labels.get(3), Some("Tungro"));
        assert_eq!(
            labels.to_text(),
            "Bacterialblight\nBlast\nBrownspot\nTungro\n"
        );
    }

    #[test]
    fn test_write_then_read_preserves_order() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("assets").join("labels.txt");

        let labels = LabelSet::rice_diseases();
        labels.write(&path).unwrap();
        // Second write overwrites instead of appending
        labels.write(&path).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 4);
        assert_eq!(LabelSet::read(&path).unwrap(), labels);
    }

    #[test]
    fn test_rejects_bad_names() {
        assert!(LabelSet::new(Vec::<String>::new()).is_err());
        assert!(LabelSet::new(["Blast", "Blast"]).is_err());
        assert!(LabelSet::new(["Blast", "Brown\nspot"]).is_err());
        assert!(LabelSet::new(["Blast", " Tungro"]).is_err());
        assert!(LabelSet::new(["Blast", "Tungro"]).is_ok());
    }
}

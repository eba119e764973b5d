// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Classification labels for model outputs.

use crate::{ConfigError, ModelConfig};
use std::collections::HashMap;
use std::path::Path;

/// Maps output names to their classification labels.
///
/// Labels come from the per-output files named in the configuration, one
/// label per line. Outputs without a label file simply resolve to `None`.
#[derive(Debug, Default)]
pub struct LabelProvider {
    labels: HashMap<String, Vec<String>>,
}

impl LabelProvider {
    /// Creates an empty provider.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads every label file named by `config`'s outputs, resolving
    /// relative filenames against `repository_path`.
    pub fn from_config(config: &ModelConfig, repository_path: &Path) -> Result<Self, ConfigError> {
        let mut provider = Self::new();
        for output in &config.outputs {
            if let Some(filename) = &output.label_filename {
                let path = repository_path.join(filename);
                provider.load_file(&output.name, &path)?;
            }
        }
        Ok(provider)
    }

    /// Loads labels for `output_name` from `path`, one per line.
    pub fn load_file(&mut self, output_name: &str, path: &Path) -> Result<(), ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::LabelLoadError {
                path: path.display().to_string(),
                detail: e.to_string(),
            })?;
        let labels: Vec<String> = content.lines().map(str::to_string).collect();
        tracing::debug!(
            "loaded {} labels for output '{}' from '{}'",
            labels.len(),
            output_name,
            path.display(),
        );
        self.labels.insert(output_name.to_string(), labels);
        Ok(())
    }

    /// Registers labels directly, replacing any existing set.
    pub fn set_labels(&mut self, output_name: &str, labels: Vec<String>) {
        self.labels.insert(output_name.to_string(), labels);
    }

    /// Returns the label at `index` for `output_name`, if both exist.
    pub fn get_label(&self, output_name: &str, index: usize) -> Option<&str> {
        self.labels
            .get(output_name)
            .and_then(|l| l.get(index))
            .map(String::as_str)
    }

    /// Returns the number of labels registered for `output_name`.
    pub fn label_count(&self, output_name: &str) -> usize {
        self.labels.get(output_name).map_or(0, Vec::len)
    }
}

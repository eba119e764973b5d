// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Model-configuration structures and validation.

use crate::ConfigError;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tensor_core::{dims, DType};

/// The model-configuration fields the serving core consumes.
///
/// `max_batch_size == 0` means the model does not use runtime-managed
/// batching: request shapes are taken as-is, with no leading batch
/// dimension.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ModelConfig {
    /// Model name, unique within a repository.
    pub name: String,
    /// Maximum runtime-managed batch size; 0 disables batching.
    #[serde(default)]
    pub max_batch_size: u32,
    /// Declared input tensors.
    #[serde(default)]
    pub inputs: Vec<ModelInput>,
    /// Declared output tensors.
    #[serde(default)]
    pub outputs: Vec<ModelOutput>,
    /// Instance placement groups.
    #[serde(default)]
    pub instance_groups: Vec<InstanceGroup>,
    /// Warmup samples generated at instance creation.
    #[serde(default)]
    pub warmup: Vec<WarmupSetting>,
    /// Highest priority level a request may carry; 0 disables priorities.
    #[serde(default)]
    pub max_priority_level: u32,
    /// Priority stored when a request asks for level 0 or overshoots.
    #[serde(default)]
    pub default_priority_level: u32,
}

/// One declared input tensor.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ModelInput {
    /// Tensor name.
    pub name: String,
    /// Element type.
    pub data_type: DType,
    /// Declared shape, without the batch dimension. May contain wildcards.
    pub dims: Vec<i64>,
    /// Optional reshape applied after validation. Wildcard slots are
    /// filled from the request shape's wildcard positions, in order.
    #[serde(default)]
    pub reshape: Option<Vec<i64>>,
    /// Shape tensors carry dimension values as payload and are never
    /// batch-stripped.
    #[serde(default)]
    pub is_shape_tensor: bool,
}

/// One declared output tensor.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ModelOutput {
    /// Tensor name.
    pub name: String,
    /// Element type.
    pub data_type: DType,
    /// Declared shape, without the batch dimension.
    pub dims: Vec<i64>,
    /// Optional file of classification labels, one per line, resolved
    /// against the model repository.
    #[serde(default)]
    pub label_filename: Option<String>,
}

/// Placement of model instances on devices.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct InstanceGroup {
    /// Group name; instance names derive from it.
    pub name: String,
    /// Device kind the group binds to.
    #[serde(default)]
    pub kind: InstanceGroupKind,
    /// Instances per device.
    #[serde(default = "default_count")]
    pub count: u32,
    /// Device ids for `Gpu` groups.
    #[serde(default)]
    pub gpus: Vec<i32>,
    /// Backend-specific profile names.
    #[serde(default)]
    pub profiles: Vec<String>,
    /// Passive instances are created but never scheduled by the runtime.
    #[serde(default)]
    pub passive: bool,
}

fn default_count() -> u32 {
    1
}

/// Device kind of an instance group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceGroupKind {
    /// Host execution.
    Cpu,
    /// One instance per listed GPU.
    Gpu,
    /// Placement is decided by the backend itself.
    Model,
}

impl Default for InstanceGroupKind {
    fn default() -> Self {
        InstanceGroupKind::Cpu
    }
}

/// One warmup sample: a named batch of synthetic requests.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct WarmupSetting {
    /// Sample name, for logs.
    pub name: String,
    /// Number of requests in the sample; 0 skips the sample.
    #[serde(default)]
    pub batch_size: u32,
    /// Per-input synthesis instructions, keyed by tensor name.
    #[serde(default)]
    pub inputs: BTreeMap<String, WarmupInput>,
}

/// Synthesis instructions for one warmup input.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct WarmupInput {
    /// Element type.
    pub data_type: DType,
    /// Batch-1 shape; must be fully specified (no wildcards).
    pub dims: Vec<i64>,
    /// Where the bytes come from.
    pub source: WarmupSource,
}

/// Data source for a warmup input; exactly one applies.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarmupSource {
    /// All-zero bytes.
    ZeroData,
    /// Uniformly random bytes (zero for `STRING` inputs, read as empty
    /// strings).
    RandomData,
    /// Bytes read from a file under the repository's `warmup/` directory.
    InputDataFile(PathBuf),
}

impl ModelConfig {
    /// Loads a configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    /// Parses a configuration from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        Ok(config)
    }

    /// Validates that the configuration is internally consistent.
    ///
    /// Checks:
    /// - No duplicate input or output names.
    /// - Reshape rules carry the same number of wildcard slots as the
    ///   dims they rewrite, and matching element counts when fully
    ///   specified.
    /// - `default_priority_level <= max_priority_level`.
    /// - Warmup inputs are fully specified (warned here, enforced at
    ///   sample generation).
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = std::collections::HashSet::new();
        for input in &self.inputs {
            if !seen.insert(input.name.as_str()) {
                return Err(self.invalid(format!("duplicate input name '{}'", input.name)));
            }
            if let Some(reshape) = &input.reshape {
                let declared_wildcards =
                    input.dims.iter().filter(|&&d| d == dims::WILDCARD_DIM).count();
                let reshape_wildcards =
                    reshape.iter().filter(|&&d| d == dims::WILDCARD_DIM).count();
                if declared_wildcards != reshape_wildcards {
                    return Err(self.invalid(format!(
                        "input '{}' reshape has {} variable-size dimensions, dims have {}",
                        input.name, reshape_wildcards, declared_wildcards
                    )));
                }
                if let (Some(a), Some(b)) =
                    (dims::element_count(&input.dims), dims::element_count(reshape))
                {
                    if a != b {
                        return Err(self.invalid(format!(
                            "input '{}' reshape {} does not preserve element count of {}",
                            input.name,
                            dims::dims_to_string(reshape),
                            dims::dims_to_string(&input.dims)
                        )));
                    }
                }
            }
        }

        seen.clear();
        for output in &self.outputs {
            if !seen.insert(output.name.as_str()) {
                return Err(self.invalid(format!("duplicate output name '{}'", output.name)));
            }
        }

        if self.default_priority_level > self.max_priority_level {
            return Err(self.invalid(format!(
                "default priority level {} exceeds max priority level {}",
                self.default_priority_level, self.max_priority_level
            )));
        }

        for setting in &self.warmup {
            for (name, input) in &setting.inputs {
                if dims::element_count(&input.dims).is_none() {
                    tracing::warn!(
                        "warmup sample '{}' input '{}' has variable-size dimensions",
                        setting.name,
                        name,
                    );
                }
            }
        }

        Ok(())
    }

    /// Looks up a declared input by name.
    pub fn input(&self, name: &str) -> Option<&ModelInput> {
        self.inputs.iter().find(|i| i.name == name)
    }

    /// Looks up a declared output by name.
    pub fn output(&self, name: &str) -> Option<&ModelOutput> {
        self.outputs.iter().find(|o| o.name == name)
    }

    fn invalid(&self, detail: String) -> ConfigError {
        ConfigError::InvalidConfig {
            model: self.name.clone(),
            detail,
        }
    }
}

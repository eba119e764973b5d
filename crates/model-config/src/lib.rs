// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! # model-config
//!
//! The slice of a model's configuration that the request-lifecycle core
//! reads: declared inputs and outputs (shapes, data types, reshape rules,
//! shape-tensor flags), batching limits, priority levels, instance groups,
//! and warmup settings.
//!
//! Configurations are deserialized from JSON (`config.json` in a model
//! repository) and validated once at load:
//!
//! ```json
//! {
//!   "name": "resnet50",
//!   "max_batch_size": 8,
//!   "inputs": [
//!     { "name": "IN0", "data_type": "FP32", "dims": [3, 224, 224] }
//!   ],
//!   "outputs": [
//!     { "name": "OUT0", "data_type": "FP32", "dims": [1000],
//!       "label_filename": "labels.txt" }
//!   ],
//!   "instance_groups": [
//!     { "name": "resnet50_group", "kind": "gpu", "count": 2, "gpus": [0, 1] }
//!   ],
//!   "warmup": [
//!     { "name": "sample", "batch_size": 1,
//!       "inputs": { "IN0": { "data_type": "FP32", "dims": [3, 224, 224],
//!                            "source": "zero_data" } } }
//!   ]
//! }
//! ```

mod config;
mod error;
mod labels;

pub use config::{
    InstanceGroup, InstanceGroupKind, ModelConfig, ModelInput, ModelOutput, WarmupInput,
    WarmupSetting, WarmupSource,
};
pub use error::ConfigError;
pub use labels::LabelProvider;

// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Error types for configuration loading and validation.

/// Errors that can occur when loading or validating a model configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read model configuration: {0}")]
    ReadError(#[from] std::io::Error),

    /// The configuration JSON is malformed.
    #[error("failed to parse model configuration: {0}")]
    ParseError(#[from] serde_json::Error),

    /// The configuration is internally inconsistent.
    #[error("invalid configuration for model '{model}': {detail}")]
    InvalidConfig { model: String, detail: String },

    /// A label file named by an output could not be loaded.
    #[error("failed to load labels from '{path}': {detail}")]
    LabelLoadError { path: String, detail: String },
}

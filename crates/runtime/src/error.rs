// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Error types for the request lifecycle core.

/// Errors surfaced by the request lifecycle and instance execution core.
///
/// `Clone` because a single failure (for example a plugin exec error)
/// fans out into one error response per request of a batch.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RuntimeError {
    /// Caller-visible validation failure: unknown names, shape or dtype
    /// mismatches, batch size out of range, duplicate adds, overwrite of
    /// existing input data.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Contract violation inside the core: an allocation for a null
    /// request, a mapping that should have been built earlier.
    #[error("internal: {0}")]
    Internal(String),

    /// Transient failure, propagated verbatim from the backend plugin or
    /// a shut-down work queue.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Feature not implemented by this backend plugin.
    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl From<model_config::ConfigError> for RuntimeError {
    fn from(e: model_config::ConfigError) -> Self {
        RuntimeError::InvalidArgument(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let e = RuntimeError::InvalidArgument("input 'X' does not exist".into());
        assert_eq!(format!("{e}"), "invalid argument: input 'X' does not exist");
    }

    #[test]
    fn test_config_error_maps_to_invalid_argument() {
        let config = model_config::ModelConfig::from_json(
            r#"{
                "name": "dup",
                "inputs": [
                    { "name": "A", "data_type": "FP32", "dims": [1] },
                    { "name": "A", "data_type": "FP32", "dims": [1] }
                ]
            }"#,
        )
        .unwrap();
        let err: RuntimeError = config.validate().unwrap_err().into();
        assert!(matches!(err, RuntimeError::InvalidArgument(_)));
    }
}

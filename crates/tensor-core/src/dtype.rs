// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Supported tensor element data types.

/// Enumerates the element types a served tensor can hold.
///
/// The runtime uses `DType` to validate requests against the model
/// configuration and to compute buffer byte sizes. `String` is the
/// variable-length bytes type; its per-element size is not fixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DType {
    /// Boolean, one byte per element.
    Bool,
    /// 8-bit unsigned integer.
    Uint8,
    /// 16-bit unsigned integer.
    Uint16,
    /// 32-bit unsigned integer.
    Uint32,
    /// 64-bit unsigned integer.
    Uint64,
    /// 8-bit signed integer.
    Int8,
    /// 16-bit signed integer.
    Int16,
    /// 32-bit signed integer.
    Int32,
    /// 64-bit signed integer.
    Int64,
    /// 16-bit IEEE 754 floating point.
    Fp16,
    /// 32-bit IEEE 754 floating point.
    Fp32,
    /// 64-bit IEEE 754 floating point.
    Fp64,
    /// Variable-length bytes (length-prefixed on the wire).
    String,
}

impl DType {
    /// Returns the size of a single element in bytes, or 0 for
    /// variable-length types.
    pub fn element_size(self) -> usize {
        match self {
            DType::Bool | DType::Uint8 | DType::Int8 => 1,
            DType::Uint16 | DType::Int16 | DType::Fp16 => 2,
            DType::Uint32 | DType::Int32 | DType::Fp32 => 4,
            DType::Uint64 | DType::Int64 | DType::Fp64 => 8,
            DType::String => 0,
        }
    }

    /// Returns the protocol-level name for this data type.
    pub fn as_str(self) -> &'static str {
        match self {
            DType::Bool => "BOOL",
            DType::Uint8 => "UINT8",
            DType::Uint16 => "UINT16",
            DType::Uint32 => "UINT32",
            DType::Uint64 => "UINT64",
            DType::Int8 => "INT8",
            DType::Int16 => "INT16",
            DType::Int32 => "INT32",
            DType::Int64 => "INT64",
            DType::Fp16 => "FP16",
            DType::Fp32 => "FP32",
            DType::Fp64 => "FP64",
            DType::String => "STRING",
        }
    }

    /// Parses a protocol-level name (case-insensitive) back into a `DType`.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "BOOL" => Some(DType::Bool),
            "UINT8" => Some(DType::Uint8),
            "UINT16" => Some(DType::Uint16),
            "UINT32" => Some(DType::Uint32),
            "UINT64" => Some(DType::Uint64),
            "INT8" => Some(DType::Int8),
            "INT16" => Some(DType::Int16),
            "INT32" => Some(DType::Int32),
            "INT64" => Some(DType::Int64),
            "FP16" => Some(DType::Fp16),
            "FP32" => Some(DType::Fp32),
            "FP64" => Some(DType::Fp64),
            "STRING" => Some(DType::String),
            _ => None,
        }
    }
}

impl std::fmt::Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_element_sizes() {
        assert_eq!(DType::Bool.element_size(), 1);
        assert_eq!(DType::Int32.element_size(), 4);
        assert_eq!(DType::Fp16.element_size(), 2);
        assert_eq!(DType::Fp64.element_size(), 8);
        assert_eq!(DType::String.element_size(), 0);
    }

    #[test]
    fn test_display_matches_as_str() {
        assert_eq!(format!("{}", DType::Fp32), "FP32");
        assert_eq!(format!("{}", DType::Uint16), "UINT16");
    }

    #[test]
    fn test_parse_roundtrip() {
        for dt in [
            DType::Bool,
            DType::Uint8,
            DType::Int64,
            DType::Fp32,
            DType::String,
        ] {
            assert_eq!(DType::parse(dt.as_str()), Some(dt));
        }
        assert_eq!(DType::parse("fp32"), Some(DType::Fp32));
        assert_eq!(DType::parse("COMPLEX128"), None);
    }

    #[test]
    fn test_serde_names() {
        let json = serde_json::to_string(&DType::Fp32).unwrap();
        assert_eq!(json, "\"FP32\"");
        let back: DType = serde_json::from_str("\"INT8\"").unwrap();
        assert_eq!(back, DType::Int8);
    }
}

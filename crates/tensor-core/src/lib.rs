// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! # tensor-core
//!
//! Tensor element types and dimension utilities shared by every crate in
//! the serving runtime.
//!
//! Dimensions are signed (`i64`) because a dimension may be the wildcard
//! sentinel [`dims::WILDCARD_DIM`] (`-1`), meaning "any positive extent".
//! Wildcards appear in model-declared shapes and reshape rules; concrete
//! request shapes must be fully specified.
//!
//! # Key Items
//!
//! - [`DType`] — the element types a served tensor can carry, with byte
//!   sizes and the protocol-level string names used in error messages.
//! - [`dims`] — element counts, byte sizes, wildcard-aware shape
//!   comparison, and the `[d0,d1,...]` display used in diagnostics.

pub mod dims;
mod dtype;

pub use dtype::DType;

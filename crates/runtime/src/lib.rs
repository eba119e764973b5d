// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! # runtime
//!
//! The request lifecycle and instance execution core of the serving
//! runtime: everything that happens between a request being handed to a
//! model and its release callback firing.
//!
//! ```text
//! caller ──► InferenceRequest ──► prepare_for_inference (normalize)
//!                 │ run()
//!                 ▼
//!              Model ──► Scheduler (batching layer, out of scope)
//!                               │
//!                               ▼
//!              ModelInstance::schedule(requests, on_completion)
//!                 │ Payload(InferRun)
//!                 ▼
//!              BackendThread ──► Backend::instance_exec
//!                                    │ responses via ResponseFactory
//!                                    ▼
//!                               InferenceRequest::release  (exactly once)
//! ```
//!
//! # Guarantees
//!
//! - Every request that reaches execution fires its release callback
//!   exactly once, after zero or more response emissions.
//! - Request ownership across the plugin boundary is transactional: the
//!   plugin owns releases on success; on failure the instance emits one
//!   error response per request and releases each.
//! - Payloads on one backend thread execute in FIFO order; shutdown is
//!   cooperative via an `Exit` payload.

mod backend;
mod error;
mod instance;
mod model;
mod request;
mod response;
mod thread;
mod warmup;

pub use backend::{Backend, ExecError};
pub use error::RuntimeError;
pub use instance::ModelInstance;
pub use model::{Model, ScheduleError, Scheduler};
pub use request::{
    InferenceRequest, Input, RequestTrace, FLAG_SEQUENCE_END, FLAG_SEQUENCE_START, RELEASE_ALL,
};
pub use response::{
    InferenceResponse, ResponseAllocator, ResponseFactory, ResponseOutput,
    RESPONSE_COMPLETE_FINAL,
};
pub use thread::{BackendThread, Operation, Payload, PayloadStatus};
pub use warmup::WarmupSample;

// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! The backend plugin interface.
//!
//! A backend is the compute engine behind a model (TensorRT, ONNX
//! Runtime, a hand-written kernel). The core only assumes its three
//! per-instance hooks. Request ownership across
//! [`Backend::instance_exec`] is transactional and is encoded in the
//! return type: on `Ok` the plugin owns every request and must emit
//! responses and release each one; on `Err` the requests come back in
//! [`ExecError`] and the instance responds and releases them. There is no
//! state in which ownership is ambiguous.

use crate::instance::ModelInstance;
use crate::request::InferenceRequest;
use crate::RuntimeError;

/// An execution failure, returning request ownership to the instance.
pub struct ExecError {
    /// The status reported to every request of the batch.
    pub status: RuntimeError,
    /// The requests the plugin did not take ownership of.
    pub requests: Vec<Box<InferenceRequest>>,
}

impl std::fmt::Debug for ExecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecError")
            .field("status", &self.status)
            .field("request_count", &self.requests.len())
            .finish()
    }
}

/// The hooks a compute backend implements.
pub trait Backend: Send + Sync {
    /// Called once per instance before any execution. Initialization is
    /// optional.
    fn instance_init(&self, _instance: &ModelInstance) -> Result<(), RuntimeError> {
        Ok(())
    }

    /// Called when an instance is destroyed. The plugin reclaims any
    /// state it attached via [`ModelInstance::set_state`]. Finalization
    /// is optional.
    fn instance_fini(&self, _instance: &ModelInstance) -> Result<(), RuntimeError> {
        Ok(())
    }

    /// Executes a batch of requests on an instance.
    ///
    /// On success the plugin owns the release lifecycle of every request.
    /// On failure every request it still holds must come back in the
    /// [`ExecError`].
    fn instance_exec(
        &self,
        instance: &ModelInstance,
        requests: Vec<Box<InferenceRequest>>,
    ) -> Result<(), ExecError>;
}

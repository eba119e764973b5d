// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Response emission: allocators, the response factory, and the response
//! itself.
//!
//! A response is never constructed directly. The request snapshots its
//! identity and callbacks into a [`ResponseFactory`]; the execution path
//! asks the factory for responses, fills outputs through the caller's
//! [`ResponseAllocator`], and hands the finished response back through
//! the caller's complete callback. The factory owns only clones and
//! `Arc`s, so responses outlive the request that spawned them.

use crate::RuntimeError;
use std::sync::Arc;
use tensor_core::DType;
use tensor_memory::{AllocatedMemory, MemoryKind};

/// Response flag bit: this is the final response for the request.
pub const RESPONSE_COMPLETE_FINAL: u32 = 1 << 0;

/// Allocation callback: `(tensor_name, byte_size, preferred_kind,
/// preferred_memory_id)` to an owned output buffer.
pub type AllocFn =
    dyn Fn(&str, usize, MemoryKind, i64) -> Result<AllocatedMemory, RuntimeError> + Send + Sync;

/// Completion callback invoked with the finished response and its flags.
pub type ResponseCompleteFn = dyn Fn(InferenceResponse, u32) + Send + Sync;

/// Allocates output buffers on behalf of the response receiver.
///
/// The buffer-release half of the callback pair from the C-style
/// interface is subsumed by `Drop`: output buffers are owned slabs and
/// free themselves with the response.
pub struct ResponseAllocator {
    alloc_fn: Box<AllocFn>,
}

impl ResponseAllocator {
    /// Creates an allocator from an allocation callback.
    pub fn new<F>(alloc_fn: F) -> Self
    where
        F: Fn(&str, usize, MemoryKind, i64) -> Result<AllocatedMemory, RuntimeError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            alloc_fn: Box::new(alloc_fn),
        }
    }

    /// An allocator that refuses every allocation.
    ///
    /// Installed on null requests, which request no outputs; any
    /// allocation attempt is a contract violation.
    pub fn null() -> Self {
        Self::new(|tensor_name, _, _, _| {
            Err(RuntimeError::Internal(format!(
                "unexpected allocation for output '{tensor_name}' of null request, \
                 no output should be requested"
            )))
        })
    }

    pub(crate) fn allocate(
        &self,
        tensor_name: &str,
        byte_size: usize,
        preferred_kind: MemoryKind,
        preferred_memory_id: i64,
    ) -> Result<AllocatedMemory, RuntimeError> {
        (self.alloc_fn)(tensor_name, byte_size, preferred_kind, preferred_memory_id)
    }
}

impl std::fmt::Debug for ResponseAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseAllocator").finish_non_exhaustive()
    }
}

/// Builds responses for one request, outliving the request itself.
#[derive(Clone)]
pub struct ResponseFactory {
    model_name: String,
    model_version: i64,
    id: String,
    allocator: Arc<ResponseAllocator>,
    complete_fn: Arc<ResponseCompleteFn>,
}

impl ResponseFactory {
    pub(crate) fn new(
        model_name: String,
        model_version: i64,
        id: String,
        allocator: Arc<ResponseAllocator>,
        complete_fn: Arc<ResponseCompleteFn>,
    ) -> Self {
        Self {
            model_name,
            model_version,
            id,
            allocator,
            complete_fn,
        }
    }

    /// Creates an empty response carrying the request's identity.
    pub fn create_response(&self) -> InferenceResponse {
        InferenceResponse {
            model_name: self.model_name.clone(),
            model_version: self.model_version,
            id: self.id.clone(),
            parameters: Vec::new(),
            status: None,
            outputs: Vec::new(),
            allocator: Arc::clone(&self.allocator),
            complete_fn: Arc::clone(&self.complete_fn),
        }
    }
}

impl std::fmt::Debug for ResponseFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseFactory")
            .field("model_name", &self.model_name)
            .field("model_version", &self.model_version)
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// One output tensor of a response.
pub struct ResponseOutput {
    name: String,
    datatype: DType,
    shape: Vec<i64>,
    buffer: AllocatedMemory,
}

impl ResponseOutput {
    /// Tensor name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Element type.
    pub fn dtype(&self) -> DType {
        self.datatype
    }

    /// Output shape, batch dimension included.
    pub fn shape(&self) -> &[i64] {
        &self.shape
    }

    /// The output bytes.
    pub fn buffer(&self) -> &AllocatedMemory {
        &self.buffer
    }

    /// The output bytes, writable. The execution path fills the buffer
    /// before sending the response.
    pub fn buffer_mut(&mut self) -> &mut AllocatedMemory {
        &mut self.buffer
    }
}

impl std::fmt::Debug for ResponseOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseOutput")
            .field("name", &self.name)
            .field("datatype", &self.datatype)
            .field("shape", &self.shape)
            .field("byte_size", &self.buffer.byte_size())
            .finish()
    }
}

/// The emission channel for one request's outputs.
///
/// Owned by the execution path until [`InferenceResponse::send`] hands it
/// to the complete callback; the callback's receiver frees it by
/// dropping.
pub struct InferenceResponse {
    model_name: String,
    model_version: i64,
    id: String,
    parameters: Vec<(String, String)>,
    status: Option<RuntimeError>,
    outputs: Vec<ResponseOutput>,
    allocator: Arc<ResponseAllocator>,
    complete_fn: Arc<ResponseCompleteFn>,
}

impl InferenceResponse {
    /// Name of the model that produced this response.
    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    /// Version of the model that produced this response.
    pub fn model_version(&self) -> i64 {
        self.model_version
    }

    /// The originating request's id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Header parameters attached by the execution path.
    pub fn parameters(&self) -> &[(String, String)] {
        &self.parameters
    }

    /// Attaches a header parameter.
    pub fn add_parameter(&mut self, name: &str, value: &str) {
        self.parameters.push((name.to_string(), value.to_string()));
    }

    /// The error status attached to this response, if any.
    pub fn error(&self) -> Option<&RuntimeError> {
        self.status.as_ref()
    }

    /// Attaches an error status.
    pub fn set_error(&mut self, status: RuntimeError) {
        self.status = Some(status);
    }

    /// The outputs added so far.
    pub fn outputs(&self) -> &[ResponseOutput] {
        &self.outputs
    }

    /// Adds an output tensor, allocating its buffer through the
    /// caller-supplied allocator.
    pub fn add_output(
        &mut self,
        name: &str,
        datatype: DType,
        shape: Vec<i64>,
        byte_size: usize,
    ) -> Result<&mut ResponseOutput, RuntimeError> {
        let buffer = self
            .allocator
            .allocate(name, byte_size, MemoryKind::Host, 0)?;
        self.outputs.push(ResponseOutput {
            name: name.to_string(),
            datatype,
            shape,
            buffer,
        });
        Ok(self
            .outputs
            .last_mut()
            .expect("output was just pushed"))
    }

    /// Delivers the response to the complete callback. The receiver owns
    /// it from here on.
    pub fn send(self, flags: u32) {
        let complete_fn = Arc::clone(&self.complete_fn);
        complete_fn(self, flags);
    }

    /// Attaches `status` and delivers the response as final.
    ///
    /// This is the canonical error-emission path.
    pub fn send_with_status(mut self, status: RuntimeError) {
        self.status = Some(status);
        self.send(RESPONSE_COMPLETE_FINAL);
    }
}

impl std::fmt::Debug for InferenceResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InferenceResponse")
            .field("model_name", &self.model_name)
            .field("model_version", &self.model_version)
            .field("id", &self.id)
            .field("status", &self.status)
            .field("output_count", &self.outputs.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn collecting_factory() -> (ResponseFactory, Arc<Mutex<Vec<(usize, u32, bool)>>>) {
        // Record (output count, flags, has error) per delivered response.
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_cb = Arc::clone(&seen);
        let allocator = Arc::new(ResponseAllocator::new(|_, byte_size, _, _| {
            Ok(AllocatedMemory::new(byte_size, MemoryKind::Host, 0))
        }));
        let factory = ResponseFactory::new(
            "m".into(),
            1,
            "req-0".into(),
            allocator,
            Arc::new(move |response: InferenceResponse, flags: u32| {
                seen_cb.lock().unwrap().push((
                    response.outputs().len(),
                    flags,
                    response.error().is_some(),
                ));
            }),
        );
        (factory, seen)
    }

    #[test]
    fn test_add_output_and_send() {
        let (factory, seen) = collecting_factory();
        let mut response = factory.create_response();
        assert_eq!(response.model_name(), "m");
        assert_eq!(response.id(), "req-0");

        let out = response
            .add_output("OUT0", DType::Fp32, vec![2, 4], 32)
            .unwrap();
        out.buffer_mut().mutable_buffer().fill(7);
        assert_eq!(out.buffer().byte_size(), 32);

        response.add_parameter("sequence_id", "7");
        assert_eq!(response.parameters().len(), 1);

        response.send(RESPONSE_COMPLETE_FINAL);
        assert_eq!(&*seen.lock().unwrap(), &[(1, RESPONSE_COMPLETE_FINAL, false)]);
    }

    #[test]
    fn test_send_with_status_is_final() {
        let (factory, seen) = collecting_factory();
        let response = factory.create_response();
        response.send_with_status(RuntimeError::Unavailable("backend busy".into()));
        assert_eq!(&*seen.lock().unwrap(), &[(0, RESPONSE_COMPLETE_FINAL, true)]);
    }

    #[test]
    fn test_null_allocator_refuses() {
        let allocator = ResponseAllocator::null();
        let err = allocator
            .allocate("OUT0", 16, MemoryKind::Host, 0)
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Internal(_)));
    }

    #[test]
    fn test_factory_outlives_nothing_shared() {
        let (factory, seen) = collecting_factory();
        // Two responses from the same factory are independent.
        let r1 = factory.create_response();
        let mut r2 = factory.create_response();
        r2.set_error(RuntimeError::Internal("x".into()));
        r1.send(0);
        r2.send(RESPONSE_COMPLETE_FINAL);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], (0, 0, false));
        assert_eq!(seen[1], (0, RESPONSE_COMPLETE_FINAL, true));
    }
}

// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! The inference request: builder, normalization, null clone, release.
//!
//! A request is built mutably against a [`Model`], normalized by
//! [`InferenceRequest::prepare_for_inference`], and consumed by
//! [`InferenceRequest::run`]. From there it travels by `Box` through the
//! scheduler and instance layers into the backend plugin, which emits
//! responses and finally triggers [`InferenceRequest::release`] —
//! exactly once per request.
//!
//! # Inputs
//!
//! Three views exist side by side:
//!
//! - *original inputs* — owned by the request, added by the caller;
//! - *override inputs* — shared (`Arc`) inputs attached by schedulers,
//!   e.g. sequence control signals; reusable across requests;
//! - the *effective* view — rebuilt from the originals by
//!   `prepare_for_inference` and extended in place by every override
//!   added afterwards. Overrides from a previous execution are not
//!   sticky: the prepare pass clears them.

use crate::model::{Model, ScheduleError};
use crate::response::{ResponseAllocator, ResponseCompleteFn, ResponseFactory};
use crate::RuntimeError;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Weak};
use tensor_core::{dims, DType};
use tensor_memory::{AllocatedMemory, Buffer, Memory, MemoryKind};

/// Request flag bit: first request of a sequence.
pub const FLAG_SEQUENCE_START: u32 = 1 << 0;
/// Request flag bit: last request of a sequence.
pub const FLAG_SEQUENCE_END: u32 = 1 << 1;

/// Release flag bit: all activity on the request is finished.
pub const RELEASE_ALL: u32 = 1 << 0;

/// The user release callback. Receives ownership of the request.
pub type ReleaseFn = Box<dyn FnOnce(Box<InferenceRequest>, u32) + Send>;

/// An internal release hook, run before the user release callback.
pub type ReleaseHook = Box<dyn FnOnce() + Send>;

/// Optional trace sink carried by a request.
///
/// The trace is moved out of the request before the user release callback
/// runs and its end event is reported after the callback returns, so
/// callback overhead is included in the request time.
pub trait RequestTrace: Send {
    /// Records the request-end event.
    fn report_request_end(&mut self);
}

/// One input tensor slot of a request.
///
/// Data is append-only: foreign slices accumulate via
/// [`Input::append_data`], or the whole buffer is installed once via
/// [`Input::set_data`]. Replacing non-empty data fails.
pub struct Input {
    name: String,
    datatype: DType,
    original_shape: Vec<i64>,
    shape: Vec<i64>,
    shape_with_batch_dim: Vec<i64>,
    is_shape_tensor: bool,
    data: Arc<Memory>,
}

impl Input {
    /// Creates an input with the caller-supplied shape. The working
    /// shapes stay empty until normalization fills them.
    pub fn new(name: &str, datatype: DType, shape: &[i64]) -> Self {
        Self {
            name: name.to_string(),
            datatype,
            original_shape: shape.to_vec(),
            shape: Vec::new(),
            shape_with_batch_dim: Vec::new(),
            is_shape_tensor: false,
            data: Arc::new(Memory::new_reference()),
        }
    }

    /// Creates an override input. Overrides bypass normalization, so the
    /// working shapes are the original shape from the start.
    pub fn new_override(name: &str, datatype: DType, shape: &[i64]) -> Self {
        let mut input = Self::new(name, datatype, shape);
        input.shape = shape.to_vec();
        input.shape_with_batch_dim = shape.to_vec();
        input
    }

    /// Tensor name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Element type.
    pub fn dtype(&self) -> DType {
        self.datatype
    }

    /// The shape as supplied by the caller.
    pub fn original_shape(&self) -> &[i64] {
        &self.original_shape
    }

    /// The working shape: batch-stripped and reshaped by normalization.
    pub fn shape(&self) -> &[i64] {
        &self.shape
    }

    /// The working shape with the batch dimension restored.
    pub fn shape_with_batch_dim(&self) -> &[i64] {
        &self.shape_with_batch_dim
    }

    /// Whether normalization tagged this input as a shape tensor.
    pub fn is_shape_tensor(&self) -> bool {
        self.is_shape_tensor
    }

    /// The input's buffer handle.
    pub fn data(&self) -> &Arc<Memory> {
        &self.data
    }

    /// Returns the data buffer at `idx`, or `None` past the end.
    pub fn data_buffer(&self, idx: usize) -> Option<Buffer> {
        self.data.buffer_at(idx)
    }

    /// Appends a slice of foreign memory. Zero-length appends are
    /// ignored.
    ///
    /// The caller guarantees the memory stays valid until the request is
    /// released.
    pub fn append_data(
        &mut self,
        ptr: *const u8,
        byte_size: usize,
        kind: MemoryKind,
        memory_id: i64,
    ) -> Result<(), RuntimeError> {
        if byte_size == 0 {
            return Ok(());
        }
        match Arc::get_mut(&mut self.data) {
            Some(Memory::Reference(reference)) => {
                reference.add_buffer(ptr, byte_size, kind, memory_id);
                Ok(())
            }
            Some(Memory::Allocated(_)) => Err(RuntimeError::Internal(format!(
                "input '{}' holds an allocated buffer, cannot append",
                self.name
            ))),
            None => Err(RuntimeError::Internal(format!(
                "input '{}' data is shared, cannot append",
                self.name
            ))),
        }
    }

    /// Replaces the buffer in one shot. Fails if existing data is
    /// non-empty.
    pub fn set_data(&mut self, data: Arc<Memory>) -> Result<(), RuntimeError> {
        if self.data.total_byte_size() != 0 {
            return Err(RuntimeError::InvalidArgument(format!(
                "input '{}' already has data, can't overwrite",
                self.name
            )));
        }
        self.data = data;
        Ok(())
    }

    /// Drops all attached data, restoring an empty reference.
    pub fn remove_all_data(&mut self) {
        self.data = Arc::new(Memory::new_reference());
    }

    pub(crate) fn set_shape(&mut self, shape: Vec<i64>) {
        self.shape = shape;
    }

    pub(crate) fn set_shape_with_batch_dim(&mut self, shape: Vec<i64>) {
        self.shape_with_batch_dim = shape;
    }

    pub(crate) fn set_is_shape_tensor(&mut self, is_shape_tensor: bool) {
        self.is_shape_tensor = is_shape_tensor;
    }
}

impl std::fmt::Debug for Input {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Input")
            .field("name", &self.name)
            .field("datatype", &self.datatype)
            .field("original_shape", &self.original_shape)
            .field("shape", &self.shape)
            .field("is_shape_tensor", &self.is_shape_tensor)
            .field("byte_size", &self.data.total_byte_size())
            .finish()
    }
}

/// How an entry of the effective input view resolves.
enum InputView {
    /// Resolves into the request's own original-inputs table.
    Original,
    /// Resolves to a shared override.
    Override(Arc<Input>),
}

/// One client inference call.
pub struct InferenceRequest {
    model: Weak<Model>,
    requested_version: i64,
    actual_version: i64,
    id: String,
    correlation_id: u64,
    flags: u32,
    priority: u32,
    timeout_us: u64,
    batch_size: u32,
    needs_normalization: bool,
    collect_stats: bool,
    original_inputs: HashMap<String, Input>,
    override_inputs: HashMap<String, Arc<Input>>,
    inputs: HashMap<String, InputView>,
    original_requested_outputs: BTreeSet<String>,
    requested_outputs: BTreeSet<String>,
    response_allocator: Option<Arc<ResponseAllocator>>,
    response_complete: Option<Arc<ResponseCompleteFn>>,
    release_fn: Option<ReleaseFn>,
    release_hooks: Vec<ReleaseHook>,
    trace: Option<Box<dyn RequestTrace>>,
    request_start_ns: u64,
    queue_start_ns: u64,
}

impl InferenceRequest {
    /// Creates a request bound to `model`.
    ///
    /// The binding is weak: if the model is unloaded before the request
    /// runs, later operations fail with `InvalidArgument`.
    pub fn new(model: &Arc<Model>, requested_version: i64) -> Self {
        Self::with_binding(Arc::downgrade(model), requested_version, model.version())
    }

    fn with_binding(model: Weak<Model>, requested_version: i64, actual_version: i64) -> Self {
        Self {
            model,
            requested_version,
            actual_version,
            id: String::new(),
            correlation_id: 0,
            flags: 0,
            priority: 0,
            timeout_us: 0,
            batch_size: 0,
            needs_normalization: true,
            collect_stats: true,
            original_inputs: HashMap::new(),
            override_inputs: HashMap::new(),
            inputs: HashMap::new(),
            original_requested_outputs: BTreeSet::new(),
            requested_outputs: BTreeSet::new(),
            response_allocator: None,
            response_complete: None,
            release_fn: None,
            release_hooks: Vec::new(),
            trace: None,
            request_start_ns: 0,
            queue_start_ns: 0,
        }
    }

    /// Upgrades the model binding.
    pub fn model(&self) -> Result<Arc<Model>, RuntimeError> {
        self.model.upgrade().ok_or_else(|| {
            RuntimeError::InvalidArgument(format!(
                "model no longer loaded for request '{}'",
                self.id
            ))
        })
    }

    /// Name of the bound model.
    pub fn model_name(&self) -> Result<String, RuntimeError> {
        Ok(self.model()?.name().to_string())
    }

    /// The version the caller asked for (-1 selects the latest).
    pub fn requested_version(&self) -> i64 {
        self.requested_version
    }

    /// The version that actually serves the request.
    pub fn actual_version(&self) -> i64 {
        self.actual_version
    }

    /// The caller-opaque request id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Sets the caller-opaque request id.
    pub fn set_id(&mut self, id: &str) {
        self.id = id.to_string();
    }

    /// The sequence correlation id.
    pub fn correlation_id(&self) -> u64 {
        self.correlation_id
    }

    /// Sets the sequence correlation id.
    pub fn set_correlation_id(&mut self, correlation_id: u64) {
        self.correlation_id = correlation_id;
    }

    /// Request flags ([`FLAG_SEQUENCE_START`], [`FLAG_SEQUENCE_END`]).
    pub fn flags(&self) -> u32 {
        self.flags
    }

    /// Sets the request flags.
    pub fn set_flags(&mut self, flags: u32) {
        self.flags = flags;
    }

    /// The effective priority level.
    pub fn priority(&self) -> u32 {
        self.priority
    }

    /// Sets the priority. Level 0 and levels above the model's maximum
    /// both store the model's default level.
    pub fn set_priority(&mut self, priority: u32) -> Result<(), RuntimeError> {
        let model = self.model()?;
        if priority == 0 || priority > model.max_priority_level() {
            self.priority = model.default_priority_level();
        } else {
            self.priority = priority;
        }
        Ok(())
    }

    /// The request timeout in microseconds; 0 means no timeout.
    /// Enforcement belongs to the scheduler above this core.
    pub fn timeout_microseconds(&self) -> u64 {
        self.timeout_us
    }

    /// Sets the request timeout.
    pub fn set_timeout_microseconds(&mut self, timeout_us: u64) {
        self.timeout_us = timeout_us;
    }

    /// The batch size computed by normalization; 0 iff the model does
    /// not declare batching.
    pub fn batch_size(&self) -> u32 {
        self.batch_size
    }

    /// Whether this request participates in statistics collection.
    pub fn collect_stats(&self) -> bool {
        self.collect_stats
    }

    /// Enables or disables statistics collection.
    pub fn set_collect_stats(&mut self, collect_stats: bool) {
        self.collect_stats = collect_stats;
    }

    // ── Inputs ─────────────────────────────────────────────────

    /// The caller-added inputs.
    pub fn original_inputs(&self) -> &HashMap<String, Input> {
        &self.original_inputs
    }

    /// Mutable access to a caller-added input.
    pub fn mutable_original_input(&mut self, name: &str) -> Result<&mut Input, RuntimeError> {
        self.original_inputs.get_mut(name).ok_or_else(|| {
            RuntimeError::InvalidArgument(format!("input '{name}' does not exist in request"))
        })
    }

    /// The shared override inputs.
    pub fn override_inputs(&self) -> &HashMap<String, Arc<Input>> {
        &self.override_inputs
    }

    /// Adds an input. Fails if the name collides.
    pub fn add_original_input(
        &mut self,
        name: &str,
        datatype: DType,
        shape: &[i64],
    ) -> Result<&mut Input, RuntimeError> {
        if self.original_inputs.contains_key(name) {
            return Err(RuntimeError::InvalidArgument(format!(
                "input '{name}' already exists in request"
            )));
        }
        tracing::debug!("add original input '{}' to request '{}'", name, self.id);
        self.original_inputs
            .insert(name.to_string(), Input::new(name, datatype, shape));
        self.needs_normalization = true;
        Ok(self
            .original_inputs
            .get_mut(name)
            .expect("input was just inserted"))
    }

    /// Removes an input. Fails if it does not exist.
    pub fn remove_original_input(&mut self, name: &str) -> Result<(), RuntimeError> {
        if self.original_inputs.remove(name).is_none() {
            return Err(RuntimeError::InvalidArgument(format!(
                "input '{name}' does not exist in request"
            )));
        }
        self.needs_normalization = true;
        Ok(())
    }

    /// Removes every input.
    pub fn remove_all_original_inputs(&mut self) {
        self.original_inputs.clear();
        self.needs_normalization = true;
    }

    /// Attaches a shared override input, replacing any previous override
    /// with the same name. The override becomes visible in the effective
    /// input view immediately, which is what makes overrides added after
    /// [`InferenceRequest::prepare_for_inference`] reachable.
    pub fn add_override_input(&mut self, input: Arc<Input>) -> Result<(), RuntimeError> {
        let name = input.name().to_string();
        tracing::debug!("adding input override for '{}' to request '{}'", name, self.id);
        self.override_inputs
            .insert(name.clone(), Arc::clone(&input));
        self.inputs.insert(name, InputView::Override(input));
        Ok(())
    }

    /// Resolves an input in the effective view.
    pub fn immutable_input(&self, name: &str) -> Result<&Input, RuntimeError> {
        match self.inputs.get(name) {
            Some(InputView::Original) => self.original_inputs.get(name).ok_or_else(|| {
                RuntimeError::Internal(format!(
                    "input '{name}' is in the effective view but not in the request"
                ))
            }),
            Some(InputView::Override(input)) => Ok(input),
            None => Err(RuntimeError::InvalidArgument(format!(
                "input '{name}' does not exist in request"
            ))),
        }
    }

    /// Iterates the effective input view.
    pub fn immutable_inputs(&self) -> impl Iterator<Item = (&str, &Input)> {
        self.inputs.iter().map(move |(name, view)| {
            let input = match view {
                InputView::Original => self
                    .original_inputs
                    .get(name)
                    .expect("effective view entries resolve to existing inputs"),
                InputView::Override(input) => input.as_ref(),
            };
            (name.as_str(), input)
        })
    }

    // ── Requested outputs ──────────────────────────────────────

    /// The caller-requested output names.
    pub fn original_requested_outputs(&self) -> &BTreeSet<String> {
        &self.original_requested_outputs
    }

    /// The effective requested outputs: the originals if any were named,
    /// otherwise every model output.
    pub fn immutable_requested_outputs(&self) -> &BTreeSet<String> {
        &self.requested_outputs
    }

    /// Requests an output by name.
    pub fn add_original_requested_output(&mut self, name: &str) {
        self.original_requested_outputs.insert(name.to_string());
        self.needs_normalization = true;
    }

    /// Drops a requested output.
    pub fn remove_original_requested_output(&mut self, name: &str) {
        self.original_requested_outputs.remove(name);
        self.needs_normalization = true;
    }

    /// Drops every requested output.
    pub fn remove_all_original_requested_outputs(&mut self) {
        self.original_requested_outputs.clear();
        self.needs_normalization = true;
    }

    // ── Callbacks ──────────────────────────────────────────────

    /// Installs the response allocator and complete callback.
    pub fn set_response_callback<F>(&mut self, allocator: Arc<ResponseAllocator>, complete: F)
    where
        F: Fn(crate::InferenceResponse, u32) + Send + Sync + 'static,
    {
        self.response_allocator = Some(allocator);
        self.response_complete = Some(Arc::new(complete));
    }

    /// Installs the release callback. It receives ownership of the
    /// request and fires exactly once.
    pub fn set_release_callback<F>(&mut self, release: F)
    where
        F: FnOnce(Box<InferenceRequest>, u32) + Send + 'static,
    {
        self.release_fn = Some(Box::new(release));
    }

    /// Registers an internal release hook. Hooks run before the user
    /// release callback, in reverse registration order: a hook registered
    /// later may depend on an earlier one's resources still being live.
    pub fn add_release_hook<F>(&mut self, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.release_hooks.push(Box::new(hook));
    }

    /// Attaches a trace sink.
    pub fn set_trace(&mut self, trace: Box<dyn RequestTrace>) {
        self.trace = Some(trace);
    }

    /// Builds a response factory snapshot for this request.
    pub fn response_factory(&self) -> Result<ResponseFactory, RuntimeError> {
        let allocator = self.response_allocator.clone().ok_or_else(|| {
            RuntimeError::Internal(format!(
                "response callback not set for request '{}'",
                self.id
            ))
        })?;
        let complete = self.response_complete.clone().ok_or_else(|| {
            RuntimeError::Internal(format!(
                "response complete callback not set for request '{}'",
                self.id
            ))
        })?;
        let model_name = self
            .model
            .upgrade()
            .map(|m| m.name().to_string())
            .unwrap_or_default();
        Ok(ResponseFactory::new(
            model_name,
            self.actual_version,
            self.id.clone(),
            allocator,
            complete,
        ))
    }

    // ── Timing ─────────────────────────────────────────────────

    /// Records the request-received timestamp.
    pub fn capture_request_start_ns(&mut self) {
        self.request_start_ns = now_ns();
    }

    /// Records the enqueued-for-scheduling timestamp.
    pub fn capture_queue_start_ns(&mut self) {
        self.queue_start_ns = now_ns();
    }

    /// The request-received timestamp, 0 if not captured.
    pub fn request_start_ns(&self) -> u64 {
        self.request_start_ns
    }

    /// The enqueued timestamp, 0 if not captured.
    pub fn queue_start_ns(&self) -> u64 {
        self.queue_start_ns
    }

    // ── Lifecycle ──────────────────────────────────────────────

    /// Readies the request for execution.
    ///
    /// Clears the effective input view and the override table (overrides
    /// from a previous execution are not sticky), renormalizes if any
    /// mutation requires it, repopulates the effective view from the
    /// originals, and zeroes the timing counters. Idempotent when nothing
    /// changed in between.
    pub fn prepare_for_inference(&mut self) -> Result<(), RuntimeError> {
        self.inputs.clear();
        self.override_inputs.clear();

        if self.needs_normalization {
            self.normalize()?;
            self.needs_normalization = false;
        }

        for name in self.original_inputs.keys() {
            self.inputs.insert(name.clone(), InputView::Original);
        }

        self.queue_start_ns = 0;
        self.request_start_ns = 0;

        tracing::debug!("prepared request '{}' for inference", self.id);
        Ok(())
    }

    /// Consumes the request and hands it to the model's scheduler. On
    /// failure the caller gets the request back inside the error.
    pub fn run(request: Box<Self>) -> Result<(), ScheduleError> {
        let model = match request.model() {
            Ok(model) => model,
            Err(status) => return Err(ScheduleError { status, request }),
        };
        model.enqueue(request)
    }

    /// Emits one error response through the request's response factory
    /// and, when `release_request` is set, releases the request with
    /// [`RELEASE_ALL`]. Returns the request when it was not released.
    pub fn respond_if_error(
        request: Box<Self>,
        status: &RuntimeError,
        release_request: bool,
    ) -> Option<Box<Self>> {
        match request.response_factory() {
            Ok(factory) => factory.create_response().send_with_status(status.clone()),
            Err(e) => tracing::error!("failed to create error response: {e}"),
        }

        if release_request {
            Self::release(request, RELEASE_ALL);
            None
        } else {
            Some(request)
        }
    }

    /// Applies [`InferenceRequest::respond_if_error`] to every request in
    /// order. Returns the requests that were not released.
    pub fn respond_all_if_error(
        requests: Vec<Box<Self>>,
        status: &RuntimeError,
        release_requests: bool,
    ) -> Vec<Box<Self>> {
        requests
            .into_iter()
            .filter_map(|r| Self::respond_if_error(r, status, release_requests))
            .collect()
    }

    /// Releases the request: drains internal hooks in LIFO order, moves
    /// the trace out, then transfers ownership to the user release
    /// callback. The trace end event is recorded after the callback
    /// returns so its overhead is included in the request time.
    pub fn release(mut request: Box<Self>, release_flags: u32) {
        let hooks = std::mem::take(&mut request.release_hooks);
        for hook in hooks.into_iter().rev() {
            hook();
        }

        let trace = request.trace.take();

        if let Some(release_fn) = request.release_fn.take() {
            release_fn(request, release_flags);
        }

        if let Some(mut trace) = trace {
            trace.report_request_end();
        }
    }

    // ── Null clone ─────────────────────────────────────────────

    /// Clones this request into a null request: a synthetic padding
    /// request that carries valid shape-tensor content, shares one
    /// padding buffer across all other inputs, requests no outputs, and
    /// deletes itself on release.
    pub fn copy_as_null(&self) -> Result<Box<InferenceRequest>, RuntimeError> {
        let mut lrequest = Box::new(Self::with_binding(
            self.model.clone(),
            self.requested_version,
            self.actual_version,
        ));
        lrequest.batch_size = self.batch_size;
        lrequest.collect_stats = false;

        // Pass 1: shape tensors. Their content is semantically meaningful,
        // so each gets a byte-for-byte copy in a fresh host slab.
        for (name, input) in &self.original_inputs {
            if !input.is_shape_tensor() {
                continue;
            }
            let byte_size = input.data().total_byte_size();
            let mut data = AllocatedMemory::new(byte_size, MemoryKind::Host, 0);
            if let Some(from) = input.data_buffer(0) {
                // Shape tensors are assumed to live in a single host buffer.
                if from.byte_size != byte_size {
                    tracing::warn!(
                        "the byte size of shape tensor '{}' to be copied does not match",
                        name,
                    );
                }
                let n = from.byte_size.min(byte_size);
                data.mutable_buffer()[..n].copy_from_slice(unsafe { &from.as_slice()[..n] });
            }

            let new_input = lrequest.add_original_input(name, input.dtype(), input.shape())?;
            let original = new_input.original_shape().to_vec();
            new_input.set_shape(original.clone());
            new_input.set_shape_with_batch_dim(original);
            new_input.set_is_shape_tensor(true);
            new_input.set_data(Arc::new(Memory::from(data)))?;
        }

        // Pass 2: the largest non-shape input decides the padding slab.
        let mut max_byte_size = 0usize;
        let mut max_input_name: Option<&String> = None;
        for (name, input) in &self.original_inputs {
            if input.is_shape_tensor() {
                continue;
            }
            if input.data().total_byte_size() >= max_byte_size {
                max_byte_size = input.data().total_byte_size();
                max_input_name = Some(name);
            }
        }

        // Pass 3: the largest input owns the slab, every other non-shape
        // input references a prefix of it sized to its own byte size.
        let data = Arc::new(Memory::from(AllocatedMemory::new(
            max_byte_size,
            MemoryKind::Host,
            0,
        )));
        let data_base = data.buffer_at(0);
        for (name, input) in &self.original_inputs {
            if input.is_shape_tensor() {
                continue;
            }
            let from_byte_size = input.data().total_byte_size();
            let new_input = lrequest.add_original_input(name, input.dtype(), input.shape())?;
            let original = new_input.original_shape().to_vec();
            new_input.set_shape(original.clone());
            new_input.set_shape_with_batch_dim(original);
            if Some(name) == max_input_name {
                new_input.set_data(Arc::clone(&data))?;
            } else if let Some(base) = data_base {
                new_input.append_data(base.ptr, from_byte_size, base.kind, base.memory_id)?;
            }
        }

        // No outputs were requested, so no allocation should ever happen.
        lrequest.set_response_callback(Arc::new(ResponseAllocator::null()), |response, _flags| {
            if let Some(err) = response.error() {
                tracing::error!("null request response error: {err}");
            }
        });
        lrequest.set_release_callback(|request, flags| {
            if flags & RELEASE_ALL != 0 {
                drop(request);
            }
        });

        lrequest.needs_normalization = false;
        let names: Vec<String> = lrequest.original_inputs.keys().cloned().collect();
        for name in names {
            lrequest.inputs.insert(name, InputView::Original);
        }

        Ok(lrequest)
    }

    // ── Normalization ──────────────────────────────────────────

    fn normalize(&mut self) -> Result<(), RuntimeError> {
        let model = self.model()?;
        let config = model.config();

        // Effective requested outputs: every declared output when the
        // caller named none, otherwise the validated originals.
        self.requested_outputs.clear();
        if self.original_requested_outputs.is_empty() {
            for output in &config.outputs {
                self.requested_outputs.insert(output.name.clone());
            }
        } else {
            for name in &self.original_requested_outputs {
                model.get_output(name)?;
                self.requested_outputs.insert(name.clone());
            }
        }

        if self.original_inputs.len() != config.inputs.len() {
            return Err(RuntimeError::InvalidArgument(format!(
                "expected {} inputs but got {} inputs for model '{}'",
                config.inputs.len(),
                self.original_inputs.len(),
                model.name()
            )));
        }

        // Determine the batch size and the working shape of each input.
        if config.max_batch_size == 0 {
            // The model does not use runtime-managed batching; tensor
            // shapes stay as they are.
            self.batch_size = 0;
            for input in self.original_inputs.values_mut() {
                let original = input.original_shape().to_vec();
                input.set_shape(original);
            }
        } else {
            // Every non-shape-tensor input must agree on the leading
            // batch dimension, which is then stripped.
            self.batch_size = 0;
            for (name, input) in self.original_inputs.iter_mut() {
                let input_config = model.get_input(name)?;
                if input_config.is_shape_tensor {
                    let original = input.original_shape().to_vec();
                    input.set_shape(original);
                    input.set_is_shape_tensor(true);
                    continue;
                }

                if input.original_shape().is_empty() {
                    return Err(RuntimeError::InvalidArgument(format!(
                        "input '{}' has no shape but model requires batch dimension for '{}'",
                        name,
                        model.name()
                    )));
                }

                let first = input.original_shape()[0];
                if self.batch_size == 0 {
                    self.batch_size = first as u32;
                } else if first != self.batch_size as i64 {
                    return Err(RuntimeError::InvalidArgument(format!(
                        "input '{}' batch size does not match other inputs for '{}'",
                        name,
                        model.name()
                    )));
                }

                let stripped = input.original_shape()[1..].to_vec();
                input.set_shape(stripped);
            }
        }

        if self.batch_size as i64 > config.max_batch_size as i64 {
            return Err(RuntimeError::InvalidArgument(format!(
                "inference request batch-size must be <= {} for '{}'",
                config.max_batch_size,
                model.name()
            )));
        }

        // Validate each working shape, apply reshapes, restore the batch
        // dimension.
        for (name, input) in self.original_inputs.iter_mut() {
            let input_config = model.get_input(name)?;

            if input.dtype() != input_config.data_type {
                return Err(RuntimeError::InvalidArgument(format!(
                    "inference input data-type is '{}', model expects '{}' for '{}'",
                    input.dtype().as_str(),
                    input_config.data_type.as_str(),
                    model.name()
                )));
            }

            if !dims::compatible(&input_config.dims, input.shape()) {
                let mut full_dims = Vec::with_capacity(input_config.dims.len() + 1);
                if config.max_batch_size > 0 {
                    full_dims.push(dims::WILDCARD_DIM);
                }
                full_dims.extend_from_slice(&input_config.dims);
                return Err(RuntimeError::InvalidArgument(format!(
                    "unexpected shape for input '{}' for model '{}'. Expected {}, got {}",
                    name,
                    model.name(),
                    dims::dims_to_string(&full_dims),
                    dims::dims_to_string(input.original_shape())
                )));
            }

            // A reshape may carry variable-size dimensions; record the
            // values at the declared wildcard positions, in order, and
            // substitute them into the reshape's wildcard slots.
            if let Some(reshape) = &input_config.reshape {
                let mut variable_size_values = VecDeque::new();
                for (idx, &dim) in input_config.dims.iter().enumerate() {
                    if dim == dims::WILDCARD_DIM {
                        variable_size_values.push_back(input.shape()[idx]);
                    }
                }
                let mut new_shape = Vec::with_capacity(reshape.len());
                for &dim in reshape {
                    if dim == dims::WILDCARD_DIM {
                        new_shape.push(variable_size_values.pop_front().ok_or_else(|| {
                            RuntimeError::Internal(format!(
                                "reshape for input '{name}' expects more variable-size \
                                 dimensions than the declared dims provide"
                            ))
                        })?);
                    } else {
                        new_shape.push(dim);
                    }
                }
                input.set_shape(new_shape);
            }

            if self.batch_size == 0 {
                input.set_shape_with_batch_dim(input.shape().to_vec());
            } else {
                let mut shape_with_batch = Vec::with_capacity(input.shape().len() + 1);
                shape_with_batch.push(self.batch_size as i64);
                shape_with_batch.extend_from_slice(input.shape());
                input.set_shape_with_batch_dim(shape_with_batch);
            }
        }

        Ok(())
    }
}

impl std::fmt::Debug for InferenceRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InferenceRequest")
            .field("id", &self.id)
            .field("requested_version", &self.requested_version)
            .field("actual_version", &self.actual_version)
            .field("correlation_id", &self.correlation_id)
            .field("flags", &self.flags)
            .field("priority", &self.priority)
            .field("timeout_us", &self.timeout_us)
            .field("batch_size", &self.batch_size)
            .field("original_inputs", &self.original_inputs.len())
            .field("override_inputs", &self.override_inputs.len())
            .finish()
    }
}

/// Monotonic nanoseconds since the first capture in this process.
fn now_ns() -> u64 {
    use std::sync::OnceLock;
    use std::time::Instant;
    static ANCHOR: OnceLock<Instant> = OnceLock::new();
    ANCHOR.get_or_init(Instant::now).elapsed().as_nanos() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Backend, ExecError};
    use crate::instance::ModelInstance;
    use model_config::ModelConfig;

    struct NoopBackend;
    impl Backend for NoopBackend {
        fn instance_exec(
            &self,
            _instance: &ModelInstance,
            _requests: Vec<Box<InferenceRequest>>,
        ) -> Result<(), ExecError> {
            Ok(())
        }
    }

    fn model(json: &str) -> Arc<Model> {
        let config = ModelConfig::from_json(json).unwrap();
        Model::new(config, 1, Arc::new(NoopBackend)).unwrap()
    }

    fn batched_model() -> Arc<Model> {
        model(
            r#"{
                "name": "batched",
                "max_batch_size": 4,
                "inputs": [
                    { "name": "IN0", "data_type": "FP32", "dims": [3] }
                ],
                "outputs": [
                    { "name": "OUT0", "data_type": "FP32", "dims": [3] }
                ]
            }"#,
        )
    }

    #[test]
    fn test_add_duplicate_input_rejected() {
        let model = batched_model();
        let mut request = InferenceRequest::new(&model, -1);
        request
            .add_original_input("IN0", DType::Fp32, &[2, 3])
            .unwrap();
        let err = request
            .add_original_input("IN0", DType::Fp32, &[2, 3])
            .unwrap_err();
        assert!(format!("{err}").contains("already exists"));
    }

    #[test]
    fn test_remove_missing_input_rejected() {
        let model = batched_model();
        let mut request = InferenceRequest::new(&model, -1);
        assert!(request.remove_original_input("NOPE").is_err());
    }

    #[test]
    fn test_add_remove_add_normalizes_once() {
        let model = batched_model();
        let mut request = InferenceRequest::new(&model, -1);
        request
            .add_original_input("IN0", DType::Fp32, &[2, 3])
            .unwrap();
        request.remove_original_input("IN0").unwrap();
        request
            .add_original_input("IN0", DType::Fp32, &[2, 3])
            .unwrap();
        request.prepare_for_inference().unwrap();
        assert_eq!(request.batch_size(), 2);
        // A second prepare with no intervening mutation is a no-op.
        request.prepare_for_inference().unwrap();
        assert_eq!(request.batch_size(), 2);
    }

    #[test]
    fn test_normalize_batched() {
        let model = batched_model();
        let mut request = InferenceRequest::new(&model, -1);
        request
            .add_original_input("IN0", DType::Fp32, &[2, 3])
            .unwrap();
        request.prepare_for_inference().unwrap();

        assert_eq!(request.batch_size(), 2);
        let input = request.immutable_input("IN0").unwrap();
        assert_eq!(input.shape(), &[3]);
        assert_eq!(input.shape_with_batch_dim(), &[2, 3]);
        assert_eq!(
            request.immutable_requested_outputs().iter().count(),
            1,
            "empty requested outputs default to all model outputs"
        );
    }

    #[test]
    fn test_normalize_batch_mismatch() {
        let model = model(
            r#"{
                "name": "two_inputs",
                "max_batch_size": 4,
                "inputs": [
                    { "name": "IN0", "data_type": "FP32", "dims": [3] },
                    { "name": "IN1", "data_type": "FP32", "dims": [5] }
                ]
            }"#,
        );
        let mut request = InferenceRequest::new(&model, -1);
        request
            .add_original_input("IN0", DType::Fp32, &[2, 3])
            .unwrap();
        request
            .add_original_input("IN1", DType::Fp32, &[3, 5])
            .unwrap();
        let err = request.prepare_for_inference().unwrap_err();
        assert!(format!("{err}").contains("batch size does not match"));
    }

    #[test]
    fn test_normalize_input_count_mismatch() {
        let model = batched_model();
        let mut request = InferenceRequest::new(&model, -1);
        let err = request.prepare_for_inference().unwrap_err();
        assert!(format!("{err}").contains("expected 1 inputs but got 0 inputs"));
    }

    #[test]
    fn test_normalize_dtype_mismatch() {
        let model = batched_model();
        let mut request = InferenceRequest::new(&model, -1);
        request
            .add_original_input("IN0", DType::Int32, &[2, 3])
            .unwrap();
        let err = request.prepare_for_inference().unwrap_err();
        let msg = format!("{err}");
        assert!(msg.contains("INT32") && msg.contains("FP32"));
    }

    #[test]
    fn test_normalize_shape_mismatch_reports_both_shapes() {
        let model = batched_model();
        let mut request = InferenceRequest::new(&model, -1);
        request
            .add_original_input("IN0", DType::Fp32, &[2, 4])
            .unwrap();
        let err = request.prepare_for_inference().unwrap_err();
        let msg = format!("{err}");
        assert!(msg.contains("Expected [-1,3]"), "got: {msg}");
        assert!(msg.contains("got [2,4]"), "got: {msg}");
    }

    #[test]
    fn test_normalize_batch_too_large() {
        let model = batched_model();
        let mut request = InferenceRequest::new(&model, -1);
        request
            .add_original_input("IN0", DType::Fp32, &[5, 3])
            .unwrap();
        let err = request.prepare_for_inference().unwrap_err();
        assert!(format!("{err}").contains("batch-size must be <= 4"));
    }

    #[test]
    fn test_normalize_missing_batch_dim() {
        let model = batched_model();
        let mut request = InferenceRequest::new(&model, -1);
        request.add_original_input("IN0", DType::Fp32, &[]).unwrap();
        let err = request.prepare_for_inference().unwrap_err();
        assert!(format!("{err}").contains("no shape but model requires batch dimension"));
    }

    #[test]
    fn test_normalize_no_batching() {
        let model = model(
            r#"{
                "name": "unbatched",
                "inputs": [
                    { "name": "IN0", "data_type": "FP32", "dims": [2, 3] }
                ]
            }"#,
        );
        let mut request = InferenceRequest::new(&model, -1);
        request
            .add_original_input("IN0", DType::Fp32, &[2, 3])
            .unwrap();
        request.prepare_for_inference().unwrap();
        assert_eq!(request.batch_size(), 0);
        let input = request.immutable_input("IN0").unwrap();
        assert_eq!(input.shape(), &[2, 3]);
        assert_eq!(input.shape_with_batch_dim(), &[2, 3]);
    }

    #[test]
    fn test_normalize_reshape_with_wildcards() {
        let model = model(
            r#"{
                "name": "reshaped",
                "inputs": [
                    { "name": "IN0", "data_type": "FP32", "dims": [-1, 4],
                      "reshape": [4, -1] }
                ]
            }"#,
        );
        let mut request = InferenceRequest::new(&model, -1);
        request
            .add_original_input("IN0", DType::Fp32, &[7, 4])
            .unwrap();
        request.prepare_for_inference().unwrap();
        let input = request.immutable_input("IN0").unwrap();
        assert_eq!(input.shape(), &[4, 7]);
    }

    #[test]
    fn test_normalize_shape_tensor_kept() {
        let model = model(
            r#"{
                "name": "shaped",
                "max_batch_size": 4,
                "inputs": [
                    { "name": "IN0", "data_type": "FP32", "dims": [3] },
                    { "name": "SHAPE", "data_type": "INT32", "dims": [2],
                      "is_shape_tensor": true }
                ]
            }"#,
        );
        let mut request = InferenceRequest::new(&model, -1);
        request
            .add_original_input("IN0", DType::Fp32, &[2, 3])
            .unwrap();
        request
            .add_original_input("SHAPE", DType::Int32, &[2])
            .unwrap();
        request.prepare_for_inference().unwrap();

        let shape_input = request.immutable_input("SHAPE").unwrap();
        assert!(shape_input.is_shape_tensor());
        assert_eq!(shape_input.shape(), &[2], "shape tensors keep their shape");
        assert_eq!(request.batch_size(), 2);
    }

    #[test]
    fn test_requested_output_unknown_rejected() {
        let model = batched_model();
        let mut request = InferenceRequest::new(&model, -1);
        request
            .add_original_input("IN0", DType::Fp32, &[2, 3])
            .unwrap();
        request.add_original_requested_output("NOPE");
        let err = request.prepare_for_inference().unwrap_err();
        assert!(format!("{err}").contains("unexpected inference output"));
    }

    #[test]
    fn test_priority_clamping() {
        let model = model(
            r#"{
                "name": "prioritized",
                "max_priority_level": 5,
                "default_priority_level": 2
            }"#,
        );
        let mut request = InferenceRequest::new(&model, -1);

        request.set_priority(0).unwrap();
        assert_eq!(request.priority(), 2);

        request.set_priority(6).unwrap();
        assert_eq!(request.priority(), 2);

        request.set_priority(3).unwrap();
        assert_eq!(request.priority(), 3);
    }

    #[test]
    fn test_override_visible_after_prepare() {
        let model = batched_model();
        let mut request = InferenceRequest::new(&model, -1);
        request
            .add_original_input("IN0", DType::Fp32, &[2, 3])
            .unwrap();
        request.prepare_for_inference().unwrap();

        let over = Arc::new(Input::new_override("CTRL", DType::Int32, &[1, 1]));
        request.add_override_input(Arc::clone(&over)).unwrap();

        let resolved = request.immutable_input("CTRL").unwrap();
        assert!(std::ptr::eq(resolved, over.as_ref()));
        assert_eq!(request.immutable_inputs().count(), 2);
    }

    #[test]
    fn test_override_cleared_by_prepare() {
        let model = batched_model();
        let mut request = InferenceRequest::new(&model, -1);
        request
            .add_original_input("IN0", DType::Fp32, &[2, 3])
            .unwrap();
        request.prepare_for_inference().unwrap();
        request
            .add_override_input(Arc::new(Input::new_override("CTRL", DType::Int32, &[1])))
            .unwrap();
        assert!(request.immutable_input("CTRL").is_ok());

        // Overrides from a previous execution are not sticky.
        request.prepare_for_inference().unwrap();
        assert!(request.immutable_input("CTRL").is_err());
        assert!(request.override_inputs().is_empty());
    }

    #[test]
    fn test_set_data_rejects_overwrite() {
        let mut input = Input::new("IN0", DType::Fp32, &[4]);
        let backing = vec![0u8; 16];
        input
            .append_data(backing.as_ptr(), 16, MemoryKind::Host, 0)
            .unwrap();
        let err = input
            .set_data(Arc::new(Memory::from(AllocatedMemory::new(
                16,
                MemoryKind::Host,
                0,
            ))))
            .unwrap_err();
        assert!(format!("{err}").contains("already has data"));
    }

    #[test]
    fn test_append_to_allocated_rejected() {
        let mut input = Input::new("IN0", DType::Fp32, &[4]);
        input
            .set_data(Arc::new(Memory::from(AllocatedMemory::new(
                16,
                MemoryKind::Host,
                0,
            ))))
            .unwrap();
        let backing = vec![0u8; 4];
        let err = input
            .append_data(backing.as_ptr(), 4, MemoryKind::Host, 0)
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Internal(_)));
    }

    #[test]
    fn test_release_hooks_lifo_then_user_callback() {
        let model = batched_model();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut request = Box::new(InferenceRequest::new(&model, -1));

        for i in 0..3 {
            let order = Arc::clone(&order);
            request.add_release_hook(move || order.lock().unwrap().push(i));
        }
        let order_cb = Arc::clone(&order);
        request.set_release_callback(move |_request, flags| {
            assert_eq!(flags, RELEASE_ALL);
            order_cb.lock().unwrap().push(99);
        });

        InferenceRequest::release(request, RELEASE_ALL);
        assert_eq!(&*order.lock().unwrap(), &[2, 1, 0, 99]);
    }

    #[test]
    fn test_trace_end_after_release_callback() {
        struct Trace(Arc<std::sync::Mutex<Vec<&'static str>>>);
        impl RequestTrace for Trace {
            fn report_request_end(&mut self) {
                self.0.lock().unwrap().push("trace_end");
            }
        }

        let model = batched_model();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut request = Box::new(InferenceRequest::new(&model, -1));
        request.set_trace(Box::new(Trace(Arc::clone(&order))));
        let order_cb = Arc::clone(&order);
        request.set_release_callback(move |_request, _flags| {
            order_cb.lock().unwrap().push("release");
        });

        InferenceRequest::release(request, RELEASE_ALL);
        assert_eq!(&*order.lock().unwrap(), &["release", "trace_end"]);
    }

    #[test]
    fn test_dropped_model_fails_prepare() {
        let model = batched_model();
        let mut request = InferenceRequest::new(&model, -1);
        request
            .add_original_input("IN0", DType::Fp32, &[2, 3])
            .unwrap();
        drop(model);
        let err = request.prepare_for_inference().unwrap_err();
        assert!(format!("{err}").contains("model no longer loaded"));
    }

    #[test]
    fn test_copy_as_null() {
        let model = model(
            r#"{
                "name": "padded",
                "max_batch_size": 4,
                "inputs": [
                    { "name": "S", "data_type": "INT32", "dims": [3],
                      "is_shape_tensor": true },
                    { "name": "A", "data_type": "FP32", "dims": [8] },
                    { "name": "B", "data_type": "FP32", "dims": [4] }
                ]
            }"#,
        );

        let mut request = InferenceRequest::new(&model, -1);
        let shape_values: [i32; 3] = [1, 2, 3];
        let shape_bytes: &[u8] = unsafe {
            std::slice::from_raw_parts(shape_values.as_ptr() as *const u8, 12)
        };
        let a_data = vec![0xAAu8; 32];
        let b_data = vec![0xBBu8; 16];

        request
            .add_original_input("S", DType::Int32, &[3])
            .unwrap()
            .append_data(shape_bytes.as_ptr(), 12, MemoryKind::Host, 0)
            .unwrap();
        request
            .add_original_input("A", DType::Fp32, &[1, 8])
            .unwrap()
            .append_data(a_data.as_ptr(), 32, MemoryKind::Host, 0)
            .unwrap();
        request
            .add_original_input("B", DType::Fp32, &[1, 4])
            .unwrap()
            .append_data(b_data.as_ptr(), 16, MemoryKind::Host, 0)
            .unwrap();
        request.prepare_for_inference().unwrap();

        let null = request.copy_as_null().unwrap();
        assert_eq!(null.batch_size(), request.batch_size());
        assert!(!null.collect_stats());
        assert!(null.original_requested_outputs().is_empty());

        // Shape tensor content is preserved bit-for-bit in a new buffer.
        let s = null.immutable_input("S").unwrap();
        let s_buffer = s.data_buffer(0).unwrap();
        assert_eq!(s_buffer.byte_size, 12);
        assert_ne!(s_buffer.ptr, shape_bytes.as_ptr());
        assert_eq!(unsafe { s_buffer.as_slice() }, shape_bytes);

        // The largest input owns a fresh slab; the smaller one references
        // a prefix of the same slab.
        let a = null.immutable_input("A").unwrap();
        let b = null.immutable_input("B").unwrap();
        assert_eq!(a.data().total_byte_size(), 32);
        assert_eq!(b.data().total_byte_size(), 16);
        assert!(a.data().as_allocated().is_some());
        let a_buffer = a.data_buffer(0).unwrap();
        let b_buffer = b.data_buffer(0).unwrap();
        assert_eq!(a_buffer.ptr, b_buffer.ptr);

        // The null allocator refuses allocations.
        let factory = null.response_factory().unwrap();
        let mut response = factory.create_response();
        assert!(response
            .add_output("OUT", DType::Fp32, vec![1], 4)
            .is_err());

        // Release deletes the request.
        InferenceRequest::release(null, RELEASE_ALL);
    }

    #[test]
    fn test_timing_capture_and_reset() {
        let model = batched_model();
        let mut request = InferenceRequest::new(&model, -1);
        request
            .add_original_input("IN0", DType::Fp32, &[1, 3])
            .unwrap();
        request.capture_request_start_ns();
        request.capture_queue_start_ns();
        assert!(request.queue_start_ns() >= request.request_start_ns());

        request.prepare_for_inference().unwrap();
        assert_eq!(request.request_start_ns(), 0);
        assert_eq!(request.queue_start_ns(), 0);
    }
}

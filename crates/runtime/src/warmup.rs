// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Warmup sample construction.
//!
//! Each warmup setting becomes one [`WarmupSample`]: a set of prebuilt
//! requests plus the slabs that back their input data. Construction is
//! two passes:
//!
//! 1. **Sizing** — find the largest zero-filled and the largest
//!    random-filled input across the setting, so one slab of each kind
//!    serves every input (random `STRING` inputs fold into the zero slab
//!    and read back as empty strings).
//! 2. **Request construction** — for each batch slot, build a request
//!    whose inputs reference slices of the shared slabs (or a file's own
//!    buffer). Control inputs that the model does not declare are
//!    attached as overrides after `prepare_for_inference`, which is the
//!    only way an override survives preparation.
//!
//! The sample owns the slabs for the life of its instance, so the raw
//! slices handed to the requests stay valid until the requests are
//! released by the warmup run.

use crate::model::Model;
use crate::request::{InferenceRequest, Input};
use crate::response::ResponseAllocator;
use crate::{InferenceResponse, RuntimeError};
use model_config::{WarmupInput, WarmupSource};
use std::sync::Arc;
use tensor_core::{dims, DType};
use tensor_memory::{AllocatedMemory, MemoryKind};

/// Directory under the model repository holding warmup data files.
const WARMUP_DATA_DIR: &str = "warmup";

/// One batched warmup fixture.
pub struct WarmupSample {
    name: String,
    requests: Vec<Box<InferenceRequest>>,
    zero_data: Arc<AllocatedMemory>,
    random_data: Arc<AllocatedMemory>,
    provided_data: Vec<Arc<AllocatedMemory>>,
}

impl WarmupSample {
    /// The sample's configured name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Requests not yet consumed by a warmup run.
    pub fn request_count(&self) -> usize {
        self.requests.len()
    }

    /// The shared zero-filled slab.
    pub fn zero_data(&self) -> &AllocatedMemory {
        &self.zero_data
    }

    /// The shared random-filled slab.
    pub fn random_data(&self) -> &AllocatedMemory {
        &self.random_data
    }

    /// File-backed buffers, one per file-sourced input per request.
    pub fn provided_data(&self) -> &[Arc<AllocatedMemory>] {
        &self.provided_data
    }

    pub(crate) fn requests_mut(&mut self) -> &mut Vec<Box<InferenceRequest>> {
        &mut self.requests
    }
}

impl std::fmt::Debug for WarmupSample {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WarmupSample")
            .field("name", &self.name)
            .field("request_count", &self.requests.len())
            .field("zero_bytes", &self.zero_data.byte_size())
            .field("random_bytes", &self.random_data.byte_size())
            .finish()
    }
}

/// Builds every warmup sample the model's configuration asks for.
pub(crate) fn generate_warmup_samples(
    model: &Arc<Model>,
) -> Result<Vec<WarmupSample>, RuntimeError> {
    let config = model.config();
    let mut samples = Vec::new();

    for setting in &config.warmup {
        if setting.batch_size == 0 {
            tracing::debug!("skipping batch 0 warmup sample '{}'", setting.name);
            continue;
        }
        tracing::debug!("generating warmup sample data for '{}'", setting.name);

        // Pass 1: size the shared synthetic slabs.
        let mut max_zero_byte_size: i64 = 0;
        let mut max_random_byte_size: i64 = 0;
        for (name, input_meta) in &setting.inputs {
            let batch_byte_size = warmup_byte_size(name, input_meta)?;
            match &input_meta.source {
                WarmupSource::ZeroData => {
                    max_zero_byte_size = max_zero_byte_size.max(batch_byte_size);
                }
                WarmupSource::RandomData => {
                    if input_meta.data_type == DType::String {
                        max_zero_byte_size = max_zero_byte_size.max(batch_byte_size);
                    } else {
                        max_random_byte_size = max_random_byte_size.max(batch_byte_size);
                    }
                }
                WarmupSource::InputDataFile(_) => {}
            }
        }

        let zero_data = Arc::new(AllocatedMemory::new(
            max_zero_byte_size as usize,
            MemoryKind::HostPinned,
            0,
        ));
        let mut random = AllocatedMemory::new(
            max_random_byte_size as usize,
            MemoryKind::HostPinned,
            0,
        );
        for byte in random.mutable_buffer() {
            *byte = rand::random::<u8>();
        }
        let random_data = Arc::new(random);

        let mut sample = WarmupSample {
            name: setting.name.clone(),
            requests: Vec::with_capacity(setting.batch_size as usize),
            zero_data: Arc::clone(&zero_data),
            random_data: Arc::clone(&random_data),
            provided_data: Vec::new(),
        };

        // Pass 2: build one request per batch slot.
        for _ in 0..setting.batch_size {
            let mut request = Box::new(InferenceRequest::new(model, model.version()));
            let mut override_inputs: Vec<Arc<Input>> = Vec::new();

            for (name, input_meta) in &setting.inputs {
                let mut batch_byte_size = warmup_byte_size(name, input_meta)?;
                let data_ptr = match &input_meta.source {
                    WarmupSource::ZeroData => zero_data.as_ptr(),
                    WarmupSource::RandomData => {
                        if input_meta.data_type == DType::String {
                            zero_data.as_ptr()
                        } else {
                            random_data.as_ptr()
                        }
                    }
                    WarmupSource::InputDataFile(file) => {
                        let path = match model.repository_path() {
                            Some(repo) => repo.join(WARMUP_DATA_DIR).join(file),
                            None => file.clone(),
                        };
                        let content = std::fs::read(&path).map_err(|e| {
                            RuntimeError::InvalidArgument(format!(
                                "failed to read warmup data file '{}': {e}",
                                path.display()
                            ))
                        })?;
                        if input_meta.data_type == DType::String {
                            batch_byte_size = content.len() as i64;
                        } else if batch_byte_size as usize > content.len() {
                            return Err(RuntimeError::InvalidArgument(format!(
                                "warmup setting expects {} bytes, but the data provided \
                                 from {} only has {} bytes",
                                batch_byte_size,
                                file.display(),
                                content.len()
                            )));
                        }
                        let provided =
                            Arc::new(AllocatedMemory::from_vec(content, MemoryKind::Host, 0));
                        let ptr = provided.as_ptr();
                        sample.provided_data.push(provided);
                        ptr
                    }
                };

                // Control inputs (absent from the model's input map)
                // become overrides; declared inputs of batching models
                // get a batch-1 leading dimension.
                let is_original_input = model.get_input(name).is_ok();
                let mut shape = Vec::with_capacity(input_meta.dims.len() + 1);
                if config.max_batch_size != 0 && is_original_input {
                    shape.push(1);
                }
                shape.extend_from_slice(&input_meta.dims);

                if is_original_input {
                    let input =
                        request.add_original_input(name, input_meta.data_type, &shape)?;
                    input.append_data(
                        data_ptr,
                        batch_byte_size as usize,
                        MemoryKind::Host,
                        0,
                    )?;
                } else {
                    let mut input = Input::new_override(name, input_meta.data_type, &shape);
                    input.append_data(
                        data_ptr,
                        batch_byte_size as usize,
                        MemoryKind::Host,
                        0,
                    )?;
                    override_inputs.push(Arc::new(input));
                }
            }

            request.prepare_for_inference()?;
            // Overrides must be attached after prepare_for_inference()
            // or the prepare pass erases them.
            for input in override_inputs {
                request.add_override_input(input)?;
            }

            request.set_response_callback(
                Arc::new(warmup_allocator()),
                warmup_response_complete,
            );

            sample.requests.push(request);
        }

        samples.push(sample);
    }

    Ok(samples)
}

/// Batch-1 byte size of a warmup input; zero-sized element types are
/// sized as if they were 32-bit.
fn warmup_byte_size(name: &str, input_meta: &WarmupInput) -> Result<i64, RuntimeError> {
    let element_count = dims::element_count(&input_meta.dims).ok_or_else(|| {
        RuntimeError::InvalidArgument(format!(
            "warmup setting expects all variable-size dimensions are specified \
             for input '{name}'"
        ))
    })?;
    let mut batch_byte_size = element_count * input_meta.data_type.element_size() as i64;
    if batch_byte_size == 0 {
        batch_byte_size = element_count * std::mem::size_of::<i32>() as i64;
    }
    Ok(batch_byte_size)
}

/// Warmup output allocations always succeed with a fresh host buffer;
/// the complete callback frees it by dropping the response.
fn warmup_allocator() -> ResponseAllocator {
    ResponseAllocator::new(|_, byte_size, _, _| {
        Ok(AllocatedMemory::new(byte_size, MemoryKind::Host, 0))
    })
}

fn warmup_response_complete(response: InferenceResponse, _flags: u32) {
    // Warmup does not check outputs for correctness; surface errors in
    // the log and drop the response.
    if let Some(err) = response.error() {
        tracing::warn!("warmup error: {err}");
    }
}

// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Per-instance runtime state and dispatch.
//!
//! A [`ModelInstance`] is one runnable copy of a model bound to a device.
//! It owns the instance's warmup samples, optionally a (possibly shared)
//! [`BackendThread`], and the opaque state the backend plugin attaches.
//! Schedulers drive it through three entry points:
//!
//! - [`ModelInstance::initialize`] — the plugin's init hook, awaited;
//! - [`ModelInstance::warm_up`] — replays the prebuilt warmup samples
//!   through the exec hook, awaited;
//! - [`ModelInstance::schedule`] — enqueues a batch and returns
//!   immediately.
//!
//! With a thread attached, all three travel as payloads through its FIFO
//! queue; without one they run inline on the caller.

use crate::backend::ExecError;
use crate::model::Model;
use crate::request::InferenceRequest;
use crate::thread::{BackendThread, Operation, Payload};
use crate::warmup::{self, WarmupSample};
use crate::RuntimeError;
use model_config::InstanceGroupKind;
use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Nice value requested for backend threads.
const BACKEND_THREAD_NICE: i32 = 5;

/// One runnable copy of a model bound to a device.
pub struct ModelInstance {
    model: Arc<Model>,
    name: String,
    index: usize,
    kind: InstanceGroupKind,
    device_id: i32,
    profiles: Vec<String>,
    passive: bool,
    warmup_samples: Mutex<Vec<WarmupSample>>,
    backend_thread: Option<Arc<BackendThread>>,
    state: Mutex<Option<Box<dyn Any + Send>>>,
}

impl ModelInstance {
    /// Materializes every instance the model's configuration asks for.
    ///
    /// One instance is created per instance-group count index, and for
    /// GPU groups per listed device. When more than one non-passive
    /// instance exists, every instance gets a backend thread; with
    /// `device_blocking` set, instances on the same device share one.
    /// Each instance has run its plugin init hook before it is returned.
    pub fn create_instances(
        model: &Arc<Model>,
        device_blocking: bool,
    ) -> Result<Vec<Arc<ModelInstance>>, RuntimeError> {
        // Backend threads are only worth their overhead when instances
        // can actually run concurrently.
        let mut active_count = 0u32;
        let mut use_backend_threads = false;
        for group in &model.config().instance_groups {
            if !group.passive {
                active_count += group.count;
                if active_count > 1 {
                    use_backend_threads = true;
                    break;
                }
            }
        }

        let mut device_to_thread_map: HashMap<i32, Arc<BackendThread>> = HashMap::new();
        let mut instances = Vec::new();

        for group in &model.config().instance_groups {
            for c in 0..group.count {
                let instance_name = if group.count > 1 {
                    format!("{}_{}", group.name, c)
                } else {
                    group.name.clone()
                };
                match group.kind {
                    InstanceGroupKind::Cpu | InstanceGroupKind::Model => {
                        instances.push(Self::create_instance(
                            model,
                            &instance_name,
                            c as usize,
                            group.kind,
                            0,
                            &group.profiles,
                            group.passive,
                            use_backend_threads,
                            device_blocking,
                            &mut device_to_thread_map,
                        )?);
                    }
                    InstanceGroupKind::Gpu => {
                        for &device_id in &group.gpus {
                            instances.push(Self::create_instance(
                                model,
                                &instance_name,
                                c as usize,
                                group.kind,
                                device_id,
                                &group.profiles,
                                group.passive,
                                use_backend_threads,
                                device_blocking,
                                &mut device_to_thread_map,
                            )?);
                        }
                    }
                }
            }
        }

        Ok(instances)
    }

    #[allow(clippy::too_many_arguments)]
    fn create_instance(
        model: &Arc<Model>,
        name: &str,
        index: usize,
        kind: InstanceGroupKind,
        device_id: i32,
        profiles: &[String],
        passive: bool,
        use_backend_threads: bool,
        device_blocking: bool,
        device_to_thread_map: &mut HashMap<i32, Arc<BackendThread>>,
    ) -> Result<Arc<ModelInstance>, RuntimeError> {
        let backend_thread = if use_backend_threads {
            Some(Self::backend_thread_for(
                name,
                device_id,
                device_blocking,
                device_to_thread_map,
            )?)
        } else {
            None
        };

        let warmup_samples = warmup::generate_warmup_samples(model)?;

        let instance = Arc::new(ModelInstance {
            model: Arc::clone(model),
            name: name.to_string(),
            index,
            kind,
            device_id,
            profiles: profiles.to_vec(),
            passive,
            warmup_samples: Mutex::new(warmup_samples),
            backend_thread,
            state: Mutex::new(None),
        });

        instance.initialize()?;

        Ok(instance)
    }

    fn backend_thread_for(
        name: &str,
        device_id: i32,
        device_blocking: bool,
        device_to_thread_map: &mut HashMap<i32, Arc<BackendThread>>,
    ) -> Result<Arc<BackendThread>, RuntimeError> {
        if device_blocking {
            if let Some(thread) = device_to_thread_map.get(&device_id) {
                tracing::debug!(
                    "using already started backend thread for '{}' on device {}",
                    name,
                    device_id,
                );
                return Ok(Arc::clone(thread));
            }
        }
        let thread = BackendThread::spawn(name, BACKEND_THREAD_NICE, device_id)?;
        device_to_thread_map.insert(device_id, Arc::clone(&thread));
        Ok(thread)
    }

    /// The model this instance serves.
    pub fn model(&self) -> &Arc<Model> {
        &self.model
    }

    /// Instance name, derived from its group.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Index of this instance within its group.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Device kind the instance binds to.
    pub fn kind(&self) -> InstanceGroupKind {
        self.kind
    }

    /// Bound device id; 0 for CPU and model-managed instances.
    pub fn device_id(&self) -> i32 {
        self.device_id
    }

    /// Backend-specific profile names.
    pub fn profiles(&self) -> &[String] {
        &self.profiles
    }

    /// Passive instances are never scheduled by the runtime.
    pub fn is_passive(&self) -> bool {
        self.passive
    }

    /// The attached backend thread, if any.
    pub fn backend_thread(&self) -> Option<&Arc<BackendThread>> {
        self.backend_thread.as_ref()
    }

    /// Attaches plugin-owned state to this instance.
    pub fn set_state(&self, state: Box<dyn Any + Send>) {
        if let Ok(mut slot) = self.state.lock() {
            *slot = Some(state);
        }
    }

    /// Removes and returns the plugin-owned state.
    pub fn take_state(&self) -> Option<Box<dyn Any + Send>> {
        self.state.lock().ok().and_then(|mut slot| slot.take())
    }

    /// Runs the plugin's init hook, through the backend thread when one
    /// is attached. Synchronous from the caller's point of view.
    pub fn initialize(self: &Arc<Self>) -> Result<(), RuntimeError> {
        match &self.backend_thread {
            Some(thread) => {
                let (payload, status) = Payload::new(Operation::Init, Arc::clone(self));
                if let Err(payload) = thread.enqueue(payload) {
                    payload.fail(queue_shut_down());
                }
                status.wait()
            }
            None => self.initialize_func(),
        }
    }

    /// Replays the prebuilt warmup samples through the exec hook, through
    /// the backend thread when one is attached. Synchronous from the
    /// caller's point of view.
    pub fn warm_up(self: &Arc<Self>) -> Result<(), RuntimeError> {
        match &self.backend_thread {
            Some(thread) => {
                let (payload, status) = Payload::new(Operation::WarmUp, Arc::clone(self));
                if let Err(payload) = thread.enqueue(payload) {
                    payload.fail(queue_shut_down());
                }
                status.wait()
            }
            None => self.warm_up_func(),
        }
    }

    /// Enqueues a batch for execution and returns immediately.
    /// `on_completion` runs after the plugin's exec hook returns. Without
    /// an attached thread the batch executes inline on the caller.
    pub fn schedule(
        self: &Arc<Self>,
        requests: Vec<Box<InferenceRequest>>,
        on_completion: Box<dyn FnOnce() + Send>,
    ) {
        match &self.backend_thread {
            Some(thread) => {
                let (payload, _status) =
                    Payload::infer_run(Arc::clone(self), requests, on_completion);
                if let Err(payload) = thread.enqueue(payload) {
                    payload.fail(queue_shut_down());
                }
            }
            None => self.schedule_func(requests, on_completion),
        }
    }

    pub(crate) fn initialize_func(&self) -> Result<(), RuntimeError> {
        self.model.backend().instance_init(self)
    }

    pub(crate) fn warm_up_func(&self) -> Result<(), RuntimeError> {
        let mut samples = self
            .warmup_samples
            .lock()
            .map_err(|_| RuntimeError::Internal("warmup sample lock poisoned".to_string()))?;

        for sample in samples.iter_mut() {
            // Requests move into the exec path once; a sample that has
            // already run is empty.
            let requests = std::mem::take(sample.requests_mut());
            if requests.is_empty() {
                continue;
            }

            tracing::debug!(
                "model '{}' instance '{}' is running warmup sample '{}'",
                self.model.name(),
                self.name,
                sample.name(),
            );

            let (signal_tx, signal_rx) = std::sync::mpsc::channel();
            let mut first_request = true;
            let mut prepared = Vec::with_capacity(requests.len());
            for mut request in requests {
                let signal = if first_request {
                    Some(signal_tx.clone())
                } else {
                    None
                };
                first_request = false;
                request.set_release_callback(move |request, flags| {
                    drop(request);
                    if flags & crate::request::RELEASE_ALL != 0 {
                        if let Some(signal) = signal {
                            let _ = signal.send(());
                        }
                    }
                });
                // Capture timestamps before the run so sequential warmup
                // runs do not accumulate into each other.
                request.capture_request_start_ns();
                request.capture_queue_start_ns();
                prepared.push(request);
            }
            drop(signal_tx);

            self.execute(prepared);

            signal_rx.recv().map_err(|_| {
                RuntimeError::Internal(format!(
                    "warmup sample '{}' finished without releasing its requests",
                    sample.name(),
                ))
            })?;
        }

        Ok(())
    }

    pub(crate) fn schedule_func(
        &self,
        requests: Vec<Box<InferenceRequest>>,
        on_completion: Box<dyn FnOnce() + Send>,
    ) {
        self.execute(requests);
        on_completion();
    }

    /// Hands a batch to the plugin's exec hook. On failure the instance
    /// keeps ownership: every returned request gets one error response
    /// and its release.
    fn execute(&self, requests: Vec<Box<InferenceRequest>>) {
        if let Err(ExecError { status, requests }) =
            self.model.backend().instance_exec(self, requests)
        {
            let _ = InferenceRequest::respond_all_if_error(requests, &status, true);
        }
    }
}

fn queue_shut_down() -> RuntimeError {
    RuntimeError::Unavailable("backend thread queue is shut down".to_string())
}

impl Drop for ModelInstance {
    fn drop(&mut self) {
        // Finalization is optional; failure is logged, not fatal.
        if let Err(e) = self.model.backend().instance_fini(self) {
            tracing::error!("failed finalizing model instance '{}': {e}", self.name);
        }
    }
}

impl std::fmt::Debug for ModelInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelInstance")
            .field("name", &self.name)
            .field("index", &self.index)
            .field("kind", &self.kind)
            .field("device_id", &self.device_id)
            .field("passive", &self.passive)
            .field("has_backend_thread", &self.backend_thread.is_some())
            .finish()
    }
}

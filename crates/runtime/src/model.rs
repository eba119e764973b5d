// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! The per-model container: configuration, I/O maps, labels, and the
//! scheduler seam.
//!
//! A [`Model`] is the loaded in-process representation of one model. It
//! owns the validated configuration, name-keyed input/output maps used by
//! request normalization, a [`LabelProvider`], and the handle to the
//! backend plugin serving it. Requests reach execution through
//! [`Model::enqueue`], which forwards to the [`Scheduler`] installed by
//! the (out-of-scope) batching layer above this core.

use crate::backend::Backend;
use crate::request::InferenceRequest;
use crate::RuntimeError;
use model_config::{LabelProvider, ModelConfig, ModelInput, ModelOutput};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

/// A scheduling failure; ownership of the request returns to the caller.
#[derive(Debug)]
pub struct ScheduleError {
    /// Why scheduling failed.
    pub status: RuntimeError,
    /// The request that was not scheduled.
    pub request: Box<InferenceRequest>,
}

/// The seam to the batching layer above this core.
///
/// The dynamic and sequence batchers live behind this trait; the core
/// only requires that an enqueue either takes ownership or hands the
/// request back inside [`ScheduleError`].
pub trait Scheduler: Send + Sync {
    /// Accepts a request for eventual dispatch to an instance.
    fn enqueue(&self, request: Box<InferenceRequest>) -> Result<(), ScheduleError>;
}

/// The loaded in-process representation of one model.
pub struct Model {
    config: ModelConfig,
    version: i64,
    input_map: HashMap<String, ModelInput>,
    output_map: HashMap<String, ModelOutput>,
    label_provider: Arc<LabelProvider>,
    repository_path: Option<PathBuf>,
    backend: Arc<dyn Backend>,
    scheduler: OnceLock<Arc<dyn Scheduler>>,
}

impl Model {
    /// Creates a model from a configuration and a backend plugin.
    ///
    /// The configuration is validated here; label files are not loaded
    /// because no repository path is known. Use
    /// [`Model::with_repository_path`] for repository-backed models.
    pub fn new(
        config: ModelConfig,
        version: i64,
        backend: Arc<dyn Backend>,
    ) -> Result<Arc<Self>, RuntimeError> {
        Self::build(config, version, backend, None)
    }

    /// Creates a model whose warmup data files and label files resolve
    /// against `repository_path`.
    pub fn with_repository_path(
        config: ModelConfig,
        version: i64,
        backend: Arc<dyn Backend>,
        repository_path: PathBuf,
    ) -> Result<Arc<Self>, RuntimeError> {
        Self::build(config, version, backend, Some(repository_path))
    }

    fn build(
        config: ModelConfig,
        version: i64,
        backend: Arc<dyn Backend>,
        repository_path: Option<PathBuf>,
    ) -> Result<Arc<Self>, RuntimeError> {
        config.validate()?;

        let label_provider = match &repository_path {
            Some(path) => Arc::new(LabelProvider::from_config(&config, path)?),
            None => Arc::new(LabelProvider::new()),
        };

        let mut input_map = HashMap::with_capacity(config.inputs.len());
        for input in &config.inputs {
            input_map.insert(input.name.clone(), input.clone());
        }
        let mut output_map = HashMap::with_capacity(config.outputs.len());
        for output in &config.outputs {
            output_map.insert(output.name.clone(), output.clone());
        }

        tracing::info!(
            "created model '{}' version {} ({} inputs, {} outputs)",
            config.name,
            version,
            input_map.len(),
            output_map.len(),
        );

        Ok(Arc::new(Self {
            config,
            version,
            input_map,
            output_map,
            label_provider,
            repository_path,
            backend,
            scheduler: OnceLock::new(),
        }))
    }

    /// Name of the model being served.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Version of the model being served.
    pub fn version(&self) -> i64 {
        self.version
    }

    /// The validated configuration.
    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Maximum runtime-managed batch size; 0 disables batching.
    pub fn max_batch_size(&self) -> u32 {
        self.config.max_batch_size
    }

    /// Highest priority level a request may carry.
    pub fn max_priority_level(&self) -> u32 {
        self.config.max_priority_level
    }

    /// Priority stored for out-of-range requests.
    pub fn default_priority_level(&self) -> u32 {
        self.config.default_priority_level
    }

    /// The label provider for this model's outputs.
    pub fn label_provider(&self) -> &Arc<LabelProvider> {
        &self.label_provider
    }

    /// The model repository directory, when known.
    pub fn repository_path(&self) -> Option<&Path> {
        self.repository_path.as_deref()
    }

    /// The backend plugin serving this model.
    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// The declared configuration for a named input.
    pub fn get_input(&self, name: &str) -> Result<&ModelInput, RuntimeError> {
        self.input_map.get(name).ok_or_else(|| {
            RuntimeError::InvalidArgument(format!(
                "unexpected inference input '{}' for model '{}'",
                name,
                self.name()
            ))
        })
    }

    /// The declared configuration for a named output.
    pub fn get_output(&self, name: &str) -> Result<&ModelOutput, RuntimeError> {
        self.output_map.get(name).ok_or_else(|| {
            RuntimeError::InvalidArgument(format!(
                "unexpected inference output '{}' for model '{}'",
                name,
                self.name()
            ))
        })
    }

    /// Installs the scheduler. May be called once.
    pub fn set_scheduler(&self, scheduler: Arc<dyn Scheduler>) -> Result<(), RuntimeError> {
        self.scheduler.set(scheduler).map_err(|_| {
            RuntimeError::Internal(format!(
                "attempt to change scheduler not allowed for model '{}'",
                self.name()
            ))
        })
    }

    /// Hands a request to the scheduler.
    pub fn enqueue(&self, request: Box<InferenceRequest>) -> Result<(), ScheduleError> {
        match self.scheduler.get() {
            Some(scheduler) => scheduler.enqueue(request),
            None => Err(ScheduleError {
                status: RuntimeError::Internal(format!(
                    "no scheduler configured for model '{}'",
                    self.name()
                )),
                request,
            }),
        }
    }
}

impl std::fmt::Debug for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Model")
            .field("name", &self.config.name)
            .field("version", &self.version)
            .field("max_batch_size", &self.config.max_batch_size)
            .field("inputs", &self.input_map.len())
            .field("outputs", &self.output_map.len())
            .field("has_scheduler", &self.scheduler.get().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ExecError;
    use crate::instance::ModelInstance;

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

    fn test_model() -> Arc<Model> {
        let config = ModelConfig::from_json(
            r#"{
                "name": "lookup",
                "max_batch_size": 2,
                "inputs": [
                    { "name": "IN0", "data_type": "FP32", "dims": [4] }
                ],
                "outputs": [
                    { "name": "OUT0", "data_type": "FP32", "dims": [4] }
                ]
            }"#,
        )
        .unwrap();
        Model::new(config, 3, Arc::new(NoopBackend)).unwrap()
    }

    #[test]
    fn test_accessors() {
        let model = test_model();
        assert_eq!(model.name(), "lookup");
        assert_eq!(model.version(), 3);
        assert_eq!(model.max_batch_size(), 2);
        assert!(model.repository_path().is_none());
    }

    #[test]
    fn test_io_lookup() {
        let model = test_model();
        assert_eq!(model.get_input("IN0").unwrap().name, "IN0");
        assert_eq!(model.get_output("OUT0").unwrap().name, "OUT0");

        let err = model.get_input("NOPE").unwrap_err();
        assert!(format!("{err}").contains("unexpected inference input 'NOPE'"));
        let err = model.get_output("NOPE").unwrap_err();
        assert!(format!("{err}").contains("unexpected inference output 'NOPE'"));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = ModelConfig::from_json(
            r#"{
                "name": "dup",
                "inputs": [
                    { "name": "A", "data_type": "FP32", "dims": [1] },
                    { "name": "A", "data_type": "FP32", "dims": [1] }
                ]
            }"#,
        )
        .unwrap();
        let err = Model::new(config, 1, Arc::new(NoopBackend)).unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidArgument(_)));
    }

    #[test]
    fn test_scheduler_set_once() {
        struct Discard;
        impl Scheduler for Discard {
            fn enqueue(&self, _request: Box<InferenceRequest>) -> Result<(), ScheduleError> {
                Ok(())
            }
        }

        let model = test_model();
        model.set_scheduler(Arc::new(Discard)).unwrap();
        let err = model.set_scheduler(Arc::new(Discard)).unwrap_err();
        assert!(format!("{err}").contains("attempt to change scheduler"));
    }

    #[test]
    fn test_enqueue_without_scheduler() {
        let model = test_model();
        let request = Box::new(InferenceRequest::new(&model, -1));
        let err = Model::enqueue(&model, request).unwrap_err();
        assert!(format!("{}", err.status).contains("no scheduler configured"));
        // The request comes back with the error.
        assert_eq!(err.request.actual_version(), 3);
    }

    #[test]
    fn test_enqueue_through_scheduler() {
        use std::sync::Mutex;

        struct Recording(Mutex<usize>);
        impl Scheduler for Recording {
            fn enqueue(&self, _request: Box<InferenceRequest>) -> Result<(), ScheduleError> {
                *self.0.lock().unwrap() += 1;
                Ok(())
            }
        }

        let model = test_model();
        let scheduler = Arc::new(Recording(Mutex::new(0)));
        model
            .set_scheduler(Arc::clone(&scheduler) as Arc<dyn Scheduler>)
            .unwrap();

        let request = Box::new(InferenceRequest::new(&model, -1));
        InferenceRequest::run(request).unwrap();
        assert_eq!(*scheduler.0.lock().unwrap(), 1);
    }
}

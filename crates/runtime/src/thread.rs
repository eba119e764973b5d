// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! The per-instance worker thread and its typed work queue.
//!
//! A [`BackendThread`] is one OS thread consuming [`Payload`]s from an
//! unbounded FIFO channel, running each to completion and answering its
//! status channel before taking the next. With device blocking enabled,
//! all instances on one device share a single thread so device state is
//! only ever touched serially; otherwise each instance owns its thread.
//!
//! Shutdown is cooperative: an [`Operation::Exit`] payload finishes the
//! current item and then ends the loop. Dropping the thread handle
//! enqueues `Exit` and joins.

use crate::instance::ModelInstance;
use crate::request::InferenceRequest;
use crate::RuntimeError;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

/// What a payload asks the thread to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Run the plugin's instance-init hook.
    Init,
    /// Run the instance's warmup samples.
    WarmUp,
    /// Execute a batch of requests.
    InferRun,
    /// Finish the current payload and stop the thread.
    Exit,
}

type Status = Result<(), RuntimeError>;
type CompletionFn = Box<dyn FnOnce() + Send>;

/// The receiving half of a payload's single-use status channel.
pub struct PayloadStatus {
    rx: mpsc::Receiver<Status>,
}

impl PayloadStatus {
    /// Blocks until the payload has run and returns its status.
    pub fn wait(self) -> Status {
        match self.rx.recv() {
            Ok(status) => status,
            Err(_) => Err(RuntimeError::Internal(
                "payload dropped before reporting a status".to_string(),
            )),
        }
    }
}

/// One unit of work carried through a backend thread's queue.
pub struct Payload {
    op: Operation,
    instance: Option<Arc<ModelInstance>>,
    requests: Vec<Box<InferenceRequest>>,
    on_completion: Option<CompletionFn>,
    status_tx: mpsc::Sender<Status>,
}

impl Payload {
    /// Creates an `Init` or `WarmUp` payload for `instance`.
    pub fn new(op: Operation, instance: Arc<ModelInstance>) -> (Self, PayloadStatus) {
        let (status_tx, rx) = mpsc::channel();
        (
            Self {
                op,
                instance: Some(instance),
                requests: Vec::new(),
                on_completion: None,
                status_tx,
            },
            PayloadStatus { rx },
        )
    }

    /// Creates an `InferRun` payload carrying `requests`.
    pub fn infer_run(
        instance: Arc<ModelInstance>,
        requests: Vec<Box<InferenceRequest>>,
        on_completion: CompletionFn,
    ) -> (Self, PayloadStatus) {
        let (status_tx, rx) = mpsc::channel();
        (
            Self {
                op: Operation::InferRun,
                instance: Some(instance),
                requests,
                on_completion: Some(on_completion),
                status_tx,
            },
            PayloadStatus { rx },
        )
    }

    pub(crate) fn exit() -> (Self, PayloadStatus) {
        let (status_tx, rx) = mpsc::channel();
        (
            Self {
                op: Operation::Exit,
                instance: None,
                requests: Vec::new(),
                on_completion: None,
                status_tx,
            },
            PayloadStatus { rx },
        )
    }

    /// The operation this payload carries.
    pub fn operation(&self) -> Operation {
        self.op
    }

    /// Runs the payload and answers its status channel. Returns `true`
    /// when the thread should exit.
    pub(crate) fn execute(mut self) -> bool {
        let status = match self.op {
            Operation::Exit => {
                let _ = self.status_tx.send(Ok(()));
                return true;
            }
            Operation::InferRun => match self.instance.take() {
                Some(instance) => {
                    let requests = std::mem::take(&mut self.requests);
                    let on_completion = self
                        .on_completion
                        .take()
                        .unwrap_or_else(|| Box::new(|| {}));
                    instance.schedule_func(requests, on_completion);
                    Ok(())
                }
                None => Err(RuntimeError::Internal(
                    "infer payload carries no instance".to_string(),
                )),
            },
            Operation::Init => match self.instance.take() {
                Some(instance) => instance.initialize_func(),
                None => Err(RuntimeError::Internal(
                    "init payload carries no instance".to_string(),
                )),
            },
            Operation::WarmUp => match self.instance.take() {
                Some(instance) => instance.warm_up_func(),
                None => Err(RuntimeError::Internal(
                    "warmup payload carries no instance".to_string(),
                )),
            },
        };
        let _ = self.status_tx.send(status);
        false
    }

    /// Fails the payload without running it: responds to and releases any
    /// carried requests, runs the completion callback, and answers the
    /// status channel with `status`.
    pub(crate) fn fail(mut self, status: RuntimeError) {
        let requests = std::mem::take(&mut self.requests);
        if !requests.is_empty() {
            let _ = InferenceRequest::respond_all_if_error(requests, &status, true);
        }
        if let Some(on_completion) = self.on_completion.take() {
            on_completion();
        }
        let _ = self.status_tx.send(Err(status));
    }
}

impl std::fmt::Debug for Payload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Payload")
            .field("op", &self.op)
            .field("request_count", &self.requests.len())
            .finish()
    }
}

/// A dedicated OS thread serving one device or one instance.
pub struct BackendThread {
    name: String,
    device_id: i32,
    sender: mpsc::Sender<Payload>,
    join_handle: Mutex<Option<JoinHandle<()>>>,
}

impl BackendThread {
    /// Starts a backend thread.
    ///
    /// The thread tries to lower itself to `nice`; failure is logged and
    /// ignored.
    pub fn spawn(name: &str, nice: i32, device_id: i32) -> Result<Arc<Self>, RuntimeError> {
        let (sender, receiver) = mpsc::channel();
        let thread_name = name.to_string();
        let join_handle = std::thread::Builder::new()
            .name(format!("backend-{name}"))
            .spawn(move || backend_thread_main(thread_name, nice, device_id, receiver))
            .map_err(|e| {
                RuntimeError::Internal(format!("failed to start backend thread for '{name}': {e}"))
            })?;

        Ok(Arc::new(Self {
            name: name.to_string(),
            device_id,
            sender,
            join_handle: Mutex::new(Some(join_handle)),
        }))
    }

    /// The name the thread was created under.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The device this thread serves.
    pub fn device_id(&self) -> i32 {
        self.device_id
    }

    /// Enqueues a payload. After shutdown the payload comes back so the
    /// caller can fail it through its status channel.
    pub fn enqueue(&self, payload: Payload) -> Result<(), Payload> {
        self.sender.send(payload).map_err(|e| e.0)
    }
}

impl Drop for BackendThread {
    fn drop(&mut self) {
        // Signal the thread to exit, then wait for it.
        let (payload, _status) = Payload::exit();
        let _ = self.sender.send(payload);
        if let Ok(mut handle) = self.join_handle.lock() {
            if let Some(handle) = handle.take() {
                let _ = handle.join();
            }
        }
    }
}

impl std::fmt::Debug for BackendThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendThread")
            .field("name", &self.name)
            .field("device_id", &self.device_id)
            .finish()
    }
}

fn backend_thread_main(
    name: String,
    nice: i32,
    device_id: i32,
    receiver: mpsc::Receiver<Payload>,
) {
    if try_set_nice(nice) {
        tracing::debug!(
            "starting backend thread for '{}' at nice {} on device {}",
            name,
            nice,
            device_id,
        );
    } else {
        tracing::debug!(
            "starting backend thread for '{}' at default nice (requested nice {} failed) \
             on device {}",
            name,
            nice,
            device_id,
        );
    }

    while let Ok(payload) = receiver.recv() {
        if payload.execute() {
            break;
        }
    }

    tracing::debug!("stopping backend thread for '{}'", name);
}

/// Applies `nice` to the calling thread only (`PRIO_PROCESS` + tid).
#[cfg(target_os = "linux")]
fn try_set_nice(nice: i32) -> bool {
    unsafe {
        let tid = libc::syscall(libc::SYS_gettid) as libc::id_t;
        libc::setpriority(libc::PRIO_PROCESS, tid, nice) == 0
    }
}

#[cfg(not(target_os = "linux"))]
fn try_set_nice(_nice: i32) -> bool {
    false
}

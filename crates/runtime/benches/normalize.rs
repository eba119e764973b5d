// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Benchmarks for request normalization.

use criterion::{criterion_group, criterion_main, Criterion};
use model_config::ModelConfig;
use runtime::{Backend, ExecError, InferenceRequest, Model, ModelInstance};
use std::sync::Arc;
use tensor_core::DType;

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

fn bench_model() -> Arc<Model> {
    let config = ModelConfig::from_json(
        r#"{
            "name": "bench",
            "max_batch_size": 64,
            "inputs": [
                { "name": "IN0", "data_type": "FP32", "dims": [3, 224, 224] },
                { "name": "IN1", "data_type": "INT32", "dims": [-1, 4],
                  "reshape": [4, -1] },
                { "name": "IN2", "data_type": "FP16", "dims": [128] }
            ],
            "outputs": [
                { "name": "OUT0", "data_type": "FP32", "dims": [1000] }
            ]
        }"#,
    )
    .unwrap();
    Model::new(config, 1, Arc::new(NoopBackend)).unwrap()
}

fn bench_prepare_for_inference(c: &mut Criterion) {
    let model = bench_model();

    c.bench_function("prepare_for_inference", |b| {
        b.iter(|| {
            let mut request = InferenceRequest::new(&model, -1);
            request
                .add_original_input("IN0", DType::Fp32, &[8, 3, 224, 224])
                .unwrap();
            request
                .add_original_input("IN1", DType::Int32, &[8, 7, 4])
                .unwrap();
            request
                .add_original_input("IN2", DType::Fp16, &[8, 128])
                .unwrap();
            request.prepare_for_inference().unwrap();
            request
        })
    });

    c.bench_function("prepare_for_inference_idempotent", |b| {
        let mut request = InferenceRequest::new(&model, -1);
        request
            .add_original_input("IN0", DType::Fp32, &[8, 3, 224, 224])
            .unwrap();
        request
            .add_original_input("IN1", DType::Int32, &[8, 7, 4])
            .unwrap();
        request
            .add_original_input("IN2", DType::Fp16, &[8, 128])
            .unwrap();
        request.prepare_for_inference().unwrap();

        // Re-preparing an unchanged request skips normalization.
        b.iter(|| request.prepare_for_inference().unwrap())
    });
}

criterion_group!(benches, bench_prepare_for_inference);
criterion_main!(benches);

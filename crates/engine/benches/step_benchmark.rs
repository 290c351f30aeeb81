use batchcore_common::config::LoraConfig;
use batchcore_engine::{
    prepare_step, BatchAssembler, LoraBundle, LoraModule, LoraRegistry, LoraWeights, StepRequest,
    NO_LORA,
};
use candle_core::{DType, Device, Tensor};
use criterion::{black_box, criterion_group, criterion_main, Criterion};

const LAYERS: usize = 32;

fn mixed_requests(context: usize, decode: usize) -> Vec<StepRequest> {
    let mut requests: Vec<_> = (0..context)
        .map(|i| StepRequest::context(vec![1; 16 + (i * 37) % 240]))
        .collect();
    requests.extend((0..decode).map(|i| StepRequest::decode(2, 100 + i * 13)));
    requests
}

fn registry(adapters: i64) -> LoraRegistry {
    let registry = LoraRegistry::new(LoraConfig::with_layers(LAYERS));
    for id in 0..adapters {
        let mut builder = LoraBundle::builder(LAYERS);
        for layer in 0..LAYERS {
            for module in [LoraModule::AttnQkv, LoraModule::FfnW1] {
                let a = Tensor::zeros((64, 8), DType::F32, &Device::Cpu).unwrap();
                let b = Tensor::zeros((8, 64), DType::F32, &Device::Cpu).unwrap();
                builder = builder.insert(layer, module, LoraWeights::new(a, b)).unwrap();
            }
        }
        registry.add(id, builder.build()).unwrap();
    }
    registry
}

fn bench_assemble(c: &mut Criterion) {
    let assembler = BatchAssembler::default();
    let requests = mixed_requests(16, 112);

    c.bench_function("assemble_16_context_112_decode", |b| {
        b.iter(|| assembler.assemble(black_box(&requests)).unwrap())
    });
}

fn bench_resolve(c: &mut Criterion) {
    let registry = registry(4);
    let ids: Vec<i64> = (0..128).map(|i| if i % 3 == 0 { NO_LORA } else { i % 5 }).collect();
    let lengths = vec![1; ids.len()];

    c.bench_function("resolve_128_slots_32_layers", |b| {
        b.iter(|| registry.resolve(black_box(&ids), black_box(&lengths)).unwrap())
    });
}

fn bench_prepare_step(c: &mut Criterion) {
    let assembler = BatchAssembler::default();
    let registry = registry(4);
    let requests = mixed_requests(8, 56);
    let ids: Vec<i64> = (0..requests.len() as i64).map(|i| i % 4).collect();

    c.bench_function("prepare_step_64_requests", |b| {
        b.iter(|| prepare_step(&assembler, &registry, black_box(&requests), &ids).unwrap())
    });
}

criterion_group!(benches, bench_assemble, bench_resolve, bench_prepare_step);
criterion_main!(benches);

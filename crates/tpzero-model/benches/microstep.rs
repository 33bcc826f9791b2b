//! Benchmark for one forward/backward microstep

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use tpzero_model::{build_model, Batch, CausalLm, LlamaConfig, ModelOverrides, Placement};

fn bench_microstep(c: &mut Criterion) {
    let config = LlamaConfig {
        vocab_size: 256,
        hidden_size: 64,
        num_hidden_layers: 2,
        max_position_embeddings: 512,
        ..Default::default()
    };
    let mut model = build_model(config, &ModelOverrides::default(), &Placement::default()).unwrap();

    let mut group = c.benchmark_group("microstep");
    for seq_len in [16usize, 64, 128] {
        let ids: Vec<u32> = (0..seq_len as u32).map(|t| t % 256).collect();
        let batch = Batch::from_input_ids(vec![ids; 2]);
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("seq_len_{seq_len}")),
            &batch,
            |b, batch| {
                b.iter(|| {
                    let _ = black_box(model.forward_backward(black_box(batch), 1.0).unwrap());
                });
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_microstep);
criterion_main!(benches);

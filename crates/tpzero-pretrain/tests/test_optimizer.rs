//! Dense and ZeRO-1 AdamW must agree on the same gradients

use tpzero_dist::{CommError, LocalCluster, ParallelLayout};
use tpzero_model::{ParallelRole, ParamRegistry, Parameter, Precision};
use tpzero_pretrain::grads::{bucket_allreduce_gradients, clip_grad_norm, MAX_GRAD_NORM};
use tpzero_pretrain::optimizer::{
    build_optimizer, AdamW, AdamWConfig, Optimizer, OptimizerError, Zero1AdamW,
};

/// 11 elements, so the flat space needs padding to split over two ranks.
fn registry(rank: usize) -> ParamRegistry {
    let mut params = ParamRegistry::new();
    let specs = [
        ("mlp.proj.weight", vec![2, 3], ParallelRole::Replicated),
        ("lm_head.bias", vec![2], ParallelRole::Replicated),
        ("input_norm.weight", vec![3], ParallelRole::SequenceParallel),
    ];
    for (k, (name, shape, role)) in specs.into_iter().enumerate() {
        let n: usize = shape.iter().product();
        let data: Vec<f32> = (0..n).map(|i| 0.5 - 0.1 * (i + k) as f32).collect();
        let mut param = Parameter::new(name, shape, data, role).unwrap();
        for (i, g) in param.grad.iter_mut().enumerate() {
            *g = (rank as f32 + 1.0) * (0.3 + 0.2 * i as f32) * if k % 2 == 0 { 1.0 } else { -1.0 };
        }
        params.register(param).unwrap();
    }
    params
}

#[test]
fn test_zero_1_matches_dense_update() {
    let layout = ParallelLayout::new(2, 1).unwrap();
    let config = AdamWConfig {
        lr: 0.05,
        ..Default::default()
    };

    let results = LocalCluster::launch(layout, |parallel| {
        let mut dense_params = registry(parallel.global_rank());
        let mut zero_params = dense_params.clone();

        // Small buckets force the reduction to span several collectives.
        bucket_allreduce_gradients(&mut dense_params, parallel.dp_group(), 4)?;
        let norm = clip_grad_norm(&mut dense_params, MAX_GRAD_NORM);
        assert!(norm > MAX_GRAD_NORM, "gradients should be clipped, norm {norm}");
        let mut dense = AdamW::new(&dense_params, config, Precision::Fp32);
        dense.step(&mut dense_params, &parallel)?;

        let mut zero = Zero1AdamW::new(
            &zero_params,
            config,
            Precision::Fp32,
            parallel.dp_rank(),
            parallel.dp_size(),
        );
        assert_eq!(zero.shard_len(), 6);
        zero.step(&mut zero_params, &parallel)?;
        assert_eq!(zero.save_shard().exp_avg.len(), 6);

        Ok::<_, OptimizerError>((dense_params.flatten_data(), zero_params.flatten_data()))
    })
    .expect("optimizer step failed");

    for (dense, zero) in &results {
        assert_eq!(dense.len(), 11);
        for (d, z) in dense.iter().zip(zero) {
            assert!((d - z).abs() < 1e-6, "dense {d} vs zero-1 {z}");
        }
    }
    // Every rank ends with the same replicated parameters.
    assert_eq!(results[0].1, results[1].1);
}

#[test]
fn test_build_optimizer_selects_variant() {
    let layout = ParallelLayout::new(2, 2).unwrap();
    let described = LocalCluster::launch(layout, |parallel| {
        let params = registry(0);
        let dense = build_optimizer(&params, 1e-3, Precision::Bf16, false, &parallel);
        let zero = build_optimizer(&params, 1e-3, Precision::MixedBf16, true, &parallel);
        assert!(!dense.is_sharded());
        assert!(zero.is_sharded());
        Ok::<_, CommError>((dense.describe(), zero.describe(), zero.lr()))
    })
    .unwrap();

    let (dense, zero, lr) = &described[0];
    assert!(dense.starts_with("AdamW ("));
    assert!(zero.contains("AdamW_FP32OptimParams"));
    assert_eq!(*lr, 1e-3);
}

#[test]
fn test_bf16_parameters_stay_representable() {
    use tpzero_dist::ParallelState;
    use tpzero_model::round_to_bf16;

    let mut params = registry(0);
    let mut opt = AdamW::new(&params, AdamWConfig::default(), Precision::Bf16);
    opt.step(&mut params, &ParallelState::single()).unwrap();
    for value in params.flatten_data() {
        assert_eq!(value, round_to_bf16(value));
    }
}

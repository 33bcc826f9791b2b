//! Gradient reductions across process groups and norm clipping

use tpzero_dist::{Collective, CommError};
use tpzero_model::{ParallelRole, ParamRegistry};
use tracing::trace;

/// Bucket capacity for the data-parallel gradient all-reduce, in elements.
pub const DEFAULT_BUCKET_CAP: usize = 32 * 1024 * 1024;

/// Global gradient-norm threshold.
pub const MAX_GRAD_NORM: f64 = 1.0;

/// Sum the gradients of sequence-parallel parameters over the tensor-parallel group.
///
/// Those parameters are replicated on every tensor-parallel rank, but each rank
/// only accumulated the gradient of its own slice of the sequence. This is a
/// sum, not an average.
pub fn allreduce_sequence_parallel_gradients(
    params: &mut ParamRegistry,
    tp_group: &dyn Collective,
) -> Result<(), CommError> {
    if tp_group.size() == 1 {
        return Ok(());
    }
    for param in params.with_role_mut(ParallelRole::SequenceParallel) {
        tp_group.all_reduce_sum(&mut param.grad)?;
    }
    Ok(())
}

/// Average gradients over the data-parallel group, packing parameters into
/// buckets of at most `bucket_cap` elements per collective.
///
/// A parameter larger than the cap travels in a bucket of its own.
pub fn bucket_allreduce_gradients(
    params: &mut ParamRegistry,
    dp_group: &dyn Collective,
    bucket_cap: usize,
) -> Result<(), CommError> {
    let world = dp_group.size();
    if world == 1 {
        return Ok(());
    }
    let scale = 1.0 / world as f32;
    let mut grads: Vec<&mut Vec<f32>> = params.iter_mut().map(|p| &mut p.grad).collect();

    let mut start = 0;
    while start < grads.len() {
        let mut end = start;
        let mut elems = 0;
        while end < grads.len() && (end == start || elems + grads[end].len() <= bucket_cap) {
            elems += grads[end].len();
            end += 1;
        }

        let mut bucket = Vec::with_capacity(elems);
        for grad in &grads[start..end] {
            bucket.extend_from_slice(grad);
        }
        dp_group.all_reduce_sum(&mut bucket)?;
        trace!(params = end - start, elems, "reduced gradient bucket");

        let mut offset = 0;
        for grad in grads[start..end].iter_mut() {
            let n = grad.len();
            for (g, reduced) in grad.iter_mut().zip(&bucket[offset..offset + n]) {
                *g = reduced * scale;
            }
            offset += n;
        }
        start = end;
    }
    Ok(())
}

/// Scale gradients so their global L2 norm is at most `max_norm`.
///
/// Returns the norm before clipping.
pub fn clip_grad_norm(params: &mut ParamRegistry, max_norm: f64) -> f64 {
    let total_norm = params.grad_norm();
    let clip_coef = max_norm / (total_norm + 1e-6);
    if clip_coef < 1.0 {
        let coef = clip_coef as f32;
        for param in params.iter_mut() {
            param.grad.iter_mut().for_each(|g| *g *= coef);
        }
    }
    total_norm
}

#[cfg(test)]
mod tests {
    use super::*;
    use tpzero_model::Parameter;

    fn registry(grads: &[&[f32]]) -> ParamRegistry {
        let mut params = ParamRegistry::new();
        for (i, grad) in grads.iter().enumerate() {
            let mut p = Parameter::new(
                format!("p{i}.weight"),
                vec![grad.len()],
                vec![0.0; grad.len()],
                ParallelRole::Replicated,
            )
            .unwrap();
            p.grad = grad.to_vec();
            params.register(p).unwrap();
        }
        params
    }

    #[test]
    fn test_clip_scales_to_max_norm() {
        let mut params = registry(&[&[3.0], &[4.0]]);
        let norm = clip_grad_norm(&mut params, 1.0);
        assert!((norm - 5.0).abs() < 1e-9);
        assert!((params.grad_norm() - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_clip_leaves_small_gradients() {
        let mut params = registry(&[&[0.3], &[0.4]]);
        clip_grad_norm(&mut params, 1.0);
        assert_eq!(params.flatten_grads(), vec![0.3, 0.4]);
    }
}

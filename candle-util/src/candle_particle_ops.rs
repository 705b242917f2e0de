//! Operations on tensors with a leading particle axis `S`.
//!
//! Every latent tensor in a particle population is laid out as
//! `(S, B, ...)`: particles first, batch second, event axes after.

use candle_core::{bail, DType, Result, Tensor};
use candle_nn::ops;

pub const PARTICLE_AXIS: usize = 0;

/// Normalized importance weights
///
/// w(s, ...) = exp(log_w(s, ...)) / sum_s' exp(log_w(s', ...))
///
/// * `log_w` - unnormalized log-weights (S x ...)
///
pub fn particle_softmax(log_w: &Tensor) -> Result<Tensor> {
    ops::softmax(log_w, PARTICLE_AXIS)
}

/// Effective sample size of normalized weights
///
/// ess(...) = 1 / sum_s w(s, ...)^2
///
/// * `w` - normalized weights (S x ...)
///
/// # Returns `ess` with the particle axis removed
pub fn effective_sample_size(w: &Tensor) -> Result<Tensor> {
    w.sqr()?.sum(PARTICLE_AXIS)?.recip()
}

/// Number of NaN or infinite entries
pub fn count_non_finite(x: &Tensor) -> Result<usize> {
    let values = x.to_dtype(DType::F64)?.flatten_all()?.to_vec1::<f64>()?;
    Ok(values.iter().filter(|v| !v.is_finite()).count())
}

/// Sum out every axis after the first `keep` axes
///
/// `(S, B, N, D)` with `keep = 2` becomes `(S, B)`;
/// with `keep = 3` it becomes `(S, B, N)`.
pub fn sum_trailing(x: &Tensor, keep: usize) -> Result<Tensor> {
    if x.rank() < keep {
        bail!(
            "expected at least {} axes, but found shape {:?}",
            keep,
            x.dims()
        );
    }
    let mut ret = x.clone();
    while ret.rank() > keep {
        ret = ret.sum(ret.rank() - 1)?;
    }
    Ok(ret)
}

/// Average over the particle axis, cut off from the graph
pub fn particle_mean(x: &Tensor) -> Result<Tensor> {
    x.detach().mean(PARTICLE_AXIS)
}

/// Gather `x` along the particle axis.
///
/// The ancestor index must cover a prefix of `x`'s axes,
/// `(S', B)` or `(S', B, K)`, and is broadcast over the rest,
/// so that every trailing entry of one particle moves together.
///
/// * `x` - particle tensor (S x B x ...)
/// * `ancestors` - `u32` indices into the particle axis (S' x B [x K])
///
/// # Returns `(S' x B x ...)`
pub fn gather_particles(x: &Tensor, ancestors: &Tensor) -> Result<Tensor> {
    let x_dims = x.dims();
    let a_dims = ancestors.dims();

    if a_dims.is_empty() || a_dims.len() > x_dims.len() || a_dims[1..] != x_dims[1..a_dims.len()]
    {
        bail!(
            "ancestor index {:?} does not match particle tensor {:?}",
            a_dims,
            x_dims
        );
    }

    let mut index_shape = a_dims.to_vec();
    index_shape.resize(x_dims.len(), 1);

    let mut target_shape = x_dims.to_vec();
    target_shape[PARTICLE_AXIS] = a_dims[PARTICLE_AXIS];

    let index = ancestors
        .reshape(index_shape)?
        .broadcast_as(target_shape)?
        .contiguous()?;

    x.contiguous()?.gather(&index, PARTICLE_AXIS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use candle_core::Device;

    #[test]
    fn softmax_sums_to_one_and_ignores_shifts() -> Result<()> {
        let dev = Device::Cpu;
        let log_w = Tensor::new(&[[0.5f32, -3.0], [1.5, 2.0], [-0.25, 0.0]], &dev)?;

        let w = particle_softmax(&log_w)?;
        let totals = w.sum(0)?.to_vec1::<f32>()?;
        for t in totals {
            assert!((t - 1.0).abs() < 1e-6);
        }

        let shifted = particle_softmax(&(&log_w + 100.0)?)?;
        let diff = (w - shifted)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert!(diff < 1e-6);
        Ok(())
    }

    #[test]
    fn ess_bounds() -> Result<()> {
        let dev = Device::Cpu;
        let s = 4usize;

        let uniform = Tensor::ones((s, 1), DType::F32, &dev)?.affine(1. / s as f64, 0.)?;
        let ess = effective_sample_size(&uniform)?.to_vec1::<f32>()?;
        assert_abs_diff_eq!(ess[0], s as f32, epsilon = 1e-5);

        let one_hot = Tensor::new(&[[0f32], [1.], [0.], [0.]], &dev)?;
        let ess = effective_sample_size(&one_hot)?.to_vec1::<f32>()?;
        assert_abs_diff_eq!(ess[0], 1.0, epsilon = 1e-6);

        let w = particle_softmax(&Tensor::new(&[[0.1f32], [2.0], [-1.0], [0.3]], &dev)?)?;
        let ess = effective_sample_size(&w)?.to_vec1::<f32>()?;
        assert!(ess[0] >= 1. && ess[0] <= s as f32);
        Ok(())
    }

    #[test]
    fn sum_trailing_keeps_leading_axes() -> Result<()> {
        let x = Tensor::ones((3, 2, 5, 4), DType::F32, &Device::Cpu)?;
        assert_eq!(sum_trailing(&x, 2)?.dims(), &[3, 2]);
        assert_eq!(sum_trailing(&x, 3)?.dims(), &[3, 2, 5]);
        assert!(sum_trailing(&x, 5).is_err());
        Ok(())
    }

    #[test]
    fn non_finite_entries_are_counted() -> Result<()> {
        let x = Tensor::new(&[1f32, f32::NAN, f32::NEG_INFINITY, 0.], &Device::Cpu)?;
        assert_eq!(count_non_finite(&x)?, 2);
        Ok(())
    }

    #[test]
    fn gather_moves_whole_particles() -> Result<()> {
        let dev = Device::Cpu;
        // x(s, b, k) = 100 s + 10 b + k
        let values: Vec<f32> = (0..3)
            .flat_map(|s| {
                (0..2).flat_map(move |b| (0..4).map(move |k| (100 * s + 10 * b + k) as f32))
            })
            .collect();
        let x = Tensor::from_vec(values, (3, 2, 4), &dev)?;
        let ancestors = Tensor::new(&[[2u32, 0], [2, 1], [0, 0]], &dev)?;

        let y = gather_particles(&x, &ancestors)?;
        assert_eq!(y.dims(), &[3, 2, 4]);

        let y = y.to_vec3::<f32>()?;
        let a = ancestors.to_vec2::<u32>()?;
        for s in 0..3 {
            for b in 0..2 {
                for k in 0..4 {
                    let expected = (100 * a[s][b] as usize + 10 * b + k) as f32;
                    assert_eq!(y[s][b][k], expected);
                }
            }
        }
        Ok(())
    }

    #[test]
    fn gather_rejects_mismatched_index() -> Result<()> {
        let dev = Device::Cpu;
        let x = Tensor::zeros((3, 2, 4), DType::F32, &dev)?;
        let ancestors = Tensor::zeros((3, 5), DType::U32, &dev)?;
        assert!(gather_particles(&x, &ancestors).is_err());
        Ok(())
    }
}

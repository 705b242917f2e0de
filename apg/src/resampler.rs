use crate::config::ResamplingStrategy;
use crate::error::{ApgError, Result};

use candle_core::{DType, Tensor};
use candle_util::candle_particle_ops::{gather_particles, PARTICLE_AXIS};
use log::warn;
use rand::{Rng, RngCore};

/// Draws ancestor indices from importance weights and reorders
/// particle tensors with them.
#[derive(Clone, Copy, Debug, Default)]
pub struct Resampler {
    strategy: ResamplingStrategy,
}

impl Resampler {
    pub fn new(strategy: ResamplingStrategy) -> Self {
        Self { strategy }
    }

    /// Draw `S` ancestors with replacement for every column
    /// (batch element, and unit when present) from the particle
    /// softmax of `log_weights`.
    ///
    /// Columns without a single finite weight are resampled uniformly.
    ///
    /// * `log_weights` - unnormalized log-weights (S x B [x K])
    ///
    /// # Returns `u32` ancestor indices (S x B [x K])
    pub fn sample_ancestor_index(
        &self,
        log_weights: &Tensor,
        rng: &mut dyn RngCore,
    ) -> Result<Tensor> {
        let dims = log_weights.dims().to_vec();
        if dims.len() < 2 || dims[PARTICLE_AXIS] == 0 {
            return Err(ApgError::shape_mismatch("log-weights", &[1, 1], &dims));
        }

        let s = dims[PARTICLE_AXIS];
        let ncols = log_weights.elem_count() / s;
        let values = log_weights
            .detach()
            .to_dtype(DType::F64)?
            .flatten_all()?
            .to_vec1::<f64>()?;

        let mut ancestors = vec![0u32; values.len()];
        let mut column = vec![0f64; s];
        let mut draws = Vec::with_capacity(s);

        for c in 0..ncols {
            for (i, x) in column.iter_mut().enumerate() {
                *x = values[i * ncols + c];
            }
            let cdf = cumulative_weights(&column);
            draws.clear();
            self.draw(&cdf, rng, &mut draws);
            for (i, &a) in draws.iter().enumerate() {
                ancestors[i * ncols + c] = a as u32;
            }
        }

        Ok(Tensor::from_vec(ancestors, dims, log_weights.device())?)
    }

    /// Gather `tensor` (S x B x ...) along the particle axis
    pub fn resample(&self, tensor: &Tensor, ancestors: &Tensor) -> Result<Tensor> {
        Ok(gather_particles(tensor, ancestors)?)
    }

    fn draw(&self, cdf: &[f64], rng: &mut dyn RngCore, out: &mut Vec<usize>) {
        let s = cdf.len();
        let n = s as f64;
        match self.strategy {
            ResamplingStrategy::Multinomial => {
                for _ in 0..s {
                    let u: f64 = rng.random();
                    out.push(cdf.partition_point(|&c| c <= u).min(s - 1));
                }
            }
            ResamplingStrategy::Systematic => {
                let u0: f64 = rng.random();
                walk_sorted_positions(cdf, (0..s).map(|i| (i as f64 + u0) / n), out);
            }
            ResamplingStrategy::Stratified => {
                let positions: Vec<f64> = (0..s)
                    .map(|i| (i as f64 + rng.random::<f64>()) / n)
                    .collect();
                walk_sorted_positions(cdf, positions.into_iter(), out);
            }
        }
    }
}

/// Cumulative normalized weights of one column of log-weights.
///
/// Non-finite entries get zero mass; a column with no finite entry
/// falls back to uniform weights.
fn cumulative_weights(log_w: &[f64]) -> Vec<f64> {
    let max = log_w
        .iter()
        .copied()
        .filter(|x| x.is_finite())
        .fold(f64::NEG_INFINITY, f64::max);

    let s = log_w.len();
    let mut w: Vec<f64> = if max.is_finite() {
        log_w
            .iter()
            .map(|&x| if x.is_finite() { (x - max).exp() } else { 0. })
            .collect()
    } else {
        warn!("no finite log-weight among {} particles; resampling uniformly", s);
        vec![1.; s]
    };

    let total: f64 = w.iter().sum();
    let mut acc = 0.;
    for x in w.iter_mut() {
        acc += *x / total;
        *x = acc;
    }
    if let Some(last) = w.last_mut() {
        *last = 1.;
    }
    w
}

/// Map increasing positions in [0, 1) to indices through the cdf
fn walk_sorted_positions<I>(cdf: &[f64], positions: I, out: &mut Vec<usize>)
where
    I: Iterator<Item = f64>,
{
    let last = cdf.len() - 1;
    let mut j = 0;
    for u in positions {
        while j < last && cdf[j] <= u {
            j += 1;
        }
        out.push(j);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    const ALL: [ResamplingStrategy; 3] = [
        ResamplingStrategy::Multinomial,
        ResamplingStrategy::Systematic,
        ResamplingStrategy::Stratified,
    ];

    #[test]
    fn point_mass_is_always_selected() -> Result<()> {
        let dev = Device::Cpu;
        let ninf = f32::NEG_INFINITY;
        let log_w = Tensor::new(&[[ninf, 0.], [0., ninf], [ninf, ninf]], &dev)?;

        for strategy in ALL {
            let mut rng = SmallRng::seed_from_u64(1);
            let a = Resampler::new(strategy)
                .sample_ancestor_index(&log_w, &mut rng)?
                .to_vec2::<u32>()?;
            for row in a {
                assert_eq!(row, vec![1, 0]);
            }
        }
        Ok(())
    }

    #[test]
    fn degenerate_column_does_not_crash() -> Result<()> {
        let dev = Device::Cpu;
        let ninf = f32::NEG_INFINITY;
        let log_w = Tensor::new(&[[ninf], [ninf], [ninf], [ninf]], &dev)?;
        let mut rng = SmallRng::seed_from_u64(2);
        let a = Resampler::new(ResamplingStrategy::Systematic)
            .sample_ancestor_index(&log_w, &mut rng)?
            .flatten_all()?
            .to_vec1::<u32>()?;
        // uniform systematic draws hit every particle exactly once
        let mut sorted = a.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, vec![0, 1, 2, 3]);
        Ok(())
    }

    #[test]
    fn empty_particle_axis_is_rejected() -> Result<()> {
        let log_w = Tensor::zeros((0, 2), DType::F32, &Device::Cpu)?;
        let mut rng = SmallRng::seed_from_u64(3);
        for strategy in ALL {
            let res = Resampler::new(strategy).sample_ancestor_index(&log_w, &mut rng);
            assert!(matches!(res, Err(ApgError::ShapeMismatch { .. })));
        }
        Ok(())
    }

    #[test]
    fn frequencies_follow_weights() -> Result<()> {
        let dev = Device::Cpu;
        let s = 4;
        let ncols = 2000;
        let probs = [0.1f32, 0.2, 0.3, 0.4];
        let log_w: Vec<f32> = probs
            .iter()
            .flat_map(|p| std::iter::repeat(p.ln()).take(ncols))
            .collect();
        let log_w = Tensor::from_vec(log_w, (s, ncols), &dev)?;

        for strategy in ALL {
            let mut rng = SmallRng::seed_from_u64(42);
            let a = Resampler::new(strategy)
                .sample_ancestor_index(&log_w, &mut rng)?
                .flatten_all()?
                .to_vec1::<u32>()?;
            let mut counts = [0usize; 4];
            for x in a {
                counts[x as usize] += 1;
            }
            let total = (s * ncols) as f32;
            for (k, p) in probs.iter().enumerate() {
                let freq = counts[k] as f32 / total;
                assert!((freq - p).abs() < 0.02, "{:?}: {} vs {}", strategy, freq, p);
            }
        }
        Ok(())
    }

    #[test]
    fn tagged_particles_follow_their_ancestors() -> Result<()> {
        let dev = Device::Cpu;
        let (s, b, k, d) = (5, 3, 2, 4);
        let mut rng = SmallRng::seed_from_u64(9);

        let log_w = Tensor::randn(0f32, 2f32, (s, b), &dev)?;
        let resampler = Resampler::new(ResamplingStrategy::Multinomial);
        let ancestors = resampler.sample_ancestor_index(&log_w, &mut rng)?;

        // tag every entry of particle s with s
        let tag = |shape: &[usize]| -> Result<Tensor> {
            let per = shape[1..].iter().product::<usize>();
            let values: Vec<f32> = (0..shape[0])
                .flat_map(|i| std::iter::repeat(i as f32).take(per))
                .collect();
            Ok(Tensor::from_vec(values, shape, &dev)?)
        };
        let global = resampler.resample(&tag(&[s, b, k, d])?, &ancestors)?;
        let local = resampler.resample(&tag(&[s, b, 6, k, 1])?, &ancestors)?;

        let a = ancestors.to_vec2::<u32>()?;
        let g = global.to_dtype(DType::F64)?.flatten_all()?.to_vec1::<f64>()?;
        let l = local.to_dtype(DType::F64)?.flatten_all()?.to_vec1::<f64>()?;

        let (gper, lper) = (k * d, 6 * k);
        for i in 0..s {
            for j in 0..b {
                let expected = a[i][j] as f64;
                for e in 0..gper {
                    assert_eq!(g[(i * b + j) * gper + e], expected);
                }
                for e in 0..lper {
                    assert_eq!(l[(i * b + j) * lper + e], expected);
                }
            }
        }
        Ok(())
    }

    #[test]
    fn per_unit_weights_resample_units_independently() -> Result<()> {
        let dev = Device::Cpu;
        let ninf = f32::NEG_INFINITY;
        // (S=2, B=1, K=2): unit 0 keeps particle 0, unit 1 keeps particle 1
        let log_w = Tensor::new(&[[[0f32, ninf]], [[ninf, 0.]]], &dev)?;
        let mut rng = SmallRng::seed_from_u64(5);
        let resampler = Resampler::new(ResamplingStrategy::Systematic);
        let ancestors = resampler.sample_ancestor_index(&log_w, &mut rng)?;
        assert_eq!(ancestors.dims(), &[2, 1, 2]);

        let mu = Tensor::new(&[[[[1f32, 1.], [2., 2.]]], [[[3., 3.], [4., 4.]]]], &dev)?;
        let out = resampler.resample(&mu, &ancestors)?;
        let out = out.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(out, vec![1., 1., 4., 4., 1., 1., 4., 4.]);
        Ok(())
    }
}

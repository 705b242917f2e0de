//! Distributions over particle tensors whose randomness comes from a
//! caller-owned RNG, so that a seeded run can be replayed exactly.

use candle_core::{bail, DType, Result, Tensor, D};
use candle_nn::ops;
use rand::{Rng, RngCore};
use rand_distr::{Distribution, StandardNormal};

const LN_2PI: f64 = 1.837_877_066_409_345_3;

/// Standard normal noise with the shape, dtype and device of `like`
pub fn standard_normal_like(like: &Tensor, rng: &mut dyn RngCore) -> Result<Tensor> {
    let noise: Vec<f32> = (0..like.elem_count())
        .map(|_| StandardNormal.sample(&mut *rng))
        .collect();
    Tensor::from_vec(noise, like.dims(), like.device())?.to_dtype(like.dtype())
}

/// Element-wise Gaussian `N(loc, scale^2)`
#[derive(Clone, Debug)]
pub struct Normal {
    loc: Tensor,
    scale: Tensor,
}

impl Normal {
    pub fn new(loc: Tensor, scale: Tensor) -> Result<Self> {
        if loc.dims() != scale.dims() {
            bail!(
                "loc {:?} and scale {:?} must have the same shape",
                loc.dims(),
                scale.dims()
            );
        }
        Ok(Self { loc, scale })
    }

    /// Build from a log standard deviation, clamped to `[-8, 8]`
    pub fn from_log_scale(loc: Tensor, log_scale: &Tensor) -> Result<Self> {
        let scale = log_scale.clamp(-8., 8.)?.exp()?;
        Self::new(loc, scale)
    }

    pub fn loc(&self) -> &Tensor {
        &self.loc
    }

    pub fn scale(&self) -> &Tensor {
        &self.scale
    }

    /// Reparameterized draw `loc + scale * eps`, `eps ~ N(0, I)`
    pub fn rsample(&self, rng: &mut dyn RngCore) -> Result<Tensor> {
        let eps = standard_normal_like(&self.loc, rng)?;
        self.loc.add(&self.scale.mul(&eps)?)
    }

    /// Element-wise log-density
    ///
    /// log N(x; μ, σ²) = -0.5 * [(x-μ)²/σ² + 2*ln(σ) + ln(2π)]
    ///
    /// * `x` - value, broadcastable against `loc`
    ///
    pub fn log_prob(&self, x: &Tensor) -> Result<Tensor> {
        let z = x.broadcast_sub(&self.loc)?.broadcast_div(&self.scale)?;
        let log_scale = self.scale.log()?;
        ((z.sqr()? + LN_2PI)?.broadcast_add(&(log_scale * 2.)?)? * (-0.5))
    }
}

/// One-hot categorical over the last axis
#[derive(Clone, Debug)]
pub struct OneHotCategorical {
    log_probs: Tensor,
}

impl OneHotCategorical {
    /// * `logits` - unnormalized log-probabilities (... x K)
    pub fn from_logits(logits: &Tensor) -> Result<Self> {
        let log_probs = ops::log_softmax(logits, D::Minus1)?;
        Ok(Self { log_probs })
    }

    pub fn probs(&self) -> Result<Tensor> {
        self.log_probs.exp()
    }

    pub fn num_categories(&self) -> Result<usize> {
        self.log_probs.dim(D::Minus1)
    }

    /// Draw one-hot vectors; no gradient flows through the draw
    pub fn sample(&self, rng: &mut dyn RngCore) -> Result<Tensor> {
        let k = self.num_categories()?;
        let probs = self
            .probs()?
            .detach()
            .to_dtype(DType::F64)?
            .flatten_all()?
            .to_vec1::<f64>()?;

        let mut one_hot = vec![0f32; probs.len()];
        for (row, out) in probs.chunks(k).zip(one_hot.chunks_mut(k)) {
            out[sample_row(row, rng)] = 1.;
        }

        Tensor::from_vec(one_hot, self.log_probs.dims(), self.log_probs.device())?
            .to_dtype(self.log_probs.dtype())
    }

    /// log p(z) = sum_k z(k) * log π(k) for one-hot `z`
    pub fn log_prob(&self, value: &Tensor) -> Result<Tensor> {
        value.mul(&self.log_probs)?.sum(D::Minus1)
    }
}

fn sample_row(probs: &[f64], rng: &mut dyn RngCore) -> usize {
    let total: f64 = probs.iter().sum();
    let u: f64 = rng.random::<f64>() * total;
    let mut acc = 0.;
    for (k, p) in probs.iter().enumerate() {
        acc += p;
        if u < acc {
            return k;
        }
    }
    probs.len() - 1
}

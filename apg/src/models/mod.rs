//! Reference model families sampled by the APG driver.
//!
//! A model supplies one [`Kernel`] per latent given the observation and
//! the current values of the other latents. Blocks are sampled latent by
//! latent in block order, each kernel seeing the values drawn before it.

pub mod encoders;
pub mod gmm;
pub mod ring;

use crate::error::{ApgError, Result};
use crate::latents::{Block, NamedTensors};
use crate::oracle::Proposal;

use candle_core::Tensor;
use candle_util::candle_distributions::{Normal, OneHotCategorical};
use rand::RngCore;

/// Conditional distribution of one latent
pub enum Kernel {
    Normal(Normal),
    Categorical(OneHotCategorical),
}

impl Kernel {
    pub fn sample(&self, rng: &mut dyn RngCore) -> Result<Tensor> {
        Ok(match self {
            Self::Normal(d) => d.rsample(rng)?,
            Self::Categorical(d) => d.sample(rng)?,
        })
    }

    pub fn log_prob(&self, value: &Tensor) -> Result<Tensor> {
        Ok(match self {
            Self::Normal(d) => d.log_prob(value)?,
            Self::Categorical(d) => d.log_prob(value)?,
        })
    }

    /// location of a Normal, probabilities of a categorical
    pub fn mode(&self) -> Result<Tensor> {
        Ok(match self {
            Self::Normal(d) => d.loc().clone(),
            Self::Categorical(d) => d.probs()?,
        })
    }
}

pub trait KernelFamily {
    /// latent names in the order the one-shot proposal draws them
    fn latent_order(&self) -> Vec<&'static str>;

    /// kernel for `name` given `obs` and the other latents in `cond`
    fn kernel(&self, name: &str, obs: &Tensor, cond: &NamedTensors) -> Result<Kernel>;

    /// kernel used by the one-shot proposal; defaults to `kernel`
    fn initial_kernel(&self, name: &str, obs: &Tensor, cond: &NamedTensors) -> Result<Kernel> {
        self.kernel(name, obs, cond)
    }
}

fn sample_in_order<F, I>(
    family: &F,
    names: I,
    obs: &Tensor,
    cond: &NamedTensors,
    initial: bool,
    rng: &mut dyn RngCore,
) -> Result<Proposal>
where
    F: KernelFamily + ?Sized,
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    let mut cond = cond.clone();
    let mut out = Proposal::default();
    for name in names {
        let name = name.as_ref();
        let kernel = if initial {
            family.initial_kernel(name, obs, &cond)?
        } else {
            family.kernel(name, obs, &cond)?
        };
        let value = kernel.sample(rng)?;
        out.log_q.insert(name, kernel.log_prob(&value)?);
        out.modes.insert(name, kernel.mode()?);
        out.values.insert(name, value.clone());
        cond.insert(name, value);
    }
    Ok(out)
}

/// Draw every latent from the one-shot kernels
pub fn propose_all_with<F>(family: &F, obs: &Tensor, rng: &mut dyn RngCore) -> Result<Proposal>
where
    F: KernelFamily + ?Sized,
{
    sample_in_order(family, family.latent_order(), obs, &NamedTensors::new(), true, rng)
}

/// Forward kernel of `block` built from per-latent kernels
pub fn propose_with<F>(
    family: &F,
    block: &Block,
    obs: &Tensor,
    cond: &NamedTensors,
    rng: &mut dyn RngCore,
) -> Result<Proposal>
where
    F: KernelFamily + ?Sized,
{
    sample_in_order(family, block.latents.iter(), obs, cond, false, rng)
}

/// Backward kernel of `block`: each old value is scored under the
/// kernel the forward pass would have used, conditioned on the old
/// values of the latents before it in the block.
pub fn log_prob_with<F>(
    family: &F,
    block: &Block,
    obs: &Tensor,
    cond: &NamedTensors,
    old: &NamedTensors,
) -> Result<NamedTensors>
where
    F: KernelFamily + ?Sized,
{
    let mut cond = cond.clone();
    let mut out = NamedTensors::new();
    for name in block.latents.iter() {
        let value = old.require(name)?;
        let kernel = family.kernel(name, obs, &cond)?;
        out.insert(name, kernel.log_prob(value)?);
        cond.insert(name, value.clone());
    }
    Ok(out)
}

pub(crate) fn unknown_latent(name: &str) -> ApgError {
    ApgError::MissingOutput(format!("kernel for latent `{}`", name))
}

/// Uniform categorical log-prior per unit, `z` one-hot (S, B, N, K)
pub(crate) fn uniform_categorical_log_prior(z: &Tensor) -> Result<Tensor> {
    let k = z.dim(candle_core::D::Minus1)?;
    Ok((z.sum(candle_core::D::Minus1)? * (-(k as f64).ln()))?)
}

/// `N(loc, scale^2)` with constant parameters shaped like `like`
pub(crate) fn constant_normal(like: &Tensor, loc: f64, scale: f64) -> Result<Normal> {
    let loc_t = like.zeros_like()?.affine(1., loc)?;
    let scale_t = like.zeros_like()?.affine(1., scale)?;
    Ok(Normal::new(loc_t, scale_t)?)
}

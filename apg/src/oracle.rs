//! Capability interfaces a model family implements to be sampled by APG.
//!
//! The sampler never looks inside a model. It only asks a
//! [`ProposalOracle`] for fresh block values and their log-densities,
//! and a [`DecoderOracle`] for the likelihood and priors of a complete
//! latent assignment.
//!
//! Log-densities may keep any trailing event axes: the sampler sums
//! them down to `(S, B)` for ordinary blocks, or to `(S, B, U)` for
//! blocks marked `per_unit`.

use crate::error::Result;
use crate::latents::{Block, NamedTensors};

use candle_core::Tensor;
use rand::RngCore;

/// Output of a forward kernel
#[derive(Clone, Debug, Default)]
pub struct Proposal {
    /// sampled latent values `(S, B, ...)`
    pub values: NamedTensors,
    /// log q of every sampled latent, differentiable
    pub log_q: NamedTensors,
    /// distribution statistics used as posterior-mode estimates
    /// (e.g. the Gaussian location or the categorical probabilities)
    pub modes: NamedTensors,
}

/// Output of the generative model for a full latent assignment
#[derive(Clone, Debug)]
pub struct Decoded {
    /// log p(x | latents) per data point `(S, B, N, ...)`
    pub log_likelihood: Tensor,
    /// log p(latent) for every latent
    pub log_prior: NamedTensors,
    /// reconstruction mean, if the model has one
    pub recon: Option<Tensor>,
}

pub trait ProposalOracle {
    /// One-shot proposal of every latent given only the observation
    ///
    /// * `obs` - observation `(S, B, ...)`
    /// * `rng` - source of all randomness in the draw
    fn propose_all(&self, obs: &Tensor, rng: &mut dyn RngCore) -> Result<Proposal>;

    /// Forward kernel for one block
    ///
    /// * `block` - the block being updated
    /// * `obs` - observation `(S, B, ...)`
    /// * `cond` - current values of all latents (the block's own
    ///   entries hold their previous values and should be ignored)
    fn propose(
        &self,
        block: &Block,
        obs: &Tensor,
        cond: &NamedTensors,
        rng: &mut dyn RngCore,
    ) -> Result<Proposal>;

    /// Backward kernel: log q(old | cond) for the block's previous values
    ///
    /// * `cond` - the same conditioning the forward kernel saw
    /// * `old` - previous values of the block's latents
    fn log_prob(
        &self,
        block: &Block,
        obs: &Tensor,
        cond: &NamedTensors,
        old: &NamedTensors,
    ) -> Result<NamedTensors>;
}

pub trait DecoderOracle {
    /// Likelihood and priors of a complete latent assignment
    fn decode(&self, obs: &Tensor, latents: &NamedTensors) -> Result<Decoded>;
}

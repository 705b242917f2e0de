//! Mixture of rings in the plane.
//!
//! Each point sits on a circle of fixed radius around its cluster
//! centre, at a per-point angle:
//!
//! ```text
//! mu_k   ~ N(m0, s0^2 I)                        (S, B, K, 2)
//! z_n    ~ Cat(1/K), one-hot                    (S, B, N, K)
//! beta_n ~ N(0, a^2)                            (S, B, N, 1)
//! x_n    ~ N(mu_{z_n} + r (cos beta_n, sin beta_n), sigma^2 I)
//! ```
//!
//! `{mu}` is updated first, then `{z, beta}` point by point.

use super::encoders::{ClusterStatsEncoder, PairwiseEncoder, SoftAssignmentEncoder};
use super::gmm::{assigned_means, MU, Z};
use super::*;
use crate::latents::{Block, LatentSpec, ModelLayout, NamedTensors};
use crate::oracle::{Decoded, DecoderOracle, Proposal, ProposalOracle};

use candle_core::{Device, Tensor};
use candle_nn::VarBuilder;
use candle_util::candle_distributions::{Normal, OneHotCategorical};
use rand::{Rng, RngCore};
use rand_distr::{Distribution, Normal as ScalarNormal};
use std::f64::consts::PI;

pub const BETA: &str = "beta";

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RingPrior {
    pub prior_loc: f64,
    pub prior_scale: f64,
    pub noise_scale: f64,
    pub radius: f64,
    pub angle_scale: f64,
}

impl Default for RingPrior {
    fn default() -> Self {
        Self {
            prior_loc: 0.,
            prior_scale: 5.,
            noise_scale: 0.2,
            radius: 2.,
            angle_scale: PI,
        }
    }
}

pub fn ring_layout(num_clusters: usize, num_points: usize) -> Result<ModelLayout> {
    ModelLayout::new(
        vec![
            LatentSpec::new(MU, &[num_clusters, 2]),
            LatentSpec::new(Z, &[num_points, num_clusters]),
            LatentSpec::new(BETA, &[num_points, 1]),
        ],
        vec![
            Block::new("global", &[MU]),
            Block::per_unit("local", &[Z, BETA]),
        ],
    )
}

/// `r (cos beta, sin beta)` (S x B x N x 2)
fn ring_offset(beta: &Tensor, radius: f64) -> Result<Tensor> {
    let unit = Tensor::cat(&[beta.cos()?, beta.sin()?], 3)?;
    Ok((unit * radius)?)
}

#[derive(Clone, Copy, Debug, Default)]
pub struct RingMixture {
    pub prior: RingPrior,
}

impl RingMixture {
    pub fn new(prior: RingPrior) -> Self {
        Self { prior }
    }
}

impl DecoderOracle for RingMixture {
    fn decode(&self, obs: &Tensor, latents: &NamedTensors) -> Result<Decoded> {
        let mu = latents.require(MU)?;
        let z = latents.require(Z)?;
        let beta = latents.require(BETA)?;

        let recon = (assigned_means(z, mu)? + ring_offset(beta, self.prior.radius)?)?;
        let noise = recon.ones_like()?.affine(self.prior.noise_scale, 0.)?;
        let log_likelihood = Normal::new(recon.clone(), noise)?.log_prob(obs)?;

        let prior_mu = constant_normal(mu, self.prior.prior_loc, self.prior.prior_scale)?;
        let prior_beta = constant_normal(beta, 0., self.prior.angle_scale)?;
        let log_prior = NamedTensors::new()
            .with(MU, prior_mu.log_prob(mu)?)
            .with(Z, uniform_categorical_log_prior(z)?)
            .with(BETA, prior_beta.log_prob(beta)?);

        Ok(Decoded {
            log_likelihood,
            log_prior,
            recon: Some(recon),
        })
    }
}

/// Neural proposals for the ring mixture.
///
/// The local network scores every (point, cluster) pair with an
/// assignment logit and the location and log-scale of the angle the
/// point would have on that cluster's ring.
pub struct AmortizedRingProposal {
    one_shot_assign: SoftAssignmentEncoder,
    global: ClusterStatsEncoder,
    local: PairwiseEncoder,
    radius: f64,
}

impl AmortizedRingProposal {
    pub fn new(
        num_clusters: usize,
        num_hidden: usize,
        radius: f64,
        vb: VarBuilder,
    ) -> Result<Self> {
        Ok(Self {
            one_shot_assign: SoftAssignmentEncoder::new(
                2,
                num_clusters,
                num_hidden,
                vb.pp("rws"),
            )?,
            global: ClusterStatsEncoder::new(2, num_hidden, vb.pp("global"))?,
            local: PairwiseEncoder::new(2, 3, num_hidden, vb.pp("local"))?,
            radius,
        })
    }
}

impl KernelFamily for AmortizedRingProposal {
    fn latent_order(&self) -> Vec<&'static str> {
        vec![MU, Z, BETA]
    }

    fn kernel(&self, name: &str, obs: &Tensor, cond: &NamedTensors) -> Result<Kernel> {
        match name {
            MU => {
                // pull every point back to its centre before pooling
                let offset = ring_offset(cond.require(BETA)?, self.radius)?;
                let centred = (obs - offset)?;
                Ok(Kernel::Normal(self.global.forward(&centred, cond.require(Z)?)?))
            }
            Z => {
                let out = self.local.forward(obs, cond.require(MU)?)?;
                let logits = out.narrow(4, 0, 1)?.squeeze(4)?;
                Ok(Kernel::Categorical(OneHotCategorical::from_logits(&logits)?))
            }
            BETA => {
                let out = self.local.forward(obs, cond.require(MU)?)?;
                let z = cond.require(Z)?.unsqueeze(4)?;
                // angle parameters of the assigned cluster
                let params = out.narrow(4, 1, 2)?.broadcast_mul(&z)?.sum(3)?;
                let loc = params.narrow(3, 0, 1)?.contiguous()?;
                let log_scale = params.narrow(3, 1, 1)?;
                Ok(Kernel::Normal(Normal::from_log_scale(loc, &log_scale)?))
            }
            other => Err(unknown_latent(other)),
        }
    }

    fn initial_kernel(&self, name: &str, obs: &Tensor, cond: &NamedTensors) -> Result<Kernel> {
        match name {
            MU => {
                let gamma = self.one_shot_assign.forward(obs)?;
                Ok(Kernel::Normal(self.global.forward(obs, &gamma)?))
            }
            _ => self.kernel(name, obs, cond),
        }
    }
}

impl ProposalOracle for AmortizedRingProposal {
    fn propose_all(&self, obs: &Tensor, rng: &mut dyn RngCore) -> Result<Proposal> {
        propose_all_with(self, obs, rng)
    }

    fn propose(
        &self,
        block: &Block,
        obs: &Tensor,
        cond: &NamedTensors,
        rng: &mut dyn RngCore,
    ) -> Result<Proposal> {
        propose_with(self, block, obs, cond, rng)
    }

    fn log_prob(
        &self,
        block: &Block,
        obs: &Tensor,
        cond: &NamedTensors,
        old: &NamedTensors,
    ) -> Result<NamedTensors> {
        log_prob_with(self, block, obs, cond, old)
    }
}

/// Draw `batch_size` ring mixtures with uniform angles and copy every
/// observation across `num_particles` particles (S x B x N x 2).
pub fn simulate_rings(
    prior: &RingPrior,
    num_particles: usize,
    batch_size: usize,
    num_clusters: usize,
    num_points: usize,
    device: &Device,
    rng: &mut dyn RngCore,
) -> Result<Tensor> {
    let centre = ScalarNormal::new(prior.prior_loc, prior.prior_scale)
        .map_err(|e| ApgError::config(e.to_string()))?;
    let noise =
        ScalarNormal::new(0., prior.noise_scale).map_err(|e| ApgError::config(e.to_string()))?;

    let mut x = Vec::with_capacity(batch_size * num_points * 2);
    for _ in 0..batch_size {
        let centres: Vec<f64> = (0..num_clusters * 2)
            .map(|_| centre.sample(&mut *rng))
            .collect();
        for _ in 0..num_points {
            let k = rng.random_range(0..num_clusters);
            let angle = rng.random_range(0.0..(2. * PI));
            let (cx, cy) = (centres[2 * k], centres[2 * k + 1]);
            x.push((cx + prior.radius * angle.cos() + noise.sample(&mut *rng)) as f32);
            x.push((cy + prior.radius * angle.sin() + noise.sample(&mut *rng)) as f32);
        }
    }

    let x = Tensor::from_vec(x, (1, batch_size, num_points, 2), device)?;
    Ok(x.broadcast_as((num_particles, batch_size, num_points, 2))?
        .contiguous()?)
}

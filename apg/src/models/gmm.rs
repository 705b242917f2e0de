//! Gaussian mixture with isotropic clusters.
//!
//! ```text
//! mu_k ~ N(m0, s0^2 I)         (S, B, K, D)
//! z_n  ~ Cat(1/K), one-hot     (S, B, N, K)
//! x_n  ~ N(mu_{z_n}, sigma^2 I) (S, B, N, D)
//! ```

use super::encoders::{ClusterStatsEncoder, PairwiseEncoder, SoftAssignmentEncoder};
use super::*;
use crate::latents::{Block, LatentSpec, ModelLayout, NamedTensors};
use crate::oracle::{Decoded, DecoderOracle, Proposal, ProposalOracle};

use candle_core::{Device, Tensor, D};
use candle_nn::VarBuilder;
use candle_util::candle_distributions::{Normal, OneHotCategorical};
use rand::{Rng, RngCore};
use rand_distr::{Distribution, Normal as ScalarNormal};

pub const MU: &str = "mu";
pub const Z: &str = "z";

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GmmPrior {
    pub prior_loc: f64,
    pub prior_scale: f64,
    pub noise_scale: f64,
}

impl Default for GmmPrior {
    fn default() -> Self {
        Self {
            prior_loc: 0.,
            prior_scale: 5.,
            noise_scale: 1.,
        }
    }
}

/// `{mu}` followed by the per-point block `{z}`
pub fn gmm_layout(num_clusters: usize, num_points: usize, dim: usize) -> Result<ModelLayout> {
    ModelLayout::new(
        vec![
            LatentSpec::new(MU, &[num_clusters, dim]),
            LatentSpec::new(Z, &[num_points, num_clusters]),
        ],
        vec![Block::new("global", &[MU]), Block::per_unit("local", &[Z])],
    )
}

/// Cluster means `z @ mu` (S x B x N x D)
pub(crate) fn assigned_means(z: &Tensor, mu: &Tensor) -> Result<Tensor> {
    Ok(z.contiguous()?.matmul(&mu.contiguous()?)?)
}

/// Likelihood and priors of the mixture
#[derive(Clone, Copy, Debug, Default)]
pub struct GaussianMixture {
    pub prior: GmmPrior,
}

impl GaussianMixture {
    pub fn new(prior: GmmPrior) -> Self {
        Self { prior }
    }
}

impl DecoderOracle for GaussianMixture {
    fn decode(&self, obs: &Tensor, latents: &NamedTensors) -> Result<Decoded> {
        let mu = latents.require(MU)?;
        let z = latents.require(Z)?;

        let recon = assigned_means(z, mu)?;
        let noise = recon.ones_like()?.affine(self.prior.noise_scale, 0.)?;
        let log_likelihood = Normal::new(recon.clone(), noise)?.log_prob(obs)?;

        let prior_mu = constant_normal(mu, self.prior.prior_loc, self.prior.prior_scale)?;
        let log_prior = NamedTensors::new()
            .with(MU, prior_mu.log_prob(mu)?)
            .with(Z, uniform_categorical_log_prior(z)?);

        Ok(Decoded {
            log_likelihood,
            log_prior,
            recon: Some(recon),
        })
    }
}

/// Exact Gibbs conditionals of the mixture.
///
/// Since every kernel is the exact conditional, the block weights are
/// constant across particles. The one-shot proposal draws `mu` from
/// its prior and `z` from its conditional.
#[derive(Clone, Copy, Debug)]
pub struct ConjugateGmmProposal {
    pub prior: GmmPrior,
    pub num_clusters: usize,
}

impl ConjugateGmmProposal {
    pub fn new(prior: GmmPrior, num_clusters: usize) -> Self {
        Self {
            prior,
            num_clusters,
        }
    }

    /// mu_k | z, x ~ N(v_k (m0 / s0^2 + sum_n z_nk x_n / sigma^2), v_k)
    /// with 1 / v_k = 1 / s0^2 + n_k / sigma^2
    fn posterior_mu(&self, obs: &Tensor, z: &Tensor) -> Result<Normal> {
        let prec0 = self.prior.prior_scale.powi(-2);
        let prec_x = self.prior.noise_scale.powi(-2);

        let z_kn = z.transpose(2, 3)?.contiguous()?;
        let counts = z_kn.sum_keepdim(3)?; // S x B x K x 1
        let sums = z_kn.matmul(&obs.contiguous()?)?; // S x B x K x D

        let precision = counts.affine(prec_x, prec0)?;
        let var = precision.recip()?;
        let loc = sums
            .affine(prec_x, self.prior.prior_loc * prec0)?
            .broadcast_mul(&var)?;
        let scale = var.sqrt()?.broadcast_as(loc.shape())?.contiguous()?;
        Ok(Normal::new(loc, scale)?)
    }

    /// z_n | mu, x_n ~ Cat(softmax_k(-|x_n - mu_k|^2 / 2 sigma^2))
    fn posterior_z(&self, obs: &Tensor, mu: &Tensor) -> Result<OneHotCategorical> {
        let (s, b, n, d) = obs.dims4()?;
        let k = mu.dim(2)?;
        let shape = (s, b, n, k, d);
        let diff = obs
            .unsqueeze(3)?
            .broadcast_as(shape)?
            .sub(&mu.unsqueeze(2)?.broadcast_as(shape)?)?;
        let sq_dist = diff.sqr()?.sum(D::Minus1)?;
        let logits = (sq_dist * (-0.5 * self.prior.noise_scale.powi(-2)))?;
        Ok(OneHotCategorical::from_logits(&logits)?)
    }
}

impl KernelFamily for ConjugateGmmProposal {
    fn latent_order(&self) -> Vec<&'static str> {
        vec![MU, Z]
    }

    fn kernel(&self, name: &str, obs: &Tensor, cond: &NamedTensors) -> Result<Kernel> {
        match name {
            MU => Ok(Kernel::Normal(self.posterior_mu(obs, cond.require(Z)?)?)),
            Z => Ok(Kernel::Categorical(self.posterior_z(obs, cond.require(MU)?)?)),
            other => Err(unknown_latent(other)),
        }
    }

    fn initial_kernel(&self, name: &str, obs: &Tensor, cond: &NamedTensors) -> Result<Kernel> {
        match name {
            MU => {
                let (s, b, _, d) = obs.dims4()?;
                let like = Tensor::zeros((s, b, self.num_clusters, d), obs.dtype(), obs.device())?;
                let prior = constant_normal(&like, self.prior.prior_loc, self.prior.prior_scale)?;
                Ok(Kernel::Normal(prior))
            }
            _ => self.kernel(name, obs, cond),
        }
    }
}

impl ProposalOracle for ConjugateGmmProposal {
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

/// Neural proposals for the mixture
pub struct AmortizedGmmProposal {
    one_shot_assign: SoftAssignmentEncoder,
    global: ClusterStatsEncoder,
    local: PairwiseEncoder,
}

impl AmortizedGmmProposal {
    /// * `vb` - variables live under `rws`, `global` and `local`
    pub fn new(num_clusters: usize, dim: usize, num_hidden: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            one_shot_assign: SoftAssignmentEncoder::new(
                dim,
                num_clusters,
                num_hidden,
                vb.pp("rws"),
            )?,
            global: ClusterStatsEncoder::new(dim, num_hidden, vb.pp("global"))?,
            local: PairwiseEncoder::new(dim, 1, num_hidden, vb.pp("local"))?,
        })
    }
}

impl KernelFamily for AmortizedGmmProposal {
    fn latent_order(&self) -> Vec<&'static str> {
        vec![MU, Z]
    }

    fn kernel(&self, name: &str, obs: &Tensor, cond: &NamedTensors) -> Result<Kernel> {
        match name {
            MU => Ok(Kernel::Normal(self.global.forward(obs, cond.require(Z)?)?)),
            Z => {
                let logits = self.local.forward(obs, cond.require(MU)?)?.squeeze(4)?;
                Ok(Kernel::Categorical(OneHotCategorical::from_logits(&logits)?))
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

impl ProposalOracle for AmortizedGmmProposal {
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

/// Simulated mixture data
pub struct GmmData {
    /// observation repeated over particles (S x B x N x D)
    pub obs: Tensor,
    /// true centres (B x K x D)
    pub mu: Tensor,
    /// true assignments (B x N)
    pub labels: Vec<Vec<usize>>,
}

/// Draw `batch_size` mixtures of `num_points` points from the prior and
/// copy every observation across `num_particles` particles.
#[allow(clippy::too_many_arguments)]
pub fn simulate_gmm(
    prior: &GmmPrior,
    num_particles: usize,
    batch_size: usize,
    num_clusters: usize,
    num_points: usize,
    dim: usize,
    device: &Device,
    rng: &mut dyn RngCore,
) -> Result<GmmData> {
    let centre = ScalarNormal::new(prior.prior_loc, prior.prior_scale)
        .map_err(|e| ApgError::config(e.to_string()))?;
    let noise = ScalarNormal::new(0., prior.noise_scale)
        .map_err(|e| ApgError::config(e.to_string()))?;

    let mut mu = Vec::with_capacity(batch_size * num_clusters * dim);
    let mut x = Vec::with_capacity(batch_size * num_points * dim);
    let mut labels = Vec::with_capacity(batch_size);

    for _ in 0..batch_size {
        let centres: Vec<f64> = (0..num_clusters * dim).map(|_| centre.sample(&mut *rng)).collect();
        let z: Vec<usize> = (0..num_points)
            .map(|_| rng.random_range(0..num_clusters))
            .collect();
        for &k in z.iter() {
            for j in 0..dim {
                x.push((centres[k * dim + j] + noise.sample(&mut *rng)) as f32);
            }
        }
        mu.extend(centres.into_iter().map(|v| v as f32));
        labels.push(z);
    }

    let x = Tensor::from_vec(x, (1, batch_size, num_points, dim), device)?;
    let obs = x
        .broadcast_as((num_particles, batch_size, num_points, dim))?
        .contiguous()?;
    let mu = Tensor::from_vec(mu, (batch_size, num_clusters, dim), device)?;

    Ok(GmmData { obs, mu, labels })
}

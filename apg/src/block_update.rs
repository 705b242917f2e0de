use crate::error::{ApgError, Result};
use crate::latents::{Block, ModelLayout, NamedTensors};
use crate::oracle::{Decoded, DecoderOracle, ProposalOracle};

use candle_core::{DType, Tensor};
use candle_util::candle_loss_functions::weighted_nll;
use candle_util::candle_particle_ops::*;
use log::debug;
use rand::RngCore;

/// Result of one forward-backward importance-weighted update
pub struct BlockUpdate {
    /// all latents, with the updated block replaced (not yet resampled)
    pub latents: NamedTensors,
    /// detached log-weight used for resampling (S x B)
    pub log_weight: Tensor,
    /// E_w[-log q_forward], differentiable through the proposal
    pub loss_phi: Tensor,
    /// E_w[-log p(x | latents)], differentiable through the decoder
    pub loss_theta: Tensor,
    /// effective sample size (B), averaged over units for per-unit blocks
    pub ess: Tensor,
    /// proposal statistics of the updated latents
    pub modes: NamedTensors,
    /// decoder reconstruction under the new latents
    pub recon: Option<Tensor>,
    /// detached log p(x, latents) under the new latents (S x B)
    pub log_joint: Tensor,
    /// detached log p(x | latents) under the new latents (S x B)
    pub log_likelihood: Tensor,
}

/// Sum a log-density down to the weight axes `prefix`, checking
/// that its leading axes agree with them.
fn reduce_to(name: &str, log_p: &Tensor, prefix: &[usize]) -> Result<Tensor> {
    let dims = log_p.dims();
    if dims.len() < prefix.len() || &dims[..prefix.len()] != prefix {
        return Err(ApgError::shape_mismatch(name, prefix, dims));
    }
    Ok(sum_trailing(log_p, prefix.len())?)
}

fn sum_all_of(terms: Vec<Tensor>) -> Result<Tensor> {
    let mut iter = terms.into_iter();
    let first = iter
        .next()
        .ok_or_else(|| ApgError::config("a block update needs at least one latent"))?;
    let mut acc = first;
    for t in iter {
        acc = (acc + t)?;
    }
    Ok(acc)
}

/// Axes the weights of this update are normalized over: `(S, B)`, or
/// `(S, B, U)` when a single per-unit block is updated.
fn weight_axes(blocks: &[&Block], layout: &ModelLayout, s: usize, b: usize) -> Result<Vec<usize>> {
    match blocks {
        [block] if block.per_unit => {
            let first = block.latents.first().ok_or_else(|| {
                ApgError::config(format!("block `{}` is empty", block.name))
            })?;
            let spec = layout
                .latent(first)
                .ok_or_else(|| ApgError::config(format!("unknown latent `{}`", first)))?;
            let units = spec.event_shape.first().copied().ok_or_else(|| {
                ApgError::config(format!("per-unit latent `{}` has no unit axis", first))
            })?;
            Ok(vec![s, b, units])
        }
        _ => Ok(vec![s, b]),
    }
}

/// One APG update of the union of `blocks`.
///
/// Sub-blocks are proposed in order, each conditioned on the new values
/// of the earlier ones and the old values of the later ones. The
/// backward kernel of every sub-block is evaluated at its old value
/// under the same conditioning its forward kernel saw.
///
/// ```text
/// log w_f = log p(x | new) + log p(new block) - log q(new block | cond)
/// log w_b = log p(x | old) + log p(old block) - log q(old block | cond)
/// log w   = stop_grad(log w_f - log w_b)
/// ```
///
/// * `blocks` - one block (`small`) or every block in sweep order (`large`)
/// * `layout` - declared latent shapes
/// * `obs` - observation (S x B x ...)
/// * `latents` - current values of all latents
///
pub fn update_blocks<P, D>(
    blocks: &[&Block],
    proposal: &P,
    decoder: &D,
    layout: &ModelLayout,
    obs: &Tensor,
    latents: &NamedTensors,
    rng: &mut dyn RngCore,
) -> Result<BlockUpdate>
where
    P: ProposalOracle + ?Sized,
    D: DecoderOracle + ?Sized,
{
    let (s, b) = (obs.dim(0)?, obs.dim(1)?);
    let axes = weight_axes(blocks, layout, s, b)?;
    let label = blocks
        .iter()
        .map(|blk| blk.name.as_ref())
        .collect::<Vec<_>>()
        .join("+");

    let mut new_latents = latents.clone();
    let mut modes = NamedTensors::new();
    let mut log_q_f = vec![];
    let mut log_q_b = vec![];

    for &block in blocks {
        let cond = new_latents.clone();
        let fwd = proposal.propose(block, obs, &cond, rng)?;

        let values = fwd.values.select(&block.latents)?;
        layout.check_shapes(&values, s, b)?;

        let old = latents.select(&block.latents)?;
        let bwd = proposal.log_prob(block, obs, &cond, &old)?;

        for name in block.latents.iter() {
            log_q_f.push(reduce_to(name, fwd.log_q.require(name)?, &axes)?);
            log_q_b.push(reduce_to(name, &bwd.require(name)?.detach(), &axes)?);
            if let Some(m) = fwd.modes.get(name) {
                modes.insert(name, m.clone());
            }
        }
        new_latents.merge(&values);
    }

    let log_q_f = sum_all_of(log_q_f)?;
    let log_q_b = sum_all_of(log_q_b)?;

    let dec_f = decoder.decode(obs, &new_latents)?;
    let dec_b = decoder.decode(obs, latents)?;

    let llik_f = reduce_to("log-likelihood", &dec_f.log_likelihood, &axes)?;
    let llik_b = reduce_to("log-likelihood", &dec_b.log_likelihood.detach(), &axes)?;

    let mut prior_f = vec![];
    let mut prior_b = vec![];
    for block in blocks {
        for name in block.latents.iter() {
            prior_f.push(reduce_to(name, dec_f.log_prior.require(name)?, &axes)?);
            prior_b.push(reduce_to(name, &dec_b.log_prior.require(name)?.detach(), &axes)?);
        }
    }

    let log_w_f = ((&llik_f + sum_all_of(prior_f)?)? - &log_q_f)?;
    let log_w_b = ((llik_b + sum_all_of(prior_b)?)? - log_q_b)?;
    let log_w = (log_w_f - log_w_b)?.detach();

    let bad = count_non_finite(&log_w)?;
    if bad > 0 {
        return Err(ApgError::NumericInstability {
            stage: format!("block update `{}`", label),
            count: bad,
        });
    }

    let w = particle_softmax(&log_w)?;
    let loss_phi = weighted_nll(&w, &log_q_f)?;
    let loss_theta = weighted_nll(&w, &llik_f)?;

    let ess = effective_sample_size(&w)?;
    let (ess, log_weight) = if axes.len() > 2 {
        (ess.mean(1)?, log_w.sum(2)?)
    } else {
        (ess, log_w)
    };

    if log::log_enabled!(log::Level::Debug) {
        let mean_ess = ess.mean_all()?.to_dtype(DType::F32)?.to_scalar::<f32>()?;
        debug!("block `{}`: mean ESS {:.3} / {}", label, mean_ess, s);
    }

    let (log_joint, log_likelihood) = full_log_joint(&dec_f)?;

    Ok(BlockUpdate {
        latents: new_latents,
        log_weight,
        loss_phi,
        loss_theta,
        ess,
        modes,
        recon: dec_f.recon.map(|r| r.detach()),
        log_joint,
        log_likelihood,
    })
}

/// Detached `(log p(x, latents), log p(x | latents))`, both (S x B)
pub(crate) fn full_log_joint(decoded: &Decoded) -> Result<(Tensor, Tensor)> {
    let llik = sum_trailing(&decoded.log_likelihood.detach(), 2)?;
    let mut joint = llik.clone();
    for (_, log_p) in decoded.log_prior.iter() {
        joint = (joint + sum_trailing(&log_p.detach(), 2)?)?;
    }
    Ok((joint, llik))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::latents::LatentSpec;
    use crate::oracle::Proposal;
    use approx::assert_abs_diff_eq;
    use candle_core::{Device, Var};
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    /// `x ~ N(0, 1)` per unit, proposal always returns `x + 1`
    /// with a fixed log-density, so weights are closed-form.
    struct Shift;

    impl ProposalOracle for Shift {
        fn propose_all(&self, obs: &Tensor, _rng: &mut dyn RngCore) -> Result<Proposal> {
            let x = obs.zeros_like()?;
            Ok(Proposal {
                log_q: NamedTensors::new().with("x", x.zeros_like()?),
                values: NamedTensors::new().with("x", x),
                modes: NamedTensors::new(),
            })
        }

        fn propose(
            &self,
            _block: &Block,
            _obs: &Tensor,
            cond: &NamedTensors,
            _rng: &mut dyn RngCore,
        ) -> Result<Proposal> {
            let x = (cond.require("x")? + 1.)?;
            Ok(Proposal {
                log_q: NamedTensors::new().with("x", x.zeros_like()?),
                modes: NamedTensors::new().with("x", x.clone()),
                values: NamedTensors::new().with("x", x),
            })
        }

        fn log_prob(
            &self,
            _block: &Block,
            _obs: &Tensor,
            _cond: &NamedTensors,
            old: &NamedTensors,
        ) -> Result<NamedTensors> {
            Ok(NamedTensors::new().with("x", old.require("x")?.zeros_like()?))
        }
    }

    struct Quadratic;

    impl DecoderOracle for Quadratic {
        fn decode(&self, obs: &Tensor, latents: &NamedTensors) -> Result<Decoded> {
            let x = latents.require("x")?;
            Ok(Decoded {
                log_likelihood: obs.zeros_like()?,
                log_prior: NamedTensors::new().with("x", (x.sqr()? * -0.5)?),
                recon: None,
            })
        }
    }

    /// `Shift` with `log q = fwd * x_new` and `log r = bwd * x_old`
    struct Tracked {
        fwd: Var,
        bwd: Var,
    }

    impl ProposalOracle for Tracked {
        fn propose_all(&self, obs: &Tensor, rng: &mut dyn RngCore) -> Result<Proposal> {
            Shift.propose_all(obs, rng)
        }

        fn propose(
            &self,
            block: &Block,
            obs: &Tensor,
            cond: &NamedTensors,
            rng: &mut dyn RngCore,
        ) -> Result<Proposal> {
            let mut prop = Shift.propose(block, obs, cond, rng)?;
            let log_q = prop.values.require("x")?.broadcast_mul(self.fwd.as_tensor())?;
            prop.log_q.insert("x", log_q);
            Ok(prop)
        }

        fn log_prob(
            &self,
            _block: &Block,
            _obs: &Tensor,
            _cond: &NamedTensors,
            old: &NamedTensors,
        ) -> Result<NamedTensors> {
            let log_r = old.require("x")?.broadcast_mul(self.bwd.as_tensor())?;
            Ok(NamedTensors::new().with("x", log_r))
        }
    }

    /// `Quadratic` prior with `log p(x | latents) = scale * x`
    struct ScaledLikelihood {
        scale: Var,
    }

    impl DecoderOracle for ScaledLikelihood {
        fn decode(&self, obs: &Tensor, latents: &NamedTensors) -> Result<Decoded> {
            let mut decoded = Quadratic.decode(obs, latents)?;
            decoded.log_likelihood = latents.require("x")?.broadcast_mul(self.scale.as_tensor())?;
            Ok(decoded)
        }
    }

    fn setup(per_unit: bool) -> Result<(ModelLayout, Tensor, NamedTensors)> {
        let dev = Device::Cpu;
        let block = if per_unit {
            Block::per_unit("x", &["x"])
        } else {
            Block::new("x", &["x"])
        };
        let layout = ModelLayout::new(vec![LatentSpec::new("x", &[2])], vec![block])?;
        let obs = Tensor::zeros((3, 1, 2), DType::F32, &dev)?;
        let x = Tensor::new(&[[[0f32, 1.]], [[1., 0.]], [[2., 2.]]], &dev)?;
        Ok((layout, obs, NamedTensors::new().with("x", x)))
    }

    #[test]
    fn weight_is_forward_minus_backward() -> Result<()> {
        let (layout, obs, latents) = setup(false)?;
        let mut rng = SmallRng::seed_from_u64(0);
        let block = &layout.blocks()[0];
        let upd = update_blocks(&[block], &Shift, &Quadratic, &layout, &obs, &latents, &mut rng)?;

        // -0.5 * sum((x+1)^2 - x^2) = -0.5 * sum(2x + 1)
        let log_w = upd.log_weight.flatten_all()?.to_vec1::<f32>()?;
        assert_abs_diff_eq!(log_w[0], -2.0, epsilon = 1e-5);
        assert_abs_diff_eq!(log_w[1], -2.0, epsilon = 1e-5);
        assert_abs_diff_eq!(log_w[2], -5.0, epsilon = 1e-5);

        let new_x = upd.latents.require("x")?.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(new_x, vec![1., 2., 2., 1., 3., 3.]);
        Ok(())
    }

    #[test]
    fn per_unit_weights_are_summed_for_resampling() -> Result<()> {
        let (layout, obs, latents) = setup(true)?;
        let mut rng = SmallRng::seed_from_u64(0);
        let block = &layout.blocks()[0];
        let upd = update_blocks(&[block], &Shift, &Quadratic, &layout, &obs, &latents, &mut rng)?;
        assert_eq!(upd.log_weight.dims(), &[3, 1]);
        assert_eq!(upd.ess.dims(), &[1]);

        let log_w = upd.log_weight.flatten_all()?.to_vec1::<f32>()?;
        assert_abs_diff_eq!(log_w[2], -5.0, epsilon = 1e-5);

        // units are normalized separately: each unit favours particles 0 and 1
        let ess = upd.ess.to_vec1::<f32>()?[0];
        assert!(ess > 1. && ess < 3.);
        Ok(())
    }

    #[test]
    fn only_forward_terms_receive_gradient() -> Result<()> {
        let dev = Device::Cpu;
        let (layout, obs, latents) = setup(false)?;
        let proposal = Tracked {
            fwd: Var::new(0.5f32, &dev)?,
            bwd: Var::new(0.5f32, &dev)?,
        };
        let decoder = ScaledLikelihood {
            scale: Var::new(0.1f32, &dev)?,
        };
        let mut rng = SmallRng::seed_from_u64(0);
        let block = &layout.blocks()[0];
        let upd = update_blocks(&[block], &proposal, &decoder, &layout, &obs, &latents, &mut rng)?;

        // d loss_phi / d fwd = -sum_s w_s sum(x_new) < 0
        let grads = upd.loss_phi.backward()?;
        let g_fwd = grads
            .get(&proposal.fwd)
            .ok_or_else(|| ApgError::MissingOutput("forward gradient".into()))?
            .to_scalar::<f32>()?;
        assert!(g_fwd < 0.);
        assert!(grads.get(&proposal.bwd).is_none());
        assert!(grads.get(&decoder.scale).is_none());

        let grads = upd.loss_theta.backward()?;
        assert!(grads.get(&decoder.scale).is_some());
        assert!(grads.get(&proposal.fwd).is_none());
        assert!(grads.get(&proposal.bwd).is_none());

        let grads = upd.log_weight.sum_all()?.backward()?;
        for var in [&proposal.fwd, &proposal.bwd, &decoder.scale] {
            assert!(grads.get(var).is_none());
        }
        Ok(())
    }
}

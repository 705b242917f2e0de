use crate::block_update::full_log_joint;
use crate::config::{ApgConfig, BlockStrategy};
use crate::error::{ApgError, Result};
use crate::latents::{ModelLayout, NamedTensors};
use crate::oracle::{DecoderOracle, ProposalOracle};
use crate::resampler::Resampler;
use crate::sweep::{SweepController, SweepRecord};
use crate::trace::{Diagnostics, Trace, TraceRecorder};

use candle_core::{DType, Tensor};
use candle_util::candle_loss_functions::{elbo, eubo, weighted_nll};
use candle_util::candle_particle_ops::*;
use indicatif::{ProgressBar, ProgressDrawTarget};
use log::info;
use rand::rngs::SmallRng;
use rand::{RngCore, SeedableRng};
use rayon::prelude::*;

/// Scalar summaries of the one-shot importance weights
pub struct OneShotMetrics {
    /// mean_B sum_S w * log_w
    pub eubo: Tensor,
    /// mean log_w
    pub elbo: Tensor,
    /// mean_B 1 / sum_S w^2
    pub ess: Tensor,
}

pub struct OneShot {
    pub latents: NamedTensors,
    /// detached log-weight (S x B)
    pub log_weight: Tensor,
    pub record: SweepRecord,
    pub metrics: OneShotMetrics,
}

/// Reweighted wake-sleep step: propose every latent from the
/// observation alone and weight by `log p(x, latents) - log q(latents | x)`.
pub fn one_shot<P, D>(
    proposal: &P,
    decoder: &D,
    layout: &ModelLayout,
    obs: &Tensor,
    rng: &mut dyn RngCore,
) -> Result<OneShot>
where
    P: ProposalOracle + ?Sized,
    D: DecoderOracle + ?Sized,
{
    let (s, b) = (obs.dim(0)?, obs.dim(1)?);

    let prop = proposal.propose_all(obs, rng)?;
    let latents = prop.values.select(&layout.latent_names())?;
    layout.check_shapes(&latents, s, b)?;

    let mut log_q: Option<Tensor> = None;
    for name in layout.latent_names() {
        let lq = prop.log_q.require(name)?;
        let dims = lq.dims();
        if dims.len() < 2 || dims[..2] != [s, b] {
            return Err(ApgError::shape_mismatch(name, &[s, b], dims));
        }
        let lq = sum_trailing(lq, 2)?;
        log_q = Some(match log_q {
            Some(acc) => (acc + lq)?,
            None => lq,
        });
    }
    let log_q = log_q.ok_or_else(|| ApgError::config("a model needs at least one latent"))?;

    let decoded = decoder.decode(obs, &latents)?;
    let llik = sum_trailing(&decoded.log_likelihood, 2)?;
    let mut log_p = llik.clone();
    for name in layout.latent_names() {
        log_p = (log_p + sum_trailing(decoded.log_prior.require(name)?, 2)?)?;
    }

    let log_w = (&log_p - &log_q)?.detach();
    let bad = count_non_finite(&log_w)?;
    if bad > 0 {
        return Err(ApgError::NumericInstability {
            stage: "one-shot proposal".into(),
            count: bad,
        });
    }

    let w = particle_softmax(&log_w)?;
    let ess = effective_sample_size(&w)?;
    let metrics = OneShotMetrics {
        eubo: eubo(&w, &log_w)?,
        elbo: elbo(&log_w)?,
        ess: ess.mean_all()?,
    };

    let (log_joint, log_likelihood) = full_log_joint(&decoded)?;

    let record = SweepRecord {
        loss_phi: weighted_nll(&w, &log_q)?,
        loss_theta: weighted_nll(&w, &llik)?,
        ess,
        modes: prop.modes,
        recon: decoded.recon.map(|r| r.detach()),
        log_joint,
        log_likelihood,
        num_resamples: 0,
    };

    Ok(OneShot {
        latents,
        log_weight: log_w,
        record,
        metrics,
    })
}

/// Run one-shot initialization followed by `sweep_count` APG sweeps.
///
/// ```text
/// INIT -> RESAMPLE -> SWEEP_1 -> ... -> SWEEP_M -> DONE
/// ```
///
/// Every sweep resamples all latents with one ancestor index per
/// block update, so particles stay paired across latents.
///
/// * `proposal` - forward and backward kernels
/// * `decoder` - likelihood and priors
/// * `resampler` - ancestor sampling policy
/// * `block_strategy` - `small` or `large`
/// * `sweep_count` - number of sweeps `M`, zero is the one-shot result
/// * `obs` - observation (S x B x ...)
/// * `layout` - latent shapes and block order
/// * `diagnostics` - which trace fields to record
///
/// # Returns a trace with a leading axis of size `1 + M`
#[allow(clippy::too_many_arguments)]
pub fn run_apg<P, D>(
    proposal: &P,
    decoder: &D,
    resampler: Resampler,
    block_strategy: BlockStrategy,
    sweep_count: usize,
    obs: &Tensor,
    layout: &ModelLayout,
    diagnostics: Diagnostics,
    rng: &mut dyn RngCore,
) -> Result<Trace>
where
    P: ProposalOracle + ?Sized,
    D: DecoderOracle + ?Sized,
{
    let pb = ProgressBar::hidden();
    drive(
        proposal,
        decoder,
        resampler,
        block_strategy,
        sweep_count,
        obs,
        layout,
        diagnostics,
        rng,
        &pb,
    )
}

#[allow(clippy::too_many_arguments)]
fn drive<P, D>(
    proposal: &P,
    decoder: &D,
    resampler: Resampler,
    block_strategy: BlockStrategy,
    sweep_count: usize,
    obs: &Tensor,
    layout: &ModelLayout,
    diagnostics: Diagnostics,
    rng: &mut dyn RngCore,
    pb: &ProgressBar,
) -> Result<Trace>
where
    P: ProposalOracle + ?Sized,
    D: DecoderOracle + ?Sized,
{
    let dims = obs.dims();
    if dims.len() < 2 || dims[0] == 0 || dims[1] == 0 {
        return Err(ApgError::shape_mismatch("observation", &[1, 1], dims));
    }

    let mut recorder = TraceRecorder::new(diagnostics, &layout.latent_names());

    let init = one_shot(proposal, decoder, layout, obs, rng)?;
    info!(
        "one-shot: ESS {:.3}, ELBO {:.3}",
        scalar(&init.metrics.ess)?,
        scalar(&init.metrics.elbo)?
    );
    recorder.record(&init.record)?;
    pb.inc(1);

    let ancestors = resampler.sample_ancestor_index(&init.log_weight, rng)?;
    let mut latents = init.latents.resample(&ancestors)?;

    let controller = SweepController::new(proposal, decoder, layout, resampler, block_strategy);

    for sweep in 1..=sweep_count {
        let (next, record) = controller.sweep(obs, latents, rng)?;
        info!(
            "sweep {}/{}: ESS {:.3}, log-joint {:.3}",
            sweep,
            sweep_count,
            scalar(&record.ess)?,
            scalar(&particle_mean(&record.log_joint)?)?
        );
        recorder.record(&record)?;
        latents = next;
        pb.inc(1);
    }

    pb.finish_and_clear();
    recorder.finish()
}

fn scalar(x: &Tensor) -> Result<f32> {
    Ok(x.mean_all()?.to_dtype(DType::F32)?.to_scalar::<f32>()?)
}

/// APG sampler bound to one model and one configuration
pub struct ApgSampler<P, D> {
    proposal: P,
    decoder: D,
    layout: ModelLayout,
    config: ApgConfig,
}

impl<P, D> ApgSampler<P, D>
where
    P: ProposalOracle,
    D: DecoderOracle,
{
    /// Invalid configurations fail here rather than mid-run
    pub fn new(proposal: P, decoder: D, layout: ModelLayout, config: ApgConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            proposal,
            decoder,
            layout,
            config,
        })
    }

    fn check_observation(&self, obs: &Tensor) -> Result<()> {
        let dims = obs.dims();
        let s = self.config.num_particles;
        if dims.len() < 2 || dims[0] != s || dims[1] == 0 {
            let b = dims.get(1).copied().unwrap_or(1).max(1);
            return Err(ApgError::shape_mismatch("observation", &[s, b], dims));
        }
        Ok(())
    }

    /// Run the sampler on one batch
    ///
    /// * `obs` - observation (S x B x ...) with `S` particles
    /// * `diagnostics` - which trace fields to record
    /// * `rng` - all randomness of the run
    pub fn run(
        &self,
        obs: &Tensor,
        diagnostics: Diagnostics,
        rng: &mut dyn RngCore,
    ) -> Result<Trace> {
        self.check_observation(obs)?;

        let pb = ProgressBar::new(self.config.num_sweeps as u64 + 1);
        if !self.config.show_progress {
            pb.set_draw_target(ProgressDrawTarget::hidden());
        }

        drive(
            &self.proposal,
            &self.decoder,
            Resampler::new(self.config.resampling_strategy),
            self.config.block_strategy,
            self.config.num_sweeps,
            obs,
            &self.layout,
            diagnostics,
            rng,
            &pb,
        )
    }
}

impl<P, D> ApgSampler<P, D>
where
    P: ProposalOracle + Sync,
    D: DecoderOracle + Sync,
{
    /// Split the batch axis into disjoint slices and run each slice on
    /// its own worker with an independent `SmallRng(seed + worker)`.
    ///
    /// * `num_workers` - number of slices; `0` uses every CPU
    ///
    /// # Returns the merged trace over the full batch
    pub fn run_batch_parallel(
        &self,
        obs: &Tensor,
        diagnostics: Diagnostics,
        num_workers: usize,
        seed: u64,
    ) -> Result<Trace> {
        self.check_observation(obs)?;

        let batch_size = obs.dim(1)?;
        let num_workers = if num_workers == 0 {
            num_cpus::get()
        } else {
            num_workers
        };
        let num_workers = num_workers.min(batch_size).max(1);
        let chunk = batch_size.div_ceil(num_workers);

        let slices: Vec<(usize, usize)> = (0..batch_size)
            .step_by(chunk)
            .map(|lb| (lb, chunk.min(batch_size - lb)))
            .collect();

        info!(
            "running {} batch slice(s) of up to {} instance(s)",
            slices.len(),
            chunk
        );

        let parts = slices
            .into_par_iter()
            .enumerate()
            .map(|(i, (lb, len))| -> Result<(Trace, usize)> {
                let mut rng = SmallRng::seed_from_u64(seed.wrapping_add(i as u64));
                let part = obs.narrow(1, lb, len)?.contiguous()?;
                let trace = run_apg(
                    &self.proposal,
                    &self.decoder,
                    Resampler::new(self.config.resampling_strategy),
                    self.config.block_strategy,
                    self.config.num_sweeps,
                    &part,
                    &self.layout,
                    diagnostics,
                    &mut rng,
                )?;
                Ok((trace, len))
            })
            .collect::<Result<Vec<_>>>()?;

        Trace::concat_batches(&parts)
    }
}

use crate::block_update::{update_blocks, BlockUpdate};
use crate::config::BlockStrategy;
use crate::error::{ApgError, Result};
use crate::latents::{ModelLayout, NamedTensors};
use crate::oracle::{DecoderOracle, ProposalOracle};
use crate::resampler::Resampler;

use candle_core::Tensor;
use rand::RngCore;

/// Per-sweep diagnostics before they are reduced into the trace
pub struct SweepRecord {
    /// summed over the sweep's block updates
    pub loss_phi: Tensor,
    pub loss_theta: Tensor,
    /// mean over the sweep's block updates (B)
    pub ess: Tensor,
    /// proposal statistics, one entry per latent
    pub modes: NamedTensors,
    pub recon: Option<Tensor>,
    /// log p(x, latents) of the last forward decode (S x B)
    pub log_joint: Tensor,
    /// log p(x | latents) of the last forward decode (S x B)
    pub log_likelihood: Tensor,
    pub num_resamples: usize,
}

impl SweepRecord {
    fn from_updates(updates: Vec<BlockUpdate>, num_resamples: usize) -> Result<Self> {
        let mut loss_phi: Option<Tensor> = None;
        let mut loss_theta: Option<Tensor> = None;
        let mut ess = vec![];
        let mut modes = NamedTensors::new();
        let mut last = None;

        for upd in updates {
            loss_phi = Some(match loss_phi {
                Some(acc) => (acc + &upd.loss_phi)?,
                None => upd.loss_phi.clone(),
            });
            loss_theta = Some(match loss_theta {
                Some(acc) => (acc + &upd.loss_theta)?,
                None => upd.loss_theta.clone(),
            });
            ess.push(upd.ess.clone());
            modes.merge(&upd.modes);
            last = Some(upd);
        }

        let (Some(loss_phi), Some(loss_theta), Some(last)) = (loss_phi, loss_theta, last) else {
            return Err(ApgError::config("a sweep needs at least one block"));
        };

        Ok(Self {
            loss_phi,
            loss_theta,
            ess: Tensor::stack(&ess, 0)?.mean(0)?,
            modes,
            recon: last.recon,
            log_joint: last.log_joint,
            log_likelihood: last.log_likelihood,
            num_resamples,
        })
    }
}

/// Runs one sweep of block updates over a fixed block order
pub struct SweepController<'a, P: ?Sized, D: ?Sized> {
    proposal: &'a P,
    decoder: &'a D,
    layout: &'a ModelLayout,
    resampler: Resampler,
    strategy: BlockStrategy,
}

impl<'a, P, D> SweepController<'a, P, D>
where
    P: ProposalOracle + ?Sized,
    D: DecoderOracle + ?Sized,
{
    pub fn new(
        proposal: &'a P,
        decoder: &'a D,
        layout: &'a ModelLayout,
        resampler: Resampler,
        strategy: BlockStrategy,
    ) -> Self {
        Self {
            proposal,
            decoder,
            layout,
            resampler,
            strategy,
        }
    }

    /// One sweep over every block.
    ///
    /// `small` updates blocks one at a time and resamples all latents
    /// after each update. `large` updates the union of the blocks in one
    /// step and resamples once.
    ///
    /// # Returns resampled latents and the sweep's diagnostics
    pub fn sweep(
        &self,
        obs: &Tensor,
        latents: NamedTensors,
        rng: &mut dyn RngCore,
    ) -> Result<(NamedTensors, SweepRecord)> {
        let blocks = self.layout.blocks();
        let groups: Vec<Vec<_>> = match self.strategy {
            BlockStrategy::Small => blocks.iter().map(|b| vec![b]).collect(),
            BlockStrategy::Large => vec![blocks.iter().collect()],
        };

        let mut latents = latents;
        let mut updates = Vec::with_capacity(groups.len());

        for group in groups {
            let upd = update_blocks(
                &group,
                self.proposal,
                self.decoder,
                self.layout,
                obs,
                &latents,
                rng,
            )?;
            let ancestors = self.resampler.sample_ancestor_index(&upd.log_weight, rng)?;
            latents = upd.latents.resample(&ancestors)?;
            updates.push(upd);
        }

        let num_resamples = updates.len();
        let record = SweepRecord::from_updates(updates, num_resamples)?;
        Ok((latents, record))
    }
}

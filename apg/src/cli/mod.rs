pub mod gmm;
pub mod ring;

use crate::config::{ApgConfig, BlockStrategy, ResamplingStrategy};
use crate::driver::ApgSampler;
use crate::oracle::{DecoderOracle, ProposalOracle};
use crate::trace::{Diagnostics, Trace};

use anyhow::Result;
use candle_core::{DType, Tensor};
use clap::{Args, Parser, Subcommand};
use log::info;
use rand::rngs::SmallRng;
use rand::SeedableRng;
use serde::Serialize;
use std::path::PathBuf;

pub use gmm::{GmmArgs, ProposalType};
pub use ring::RingArgs;

#[derive(Parser)]
#[command(name = "apg")]
#[command(about = "Amortized Population Gibbs sampling on simulated mixtures")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Gaussian mixture with conjugate or amortized proposals
    Gmm(GmmArgs),
    /// Mixture of rings with per-point angles
    Ring(RingArgs),
}

/// Sampler options shared by every model
#[derive(Args, Debug, Clone)]
pub struct SamplerArgs {
    #[arg(long, help = "JSON configuration; flags below override it")]
    pub config: Option<PathBuf>,

    #[arg(long, value_enum)]
    pub block: Option<BlockStrategy>,

    #[arg(long, value_enum)]
    pub resampling: Option<ResamplingStrategy>,

    #[arg(long, help = "Number of APG sweeps after the one-shot step")]
    pub sweeps: Option<usize>,

    #[arg(long, help = "Number of particles (S)")]
    pub particles: Option<usize>,

    #[arg(long, help = "Number of simulated instances (B)")]
    pub batch: Option<usize>,

    #[arg(long, default_value = "42")]
    pub seed: u64,

    #[arg(long, help = "Split the batch across this many workers (0: all CPUs)")]
    pub workers: Option<usize>,

    #[arg(long)]
    pub progress: bool,
}

impl SamplerArgs {
    pub fn to_config(&self) -> Result<ApgConfig> {
        let mut config = match self.config.as_ref() {
            Some(path) => ApgConfig::from_json_file(path)?,
            None => ApgConfig::default(),
        };
        if let Some(block) = self.block {
            config.block_strategy = block;
        }
        if let Some(resampling) = self.resampling {
            config.resampling_strategy = resampling;
        }
        if let Some(sweeps) = self.sweeps {
            config.num_sweeps = sweeps;
        }
        if let Some(s) = self.particles {
            config.num_particles = s;
        }
        if let Some(b) = self.batch {
            config.batch_size = b;
        }
        config.show_progress |= self.progress;
        config.validate()?;
        Ok(config)
    }
}

/// Per-sweep averages over the batch, printed as JSON
#[derive(Serialize, Debug)]
pub struct TraceSummary {
    pub model: String,
    pub config: ApgConfig,
    pub loss_phi: Vec<f32>,
    pub loss_theta: Vec<f32>,
    pub ess: Vec<f32>,
    pub density: Vec<f32>,
    pub log_likelihood: Vec<f32>,
}

fn per_sweep(x: Option<&Tensor>) -> Result<Vec<f32>> {
    let Some(x) = x else {
        return Ok(vec![]);
    };
    let x = x.detach().to_dtype(DType::F32)?;
    let x = if x.rank() > 1 { x.flatten_from(1)?.mean(1)? } else { x };
    Ok(x.to_vec1::<f32>()?)
}

impl TraceSummary {
    pub fn new(model: &str, config: &ApgConfig, trace: &Trace) -> Result<Self> {
        Ok(Self {
            model: model.to_string(),
            config: config.clone(),
            loss_phi: per_sweep(trace.loss_phi.as_ref())?,
            loss_theta: per_sweep(trace.loss_theta.as_ref())?,
            ess: per_sweep(trace.ess.as_ref())?,
            density: per_sweep(trace.density.as_ref())?,
            log_likelihood: per_sweep(trace.log_likelihood.as_ref())?,
        })
    }
}

/// Run a sampler on `obs`, sequentially or split across workers
pub(crate) fn run_sampler<P, D>(
    sampler: &ApgSampler<P, D>,
    obs: &Tensor,
    args: &SamplerArgs,
    rng: &mut SmallRng,
) -> Result<Trace>
where
    P: ProposalOracle + Sync,
    D: DecoderOracle + Sync,
{
    let diagnostics = Diagnostics::all();
    let trace = match args.workers {
        Some(workers) => {
            info!("batch-parallel run");
            sampler.run_batch_parallel(obs, diagnostics, workers, args.seed.wrapping_add(1))?
        }
        None => sampler.run(obs, diagnostics, rng)?,
    };
    Ok(trace)
}

pub(crate) fn seeded_rng(args: &SamplerArgs) -> SmallRng {
    SmallRng::seed_from_u64(args.seed)
}

pub(crate) fn print_summary(summary: &TraceSummary) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(summary)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn flags_override_defaults() -> Result<()> {
        let cli = Cli::try_parse_from([
            "apg", "gmm", "--block", "large", "--sweeps", "0", "--particles", "4",
        ])?;
        let Commands::Gmm(args) = cli.command else {
            anyhow::bail!("expected the gmm subcommand");
        };
        let config = args.sampler.to_config()?;
        assert_eq!(config.block_strategy, BlockStrategy::Large);
        assert_eq!(config.num_sweeps, 0);
        assert_eq!(config.num_particles, 4);
        assert_eq!(config.resampling_strategy, ResamplingStrategy::Systematic);
        Ok(())
    }

    #[test]
    fn unknown_block_strategy_is_rejected() {
        let res = Cli::try_parse_from(["apg", "ring", "--block", "medium"]);
        assert!(res.is_err());
    }

    #[test]
    fn summary_averages_over_batch() -> Result<()> {
        let dev = Device::Cpu;
        let trace = Trace {
            ess: Some(Tensor::new(&[[1f32, 3.], [2., 4.]], &dev)?),
            loss_phi: Some(Tensor::new(&[0.5f32, 0.25], &dev)?),
            ..Default::default()
        };
        let summary = TraceSummary::new("gmm", &ApgConfig::default(), &trace)?;
        assert_eq!(summary.ess, vec![2., 3.]);
        assert_eq!(summary.loss_phi, vec![0.5, 0.25]);
        assert!(summary.density.is_empty());
        Ok(())
    }
}

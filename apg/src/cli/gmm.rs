use super::*;
use crate::models::encoders::DEFAULT_NUM_HIDDEN;
use crate::models::gmm::*;

use candle_core::Device;
use candle_nn::{VarBuilder, VarMap};
use clap::ValueEnum;

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProposalType {
    /// exact Gibbs conditionals
    Conjugate,
    /// untrained neural proposals
    Amortized,
}

#[derive(Args, Debug)]
pub struct GmmArgs {
    #[arg(short = 'k', long, default_value = "3")]
    pub clusters: usize,

    #[arg(short = 'n', long, default_value = "60")]
    pub points: usize,

    #[arg(short = 'd', long, default_value = "2")]
    pub dim: usize,

    #[arg(long, value_enum, default_value = "conjugate")]
    pub proposal: ProposalType,

    #[arg(long, default_value_t = DEFAULT_NUM_HIDDEN)]
    pub hidden: usize,

    #[command(flatten)]
    pub sampler: SamplerArgs,
}

pub fn run(args: &GmmArgs) -> Result<()> {
    let config = args.sampler.to_config()?;
    let dev = Device::Cpu;
    let mut rng = seeded_rng(&args.sampler);

    let prior = GmmPrior::default();
    let data = simulate_gmm(
        &prior,
        config.num_particles,
        config.batch_size,
        args.clusters,
        args.points,
        args.dim,
        &dev,
        &mut rng,
    )?;
    info!(
        "simulated {} mixture(s) of {} points in {} dimension(s)",
        config.batch_size, args.points, args.dim
    );

    let layout = gmm_layout(args.clusters, args.points, args.dim)?;
    let decoder = GaussianMixture::new(prior);

    let trace = match args.proposal {
        ProposalType::Conjugate => {
            let proposal = ConjugateGmmProposal::new(prior, args.clusters);
            let sampler = ApgSampler::new(proposal, decoder, layout, config.clone())?;
            run_sampler(&sampler, &data.obs, &args.sampler, &mut rng)?
        }
        ProposalType::Amortized => {
            let vm = VarMap::new();
            let vb = VarBuilder::from_varmap(&vm, DType::F32, &dev);
            let proposal = AmortizedGmmProposal::new(args.clusters, args.dim, args.hidden, vb)?;
            let sampler = ApgSampler::new(proposal, decoder, layout, config.clone())?;
            run_sampler(&sampler, &data.obs, &args.sampler, &mut rng)?
        }
    };

    print_summary(&TraceSummary::new("gmm", &config, &trace)?)
}

use super::*;
use crate::models::encoders::DEFAULT_NUM_HIDDEN;
use crate::models::ring::*;

use candle_core::Device;
use candle_nn::{VarBuilder, VarMap};

#[derive(Args, Debug)]
pub struct RingArgs {
    #[arg(short = 'k', long, default_value = "3")]
    pub clusters: usize,

    #[arg(short = 'n', long, default_value = "60")]
    pub points: usize,

    #[arg(long, default_value = "2.0", help = "Radius of every ring")]
    pub radius: f64,

    #[arg(long, default_value_t = DEFAULT_NUM_HIDDEN)]
    pub hidden: usize,

    #[command(flatten)]
    pub sampler: SamplerArgs,
}

pub fn run(args: &RingArgs) -> Result<()> {
    let config = args.sampler.to_config()?;
    let dev = Device::Cpu;
    let mut rng = seeded_rng(&args.sampler);

    let prior = RingPrior {
        radius: args.radius,
        ..Default::default()
    };
    let obs = simulate_rings(
        &prior,
        config.num_particles,
        config.batch_size,
        args.clusters,
        args.points,
        &dev,
        &mut rng,
    )?;
    info!(
        "simulated {} ring mixture(s) of {} points",
        config.batch_size, args.points
    );

    let vm = VarMap::new();
    let vb = VarBuilder::from_varmap(&vm, DType::F32, &dev);
    let proposal = AmortizedRingProposal::new(args.clusters, args.hidden, prior.radius, vb)?;
    let layout = ring_layout(args.clusters, args.points)?;
    let sampler = ApgSampler::new(proposal, RingMixture::new(prior), layout, config.clone())?;

    let trace = run_sampler(&sampler, &obs, &args.sampler, &mut rng)?;
    print_summary(&TraceSummary::new("ring", &config, &trace)?)
}

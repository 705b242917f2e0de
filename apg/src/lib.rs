pub mod block_update;
pub mod cli;
pub mod config;
pub mod driver;
pub mod error;
pub mod latents;
pub mod models;
pub mod oracle;
pub mod resampler;
pub mod sweep;
pub mod trace;

pub use config::{ApgConfig, BlockStrategy, ResamplingStrategy};
pub use driver::{one_shot, run_apg, ApgSampler, OneShot, OneShotMetrics};
pub use error::{ApgError, Result};
pub use latents::{Block, LatentSpec, ModelLayout, NamedTensors};
pub use oracle::{Decoded, DecoderOracle, Proposal, ProposalOracle};
pub use resampler::Resampler;
pub use trace::{Diagnostics, Trace};

pub use candle_core;
pub use candle_nn;

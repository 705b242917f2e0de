pub mod candle_aux_layers;
pub mod candle_distributions;
pub mod candle_loss_functions;
pub mod candle_particle_ops;

pub use candle_core;
pub use candle_nn;

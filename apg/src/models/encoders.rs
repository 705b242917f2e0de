//! Amortized proposal networks shared by the mixture models.

use crate::error::Result;

use candle_core::{Tensor, D};
use candle_nn::{ops, Activation, Linear, VarBuilder};
use candle_util::candle_aux_layers::{stack_mlp, StackLayers};
use candle_util::candle_distributions::Normal;

pub const DEFAULT_NUM_HIDDEN: usize = 32;

/// Gaussian proposal for cluster centres from soft or hard assignments.
///
/// Every cluster `k` is summarized by the assignment-weighted mean of
/// the points and the fraction of points it holds; an MLP maps the
/// summary to the location and log-scale of `mu_k`.
pub struct ClusterStatsEncoder {
    mlp: StackLayers<Linear>,
    dim: usize,
}

impl ClusterStatsEncoder {
    pub fn new(dim: usize, num_hidden: usize, vb: VarBuilder) -> Result<Self> {
        let mlp = stack_mlp(&[dim + 1, num_hidden, 2 * dim], Activation::Relu, vb)?;
        Ok(Self { mlp, dim })
    }

    /// * `points` - data (S x B x N x D)
    /// * `assignments` - one-hot or soft assignments (S x B x N x K)
    ///
    /// # Returns `Normal` over `mu` (S x B x K x D)
    pub fn forward(&self, points: &Tensor, assignments: &Tensor) -> Result<Normal> {
        let n = points.dim(2)? as f64;
        let a_kn = assignments.transpose(2, 3)?.contiguous()?;
        let counts = a_kn.sum_keepdim(3)?; // S x B x K x 1
        let sums = a_kn.matmul(&points.contiguous()?)?; // S x B x K x D
        let means = sums.broadcast_div(&(&counts + 1.)?)?;
        let summary = Tensor::cat(&[means, (counts / n)?], 3)?;

        let out = self.mlp.forward_rows(&summary)?;
        let loc = out.narrow(3, 0, self.dim)?.contiguous()?;
        let log_scale = out.narrow(3, self.dim, self.dim)?;
        Ok(Normal::from_log_scale(loc, &log_scale)?)
    }
}

/// Soft cluster responsibilities from individual points
pub struct SoftAssignmentEncoder {
    mlp: StackLayers<Linear>,
}

impl SoftAssignmentEncoder {
    pub fn new(dim: usize, num_clusters: usize, num_hidden: usize, vb: VarBuilder) -> Result<Self> {
        let mlp = stack_mlp(&[dim, num_hidden, num_clusters], Activation::Relu, vb)?;
        Ok(Self { mlp })
    }

    /// (S x B x N x D) -> (S x B x N x K), rows sum to one
    pub fn forward(&self, points: &Tensor) -> Result<Tensor> {
        let logits = self.mlp.forward_rows(points)?;
        Ok(ops::softmax(&logits, D::Minus1)?)
    }
}

/// Scores every (point, cluster) pair from the point and the centre
pub struct PairwiseEncoder {
    mlp: StackLayers<Linear>,
}

impl PairwiseEncoder {
    pub fn new(dim: usize, num_outputs: usize, num_hidden: usize, vb: VarBuilder) -> Result<Self> {
        let mlp = stack_mlp(&[2 * dim, num_hidden, num_outputs], Activation::Relu, vb)?;
        Ok(Self { mlp })
    }

    /// * `points` - data (S x B x N x D)
    /// * `mu` - cluster centres (S x B x K x D)
    ///
    /// # Returns (S x B x N x K x outputs)
    pub fn forward(&self, points: &Tensor, mu: &Tensor) -> Result<Tensor> {
        let (s, b, n, d) = points.dims4()?;
        let k = mu.dim(2)?;
        let shape = (s, b, n, k, d);
        let x = points.unsqueeze(3)?.broadcast_as(shape)?.contiguous()?;
        let m = mu.unsqueeze(2)?.broadcast_as(shape)?.contiguous()?;
        let pair = Tensor::cat(&[x, m], 4)?;
        Ok(self.mlp.forward_rows(&pair)?)
    }
}

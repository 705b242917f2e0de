use candle_core::{Result, Tensor};

use crate::candle_particle_ops::PARTICLE_AXIS;

/// Importance-weighted negative log-density
///
/// loss = mean_b sum_u sum_s w(s,b,u) * [ -log p(s,b,u) ]
///
/// The weights only reweight; they never carry gradient.
///
/// * `w_s` - normalized weights (S x B [x U])
/// * `log_p_s` - log-density with the same shape as `w_s`
///
pub fn weighted_nll(w_s: &Tensor, log_p_s: &Tensor) -> Result<Tensor> {
    let per_batch = w_s.detach().mul(&log_p_s.neg()?)?.sum(PARTICLE_AXIS)?;
    let per_batch = if per_batch.rank() > 1 {
        per_batch.sum(per_batch.rank() - 1)?
    } else {
        per_batch
    };
    per_batch.mean_all()
}

/// Evidence upper bound surrogate
///
/// eubo = mean_b sum_s w(s,b) * log_w(s,b)
///
/// * `w_s` - normalized weights (S x B), treated as constants
/// * `log_w_s` - unnormalized log-weights (S x B), differentiable
///
pub fn eubo(w_s: &Tensor, log_w_s: &Tensor) -> Result<Tensor> {
    w_s.detach().mul(log_w_s)?.sum(PARTICLE_AXIS)?.mean_all()
}

/// Evidence lower bound estimate
///
/// elbo = mean_{s,b} log_w(s,b)
///
pub fn elbo(log_w_s: &Tensor) -> Result<Tensor> {
    log_w_s.mean_all()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candle_particle_ops::particle_softmax;
    use candle_core::{Device, Var};

    #[test]
    fn weighted_nll_is_weighted_average() -> Result<()> {
        let dev = Device::Cpu;
        let w = Tensor::new(&[[0.25f32, 1.0], [0.75, 0.0]], &dev)?;
        let log_p = Tensor::new(&[[-1f32, -3.], [-2., -5.]], &dev)?;

        // batch 0: 0.25 * 1 + 0.75 * 2 = 1.75, batch 1: 3
        let loss = weighted_nll(&w, &log_p)?.to_scalar::<f32>()?;
        assert!((loss - (1.75 + 3.) / 2.).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn weighted_nll_sums_units() -> Result<()> {
        let dev = Device::Cpu;
        let w = Tensor::new(&[[[0.5f32, 0.5]], [[0.5, 0.5]]], &dev)?;
        let log_p = Tensor::new(&[[[-1f32, -1.]], [[-1., -1.]]], &dev)?;
        let loss = weighted_nll(&w, &log_p)?.to_scalar::<f32>()?;
        assert!((loss - 2.).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn weights_carry_no_gradient() -> Result<()> {
        let dev = Device::Cpu;
        let log_w = Var::new(&[[0.3f32], [-0.2], [1.0]], &dev)?;
        let log_p = Var::new(&[[-1.0f32], [-2.0], [-0.5]], &dev)?;

        let w = particle_softmax(log_w.as_tensor())?;
        let loss = weighted_nll(&w, log_p.as_tensor())?;
        let grads = loss.backward()?;

        assert!(grads.get(log_w.as_tensor()).is_none());
        assert!(grads.get(log_p.as_tensor()).is_some());
        Ok(())
    }
}

use crate::error::{ApgError, Result};
use crate::latents::NamedTensors;
use crate::sweep::SweepRecord;

use candle_core::Tensor;
use candle_util::candle_particle_ops::particle_mean;

/// Which diagnostics the driver records
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Diagnostics {
    pub loss: bool,
    pub ess: bool,
    /// posterior-mode estimates (`E_mu`, `E_z`, ...) and `E_recon`
    pub mode: bool,
    /// particle mean of the log joint
    pub density: bool,
    pub likelihood: bool,
}

impl Diagnostics {
    pub fn all() -> Self {
        Self {
            loss: true,
            ess: true,
            mode: true,
            density: true,
            likelihood: true,
        }
    }

    pub fn losses_only() -> Self {
        Self {
            loss: true,
            ..Default::default()
        }
    }
}

/// Per-sweep diagnostics stacked along a leading sweep axis of size `1 + M`.
///
/// Index 0 holds the one-shot initialization, index `i` the i-th sweep.
#[derive(Clone, Debug, Default)]
pub struct Trace {
    /// (1+M), differentiable
    pub loss_phi: Option<Tensor>,
    /// (1+M), differentiable
    pub loss_theta: Option<Tensor>,
    /// (1+M, B)
    pub ess: Option<Tensor>,
    /// per latent (1+M, B, ...)
    pub modes: Option<NamedTensors>,
    /// (1+M, B, ...)
    pub recon: Option<Tensor>,
    /// (1+M, B)
    pub density: Option<Tensor>,
    /// (1+M, B)
    pub log_likelihood: Option<Tensor>,
}

impl Trace {
    /// number of recorded steps, one-shot included
    pub fn len(&self) -> usize {
        [
            &self.loss_phi,
            &self.ess,
            &self.density,
            &self.log_likelihood,
            &self.recon,
        ]
        .into_iter()
        .flatten()
        .chain(self.modes.iter().flat_map(|m| m.iter().map(|(_, t)| t)))
        .find_map(|t| t.dims().first().copied())
        .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// e.g. `trace.mode("mu")` for `E_mu`
    pub fn mode(&self, name: &str) -> Option<&Tensor> {
        self.modes.as_ref().and_then(|m| m.get(name))
    }

    /// `sum_i loss_phi[i] + loss_theta[i]`, the objective a training
    /// loop would back-propagate
    pub fn total_loss(&self) -> Result<Tensor> {
        let phi = self
            .loss_phi
            .as_ref()
            .ok_or_else(|| ApgError::MissingOutput("loss_phi".into()))?;
        let theta = self
            .loss_theta
            .as_ref()
            .ok_or_else(|| ApgError::MissingOutput("loss_theta".into()))?;
        Ok((phi.sum_all()? + theta.sum_all()?)?)
    }

    /// Merge traces of disjoint batch slices.
    ///
    /// Per-batch fields are concatenated along the batch axis; losses
    /// are averaged with weights proportional to the slice sizes.
    ///
    /// * `parts` - `(trace, batch size)` in batch order
    pub fn concat_batches(parts: &[(Trace, usize)]) -> Result<Trace> {
        let total: usize = parts.iter().map(|(_, b)| b).sum();
        if parts.is_empty() || total == 0 {
            return Err(ApgError::config("nothing to merge"));
        }

        let weighted = |field: fn(&Trace) -> Option<&Tensor>| -> Result<Option<Tensor>> {
            let mut acc: Option<Tensor> = None;
            for (trace, b) in parts {
                let Some(t) = field(trace) else {
                    return Ok(None);
                };
                let t = (t * (*b as f64 / total as f64))?;
                acc = Some(match acc {
                    Some(a) => (a + t)?,
                    None => t,
                });
            }
            Ok(acc)
        };

        let batched = |field: fn(&Trace) -> Option<&Tensor>| -> Result<Option<Tensor>> {
            let tensors: Option<Vec<Tensor>> =
                parts.iter().map(|(trace, _)| field(trace).cloned()).collect();
            match tensors {
                Some(ts) => Ok(Some(Tensor::cat(&ts, 1)?)),
                None => Ok(None),
            }
        };

        let modes = match parts[0].0.modes.as_ref() {
            Some(first) => {
                let mut merged = NamedTensors::new();
                for name in first.names() {
                    let mut ts = Vec::with_capacity(parts.len());
                    for (trace, _) in parts {
                        let t = trace
                            .mode(name)
                            .ok_or_else(|| ApgError::MissingOutput(name.to_string()))?;
                        ts.push(t.clone());
                    }
                    merged.insert(name, Tensor::cat(&ts, 1)?);
                }
                Some(merged)
            }
            None => None,
        };

        Ok(Trace {
            loss_phi: weighted(|t| t.loss_phi.as_ref())?,
            loss_theta: weighted(|t| t.loss_theta.as_ref())?,
            ess: batched(|t| t.ess.as_ref())?,
            modes,
            recon: batched(|t| t.recon.as_ref())?,
            density: batched(|t| t.density.as_ref())?,
            log_likelihood: batched(|t| t.log_likelihood.as_ref())?,
        })
    }
}

/// Append-only per-diagnostic sequences, stacked once at the end
pub(crate) struct TraceRecorder {
    flags: Diagnostics,
    latent_names: Vec<Box<str>>,
    loss_phi: Vec<Tensor>,
    loss_theta: Vec<Tensor>,
    ess: Vec<Tensor>,
    modes: Vec<NamedTensors>,
    recon: Vec<Tensor>,
    density: Vec<Tensor>,
    log_likelihood: Vec<Tensor>,
}

impl TraceRecorder {
    pub fn new(flags: Diagnostics, latent_names: &[&str]) -> Self {
        Self {
            flags,
            latent_names: latent_names.iter().map(|&n| n.into()).collect(),
            loss_phi: vec![],
            loss_theta: vec![],
            ess: vec![],
            modes: vec![],
            recon: vec![],
            density: vec![],
            log_likelihood: vec![],
        }
    }

    pub fn record(&mut self, rec: &SweepRecord) -> Result<()> {
        if self.flags.loss {
            self.loss_phi.push(rec.loss_phi.clone());
            self.loss_theta.push(rec.loss_theta.clone());
        }
        if self.flags.ess {
            self.ess.push(rec.ess.detach());
        }
        if self.flags.mode {
            let mut modes = NamedTensors::new();
            for name in self.latent_names.iter() {
                let stat = rec
                    .modes
                    .get(name)
                    .ok_or_else(|| ApgError::MissingOutput(format!("mode of `{}`", name)))?;
                modes.insert(name, particle_mean(stat)?);
            }
            self.modes.push(modes);

            let recon = rec
                .recon
                .as_ref()
                .ok_or_else(|| ApgError::MissingOutput("reconstruction".into()))?;
            self.recon.push(particle_mean(recon)?);
        }
        if self.flags.density {
            self.density.push(particle_mean(&rec.log_joint)?);
        }
        if self.flags.likelihood {
            self.log_likelihood.push(particle_mean(&rec.log_likelihood)?);
        }
        Ok(())
    }

    pub fn finish(self) -> Result<Trace> {
        fn stack(xs: Vec<Tensor>) -> Result<Option<Tensor>> {
            if xs.is_empty() {
                Ok(None)
            } else {
                Ok(Some(Tensor::stack(&xs, 0)?))
            }
        }

        let modes = if self.flags.mode && !self.modes.is_empty() {
            let mut stacked = NamedTensors::new();
            for name in self.latent_names.iter() {
                let per_sweep = self
                    .modes
                    .iter()
                    .map(|m| m.require(name).cloned())
                    .collect::<Result<Vec<_>>>()?;
                stacked.insert(name, Tensor::stack(&per_sweep, 0)?);
            }
            Some(stacked)
        } else {
            None
        };

        Ok(Trace {
            loss_phi: stack(self.loss_phi)?,
            loss_theta: stack(self.loss_theta)?,
            ess: stack(self.ess)?,
            modes,
            recon: stack(self.recon)?,
            density: stack(self.density)?,
            log_likelihood: stack(self.log_likelihood)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use candle_core::{DType, Device};

    fn record(step: f32, b: usize) -> Result<SweepRecord> {
        let dev = Device::Cpu;
        Ok(SweepRecord {
            loss_phi: Tensor::new(step, &dev)?,
            loss_theta: Tensor::new(2. * step, &dev)?,
            ess: Tensor::full(step, b, &dev)?,
            modes: NamedTensors::new().with("mu", Tensor::full(step, (3, b, 2), &dev)?),
            recon: Some(Tensor::zeros((3, b, 4), DType::F32, &dev)?),
            log_joint: Tensor::full(-step, (3, b), &dev)?,
            log_likelihood: Tensor::full(-step, (3, b), &dev)?,
            num_resamples: 1,
        })
    }

    #[test]
    fn recorder_stacks_along_sweep_axis() -> Result<()> {
        let mut recorder = TraceRecorder::new(Diagnostics::all(), &["mu"]);
        for step in 0..3 {
            recorder.record(&record(step as f32, 2)?)?;
        }
        let trace = recorder.finish()?;

        assert_eq!(trace.len(), 3);
        assert_eq!(trace.loss_phi.as_ref().map(|t| t.dims().to_vec()), Some(vec![3]));
        assert_eq!(trace.mode("mu").map(|t| t.dims().to_vec()), Some(vec![3, 2, 2]));
        assert_eq!(trace.recon.as_ref().map(|t| t.dims().to_vec()), Some(vec![3, 2, 4]));
        assert_abs_diff_eq!(trace.total_loss()?.to_scalar::<f32>()?, 9.0, epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn unrequested_fields_stay_empty() -> Result<()> {
        let mut recorder = TraceRecorder::new(Diagnostics::losses_only(), &["mu"]);
        recorder.record(&record(1., 2)?)?;
        let trace = recorder.finish()?;
        assert!(trace.ess.is_none());
        assert!(trace.modes.is_none());
        assert_eq!(trace.len(), 1);
        Ok(())
    }

    #[test]
    fn missing_mode_is_an_error() -> Result<()> {
        let mut recorder = TraceRecorder::new(Diagnostics::all(), &["mu", "z"]);
        let res = recorder.record(&record(1., 2)?);
        assert!(matches!(res, Err(ApgError::MissingOutput(_))));
        Ok(())
    }

    #[test]
    fn batch_slices_merge() -> Result<()> {
        let mut parts = vec![];
        for (step, b) in [(1f32, 1usize), (4., 3)] {
            let mut recorder = TraceRecorder::new(Diagnostics::all(), &["mu"]);
            recorder.record(&record(step, b)?)?;
            parts.push((recorder.finish()?, b));
        }
        let merged = Trace::concat_batches(&parts)?;
        assert_eq!(merged.ess.as_ref().map(|t| t.dims().to_vec()), Some(vec![1, 4]));
        assert_eq!(merged.mode("mu").map(|t| t.dims().to_vec()), Some(vec![1, 4, 2]));

        // (1 * 1 + 4 * 3) / 4
        let loss = merged.loss_phi.as_ref().map(|t| t.to_vec1::<f32>());
        let loss = loss.transpose()?.unwrap_or_default();
        assert_abs_diff_eq!(loss[0], 3.25, epsilon = 1e-6);
        Ok(())
    }
}

use crate::error::{ApgError, Result};

use candle_core::Tensor;
use candle_util::candle_particle_ops::gather_particles;
use std::collections::HashSet;

/// Ordered name -> tensor record.
///
/// Used for latent values, for per-latent log-densities, and for
/// per-latent proposal statistics. Insertion order is kept so that
/// iteration follows the model's declaration order.
#[derive(Clone, Debug, Default)]
pub struct NamedTensors {
    entries: Vec<(Box<str>, Tensor)>,
}

impl NamedTensors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with(mut self, name: &str, tensor: Tensor) -> Self {
        self.insert(name, tensor);
        self
    }

    /// Insert or overwrite in place
    pub fn insert(&mut self, name: &str, tensor: Tensor) {
        match self.entries.iter_mut().find(|(n, _)| n.as_ref() == name) {
            Some((_, t)) => *t = tensor,
            None => self.entries.push((name.into(), tensor)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.entries
            .iter()
            .find(|(n, _)| n.as_ref() == name)
            .map(|(_, t)| t)
    }

    /// Like `get` but a missing entry is an error
    pub fn require(&self, name: &str) -> Result<&Tensor> {
        self.get(name)
            .ok_or_else(|| ApgError::MissingOutput(name.to_string()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_ref())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.entries.iter().map(|(n, t)| (n.as_ref(), t))
    }

    /// A sub-record with the given names; all of them must exist
    pub fn select<S: AsRef<str>>(&self, names: &[S]) -> Result<Self> {
        let mut ret = Self::new();
        for name in names {
            let name = name.as_ref();
            ret.insert(name, self.require(name)?.clone());
        }
        Ok(ret)
    }

    /// Overwrite (or add) every entry of `other`
    pub fn merge(&mut self, other: &Self) {
        for (name, t) in other.iter() {
            self.insert(name, t.clone());
        }
    }

    pub fn map<F>(&self, f: F) -> Result<Self>
    where
        F: Fn(&Tensor) -> candle_core::Result<Tensor>,
    {
        let mut entries = Vec::with_capacity(self.entries.len());
        for (name, t) in self.entries.iter() {
            entries.push((name.clone(), f(t)?));
        }
        Ok(Self { entries })
    }

    pub fn detach(&self) -> Self {
        Self {
            entries: self
                .entries
                .iter()
                .map(|(n, t)| (n.clone(), t.detach()))
                .collect(),
        }
    }

    /// Resample every entry with one ancestor index so that
    /// tensors belonging to the same particle stay paired.
    pub fn resample(&self, ancestors: &Tensor) -> Result<Self> {
        self.map(|t| gather_particles(t, ancestors))
    }
}

/// Declared shape of one latent variable after the `(S, B)` axes
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LatentSpec {
    pub name: Box<str>,
    pub event_shape: Vec<usize>,
}

impl LatentSpec {
    pub fn new(name: &str, event_shape: &[usize]) -> Self {
        Self {
            name: name.into(),
            event_shape: event_shape.to_vec(),
        }
    }

    /// `(S, B, event_shape...)`
    pub fn full_shape(&self, num_particles: usize, batch_size: usize) -> Vec<usize> {
        let mut shape = vec![num_particles, batch_size];
        shape.extend_from_slice(&self.event_shape);
        shape
    }
}

/// A set of latents updated together while the others stay fixed
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    pub name: Box<str>,
    pub latents: Vec<Box<str>>,
    /// latents are conditionally independent along axis 2, so the
    /// weights keep a unit axis `(S, B, U)` for normalization
    pub per_unit: bool,
}

impl Block {
    pub fn new(name: &str, latents: &[&str]) -> Self {
        Self {
            name: name.into(),
            latents: latents.iter().map(|&l| l.into()).collect(),
            per_unit: false,
        }
    }

    pub fn per_unit(name: &str, latents: &[&str]) -> Self {
        Self {
            per_unit: true,
            ..Self::new(name, latents)
        }
    }
}

/// Latent declarations plus the block order of a sweep
#[derive(Clone, Debug)]
pub struct ModelLayout {
    latents: Vec<LatentSpec>,
    blocks: Vec<Block>,
}

impl ModelLayout {
    /// Every latent must belong to exactly one block and per-unit
    /// blocks may only hold latents that have a unit axis.
    pub fn new(latents: Vec<LatentSpec>, blocks: Vec<Block>) -> Result<Self> {
        if latents.is_empty() {
            return Err(ApgError::config("a model needs at least one latent"));
        }
        if blocks.is_empty() {
            return Err(ApgError::config("a model needs at least one block"));
        }

        let mut seen = HashSet::new();
        for spec in latents.iter() {
            if !seen.insert(spec.name.as_ref()) {
                return Err(ApgError::config(format!("duplicate latent `{}`", spec.name)));
            }
        }

        let mut assigned = HashSet::new();
        for block in blocks.iter() {
            if block.latents.is_empty() {
                return Err(ApgError::config(format!("block `{}` is empty", block.name)));
            }
            for name in block.latents.iter() {
                let spec = latents
                    .iter()
                    .find(|s| s.name == *name)
                    .ok_or_else(|| {
                        ApgError::config(format!(
                            "block `{}` refers to unknown latent `{}`",
                            block.name, name
                        ))
                    })?;
                if !assigned.insert(name.as_ref()) {
                    return Err(ApgError::config(format!(
                        "latent `{}` belongs to more than one block",
                        name
                    )));
                }
                if block.per_unit && spec.event_shape.is_empty() {
                    return Err(ApgError::config(format!(
                        "per-unit block `{}` holds `{}` without a unit axis",
                        block.name, name
                    )));
                }
            }
        }

        if let Some(spec) = latents.iter().find(|s| !assigned.contains(s.name.as_ref())) {
            return Err(ApgError::config(format!(
                "latent `{}` is not updated by any block",
                spec.name
            )));
        }

        Ok(Self { latents, blocks })
    }

    pub fn latents(&self) -> &[LatentSpec] {
        &self.latents
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn latent(&self, name: &str) -> Option<&LatentSpec> {
        self.latents.iter().find(|s| s.name.as_ref() == name)
    }

    pub fn latent_names(&self) -> Vec<&str> {
        self.latents.iter().map(|s| s.name.as_ref()).collect()
    }

    /// Check that every declared latent in `values` has shape
    /// `(S, B, event_shape...)`
    pub fn check_shapes(
        &self,
        values: &NamedTensors,
        num_particles: usize,
        batch_size: usize,
    ) -> Result<()> {
        for (name, t) in values.iter() {
            let spec = self.latent(name).ok_or_else(|| {
                ApgError::MissingOutput(format!("declaration of latent `{}`", name))
            })?;
            let expected = spec.full_shape(num_particles, batch_size);
            if t.dims() != expected.as_slice() {
                return Err(ApgError::shape_mismatch(name, &expected, t.dims()));
            }
        }
        Ok(())
    }
}

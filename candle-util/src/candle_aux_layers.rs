use candle_core::{Result, Tensor};
use candle_nn::{Activation, Linear, Module, VarBuilder};

/// Layers applied in order, each optionally followed by an activation
pub struct StackLayers<M>
where
    M: Module,
{
    layers: Vec<(M, Option<Activation>)>,
}

impl<M> Module for StackLayers<M>
where
    M: Module,
{
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        self.layers.iter().try_fold(input.clone(), |x, (layer, act)| {
            let y = layer.forward(&x)?;
            match act {
                Some(act) => act.forward(&y),
                None => Ok(y),
            }
        })
    }
}

impl<M> StackLayers<M>
where
    M: Module,
{
    pub fn new() -> Self {
        Self { layers: Vec::new() }
    }

    /// Appends a layer followed by `activation`
    pub fn push_with_act(&mut self, layer: M, activation: Activation) {
        self.layers.push((layer, Some(activation)));
    }

    pub fn push(&mut self, layer: M) {
        self.layers.push((layer, None));
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Apply the stack to the last axis of a particle tensor.
    ///
    /// Leading axes `(S, B, N, ...)` are flattened into rows
    /// before the forward pass and restored afterwards.
    pub fn forward_rows(&self, x: &Tensor) -> Result<Tensor> {
        forward_rows(self, x)
    }
}

impl<M> Default for StackLayers<M>
where
    M: Module,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Run `module` on the last axis of `x`, treating every other axis as rows
pub fn forward_rows<M: Module + ?Sized>(module: &M, x: &Tensor) -> Result<Tensor> {
    let dims = x.dims();
    let (lead, last) = dims.split_at(dims.len() - 1);
    let rows: usize = lead.iter().product();

    let y = module.forward(&x.reshape((rows, last[0]))?)?;

    let mut out_shape = lead.to_vec();
    out_shape.push(y.dim(1)?);
    y.reshape(out_shape)
}

/// A multi-layer perceptron `dims[0] -> dims[1] -> ... -> dims[L]`
///
/// * `dims` - layer widths including input and output
/// * `activation` - applied after every layer but the last
/// * `vb` - variables are stored under `vb.pp("fc.{l}")`
///
pub fn stack_mlp(
    dims: &[usize],
    activation: Activation,
    vb: VarBuilder,
) -> Result<StackLayers<Linear>> {
    if dims.len() < 2 {
        candle_core::bail!("an MLP needs input and output widths, got {:?}", dims);
    }

    let mut stack = StackLayers::new();
    let num_layers = dims.len() - 1;
    for (l, w) in dims.windows(2).enumerate() {
        let layer = candle_nn::linear(w[0], w[1], vb.pp(format!("fc.{}", l)))?;
        if l + 1 < num_layers {
            stack.push_with_act(layer, activation);
        } else {
            stack.push(layer);
        }
    }
    Ok(stack)
}

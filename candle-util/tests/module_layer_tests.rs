use candle_core::{DType, Device, Module, Result, Tensor};
use candle_nn::{Activation, VarBuilder, VarMap};
use candle_util::candle_aux_layers::*;

#[test]
fn mlp_on_particle_tensor() -> Result<()> {
    let dev = Device::Cpu;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);

    let (s, b, n, d) = (4, 2, 5, 3);
    let mlp = stack_mlp(&[d, 8, 8, 2], Activation::Relu, vb.pp("enc"))?;
    assert_eq!(mlp.num_layers(), 3);
    assert_eq!(varmap.all_vars().len(), 6);

    let x = Tensor::randn(0f32, 1f32, (s, b, n, d), &dev)?;
    let y = mlp.forward_rows(&x)?;
    assert_eq!(y.dims(), &[s, b, n, 2]);

    // row-wise application agrees with a plain 2D forward
    let y2 = mlp.forward(&x.reshape((s * b * n, d))?)?.reshape((s, b, n, 2))?;
    let diff = (y - y2)?.abs()?.max_all()?.to_scalar::<f32>()?;
    assert!(diff < 1e-6);
    Ok(())
}

#[test]
fn mlp_needs_two_widths() {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    assert!(stack_mlp(&[3], Activation::Relu, vb).is_err());
}

#[test]
fn empty_stack_is_identity() -> Result<()> {
    let stack: StackLayers<candle_nn::Linear> = StackLayers::default();
    let x = Tensor::arange(0f32, 6., &Device::Cpu)?.reshape((2, 3))?;
    let y = stack.forward(&x)?;
    assert_eq!(y.to_vec2::<f32>()?, x.to_vec2::<f32>()?);
    Ok(())
}

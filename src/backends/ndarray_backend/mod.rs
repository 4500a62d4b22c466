pub mod conversions;
pub mod numeric_tensor;
pub mod ops;

pub use numeric_tensor::{NDArrayNumericTensor, NDArrayNumericTensorError};

use crate::backends::RuntimeError;
use crate::ops::PrimitiveOp;

/// Executes one primitive operator over ndarray-backed tensors.
pub(crate) fn apply(
    op: &PrimitiveOp,
    inputs: &[NDArrayNumericTensor],
) -> Result<Vec<NDArrayNumericTensor>, RuntimeError> {
    let arity = op.arity();
    if inputs.len() != arity {
        return Err(RuntimeError::Arity {
            op: op.clone(),
            expected: arity,
            got: inputs.len(),
        });
    }
    let out = match op {
        PrimitiveOp::Add => NDArrayNumericTensor::add(&inputs[0], &inputs[1])?,
        PrimitiveOp::Sub => NDArrayNumericTensor::sub(&inputs[0], &inputs[1])?,
        PrimitiveOp::Mul => NDArrayNumericTensor::mul(&inputs[0], &inputs[1])?,
        PrimitiveOp::Div => NDArrayNumericTensor::div(&inputs[0], &inputs[1])?,
        PrimitiveOp::Maximum => NDArrayNumericTensor::max(&inputs[0], &inputs[1])?,
        PrimitiveOp::MatMul => NDArrayNumericTensor::matmul(&inputs[0], &inputs[1])?,
        PrimitiveOp::Neg => inputs[0].neg()?,
        PrimitiveOp::Relu => inputs[0].relu()?,
        PrimitiveOp::Sigmoid => inputs[0].sigmoid()?,
        PrimitiveOp::Tanh => inputs[0].tanh()?,
        PrimitiveOp::Exp => inputs[0].exp()?,
        PrimitiveOp::Log => inputs[0].ln()?,
        PrimitiveOp::Transpose { axes } => inputs[0].transpose(axes.as_deref())?,
        PrimitiveOp::Reshape { shape } => inputs[0].reshape(shape)?,
        PrimitiveOp::ReduceSum { axis, keepdims } => inputs[0].reduce_sum(*axis, *keepdims)?,
        PrimitiveOp::ReduceMax { axis, keepdims } => inputs[0].reduce_max(*axis, *keepdims)?,
        PrimitiveOp::Cast { dtype } => inputs[0].cast(*dtype),
    };
    Ok(vec![out])
}

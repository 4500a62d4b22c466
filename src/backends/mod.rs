use crate::backends::ndarray_backend::NDArrayNumericTensorError;
use crate::dtype::DTypeError;
use crate::numeric_tensor::NumericTensor;
use crate::ops::PrimitiveOp;

pub mod eval_backend;
pub mod ndarray_backend;

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error(transparent)]
    NDArrayNumericTensorError(#[from] NDArrayNumericTensorError),
    #[error(transparent)]
    DTypeError(#[from] DTypeError),
    #[error("Primitive {op} expects {expected} inputs, got {got}")]
    Arity {
        op: PrimitiveOp,
        expected: usize,
        got: usize,
    },
}

/// The `apply` capability the graph core executes primitives through.
///
/// Implementations must not observe or mutate graph state; they only map input tensors to output
/// tensors.
pub trait PrimitiveRuntime {
    fn apply(&self, op: &PrimitiveOp, inputs: &[NumericTensor]) -> Result<Vec<NumericTensor>, RuntimeError>;
}

impl<T: PrimitiveRuntime + ?Sized> PrimitiveRuntime for &T {
    fn apply(&self, op: &PrimitiveOp, inputs: &[NumericTensor]) -> Result<Vec<NumericTensor>, RuntimeError> {
        (**self).apply(op, inputs)
    }
}

use crate::backends::{PrimitiveRuntime, RuntimeError, ndarray_backend};
use crate::dtype::DType;
use crate::numeric_tensor::NumericTensor;
use crate::ops::PrimitiveOp;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EvalBackend {
    #[default]
    NDArray,
}

impl core::fmt::Display for EvalBackend {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl EvalBackend {
    pub fn supports_dtype(&self, dtype: DType) -> bool {
        match self {
            EvalBackend::NDArray => matches!(dtype, DType::F64 | DType::F32 | DType::I64 | DType::BOOL),
        }
    }
}

impl PrimitiveRuntime for EvalBackend {
    fn apply(&self, op: &PrimitiveOp, inputs: &[NumericTensor]) -> Result<Vec<NumericTensor>, RuntimeError> {
        match self {
            EvalBackend::NDArray => {
                let inputs = inputs.iter().map(|x| x.to_ndarray().clone()).collect::<Vec<_>>();
                let outputs = ndarray_backend::apply(op, &inputs)?;
                Ok(outputs.into_iter().map(NumericTensor::NDArray).collect())
            }
        }
    }
}

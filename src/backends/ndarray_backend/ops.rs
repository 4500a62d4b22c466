use ndarray::{ArcArray, IxDyn, Zip};
use num_traits::Float;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum NDArrayOperationError {
    #[error("Shapes {0:?} and {1:?} cannot be broadcast together")]
    IncompatibleShapes(Vec<usize>, Vec<usize>),
    #[error("Axis {axis} is out of range for a tensor of rank {rank}")]
    AxisOutOfRange { axis: usize, rank: usize },
    #[error("{0:?} is not a permutation of the tensor axes")]
    InvalidPermutation(Vec<usize>),
    #[error("Reduction over an empty axis")]
    EmptyReduction,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, strum_macros::Display)]
pub enum NativeNumericTensorBinaryOperation {
    Add,
    Sub,
    Mul,
    Div,
    Max,
}

impl NativeNumericTensorBinaryOperation {
    fn apply_float<T: Float>(&self, a: T, b: T) -> T {
        match self {
            NativeNumericTensorBinaryOperation::Add => a + b,
            NativeNumericTensorBinaryOperation::Sub => a - b,
            NativeNumericTensorBinaryOperation::Mul => a * b,
            NativeNumericTensorBinaryOperation::Div => a / b,
            NativeNumericTensorBinaryOperation::Max => a.max(b),
        }
    }

    fn apply_int(&self, a: i64, b: i64) -> i64 {
        match self {
            NativeNumericTensorBinaryOperation::Add => a.wrapping_add(b),
            NativeNumericTensorBinaryOperation::Sub => a.wrapping_sub(b),
            NativeNumericTensorBinaryOperation::Mul => a.wrapping_mul(b),
            // Integer division by zero yields zero instead of trapping.
            NativeNumericTensorBinaryOperation::Div => a.checked_div(b).unwrap_or(0),
            NativeNumericTensorBinaryOperation::Max => a.max(b),
        }
    }

    pub(crate) fn applyf<T: Float>(
        &self,
        a: &ArcArray<T, IxDyn>,
        b: &ArcArray<T, IxDyn>,
    ) -> Result<ArcArray<T, IxDyn>, NDArrayOperationError> {
        zip_broadcast(a, b, |x, y| self.apply_float(x, y))
    }

    pub(crate) fn applyi(
        &self,
        a: &ArcArray<i64, IxDyn>,
        b: &ArcArray<i64, IxDyn>,
    ) -> Result<ArcArray<i64, IxDyn>, NDArrayOperationError> {
        zip_broadcast(a, b, |x, y| self.apply_int(x, y))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, strum_macros::Display)]
pub enum NativeNumericTensorUnaryOperation {
    Neg,
    Relu,
    Sigmoid,
    Tanh,
    Exp,
    Log,
}

impl NativeNumericTensorUnaryOperation {
    pub(crate) fn applyf<T: Float>(&self, a: &ArcArray<T, IxDyn>) -> ArcArray<T, IxDyn> {
        let one = T::one();
        match self {
            NativeNumericTensorUnaryOperation::Neg => a.map(|x| -*x),
            NativeNumericTensorUnaryOperation::Relu => a.map(|x| x.max(T::zero())),
            NativeNumericTensorUnaryOperation::Sigmoid => a.map(|x| one / (one + (-*x).exp())),
            NativeNumericTensorUnaryOperation::Tanh => a.map(|x| x.tanh()),
            NativeNumericTensorUnaryOperation::Exp => a.map(|x| x.exp()),
            NativeNumericTensorUnaryOperation::Log => a.map(|x| x.ln()),
        }
        .to_shared()
    }
}

/// Numpy-style broadcast of two shapes, aligned from the trailing dimension.
pub(crate) fn broadcast_shapes(a: &[usize], b: &[usize]) -> Option<Vec<usize>> {
    let rank = a.len().max(b.len());
    let mut out = vec![0; rank];
    for i in 0..rank {
        let da = if i < rank - a.len() { 1 } else { a[i - (rank - a.len())] };
        let db = if i < rank - b.len() { 1 } else { b[i - (rank - b.len())] };
        out[i] = match (da, db) {
            (x, y) if x == y => x,
            (1, y) => y,
            (x, 1) => x,
            _ => return None,
        };
    }
    Some(out)
}

pub(crate) fn zip_broadcast<A: Clone, B: Clone, C: Clone>(
    a: &ArcArray<A, IxDyn>,
    b: &ArcArray<B, IxDyn>,
    f: impl Fn(A, B) -> C,
) -> Result<ArcArray<C, IxDyn>, NDArrayOperationError> {
    let shape = broadcast_shapes(a.shape(), b.shape()).ok_or_else(|| {
        NDArrayOperationError::IncompatibleShapes(a.shape().to_vec(), b.shape().to_vec())
    })?;
    let incompatible =
        || NDArrayOperationError::IncompatibleShapes(a.shape().to_vec(), b.shape().to_vec());
    let av = a.broadcast(IxDyn(&shape)).ok_or_else(incompatible)?;
    let bv = b.broadcast(IxDyn(&shape)).ok_or_else(incompatible)?;
    Ok(Zip::from(&av)
        .and(&bv)
        .map_collect(|x, y| f(x.clone(), y.clone()))
        .into_shared())
}

use super::ops;
use super::ops::{NativeNumericTensorBinaryOperation, NativeNumericTensorUnaryOperation};
use crate::dtype::DType;
use ndarray::{ArcArray, Axis, Ix2, IxDyn};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

#[derive(Debug, thiserror::Error)]
pub enum NDArrayNumericTensorError {
    #[error("Requested dtype {0}, but had dtype {1}")]
    WrongDTypeError(DType, DType),
    #[error("Cannot reshape tensor from {0:?} to {1:?}")]
    InvalidReshapeError(Vec<usize>, Vec<i64>),
    #[error("Unsupported operation {0} for dtypes {1:?}")]
    UnsupportedOperationForDTypes(String, Vec<DType>),
    #[error("Matmul requires 2-D operands, got shapes {0:?} and {1:?}")]
    MatMulRank(Vec<usize>, Vec<usize>),
    #[error("Matmul inner dimensions do not agree: {0:?} x {1:?}")]
    MatMulShape(Vec<usize>, Vec<usize>),
    #[error(transparent)]
    NDArrayOperationError(#[from] ops::NDArrayOperationError),
    #[error(transparent)]
    ShapeError(#[from] ndarray::ShapeError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NDArrayNumericTensor {
    F64(ArcArray<f64, IxDyn>),
    F32(ArcArray<f32, IxDyn>),
    I64(ArcArray<i64, IxDyn>),
    BOOL(ArcArray<bool, IxDyn>),
}

impl Display for NDArrayNumericTensor {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            NDArrayNumericTensor::F64(x) => x.fmt(f),
            NDArrayNumericTensor::F32(x) => x.fmt(f),
            NDArrayNumericTensor::I64(x) => x.fmt(f),
            NDArrayNumericTensor::BOOL(x) => x.fmt(f),
        }
    }
}

macro_rules! map_float {
    ($tensor:expr, $name:expr, |$x:ident| $body:expr) => {
        match $tensor {
            NDArrayNumericTensor::F64($x) => Ok(NDArrayNumericTensor::F64($body)),
            NDArrayNumericTensor::F32($x) => Ok(NDArrayNumericTensor::F32($body)),
            other => Err(NDArrayNumericTensorError::UnsupportedOperationForDTypes(
                $name.to_string(),
                vec![other.dtype()],
            )),
        }
    };
}

macro_rules! map_any {
    ($tensor:expr, |$x:ident| $body:expr) => {
        match $tensor {
            NDArrayNumericTensor::F64($x) => NDArrayNumericTensor::F64($body),
            NDArrayNumericTensor::F32($x) => NDArrayNumericTensor::F32($body),
            NDArrayNumericTensor::I64($x) => NDArrayNumericTensor::I64($body),
            NDArrayNumericTensor::BOOL($x) => NDArrayNumericTensor::BOOL($body),
        }
    };
}

impl NDArrayNumericTensor {
    pub fn dtype(&self) -> DType {
        match self {
            NDArrayNumericTensor::F64(_) => DType::F64,
            NDArrayNumericTensor::F32(_) => DType::F32,
            NDArrayNumericTensor::I64(_) => DType::I64,
            NDArrayNumericTensor::BOOL(_) => DType::BOOL,
        }
    }

    pub fn shape(&self) -> Vec<usize> {
        match self {
            NDArrayNumericTensor::F64(x) => x.shape().to_vec(),
            NDArrayNumericTensor::F32(x) => x.shape().to_vec(),
            NDArrayNumericTensor::I64(x) => x.shape().to_vec(),
            NDArrayNumericTensor::BOOL(x) => x.shape().to_vec(),
        }
    }

    pub fn rank(&self) -> usize {
        self.shape().len()
    }

    pub fn num_elements(&self) -> usize {
        self.shape().iter().product()
    }

    pub fn zeros(shape: &[usize], dtype: DType) -> Self {
        let dim = IxDyn(shape);
        match dtype {
            DType::F64 => NDArrayNumericTensor::F64(ArcArray::from_elem(dim, 0.0)),
            DType::F32 => NDArrayNumericTensor::F32(ArcArray::from_elem(dim, 0.0)),
            DType::I64 => NDArrayNumericTensor::I64(ArcArray::from_elem(dim, 0)),
            DType::BOOL => NDArrayNumericTensor::BOOL(ArcArray::from_elem(dim, false)),
        }
    }

    /// Rank-0 tensor holding `value` converted to `dtype`.
    pub fn scalar(value: f64, dtype: DType) -> Self {
        let dim = IxDyn(&[]);
        match dtype {
            DType::F64 => NDArrayNumericTensor::F64(ArcArray::from_elem(dim, value)),
            DType::F32 => NDArrayNumericTensor::F32(ArcArray::from_elem(dim, value as f32)),
            DType::I64 => NDArrayNumericTensor::I64(ArcArray::from_elem(dim, value as i64)),
            DType::BOOL => NDArrayNumericTensor::BOOL(ArcArray::from_elem(dim, value != 0.0)),
        }
    }

    pub fn cast(&self, dtype: DType) -> Self {
        if self.dtype() == dtype {
            return self.clone();
        }
        let values: ArcArray<f64, IxDyn> = match self {
            NDArrayNumericTensor::F64(x) => x.clone(),
            NDArrayNumericTensor::F32(x) => x.mapv(|v| v as f64).into_shared(),
            NDArrayNumericTensor::I64(x) => x.mapv(|v| v as f64).into_shared(),
            NDArrayNumericTensor::BOOL(x) => x.mapv(|v| if v { 1.0 } else { 0.0 }).into_shared(),
        };
        match dtype {
            DType::F64 => NDArrayNumericTensor::F64(values),
            DType::F32 => NDArrayNumericTensor::F32(values.mapv(|v| v as f32).into_shared()),
            DType::I64 => NDArrayNumericTensor::I64(values.mapv(|v| v as i64).into_shared()),
            DType::BOOL => NDArrayNumericTensor::BOOL(values.mapv(|v| v != 0.0).into_shared()),
        }
    }

    fn try_unary_op(&self, op: NativeNumericTensorUnaryOperation) -> Result<Self, NDArrayNumericTensorError> {
        map_float!(self, op, |x| op.applyf(x))
    }

    pub fn neg(&self) -> Result<Self, NDArrayNumericTensorError> {
        match self {
            NDArrayNumericTensor::I64(x) => Ok(NDArrayNumericTensor::I64(x.mapv(|v| v.wrapping_neg()).into_shared())),
            _ => self.try_unary_op(NativeNumericTensorUnaryOperation::Neg),
        }
    }

    pub fn relu(&self) -> Result<Self, NDArrayNumericTensorError> {
        match self {
            NDArrayNumericTensor::I64(x) => Ok(NDArrayNumericTensor::I64(x.mapv(|v| v.max(0)).into_shared())),
            _ => self.try_unary_op(NativeNumericTensorUnaryOperation::Relu),
        }
    }

    pub fn sigmoid(&self) -> Result<Self, NDArrayNumericTensorError> {
        self.try_unary_op(NativeNumericTensorUnaryOperation::Sigmoid)
    }

    pub fn tanh(&self) -> Result<Self, NDArrayNumericTensorError> {
        self.try_unary_op(NativeNumericTensorUnaryOperation::Tanh)
    }

    pub fn exp(&self) -> Result<Self, NDArrayNumericTensorError> {
        self.try_unary_op(NativeNumericTensorUnaryOperation::Exp)
    }

    pub fn ln(&self) -> Result<Self, NDArrayNumericTensorError> {
        self.try_unary_op(NativeNumericTensorUnaryOperation::Log)
    }

    pub(crate) fn try_binary_op(
        a: &Self,
        b: &Self,
        op: NativeNumericTensorBinaryOperation,
    ) -> Result<Self, NDArrayNumericTensorError> {
        let result = match (a, b) {
            (NDArrayNumericTensor::F64(a), NDArrayNumericTensor::F64(b)) => {
                Some(NDArrayNumericTensor::F64(op.applyf(a, b)?))
            }
            (NDArrayNumericTensor::F32(a), NDArrayNumericTensor::F32(b)) => {
                Some(NDArrayNumericTensor::F32(op.applyf(a, b)?))
            }
            (NDArrayNumericTensor::I64(a), NDArrayNumericTensor::I64(b)) => {
                Some(NDArrayNumericTensor::I64(op.applyi(a, b)?))
            }
            _ => None,
        };
        if let Some(result) = result {
            Ok(result)
        } else {
            Err(NDArrayNumericTensorError::UnsupportedOperationForDTypes(
                op.to_string(),
                vec![a.dtype(), b.dtype()],
            ))
        }
    }

    pub fn add(a: &Self, b: &Self) -> Result<Self, NDArrayNumericTensorError> {
        Self::try_binary_op(a, b, NativeNumericTensorBinaryOperation::Add)
    }

    pub fn sub(a: &Self, b: &Self) -> Result<Self, NDArrayNumericTensorError> {
        Self::try_binary_op(a, b, NativeNumericTensorBinaryOperation::Sub)
    }

    pub fn mul(a: &Self, b: &Self) -> Result<Self, NDArrayNumericTensorError> {
        Self::try_binary_op(a, b, NativeNumericTensorBinaryOperation::Mul)
    }

    pub fn div(a: &Self, b: &Self) -> Result<Self, NDArrayNumericTensorError> {
        Self::try_binary_op(a, b, NativeNumericTensorBinaryOperation::Div)
    }

    pub fn max(a: &Self, b: &Self) -> Result<Self, NDArrayNumericTensorError> {
        Self::try_binary_op(a, b, NativeNumericTensorBinaryOperation::Max)
    }

    pub fn matmul(a: &Self, b: &Self) -> Result<Self, NDArrayNumericTensorError> {
        let (sa, sb) = (a.shape(), b.shape());
        if sa.len() != 2 || sb.len() != 2 {
            return Err(NDArrayNumericTensorError::MatMulRank(sa, sb));
        }
        if sa[1] != sb[0] {
            return Err(NDArrayNumericTensorError::MatMulShape(sa, sb));
        }
        Ok(match (a, b) {
            (NDArrayNumericTensor::F64(a), NDArrayNumericTensor::F64(b)) => {
                let (a, b) = (a.view().into_dimensionality::<Ix2>()?, b.view().into_dimensionality::<Ix2>()?);
                NDArrayNumericTensor::F64(a.dot(&b).into_dyn().into_shared())
            }
            (NDArrayNumericTensor::F32(a), NDArrayNumericTensor::F32(b)) => {
                let (a, b) = (a.view().into_dimensionality::<Ix2>()?, b.view().into_dimensionality::<Ix2>()?);
                NDArrayNumericTensor::F32(a.dot(&b).into_dyn().into_shared())
            }
            (NDArrayNumericTensor::I64(a), NDArrayNumericTensor::I64(b)) => {
                let (a, b) = (a.view().into_dimensionality::<Ix2>()?, b.view().into_dimensionality::<Ix2>()?);
                NDArrayNumericTensor::I64(a.dot(&b).into_dyn().into_shared())
            }
            _ => {
                return Err(NDArrayNumericTensorError::UnsupportedOperationForDTypes(
                    "matmul".to_string(),
                    vec![a.dtype(), b.dtype()],
                ));
            }
        })
    }

    /// Permutes the axes; `None` reverses them.
    pub fn transpose(&self, axes: Option<&[usize]>) -> Result<Self, NDArrayNumericTensorError> {
        let rank = self.rank();
        let axes: Vec<usize> = match axes {
            Some(axes) => axes.to_vec(),
            None => (0..rank).rev().collect(),
        };
        let mut seen = vec![false; rank];
        for &a in &axes {
            if a >= rank || seen[a] {
                return Err(ops::NDArrayOperationError::InvalidPermutation(axes.clone()).into());
            }
            seen[a] = true;
        }
        if axes.len() != rank {
            return Err(ops::NDArrayOperationError::InvalidPermutation(axes).into());
        }
        Ok(map_any!(self, |x| x.clone().permuted_axes(IxDyn(&axes))))
    }

    /// Row-major reshape. One dimension may be `-1` and is inferred.
    pub fn reshape(&self, shape: &[i64]) -> Result<Self, NDArrayNumericTensorError> {
        let total = self.num_elements();
        let err = || NDArrayNumericTensorError::InvalidReshapeError(self.shape(), shape.to_vec());
        let mut inferred = None;
        let mut known = 1usize;
        for (i, &d) in shape.iter().enumerate() {
            match d {
                -1 if inferred.is_none() => inferred = Some(i),
                d if d >= 0 => known *= d as usize,
                _ => return Err(err()),
            }
        }
        let mut new_shape: Vec<usize> = shape.iter().map(|&d| d.max(0) as usize).collect();
        if let Some(i) = inferred {
            if known == 0 || total % known != 0 {
                return Err(err());
            }
            new_shape[i] = total / known;
        } else if known != total {
            return Err(err());
        }
        Ok(match self {
            NDArrayNumericTensor::F64(x) => NDArrayNumericTensor::F64(ArcArray::from_shape_vec(IxDyn(&new_shape), x.iter().cloned().collect())?),
            NDArrayNumericTensor::F32(x) => NDArrayNumericTensor::F32(ArcArray::from_shape_vec(IxDyn(&new_shape), x.iter().cloned().collect())?),
            NDArrayNumericTensor::I64(x) => NDArrayNumericTensor::I64(ArcArray::from_shape_vec(IxDyn(&new_shape), x.iter().cloned().collect())?),
            NDArrayNumericTensor::BOOL(x) => NDArrayNumericTensor::BOOL(ArcArray::from_shape_vec(IxDyn(&new_shape), x.iter().cloned().collect())?),
        })
    }

    fn check_axis(&self, axis: usize) -> Result<(), NDArrayNumericTensorError> {
        let rank = self.rank();
        if axis >= rank {
            return Err(ops::NDArrayOperationError::AxisOutOfRange { axis, rank }.into());
        }
        Ok(())
    }

    pub fn reduce_sum(&self, axis: Option<usize>, keepdims: bool) -> Result<Self, NDArrayNumericTensorError> {
        if let Some(axis) = axis {
            self.check_axis(axis)?;
        }
        let reduce = |axis: Option<usize>| -> Result<Self, NDArrayNumericTensorError> {
            Ok(match (self, axis) {
                (NDArrayNumericTensor::F64(x), Some(a)) => NDArrayNumericTensor::F64(x.sum_axis(Axis(a)).into_shared()),
                (NDArrayNumericTensor::F32(x), Some(a)) => NDArrayNumericTensor::F32(x.sum_axis(Axis(a)).into_shared()),
                (NDArrayNumericTensor::I64(x), Some(a)) => NDArrayNumericTensor::I64(x.sum_axis(Axis(a)).into_shared()),
                (NDArrayNumericTensor::F64(x), None) => NDArrayNumericTensor::F64(ArcArray::from_elem(IxDyn(&[]), x.sum())),
                (NDArrayNumericTensor::F32(x), None) => NDArrayNumericTensor::F32(ArcArray::from_elem(IxDyn(&[]), x.sum())),
                (NDArrayNumericTensor::I64(x), None) => NDArrayNumericTensor::I64(ArcArray::from_elem(IxDyn(&[]), x.sum())),
                (NDArrayNumericTensor::BOOL(_), _) => {
                    return Err(NDArrayNumericTensorError::UnsupportedOperationForDTypes(
                        "reduce_sum".to_string(),
                        vec![DType::BOOL],
                    ));
                }
            })
        };
        let out = reduce(axis)?;
        if keepdims { out.restore_axis(self.rank(), axis) } else { Ok(out) }
    }

    pub fn reduce_max(&self, axis: Option<usize>, keepdims: bool) -> Result<Self, NDArrayNumericTensorError> {
        if let Some(axis) = axis {
            self.check_axis(axis)?;
            if self.shape()[axis] == 0 {
                return Err(ops::NDArrayOperationError::EmptyReduction.into());
            }
        } else if self.num_elements() == 0 {
            return Err(ops::NDArrayOperationError::EmptyReduction.into());
        }
        let out = match (self, axis) {
            (NDArrayNumericTensor::F64(x), Some(a)) => NDArrayNumericTensor::F64(x.fold_axis(Axis(a), f64::NEG_INFINITY, |m, v| m.max(*v)).into_shared()),
            (NDArrayNumericTensor::F32(x), Some(a)) => NDArrayNumericTensor::F32(x.fold_axis(Axis(a), f32::NEG_INFINITY, |m, v| m.max(*v)).into_shared()),
            (NDArrayNumericTensor::I64(x), Some(a)) => NDArrayNumericTensor::I64(x.fold_axis(Axis(a), i64::MIN, |m, v| (*m).max(*v)).into_shared()),
            (NDArrayNumericTensor::F64(x), None) => NDArrayNumericTensor::F64(ArcArray::from_elem(IxDyn(&[]), x.fold(f64::NEG_INFINITY, |m, v| m.max(*v)))),
            (NDArrayNumericTensor::F32(x), None) => NDArrayNumericTensor::F32(ArcArray::from_elem(IxDyn(&[]), x.fold(f32::NEG_INFINITY, |m, v| m.max(*v)))),
            (NDArrayNumericTensor::I64(x), None) => NDArrayNumericTensor::I64(ArcArray::from_elem(IxDyn(&[]), x.fold(i64::MIN, |m, v| m.max(*v)))),
            (NDArrayNumericTensor::BOOL(_), _) => {
                return Err(NDArrayNumericTensorError::UnsupportedOperationForDTypes(
                    "reduce_max".to_string(),
                    vec![DType::BOOL],
                ));
            }
        };
        if keepdims { out.restore_axis(self.rank(), axis) } else { Ok(out) }
    }

    /// Re-inserts reduced axes as size-1 dimensions.
    fn restore_axis(self, rank: usize, axis: Option<usize>) -> Result<Self, NDArrayNumericTensorError> {
        match axis {
            Some(a) => Ok(map_any!(self, |x| x.insert_axis(Axis(a)))),
            None => self.reshape(&vec![1; rank]),
        }
    }

    pub fn try_to_vec<T: super::conversions::NDArrayNumericTensorType>(&self) -> Result<Vec<T>, NDArrayNumericTensorError> {
        Ok(T::ndarray_numeric_tensor_inner(self)?.iter().cloned().collect())
    }

    pub fn all_close(&self, other: &Self, atol: f64, rtol: f64) -> bool {
        if self.shape() != other.shape() {
            return false;
        }
        let a = self.cast(DType::F64);
        let b = other.cast(DType::F64);
        match (a, b) {
            (NDArrayNumericTensor::F64(a), NDArrayNumericTensor::F64(b)) => a
                .iter()
                .zip(b.iter())
                .all(|(x, y)| (x - y).abs() <= atol + rtol * y.abs()),
            _ => false,
        }
    }
}

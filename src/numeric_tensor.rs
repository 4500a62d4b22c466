use crate::backends::ndarray_backend::conversions::NDArrayNumericTensorType;
use crate::backends::ndarray_backend::{NDArrayNumericTensor, NDArrayNumericTensorError};
use crate::dtype::DType;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

#[derive(Debug, thiserror::Error)]
pub enum NumericTensorError {
    #[error(transparent)]
    NDArrayNumericTensorError(#[from] NDArrayNumericTensorError),
}

/// Runtime tensor value flowing through traced and interpreted graphs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NumericTensor {
    NDArray(NDArrayNumericTensor),
}

impl NumericTensor {
    pub fn from_vec_shape<T: NDArrayNumericTensorType>(v: Vec<T>, shape: &[usize]) -> Result<Self, NumericTensorError> {
        Ok(NumericTensor::NDArray(NDArrayNumericTensor::from_vec_shape(v, shape)?))
    }

    pub fn from_vec<T: NDArrayNumericTensorType>(v: Vec<T>) -> Self {
        NumericTensor::NDArray(NDArrayNumericTensor::from_vec(v))
    }

    pub fn zeros(shape: &[usize], dtype: DType) -> Self {
        NumericTensor::NDArray(NDArrayNumericTensor::zeros(shape, dtype))
    }

    pub fn scalar(value: f64, dtype: DType) -> Self {
        NumericTensor::NDArray(NDArrayNumericTensor::scalar(value, dtype))
    }

    #[cfg(feature = "rand")]
    pub fn random_uniform(shape: &[usize], dtype: DType, rng: &mut impl rand::Rng) -> Self {
        let n: usize = shape.iter().product();
        let values: Vec<f64> = (0..n).map(|_| rng.gen_range(-1.0..1.0)).collect();
        let t = NDArrayNumericTensor::from_vec_shape(values, shape)
            .unwrap_or_else(|_| NDArrayNumericTensor::zeros(shape, DType::F64));
        NumericTensor::NDArray(t.cast(dtype))
    }

    pub fn to_ndarray(&self) -> &NDArrayNumericTensor {
        match self {
            NumericTensor::NDArray(x) => x,
        }
    }

    pub fn dtype(&self) -> DType {
        match self {
            NumericTensor::NDArray(x) => x.dtype(),
        }
    }

    pub fn shape(&self) -> Vec<usize> {
        match self {
            NumericTensor::NDArray(x) => x.shape(),
        }
    }

    pub fn rank(&self) -> usize {
        self.shape().len()
    }

    pub fn cast(&self, dtype: DType) -> Self {
        match self {
            NumericTensor::NDArray(x) => NumericTensor::NDArray(x.cast(dtype)),
        }
    }

    pub fn try_to_vec<T: NDArrayNumericTensorType>(&self) -> Result<Vec<T>, NumericTensorError> {
        Ok(self.to_ndarray().try_to_vec()?)
    }

    pub fn all_close(&self, other: &Self, atol: f64, rtol: f64) -> bool {
        self.to_ndarray().all_close(other.to_ndarray(), atol, rtol)
    }
}

impl From<NDArrayNumericTensor> for NumericTensor {
    fn from(x: NDArrayNumericTensor) -> Self {
        NumericTensor::NDArray(x)
    }
}

impl<T: NDArrayNumericTensorType> From<Vec<T>> for NumericTensor {
    fn from(value: Vec<T>) -> Self {
        NumericTensor::from_vec(value)
    }
}

impl Display for NumericTensor {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            NumericTensor::NDArray(x) => x.fmt(f),
        }
    }
}

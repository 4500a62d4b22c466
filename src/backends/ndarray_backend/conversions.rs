use crate::backends::ndarray_backend::{NDArrayNumericTensor, NDArrayNumericTensorError};
use crate::dtype::DTypeOfPrimitive;
use ndarray::{ArcArray, IxDyn};

pub trait NDArrayNumericTensorType: Sized + DTypeOfPrimitive + Clone {
    fn ndarray_numeric_tensor_from_vec_shape(v: Vec<Self>, shape: &[usize]) -> Result<NDArrayNumericTensor, NDArrayNumericTensorError>;
    fn ndarray_numeric_tensor_inner(tensor: &NDArrayNumericTensor) -> Result<&ArcArray<Self, IxDyn>, NDArrayNumericTensorError>;
    fn ndarray_numeric_tensor_from_ndarray(value: ArcArray<Self, IxDyn>) -> NDArrayNumericTensor;
}

impl NDArrayNumericTensor {
    pub fn from_vec_shape<T: NDArrayNumericTensorType>(v: Vec<T>, shape: &[usize]) -> Result<Self, NDArrayNumericTensorError> {
        T::ndarray_numeric_tensor_from_vec_shape(v, shape)
    }

    pub fn from_vec<T: NDArrayNumericTensorType>(v: Vec<T>) -> Self {
        T::ndarray_numeric_tensor_from_ndarray(ArcArray::from_vec(v).into_dyn())
    }

    pub fn as_inner<T: NDArrayNumericTensorType>(&self) -> Result<&ArcArray<T, IxDyn>, NDArrayNumericTensorError> {
        T::ndarray_numeric_tensor_inner(self)
    }
}

impl<T: NDArrayNumericTensorType> From<Vec<T>> for NDArrayNumericTensor {
    fn from(value: Vec<T>) -> Self {
        NDArrayNumericTensor::from_vec(value)
    }
}

macro_rules! impl_type_ndarray_backend {
    ($a:ident, $b:ident) => {
        impl NDArrayNumericTensorType for $a {
            fn ndarray_numeric_tensor_from_vec_shape(v: Vec<Self>, shape: &[usize]) -> Result<NDArrayNumericTensor, NDArrayNumericTensorError> {
                Ok(NDArrayNumericTensor::$b(ArcArray::from_shape_vec(IxDyn(shape), v)?))
            }

            fn ndarray_numeric_tensor_inner(tensor: &NDArrayNumericTensor) -> Result<&ArcArray<Self, IxDyn>, NDArrayNumericTensorError> {
                if let NDArrayNumericTensor::$b(x) = tensor {
                    Ok(x)
                } else {
                    Err(NDArrayNumericTensorError::WrongDTypeError(Self::DTYPE, tensor.dtype()))
                }
            }

            fn ndarray_numeric_tensor_from_ndarray(value: ArcArray<Self, IxDyn>) -> NDArrayNumericTensor {
                NDArrayNumericTensor::$b(value)
            }
        }
    };
}

impl_type_ndarray_backend!(f64, F64);
impl_type_ndarray_backend!(f32, F32);
impl_type_ndarray_backend!(i64, I64);
impl_type_ndarray_backend!(bool, BOOL);

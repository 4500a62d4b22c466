use crate::backends::{PrimitiveRuntime, RuntimeError};
use crate::dtype::DType;
use crate::numeric_tensor::NumericTensor;
use crate::tree::{CallArgs, Literal, Tree};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum OpError {
    #[error(transparent)]
    RuntimeError(#[from] RuntimeError),
    #[error("{op}: missing argument `{name}`")]
    MissingArgument { op: String, name: String },
    #[error("{op}: argument `{name}` must be a tensor or a number")]
    ExpectedTensor { op: String, name: String },
    #[error("{op}: argument `{name}` must be {expected}")]
    BadLiteral {
        op: String,
        name: String,
        expected: &'static str,
    },
    #[error("{op}: axis {axis} out of range for rank {rank}")]
    AxisOutOfRange { op: String, axis: i64, rank: usize },
    #[error("Primitive {0} produced no output")]
    NoOutput(PrimitiveOp),
}

/// Operator descriptors handed to [`PrimitiveRuntime::apply`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, strum_macros::Display)]
#[strum(serialize_all = "snake_case")]
pub enum PrimitiveOp {
    Add,
    Sub,
    Mul,
    Div,
    Maximum,
    Neg,
    Relu,
    Sigmoid,
    Tanh,
    Exp,
    Log,
    #[strum(to_string = "matmul")]
    MatMul,
    Transpose { axes: Option<Vec<usize>> },
    Reshape { shape: Vec<i64> },
    ReduceSum { axis: Option<usize>, keepdims: bool },
    ReduceMax { axis: Option<usize>, keepdims: bool },
    Cast { dtype: DType },
}

impl PrimitiveOp {
    pub fn arity(&self) -> usize {
        match self {
            PrimitiveOp::Add
            | PrimitiveOp::Sub
            | PrimitiveOp::Mul
            | PrimitiveOp::Div
            | PrimitiveOp::Maximum
            | PrimitiveOp::MatMul => 2,
            _ => 1,
        }
    }
}

pub(crate) fn apply_one(
    runtime: &dyn PrimitiveRuntime,
    op: PrimitiveOp,
    inputs: &[NumericTensor],
) -> Result<NumericTensor, OpError> {
    runtime
        .apply(&op, inputs)?
        .into_iter()
        .next()
        .ok_or(OpError::NoOutput(op))
}

/// Methods recorded as `CallMethod` on a tensor receiver.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
    strum_macros::EnumIter,
)]
pub enum TensorMethod {
    #[strum(to_string = "__add__")]
    Add,
    #[strum(to_string = "__radd__")]
    RAdd,
    #[strum(to_string = "__sub__")]
    Sub,
    #[strum(to_string = "__rsub__")]
    RSub,
    #[strum(to_string = "__mul__")]
    Mul,
    #[strum(to_string = "__rmul__")]
    RMul,
    #[strum(to_string = "__truediv__")]
    TrueDiv,
    #[strum(to_string = "__neg__")]
    Neg,
    #[strum(to_string = "__matmul__")]
    MatMul,
    #[strum(to_string = "reshape")]
    Reshape,
    #[strum(to_string = "transpose")]
    Transpose,
    #[strum(to_string = "sum")]
    Sum,
    #[strum(to_string = "exp")]
    Exp,
}

impl TensorMethod {
    pub fn execute(
        &self,
        runtime: &dyn PrimitiveRuntime,
        receiver: &NumericTensor,
        args: &CallArgs<NumericTensor>,
    ) -> Result<Tree<NumericTensor>, OpError> {
        let op = self.to_string();
        let binary = |prim: PrimitiveOp, reflected: bool| -> Result<NumericTensor, OpError> {
            let other = operand(&op, args.get_param(0, "other"), "other", receiver)?;
            if reflected {
                apply_one(runtime, prim, &[other, receiver.clone()])
            } else {
                apply_one(runtime, prim, &[receiver.clone(), other])
            }
        };
        let out = match self {
            TensorMethod::Add => binary(PrimitiveOp::Add, false)?,
            TensorMethod::RAdd => binary(PrimitiveOp::Add, true)?,
            TensorMethod::Sub => binary(PrimitiveOp::Sub, false)?,
            TensorMethod::RSub => binary(PrimitiveOp::Sub, true)?,
            TensorMethod::Mul => binary(PrimitiveOp::Mul, false)?,
            TensorMethod::RMul => binary(PrimitiveOp::Mul, true)?,
            TensorMethod::TrueDiv => binary(PrimitiveOp::Div, false)?,
            TensorMethod::MatMul => {
                let other = tensor_arg(&op, args.get_param(0, "other"), "other")?;
                apply_one(runtime, PrimitiveOp::MatMul, &[receiver.clone(), other.clone()])?
            }
            TensorMethod::Neg => apply_one(runtime, PrimitiveOp::Neg, &[receiver.clone()])?,
            TensorMethod::Exp => apply_one(runtime, PrimitiveOp::Exp, &[receiver.clone()])?,
            TensorMethod::Reshape => {
                let shape = int_list(&op, &args.args, "shape")?;
                apply_one(runtime, PrimitiveOp::Reshape { shape }, &[receiver.clone()])?
            }
            TensorMethod::Transpose => {
                let axes = if args.args.is_empty() {
                    None
                } else {
                    let rank = receiver.rank();
                    let axes = int_list(&op, &args.args, "axes")?
                        .into_iter()
                        .map(|a| normalize_axis(&op, a, rank))
                        .collect::<Result<Vec<_>, _>>()?;
                    Some(axes)
                };
                apply_one(runtime, PrimitiveOp::Transpose { axes }, &[receiver.clone()])?
            }
            TensorMethod::Sum => {
                let axis = optional_axis(&op, args.get_param(0, "axis"), receiver.rank())?;
                let keepdims = optional_bool(&op, args.get_param(1, "keepdims"), "keepdims")?;
                apply_one(runtime, PrimitiveOp::ReduceSum { axis, keepdims }, &[receiver.clone()])?
            }
        };
        Ok(Tree::Leaf(out))
    }

    /// Short callee name used when naming recorded outputs, e.g. `add` for `__add__`.
    pub fn short_name(&self) -> String {
        self.to_string().trim_matches('_').to_string()
    }
}

/// Free functions recorded as `CallFunction`.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
    strum_macros::EnumIter,
)]
#[strum(serialize_all = "snake_case")]
pub enum Function {
    Relu,
    Sigmoid,
    Tanh,
    Exp,
    #[strum(to_string = "matmul")]
    MatMul,
    Linear,
    Softmax,
}

impl Function {
    pub fn execute(
        &self,
        runtime: &dyn PrimitiveRuntime,
        args: &CallArgs<NumericTensor>,
    ) -> Result<Tree<NumericTensor>, OpError> {
        let op = self.to_string();
        let out = match self {
            Function::Relu | Function::Sigmoid | Function::Tanh | Function::Exp => {
                let x = tensor_arg(&op, args.get_param(0, "x"), "x")?;
                let prim = match self {
                    Function::Relu => PrimitiveOp::Relu,
                    Function::Sigmoid => PrimitiveOp::Sigmoid,
                    Function::Tanh => PrimitiveOp::Tanh,
                    _ => PrimitiveOp::Exp,
                };
                apply_one(runtime, prim, &[x.clone()])?
            }
            Function::MatMul => {
                let a = tensor_arg(&op, args.get_param(0, "a"), "a")?;
                let b = tensor_arg(&op, args.get_param(1, "b"), "b")?;
                apply_one(runtime, PrimitiveOp::MatMul, &[a.clone(), b.clone()])?
            }
            Function::Linear => {
                let x = tensor_arg(&op, args.get_param(0, "x"), "x")?;
                let weight = tensor_arg(&op, args.get_param(1, "weight"), "weight")?;
                let weight_t = apply_one(runtime, PrimitiveOp::Transpose { axes: None }, &[weight.clone()])?;
                let y = apply_one(runtime, PrimitiveOp::MatMul, &[x.clone(), weight_t])?;
                match args.get_param(2, "bias") {
                    None | Some(Tree::Const(Literal::None)) => y,
                    Some(bias) => {
                        let bias = operand(&op, Some(bias), "bias", &y)?;
                        apply_one(runtime, PrimitiveOp::Add, &[y, bias])?
                    }
                }
            }
            Function::Softmax => {
                let x = tensor_arg(&op, args.get_param(0, "x"), "x")?;
                let axis = match optional_axis(&op, args.get_param(1, "axis"), x.rank())? {
                    Some(axis) => axis,
                    None => normalize_axis(&op, -1, x.rank())?,
                };
                let reduce = Some(axis);
                let m = apply_one(runtime, PrimitiveOp::ReduceMax { axis: reduce, keepdims: true }, &[x.clone()])?;
                let shifted = apply_one(runtime, PrimitiveOp::Sub, &[x.clone(), m])?;
                let e = apply_one(runtime, PrimitiveOp::Exp, &[shifted])?;
                let s = apply_one(runtime, PrimitiveOp::ReduceSum { axis: reduce, keepdims: true }, &[e.clone()])?;
                apply_one(runtime, PrimitiveOp::Div, &[e, s])?
            }
        };
        Ok(Tree::Leaf(out))
    }
}

fn tensor_arg<'a>(
    op: &str,
    arg: Option<&'a Tree<NumericTensor>>,
    name: &str,
) -> Result<&'a NumericTensor, OpError> {
    match arg {
        Some(Tree::Leaf(x)) => Ok(x),
        Some(_) => Err(OpError::ExpectedTensor {
            op: op.to_string(),
            name: name.to_string(),
        }),
        None => Err(OpError::MissingArgument {
            op: op.to_string(),
            name: name.to_string(),
        }),
    }
}

/// A tensor operand, promoting numeric literals to a scalar of `like`'s dtype.
fn operand(
    op: &str,
    arg: Option<&Tree<NumericTensor>>,
    name: &str,
    like: &NumericTensor,
) -> Result<NumericTensor, OpError> {
    match arg {
        Some(Tree::Leaf(x)) if x.dtype() == like.dtype() => Ok(x.clone()),
        Some(Tree::Leaf(x)) => Ok(x.cast(like.dtype())),
        Some(Tree::Const(c)) => match c.as_f64() {
            Some(v) => Ok(NumericTensor::scalar(v, like.dtype())),
            None => Err(OpError::ExpectedTensor {
                op: op.to_string(),
                name: name.to_string(),
            }),
        },
        Some(_) => Err(OpError::ExpectedTensor {
            op: op.to_string(),
            name: name.to_string(),
        }),
        None => Err(OpError::MissingArgument {
            op: op.to_string(),
            name: name.to_string(),
        }),
    }
}

/// Reads either one sequence argument `(2, 6)` or a run of integer arguments `2, 6`.
fn int_list(op: &str, args: &[Tree<NumericTensor>], name: &str) -> Result<Vec<i64>, OpError> {
    let bad = || OpError::BadLiteral {
        op: op.to_string(),
        name: name.to_string(),
        expected: "a list of integers",
    };
    match args {
        [] => Err(OpError::MissingArgument {
            op: op.to_string(),
            name: name.to_string(),
        }),
        [single] => single.as_int_list().ok_or_else(bad),
        many => many
            .iter()
            .map(|x| x.as_literal().and_then(|c| c.as_i64()))
            .collect::<Option<Vec<_>>>()
            .ok_or_else(bad),
    }
}

fn normalize_axis(op: &str, axis: i64, rank: usize) -> Result<usize, OpError> {
    let r = rank as i64;
    let a = if axis < 0 { axis + r } else { axis };
    if a < 0 || a >= r.max(1) {
        return Err(OpError::AxisOutOfRange {
            op: op.to_string(),
            axis,
            rank,
        });
    }
    Ok(a as usize)
}

fn optional_axis(op: &str, arg: Option<&Tree<NumericTensor>>, rank: usize) -> Result<Option<usize>, OpError> {
    match arg {
        None | Some(Tree::Const(Literal::None)) => Ok(None),
        Some(Tree::Const(c)) => match c.as_i64() {
            Some(a) => Ok(Some(normalize_axis(op, a, rank)?)),
            None => Err(OpError::BadLiteral {
                op: op.to_string(),
                name: "axis".to_string(),
                expected: "an integer",
            }),
        },
        Some(_) => Err(OpError::BadLiteral {
            op: op.to_string(),
            name: "axis".to_string(),
            expected: "an integer",
        }),
    }
}

fn optional_bool(op: &str, arg: Option<&Tree<NumericTensor>>, name: &str) -> Result<bool, OpError> {
    match arg {
        None => Ok(false),
        Some(Tree::Const(Literal::Bool(b))) => Ok(*b),
        Some(_) => Err(OpError::BadLiteral {
            op: op.to_string(),
            name: name.to_string(),
            expected: "a bool",
        }),
    }
}

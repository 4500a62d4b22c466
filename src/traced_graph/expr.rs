use crate::numeric_tensor::NumericTensor;
use crate::ops::{Function, PrimitiveOp, TensorMethod};
use crate::traced_graph::{GraphId, NodeId, TracedGraphError};
use crate::tracer::{Context, TraceError, Value};
use crate::tree::{CallArgs, TreeDef};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// The method a `CallMethod` invokes: a module's `__call__` or a tensor method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MethodKind {
    Call,
    Tensor(TensorMethod),
}

impl Display for MethodKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            MethodKind::Call => write!(f, "__call__"),
            MethodKind::Tensor(m) => write!(f, "{m}"),
        }
    }
}

/// The function a `CallFunction` invokes: a library function, or a user function registered with
/// [`crate::module::ModuleRegistry::wrap`], referenced by name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FunctionKind {
    Builtin(Function),
    Wrapped(String),
}

impl Display for FunctionKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            FunctionKind::Builtin(func) => write!(f, "{func}"),
            FunctionKind::Wrapped(name) => write!(f, "{name}"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ExprKind {
    Input {
        name: String,
    },
    Constant {
        value: NumericTensor,
    },
    GetAttr {
        name: String,
    },
    CallMethod {
        method: MethodKind,
        arg_def: TreeDef,
        out_def: TreeDef,
    },
    CallFunction {
        func: FunctionKind,
        arg_def: TreeDef,
        out_def: TreeDef,
    },
    ApplyPrimitive {
        op: PrimitiveOp,
    },
}

impl ExprKind {
    pub fn kind_name(&self) -> &'static str {
        match self {
            ExprKind::Input { .. } => "Input",
            ExprKind::Constant { .. } => "Constant",
            ExprKind::GetAttr { .. } => "GetAttr",
            ExprKind::CallMethod { .. } => "CallMethod",
            ExprKind::CallFunction { .. } => "CallFunction",
            ExprKind::ApplyPrimitive { .. } => "Apply",
        }
    }

    pub fn is_module_call(&self) -> bool {
        matches!(
            self,
            ExprKind::CallMethod {
                method: MethodKind::Call,
                ..
            }
        )
    }
}

/// One recorded operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Expr {
    pub(crate) id: usize,
    pub(crate) kind: ExprKind,
    pub(crate) inputs: Vec<NodeId>,
    pub(crate) outputs: Vec<NodeId>,
    /// Graph this call traced into, for module calls.
    pub(crate) graph: Option<GraphId>,
    pub(crate) disable_remove: bool,
}

impl Expr {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn kind(&self) -> &ExprKind {
        &self.kind
    }

    pub fn inputs(&self) -> &[NodeId] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[NodeId] {
        &self.outputs
    }

    pub fn graph(&self) -> Option<GraphId> {
        self.graph
    }

    pub fn disable_remove(&self) -> bool {
        self.disable_remove
    }

    /// Pins this expression so that `compile` keeps it even when nothing depends on it.
    pub fn set_disable_remove(&mut self, pinned: bool) {
        self.disable_remove = pinned;
    }

    /// Replays this expression on concrete values. `inputs` line up with `self.inputs()`.
    pub fn interpret(&self, cx: &mut Context, inputs: Vec<Value>) -> Result<Vec<Value>, TraceError> {
        let outputs = match &self.kind {
            ExprKind::Input { name } => {
                return Err(TracedGraphError::InterpretInput(name.clone()).into());
            }
            ExprKind::Constant { value } => vec![Value::tensor(value.clone())],
            ExprKind::GetAttr { name } => {
                let target = inputs
                    .into_iter()
                    .next()
                    .ok_or(TracedGraphError::MissingInputs(self.id))?;
                vec![cx.getattr(&target, name)?]
            }
            ExprKind::CallMethod { method, arg_def, .. } => {
                let tree = arg_def.unflatten(inputs)?;
                let (receiver, args) = CallArgs::from_call_tree(tree, true)?;
                let receiver = receiver
                    .and_then(|r| r.into_leaf())
                    .ok_or(TracedGraphError::MissingInputs(self.id))?;
                let out = match method {
                    MethodKind::Call => cx.call_module(&receiver, args)?,
                    MethodKind::Tensor(m) => cx.call_method(&receiver, *m, args)?,
                };
                out.flatten().0
            }
            ExprKind::CallFunction { func, arg_def, .. } => {
                let tree = arg_def.unflatten(inputs)?;
                let (_, args) = CallArgs::from_call_tree(tree, false)?;
                let out = match func {
                    FunctionKind::Builtin(f) => cx.call_function(*f, args)?,
                    FunctionKind::Wrapped(name) => cx.call_wrapped(name, args)?,
                };
                out.flatten().0
            }
            ExprKind::ApplyPrimitive { op } => cx.apply(op.clone(), &inputs)?,
        };
        if outputs.len() != self.outputs.len() {
            return Err(TracedGraphError::OutputArity {
                expr: self.id,
                expected: self.outputs.len(),
                got: outputs.len(),
            }
            .into());
        }
        Ok(outputs)
    }
}

use crate::dtype::DType;
use crate::traced_graph::{ExprId, GraphId, ModuleId};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorInfo {
    pub shape: Option<Vec<usize>>,
    pub dtype: Option<DType>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleInfo {
    /// Concrete type name, known once tracing has resolved the module.
    pub module_type: Option<String>,
    /// Rebuilt by `ModuleTree::update_ref`.
    #[serde(skip)]
    pub owner: Option<ModuleId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NodeKind {
    Tensor(TensorInfo),
    Module(ModuleInfo),
}

impl NodeKind {
    pub fn tensor(shape: Vec<usize>, dtype: DType) -> Self {
        NodeKind::Tensor(TensorInfo {
            shape: Some(shape),
            dtype: Some(dtype),
        })
    }

    pub fn module(module_type: Option<String>) -> Self {
        NodeKind::Module(ModuleInfo {
            module_type,
            owner: None,
        })
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            NodeKind::Tensor(_) => "TensorNode",
            NodeKind::Module(_) => "ModuleNode",
        }
    }

    pub fn same_kind(&self, other: &NodeKind) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

/// A value in a graph, defined by exactly one expression.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub(crate) id: usize,
    pub(crate) name: String,
    pub(crate) qualname: String,
    pub(crate) expr: ExprId,
    pub(crate) users: Vec<ExprId>,
    pub(crate) graph: GraphId,
    pub(crate) kind: NodeKind,
}

impl Node {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn qualname(&self) -> &str {
        &self.qualname
    }

    /// Defining expression.
    pub fn expr(&self) -> ExprId {
        self.expr
    }

    /// One entry per input slot that consumes this node.
    pub fn users(&self) -> &[ExprId] {
        &self.users
    }

    pub fn top_graph(&self) -> GraphId {
        self.graph
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    pub fn is_tensor(&self) -> bool {
        matches!(self.kind, NodeKind::Tensor(_))
    }

    pub fn is_module(&self) -> bool {
        matches!(self.kind, NodeKind::Module(_))
    }

    pub fn shape(&self) -> Option<&[usize]> {
        match &self.kind {
            NodeKind::Tensor(t) => t.shape.as_deref(),
            NodeKind::Module(_) => None,
        }
    }

    pub fn dtype(&self) -> Option<DType> {
        match &self.kind {
            NodeKind::Tensor(t) => t.dtype,
            NodeKind::Module(_) => None,
        }
    }

    pub fn module_type(&self) -> Option<&str> {
        match &self.kind {
            NodeKind::Module(m) => m.module_type.as_deref(),
            NodeKind::Tensor(_) => None,
        }
    }

    pub fn owner(&self) -> Option<ModuleId> {
        match &self.kind {
            NodeKind::Module(m) => m.owner,
            NodeKind::Tensor(_) => None,
        }
    }
}

impl Display for Node {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)
    }
}

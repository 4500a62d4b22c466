//! Persisted form of an [`InternalGraph`].
//!
//! Current states serialize the graph as is. Legacy states predate qualified names: they carry the
//! owning module's path as `module_name` plus a `prefix_name` for the graph name, and their nodes
//! have no qualname. Loading one resynthesizes the qualnames and rebuilds the namespace.
//!
//! A state holds one graph. Module calls keep the [`GraphId`] of the graph they were traced into,
//! but that graph is not embedded: a restored graph with module calls can only be replayed inside
//! a [`crate::traced_module::ModuleTree`] that still holds its callees.

use crate::traced_graph::expr::{Expr, ExprKind};
use crate::traced_graph::namespace::NameSpace;
use crate::traced_graph::node::{Node, NodeKind};
use crate::traced_graph::{ExprId, GraphId, InternalGraph, NodeId, TracedGraphError};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum GraphStateError {
    #[error(transparent)]
    SerdeJsonError(#[from] serde_json::Error),
    #[error(transparent)]
    TracedGraphError(#[from] TracedGraphError),
    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LegacyNode {
    pub id: usize,
    pub name: String,
    pub expr: ExprId,
    pub users: Vec<ExprId>,
    pub graph: GraphId,
    pub kind: NodeKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LegacyGraph {
    pub id: GraphId,
    pub name: String,
    pub module_name: String,
    #[serde(default)]
    pub prefix_name: String,
    pub nodes: Vec<LegacyNode>,
    pub exprs: Vec<Expr>,
    pub order: Vec<ExprId>,
    pub inputs: Vec<NodeId>,
    pub outputs: Vec<NodeId>,
    #[serde(default)]
    pub top_graph: Option<GraphId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "version")]
pub enum GraphState {
    V1(LegacyGraph),
    V2(InternalGraph),
}

impl LegacyGraph {
    fn upgrade(self) -> Result<InternalGraph, TracedGraphError> {
        let qualname = self.module_name;
        let name = if self.prefix_name.is_empty() {
            self.name
        } else {
            format!("{}_{}", self.prefix_name, self.name)
        };
        let mut graph = InternalGraph {
            id: self.id,
            namespace: NameSpace::new(&name, &qualname),
            name,
            qualname,
            nodes: self
                .nodes
                .into_iter()
                .map(|n| Node {
                    id: n.id,
                    name: n.name,
                    qualname: String::new(),
                    expr: n.expr,
                    users: n.users,
                    graph: n.graph,
                    kind: n.kind,
                })
                .collect(),
            exprs: self.exprs,
            order: self.order,
            inputs: self.inputs,
            outputs: self.outputs,
            top_graph: self.top_graph,
            watch_points: Vec::new(),
            end_points: Vec::new(),
        };
        graph.resynthesize_qualnames()?;
        graph.re_associate_name();
        Ok(graph)
    }
}

impl InternalGraph {
    /// Derives node qualnames from the graph qualname, following attribute reads and module calls.
    fn resynthesize_qualnames(&mut self) -> Result<(), TracedGraphError> {
        let scope = self.qualname.clone();
        let self_node = self.self_node()?;
        for input in self.inputs.clone() {
            let node = self.node_mut(input)?;
            node.qualname = if input == self_node {
                scope.clone()
            } else {
                format!("{scope}.[{}]", node.name)
            };
        }
        for expr_id in self.order.clone() {
            let expr = self.expr(expr_id)?.clone();
            let qualname = match &expr.kind {
                ExprKind::GetAttr { name } => {
                    format!("{}.{name}", self.node(expr.inputs[0])?.qualname)
                }
                ExprKind::CallMethod { .. } if expr.kind.is_module_call() => {
                    format!("{}.[out]", self.node(expr.inputs[0])?.qualname)
                }
                _ => String::new(),
            };
            for out in &expr.outputs {
                let node = self.node_mut(*out)?;
                node.qualname = if qualname.is_empty() {
                    format!("{scope}.[{}]", node.name)
                } else {
                    qualname.clone()
                };
            }
        }
        Ok(())
    }

    pub fn to_state(&self) -> GraphState {
        GraphState::V2(self.clone())
    }

    pub fn from_state(state: GraphState) -> Result<Self, TracedGraphError> {
        match state {
            GraphState::V1(legacy) => {
                log::info!("upgrading legacy graph state {}", legacy.name);
                legacy.upgrade()
            }
            GraphState::V2(graph) => Ok(graph),
        }
    }

    pub fn to_json(&self) -> Result<String, GraphStateError> {
        Ok(serde_json::to_string(&self.to_state())?)
    }

    pub fn from_json(json: &str) -> Result<Self, GraphStateError> {
        let state: GraphState = serde_json::from_str(json)?;
        Ok(Self::from_state(state)?)
    }

    pub fn save(&self, path: &std::path::Path) -> Result<(), GraphStateError> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }

    pub fn load(path: &std::path::Path) -> Result<Self, GraphStateError> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }
}

//! Graph IR produced by tracing.
//!
//! An [`InternalGraph`] owns an arena of [`Node`]s and [`Expr`]s for one traced invocation of a
//! module. Expressions execute in `order`; expressions that were removed by `compile` stay in the
//! arena but drop out of `order` and out of every node's user list. Nodes and expressions refer to
//! each other through local [`NodeId`]/[`ExprId`] indices, and graphs refer to each other through
//! [`GraphId`]s resolved by the owning `ModuleTree`.

use crate::traced_graph::expr::{Expr, ExprKind, MethodKind};
use crate::traced_graph::namespace::{NameOwner, NameSpace, NameSpaceError, get_suffix_name};
use crate::traced_graph::node::{Node, NodeKind};
use crate::tree::TreeError;
use serde::{Deserialize, Serialize};

pub mod algebra;
mod display;
pub mod expr;
pub mod filter;
pub mod interpret;
pub mod namespace;
pub mod node;
pub mod state;

#[derive(Debug, thiserror::Error)]
pub enum TracedGraphError {
    #[error(transparent)]
    NameSpaceError(#[from] NameSpaceError),
    #[error(transparent)]
    TreeError(#[from] TreeError),
    #[error("Node {0:?} does not exist in graph {1}")]
    UnknownNode(NodeId, String),
    #[error("Expr {0:?} does not exist in graph {1}")]
    UnknownExpr(ExprId, String),
    #[error("Expr {0:?} is not part of the execution order of graph {1}")]
    ExprNotInGraph(ExprId, String),
    #[error("Cannot replace {old_kind} {old} with {new_kind} {new}")]
    ReplaceTypeMismatch {
        old: String,
        old_kind: &'static str,
        new: String,
        new_kind: &'static str,
    },
    #[error("Attribute path {qualname} is not under the qualname {scope} of its graph")]
    ForeignAttributePath { qualname: String, scope: String },
    #[error("Input exprs are never interpreted (input {0})")]
    InterpretInput(String),
    #[error("Expr %{0} is missing inputs")]
    MissingInputs(usize),
    #[error("Expr %{expr} should produce {expected} outputs, got {got}")]
    OutputArity {
        expr: usize,
        expected: usize,
        got: usize,
    },
    #[error("Graph {graph} expects {expected} inputs, got {got}")]
    InputArity {
        graph: String,
        expected: usize,
        got: usize,
    },
    #[error("No value was produced for node {0} during interpretation")]
    MissingValue(String),
    #[error("Graph {0} has no self input")]
    MissingSelfInput(String),
}

#[derive(Debug, Clone, Copy, Hash, Ord, PartialOrd, Eq, PartialEq, Serialize, Deserialize)]
pub struct GraphId {
    inner: usize,
}

#[derive(Debug, Clone, Copy, Hash, Ord, PartialOrd, Eq, PartialEq, Serialize, Deserialize)]
pub struct NodeId {
    inner: usize,
}

#[derive(Debug, Clone, Copy, Hash, Ord, PartialOrd, Eq, PartialEq, Serialize, Deserialize)]
pub struct ExprId {
    inner: usize,
}

#[derive(Debug, Clone, Copy, Hash, Ord, PartialOrd, Eq, PartialEq, Serialize, Deserialize)]
pub struct ModuleId {
    inner: usize,
}

impl GraphId {
    pub(crate) fn new(inner: usize) -> Self {
        Self { inner }
    }

    pub fn index(&self) -> usize {
        self.inner
    }
}

impl NodeId {
    pub(crate) fn new(inner: usize) -> Self {
        Self { inner }
    }

    pub fn index(&self) -> usize {
        self.inner
    }
}

impl ExprId {
    pub(crate) fn new(inner: usize) -> Self {
        Self { inner }
    }

    pub fn index(&self) -> usize {
        self.inner
    }
}

impl ModuleId {
    pub(crate) fn new(inner: usize) -> Self {
        Self { inner }
    }

    pub fn index(&self) -> usize {
        self.inner
    }
}

/// A node addressed across graphs.
#[derive(Debug, Clone, Copy, Hash, Ord, PartialOrd, Eq, PartialEq, Serialize, Deserialize)]
pub struct NodeKey {
    pub graph: GraphId,
    pub node: NodeId,
}

/// Monotonic display ids for nodes and exprs, shared by every graph of one traced root.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdCounter {
    pub(crate) node: usize,
    pub(crate) expr: usize,
}

impl IdCounter {
    pub fn next_node(&mut self) -> usize {
        self.node += 1;
        self.node - 1
    }

    pub fn next_expr(&mut self) -> usize {
        self.expr += 1;
        self.expr - 1
    }

    pub fn peek(&self) -> (usize, usize) {
        (self.node, self.expr)
    }
}

/// Requested name and qualname for an output node. Unset fields are derived by auto-naming.
#[derive(Debug, Clone)]
pub struct NodeSpec {
    pub kind: NodeKind,
    pub name: Option<String>,
    pub qualname: Option<String>,
}

impl NodeSpec {
    pub fn new(kind: NodeKind) -> Self {
        Self {
            kind,
            name: None,
            qualname: None,
        }
    }

    pub fn named(kind: NodeKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: Some(name.into()),
            qualname: None,
        }
    }

    pub fn with_qualname(mut self, qualname: impl Into<String>) -> Self {
        self.qualname = Some(qualname.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InternalGraph {
    pub(crate) id: GraphId,
    pub(crate) name: String,
    pub(crate) qualname: String,
    pub(crate) nodes: Vec<Node>,
    pub(crate) exprs: Vec<Expr>,
    pub(crate) order: Vec<ExprId>,
    pub(crate) inputs: Vec<NodeId>,
    pub(crate) outputs: Vec<NodeId>,
    pub(crate) namespace: NameSpace,
    pub(crate) top_graph: Option<GraphId>,
    #[serde(default)]
    pub(crate) watch_points: Vec<NodeId>,
    #[serde(default)]
    pub(crate) end_points: Vec<NodeId>,
}

impl InternalGraph {
    pub fn new(id: GraphId, name: &str, qualname: &str, top_graph: Option<GraphId>) -> Self {
        Self {
            id,
            name: name.to_string(),
            qualname: qualname.to_string(),
            nodes: Vec::new(),
            exprs: Vec::new(),
            order: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            namespace: NameSpace::new(name, qualname),
            top_graph,
            watch_points: Vec::new(),
            end_points: Vec::new(),
        }
    }

    pub fn id(&self) -> GraphId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn qualname(&self) -> &str {
        &self.qualname
    }

    pub fn top_graph(&self) -> Option<GraphId> {
        self.top_graph
    }

    pub fn namespace(&self) -> &NameSpace {
        &self.namespace
    }

    pub fn inputs(&self) -> &[NodeId] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[NodeId] {
        &self.outputs
    }

    /// Live expressions in execution order, excluding the input declarations.
    pub fn order(&self) -> &[ExprId] {
        &self.order
    }

    pub fn key(&self, node: NodeId) -> NodeKey {
        NodeKey {
            graph: self.id,
            node,
        }
    }

    /// The module node every graph declares as its first input.
    pub fn self_node(&self) -> Result<NodeId, TracedGraphError> {
        self.inputs
            .first()
            .copied()
            .ok_or_else(|| TracedGraphError::MissingSelfInput(self.name.clone()))
    }

    pub fn node(&self, id: NodeId) -> Result<&Node, TracedGraphError> {
        self.nodes
            .get(id.inner)
            .ok_or_else(|| TracedGraphError::UnknownNode(id, self.name.clone()))
    }

    pub fn node_mut(&mut self, id: NodeId) -> Result<&mut Node, TracedGraphError> {
        let name = &self.name;
        self.nodes
            .get_mut(id.inner)
            .ok_or_else(|| TracedGraphError::UnknownNode(id, name.clone()))
    }

    pub fn expr(&self, id: ExprId) -> Result<&Expr, TracedGraphError> {
        self.exprs
            .get(id.inner)
            .ok_or_else(|| TracedGraphError::UnknownExpr(id, self.name.clone()))
    }

    pub fn expr_mut(&mut self, id: ExprId) -> Result<&mut Expr, TracedGraphError> {
        let name = &self.name;
        self.exprs
            .get_mut(id.inner)
            .ok_or_else(|| TracedGraphError::UnknownExpr(id, name.clone()))
    }

    /// Position of `expr` in the execution order; `None` for inputs and removed exprs.
    pub fn position(&self, expr: ExprId) -> Option<usize> {
        self.order.iter().position(|e| *e == expr)
    }

    /// Input declarations followed by the live expressions.
    pub fn exprs(&self) -> impl Iterator<Item = (ExprId, &Expr)> + '_ {
        self.inputs
            .iter()
            .map(|n| self.nodes[n.inner].expr)
            .chain(self.order.iter().copied())
            .map(|e| (e, &self.exprs[e.inner]))
    }

    /// Every node defined by an input declaration or a live expression.
    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &Node)> + '_ {
        self.exprs()
            .flat_map(|(_, e)| e.outputs.iter().copied())
            .map(|n| (n, &self.nodes[n.inner]))
    }

    fn new_node(&mut self, spec: &NodeSpec, expr: ExprId, ids: &mut IdCounter) -> NodeId {
        let id = NodeId::new(self.nodes.len());
        self.nodes.push(Node {
            id: ids.next_node(),
            name: String::new(),
            qualname: spec.qualname.clone().unwrap_or_default(),
            expr,
            users: Vec::new(),
            graph: self.id,
            kind: spec.kind.clone(),
        });
        id
    }

    /// Declares a graph parameter.
    pub fn add_input(&mut self, spec: NodeSpec, ids: &mut IdCounter) -> Result<NodeId, TracedGraphError> {
        let name = spec.name.clone().unwrap_or_else(|| format!("arg_{}", self.inputs.len()));
        let expr_id = ExprId::new(self.exprs.len());
        let node = self.new_node(&spec, expr_id, ids);
        self.exprs.push(Expr {
            id: ids.next_expr(),
            kind: ExprKind::Input { name },
            inputs: Vec::new(),
            outputs: vec![node],
            graph: None,
            disable_remove: false,
        });
        self.inputs.push(node);
        self.auto_name_outputs(expr_id, &[spec.name])?;
        log::debug!("{}: input {}", self.name, self.nodes[node.inner].name);
        Ok(node)
    }

    /// Redeclares every input but the module input as fresh inputs of `kinds`, named `args`,
    /// `args_1`, and so on. Users of the old inputs are left as they are; move them over with
    /// [`InternalGraph::replace_node`].
    pub fn reset_inputs(&mut self, kinds: Vec<NodeKind>, ids: &mut IdCounter) -> Result<Vec<NodeId>, TracedGraphError> {
        let this = self.self_node()?;
        self.inputs = vec![this];
        kinds
            .into_iter()
            .map(|kind| self.add_input(NodeSpec::named(kind, "args"), ids))
            .collect()
    }

    pub fn add_output(&mut self, node: NodeId) -> Result<(), TracedGraphError> {
        self.node(node)?;
        self.outputs.push(node);
        Ok(())
    }

    /// Records an expression and creates its output nodes. With `pending`, the expression is
    /// buffered there instead of being appended to the execution order.
    pub fn push_expr(
        &mut self,
        kind: ExprKind,
        inputs: Vec<NodeId>,
        outputs: Vec<NodeSpec>,
        ids: &mut IdCounter,
        pending: Option<&mut Vec<ExprId>>,
    ) -> Result<ExprId, TracedGraphError> {
        for n in &inputs {
            self.node(*n)?;
        }
        let expr_id = ExprId::new(self.exprs.len());
        let names: Vec<Option<String>> = outputs.iter().map(|s| s.name.clone()).collect();
        let output_ids = outputs
            .iter()
            .map(|spec| self.new_node(spec, expr_id, ids))
            .collect::<Vec<_>>();
        for n in &inputs {
            self.nodes[n.inner].users.push(expr_id);
        }
        self.exprs.push(Expr {
            id: ids.next_expr(),
            kind,
            inputs,
            outputs: output_ids,
            graph: None,
            disable_remove: false,
        });
        match pending {
            Some(pending) => pending.push(expr_id),
            None => self.order.push(expr_id),
        }
        self.auto_name_outputs(expr_id, &names)?;
        log::debug!("{}: recorded {}", self.name, self.render_expr(expr_id));
        Ok(expr_id)
    }

    /// Derives names and qualnames for the outputs of `expr` from its variant.
    fn auto_name_outputs(&mut self, expr_id: ExprId, preset: &[Option<String>]) -> Result<(), TracedGraphError> {
        let expr = &self.exprs[expr_id.inner];
        let scope = self.qualname.clone();
        let mut add_suffix = true;
        let (name, qualname) = match &expr.kind {
            ExprKind::CallMethod {
                method: MethodKind::Call,
                ..
            } => {
                let callee = &self.nodes[expr.inputs[0].inner];
                (callee.name.clone(), format!("{}.[out]", callee.qualname))
            }
            ExprKind::CallMethod {
                method: MethodKind::Tensor(m),
                ..
            } => {
                let name = m.short_name();
                let slot = self.namespace.create_unique_name(&format!("method_{name}"), None);
                (name, format!("{scope}.[{slot}]"))
            }
            ExprKind::CallFunction { func, .. } => {
                let name = func.to_string();
                let slot = self.namespace.create_unique_name(&format!("func_{name}"), None);
                (name, format!("{scope}.[{slot}]"))
            }
            ExprKind::ApplyPrimitive { op } => {
                let name = op.to_string();
                let slot = self.namespace.create_unique_name(&format!("def_{name}"), None);
                (name, format!("{scope}.[{slot}]"))
            }
            ExprKind::GetAttr { name } => {
                add_suffix = false;
                let owner = &self.nodes[expr.inputs[0].inner];
                let qualname = format!("{}.{}", owner.qualname, name);
                let suffix = get_suffix_name(&scope, &qualname)
                    .ok_or_else(|| TracedGraphError::ForeignAttributePath {
                        qualname: qualname.clone(),
                        scope: scope.clone(),
                    })?
                    .to_string();
                (suffix, qualname)
            }
            ExprKind::Input { name } => {
                add_suffix = false;
                (name.clone(), format!("{scope}.[{name}]"))
            }
            ExprKind::Constant { .. } => {
                add_suffix = false;
                let name = "const_tensor".to_string();
                (name.clone(), format!("{scope}.[{name}]"))
            }
        };
        let outputs = self.exprs[expr_id.inner].outputs.clone();
        for (i, node) in outputs.into_iter().enumerate() {
            let candidate = match preset.get(i).cloned().flatten() {
                Some(n) => n,
                None if add_suffix => format!("{name}_out"),
                None => name.clone(),
            };
            let unique = self
                .namespace
                .create_unique_name(&candidate, Some(NameOwner::Node(node)));
            let n = &mut self.nodes[node.inner];
            n.name = unique;
            if n.qualname.is_empty() {
                n.qualname = qualname.clone();
            }
        }
        if get_suffix_name(&scope, &qualname).is_none() {
            return Err(TracedGraphError::ForeignAttributePath { qualname, scope });
        }
        Ok(())
    }

    /// Clears and re-derives the namespace from the current node names, in node order.
    pub fn re_associate_name(&mut self) {
        self.namespace.clear();
        let nodes: Vec<NodeId> = self.nodes().map(|(id, _)| id).collect();
        for id in nodes {
            let current = self.nodes[id.inner].name.clone();
            let name = self
                .namespace
                .create_unique_name(&current, Some(NameOwner::Node(id)));
            self.nodes[id.inner].name = name;
        }
    }

    /// Renames a node through the namespace. Returns the name actually assigned.
    pub fn rename_node(&mut self, node: NodeId, name: &str) -> Result<String, TracedGraphError> {
        let old = self.node(node)?.name.clone();
        if !old.is_empty() && self.namespace.owner_of(&old) == Some(NameOwner::Node(node)) {
            self.namespace
                .unassociate_name_with_obj(&old, NameOwner::Node(node))?;
        }
        let new = self
            .namespace
            .create_unique_name(name, Some(NameOwner::Node(node)));
        self.nodes[node.inner].name = new.clone();
        Ok(new)
    }
}

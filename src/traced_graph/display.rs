use crate::traced_graph::expr::{ExprKind, MethodKind};
use crate::traced_graph::{ExprId, InternalGraph, NodeId};
use crate::tree::{CallArgs, Tree, TreeDef};
use std::fmt::{Display, Formatter};

impl InternalGraph {
    fn node_names(&self, nodes: &[NodeId]) -> Vec<String> {
        nodes.iter().map(|n| self.nodes[n.index()].name.clone()).collect()
    }

    fn render_call(&self, arg_def: &TreeDef, inputs: &[NodeId], has_receiver: bool) -> (Option<String>, String) {
        let call = arg_def
            .unflatten(self.node_names(inputs))
            .and_then(|tree| CallArgs::from_call_tree(tree, has_receiver));
        match call {
            Ok((receiver, args)) => {
                let positional = args.args.iter().map(|a| a.to_string());
                let keyword = args.kwargs.iter().map(|(k, v)| format!("{k}={v}"));
                (
                    receiver.map(|r| r.to_string()),
                    positional.chain(keyword).collect::<Vec<_>>().join(", "),
                )
            }
            // a malformed argdef still renders, just without structure
            Err(_) => (None, self.node_names(inputs).join(", ")),
        }
    }

    fn render_outputs(&self, out_def: &TreeDef, outputs: &[NodeId]) -> String {
        let names = self.node_names(outputs);
        match out_def.unflatten(names.clone()) {
            Ok(tree) => tree.to_string(),
            Err(_) => Tree::Seq(names.into_iter().map(Tree::Leaf).collect()).to_string(),
        }
    }

    /// One line per expression, e.g. `%3:\tadd_out = x.__add__(p)`.
    pub fn render_expr(&self, expr_id: ExprId) -> String {
        let expr = &self.exprs[expr_id.index()];
        let id = expr.id;
        match &expr.kind {
            ExprKind::Input { .. } => {
                format!("%{id}:\t{} = Input()", self.render_outputs(&TreeDef::Leaf, &expr.outputs))
            }
            ExprKind::Constant { value } => format!(
                "%{id}:\t{} = Constant({}{:?})",
                self.render_outputs(&TreeDef::Leaf, &expr.outputs),
                value.dtype(),
                value.shape()
            ),
            ExprKind::GetAttr { name } => format!(
                "%{id}:\t{} = getattr({}, \"{name}\")",
                self.render_outputs(&TreeDef::Leaf, &expr.outputs),
                self.node_names(&expr.inputs).join(", ")
            ),
            ExprKind::CallMethod {
                method,
                arg_def,
                out_def,
            } => {
                let (receiver, args) = self.render_call(arg_def, &expr.inputs, true);
                let method = match method {
                    MethodKind::Call => String::new(),
                    MethodKind::Tensor(m) => format!(".{m}"),
                };
                let outputs = if expr.outputs.is_empty() {
                    String::new()
                } else {
                    format!("{} = ", self.render_outputs(out_def, &expr.outputs))
                };
                format!("%{id}:\t{outputs}{}{method}({args})", receiver.unwrap_or_default())
            }
            ExprKind::CallFunction { func, arg_def, out_def } => {
                let (_, args) = self.render_call(arg_def, &expr.inputs, false);
                let outputs = if expr.outputs.is_empty() {
                    String::new()
                } else {
                    format!("{} = ", self.render_outputs(out_def, &expr.outputs))
                };
                format!("%{id}:\t{outputs}{func}({args})")
            }
            ExprKind::ApplyPrimitive { op } => format!(
                "%{id}:\t{} = {op}({})",
                self.node_names(&expr.outputs).join(", "),
                self.node_names(&expr.inputs).join(", ")
            ),
        }
    }
}

impl Display for InternalGraph {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = if self.name.is_empty() {
            String::new()
        } else {
            format!("{}.Graph", self.name)
        };
        let exprs: Vec<String> = self.order.iter().map(|e| self.render_expr(*e)).collect();
        write!(
            f,
            "{name} ({}) {{\n\t{}\n\treturn {}\n}}",
            self.node_names(&self.inputs).join(", "),
            exprs.join("\n\t"),
            self.node_names(&self.outputs).join(", ")
        )
    }
}

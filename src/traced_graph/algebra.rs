use crate::traced_graph::expr::ExprKind;
use crate::traced_graph::namespace::NameOwner;
use crate::traced_graph::{ExprId, InternalGraph, NodeId, TracedGraphError};
use std::collections::{BTreeMap, HashMap, HashSet};

/// A user expression left untouched by [`InternalGraph::replace_node`] because rewiring it would
/// have made the replacement depend on itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SkippedReplacement {
    pub old: NodeId,
    pub new: NodeId,
    pub user: ExprId,
}

impl InternalGraph {
    /// Every expression (input declarations included) that `nodes` transitively depend on, listed
    /// in graph order.
    pub fn get_dep_exprs(&self, nodes: &[NodeId]) -> Result<Vec<ExprId>, TracedGraphError> {
        let deps = self.dep_set(nodes)?;
        Ok(self
            .exprs()
            .map(|(id, _)| id)
            .filter(|id| deps.contains(id))
            .collect())
    }

    fn dep_set(&self, nodes: &[NodeId]) -> Result<HashSet<ExprId>, TracedGraphError> {
        let mut deps = HashSet::new();
        let mut visited = HashSet::new();
        let mut queue: Vec<NodeId> = nodes.to_vec();
        while let Some(node) = queue.pop() {
            if !visited.insert(node) {
                continue;
            }
            let expr_id = self.node(node)?.expr;
            if deps.insert(expr_id) {
                queue.extend(self.expr(expr_id)?.inputs.iter().copied());
            }
        }
        Ok(deps)
    }

    /// Coalesces `GetAttr`s that denote the same attribute path into one node and rewrites each
    /// surviving `GetAttr` to read its full path directly from the graph's module input.
    ///
    /// Only chains rooted at the `self` input are rewritten. Reads through a module passed in as an
    /// argument are left as they are.
    pub fn merge_getattr(&mut self) -> Result<usize, TracedGraphError> {
        let self_node = self.self_node()?;
        // attribute path of every module-derived node reachable from `self`
        let mut paths: HashMap<NodeId, String> = HashMap::new();
        let mut canonical: BTreeMap<String, NodeId> = BTreeMap::new();
        let mut merged = 0;
        for expr_id in self.order.clone() {
            let expr = self.expr(expr_id)?;
            let ExprKind::GetAttr { name } = &expr.kind else {
                continue;
            };
            let out = expr.outputs[0];
            let target = expr.inputs[0];
            let attr_name = if target == self_node {
                name.clone()
            } else {
                match paths.get(&target) {
                    Some(base) => format!("{base}.{name}"),
                    None => continue,
                }
            };
            if let Some(&base) = canonical.get(&attr_name) {
                self.redirect_users(out, base);
                merged += 1;
                continue;
            }
            if attr_name != *name {
                self.unlink_user(target, expr_id);
                self.nodes[self_node.inner].users.push(expr_id);
                let expr = &mut self.exprs[expr_id.inner];
                expr.inputs[0] = self_node;
                expr.kind = ExprKind::GetAttr {
                    name: attr_name.clone(),
                };
            }
            paths.insert(out, attr_name.clone());
            canonical.insert(attr_name, out);
        }
        Ok(merged)
    }

    /// Moves every use of `from` (graph outputs included) onto `to`.
    fn redirect_users(&mut self, from: NodeId, to: NodeId) {
        let users = std::mem::take(&mut self.nodes[from.inner].users);
        for user in users {
            replace_first(&mut self.exprs[user.inner].inputs, from, to);
            self.nodes[to.inner].users.push(user);
        }
        for out in self.outputs.iter_mut() {
            if *out == from {
                *out = to;
            }
        }
    }

    /// Drops one `users` entry of `node` pointing at `user`.
    pub(crate) fn unlink_user(&mut self, node: NodeId, user: ExprId) {
        let users = &mut self.nodes[node.inner].users;
        if let Some(i) = users.iter().position(|u| *u == user) {
            users.remove(i);
        }
    }

    /// Unlinks `expr` from its inputs (one entry per input slot) and releases its output names.
    /// The expression itself stays in the arena.
    pub(crate) fn detach_expr(&mut self, expr: ExprId) {
        let (inputs, outputs) = {
            let e = &self.exprs[expr.inner];
            (e.inputs.clone(), e.outputs.clone())
        };
        for input in inputs {
            self.unlink_user(input, expr);
        }
        for out in outputs {
            let owner = NameOwner::Node(out);
            let name = self.nodes[out.inner].name.clone();
            if self.namespace.owner_of(&name) == Some(owner) {
                // owner was checked just above
                let _ = self.namespace.unassociate_name_with_obj(&name, owner);
            }
        }
    }

    /// Merges attribute reads, then removes every expression that neither an output nor a pinned
    /// expression depends on. Returns the number of removed expressions.
    pub fn compile(&mut self) -> Result<usize, TracedGraphError> {
        let merged = self.merge_getattr()?;
        let mut roots = self.outputs.clone();
        for expr_id in &self.order {
            let expr = &self.exprs[expr_id.inner];
            if expr.disable_remove {
                roots.extend(expr.outputs.iter().copied());
                roots.extend(expr.inputs.iter().copied());
            }
        }
        let deps = self.dep_set(&roots)?;
        let mut kept = Vec::with_capacity(self.order.len());
        let mut removed = 0;
        // reverse order so users are unlinked before the nodes they consume are examined
        for expr_id in self.order.clone().into_iter().rev() {
            if deps.contains(&expr_id) || self.exprs[expr_id.inner].disable_remove {
                kept.push(expr_id);
            } else {
                self.detach_expr(expr_id);
                removed += 1;
            }
        }
        kept.reverse();
        self.order = kept;
        log::info!(
            "compiled {}: merged {merged} attribute reads, removed {removed} exprs, {} remain",
            self.name,
            self.order.len()
        );
        Ok(removed)
    }

    /// Rewires uses of each `old` node onto its `new` counterpart.
    ///
    /// The expression defining `new`, and every other user that executes before it, keep reading
    /// `old`. Users that `new` depends on through other expressions are skipped with a warning and
    /// returned, since rewiring them would form a cycle.
    pub fn replace_node(
        &mut self,
        mapping: &[(NodeId, NodeId)],
    ) -> Result<Vec<SkippedReplacement>, TracedGraphError> {
        let mut skipped = Vec::new();
        for &(old, new) in mapping {
            let old_node = self.node(old)?;
            let new_node = self.node(new)?;
            if !old_node.kind.same_kind(&new_node.kind) {
                return Err(TracedGraphError::ReplaceTypeMismatch {
                    old: old_node.name.clone(),
                    old_kind: old_node.kind.kind_name(),
                    new: new_node.name.clone(),
                    new_kind: new_node.kind.kind_name(),
                });
            }
            let new_expr = new_node.expr;
            for out in self.outputs.iter_mut() {
                if *out == old {
                    *out = new;
                }
            }
            let def_position = self.position(new_expr).map(|p| p as isize).unwrap_or(-1);
            let deps = self.dep_set(&[new])?;
            let mut i = 0;
            while i < self.nodes[old.inner].users.len() {
                let user = self.nodes[old.inner].users[i];
                if user != new_expr && deps.contains(&user) {
                    log::warn!(
                        "{}: replacing {} with {} would create a loop through expr %{}, skipped",
                        self.name,
                        self.nodes[old.inner].name,
                        self.nodes[new.inner].name,
                        self.exprs[user.inner].id
                    );
                    skipped.push(SkippedReplacement { old, new, user });
                    i += 1;
                    continue;
                }
                if let Some(pos) = self.position(user) {
                    if pos as isize <= def_position {
                        i += 1;
                        continue;
                    }
                }
                self.nodes[old.inner].users.remove(i);
                self.nodes[new.inner].users.push(user);
                replace_first(&mut self.exprs[user.inner].inputs, old, new);
            }
        }
        Ok(skipped)
    }

    /// Replaces the graph outputs.
    pub fn set_outputs(&mut self, outputs: Vec<NodeId>) -> Result<(), TracedGraphError> {
        for n in &outputs {
            self.node(*n)?;
        }
        self.outputs = outputs;
        Ok(())
    }

    /// Inserts already recorded, detached expressions into the execution order at `position`.
    pub(crate) fn splice_exprs(&mut self, position: usize, exprs: &[ExprId]) {
        let position = position.min(self.order.len());
        self.order.splice(position..position, exprs.iter().copied());
    }
}

fn replace_first(inputs: &mut [NodeId], from: NodeId, to: NodeId) {
    if let Some(slot) = inputs.iter_mut().find(|n| **n == from) {
        *slot = to;
    }
}

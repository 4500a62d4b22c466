use crate::traced_graph::{InternalGraph, NodeId, TracedGraphError};
use crate::tracer::{Context, TraceError, Value};
use std::collections::HashMap;

/// Result of running a graph: either its outputs, or the end-point values when execution stopped
/// early.
#[derive(Debug, Clone)]
pub enum Interpreted {
    Outputs(Vec<Value>),
    EndPoints(Vec<Value>),
}

impl Interpreted {
    pub fn into_values(self) -> Vec<Value> {
        match self {
            Interpreted::Outputs(v) | Interpreted::EndPoints(v) => v,
        }
    }

    pub fn is_end_points(&self) -> bool {
        matches!(self, Interpreted::EndPoints(_))
    }
}

impl InternalGraph {
    /// Replays the graph on `inputs`, one value per declared input (the module value first).
    ///
    /// Intermediate values are dropped as soon as their last user has run. Watch point values are
    /// recorded into `cx`; once every end point has a value the remaining exprs are skipped.
    pub fn interpret(&self, cx: &mut Context, inputs: Vec<Value>) -> Result<Interpreted, TraceError> {
        if inputs.len() != self.inputs.len() {
            return Err(TracedGraphError::InputArity {
                graph: self.name.clone(),
                expected: self.inputs.len(),
                got: inputs.len(),
            }
            .into());
        }
        let mut refcount: HashMap<NodeId, usize> = HashMap::new();
        let mut values: HashMap<NodeId, Value> = HashMap::new();
        for (node, value) in self.inputs.iter().zip(inputs) {
            self.store(*node, value, cx, &mut refcount, &mut values);
        }
        if let Some(done) = self.collect_end_points(&values) {
            return Ok(Interpreted::EndPoints(done));
        }
        for expr_id in &self.order {
            let expr = &self.exprs[expr_id.inner];
            let mut args = Vec::with_capacity(expr.inputs.len());
            for input in &expr.inputs {
                let value = values
                    .get(input)
                    .cloned()
                    .ok_or_else(|| TracedGraphError::MissingValue(self.nodes[input.inner].name.clone()))?;
                args.push(value);
                if let Some(count) = refcount.get_mut(input) {
                    *count = count.saturating_sub(1);
                    if *count == 0 {
                        values.remove(input);
                    }
                }
            }
            let outputs = expr.interpret(cx, args)?;
            for (node, value) in expr.outputs.iter().zip(outputs) {
                self.store(*node, value, cx, &mut refcount, &mut values);
            }
            if !self.end_points.is_empty() {
                if let Some(done) = self.collect_end_points(&values) {
                    log::debug!("{}: end points reached after expr %{}", self.name, expr.id);
                    return Ok(Interpreted::EndPoints(done));
                }
            }
        }
        let outputs = self
            .outputs
            .iter()
            .map(|o| {
                values
                    .get(o)
                    .cloned()
                    .ok_or_else(|| TracedGraphError::MissingValue(self.nodes[o.inner].name.clone()).into())
            })
            .collect::<Result<Vec<_>, TraceError>>()?;
        Ok(Interpreted::Outputs(outputs))
    }

    fn store(
        &self,
        node: NodeId,
        value: Value,
        cx: &mut Context,
        refcount: &mut HashMap<NodeId, usize>,
        values: &mut HashMap<NodeId, Value>,
    ) {
        if self.watch_points.contains(&node) {
            cx.record_watch(self.key(node), value.clone());
        }
        let count = self.nodes[node.inner].users.len()
            + self.outputs.iter().filter(|o| **o == node).count()
            + self.end_points.iter().filter(|o| **o == node).count();
        if count > 0 {
            refcount.insert(node, count);
            values.insert(node, value);
        }
    }

    fn collect_end_points(&self, values: &HashMap<NodeId, Value>) -> Option<Vec<Value>> {
        if self.end_points.is_empty() {
            return None;
        }
        self.end_points
            .iter()
            .map(|n| values.get(n).cloned())
            .collect()
    }

    pub fn watch_points(&self) -> &[NodeId] {
        &self.watch_points
    }

    pub fn end_points(&self) -> &[NodeId] {
        &self.end_points
    }
}

use crate::backends::PrimitiveRuntime;
use crate::dtype::DType;
use crate::module::{ModuleRef, ModuleRegistry};
use crate::numeric_tensor::NumericTensor;
use crate::traced_graph::node::NodeKind;
use crate::traced_graph::{ExprId, GraphId, IdCounter, InternalGraph, NodeId, NodeKey};
use crate::traced_module::{Attribute, ModuleObject, ModuleTree};
use crate::tracer::{Context, ModuleHandle, ModuleValue, Scope, TraceError, Tracer, Value};
use std::collections::BTreeMap;

struct Snapshot {
    graph: InternalGraph,
    modules: usize,
    next_graph: usize,
    ids: IdCounter,
}

/// Records new expressions into an existing graph.
///
/// Values obtained from [`InsertExprs::node`] stand for existing nodes; operations on them through
/// [`InsertExprs::cx`] are recorded and spliced in after the chosen expression on
/// [`InsertExprs::commit`]. Dropping the guard without committing restores the graph.
pub struct InsertExprs<'a> {
    cx: Context<'a>,
    graph: GraphId,
    after: Option<ExprId>,
    snapshot: Option<Snapshot>,
}

impl ModuleTree {
    /// Opens an insertion point in `graph` right after `after`, or at the end of the graph when
    /// `after` is `None`.
    pub fn insert_exprs<'a>(
        &'a mut self,
        graph: GraphId,
        after: Option<ExprId>,
        registry: &'a ModuleRegistry,
        runtime: &'a dyn PrimitiveRuntime,
    ) -> Result<InsertExprs<'a>, TraceError> {
        let g = self.graph(graph)?;
        if let Some(after) = after {
            g.expr(after)?;
        }
        self.graph_owner(graph).ok_or(TraceError::GraphWithoutOwner(graph))?;
        let snapshot = Snapshot {
            graph: g.clone(),
            modules: self.modules.len(),
            next_graph: self.next_graph,
            ids: self.ids,
        };
        let mut tracer = Tracer::new(self, registry);
        tracer.scopes.push(Scope {
            graph,
            builder: None,
            pending: Some(Vec::new()),
        });
        log::debug!("inserting into graph {}", graph.index());
        Ok(InsertExprs {
            cx: Context::tracing(runtime, tracer),
            graph,
            after,
            snapshot: Some(snapshot),
        })
    }
}

impl<'a> InsertExprs<'a> {
    pub fn cx(&mut self) -> &mut Context<'a> {
        &mut self.cx
    }

    /// A traced stand-in for an existing node. Tensors carry zeros of the node's shape.
    pub fn node(&mut self, id: NodeId) -> Result<Value, TraceError> {
        let graph = self.graph;
        let tracer = self.cx.tracer()?;
        let node = tracer.tree.graph(graph)?.node(id)?;
        let key = NodeKey { graph, node: id };
        let value = match &node.kind {
            NodeKind::Tensor(info) => {
                let shape = info.shape.clone().unwrap_or_default();
                Value::tensor(NumericTensor::zeros(&shape, info.dtype.unwrap_or(DType::F32)))
            }
            NodeKind::Module(info) => {
                let owner = info
                    .owner
                    .ok_or_else(|| TraceError::UntrackedModule(node.qualname.clone()))?;
                Value::Module(ModuleValue {
                    handle: ModuleHandle::Resolved(owner),
                    node: None,
                })
            }
        };
        Ok(value.with_node(key))
    }

    /// The graph's own module input.
    pub fn self_module(&mut self) -> Result<Value, TraceError> {
        let graph = self.graph;
        let node = self.cx.tracer()?.tree.graph(graph)?.self_node()?;
        self.node(node)
    }

    /// Attaches a new sub-module to the graph's module and returns it as a traced attribute read.
    /// Calls to it are traced into a graph of their own.
    pub fn add_module(&mut self, name: &str, module: ModuleRef) -> Result<Value, TraceError> {
        let this = self.self_module()?;
        self.cx.add_module(&this, name, module)
    }

    /// Splices the recorded expressions into the graph and attaches any added modules.
    pub fn commit(mut self) -> Result<Vec<ExprId>, TraceError> {
        let graph = self.graph;
        let after = self.after;
        let tracer = self.cx.tracer()?;
        let scope = tracer.scopes.pop().ok_or(TraceError::NoScope)?;
        if scope.graph != graph || !tracer.scopes.is_empty() {
            return Err(TraceError::ScopeMismatch {
                expected: Some(graph),
                found: Some(scope.graph),
            });
        }
        let recorded = scope.pending.unwrap_or_default();
        let owner = tracer
            .tree
            .graph_owner(graph)
            .ok_or(TraceError::GraphWithoutOwner(graph))?;
        let pending: BTreeMap<String, _> = std::mem::take(&mut tracer.pending_attrs);
        let mut attached = Vec::new();
        for (name, b) in pending {
            attached.push((name, tracer.resolve(b)?));
        }
        let tree = &mut *tracer.tree;
        if let ModuleObject::Traced(tm) = tree.module_mut(owner)? {
            for (name, id) in attached {
                tm.attributes.insert(name, Attribute::Module(id));
            }
        }
        let g = tree.graph_mut(graph)?;
        let mut position = match after {
            Some(after) => g.position(after).map(|p| p + 1).unwrap_or(0),
            None => g.order().len(),
        };
        // never before the definition of a captured node
        for e in &recorded {
            for input in g.expr(*e)?.inputs() {
                let def = g.node(*input)?.expr();
                if let Some(p) = g.position(def) {
                    position = position.max(p + 1);
                }
            }
        }
        g.splice_exprs(position, &recorded);
        log::info!("inserted {} exprs into {} at {position}", recorded.len(), g.name());
        tree.reset_ids();
        tree.update_ref();
        self.snapshot = None;
        Ok(recorded)
    }
}

impl Drop for InsertExprs<'_> {
    fn drop(&mut self) {
        let Some(snapshot) = self.snapshot.take() else {
            return;
        };
        let Ok(tracer) = self.cx.tracer() else {
            return;
        };
        let created = std::mem::take(&mut tracer.created_graphs);
        let tree = &mut *tracer.tree;
        for id in created {
            tree.graphs.remove(&id);
        }
        tree.graphs.insert(self.graph, snapshot.graph);
        tree.modules.truncate(snapshot.modules);
        tree.next_graph = snapshot.next_graph;
        tree.ids = snapshot.ids;
        log::debug!("rolled back insertion into graph {}", self.graph.index());
    }
}

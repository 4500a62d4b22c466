//! Traced module hierarchies.
//!
//! [`trace_module`] runs a module once under a tracing [`Context`] and returns a [`ModuleTree`]: an
//! arena of module objects, where every traced user module holds one graph per argument shape it
//! was called with, and builtin or never-called modules stay plain module objects.

use crate::backends::PrimitiveRuntime;
use crate::dtype::DType;
use crate::module::{Attr, ModuleRef, ModuleRegistry, UserFunctionRef};
use crate::numeric_tensor::NumericTensor;
use crate::ops::{Function, TensorMethod};
use crate::traced_graph::expr::ExprKind;
use crate::traced_graph::filter::{ExprFilter, NodeFilter};
use crate::traced_graph::interpret::Interpreted;
use crate::traced_graph::node::NodeKind;
use crate::traced_graph::{ExprId, GraphId, IdCounter, InternalGraph, ModuleId, NodeId, NodeKey, NodeSpec};
use crate::tracer::builder::ShadowModule;
use crate::tracer::{Context, ModuleHandle, ModuleValue, Scope, TraceError, Tracer, Value};
use crate::tree::{CallArgs, Tree, TreeDef};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::{Display, Formatter};

/// One traced call shape of a module.
#[derive(Debug, Clone)]
pub struct ArgDefEntry {
    pub arg_def: TreeDef,
    pub out_def: TreeDef,
    pub graph: GraphId,
}

#[derive(Debug, Clone)]
pub enum Attribute {
    Module(ModuleId),
    Tensor(NumericTensor),
}

/// The graph-backed replacement of a traced user module.
#[derive(Debug, Clone)]
pub struct TracedModule {
    pub type_name: String,
    pub is_top: bool,
    pub entries: Vec<ArgDefEntry>,
    pub attributes: BTreeMap<String, Attribute>,
}

impl TracedModule {
    pub fn entry(&self, arg_def: &TreeDef) -> Option<&ArgDefEntry> {
        self.entries.iter().find(|e| e.arg_def == *arg_def)
    }

    pub fn graphs(&self) -> impl Iterator<Item = GraphId> + '_ {
        self.entries.iter().map(|e| e.graph)
    }
}

#[derive(Debug, Clone)]
pub enum ModuleObject {
    /// Executed through its own `forward`.
    Opaque(ModuleRef),
    Traced(TracedModule),
}

impl ModuleObject {
    pub fn type_name(&self) -> &str {
        match self {
            ModuleObject::Opaque(m) => m.type_name(),
            ModuleObject::Traced(t) => &t.type_name,
        }
    }

    pub fn as_traced(&self) -> Option<&TracedModule> {
        match self {
            ModuleObject::Traced(t) => Some(t),
            ModuleObject::Opaque(_) => None,
        }
    }
}

/// A traced root module together with every module and graph reachable from it.
#[derive(Debug, Clone)]
pub struct ModuleTree {
    pub(crate) name: String,
    pub(crate) graphs: BTreeMap<GraphId, InternalGraph>,
    pub(crate) modules: Vec<ModuleObject>,
    pub(crate) root: ModuleId,
    pub(crate) next_graph: usize,
    pub(crate) ids: IdCounter,
    pub(crate) watch_values: HashMap<NodeKey, Value>,
    /// Wrapped user functions recorded in the graphs, by name.
    pub(crate) functions: BTreeMap<String, UserFunctionRef>,
}

/// Traces `module` called with `args` and returns the resulting tree.
pub fn trace_module(
    module: ModuleRef,
    args: CallArgs<NumericTensor>,
    registry: &ModuleRegistry,
    runtime: &dyn PrimitiveRuntime,
) -> Result<ModuleTree, TraceError> {
    args.check_unique_kwargs()?;
    if registry.is_builtin(module.type_name()) {
        return Err(TraceError::RootIsBuiltin(module.type_name().to_string()));
    }
    let name = module.name().unwrap_or(module.type_name()).to_string();
    let mut tree = ModuleTree {
        name: name.clone(),
        graphs: BTreeMap::new(),
        modules: Vec::new(),
        root: ModuleId::new(0),
        next_graph: 0,
        ids: IdCounter::default(),
        watch_values: HashMap::new(),
        functions: BTreeMap::new(),
    };
    let top = tree.alloc_graph_id();
    tree.graphs.insert(top, InternalGraph::new(top, "top", &name, None));

    let root = {
        let mut tracer = Tracer::new(&mut tree, registry);
        tracer.scopes.push(Scope {
            graph: top,
            builder: None,
            pending: None,
        });
        let b = tracer.builder_for(module, name.clone(), false, true);
        let self_key = tracer.add_input(NodeSpec::named(NodeKind::module(None), "top").with_qualname(&name))?;
        tracer.builder_mut(b)?.record_node(self_key);
        let this = Value::Module(ModuleValue {
            handle: ModuleHandle::Builder(b),
            node: Some(self_key),
        });
        let (leaves, def) = args.into_call_tree(None).flatten();
        let mut inputs = Vec::with_capacity(leaves.len());
        for (i, t) in leaves.into_iter().enumerate() {
            let spec = NodeSpec::named(NodeKind::tensor(t.shape(), t.dtype()), format!("arg_{i}"));
            let key = tracer.add_input(spec)?;
            inputs.push(Value::tensor(t).with_node(key));
        }
        let (_, call_args) = CallArgs::from_call_tree(def.unflatten(inputs)?, false)?;

        let mut cx = Context::tracing(runtime, tracer);
        cx.call_module(&this, call_args)?;
        let mut tracer = cx.into_tracer().ok_or(TraceError::NotTracing)?;
        tracer.resolve(b)?
    };

    tree.graphs.remove(&top);
    tree.root = root;
    for g in tree.root_graphs() {
        if let Some(graph) = tree.graphs.get_mut(&g) {
            graph.top_graph = None;
        }
    }
    tree.reset_ids();
    tree.update_ref();
    log::info!(
        "traced {name}: {} modules, {} graphs",
        tree.modules.len(),
        tree.graphs.len()
    );
    Ok(tree)
}

impl ModuleTree {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root(&self) -> ModuleId {
        self.root
    }

    pub(crate) fn alloc_graph_id(&mut self) -> GraphId {
        let id = GraphId::new(self.next_graph);
        self.next_graph += 1;
        id
    }

    pub(crate) fn push_module(&mut self, module: ModuleObject) -> ModuleId {
        self.modules.push(module);
        ModuleId::new(self.modules.len() - 1)
    }

    pub fn module(&self, id: ModuleId) -> Result<&ModuleObject, TraceError> {
        self.modules.get(id.index()).ok_or(TraceError::UnknownModule(id))
    }

    pub(crate) fn module_mut(&mut self, id: ModuleId) -> Result<&mut ModuleObject, TraceError> {
        self.modules.get_mut(id.index()).ok_or(TraceError::UnknownModule(id))
    }

    pub fn traced(&self, id: ModuleId) -> Result<&TracedModule, TraceError> {
        self.module(id)?
            .as_traced()
            .ok_or_else(|| TraceError::UntrackedModule(self.module_label(id)))
    }

    fn traced_mut(&mut self, id: ModuleId) -> Result<&mut TracedModule, TraceError> {
        let label = self.module_label(id);
        match self.module_mut(id)? {
            ModuleObject::Traced(t) => Ok(t),
            ModuleObject::Opaque(_) => Err(TraceError::UntrackedModule(label)),
        }
    }

    fn module_label(&self, id: ModuleId) -> String {
        self.qualname_of(id)
            .unwrap_or_else(|| format!("module {}", id.index()))
    }

    pub fn graph(&self, id: GraphId) -> Result<&InternalGraph, TraceError> {
        self.graphs.get(&id).ok_or(TraceError::UnknownGraph(id))
    }

    pub fn graph_mut(&mut self, id: GraphId) -> Result<&mut InternalGraph, TraceError> {
        self.graphs.get_mut(&id).ok_or(TraceError::UnknownGraph(id))
    }

    pub fn graphs(&self) -> impl Iterator<Item = &InternalGraph> {
        self.graphs.values()
    }

    pub fn modules(&self) -> impl Iterator<Item = (ModuleId, &ModuleObject)> {
        self.modules
            .iter()
            .enumerate()
            .map(|(i, m)| (ModuleId::new(i), m))
    }

    /// Graphs of the root module, one per traced call shape.
    pub fn root_graphs(&self) -> Vec<GraphId> {
        self.module(self.root)
            .ok()
            .and_then(ModuleObject::as_traced)
            .map(|t| t.graphs().collect())
            .unwrap_or_default()
    }

    /// The root's graph, when it was traced for exactly one call shape.
    pub fn root_graph(&self) -> Result<GraphId, TraceError> {
        match self.root_graphs().as_slice() {
            [one] => Ok(*one),
            other => Err(TraceError::AmbiguousGraph(other.len())),
        }
    }

    /// The traced module owning `graph`.
    pub fn graph_owner(&self, graph: GraphId) -> Option<ModuleId> {
        self.modules().find_map(|(id, m)| {
            m.as_traced()
                .filter(|t| t.graphs().any(|g| g == graph))
                .map(|_| id)
        })
    }

    /// Attribute `name` of `module`; `name` may be a dotted path.
    pub fn attribute(&self, module: ModuleId, name: &str) -> Result<Attribute, TraceError> {
        let mut current = Attribute::Module(module);
        for segment in name.split('.') {
            let Attribute::Module(id) = current else {
                return Err(TraceError::NotAModule(segment.to_string()));
            };
            current = match self.module(id)? {
                ModuleObject::Traced(t) => t.attributes.get(segment).cloned(),
                // sub-modules of an opaque module are not part of the tree
                ModuleObject::Opaque(m) => match m.attr(segment) {
                    Some(Attr::Tensor(t)) => Some(Attribute::Tensor(t)),
                    Some(Attr::Module(_)) | None => None,
                },
            }
            .ok_or_else(|| TraceError::UnknownAttribute {
                module: self.module_label(id),
                name: segment.to_string(),
            })?;
        }
        Ok(current)
    }

    /// The attribute a qualified name denotes, walking from the root.
    pub fn resolve_qualname(&self, qualname: &str) -> Result<Attribute, TraceError> {
        if qualname == self.name {
            return Ok(Attribute::Module(self.root));
        }
        let path = qualname
            .strip_prefix(&self.name)
            .and_then(|rest| rest.strip_prefix('.'))
            .ok_or_else(|| TraceError::UnknownAttribute {
                module: self.name.clone(),
                name: qualname.to_string(),
            })?;
        self.attribute(self.root, path)
    }

    /// Attribute path from the root to `module`, found breadth first.
    pub fn qualname_of(&self, module: ModuleId) -> Option<String> {
        let mut queue = std::collections::VecDeque::from([(self.root, self.name.clone())]);
        let mut seen = HashSet::new();
        while let Some((id, path)) = queue.pop_front() {
            if id == module {
                return Some(path);
            }
            if !seen.insert(id) {
                continue;
            }
            if let Some(ModuleObject::Traced(t)) = self.modules.get(id.index()) {
                for (name, attr) in &t.attributes {
                    if let Attribute::Module(child) = attr {
                        queue.push_back((*child, format!("{path}.{name}")));
                    }
                }
            }
        }
        None
    }

    /// The next free node and expr ids.
    pub fn ids(&self) -> IdCounter {
        self.ids
    }

    /// Renumbers node and expr ids depth first in execution order, starting from the root graphs.
    pub fn reset_ids(&mut self) {
        let mut ids = IdCounter::default();
        let mut visited = HashSet::new();
        for g in self.root_graphs() {
            self.reset_graph_ids(g, &mut ids, &mut visited);
        }
        let rest: Vec<GraphId> = self.graphs.keys().copied().collect();
        for g in rest {
            self.reset_graph_ids(g, &mut ids, &mut visited);
        }
        self.ids = ids;
    }

    fn reset_graph_ids(&mut self, graph: GraphId, ids: &mut IdCounter, visited: &mut HashSet<GraphId>) {
        if !visited.insert(graph) {
            return;
        }
        let Some(g) = self.graphs.get(&graph) else {
            return;
        };
        let exprs: Vec<ExprId> = g.exprs().map(|(id, _)| id).collect();
        for e in exprs {
            let nested = {
                let Some(g) = self.graphs.get_mut(&graph) else {
                    return;
                };
                let expr = &mut g.exprs[e.index()];
                expr.id = ids.next_expr();
                let outputs = expr.outputs.clone();
                let nested = expr.graph;
                for o in outputs {
                    g.nodes[o.index()].id = ids.next_node();
                }
                nested
            };
            if let Some(sub) = nested {
                self.reset_graph_ids(sub, ids, visited);
            }
        }
    }

    /// Rebinds module nodes to the modules they denote and links nested graphs to their callers.
    pub fn update_ref(&mut self) {
        let owned: Vec<(GraphId, ModuleId)> = self
            .modules()
            .filter_map(|(id, m)| m.as_traced().map(|t| (id, t)))
            .flat_map(|(id, t)| t.graphs().map(move |g| (g, id)))
            .collect();
        let roots: HashSet<GraphId> = self.root_graphs().into_iter().collect();
        for (graph, module) in owned {
            self.update_graph_ref(graph, module, &roots);
        }
    }

    fn update_graph_ref(&mut self, graph: GraphId, module: ModuleId, roots: &HashSet<GraphId>) {
        let Some(g) = self.graphs.get(&graph) else {
            return;
        };
        let mut owners: HashMap<NodeId, ModuleId> = HashMap::new();
        if let Ok(s) = g.self_node() {
            owners.insert(s, module);
        }
        let mut callees = Vec::new();
        for (_, expr) in g.exprs() {
            match expr.kind() {
                ExprKind::GetAttr { name } => {
                    let owner = expr.inputs().first().and_then(|n| owners.get(n)).copied();
                    if let Some(Ok(Attribute::Module(child))) = owner.map(|o| self.attribute(o, name)) {
                        owners.insert(expr.outputs()[0], child);
                    }
                }
                kind if kind.is_module_call() => callees.extend(expr.graph()),
                _ => {}
            }
        }
        let types: HashMap<NodeId, String> = owners
            .iter()
            .filter_map(|(n, m)| self.module(*m).ok().map(|o| (*n, o.type_name().to_string())))
            .collect();
        if let Some(g) = self.graphs.get_mut(&graph) {
            for (node, owner) in owners {
                if let NodeKind::Module(info) = &mut g.nodes[node.index()].kind {
                    info.owner = Some(owner);
                    info.module_type = types.get(&node).cloned();
                }
            }
        }
        for callee in callees {
            if roots.contains(&callee) {
                continue;
            }
            if let Some(sub) = self.graphs.get_mut(&callee) {
                sub.top_graph = Some(graph);
            }
        }
    }

    /// Runs the root module on `args`.
    ///
    /// With end points set, returns the end-point values as a sequence instead of the outputs.
    /// Values at watch points are stored and readable through [`ModuleTree::watch_node_value`].
    pub fn forward(
        &mut self,
        runtime: &dyn PrimitiveRuntime,
        args: CallArgs<NumericTensor>,
    ) -> Result<Tree<NumericTensor>, TraceError> {
        args.check_unique_kwargs()?;
        let this = Value::Module(ModuleValue {
            handle: ModuleHandle::Resolved(self.root),
            node: None,
        });
        let (leaves, arg_def) = args.map(&mut Value::tensor).into_call_tree(Some(this)).flatten();
        let entry = self
            .traced(self.root)?
            .entry(&arg_def)
            .cloned()
            .ok_or_else(|| TraceError::NoGraphForArgDef {
                module: self.name.clone(),
                arg_def: arg_def.clone(),
            })?;
        let (result, watched) = {
            let mut cx = Context::with_tree(runtime, &*self);
            let result = self.graph(entry.graph)?.interpret(&mut cx, leaves)?;
            (result, cx.take_watched())
        };
        for g in self.graphs.values() {
            for n in g.watch_points() {
                if !watched.contains_key(&g.key(*n)) {
                    log::warn!("watch point {} in {} was not reached", g.nodes[n.index()].name, g.name);
                }
            }
        }
        self.watch_values.extend(watched);
        let tree = match result {
            Interpreted::EndPoints(values) => Tree::Seq(values.into_iter().map(Tree::Leaf).collect()),
            Interpreted::Outputs(values) => entry.out_def.unflatten(values)?,
        };
        tree.try_map(&mut |v| v.into_tensor())
    }

    /// Runs the root graph on positional tensors, the module input being supplied implicitly.
    pub fn eval(&mut self, runtime: &dyn PrimitiveRuntime, inputs: Vec<NumericTensor>) -> Result<Vec<NumericTensor>, TraceError> {
        self.forward(runtime, CallArgs::from_leaves(inputs))
            .map(|tree| tree.flatten().0)
    }

    /// Interprets one graph on explicit values, its module input included.
    pub fn interpret_graph(
        &self,
        runtime: &dyn PrimitiveRuntime,
        graph: GraphId,
        inputs: Vec<Value>,
    ) -> Result<Interpreted, TraceError> {
        let mut cx = Context::with_tree(runtime, self);
        self.graph(graph)?.interpret(&mut cx, inputs)
    }

    /// A value standing for `module` when interpreting a graph by hand.
    pub fn module_value(&self, module: ModuleId) -> Value {
        Value::Module(ModuleValue {
            handle: ModuleHandle::Resolved(module),
            node: None,
        })
    }

    pub fn set_watch_points(&mut self, nodes: &[NodeKey]) -> Result<(), TraceError> {
        for key in nodes {
            self.graph(key.graph)?.node(key.node)?;
        }
        for key in nodes {
            let g = self.graph_mut(key.graph)?;
            if !g.watch_points.contains(&key.node) {
                g.watch_points.push(key.node);
            }
        }
        Ok(())
    }

    pub fn clear_watch_points(&mut self) {
        for g in self.graphs.values_mut() {
            g.watch_points.clear();
        }
        self.watch_values.clear();
    }

    /// Stops interpretation of the root graph once every node in `nodes` has a value.
    pub fn set_end_points(&mut self, nodes: &[NodeKey]) -> Result<(), TraceError> {
        let roots = self.root_graphs();
        for key in nodes {
            let g = self.graph(key.graph)?;
            let node = g.node(key.node)?;
            if !roots.contains(&key.graph) {
                return Err(TraceError::NodeOutsideModule(node.qualname.clone()));
            }
        }
        for key in nodes {
            let g = self.graph_mut(key.graph)?;
            if !g.end_points.contains(&key.node) {
                g.end_points.push(key.node);
            }
        }
        Ok(())
    }

    pub fn clear_end_points(&mut self) {
        for g in self.graphs.values_mut() {
            g.end_points.clear();
        }
    }

    /// The value a watch point held during the last forward.
    pub fn watch_node_value(&self, key: NodeKey) -> Option<&Value> {
        self.watch_values.get(&key)
    }

    /// Declares a new tensor input on the root graph and extends its argument shape.
    pub fn add_input_node(&mut self, shape: Vec<usize>, dtype: DType, name: Option<&str>) -> Result<NodeKey, TraceError> {
        let graph = self.root_graph()?;
        let spec = match name {
            Some(n) => NodeSpec::named(NodeKind::tensor(shape, dtype), n),
            None => NodeSpec::new(NodeKind::tensor(shape, dtype)),
        };
        let tree = &mut *self;
        let g = tree.graphs.get_mut(&graph).ok_or(TraceError::UnknownGraph(graph))?;
        let node = g.add_input(spec, &mut tree.ids)?;
        let key = g.key(node);
        let root = self.root;
        for entry in self.traced_mut(root)?.entries.iter_mut() {
            if entry.graph == graph {
                entry.arg_def = extend_positional(&entry.arg_def)?;
            }
        }
        Ok(key)
    }

    /// Redeclares the root graph inputs to match a call with `args`, returning the new input nodes
    /// in flattening order. The root module is afterwards called with `args`' shape.
    pub fn reset_inputs(&mut self, args: CallArgs<NumericTensor>) -> Result<Vec<NodeKey>, TraceError> {
        args.check_unique_kwargs()?;
        let graph = self.root_graph()?;
        let this = self.module_value(self.root);
        let (leaves, arg_def) = args.map(&mut Value::tensor).into_call_tree(Some(this)).flatten();
        let kinds = leaves
            .into_iter()
            .skip(1)
            .map(|v| v.into_tensor().map(|t| NodeKind::tensor(t.shape(), t.dtype())))
            .collect::<Result<Vec<_>, _>>()?;
        let tree = &mut *self;
        let g = tree.graphs.get_mut(&graph).ok_or(TraceError::UnknownGraph(graph))?;
        let nodes = g.reset_inputs(kinds, &mut tree.ids)?;
        let keys = nodes.into_iter().map(|n| g.key(n)).collect();
        let root = self.root;
        for entry in self.traced_mut(root)?.entries.iter_mut() {
            if entry.graph == graph {
                entry.arg_def = arg_def.clone();
            }
        }
        log::debug!("reset inputs of {} to {arg_def}", self.name);
        Ok(keys)
    }

    /// Replaces the root graph outputs with `outputs`, whose shape becomes the new output shape.
    pub fn reset_outputs(&mut self, outputs: Tree<NodeId>) -> Result<(), TraceError> {
        let graph = self.root_graph()?;
        let (nodes, out_def) = outputs.flatten();
        self.graph_mut(graph)?.set_outputs(nodes)?;
        let root = self.root;
        for entry in self.traced_mut(root)?.entries.iter_mut() {
            if entry.graph == graph {
                entry.out_def = out_def.clone();
            }
        }
        Ok(())
    }

    /// Appends `node` to the root graph outputs.
    pub fn add_output_node(&mut self, node: NodeId) -> Result<(), TraceError> {
        let graph = self.root_graph()?;
        self.graph_mut(graph)?.add_output(node)?;
        let root = self.root;
        for entry in self.traced_mut(root)?.entries.iter_mut() {
            if entry.graph == graph {
                entry.out_def = match &entry.out_def {
                    TreeDef::Seq(items) => {
                        let mut items = items.clone();
                        items.push(TreeDef::Leaf);
                        TreeDef::Seq(items)
                    }
                    other => TreeDef::Seq(vec![other.clone(), TreeDef::Leaf]),
                };
            }
        }
        Ok(())
    }

    /// Expressions of the root graph, and with `recursive` of every graph it calls into.
    pub fn exprs(&self, recursive: bool) -> Result<ExprFilter<'_>, TraceError> {
        Ok(ExprFilter::new(&self.graphs, self.root_graph()?, recursive)?)
    }

    pub fn nodes(&self, recursive: bool) -> Result<NodeFilter<'_>, TraceError> {
        Ok(NodeFilter::new(&self.graphs, self.root_graph()?, recursive)?)
    }

    pub fn get_function_by_type(&self, func: Option<Function>) -> Result<ExprFilter<'_>, TraceError> {
        Ok(self.exprs(true)?.call_function(func))
    }

    pub fn get_wrapped_function(&self, name: &str) -> Result<ExprFilter<'_>, TraceError> {
        Ok(self.exprs(true)?.call_wrapped(name))
    }

    pub fn get_method_by_type(&self, method: Option<TensorMethod>) -> Result<ExprFilter<'_>, TraceError> {
        Ok(self.exprs(true)?.call_method(method))
    }

    pub fn get_expr_by_id(&self, ids: &[usize]) -> Result<ExprFilter<'_>, TraceError> {
        Ok(self.exprs(true)?.expr_id(ids))
    }

    pub fn get_module_by_type(&self, type_name: &str) -> Result<NodeFilter<'_>, TraceError> {
        Ok(self.nodes(true)?.module_type(type_name))
    }

    pub fn get_node_by_id(&self, ids: &[usize]) -> Result<NodeFilter<'_>, TraceError> {
        Ok(self.nodes(true)?.node_id(ids))
    }

    pub fn get_node_by_name(&self, pattern: &str, ignore_case: bool) -> Result<NodeFilter<'_>, TraceError> {
        Ok(self.nodes(true)?.name(pattern, ignore_case))
    }

    /// A copy of this tree whose root graphs have every traced sub-module call inlined.
    pub fn flatten(&self) -> Result<ModuleTree, TraceError> {
        let mut flat_tree = self.clone();
        let mut ids = IdCounter::default();
        for graph in self.root_graphs() {
            let source = self.graph(graph)?;
            let mut flat = InternalGraph::new(graph, &source.name, &source.qualname, None);
            let mut inputs = Vec::with_capacity(source.inputs.len());
            for input in &source.inputs {
                let node = source.node(*input)?;
                let spec = NodeSpec {
                    kind: node.kind.clone(),
                    name: Some(node.name.clone()),
                    qualname: Some(node.qualname.clone()),
                };
                inputs.push(flat.add_input(spec, &mut ids)?);
            }
            let mut stack = Vec::new();
            let map = self.inline_graph(&mut flat, &mut ids, graph, &inputs, None, &mut stack)?;
            let lookup = |n: &NodeId| {
                map.get(n)
                    .copied()
                    .ok_or_else(|| TraceError::NodeOutsideModule(format!("{}", n.index())))
            };
            let outputs = source.outputs.iter().map(lookup).collect::<Result<Vec<_>, _>>()?;
            flat.set_outputs(outputs)?;
            flat.watch_points = source.watch_points.iter().filter_map(|n| map.get(n).copied()).collect();
            flat.end_points = source.end_points.iter().filter_map(|n| map.get(n).copied()).collect();
            flat.compile()?;
            flat.re_associate_name();
            log::info!("flattened {}: {} exprs", flat.name, flat.order.len());
            flat_tree.graphs.insert(graph, flat);
        }
        flat_tree.watch_values.clear();
        flat_tree.reset_ids();
        flat_tree.update_ref();
        Ok(flat_tree)
    }

    /// Copies the live exprs of `source` into `flat`, inlining traced module calls. Returns the
    /// mapping from `source` nodes to `flat` nodes.
    fn inline_graph(
        &self,
        flat: &mut InternalGraph,
        ids: &mut IdCounter,
        source: GraphId,
        inputs: &[NodeId],
        prefix: Option<&str>,
        stack: &mut Vec<GraphId>,
    ) -> Result<HashMap<NodeId, NodeId>, TraceError> {
        let g = self.graph(source)?;
        if stack.contains(&source) {
            return Err(TraceError::RecursiveFlatten(g.name.clone()));
        }
        stack.push(source);
        let mut map: HashMap<NodeId, NodeId> = g.inputs.iter().copied().zip(inputs.iter().copied()).collect();
        for expr_id in &g.order {
            let expr = g.expr(*expr_id)?;
            let args = expr
                .inputs
                .iter()
                .map(|n| {
                    map.get(n)
                        .copied()
                        .ok_or_else(|| TraceError::NodeOutsideModule(g.nodes[n.index()].qualname.clone()))
                })
                .collect::<Result<Vec<_>, _>>()?;
            match expr.graph {
                Some(callee) if expr.kind.is_module_call() => {
                    let site = &g.nodes[expr.inputs[0].index()].name;
                    let inner_prefix = match prefix {
                        Some(p) => format!("{p}_{site}"),
                        None => site.clone(),
                    };
                    let inner = self.inline_graph(flat, ids, callee, &args, Some(&inner_prefix), stack)?;
                    let callee_graph = self.graph(callee)?;
                    for (out, callee_out) in expr.outputs.iter().zip(&callee_graph.outputs) {
                        let mapped = inner
                            .get(callee_out)
                            .copied()
                            .ok_or_else(|| TraceError::NodeOutsideModule(callee_graph.nodes[callee_out.index()].qualname.clone()))?;
                        map.insert(*out, mapped);
                    }
                }
                _ => {
                    let specs = expr
                        .outputs
                        .iter()
                        .map(|o| {
                            let node = &g.nodes[o.index()];
                            NodeSpec {
                                kind: node.kind.clone(),
                                name: Some(match prefix {
                                    Some(p) => format!("{p}_{}", node.name),
                                    None => node.name.clone(),
                                }),
                                qualname: Some(node.qualname.clone()),
                            }
                        })
                        .collect();
                    let new = flat.push_expr(expr.kind.clone(), args, specs, ids, None)?;
                    let copied = flat.expr_mut(new)?;
                    copied.disable_remove = expr.disable_remove;
                    copied.graph = expr.graph;
                    let outputs = copied.outputs.clone();
                    map.extend(expr.outputs.iter().copied().zip(outputs));
                }
            }
        }
        stack.pop();
        Ok(map)
    }
}

/// Appends one dynamic positional slot to a call tree `((self, *args), kwargs)`.
fn extend_positional(arg_def: &TreeDef) -> Result<TreeDef, TraceError> {
    let (positional, kwargs) = arg_def
        .split_call()
        .ok_or_else(|| crate::tree::TreeError::NotACallTree(arg_def.clone()))?;
    let mut positional = positional.to_vec();
    positional.push(TreeDef::Leaf);
    Ok(TreeDef::Seq(vec![TreeDef::Seq(positional), TreeDef::Map(kwargs.to_vec())]))
}

impl Display for ModuleTree {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for (i, g) in self.root_graphs().into_iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            match self.graphs.get(&g) {
                Some(graph) => write!(f, "{graph}")?,
                None => write!(f, "<missing graph {}>", g.index())?,
            }
        }
        Ok(())
    }
}

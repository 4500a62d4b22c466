//! Dual-mode evaluation of modules.
//!
//! A [`Context`] either evaluates eagerly or traces. Every operation a module performs goes through
//! it: eagerly the operation just runs, while tracing it also runs on the concrete data and is
//! recorded as an expression in the innermost open scope. A [`Value`] carries its concrete data
//! plus, while tracing, the node it is bound to.

use crate::backends::{PrimitiveRuntime, RuntimeError};
use crate::module::{Attr, ModuleRef, ModuleRegistry, SignatureError, UserFunctionRef};
use crate::numeric_tensor::NumericTensor;
use crate::ops::{Function, OpError, PrimitiveOp, TensorMethod};
use crate::traced_graph::expr::{ExprKind, FunctionKind, MethodKind};
use crate::traced_graph::filter::FilterError;
use crate::traced_graph::namespace::{NameOwner, NameSpaceError};
use crate::traced_graph::node::NodeKind;
use crate::traced_graph::{ExprId, GraphId, InternalGraph, ModuleId, NodeId, NodeKey, NodeSpec, TracedGraphError};
use crate::traced_module::{Attribute, ModuleObject, ModuleTree};
use crate::tree::{CallArgs, Tree, TreeDef, TreeError};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::rc::Rc;

pub mod builder;
pub mod insert;

use builder::{AnyShadowModule, BuilderAttr, BuilderId, OpaqueModule, ShadowModule, TracedBuilder};

#[derive(Debug, thiserror::Error)]
pub enum TraceError {
    #[error(transparent)]
    TracedGraphError(#[from] TracedGraphError),
    #[error(transparent)]
    TreeError(#[from] TreeError),
    #[error(transparent)]
    OpError(#[from] OpError),
    #[error(transparent)]
    RuntimeError(#[from] RuntimeError),
    #[error(transparent)]
    SignatureError(#[from] SignatureError),
    #[error(transparent)]
    NameSpaceError(#[from] NameSpaceError),
    #[error(transparent)]
    FilterError(#[from] FilterError),
    #[error("Root module {0} is registered as builtin and cannot be traced")]
    RootIsBuiltin(String),
    #[error("Module {0} is not reachable from the traced root")]
    UntrackedModule(String),
    #[error("Module {module} has no attribute `{name}`")]
    UnknownAttribute { module: String, name: String },
    #[error("Cannot read attribute `{0}` of a tensor")]
    NotAModule(String),
    #[error("Expected a tensor, got module {0}")]
    ExpectedTensor(String),
    #[error("{module} returned a module at output {index}; only tensors can be graph outputs")]
    UnsupportedOutput { module: String, index: usize },
    #[error("{module} was never traced for arguments of shape {arg_def}")]
    NoGraphForArgDef { module: String, arg_def: TreeDef },
    #[error("Module {0:?} does not exist")]
    UnknownModule(ModuleId),
    #[error("Graph {0:?} does not exist")]
    UnknownGraph(GraphId),
    #[error("Builder {0:?} does not exist")]
    UnknownBuilder(BuilderId),
    #[error("Scope {0} is already open")]
    ReentrantScope(String),
    #[error("Scope stack does not match: expected {expected:?}, found {found:?}")]
    ScopeMismatch {
        expected: Option<GraphId>,
        found: Option<GraphId>,
    },
    #[error("No scope is open")]
    NoScope,
    #[error("Operation requires an active trace")]
    NotTracing,
    #[error("Traced module value {0} used outside its trace")]
    BuilderOutsideTrace(String),
    #[error("Module {0} contains itself")]
    CyclicModule(String),
    #[error("Graph {0} is already being inlined")]
    RecursiveFlatten(String),
    #[error("Node {0} does not belong to the graphs of the root module")]
    NodeOutsideModule(String),
    #[error("Graph {0:?} is not owned by a traced module")]
    GraphWithoutOwner(GraphId),
    #[error("Nodes can only be added to a module with a single graph, found {0}")]
    AmbiguousGraph(usize),
    #[error("Function `{0}` is not known to this tree")]
    UnknownFunction(String),
}

/// A traced or concrete tensor.
#[derive(Debug, Clone)]
pub struct TensorValue {
    pub tensor: NumericTensor,
    pub node: Option<NodeKey>,
}

#[derive(Debug, Clone)]
pub enum ModuleHandle {
    /// A plain module object.
    Object(ModuleRef),
    /// A module shadowed by a builder of the active trace.
    Builder(BuilderId),
    /// A module of a [`ModuleTree`].
    Resolved(ModuleId),
}

#[derive(Debug, Clone)]
pub struct ModuleValue {
    pub handle: ModuleHandle,
    pub node: Option<NodeKey>,
}

#[derive(Debug, Clone)]
pub enum Value {
    Tensor(TensorValue),
    Module(ModuleValue),
}

impl Value {
    pub fn tensor(tensor: NumericTensor) -> Self {
        Value::Tensor(TensorValue { tensor, node: None })
    }

    pub fn module(module: ModuleRef) -> Self {
        Value::Module(ModuleValue {
            handle: ModuleHandle::Object(module),
            node: None,
        })
    }

    pub fn node(&self) -> Option<NodeKey> {
        match self {
            Value::Tensor(t) => t.node,
            Value::Module(m) => m.node,
        }
    }

    pub fn is_traced(&self) -> bool {
        match self {
            Value::Tensor(t) => t.node.is_some(),
            Value::Module(m) => m.node.is_some() || matches!(m.handle, ModuleHandle::Builder(_)),
        }
    }

    pub fn is_tensor(&self) -> bool {
        matches!(self, Value::Tensor(_))
    }

    pub fn is_module(&self) -> bool {
        matches!(self, Value::Module(_))
    }

    pub fn as_tensor(&self) -> Option<&NumericTensor> {
        match self {
            Value::Tensor(t) => Some(&t.tensor),
            Value::Module(_) => None,
        }
    }

    pub fn into_tensor(self) -> Result<NumericTensor, TraceError> {
        match self {
            Value::Tensor(t) => Ok(t.tensor),
            Value::Module(m) => Err(TraceError::ExpectedTensor(m.handle.describe())),
        }
    }

    pub(crate) fn with_node(self, node: NodeKey) -> Self {
        match self {
            Value::Tensor(t) => Value::Tensor(TensorValue {
                tensor: t.tensor,
                node: Some(node),
            }),
            Value::Module(m) => Value::Module(ModuleValue {
                handle: m.handle,
                node: Some(node),
            }),
        }
    }

    pub(crate) fn without_node(self) -> Self {
        match self {
            Value::Tensor(t) => Value::tensor(t.tensor),
            Value::Module(m) => Value::Module(ModuleValue {
                handle: m.handle,
                node: None,
            }),
        }
    }
}

impl From<NumericTensor> for Value {
    fn from(tensor: NumericTensor) -> Self {
        Value::tensor(tensor)
    }
}

impl ModuleHandle {
    fn describe(&self) -> String {
        match self {
            ModuleHandle::Object(m) => m.type_name().to_string(),
            ModuleHandle::Builder(b) => format!("builder {}", b.index()),
            ModuleHandle::Resolved(m) => format!("module {}", m.index()),
        }
    }
}

pub(crate) struct Scope {
    pub(crate) graph: GraphId,
    pub(crate) builder: Option<BuilderId>,
    /// Exprs recorded into an already traced graph, held back until committed.
    pub(crate) pending: Option<Vec<ExprId>>,
}

/// State of one active trace over a [`ModuleTree`].
pub struct Tracer<'a> {
    pub(crate) tree: &'a mut ModuleTree,
    registry: &'a ModuleRegistry,
    pub(crate) scopes: Vec<Scope>,
    builders: Vec<AnyShadowModule>,
    memo: HashMap<usize, BuilderId>,
    getattr_memo: HashMap<(NodeKey, String), NodeKey>,
    resolved: HashMap<BuilderId, ModuleId>,
    pub(crate) created_graphs: Vec<GraphId>,
    pub(crate) pending_attrs: BTreeMap<String, BuilderId>,
}

fn module_key(module: &ModuleRef) -> usize {
    Rc::as_ptr(module) as *const () as usize
}

impl<'a> Tracer<'a> {
    pub(crate) fn new(tree: &'a mut ModuleTree, registry: &'a ModuleRegistry) -> Self {
        Self {
            tree,
            registry,
            scopes: Vec::new(),
            builders: Vec::new(),
            memo: HashMap::new(),
            getattr_memo: HashMap::new(),
            resolved: HashMap::new(),
            created_graphs: Vec::new(),
            pending_attrs: BTreeMap::new(),
        }
    }

    pub(crate) fn current_graph(&self) -> Result<GraphId, TraceError> {
        self.scopes.last().map(|s| s.graph).ok_or(TraceError::NoScope)
    }

    fn graph_mut(&mut self, id: GraphId) -> Result<&mut InternalGraph, TraceError> {
        self.tree.graphs.get_mut(&id).ok_or(TraceError::UnknownGraph(id))
    }

    pub(crate) fn builder(&self, id: BuilderId) -> Result<&AnyShadowModule, TraceError> {
        self.builders.get(id.index()).ok_or(TraceError::UnknownBuilder(id))
    }

    pub(crate) fn builder_mut(&mut self, id: BuilderId) -> Result<&mut AnyShadowModule, TraceError> {
        self.builders.get_mut(id.index()).ok_or(TraceError::UnknownBuilder(id))
    }

    /// The builder shadowing `module`, created on first use.
    pub(crate) fn builder_for(&mut self, module: ModuleRef, qualname: String, inside_leaf: bool, is_top: bool) -> BuilderId {
        if let Some(b) = self.memo.get(&module_key(&module)) {
            return *b;
        }
        let id = BuilderId::new(self.builders.len());
        self.memo.insert(module_key(&module), id);
        let builder = if inside_leaf || self.registry.is_builtin(module.type_name()) {
            AnyShadowModule::Opaque(OpaqueModule::new(module, qualname))
        } else {
            AnyShadowModule::Traced(TracedBuilder::new(module, qualname, is_top))
        };
        log::debug!("wrapping {} as {}", builder.qualname(), if builder.is_leaf() { "opaque" } else { "traced" });
        self.builders.push(builder);
        id
    }

    /// Appends an expression to the innermost scope.
    pub(crate) fn record(
        &mut self,
        kind: ExprKind,
        inputs: Vec<NodeId>,
        outputs: Vec<NodeSpec>,
    ) -> Result<(ExprId, Vec<NodeKey>), TraceError> {
        let scope = self.scopes.last_mut().ok_or(TraceError::NoScope)?;
        let tree = &mut *self.tree;
        let graph = tree
            .graphs
            .get_mut(&scope.graph)
            .ok_or(TraceError::UnknownGraph(scope.graph))?;
        let expr = graph.push_expr(kind, inputs, outputs, &mut tree.ids, scope.pending.as_mut())?;
        let outs = graph.expr(expr)?.outputs().iter().map(|n| graph.key(*n)).collect();
        Ok((expr, outs))
    }

    pub(crate) fn add_input(&mut self, spec: NodeSpec) -> Result<NodeKey, TraceError> {
        let id = self.current_graph()?;
        let tree = &mut *self.tree;
        let graph = tree.graphs.get_mut(&id).ok_or(TraceError::UnknownGraph(id))?;
        let node = graph.add_input(spec, &mut tree.ids)?;
        Ok(graph.key(node))
    }

    /// Node kind matching a value.
    pub(crate) fn kind_of(&self, value: &Value) -> NodeKind {
        match value {
            Value::Tensor(t) => NodeKind::tensor(t.tensor.shape(), t.tensor.dtype()),
            Value::Module(m) => NodeKind::module(match &m.handle {
                ModuleHandle::Object(o) => Some(o.type_name().to_string()),
                ModuleHandle::Builder(_) => None,
                ModuleHandle::Resolved(id) => self.tree.module(*id).ok().map(|o| o.type_name().to_string()),
            }),
        }
    }

    /// The node standing for `value` in the current scope. Tensors that are untracked, or tracked
    /// in another graph, are captured as constants.
    pub(crate) fn capture(&mut self, value: &Value) -> Result<NodeId, TraceError> {
        let graph = self.current_graph()?;
        match value.node() {
            Some(key) if key.graph == graph => Ok(key.node),
            _ => match value {
                Value::Tensor(t) => {
                    let spec = NodeSpec::new(self.kind_of(value));
                    let (_, outs) = self.record(
                        ExprKind::Constant {
                            value: t.tensor.clone(),
                        },
                        vec![],
                        vec![spec],
                    )?;
                    Ok(outs[0].node)
                }
                Value::Module(m) => Err(TraceError::UntrackedModule(match &m.handle {
                    ModuleHandle::Builder(b) => self.builder(*b)?.qualname().to_string(),
                    other => other.describe(),
                })),
            },
        }
    }

    /// Strips trace bindings so the value can be evaluated eagerly.
    pub(crate) fn detach(&self, value: &Value) -> Value {
        match value {
            Value::Module(ModuleValue {
                handle: ModuleHandle::Builder(b),
                ..
            }) => match self.builder(*b) {
                Ok(builder) => Value::module(builder.module().clone()),
                Err(_) => value.clone().without_node(),
            },
            other => other.clone().without_node(),
        }
    }

    fn note_module_node(&mut self, value: &Value, key: NodeKey) -> Result<(), TraceError> {
        if let Value::Module(ModuleValue {
            handle: ModuleHandle::Builder(b),
            ..
        }) = value
        {
            self.builder_mut(*b)?.record_node(key);
        }
        Ok(())
    }

    /// Opens a fresh graph for a traced call of builder `b`.
    fn open_scope(&mut self, b: BuilderId, qualname: &str) -> Result<GraphId, TraceError> {
        if self.scopes.iter().any(|s| s.builder == Some(b)) {
            return Err(TraceError::ReentrantScope(qualname.to_string()));
        }
        let parent = self.current_graph()?;
        let id = self.tree.alloc_graph_id();
        let name = self
            .graph_mut(parent)?
            .namespace
            .create_unique_name(qualname, Some(NameOwner::Graph(id)));
        self.tree
            .graphs
            .insert(id, InternalGraph::new(id, &name, qualname, Some(parent)));
        self.scopes.push(Scope {
            graph: id,
            builder: Some(b),
            pending: None,
        });
        self.created_graphs.push(id);
        log::debug!("push scope {name} ({qualname})");
        Ok(id)
    }

    fn close_scope(&mut self, graph: GraphId) -> Result<(), TraceError> {
        let found = self.scopes.last().map(|s| s.graph);
        if found != Some(graph) {
            return Err(TraceError::ScopeMismatch {
                expected: Some(graph),
                found,
            });
        }
        self.scopes.pop();
        log::debug!("pop scope {}", self.tree.graph(graph).map(|g| g.name()).unwrap_or("?"));
        Ok(())
    }

    /// Turns builder `b`, and every builder reachable from its attributes, into module objects.
    pub(crate) fn resolve(&mut self, b: BuilderId) -> Result<ModuleId, TraceError> {
        self.resolve_inner(b, &mut HashSet::new())
    }

    fn resolve_inner(&mut self, b: BuilderId, visiting: &mut HashSet<BuilderId>) -> Result<ModuleId, TraceError> {
        if let Some(id) = self.resolved.get(&b) {
            return Ok(*id);
        }
        let builder = self.builder(b)?.clone();
        if !visiting.insert(b) {
            return Err(TraceError::CyclicModule(builder.qualname().to_string()));
        }
        let mut attributes = BTreeMap::new();
        if let Some(traced) = builder
            .as_traced()
            .filter(|t| t.is_top() || !t.entries().is_empty())
        {
            let module = traced.module();
            for name in module.attr_names() {
                let attribute = match traced.attributes().get(&name) {
                    Some(BuilderAttr::Module(child)) => Attribute::Module(self.resolve_inner(*child, visiting)?),
                    Some(BuilderAttr::Tensor(t)) => Attribute::Tensor(t.clone()),
                    None => match module.attr(&name) {
                        Some(Attr::Module(m)) => match self.memo.get(&module_key(&m)).copied() {
                            Some(child) => Attribute::Module(self.resolve_inner(child, visiting)?),
                            None => Attribute::Module(self.tree.push_module(ModuleObject::Opaque(m))),
                        },
                        Some(Attr::Tensor(t)) => Attribute::Tensor(t),
                        None => continue,
                    },
                };
                attributes.insert(name, attribute);
            }
            for entry in traced.entries() {
                self.graph_mut(entry.graph)?.compile()?;
            }
        }
        let object = builder.resolve(attributes);
        let type_name = object.type_name().to_string();
        let id = self.tree.push_module(object);
        for key in builder.nodes() {
            if let Some(graph) = self.tree.graphs.get_mut(&key.graph) {
                if let Ok(node) = graph.node_mut(key.node) {
                    if let NodeKind::Module(info) = &mut node.kind {
                        info.module_type = Some(type_name.clone());
                    }
                }
            }
        }
        visiting.remove(&b);
        self.resolved.insert(b, id);
        log::debug!("resolved {} as module {}", builder.qualname(), id.index());
        Ok(id)
    }
}

enum State<'a> {
    Eager {
        tree: Option<&'a ModuleTree>,
        watched: HashMap<NodeKey, Value>,
    },
    Tracing(Box<Tracer<'a>>),
}

/// Evaluation context handed to [`crate::module::Module::forward`].
pub struct Context<'a> {
    runtime: &'a dyn PrimitiveRuntime,
    state: State<'a>,
}

impl<'a> Context<'a> {
    pub fn eager(runtime: &'a dyn PrimitiveRuntime) -> Self {
        Self {
            runtime,
            state: State::Eager {
                tree: None,
                watched: HashMap::new(),
            },
        }
    }

    /// Eager evaluation that can also run the modules of `tree`.
    pub fn with_tree(runtime: &'a dyn PrimitiveRuntime, tree: &'a ModuleTree) -> Self {
        Self {
            runtime,
            state: State::Eager {
                tree: Some(tree),
                watched: HashMap::new(),
            },
        }
    }

    pub(crate) fn tracing(runtime: &'a dyn PrimitiveRuntime, tracer: Tracer<'a>) -> Self {
        Self {
            runtime,
            state: State::Tracing(Box::new(tracer)),
        }
    }

    pub fn runtime(&self) -> &'a dyn PrimitiveRuntime {
        self.runtime
    }

    pub fn is_tracing(&self) -> bool {
        matches!(self.state, State::Tracing(_))
    }

    pub(crate) fn tracer(&mut self) -> Result<&mut Tracer<'a>, TraceError> {
        match &mut self.state {
            State::Tracing(t) => Ok(t.as_mut()),
            State::Eager { .. } => Err(TraceError::NotTracing),
        }
    }

    pub(crate) fn into_tracer(self) -> Option<Tracer<'a>> {
        match self.state {
            State::Tracing(t) => Some(*t),
            State::Eager { .. } => None,
        }
    }

    fn tree(&self) -> Option<&'a ModuleTree> {
        match &self.state {
            State::Eager { tree, .. } => *tree,
            State::Tracing(_) => None,
        }
    }

    pub(crate) fn record_watch(&mut self, key: NodeKey, value: Value) {
        if let State::Eager { watched, .. } = &mut self.state {
            watched.insert(key, value);
        }
    }

    /// Values captured at watch points since this context was created.
    pub fn take_watched(&mut self) -> HashMap<NodeKey, Value> {
        match &mut self.state {
            State::Eager { watched, .. } => std::mem::take(watched),
            State::Tracing(_) => HashMap::new(),
        }
    }

    fn tracing_operands<'v>(&self, values: impl IntoIterator<Item = &'v Value>) -> bool {
        self.is_tracing() && values.into_iter().any(Value::is_traced)
    }

    /// Applies a primitive to tensors.
    pub fn apply(&mut self, op: PrimitiveOp, inputs: &[Value]) -> Result<Vec<Value>, TraceError> {
        let runtime = self.runtime;
        if !self.tracing_operands(inputs) {
            return eager_apply(runtime, &op, inputs);
        }
        let tracer = self.tracer()?;
        let detached: Vec<Value> = inputs.iter().map(|v| tracer.detach(v)).collect();
        let outputs = eager_apply(runtime, &op, &detached)?;
        let nodes = inputs
            .iter()
            .map(|v| tracer.capture(v))
            .collect::<Result<Vec<_>, _>>()?;
        let specs = outputs.iter().map(|v| NodeSpec::new(tracer.kind_of(v))).collect();
        let (_, keys) = tracer.record(ExprKind::ApplyPrimitive { op }, nodes, specs)?;
        Ok(outputs.into_iter().zip(keys).map(|(v, k)| v.with_node(k)).collect())
    }

    /// Invokes a tensor method on `receiver`.
    pub fn call_method(
        &mut self,
        receiver: &Value,
        method: TensorMethod,
        args: CallArgs<Value>,
    ) -> Result<Tree<Value>, TraceError> {
        let runtime = self.runtime;
        let traced = receiver.is_traced() || args_traced(&args);
        if !(self.is_tracing() && traced) {
            return eager_call_method(runtime, receiver, method, args);
        }
        let tracer = self.tracer()?;
        let detached_args = args.clone().map(&mut |v| tracer.detach(&v));
        let out = eager_call_method(runtime, &tracer.detach(receiver), method, detached_args)?;
        let (leaves, arg_def) = args.into_call_tree(Some(receiver.clone())).flatten();
        let kind = ExprKind::CallMethod {
            method: MethodKind::Tensor(method),
            arg_def,
            out_def: TreeDef::Leaf,
        };
        record_call(tracer, kind, &leaves, out)
    }

    /// Invokes a free function.
    pub fn call_function(&mut self, func: Function, args: CallArgs<Value>) -> Result<Tree<Value>, TraceError> {
        let runtime = self.runtime;
        if !(self.is_tracing() && args_traced(&args)) {
            return eager_call_function(runtime, func, args);
        }
        let tracer = self.tracer()?;
        let detached_args = args.clone().map(&mut |v| tracer.detach(&v));
        let out = eager_call_function(runtime, func, detached_args)?;
        let (leaves, arg_def) = args.into_call_tree(None).flatten();
        let kind = ExprKind::CallFunction {
            func: FunctionKind::Builtin(func),
            arg_def,
            out_def: TreeDef::Leaf,
        };
        record_call(tracer, kind, &leaves, out)
    }

    /// Invokes a user function. While tracing, a function registered with
    /// [`ModuleRegistry::wrap`] runs on the concrete data and is recorded as one `CallFunction`;
    /// any other function runs inline and is recorded through its own operations.
    pub fn call_user(&mut self, func: &UserFunctionRef, args: CallArgs<Value>) -> Result<Tree<Value>, TraceError> {
        args.check_unique_kwargs()?;
        let wrapped = match &self.state {
            State::Tracing(t) => t.registry.is_wrapped(func.name()) && args_traced(&args),
            State::Eager { .. } => false,
        };
        if !wrapped {
            return func.call(self, args);
        }
        let runtime = self.runtime;
        let tracer = self.tracer()?;
        let detached_args = args.clone().map(&mut |v| tracer.detach(&v));
        let out = {
            let tree: &ModuleTree = &*tracer.tree;
            let mut eager = Context::with_tree(runtime, tree);
            func.call(&mut eager, detached_args)?
        };
        let name = func.name().to_string();
        tracer.tree.functions.insert(name.clone(), func.clone());
        let (leaves, arg_def) = args.into_call_tree(None).flatten();
        let kind = ExprKind::CallFunction {
            func: FunctionKind::Wrapped(name),
            arg_def,
            out_def: TreeDef::Leaf,
        };
        record_call(tracer, kind, &leaves, out)
    }

    /// Replays a recorded call to the wrapped function `name`.
    pub(crate) fn call_wrapped(&mut self, name: &str, args: CallArgs<Value>) -> Result<Tree<Value>, TraceError> {
        let func = match &self.state {
            State::Eager { tree, .. } => tree.and_then(|t| t.functions.get(name)).cloned(),
            State::Tracing(t) => t.tree.functions.get(name).cloned(),
        }
        .ok_or_else(|| TraceError::UnknownFunction(name.to_string()))?;
        self.call_user(&func, args)
    }

    /// Calls a module.
    pub fn call_module(&mut self, module: &Value, args: CallArgs<Value>) -> Result<Tree<Value>, TraceError> {
        args.check_unique_kwargs()?;
        let Value::Module(m) = module else {
            return Err(TraceError::NotAModule("__call__".to_string()));
        };
        match (&m.handle, self.is_tracing()) {
            (ModuleHandle::Builder(b), true) => self.call_builder(*b, module, args),
            (ModuleHandle::Builder(b), false) => Err(TraceError::BuilderOutsideTrace(format!("builder {}", b.index()))),
            (ModuleHandle::Object(o), false) => o.clone().forward(self, module, args),
            (ModuleHandle::Object(o), true) => {
                if module.node().is_some() {
                    return Err(TraceError::UntrackedModule(o.type_name().to_string()));
                }
                // a module constructed during the trace runs inline and is recorded through its
                // own operations
                o.clone().forward(self, module, args)
            }
            (ModuleHandle::Resolved(id), false) => self.call_resolved(*id, module, args),
            (ModuleHandle::Resolved(id), true) => self.call_resolved_traced(*id, module, args),
        }
    }

    /// Eager call into a module of the current tree.
    fn call_resolved(&mut self, id: ModuleId, module: &Value, args: CallArgs<Value>) -> Result<Tree<Value>, TraceError> {
        let tree = self.tree().ok_or(TraceError::UnknownModule(id))?;
        match tree.module(id)? {
            ModuleObject::Opaque(o) => o.clone().forward(self, &Value::module(o.clone()), args),
            ModuleObject::Traced(tm) => {
                let (leaves, arg_def) = args.into_call_tree(Some(module.clone())).flatten();
                let entry = tm.entry(&arg_def).ok_or_else(|| TraceError::NoGraphForArgDef {
                    module: tm.type_name.clone(),
                    arg_def: arg_def.clone(),
                })?;
                let graph = tree.graph(entry.graph)?;
                let values = graph.interpret(self, leaves)?.into_values();
                Ok(entry.out_def.unflatten(values)?)
            }
        }
    }

    /// Call into a module of the tree being edited: runs it eagerly and records the call.
    fn call_resolved_traced(&mut self, id: ModuleId, module: &Value, args: CallArgs<Value>) -> Result<Tree<Value>, TraceError> {
        let runtime = self.runtime;
        let tracer = self.tracer()?;
        let (leaves, arg_def) = args.clone().into_call_tree(Some(module.clone())).flatten();
        let detached_args = args.map(&mut |v| tracer.detach(&v));
        let detached = tracer.detach(module);
        let (out, graph) = {
            let tree: &ModuleTree = &*tracer.tree;
            let graph = match tree.module(id)? {
                ModuleObject::Traced(tm) => tm.entry(&arg_def).map(|e| e.graph),
                ModuleObject::Opaque(_) => None,
            };
            let mut eager = Context::with_tree(runtime, tree);
            (eager.call_module(&detached, detached_args)?, graph)
        };
        let kind = ExprKind::CallMethod {
            method: MethodKind::Call,
            arg_def,
            out_def: TreeDef::Leaf,
        };
        let (expr, result) = record_call_expr(tracer, kind, &leaves, out)?;
        tracer.graph_mut(tracer.current_graph()?)?.expr_mut(expr)?.graph = graph;
        Ok(result)
    }

    /// Call through a builder: executed directly for opaque modules and argument shapes already
    /// traced, otherwise traced into a new graph.
    fn call_builder(&mut self, b: BuilderId, module: &Value, args: CallArgs<Value>) -> Result<Tree<Value>, TraceError> {
        let runtime = self.runtime;
        let tracer = self.tracer()?;
        let builder = tracer.builder(b)?;
        let target = builder.module().clone();
        let qualname = builder.qualname().to_string();
        let is_leaf = builder.is_leaf();
        let (leaves, arg_def) = args.clone().into_call_tree(Some(module.clone())).flatten();
        let known = builder.as_traced().and_then(|t| t.graph_for(&arg_def));
        let caller = tracer.current_graph()?;
        let inputs = leaves
            .iter()
            .map(|v| tracer.capture(v))
            .collect::<Result<Vec<_>, _>>()?;

        let (outputs, out_def, graph) = if is_leaf || known.is_some() {
            let this = tracer.detach(module);
            let detached_args = args.map(&mut |v| tracer.detach(&v));
            let mut eager = Context::eager(runtime);
            let (outputs, out_def) = target.forward(&mut eager, &this, detached_args)?.flatten();
            (outputs, out_def, known)
        } else {
            let (outputs, out_def, graph) = self.trace_into(b, &target, &qualname, &leaves, &arg_def, &args)?;
            (outputs, out_def, Some(graph))
        };

        let tracer = self.tracer()?;
        let found = tracer.current_graph()?;
        if found != caller {
            return Err(TraceError::ScopeMismatch {
                expected: Some(caller),
                found: Some(found),
            });
        }
        for (index, v) in outputs.iter().enumerate() {
            if v.is_module() {
                return Err(TraceError::UnsupportedOutput { module: qualname, index });
            }
        }
        let specs = outputs.iter().map(|v| NodeSpec::new(tracer.kind_of(v))).collect();
        let kind = ExprKind::CallMethod {
            method: MethodKind::Call,
            arg_def: arg_def.clone(),
            out_def: out_def.clone(),
        };
        let (expr, keys) = tracer.record(kind, inputs, specs)?;
        tracer.graph_mut(caller)?.expr_mut(expr)?.graph = graph;
        if let (Some(graph), None) = (graph, known) {
            if let Some(traced) = tracer.builder_mut(b)?.as_traced_mut() {
                traced.add_entry(arg_def, out_def.clone(), graph);
            }
        }
        let values = outputs
            .into_iter()
            .zip(keys)
            .map(|(v, k)| v.without_node().with_node(k))
            .collect();
        Ok(out_def.unflatten(values)?)
    }

    /// Runs `target.forward` inside a new scope whose inputs stand for the call's arguments.
    fn trace_into(
        &mut self,
        b: BuilderId,
        target: &ModuleRef,
        qualname: &str,
        leaves: &[Value],
        arg_def: &TreeDef,
        args: &CallArgs<Value>,
    ) -> Result<(Vec<Value>, TreeDef, GraphId), TraceError> {
        let names = target.signature().bind_input_names(target.type_name(), args)?;
        let tracer = self.tracer()?;
        let graph = tracer.open_scope(b, qualname)?;
        let self_key = tracer.add_input(NodeSpec::named(NodeKind::module(None), "self").with_qualname(qualname))?;
        tracer.builder_mut(b)?.record_node(self_key);
        let mut inner = Vec::with_capacity(leaves.len());
        inner.push(Value::Module(ModuleValue {
            handle: ModuleHandle::Builder(b),
            node: Some(self_key),
        }));
        for (value, name) in leaves.iter().skip(1).zip(names) {
            let key = tracer.add_input(NodeSpec::named(tracer.kind_of(value), name))?;
            tracer.note_module_node(value, key)?;
            inner.push(value.clone().without_node().with_node(key));
        }
        let (this, call_args) = CallArgs::from_call_tree(arg_def.unflatten(inner)?, true)?;
        let this = this
            .and_then(Tree::into_leaf)
            .ok_or_else(|| TraceError::UntrackedModule(qualname.to_string()))?;

        let (outputs, out_def) = target.forward(self, &this, call_args)?.flatten();

        let tracer = self.tracer()?;
        for (index, v) in outputs.iter().enumerate() {
            if v.is_module() {
                return Err(TraceError::UnsupportedOutput {
                    module: qualname.to_string(),
                    index,
                });
            }
            let node = tracer.capture(v)?;
            tracer.graph_mut(graph)?.add_output(node)?;
        }
        tracer.close_scope(graph)?;
        Ok((outputs, out_def, graph))
    }

    /// Reads an attribute; `name` may be a dotted path.
    pub fn getattr(&mut self, target: &Value, name: &str) -> Result<Value, TraceError> {
        let mut current = target.clone();
        for segment in name.split('.') {
            current = self.getattr_one(&current, segment)?;
        }
        Ok(current)
    }

    fn getattr_one(&mut self, target: &Value, name: &str) -> Result<Value, TraceError> {
        let Value::Module(m) = target else {
            return Err(TraceError::NotAModule(name.to_string()));
        };
        match (&m.handle, self.is_tracing()) {
            (ModuleHandle::Object(o), _) => match o.attr(name) {
                Some(Attr::Module(child)) => Ok(Value::module(child)),
                Some(Attr::Tensor(t)) => Ok(Value::tensor(t)),
                None => Err(TraceError::UnknownAttribute {
                    module: o.type_name().to_string(),
                    name: name.to_string(),
                }),
            },
            (ModuleHandle::Builder(b), true) => self.getattr_builder(*b, target, name),
            (ModuleHandle::Builder(b), false) => Err(TraceError::BuilderOutsideTrace(format!("builder {}", b.index()))),
            (ModuleHandle::Resolved(id), false) => {
                let tree = self.tree().ok_or(TraceError::UnknownModule(*id))?;
                Ok(match tree.attribute(*id, name)? {
                    Attribute::Module(child) => Value::Module(ModuleValue {
                        handle: ModuleHandle::Resolved(child),
                        node: None,
                    }),
                    Attribute::Tensor(t) => Value::tensor(t),
                })
            }
            (ModuleHandle::Resolved(id), true) => self.getattr_resolved_traced(*id, target, name),
        }
    }

    fn getattr_builder(&mut self, b: BuilderId, target: &Value, name: &str) -> Result<Value, TraceError> {
        let tracer = self.tracer()?;
        let builder = tracer.builder(b)?;
        let module = builder.module().clone();
        let qualname = format!("{}.{}", builder.qualname(), name);
        let inside_leaf = builder.is_leaf();
        let attr = module.attr(name).ok_or_else(|| TraceError::UnknownAttribute {
            module: module.type_name().to_string(),
            name: name.to_string(),
        })?;
        let value = match attr {
            Attr::Module(child) => {
                let child = tracer.builder_for(child, qualname, inside_leaf, false);
                if let Some(traced) = tracer.builder_mut(b)?.as_traced_mut() {
                    traced.record_attribute(name, BuilderAttr::Module(child));
                }
                Value::Module(ModuleValue {
                    handle: ModuleHandle::Builder(child),
                    node: None,
                })
            }
            Attr::Tensor(t) => {
                if let Some(traced) = tracer.builder_mut(b)?.as_traced_mut() {
                    traced.record_attribute(name, BuilderAttr::Tensor(t.clone()));
                }
                Value::tensor(t)
            }
        };
        record_getattr(tracer, target, name, value)
    }

    fn getattr_resolved_traced(&mut self, id: ModuleId, target: &Value, name: &str) -> Result<Value, TraceError> {
        let tracer = self.tracer()?;
        let value = match tracer.pending_attrs.get(name) {
            Some(b) => Value::Module(ModuleValue {
                handle: ModuleHandle::Builder(*b),
                node: None,
            }),
            None => match tracer.tree.attribute(id, name)? {
                Attribute::Module(child) => Value::Module(ModuleValue {
                    handle: ModuleHandle::Resolved(child),
                    node: None,
                }),
                Attribute::Tensor(t) => Value::tensor(t),
            },
        };
        record_getattr(tracer, target, name, value)
    }

    /// Attaches `module` as attribute `name` of the module owning the current scope and returns
    /// it as a traced value.
    pub(crate) fn add_module(&mut self, target: &Value, name: &str, module: ModuleRef) -> Result<Value, TraceError> {
        let tracer = self.tracer()?;
        let graph = tracer.current_graph()?;
        let qualname = format!("{}.{}", tracer.tree.graph(graph)?.qualname(), name);
        let b = tracer.builder_for(module, qualname, false, false);
        tracer.pending_attrs.insert(name.to_string(), b);
        self.getattr(target, name)
    }
}

fn args_traced(args: &CallArgs<Value>) -> bool {
    args.args.iter().flat_map(|a| a.leaves()).any(Value::is_traced)
        || args.kwargs.iter().flat_map(|(_, a)| a.leaves()).any(Value::is_traced)
}

/// Records `GetAttr(target, name)` once per scope, binding `value` to its output node.
fn record_getattr(tracer: &mut Tracer, target: &Value, name: &str, value: Value) -> Result<Value, TraceError> {
    let owner = tracer.capture(target)?;
    let graph = tracer.current_graph()?;
    let memo_key = (NodeKey { graph, node: owner }, name.to_string());
    let key = match tracer.getattr_memo.get(&memo_key) {
        Some(key) => *key,
        None => {
            let spec = NodeSpec::new(tracer.kind_of(&value));
            let (_, keys) = tracer.record(
                ExprKind::GetAttr {
                    name: name.to_string(),
                },
                vec![owner],
                vec![spec],
            )?;
            tracer.getattr_memo.insert(memo_key, keys[0]);
            keys[0]
        }
    };
    tracer.note_module_node(&value, key)?;
    Ok(value.with_node(key))
}

fn record_call(tracer: &mut Tracer, kind: ExprKind, leaves: &[Value], out: Tree<Value>) -> Result<Tree<Value>, TraceError> {
    Ok(record_call_expr(tracer, kind, leaves, out)?.1)
}

/// Records a call whose concrete result is already known, filling in its output shape.
fn record_call_expr(
    tracer: &mut Tracer,
    mut kind: ExprKind,
    leaves: &[Value],
    out: Tree<Value>,
) -> Result<(ExprId, Tree<Value>), TraceError> {
    let inputs = leaves
        .iter()
        .map(|v| tracer.capture(v))
        .collect::<Result<Vec<_>, _>>()?;
    let (outputs, def) = out.flatten();
    match &mut kind {
        ExprKind::CallMethod { out_def, .. } | ExprKind::CallFunction { out_def, .. } => *out_def = def.clone(),
        _ => {}
    }
    for (index, v) in outputs.iter().enumerate() {
        if v.is_module() {
            return Err(TraceError::UnsupportedOutput {
                module: kind.kind_name().to_string(),
                index,
            });
        }
    }
    let specs = outputs.iter().map(|v| NodeSpec::new(tracer.kind_of(v))).collect();
    let (expr, keys) = tracer.record(kind, inputs, specs)?;
    let values = outputs.into_iter().zip(keys).map(|(v, k)| v.with_node(k)).collect();
    Ok((expr, def.unflatten(values)?))
}

fn eager_apply(runtime: &dyn PrimitiveRuntime, op: &PrimitiveOp, inputs: &[Value]) -> Result<Vec<Value>, TraceError> {
    let tensors = inputs
        .iter()
        .map(|v| v.clone().into_tensor())
        .collect::<Result<Vec<_>, _>>()?;
    Ok(runtime
        .apply(op, &tensors)?
        .into_iter()
        .map(Value::tensor)
        .collect())
}

fn eager_call_method(
    runtime: &dyn PrimitiveRuntime,
    receiver: &Value,
    method: TensorMethod,
    args: CallArgs<Value>,
) -> Result<Tree<Value>, TraceError> {
    let receiver = receiver.clone().into_tensor()?;
    let args = args.try_map(&mut |v| v.into_tensor())?;
    Ok(method.execute(runtime, &receiver, &args)?.map(&mut Value::tensor))
}

fn eager_call_function(runtime: &dyn PrimitiveRuntime, func: Function, args: CallArgs<Value>) -> Result<Tree<Value>, TraceError> {
    let args = args.try_map(&mut |v| v.into_tensor())?;
    Ok(func.execute(runtime, &args)?.map(&mut Value::tensor))
}

use crate::module::ModuleRef;
use crate::numeric_tensor::NumericTensor;
use crate::traced_graph::{GraphId, NodeKey};
use crate::traced_module::{ArgDefEntry, Attribute, ModuleObject, TracedModule};
use crate::tree::TreeDef;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, Hash, Ord, PartialOrd, Eq, PartialEq)]
pub struct BuilderId {
    inner: usize,
}

impl BuilderId {
    pub(crate) fn new(inner: usize) -> Self {
        Self { inner }
    }

    pub fn index(&self) -> usize {
        self.inner
    }
}

/// An attribute read through a builder while tracing.
#[derive(Debug, Clone)]
pub enum BuilderAttr {
    Module(BuilderId),
    Tensor(NumericTensor),
}

/// Stand-in for a module while it is being traced.
pub trait ShadowModule {
    fn module(&self) -> &ModuleRef;

    /// Attribute path from the traced root.
    fn qualname(&self) -> &str;

    /// Executed directly, never recursed into.
    fn is_leaf(&self) -> bool;

    /// Accumulates traced graphs and attributes.
    fn is_container(&self) -> bool;

    /// Nodes standing for this module in any graph.
    fn nodes(&self) -> &[NodeKey];

    fn record_node(&mut self, key: NodeKey);

    /// The module object this builder becomes once tracing is done.
    fn resolve(&self, attributes: BTreeMap<String, Attribute>) -> ModuleObject;
}

#[derive(Debug, Clone)]
pub struct OpaqueModule {
    module: ModuleRef,
    qualname: String,
    nodes: Vec<NodeKey>,
}

impl OpaqueModule {
    pub fn new(module: ModuleRef, qualname: String) -> Self {
        Self {
            module,
            qualname,
            nodes: Vec::new(),
        }
    }
}

impl ShadowModule for OpaqueModule {
    fn module(&self) -> &ModuleRef {
        &self.module
    }

    fn qualname(&self) -> &str {
        &self.qualname
    }

    fn is_leaf(&self) -> bool {
        true
    }

    fn is_container(&self) -> bool {
        false
    }

    fn nodes(&self) -> &[NodeKey] {
        &self.nodes
    }

    fn record_node(&mut self, key: NodeKey) {
        if !self.nodes.contains(&key) {
            self.nodes.push(key);
        }
    }

    fn resolve(&self, _attributes: BTreeMap<String, Attribute>) -> ModuleObject {
        ModuleObject::Opaque(self.module.clone())
    }
}

#[derive(Debug, Clone)]
pub struct TracedBuilder {
    module: ModuleRef,
    qualname: String,
    is_top: bool,
    entries: Vec<ArgDefEntry>,
    attributes: BTreeMap<String, BuilderAttr>,
    nodes: Vec<NodeKey>,
}

impl TracedBuilder {
    pub fn new(module: ModuleRef, qualname: String, is_top: bool) -> Self {
        Self {
            module,
            qualname,
            is_top,
            entries: Vec::new(),
            attributes: BTreeMap::new(),
            nodes: Vec::new(),
        }
    }

    /// Graph already traced for calls of shape `arg_def`.
    pub fn graph_for(&self, arg_def: &TreeDef) -> Option<GraphId> {
        self.entries
            .iter()
            .find(|e| e.arg_def == *arg_def)
            .map(|e| e.graph)
    }

    pub fn add_entry(&mut self, arg_def: TreeDef, out_def: TreeDef, graph: GraphId) {
        if self.graph_for(&arg_def).is_none() {
            self.entries.push(ArgDefEntry {
                arg_def,
                out_def,
                graph,
            });
        }
    }

    pub fn is_top(&self) -> bool {
        self.is_top
    }

    pub fn entries(&self) -> &[ArgDefEntry] {
        &self.entries
    }

    pub fn record_attribute(&mut self, name: &str, attr: BuilderAttr) {
        self.attributes.entry(name.to_string()).or_insert(attr);
    }

    pub fn attributes(&self) -> &BTreeMap<String, BuilderAttr> {
        &self.attributes
    }
}

impl ShadowModule for TracedBuilder {
    fn module(&self) -> &ModuleRef {
        &self.module
    }

    fn qualname(&self) -> &str {
        &self.qualname
    }

    fn is_leaf(&self) -> bool {
        false
    }

    fn is_container(&self) -> bool {
        true
    }

    fn nodes(&self) -> &[NodeKey] {
        &self.nodes
    }

    fn record_node(&mut self, key: NodeKey) {
        if !self.nodes.contains(&key) {
            self.nodes.push(key);
        }
    }

    fn resolve(&self, attributes: BTreeMap<String, Attribute>) -> ModuleObject {
        // a module that was never called keeps running its own forward
        if self.entries.is_empty() && !self.is_top {
            return ModuleObject::Opaque(self.module.clone());
        }
        ModuleObject::Traced(TracedModule {
            type_name: self.module.type_name().to_string(),
            is_top: self.is_top,
            entries: self.entries.clone(),
            attributes,
        })
    }
}

#[derive(Debug, Clone)]
pub enum AnyShadowModule {
    Opaque(OpaqueModule),
    Traced(TracedBuilder),
}

impl ShadowModule for AnyShadowModule {
    fn module(&self) -> &ModuleRef {
        match self {
            AnyShadowModule::Opaque(x) => x.module(),
            AnyShadowModule::Traced(x) => x.module(),
        }
    }

    fn qualname(&self) -> &str {
        match self {
            AnyShadowModule::Opaque(x) => x.qualname(),
            AnyShadowModule::Traced(x) => x.qualname(),
        }
    }

    fn is_leaf(&self) -> bool {
        match self {
            AnyShadowModule::Opaque(x) => x.is_leaf(),
            AnyShadowModule::Traced(x) => x.is_leaf(),
        }
    }

    fn is_container(&self) -> bool {
        match self {
            AnyShadowModule::Opaque(x) => x.is_container(),
            AnyShadowModule::Traced(x) => x.is_container(),
        }
    }

    fn nodes(&self) -> &[NodeKey] {
        match self {
            AnyShadowModule::Opaque(x) => x.nodes(),
            AnyShadowModule::Traced(x) => x.nodes(),
        }
    }

    fn record_node(&mut self, key: NodeKey) {
        match self {
            AnyShadowModule::Opaque(x) => x.record_node(key),
            AnyShadowModule::Traced(x) => x.record_node(key),
        }
    }

    fn resolve(&self, attributes: BTreeMap<String, Attribute>) -> ModuleObject {
        match self {
            AnyShadowModule::Opaque(x) => x.resolve(attributes),
            AnyShadowModule::Traced(x) => x.resolve(attributes),
        }
    }
}

impl AnyShadowModule {
    pub fn as_traced(&self) -> Option<&TracedBuilder> {
        match self {
            AnyShadowModule::Traced(x) => Some(x),
            AnyShadowModule::Opaque(_) => None,
        }
    }

    pub fn as_traced_mut(&mut self) -> Option<&mut TracedBuilder> {
        match self {
            AnyShadowModule::Traced(x) => Some(x),
            AnyShadowModule::Opaque(_) => None,
        }
    }
}

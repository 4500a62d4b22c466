use crate::numeric_tensor::NumericTensor;
use crate::tracer::{Context, TraceError, Value};
use crate::tree::{CallArgs, Tree};
use std::collections::{BTreeMap, HashSet};
use std::fmt::Debug;
use std::rc::Rc;

pub type ModuleRef = Rc<dyn Module>;
pub type UserFunctionRef = Rc<dyn UserFunction>;

/// An attribute held by a module.
#[derive(Debug, Clone)]
pub enum Attr {
    Module(ModuleRef),
    Tensor(NumericTensor),
}

#[derive(Debug, thiserror::Error)]
pub enum SignatureError {
    #[error("{module}.forward takes {expected} positional arguments but {got} were given")]
    TooManyPositional {
        module: String,
        expected: usize,
        got: usize,
    },
    #[error("{module}.forward got an unexpected keyword argument `{name}`")]
    UnexpectedKeyword { module: String, name: String },
    #[error("{module}.forward got multiple values for argument `{name}`")]
    DuplicateArgument { module: String, name: String },
}

/// Parameter names of a module's forward, excluding the module itself.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Signature {
    pub params: Vec<String>,
    /// Name collecting surplus positional arguments.
    pub varargs: Option<String>,
    /// Name collecting surplus keyword arguments.
    pub varkw: Option<String>,
}

impl Signature {
    pub fn new<S: Into<String>>(params: impl IntoIterator<Item = S>) -> Self {
        Self {
            params: params.into_iter().map(Into::into).collect(),
            varargs: None,
            varkw: None,
        }
    }

    pub fn with_varargs(mut self, name: impl Into<String>) -> Self {
        self.varargs = Some(name.into());
        self
    }

    pub fn with_varkw(mut self, name: impl Into<String>) -> Self {
        self.varkw = Some(name.into());
        self
    }

    /// Names for the flattened leaves of a call, in flattening order.
    ///
    /// A parameter bound to a single leaf keeps its own name; the leaves of a parameter bound to
    /// a nested value are named `{param}_{i}`, with `i` counting every position of that value.
    pub fn bind_input_names<T>(&self, module: &str, args: &CallArgs<T>) -> Result<Vec<String>, SignatureError> {
        let surplus = args.args.len().saturating_sub(self.params.len());
        if surplus > 0 && self.varargs.is_none() {
            return Err(SignatureError::TooManyPositional {
                module: module.to_string(),
                expected: self.params.len(),
                got: args.args.len(),
            });
        }
        let mut names = Vec::new();
        let mut varargs_slot = 0;
        for (i, arg) in args.args.iter().enumerate() {
            match self.params.get(i) {
                Some(param) => leaf_names(param, arg, &mut names),
                None => {
                    let base = self.varargs.as_deref().unwrap_or("args");
                    push_slot_names(base, arg, &mut varargs_slot, &mut names);
                }
            }
        }
        let mut kwargs: Vec<&(String, Tree<T>)> = args.kwargs.iter().collect();
        kwargs.sort_by(|a, b| a.0.cmp(&b.0));
        let mut varkw_slot = 0;
        for (key, value) in kwargs {
            match self.params.iter().position(|p| p == key) {
                Some(i) if i < args.args.len() => {
                    return Err(SignatureError::DuplicateArgument {
                        module: module.to_string(),
                        name: key.clone(),
                    });
                }
                Some(_) => leaf_names(key, value, &mut names),
                None => match &self.varkw {
                    Some(base) => push_slot_names(base, value, &mut varkw_slot, &mut names),
                    None => {
                        return Err(SignatureError::UnexpectedKeyword {
                            module: module.to_string(),
                            name: key.clone(),
                        });
                    }
                },
            }
        }
        Ok(names)
    }
}

fn leaf_names<T>(param: &str, value: &Tree<T>, names: &mut Vec<String>) {
    if let Tree::Leaf(_) = value {
        names.push(param.to_string());
    } else {
        let mut slot = 0;
        push_slot_names(param, value, &mut slot, names);
    }
}

fn push_slot_names<T>(base: &str, value: &Tree<T>, slot: &mut usize, names: &mut Vec<String>) {
    match value {
        Tree::Leaf(_) => {
            names.push(format!("{base}_{slot}"));
            *slot += 1;
        }
        Tree::Const(_) => *slot += 1,
        Tree::Seq(items) => {
            for x in items {
                push_slot_names(base, x, slot, names);
            }
        }
        Tree::Map(items) => {
            let mut items: Vec<_> = items.iter().collect();
            items.sort_by(|a, b| a.0.cmp(&b.0));
            for (_, x) in items {
                push_slot_names(base, x, slot, names);
            }
        }
    }
}

/// A composable computation over tensors.
///
/// `forward` receives the module's own value as `this`; attributes must be read through
/// `cx.getattr(this, ..)` and sub-modules invoked through `cx.call_module` so that tracing can
/// observe them.
pub trait Module: Debug {
    /// Concrete type, consulted by the [`ModuleRegistry`].
    fn type_name(&self) -> &str;

    /// Display name of a root module. Defaults to the type name.
    fn name(&self) -> Option<&str> {
        None
    }

    fn attr(&self, name: &str) -> Option<Attr>;

    fn attr_names(&self) -> Vec<String>;

    fn signature(&self) -> Signature;

    fn forward(&self, cx: &mut Context, this: &Value, args: CallArgs<Value>) -> Result<Tree<Value>, TraceError>;
}

/// A free function written against [`Context`], invoked through [`Context::call_user`].
///
/// Unless it is registered with [`ModuleRegistry::wrap`], tracing runs it inline and records the
/// operations it performs.
pub trait UserFunction: Debug {
    /// Key under which the function is registered and recorded.
    fn name(&self) -> &str;

    fn call(&self, cx: &mut Context, args: CallArgs<Value>) -> Result<Tree<Value>, TraceError>;
}

/// Module types traced as opaque leaves, and user functions traced as single calls.
#[derive(Debug, Clone, Default)]
pub struct ModuleRegistry {
    builtins: HashSet<String>,
    functions: BTreeMap<String, UserFunctionRef>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtins<S: Into<String>>(types: impl IntoIterator<Item = S>) -> Self {
        Self {
            builtins: types.into_iter().map(Into::into).collect(),
            functions: BTreeMap::new(),
        }
    }

    pub fn register_as_builtin(&mut self, type_name: impl Into<String>) {
        self.builtins.insert(type_name.into());
    }

    pub fn is_builtin(&self, type_name: &str) -> bool {
        self.builtins.contains(type_name)
    }

    /// Registers `func` so that calls to it are recorded as one `CallFunction` expression.
    /// A later registration under the same name replaces the earlier one.
    pub fn wrap(&mut self, func: UserFunctionRef) {
        log::debug!("wrapping function {}", func.name());
        self.functions.insert(func.name().to_string(), func);
    }

    pub fn is_wrapped(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }
}

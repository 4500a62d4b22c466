use rand::Rng;
use std::rc::Rc;
use traced_module::backends::PrimitiveRuntime;
use traced_module::dtype::DType;
use traced_module::module::{Attr, Module, ModuleRef, ModuleRegistry, Signature, UserFunction, UserFunctionRef};
use traced_module::numeric_tensor::NumericTensor;
use traced_module::ops::{PrimitiveOp, TensorMethod};
use traced_module::traced_graph::expr::ExprKind;
use traced_module::traced_graph::{GraphId, InternalGraph, NodeId};
use traced_module::traced_module::{ModuleTree, trace_module};
use traced_module::tracer::{Context, TraceError, Value};
use traced_module::tree::{CallArgs, Tree};

pub mod filter;
pub mod flatten;
pub mod naming;
pub mod state;
pub mod tracing;

pub fn tensor(values: Vec<f32>, shape: &[usize]) -> NumericTensor {
    NumericTensor::from_vec_shape(values, shape).unwrap()
}

pub fn random_tensor(shape: &[usize]) -> NumericTensor {
    let mut rng = rand::thread_rng();
    let n = shape.iter().product();
    tensor((0..n).map(|_| rng.gen_range(-1.0f32..1.0)).collect(), shape)
}

pub fn test_eq(value: &NumericTensor, correct: &NumericTensor) {
    assert_eq!(value.shape(), correct.shape());
    assert_eq!(value.dtype(), correct.dtype());
    assert!(value.all_close(correct, 1e-5, 1e-5), "{value} != {correct}");
}

pub fn leaf(tree: Tree<NumericTensor>) -> NumericTensor {
    tree.into_leaf().unwrap()
}

/// Runs `module` eagerly, without tracing.
pub fn run_eager(runtime: &dyn PrimitiveRuntime, module: ModuleRef, args: CallArgs<NumericTensor>) -> Tree<NumericTensor> {
    let mut cx = Context::eager(runtime);
    let out = cx
        .call_module(&Value::module(module), args.map(&mut Value::tensor))
        .unwrap();
    out.try_map(&mut |v| v.into_tensor()).unwrap()
}

pub fn trace(runtime: &dyn PrimitiveRuntime, module: ModuleRef, args: CallArgs<NumericTensor>) -> ModuleTree {
    trace_module(module, args, &registry(), runtime).unwrap()
}

/// `GetAttr p`, `CallMethod __add__`, `Apply relu`, ...
pub fn describe(kind: &ExprKind) -> String {
    match kind {
        ExprKind::Input { name } => format!("Input {name}"),
        ExprKind::GetAttr { name } => format!("GetAttr {name}"),
        ExprKind::CallMethod { method, .. } => format!("CallMethod {method}"),
        ExprKind::CallFunction { func, .. } => format!("CallFunction {func}"),
        ExprKind::ApplyPrimitive { op } => format!("Apply {op}"),
        other => other.kind_name().to_string(),
    }
}

pub fn order_of(graph: &InternalGraph) -> Vec<String> {
    graph
        .order()
        .iter()
        .map(|e| describe(graph.expr(*e).unwrap().kind()))
        .collect()
}

pub fn find_node(graph: &InternalGraph, name: &str) -> NodeId {
    graph
        .nodes()
        .find(|(_, n)| n.name() == name)
        .map(|(id, _)| id)
        .unwrap_or_else(|| panic!("no node {name} in {graph}"))
}

/// The graph a module call in `graph` was traced into.
pub fn callee(graph: &InternalGraph, index: usize) -> GraphId {
    graph
        .order()
        .iter()
        .map(|e| graph.expr(*e).unwrap())
        .filter(|e| e.kind().is_module_call())
        .nth(index)
        .and_then(|e| e.graph())
        .unwrap()
}

fn input(args: &CallArgs<Value>, index: usize, name: &str) -> Result<Value, TraceError> {
    args.get_param(index, name)
        .and_then(|t| t.as_leaf())
        .cloned()
        .ok_or_else(|| TraceError::UnknownAttribute {
            module: "test module".to_string(),
            name: name.to_string(),
        })
}

fn one(mut values: Vec<Value>) -> Value {
    values.remove(0)
}

/// `x @ weight + bias`.
#[derive(Debug)]
pub struct Linear {
    pub weight: NumericTensor,
    pub bias: NumericTensor,
}

impl Linear {
    pub fn new(features: usize) -> Rc<Self> {
        let weight: Vec<f32> = (0..features * features).map(|i| (i as f32 * 0.37).sin()).collect();
        let bias: Vec<f32> = (0..features).map(|i| 0.1 * i as f32 - 0.2).collect();
        Rc::new(Self {
            weight: tensor(weight, &[features, features]),
            bias: tensor(bias, &[features]),
        })
    }
}

impl Module for Linear {
    fn type_name(&self) -> &str {
        "Linear"
    }

    fn attr(&self, name: &str) -> Option<Attr> {
        match name {
            "weight" => Some(Attr::Tensor(self.weight.clone())),
            "bias" => Some(Attr::Tensor(self.bias.clone())),
            _ => None,
        }
    }

    fn attr_names(&self) -> Vec<String> {
        vec!["weight".to_string(), "bias".to_string()]
    }

    fn signature(&self) -> Signature {
        Signature::new(["x"])
    }

    fn forward(&self, cx: &mut Context, this: &Value, args: CallArgs<Value>) -> Result<Tree<Value>, TraceError> {
        let x = input(&args, 0, "x")?;
        let weight = cx.getattr(this, "weight")?;
        let bias = cx.getattr(this, "bias")?;
        let y = one(cx.apply(PrimitiveOp::MatMul, &[x, weight])?);
        cx.call_method(&y, TensorMethod::Add, CallArgs::new().arg(Tree::Leaf(bias)))
    }
}

/// A library activation, registered as builtin by the tests.
#[derive(Debug)]
pub struct Relu;

impl Module for Relu {
    fn type_name(&self) -> &str {
        "Relu"
    }

    fn attr(&self, _name: &str) -> Option<Attr> {
        None
    }

    fn attr_names(&self) -> Vec<String> {
        vec![]
    }

    fn signature(&self) -> Signature {
        Signature::new(["x"])
    }

    fn forward(&self, cx: &mut Context, _this: &Value, args: CallArgs<Value>) -> Result<Tree<Value>, TraceError> {
        let x = input(&args, 0, "x")?;
        Ok(Tree::Leaf(one(cx.apply(PrimitiveOp::Relu, &[x])?)))
    }
}

pub fn registry() -> ModuleRegistry {
    ModuleRegistry::with_builtins(["Relu"])
}

/// `relu(linear(x + p))`.
#[derive(Debug)]
pub struct Net {
    pub linear: Rc<Linear>,
    pub p: NumericTensor,
}

impl Net {
    pub fn new() -> Rc<Self> {
        Rc::new(Self {
            linear: Linear::new(4),
            p: tensor((0..12).map(|i| 0.05 * i as f32 - 0.3).collect(), &[3, 4]),
        })
    }
}

impl Module for Net {
    fn type_name(&self) -> &str {
        "Net"
    }

    fn attr(&self, name: &str) -> Option<Attr> {
        match name {
            "linear" => Some(Attr::Module(self.linear.clone())),
            "p" => Some(Attr::Tensor(self.p.clone())),
            _ => None,
        }
    }

    fn attr_names(&self) -> Vec<String> {
        vec!["linear".to_string(), "p".to_string()]
    }

    fn signature(&self) -> Signature {
        Signature::new(["x"])
    }

    fn forward(&self, cx: &mut Context, this: &Value, args: CallArgs<Value>) -> Result<Tree<Value>, TraceError> {
        let x = input(&args, 0, "x")?;
        let linear = cx.getattr(this, "linear")?;
        let p = cx.getattr(this, "p")?;
        let h = cx.call_method(&x, TensorMethod::Add, CallArgs::new().arg(Tree::Leaf(p)))?;
        let y = cx.call_module(&linear, CallArgs::new().arg(h))?;
        let y = y.into_leaf().ok_or(TraceError::NotAModule("linear".to_string()))?;
        Ok(Tree::Leaf(one(cx.apply(PrimitiveOp::Relu, &[y])?)))
    }
}

/// `x + 1 + 2`.
#[derive(Debug)]
pub struct AddOneTwo;

impl Module for AddOneTwo {
    fn type_name(&self) -> &str {
        "AddOneTwo"
    }

    fn attr(&self, _name: &str) -> Option<Attr> {
        None
    }

    fn attr_names(&self) -> Vec<String> {
        vec![]
    }

    fn signature(&self) -> Signature {
        Signature::new(["x"])
    }

    fn forward(&self, cx: &mut Context, _this: &Value, args: CallArgs<Value>) -> Result<Tree<Value>, TraceError> {
        let x = input(&args, 0, "x")?;
        let a = cx.call_method(&x, TensorMethod::Add, CallArgs::new().arg(1.0f64))?;
        let a = a.into_leaf().ok_or(TraceError::NotAModule("a".to_string()))?;
        cx.call_method(&a, TensorMethod::Add, CallArgs::new().arg(2.0f64))
    }
}

/// Two stacked linears with a builtin activation between them, plus a discarded product.
#[derive(Debug)]
pub struct Stack {
    pub first: Rc<Linear>,
    pub act: Rc<Relu>,
    pub second: Rc<Linear>,
}

impl Stack {
    pub fn new() -> Rc<Self> {
        Rc::new(Self {
            first: Linear::new(4),
            act: Rc::new(Relu),
            second: Linear::new(4),
        })
    }
}

impl Module for Stack {
    fn type_name(&self) -> &str {
        "Stack"
    }

    fn attr(&self, name: &str) -> Option<Attr> {
        match name {
            "first" => Some(Attr::Module(self.first.clone())),
            "act" => Some(Attr::Module(self.act.clone())),
            "second" => Some(Attr::Module(self.second.clone())),
            _ => None,
        }
    }

    fn attr_names(&self) -> Vec<String> {
        vec!["first".to_string(), "act".to_string(), "second".to_string()]
    }

    fn signature(&self) -> Signature {
        Signature::new(["x"])
    }

    fn forward(&self, cx: &mut Context, this: &Value, args: CallArgs<Value>) -> Result<Tree<Value>, TraceError> {
        let x = input(&args, 0, "x")?;
        let unused = cx.call_method(&x, TensorMethod::Mul, CallArgs::new().arg(3.0f64))?;
        drop(unused);
        let mut h = Tree::Leaf(x);
        for name in ["first", "act", "second"] {
            let m = cx.getattr(this, name)?;
            h = cx.call_module(&m, CallArgs::new().arg(h))?;
        }
        Ok(h)
    }
}

/// Calls one linear twice with the same argument shape and once through a keyword.
#[derive(Debug)]
pub struct Twice {
    pub linear: Rc<Linear>,
}

impl Module for Twice {
    fn type_name(&self) -> &str {
        "Twice"
    }

    fn attr(&self, name: &str) -> Option<Attr> {
        match name {
            "linear" => Some(Attr::Module(self.linear.clone())),
            _ => None,
        }
    }

    fn attr_names(&self) -> Vec<String> {
        vec!["linear".to_string()]
    }

    fn signature(&self) -> Signature {
        Signature::new(["x"])
    }

    fn forward(&self, cx: &mut Context, this: &Value, args: CallArgs<Value>) -> Result<Tree<Value>, TraceError> {
        let x = input(&args, 0, "x")?;
        let linear = cx.getattr(this, "linear")?;
        let a = cx.call_module(&linear, CallArgs::new().arg(Tree::Leaf(x.clone())))?;
        let b = cx.call_module(&linear, CallArgs::new().arg(a))?;
        let c = cx.call_module(&linear, CallArgs::new().kwarg("x", Tree::Leaf(x)))?;
        let b = b.into_leaf().ok_or(TraceError::NotAModule("b".to_string()))?;
        cx.call_method(&b, TensorMethod::Add, CallArgs::new().arg(c))
    }
}

/// Wraps a [`Net`] one level deeper.
#[derive(Debug)]
pub struct Outer {
    pub inner: Rc<Net>,
    pub scale: NumericTensor,
}

impl Outer {
    pub fn new() -> Rc<Self> {
        Rc::new(Self {
            inner: Net::new(),
            scale: NumericTensor::scalar(0.5, DType::F32),
        })
    }
}

impl Module for Outer {
    fn type_name(&self) -> &str {
        "Outer"
    }

    fn attr(&self, name: &str) -> Option<Attr> {
        match name {
            "inner" => Some(Attr::Module(self.inner.clone())),
            "scale" => Some(Attr::Tensor(self.scale.clone())),
            _ => None,
        }
    }

    fn attr_names(&self) -> Vec<String> {
        vec!["inner".to_string(), "scale".to_string()]
    }

    fn signature(&self) -> Signature {
        Signature::new(["x"])
    }

    fn forward(&self, cx: &mut Context, this: &Value, args: CallArgs<Value>) -> Result<Tree<Value>, TraceError> {
        let x = input(&args, 0, "x")?;
        let inner = cx.getattr(this, "inner")?;
        let scale = cx.getattr(this, "scale")?;
        let y = cx.call_module(&inner, CallArgs::new().arg(Tree::Leaf(x)))?;
        let y = y.into_leaf().ok_or(TraceError::NotAModule("inner".to_string()))?;
        cx.call_method(&y, TensorMethod::Mul, CallArgs::new().arg(Tree::Leaf(scale)))
    }
}

/// Takes a pair and keyword extras, to exercise input naming.
#[derive(Debug)]
pub struct PairSum;

impl Module for PairSum {
    fn type_name(&self) -> &str {
        "PairSum"
    }

    fn attr(&self, _name: &str) -> Option<Attr> {
        None
    }

    fn attr_names(&self) -> Vec<String> {
        vec![]
    }

    fn signature(&self) -> Signature {
        Signature::new(["x", "pair"]).with_varkw("extra")
    }

    fn forward(&self, cx: &mut Context, _this: &Value, args: CallArgs<Value>) -> Result<Tree<Value>, TraceError> {
        let mut acc = input(&args, 0, "x")?;
        let mut others: Vec<Value> = args.get_param(1, "pair").map(|t| t.leaves().into_iter().cloned().collect()).unwrap_or_default();
        others.extend(args.kwargs.iter().filter(|(k, _)| k != "pair").flat_map(|(_, t)| t.leaves().into_iter().cloned()));
        for v in others {
            acc = cx
                .call_method(&acc, TensorMethod::Add, CallArgs::new().arg(Tree::Leaf(v)))?
                .into_leaf()
                .ok_or(TraceError::NotAModule("acc".to_string()))?;
        }
        Ok(Tree::Leaf(acc))
    }
}

/// Returns one of its sub-modules, which cannot be a graph output.
#[derive(Debug)]
pub struct LeaksModule {
    pub linear: Rc<Linear>,
}

impl Module for LeaksModule {
    fn type_name(&self) -> &str {
        "LeaksModule"
    }

    fn attr(&self, name: &str) -> Option<Attr> {
        match name {
            "linear" => Some(Attr::Module(self.linear.clone())),
            _ => None,
        }
    }

    fn attr_names(&self) -> Vec<String> {
        vec!["linear".to_string()]
    }

    fn signature(&self) -> Signature {
        Signature::new(["x"])
    }

    fn forward(&self, cx: &mut Context, this: &Value, _args: CallArgs<Value>) -> Result<Tree<Value>, TraceError> {
        Ok(Tree::Leaf(cx.getattr(this, "linear")?))
    }
}

/// Reads the weight of a module it is handed and then calls it: `m(x) + x @ m.weight`.
#[derive(Debug)]
pub struct UseLinear;

impl Module for UseLinear {
    fn type_name(&self) -> &str {
        "UseLinear"
    }

    fn attr(&self, _name: &str) -> Option<Attr> {
        None
    }

    fn attr_names(&self) -> Vec<String> {
        vec![]
    }

    fn signature(&self) -> Signature {
        Signature::new(["x", "m"])
    }

    fn forward(&self, cx: &mut Context, _this: &Value, args: CallArgs<Value>) -> Result<Tree<Value>, TraceError> {
        let x = input(&args, 0, "x")?;
        let m = input(&args, 1, "m")?;
        let weight = cx.getattr(&m, "weight")?;
        let projected = one(cx.apply(PrimitiveOp::MatMul, &[x.clone(), weight])?);
        let called = cx.call_module(&m, CallArgs::new().arg(Tree::Leaf(x)))?;
        cx.call_method(&projected, TensorMethod::Add, CallArgs::new().arg(called))
    }
}

/// Hands its own linear to a [`UseLinear`].
#[derive(Debug)]
pub struct PassLinear {
    pub linear: Rc<Linear>,
    pub user: Rc<UseLinear>,
}

impl PassLinear {
    pub fn new() -> Rc<Self> {
        Rc::new(Self {
            linear: Linear::new(4),
            user: Rc::new(UseLinear),
        })
    }
}

impl Module for PassLinear {
    fn type_name(&self) -> &str {
        "PassLinear"
    }

    fn attr(&self, name: &str) -> Option<Attr> {
        match name {
            "linear" => Some(Attr::Module(self.linear.clone())),
            "user" => Some(Attr::Module(self.user.clone())),
            _ => None,
        }
    }

    fn attr_names(&self) -> Vec<String> {
        vec!["linear".to_string(), "user".to_string()]
    }

    fn signature(&self) -> Signature {
        Signature::new(["x"])
    }

    fn forward(&self, cx: &mut Context, this: &Value, args: CallArgs<Value>) -> Result<Tree<Value>, TraceError> {
        let x = input(&args, 0, "x")?;
        let linear = cx.getattr(this, "linear")?;
        let user = cx.getattr(this, "user")?;
        cx.call_module(&user, CallArgs::new().arg(Tree::Leaf(x)).arg(Tree::Leaf(linear)))
    }
}

/// `x * 2 + 1`, written as a free function.
#[derive(Debug)]
pub struct ScaleShift;

impl UserFunction for ScaleShift {
    fn name(&self) -> &str {
        "scale_shift"
    }

    fn call(&self, cx: &mut Context, args: CallArgs<Value>) -> Result<Tree<Value>, TraceError> {
        let x = input(&args, 0, "x")?;
        let y = cx.call_method(&x, TensorMethod::Mul, CallArgs::new().arg(2.0f64))?;
        let y = y.into_leaf().ok_or(TraceError::NotAModule("scale_shift".to_string()))?;
        cx.call_method(&y, TensorMethod::Add, CallArgs::new().arg(1.0f64))
    }
}

/// `relu(f(x))` for a user function `f`.
#[derive(Debug)]
pub struct UsesFunction {
    pub func: UserFunctionRef,
}

impl Module for UsesFunction {
    fn type_name(&self) -> &str {
        "UsesFunction"
    }

    fn attr(&self, _name: &str) -> Option<Attr> {
        None
    }

    fn attr_names(&self) -> Vec<String> {
        vec![]
    }

    fn signature(&self) -> Signature {
        Signature::new(["x"])
    }

    fn forward(&self, cx: &mut Context, _this: &Value, args: CallArgs<Value>) -> Result<Tree<Value>, TraceError> {
        let x = input(&args, 0, "x")?;
        let y = cx.call_user(&self.func, CallArgs::new().arg(Tree::Leaf(x)))?;
        let y = y.into_leaf().ok_or(TraceError::NotAModule("func".to_string()))?;
        Ok(Tree::Leaf(one(cx.apply(PrimitiveOp::Relu, &[y])?)))
    }
}

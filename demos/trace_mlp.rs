use std::path::PathBuf;
use std::rc::Rc;
use traced_module::backends::eval_backend::EvalBackend;
use traced_module::ops::{Function, PrimitiveOp, TensorMethod};
use traced_module::{
    Attr, CallArgs, Context, InternalGraph, Module, ModuleRegistry, NumericTensor, Signature, TraceError, Tree, Value,
    trace_module,
};

#[derive(Debug)]
struct Linear {
    weight: NumericTensor,
    bias: NumericTensor,
}

impl Linear {
    fn new(inputs: usize, outputs: usize, seed: f32) -> anyhow::Result<Rc<Self>> {
        let weight: Vec<f32> = (0..inputs * outputs).map(|i| (i as f32 * seed).cos() * 0.5).collect();
        let bias: Vec<f32> = (0..outputs).map(|i| 0.01 * i as f32).collect();
        // stored as [out, in], the layout `linear` expects
        Ok(Rc::new(Self {
            weight: NumericTensor::from_vec_shape(weight, &[outputs, inputs])?,
            bias: NumericTensor::from_vec_shape(bias, &[outputs])?,
        }))
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
        let x = args.get_param(0, "x").cloned().ok_or(TraceError::NotAModule("x".to_string()))?;
        let weight = cx.getattr(this, "weight")?;
        let bias = cx.getattr(this, "bias")?;
        cx.call_function(
            Function::Linear,
            CallArgs::new()
                .arg(x)
                .arg(Tree::Leaf(weight))
                .arg(Tree::Leaf(bias)),
        )
    }
}

#[derive(Debug)]
struct Mlp {
    hidden: Rc<Linear>,
    head: Rc<Linear>,
}

impl Module for Mlp {
    fn type_name(&self) -> &str {
        "Mlp"
    }

    fn attr(&self, name: &str) -> Option<Attr> {
        match name {
            "hidden" => Some(Attr::Module(self.hidden.clone())),
            "head" => Some(Attr::Module(self.head.clone())),
            _ => None,
        }
    }

    fn attr_names(&self) -> Vec<String> {
        vec!["hidden".to_string(), "head".to_string()]
    }

    fn signature(&self) -> Signature {
        Signature::new(["x"])
    }

    fn forward(&self, cx: &mut Context, this: &Value, args: CallArgs<Value>) -> Result<Tree<Value>, TraceError> {
        let x = args.get_param(0, "x").cloned().ok_or(TraceError::NotAModule("x".to_string()))?;
        let hidden = cx.getattr(this, "hidden")?;
        let head = cx.getattr(this, "head")?;
        let h = cx.call_module(&hidden, CallArgs::new().arg(x))?;
        let h = h.into_leaf().ok_or(TraceError::NotAModule("hidden".to_string()))?;
        let h = cx.apply(PrimitiveOp::Tanh, &[h])?;
        let y = cx.call_module(&head, CallArgs::new().arg(Tree::Leaf(h[0].clone())))?;
        let y = y.into_leaf().ok_or(TraceError::NotAModule("head".to_string()))?;
        cx.call_method(&y, TensorMethod::Exp, CallArgs::new())
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let out_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| std::env::temp_dir().join("mlp_graph.json"));

    let mlp = Rc::new(Mlp {
        hidden: Linear::new(3, 8, 0.7)?,
        head: Linear::new(8, 2, 1.3)?,
    });
    let x = NumericTensor::from_vec_shape((0..6).map(|i| i as f32 * 0.25 - 0.5).collect::<Vec<f32>>(), &[2, 3])?;
    let backend = EvalBackend::NDArray;

    let mut tree = trace_module(mlp, CallArgs::from_leaves([x.clone()]), &ModuleRegistry::new(), &backend)?;
    println!("{tree}");
    for graph in tree.graphs() {
        if graph.top_graph().is_some() {
            println!("{graph}");
        }
    }

    let traced = tree.forward(&backend, CallArgs::from_leaves([x.clone()]))?;
    let mut flat = tree.flatten()?;
    println!("{flat}");
    let flattened = flat.forward(&backend, CallArgs::from_leaves([x]))?;
    if let (Some(a), Some(b)) = (traced.as_leaf(), flattened.as_leaf()) {
        println!("traced: {a}");
        println!("matches flattened: {}", a.all_close(b, 1e-6, 1e-6));
    }

    let root = flat.root_graph()?;
    flat.graph(root)?.save(&out_path)?;
    let reloaded = InternalGraph::load(&out_path)?;
    println!("saved {} exprs to {}", reloaded.order().len(), out_path.display());
    Ok(())
}

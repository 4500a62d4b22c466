use crate::traced_module_tests::{Net, Stack, describe, random_tensor, trace};
use std::rc::Rc;
use traced_module::backends::eval_backend::EvalBackend;
use traced_module::module::{Attr, Module, Signature};
use traced_module::ops::{Function, TensorMethod};
use traced_module::traced_graph::filter::FilterError;
use traced_module::tracer::{Context, TraceError, Value};
use traced_module::tree::{CallArgs, Tree};

/// `softmax(x, axis=-1).exp()`.
#[derive(Debug)]
struct SoftmaxExp;

impl Module for SoftmaxExp {
    fn type_name(&self) -> &str {
        "SoftmaxExp"
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
        let x = args
            .get_param(0, "x")
            .cloned()
            .ok_or(TraceError::NotAModule("x".to_string()))?;
        let y = cx.call_function(Function::Softmax, CallArgs::new().arg(x).kwarg("axis", -1i64))?;
        let y = y.into_leaf().ok_or(TraceError::NotAModule("y".to_string()))?;
        cx.call_method(&y, TensorMethod::Exp, CallArgs::new())
    }
}

pub fn test_filter_methods_and_functions(backend: &mut EvalBackend) {
    let tree = trace(&*backend, Rc::new(SoftmaxExp), CallArgs::from_leaves([random_tensor(&[2, 5])]));
    let softmax = tree.get_function_by_type(Some(Function::Softmax)).unwrap().as_unique().unwrap();
    assert_eq!(describe(softmax.expr().kind()), "CallFunction softmax");
    assert_eq!(softmax.graph.name(), "SoftmaxExp");
    assert_eq!(tree.get_function_by_type(None).unwrap().as_count(), 1);
    assert_eq!(tree.get_function_by_type(Some(Function::Relu)).unwrap().as_count(), 0);
    let exp = tree.get_method_by_type(Some(TensorMethod::Exp)).unwrap().as_unique().unwrap();
    assert_eq!(exp.expr().inputs(), softmax.expr().outputs());

    let tree = trace(&*backend, Net::new(), CallArgs::from_leaves([random_tensor(&[3, 4])]));
    assert_eq!(tree.get_method_by_type(None).unwrap().as_count(), 3);
    assert_eq!(tree.get_method_by_type(Some(TensorMethod::Add)).unwrap().as_count(), 2);
    assert!(matches!(
        tree.get_method_by_type(Some(TensorMethod::Add)).unwrap().as_unique(),
        Err(FilterError::NotUnique(2))
    ));
    assert_eq!(tree.exprs(false).unwrap().call_method(Some(TensorMethod::Add)).as_count(), 1);
    assert_eq!(tree.exprs(true).unwrap().call_module().as_count(), 1);
    let graphs: Vec<&str> = tree
        .get_method_by_type(Some(TensorMethod::Add))
        .unwrap()
        .iter()
        .map(|e| e.graph.name())
        .collect();
    assert_eq!(graphs, ["Net", "Net_linear"]);
}

pub fn test_filter_modules_by_type(backend: &mut EvalBackend) {
    let tree = trace(&*backend, Stack::new(), CallArgs::from_leaves([random_tensor(&[2, 4])]));
    assert_eq!(tree.get_module_by_type("Relu").unwrap().as_count(), 1);
    // the two sub-module reads plus the module input of each traced linear
    assert_eq!(tree.get_module_by_type("Linear").unwrap().as_count(), 4);
    assert_eq!(tree.get_module_by_type("Stack").unwrap().as_count(), 1);
    assert_eq!(tree.get_module_by_type("Conv").unwrap().as_count(), 0);
    let act = tree.get_module_by_type("Relu").unwrap().as_unique().unwrap();
    assert_eq!(act.full_name(), "Stack_act");
    assert_eq!(tree.nodes(false).unwrap().module_type("Linear").as_count(), 2);
}

pub fn test_filter_nodes_by_name(backend: &mut EvalBackend) {
    let tree = trace(&*backend, Net::new(), CallArgs::from_leaves([random_tensor(&[3, 4])]));
    assert_eq!(tree.get_node_by_name("Net_linear_*", false).unwrap().as_count(), 7);
    assert_eq!(tree.get_node_by_name("Net_relu_out", false).unwrap().as_count(), 1);
    assert_eq!(tree.get_node_by_name("net_RELU_out", true).unwrap().as_count(), 1);
    assert_eq!(tree.get_node_by_name("net_RELU_out", false).unwrap().as_count(), 0);
    assert_eq!(tree.get_node_by_name("Net_?", false).unwrap().as_count(), 2);
    assert_eq!(tree.get_node_by_name("Net_[xp]", false).unwrap().as_count(), 2);
    let matmul = tree.get_node_by_name("*matmul*", false).unwrap().as_unique().unwrap();
    assert_eq!(matmul.node().name(), "matmul_out");
    assert_eq!(matmul.graph.qualname(), "Net.linear");
}

pub fn test_filter_by_id(backend: &mut EvalBackend) {
    let tree = trace(&*backend, Net::new(), CallArgs::from_leaves([random_tensor(&[3, 4])]));
    let first = tree.get_expr_by_id(&[0]).unwrap().as_unique().unwrap();
    assert_eq!(describe(first.expr().kind()), "Input self");
    assert_eq!(first.graph.name(), "Net");
    let node = tree.get_node_by_id(&[0]).unwrap().as_unique().unwrap();
    assert_eq!(node.full_name(), "Net_self");
    assert_eq!(tree.get_node_by_id(&[0, 1]).unwrap().as_count(), 2);
    assert_eq!(tree.get_expr_by_id(&[usize::MAX]).unwrap().as_count(), 0);

    let exprs = tree.exprs(true).unwrap();
    let count = exprs.as_count();
    assert_eq!(exprs.as_dict().len(), count);
    let nodes = tree.nodes(true).unwrap();
    let count = nodes.as_count();
    assert_eq!(nodes.as_dict().len(), count);
}

use crate::traced_module_tests::{
    AddOneTwo, LeaksModule, Linear, Net, Outer, PairSum, Relu, ScaleShift, Stack, Twice, UsesFunction, callee, find_node,
    leaf, order_of, random_tensor, registry, run_eager, test_eq, trace,
};
use std::rc::Rc;
use traced_module::backends::eval_backend::EvalBackend;
use traced_module::ops::{Function, TensorMethod};
use traced_module::traced_graph::expr::ExprKind;
use traced_module::traced_module::{Attribute, ModuleObject, trace_module};
use traced_module::tracer::TraceError;
use traced_module::tree::{CallArgs, Literal, Tree, TreeDef};

pub fn test_trace_records_expected_exprs(backend: &mut EvalBackend) {
    let tree = trace(&*backend, Net::new(), CallArgs::from_leaves([random_tensor(&[3, 4])]));
    let root = tree.root_graph().unwrap();
    let graph = tree.graph(root).unwrap();
    assert_eq!(
        order_of(graph),
        [
            "GetAttr linear",
            "GetAttr p",
            "CallMethod __add__",
            "CallMethod __call__",
            "Apply relu"
        ]
    );
    assert_eq!(graph.top_graph(), None);

    let linear = tree.graph(callee(graph, 0)).unwrap();
    assert_eq!(linear.top_graph(), Some(root));
    assert_eq!(
        order_of(linear),
        [
            "GetAttr weight",
            "GetAttr bias",
            "Apply matmul",
            "CallMethod __add__"
        ]
    );
    let owner = tree.graph_owner(linear.id()).unwrap();
    assert_eq!(tree.module(owner).unwrap().type_name(), "Linear");
    assert_eq!(tree.graph_owner(root), Some(tree.root()));
    assert_eq!(tree.graphs().count(), 2);
}

pub fn test_trace_names_nodes(backend: &mut EvalBackend) {
    let tree = trace(&*backend, Net::new(), CallArgs::from_leaves([random_tensor(&[3, 4])]));
    let graph = tree.graph(tree.root_graph().unwrap()).unwrap();
    assert_eq!(graph.name(), "Net");
    assert_eq!(graph.qualname(), "Net");
    let names: Vec<&str> = graph.nodes().map(|(_, n)| n.name()).collect();
    assert_eq!(
        names,
        ["self", "x", "linear", "p", "add_out", "linear_out", "relu_out"]
    );
    let qualname = |name: &str| graph.node(find_node(graph, name)).unwrap().qualname().to_string();
    assert_eq!(qualname("self"), "Net");
    assert_eq!(qualname("x"), "Net.[x]");
    assert_eq!(qualname("linear"), "Net.linear");
    assert_eq!(qualname("add_out"), "Net.[method_add]");
    assert_eq!(qualname("linear_out"), "Net.linear.[out]");
    assert_eq!(qualname("relu_out"), "Net.[def_relu]");

    let x = graph.node(find_node(graph, "x")).unwrap();
    assert_eq!(x.shape(), Some(&[3usize, 4][..]));
    let linear = graph.node(find_node(graph, "linear")).unwrap();
    assert_eq!(linear.module_type(), Some("Linear"));

    let sub = tree.graph(callee(graph, 0)).unwrap();
    assert_eq!(sub.name(), "Net_linear");
    assert_eq!(sub.qualname(), "Net.linear");
    let names: Vec<&str> = sub.nodes().map(|(_, n)| n.name()).collect();
    assert_eq!(names, ["self", "x", "weight", "bias", "matmul_out", "add_out"]);

    let text = graph.to_string();
    assert!(text.starts_with("Net.Graph (self, x) {"), "{text}");
    assert!(text.contains("add_out = x.__add__(p)"), "{text}");
    assert!(text.contains("linear_out = linear(add_out)"), "{text}");
    assert!(text.contains("relu_out = relu(linear_out)"), "{text}");
    assert!(text.ends_with("return relu_out\n}"), "{text}");
}

pub fn test_trace_qualnames_resolve(backend: &mut EvalBackend) {
    let net = Net::new();
    let tree = trace(&*backend, net.clone(), CallArgs::from_leaves([random_tensor(&[3, 4])]));
    assert!(matches!(tree.resolve_qualname("Net"), Ok(Attribute::Module(id)) if id == tree.root()));
    let Attribute::Module(linear) = tree.resolve_qualname("Net.linear").unwrap() else {
        panic!("Net.linear is not a module");
    };
    assert_eq!(tree.module(linear).unwrap().type_name(), "Linear");
    assert_eq!(tree.qualname_of(linear).as_deref(), Some("Net.linear"));
    let Attribute::Tensor(bias) = tree.resolve_qualname("Net.linear.bias").unwrap() else {
        panic!("Net.linear.bias is not a tensor");
    };
    assert_eq!(bias, net.linear.bias);
    assert!(matches!(tree.resolve_qualname("Net.p"), Ok(Attribute::Tensor(_))));
    assert!(matches!(
        tree.resolve_qualname("Net.missing"),
        Err(TraceError::UnknownAttribute { .. })
    ));
    assert!(tree.resolve_qualname("Other.linear").is_err());

    // every module node points back at the module its qualname names
    for graph in tree.graphs() {
        for (_, node) in graph.nodes().filter(|(_, n)| n.is_module()) {
            let owner = node.owner().unwrap();
            assert_eq!(tree.qualname_of(owner).as_deref(), Some(node.qualname()));
        }
    }
}

pub fn test_builtin_submodule_stays_opaque(backend: &mut EvalBackend) {
    let tree = trace(&*backend, Stack::new(), CallArgs::from_leaves([random_tensor(&[2, 4])]));
    let graph = tree.graph(tree.root_graph().unwrap()).unwrap();
    assert_eq!(
        order_of(graph),
        [
            "GetAttr first",
            "CallMethod __call__",
            "GetAttr act",
            "CallMethod __call__",
            "GetAttr second",
            "CallMethod __call__"
        ]
    );
    let calls: Vec<_> = graph
        .order()
        .iter()
        .map(|e| graph.expr(*e).unwrap())
        .filter(|e| e.kind().is_module_call())
        .map(|e| e.graph())
        .collect();
    assert!(calls[0].is_some());
    assert_eq!(calls[1], None);
    assert!(calls[2].is_some());
    assert_ne!(calls[0], calls[2]);

    let act = graph.node(find_node(graph, "act")).unwrap();
    assert_eq!(act.module_type(), Some("Relu"));
    let Attribute::Module(id) = tree.resolve_qualname("Stack.act").unwrap() else {
        panic!("Stack.act is not a module");
    };
    assert!(matches!(tree.module(id).unwrap(), ModuleObject::Opaque(_)));
    assert_eq!(tree.graphs().count(), 3);
}

pub fn test_dead_exprs_removed_after_trace(backend: &mut EvalBackend) {
    let tree = trace(&*backend, Stack::new(), CallArgs::from_leaves([random_tensor(&[2, 4])]));
    assert_eq!(tree.get_method_by_type(Some(TensorMethod::Mul)).unwrap().as_count(), 0);
    let graph = tree.graph(tree.root_graph().unwrap()).unwrap();
    assert!(graph.nodes().all(|(_, n)| n.name() != "mul_out"));
}

pub fn test_reused_module_shares_graph(backend: &mut EvalBackend) {
    let twice = Rc::new(Twice { linear: Linear::new(4) });
    let tree = trace(&*backend, twice, CallArgs::from_leaves([random_tensor(&[3, 4])]));
    let graph = tree.graph(tree.root_graph().unwrap()).unwrap();
    let first = callee(graph, 0);
    assert_eq!(callee(graph, 1), first);
    let keyword = callee(graph, 2);
    assert_ne!(keyword, first);
    assert_eq!(tree.graph(first).unwrap().name(), "Twice_linear");
    assert_eq!(tree.graph(keyword).unwrap().name(), "Twice_linear_1");

    let Attribute::Module(linear) = tree.resolve_qualname("Twice.linear").unwrap() else {
        panic!("Twice.linear is not a module");
    };
    let traced = tree.traced(linear).unwrap();
    assert_eq!(traced.entries.len(), 2);
    let positional = TreeDef::Seq(vec![TreeDef::Seq(vec![TreeDef::Leaf, TreeDef::Leaf]), TreeDef::Map(vec![])]);
    assert_eq!(traced.entry(&positional).map(|e| e.graph), Some(first));
    assert_eq!(tree.graphs().count(), 3);
}

pub fn test_literal_args_in_arg_def(backend: &mut EvalBackend) {
    let tree = trace(&*backend, Rc::new(AddOneTwo), CallArgs::from_leaves([random_tensor(&[5])]));
    let graph = tree.graph(tree.root_graph().unwrap()).unwrap();
    let first = graph.expr(graph.order()[0]).unwrap();
    let ExprKind::CallMethod { arg_def, .. } = first.kind() else {
        panic!("expected a method call, got {}", first.kind().kind_name());
    };
    assert_eq!(
        *arg_def,
        TreeDef::Seq(vec![
            TreeDef::Seq(vec![TreeDef::Leaf, TreeDef::Const(Literal::Float(1.0))]),
            TreeDef::Map(vec![])
        ])
    );
    assert_eq!(first.inputs().len(), 1);
    let text = graph.to_string();
    assert!(text.contains("add_out = x.__add__(1.0)"), "{text}");
    assert!(text.contains("add_out_1 = add_out.__add__(2.0)"), "{text}");
}

pub fn test_nested_input_names(backend: &mut EvalBackend) {
    let args = CallArgs::new()
        .arg(Tree::Leaf(random_tensor(&[2, 3])))
        .arg(Tree::Seq(vec![
            Tree::Leaf(random_tensor(&[2, 3])),
            Tree::Leaf(random_tensor(&[2, 3])),
        ]))
        .kwarg("bias", Tree::Leaf(random_tensor(&[2, 3])));
    let tree = trace(&*backend, Rc::new(PairSum), args);
    let graph = tree.graph(tree.root_graph().unwrap()).unwrap();
    let names: Vec<&str> = graph
        .inputs()
        .iter()
        .map(|n| graph.node(*n).unwrap().name())
        .collect();
    assert_eq!(names, ["self", "x", "pair_0", "pair_1", "extra_0"]);
    assert_eq!(tree.get_method_by_type(Some(TensorMethod::Add)).unwrap().as_count(), 3);
}

pub fn test_builtin_root_rejected(backend: &mut EvalBackend) {
    let result = trace_module(
        Rc::new(Relu),
        CallArgs::from_leaves([random_tensor(&[2])]),
        &registry(),
        &*backend,
    );
    assert!(matches!(result, Err(TraceError::RootIsBuiltin(name)) if name == "Relu"));
}

pub fn test_module_output_rejected(backend: &mut EvalBackend) {
    let leaks = Rc::new(LeaksModule { linear: Linear::new(4) });
    let result = trace_module(
        leaks,
        CallArgs::from_leaves([random_tensor(&[3, 4])]),
        &registry(),
        &*backend,
    );
    assert!(matches!(
        result,
        Err(TraceError::UnsupportedOutput { module, index: 0 }) if module == "LeaksModule"
    ));
}

pub fn test_nested_module_graphs(backend: &mut EvalBackend) {
    let tree = trace(&*backend, Outer::new(), CallArgs::from_leaves([random_tensor(&[3, 4])]));
    let root = tree.root_graph().unwrap();
    let outer = tree.graph(root).unwrap();
    let inner_id = callee(outer, 0);
    let inner = tree.graph(inner_id).unwrap();
    let linear = tree.graph(callee(inner, 0)).unwrap();
    assert_eq!(inner.name(), "Outer_inner");
    assert_eq!(linear.name(), "Outer_inner_linear");
    assert_eq!(linear.qualname(), "Outer.inner.linear");
    assert_eq!(inner.top_graph(), Some(root));
    assert_eq!(linear.top_graph(), Some(inner_id));
    assert!(matches!(
        tree.resolve_qualname("Outer.inner.linear.weight"),
        Ok(Attribute::Tensor(t)) if t.shape() == vec![4, 4]
    ));
    assert_eq!(tree.graphs().count(), 3);
    assert_eq!(tree.modules().count(), 3);
}

pub fn test_wrapped_function_recorded_as_call(backend: &mut EvalBackend) {
    let module = Rc::new(UsesFunction { func: Rc::new(ScaleShift) });
    let mut wrapping = registry();
    wrapping.wrap(Rc::new(ScaleShift));
    assert!(wrapping.is_wrapped("scale_shift"));
    let mut tree = trace_module(module.clone(), CallArgs::from_leaves([random_tensor(&[3, 4])]), &wrapping, &*backend).unwrap();
    {
        let graph = tree.graph(tree.root_graph().unwrap()).unwrap();
        assert_eq!(order_of(graph), ["CallFunction scale_shift", "Apply relu"]);
        assert!(graph.to_string().contains("scale_shift(x)"), "{graph}");
    }
    assert_eq!(tree.get_wrapped_function("scale_shift").unwrap().as_count(), 1);
    assert_eq!(tree.get_function_by_type(None).unwrap().as_count(), 1);
    assert_eq!(tree.get_function_by_type(Some(Function::Relu)).unwrap().as_count(), 0);
    assert_eq!(tree.get_method_by_type(None).unwrap().as_count(), 0);

    let mut flat = tree.flatten().unwrap();
    let x = random_tensor(&[3, 4]);
    let eager = leaf(run_eager(&*backend, module.clone(), CallArgs::from_leaves([x.clone()])));
    test_eq(&leaf(tree.forward(&*backend, CallArgs::from_leaves([x.clone()])).unwrap()), &eager);
    test_eq(&leaf(flat.forward(&*backend, CallArgs::from_leaves([x])).unwrap()), &eager);

    // without registration the function is traced through
    let mut tree = trace(&*backend, module.clone(), CallArgs::from_leaves([random_tensor(&[3, 4])]));
    let graph = tree.graph(tree.root_graph().unwrap()).unwrap();
    assert_eq!(order_of(graph), ["CallMethod __mul__", "CallMethod __add__", "Apply relu"]);
    assert_eq!(tree.get_wrapped_function("scale_shift").unwrap().as_count(), 0);
    let x = random_tensor(&[3, 4]);
    let eager = leaf(run_eager(&*backend, module, CallArgs::from_leaves([x.clone()])));
    test_eq(&leaf(tree.forward(&*backend, CallArgs::from_leaves([x])).unwrap()), &eager);
}

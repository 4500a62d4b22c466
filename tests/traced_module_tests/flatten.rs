use crate::traced_module_tests::{
    Net, Outer, Stack, find_node, leaf, order_of, random_tensor, run_eager, test_eq, trace,
};
use traced_module::backends::eval_backend::EvalBackend;
use traced_module::tree::{CallArgs, Tree};

pub fn test_flatten_inlines_calls(backend: &mut EvalBackend) {
    let tree = trace(&*backend, Net::new(), CallArgs::from_leaves([random_tensor(&[3, 4])]));
    let flat = tree.flatten().unwrap();
    let graph = flat.graph(flat.root_graph().unwrap()).unwrap();
    assert_eq!(
        order_of(graph),
        [
            "GetAttr p",
            "CallMethod __add__",
            "GetAttr linear.weight",
            "GetAttr linear.bias",
            "Apply matmul",
            "CallMethod __add__",
            "Apply relu"
        ]
    );
    assert_eq!(flat.exprs(true).unwrap().call_module().as_count(), 0);
    // the source tree is left as it was
    assert_eq!(tree.exprs(true).unwrap().call_module().as_count(), 1);
    assert_eq!(order_of(tree.graph(tree.root_graph().unwrap()).unwrap()).len(), 5);
}

pub fn test_flatten_preserves_results(backend: &mut EvalBackend) {
    let net = Net::new();
    let tree = trace(&*backend, net.clone(), CallArgs::from_leaves([random_tensor(&[3, 4])]));
    let mut flat = tree.flatten().unwrap();
    let x = random_tensor(&[3, 4]);
    let out = leaf(flat.forward(&*backend, CallArgs::from_leaves([x.clone()])).unwrap());
    test_eq(&out, &leaf(run_eager(&*backend, net, CallArgs::from_leaves([x]))));

    let outer = Outer::new();
    let tree = trace(&*backend, outer.clone(), CallArgs::from_leaves([random_tensor(&[3, 4])]));
    let mut flat = tree.flatten().unwrap();
    assert_eq!(flat.exprs(true).unwrap().call_module().as_count(), 0);
    let x = random_tensor(&[3, 4]);
    let out = leaf(flat.forward(&*backend, CallArgs::from_leaves([x.clone()])).unwrap());
    test_eq(&out, &leaf(run_eager(&*backend, outer, CallArgs::from_leaves([x]))));
}

pub fn test_flatten_prefixes_names(backend: &mut EvalBackend) {
    let tree = trace(&*backend, Net::new(), CallArgs::from_leaves([random_tensor(&[3, 4])]));
    let flat = tree.flatten().unwrap();
    let graph = flat.graph(flat.root_graph().unwrap()).unwrap();
    let names: Vec<&str> = graph.nodes().map(|(_, n)| n.name()).collect();
    assert_eq!(
        names,
        [
            "self",
            "x",
            "p",
            "add_out",
            "linear_weight",
            "linear_bias",
            "linear_matmul_out",
            "linear_add_out",
            "relu_out"
        ]
    );
    let weight = graph.node(find_node(graph, "linear_weight")).unwrap();
    assert_eq!(weight.qualname(), "Net.linear.weight");
    assert_eq!(weight.shape(), Some(&[4usize, 4][..]));

    let tree = trace(&*backend, Outer::new(), CallArgs::from_leaves([random_tensor(&[3, 4])]));
    let flat = tree.flatten().unwrap();
    assert_eq!(flat.get_node_by_name("Outer_inner_linear_*", false).unwrap().as_count(), 4);
    assert_eq!(flat.get_node_by_name("Outer_inner_add_out", false).unwrap().as_count(), 1);

    // end points on the root graph follow their nodes into the flat graph
    let mut tree = trace(&*backend, Net::new(), CallArgs::from_leaves([random_tensor(&[3, 4])]));
    let key = {
        let graph = tree.graph(tree.root_graph().unwrap()).unwrap();
        graph.key(find_node(graph, "add_out"))
    };
    tree.set_end_points(&[key]).unwrap();
    let mut flat = tree.flatten().unwrap();
    let graph = flat.graph(flat.root_graph().unwrap()).unwrap();
    let end: Vec<&str> = graph
        .end_points()
        .iter()
        .map(|n| graph.node(*n).unwrap().name())
        .collect();
    assert_eq!(end, ["add_out"]);
    let out = flat.forward(&*backend, CallArgs::from_leaves([random_tensor(&[3, 4])])).unwrap();
    assert!(matches!(out, Tree::Seq(values) if values.len() == 1));
}

pub fn test_flatten_keeps_opaque_calls(backend: &mut EvalBackend) {
    let stack = Stack::new();
    let tree = trace(&*backend, stack.clone(), CallArgs::from_leaves([random_tensor(&[2, 4])]));
    let mut flat = tree.flatten().unwrap();
    {
        let calls = flat.exprs(true).unwrap().call_module().as_list();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].expr().graph(), None);
        let graph = flat.graph(flat.root_graph().unwrap()).unwrap();
        let callee = graph.node(calls[0].expr().inputs()[0]).unwrap();
        assert_eq!(callee.module_type(), Some("Relu"));
    }
    assert_eq!(flat.get_node_by_name("Stack_first_*", false).unwrap().as_count(), 4);
    assert_eq!(flat.get_node_by_name("Stack_second_*", false).unwrap().as_count(), 4);

    let x = random_tensor(&[2, 4]);
    let out = leaf(flat.forward(&*backend, CallArgs::from_leaves([x.clone()])).unwrap());
    test_eq(&out, &leaf(run_eager(&*backend, stack, CallArgs::from_leaves([x]))));
}

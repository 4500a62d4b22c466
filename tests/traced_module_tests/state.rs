use crate::traced_module_tests::{Net, callee, find_node, leaf, random_tensor, run_eager, test_eq, trace};
use serde_json::json;
use traced_module::backends::eval_backend::EvalBackend;
use traced_module::traced_graph::InternalGraph;
use traced_module::traced_graph::namespace::NameOwner;
use traced_module::tree::CallArgs;

pub fn test_state_json_round_trip(backend: &mut EvalBackend) {
    let net = Net::new();
    let mut tree = trace(&*backend, net.clone(), CallArgs::from_leaves([random_tensor(&[3, 4])]));
    let root = tree.root_graph().unwrap();
    let sub = callee(tree.graph(root).unwrap(), 0);

    for id in [root, sub] {
        let graph = tree.graph(id).unwrap();
        let back = InternalGraph::from_json(&graph.to_json().unwrap()).unwrap();
        assert_eq!(back.to_string(), graph.to_string());
        assert_eq!(back.name(), graph.name());
        assert_eq!(back.qualname(), graph.qualname());
        assert_eq!(back.top_graph(), graph.top_graph());
        assert_eq!(back.namespace().len(), graph.namespace().len());
        let names: Vec<(String, String)> = back
            .nodes()
            .map(|(_, n)| (n.name().to_string(), n.qualname().to_string()))
            .collect();
        let expected: Vec<(String, String)> = graph
            .nodes()
            .map(|(_, n)| (n.name().to_string(), n.qualname().to_string()))
            .collect();
        assert_eq!(names, expected);
        *tree.graph_mut(id).unwrap() = back;
    }

    // the restored root still points at the callee held by the tree
    assert_eq!(callee(tree.graph(root).unwrap(), 0), sub);

    // module bindings are not persisted until the tree relinks them
    let linear = find_node(tree.graph(root).unwrap(), "linear");
    assert!(tree.graph(root).unwrap().node(linear).unwrap().owner().is_none());
    tree.update_ref();
    let owner = tree.graph(root).unwrap().node(linear).unwrap().owner().unwrap();
    assert_eq!(tree.qualname_of(owner).as_deref(), Some("Net.linear"));

    let x = random_tensor(&[3, 4]);
    let traced = leaf(tree.forward(&*backend, CallArgs::from_leaves([x.clone()])).unwrap());
    test_eq(&traced, &leaf(run_eager(&*backend, net, CallArgs::from_leaves([x]))));
}

pub fn test_state_save_load(backend: &mut EvalBackend) {
    let tree = trace(&*backend, Net::new(), CallArgs::from_leaves([random_tensor(&[3, 4])]));
    let graph = tree.graph(tree.root_graph().unwrap()).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("net.json");
    graph.save(&path).unwrap();
    let loaded = InternalGraph::load(&path).unwrap();
    assert_eq!(loaded.to_string(), graph.to_string());
    assert_eq!(loaded.order().len(), graph.order().len());
    assert!(InternalGraph::load(&dir.path().join("missing.json")).is_err());

    std::fs::write(&path, "{\"version\": \"V9\"}").unwrap();
    assert!(InternalGraph::load(&path).is_err());
}

/// Rewrites a current state into the layout written before qualified names existed.
fn legacy_state(graph: &InternalGraph, prefix: &str) -> String {
    let mut state: serde_json::Value = serde_json::from_str(&graph.to_json().unwrap()).unwrap();
    let obj = state.as_object_mut().unwrap();
    obj.insert("version".to_string(), json!("V1"));
    let qualname = obj.remove("qualname").unwrap();
    obj.insert("module_name".to_string(), qualname);
    obj.insert("prefix_name".to_string(), json!(prefix));
    for key in ["namespace", "watch_points", "end_points"] {
        obj.remove(key);
    }
    for node in obj["nodes"].as_array_mut().unwrap() {
        node.as_object_mut().unwrap().remove("qualname");
    }
    state.to_string()
}

pub fn test_legacy_state_upgrade(backend: &mut EvalBackend) {
    let tree = trace(&*backend, Net::new(), CallArgs::from_leaves([random_tensor(&[3, 4])]));
    let graph = tree.graph(tree.root_graph().unwrap()).unwrap();

    let upgraded = InternalGraph::from_json(&legacy_state(graph, "")).unwrap();
    assert_eq!(upgraded.name(), "Net");
    assert_eq!(upgraded.qualname(), "Net");
    let qualname = |name: &str| {
        upgraded
            .node(find_node(&upgraded, name))
            .unwrap()
            .qualname()
            .to_string()
    };
    assert_eq!(qualname("self"), "Net");
    assert_eq!(qualname("x"), "Net.[x]");
    assert_eq!(qualname("linear"), "Net.linear");
    assert_eq!(qualname("p"), "Net.p");
    assert_eq!(qualname("add_out"), "Net.[add_out]");
    assert_eq!(qualname("linear_out"), "Net.linear.[out]");
    assert_eq!(qualname("relu_out"), "Net.[relu_out]");

    let add = find_node(&upgraded, "add_out");
    assert_eq!(upgraded.namespace().owner_of("add_out"), Some(NameOwner::Node(add)));
    assert_eq!(upgraded.namespace().len(), graph.nodes().count());
    assert!(upgraded.watch_points().is_empty());
    assert_eq!(upgraded.to_string(), graph.to_string());

    let prefixed = InternalGraph::from_json(&legacy_state(graph, "outer")).unwrap();
    assert_eq!(prefixed.name(), "outer_Net");
    assert_eq!(prefixed.namespace().name(), "outer_Net");
    assert_eq!(prefixed.qualname(), "Net");
}

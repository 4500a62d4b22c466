use crate::traced_module_tests::{Net, find_node, random_tensor, trace};
use proptest::prelude::*;
use proptest::test_runner::TestRunner;
use std::collections::HashSet;
use traced_module::backends::eval_backend::EvalBackend;
use traced_module::traced_graph::namespace::{NameOwner, NameSpace, NameSpaceError, is_reserved_word};
use traced_module::tree::CallArgs;

pub fn test_unique_names_increment(_backend: &mut EvalBackend) {
    let mut ns = NameSpace::new("Net", "Net");
    assert_eq!(ns.create_unique_name("add_out", None), "add_out");
    assert_eq!(ns.create_unique_name("add_out", None), "add_out_1");
    assert_eq!(ns.create_unique_name("add_out", None), "add_out_2");
    assert_eq!(ns.create_unique_name("Net.linear", None), "Net_linear");
    assert_eq!(ns.create_unique_name("Net.linear", None), "Net_linear_1");
    assert_eq!(ns.create_unique_name("0conv", None), "_0conv");

    let mut runner = TestRunner::default();
    runner
        .run(&proptest::collection::vec("[a-z_.0-9]{0,6}", 1..40), |candidates| {
            let mut first = NameSpace::new("g", "g");
            let mut second = NameSpace::new("g", "g");
            let mut seen = HashSet::new();
            for candidate in &candidates {
                let name = first.create_unique_name(candidate, None);
                prop_assert!(!is_reserved_word(&name));
                prop_assert!(name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'));
                prop_assert!(seen.insert(name.clone()), "{} handed out twice", name);
                prop_assert_eq!(second.create_unique_name(candidate, None), name);
            }
            prop_assert_eq!(first.len(), candidates.len());
            Ok(())
        })
        .unwrap();
}

pub fn test_reserved_words_are_skipped(_backend: &mut EvalBackend) {
    let mut ns = NameSpace::new("Net", "Net");
    assert_eq!(ns.create_unique_name("self", None), "self");
    assert_eq!(ns.create_unique_name("fn", None), "fn_1");
    assert_eq!(ns.create_unique_name("None", None), "None_1");
    assert_eq!(ns.create_unique_name("f32", None), "f32_1");
    assert!(is_reserved_word("match"));
    assert!(!is_reserved_word("self"));
}

pub fn test_associate_requires_reservation(backend: &mut EvalBackend) {
    let tree = trace(&*backend, Net::new(), CallArgs::from_leaves([random_tensor(&[3, 4])]));
    let graph = tree.graph(tree.root_graph().unwrap()).unwrap();
    let a = NameOwner::Node(find_node(graph, "x"));
    let b = NameOwner::Node(find_node(graph, "p"));

    let mut ns = NameSpace::new("scratch", "Net.scratch");
    assert!(matches!(
        ns.associate_name_with_obj("foo", a),
        Err(NameSpaceError::Unreserved { .. })
    ));
    assert_eq!(ns.create_unique_name("foo", None), "foo");
    ns.associate_name_with_obj("foo", a).unwrap();
    assert_eq!(ns.owner_of("foo"), Some(a));
    assert!(matches!(
        ns.associate_name_with_obj("foo", b),
        Err(NameSpaceError::AlreadyBound { bound, .. }) if bound == a
    ));
    assert!(matches!(
        ns.unassociate_name_with_obj("foo", b),
        Err(NameSpaceError::NotOwned { .. })
    ));
    ns.unassociate_name_with_obj("foo", a).unwrap();
    assert_eq!(ns.owner_of("foo"), None);
    // a released name is free again
    assert!(!ns.is_reserved("foo"));
    assert_eq!(ns.create_unique_name("foo", Some(b)), "foo");
    assert!(matches!(
        ns.unassociate_name_with_obj("foo", a),
        Err(NameSpaceError::NotOwned { .. })
    ));

    // a name already bound to the same owner is handed back unchanged
    assert_eq!(ns.create_unique_name("bar", Some(a)), "bar");
    assert_eq!(ns.create_unique_name("bar", Some(a)), "bar");
    assert_eq!(ns.create_unique_name("bar", Some(b)), "bar_1");

    // the traced graph's own namespace binds every live node name
    let x = find_node(graph, "x");
    assert_eq!(graph.namespace().owner_of("x"), Some(NameOwner::Node(x)));
    assert!(graph.namespace().is_reserved("relu_out"));
}

pub fn test_merge_namespaces(_backend: &mut EvalBackend) {
    let mut outer = NameSpace::new("Net", "Net");
    let mut inner = NameSpace::new("Net_linear", "Net.linear");
    outer.create_unique_name("x", None);
    inner.create_unique_name("weight", None);
    inner.create_unique_name("x", None);
    outer.merge(&inner);
    assert_eq!(outer.len(), 2);
    assert!(outer.is_reserved("weight"));
    assert_eq!(outer.create_unique_name("weight", None), "weight_1");
    assert_eq!(inner.len(), 2);
}

pub fn test_re_associate_names(backend: &mut EvalBackend) {
    let mut tree = trace(&*backend, Net::new(), CallArgs::from_leaves([random_tensor(&[3, 4])]));
    let root = tree.root_graph().unwrap();
    let graph = tree.graph_mut(root).unwrap();
    let relu = find_node(graph, "relu_out");

    assert_eq!(graph.rename_node(relu, "add_out").unwrap(), "add_out_1");
    assert!(!graph.namespace().is_reserved("relu_out"));
    assert_eq!(graph.rename_node(relu, "relu_out").unwrap(), "relu_out");
    assert_eq!(graph.rename_node(relu, "add_out").unwrap(), "add_out_1");
    // slot names reserved while naming exprs go away once the namespace is rebuilt
    assert!(graph.namespace().len() > graph.nodes().count());

    graph.re_associate_name();
    assert_eq!(graph.namespace().owner_of("add_out_1"), Some(NameOwner::Node(relu)));
    assert_eq!(graph.namespace().len(), graph.nodes().count());
    assert!(graph.to_string().ends_with("return add_out_1\n}"), "{graph}");
}

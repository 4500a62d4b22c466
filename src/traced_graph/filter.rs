//! Chainable queries over the expressions and nodes of a graph and, recursively, of the graphs
//! its module calls were traced into.

use crate::ops::{Function, TensorMethod};
use crate::traced_graph::expr::{Expr, ExprKind, FunctionKind, MethodKind};
use crate::traced_graph::node::Node;
use crate::traced_graph::{ExprId, GraphId, InternalGraph, NodeId};
use std::collections::BTreeMap;

#[derive(Debug, thiserror::Error)]
pub enum FilterError {
    #[error("Expected exactly one match, found {0}")]
    NotUnique(usize),
    #[error("Graph {0:?} is not part of this module tree")]
    UnknownGraph(GraphId),
}

/// An expression together with the graph holding it.
#[derive(Debug, Clone, Copy)]
pub struct ExprRef<'a> {
    pub graph: &'a InternalGraph,
    pub id: ExprId,
}

impl<'a> ExprRef<'a> {
    pub fn expr(&self) -> &'a Expr {
        &self.graph.exprs[self.id.index()]
    }
}

/// A node together with the graph holding it.
#[derive(Debug, Clone, Copy)]
pub struct NodeRef<'a> {
    pub graph: &'a InternalGraph,
    pub id: NodeId,
}

impl<'a> NodeRef<'a> {
    pub fn node(&self) -> &'a Node {
        &self.graph.nodes[self.id.index()]
    }

    /// `<graph name>_<node name>`, the string name filters match against.
    pub fn full_name(&self) -> String {
        format!("{}_{}", self.graph.name, self.node().name)
    }
}

fn walk_exprs<'a>(
    graphs: &'a BTreeMap<GraphId, InternalGraph>,
    graph: GraphId,
    recursive: bool,
    stack: &mut Vec<GraphId>,
    out: &mut Vec<ExprRef<'a>>,
) -> Result<(), FilterError> {
    let g = graphs.get(&graph).ok_or(FilterError::UnknownGraph(graph))?;
    stack.push(graph);
    for (id, expr) in g.exprs() {
        out.push(ExprRef { graph: g, id });
        if let (true, Some(sub)) = (recursive, expr.graph) {
            if !stack.contains(&sub) {
                walk_exprs(graphs, sub, recursive, stack, out)?;
            }
        }
    }
    stack.pop();
    Ok(())
}

#[derive(Debug, Clone)]
pub struct ExprFilter<'a> {
    items: Vec<ExprRef<'a>>,
}

impl<'a> ExprFilter<'a> {
    pub fn new(
        graphs: &'a BTreeMap<GraphId, InternalGraph>,
        graph: GraphId,
        recursive: bool,
    ) -> Result<Self, FilterError> {
        let mut items = Vec::new();
        walk_exprs(graphs, graph, recursive, &mut Vec::new(), &mut items)?;
        Ok(Self { items })
    }

    fn retain(mut self, f: impl Fn(&ExprRef<'a>) -> bool) -> Self {
        self.items.retain(|x| f(x));
        self
    }

    /// `CallFunction` exprs, optionally of one library function only.
    pub fn call_function(self, func: Option<Function>) -> Self {
        self.retain(|e| match &e.expr().kind {
            ExprKind::CallFunction { func: f, .. } => match (func, f) {
                (None, _) => true,
                (Some(x), FunctionKind::Builtin(y)) => x == *y,
                (Some(_), FunctionKind::Wrapped(_)) => false,
            },
            _ => false,
        })
    }

    /// `CallFunction` exprs of the wrapped user function `name`.
    pub fn call_wrapped(self, name: &str) -> Self {
        self.retain(|e| {
            matches!(&e.expr().kind, ExprKind::CallFunction { func: FunctionKind::Wrapped(n), .. } if n == name)
        })
    }

    /// `CallMethod` exprs, optionally of one tensor method only.
    pub fn call_method(self, method: Option<TensorMethod>) -> Self {
        self.retain(|e| match &e.expr().kind {
            ExprKind::CallMethod { method: m, .. } => match (method, m) {
                (None, _) => true,
                (Some(x), MethodKind::Tensor(y)) => x == *y,
                (Some(_), MethodKind::Call) => false,
            },
            _ => false,
        })
    }

    /// Module calls (`CallMethod` of `__call__`).
    pub fn call_module(self) -> Self {
        self.retain(|e| e.expr().kind.is_module_call())
    }

    pub fn expr_id(self, ids: &[usize]) -> Self {
        self.retain(|e| ids.contains(&e.expr().id))
    }

    pub fn as_list(self) -> Vec<ExprRef<'a>> {
        self.items
    }

    pub fn as_dict(self) -> BTreeMap<usize, ExprRef<'a>> {
        self.items.into_iter().map(|e| (e.expr().id, e)).collect()
    }

    pub fn as_unique(self) -> Result<ExprRef<'a>, FilterError> {
        match self.items.as_slice() {
            [one] => Ok(*one),
            other => Err(FilterError::NotUnique(other.len())),
        }
    }

    pub fn as_count(&self) -> usize {
        self.items.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ExprRef<'a>> {
        self.items.iter()
    }
}

#[derive(Debug, Clone)]
pub struct NodeFilter<'a> {
    items: Vec<NodeRef<'a>>,
}

impl<'a> NodeFilter<'a> {
    pub fn new(
        graphs: &'a BTreeMap<GraphId, InternalGraph>,
        graph: GraphId,
        recursive: bool,
    ) -> Result<Self, FilterError> {
        let exprs = ExprFilter::new(graphs, graph, recursive)?;
        let items = exprs
            .items
            .iter()
            .flat_map(|e| {
                e.expr()
                    .outputs
                    .iter()
                    .map(move |n| NodeRef { graph: e.graph, id: *n })
            })
            .collect();
        Ok(Self { items })
    }

    fn retain(mut self, f: impl Fn(&NodeRef<'a>) -> bool) -> Self {
        self.items.retain(|x| f(x));
        self
    }

    /// Module nodes whose resolved module has type `type_name`.
    pub fn module_type(self, type_name: &str) -> Self {
        self.retain(|n| n.node().module_type() == Some(type_name))
    }

    pub fn node_id(self, ids: &[usize]) -> Self {
        self.retain(|n| ids.contains(&n.node().id))
    }

    /// Nodes whose `<graph name>_<node name>` equals `pattern` or matches it as a glob
    /// (`*`, `?`, `[...]`, `[!...]`).
    pub fn name(self, pattern: &str, ignore_case: bool) -> Self {
        self.retain(|n| {
            let name = n.full_name();
            name == pattern || glob_match(pattern, &name, ignore_case)
        })
    }

    pub fn as_list(self) -> Vec<NodeRef<'a>> {
        self.items
    }

    pub fn as_dict(self) -> BTreeMap<usize, NodeRef<'a>> {
        self.items.into_iter().map(|n| (n.node().id, n)).collect()
    }

    pub fn as_unique(self) -> Result<NodeRef<'a>, FilterError> {
        match self.items.as_slice() {
            [one] => Ok(*one),
            other => Err(FilterError::NotUnique(other.len())),
        }
    }

    pub fn as_count(&self) -> usize {
        self.items.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &NodeRef<'a>> {
        self.items.iter()
    }
}

/// Shell-style wildcard match over the whole of `text`.
pub(crate) fn glob_match(pattern: &str, text: &str, ignore_case: bool) -> bool {
    let fold = |c: char| if ignore_case { c.to_ascii_lowercase() } else { c };
    let p: Vec<char> = pattern.chars().map(fold).collect();
    let t: Vec<char> = text.chars().map(fold).collect();
    let tokens = tokenize(&p);

    // single backtrack point: the most recent `*` and the text position it currently covers up to
    let (mut pi, mut ti) = (0, 0);
    let mut star: Option<(usize, usize)> = None;
    while ti < t.len() {
        match tokens.get(pi) {
            Some(GlobToken::Star) => {
                star = Some((pi, ti));
                pi += 1;
            }
            Some(token) if token.matches(t[ti]) => {
                pi += 1;
                ti += 1;
            }
            _ => match star {
                Some((star_pi, star_ti)) => {
                    pi = star_pi + 1;
                    ti = star_ti + 1;
                    star = Some((star_pi, star_ti + 1));
                }
                None => return false,
            },
        }
    }
    tokens[pi..].iter().all(|t| matches!(t, GlobToken::Star))
}

enum GlobToken<'a> {
    Star,
    Any,
    Class { members: &'a [char], negated: bool },
    Char(char),
}

impl GlobToken<'_> {
    fn matches(&self, c: char) -> bool {
        match self {
            GlobToken::Star | GlobToken::Any => true,
            GlobToken::Char(x) => *x == c,
            GlobToken::Class { members, negated } => {
                let mut i = 0;
                let mut hit = false;
                while i < members.len() {
                    if i + 2 < members.len() && members[i + 1] == '-' {
                        hit |= members[i] <= c && c <= members[i + 2];
                        i += 3;
                    } else {
                        hit |= members[i] == c;
                        i += 1;
                    }
                }
                hit != *negated
            }
        }
    }
}

fn tokenize(p: &[char]) -> Vec<GlobToken<'_>> {
    let mut tokens = Vec::with_capacity(p.len());
    let mut i = 0;
    while i < p.len() {
        match p[i] {
            '*' => {
                // runs of `*` match the same as one
                if !matches!(tokens.last(), Some(GlobToken::Star)) {
                    tokens.push(GlobToken::Star);
                }
                i += 1;
            }
            '?' => {
                tokens.push(GlobToken::Any);
                i += 1;
            }
            '[' => match parse_class(&p[i + 1..]) {
                Some((token, len)) => {
                    tokens.push(token);
                    i += 1 + len;
                }
                // an unterminated class is a literal `[`
                None => {
                    tokens.push(GlobToken::Char('['));
                    i += 1;
                }
            },
            c => {
                tokens.push(GlobToken::Char(c));
                i += 1;
            }
        }
    }
    tokens
}

/// Parses the body of a `[...]` class, returning it and the number of chars consumed up to and
/// including the closing `]`.
fn parse_class(p: &[char]) -> Option<(GlobToken<'_>, usize)> {
    let (negated, body_start) = match p.first() {
        Some('!') => (true, 1),
        _ => (false, 0),
    };
    // `]` directly after the opening bracket is a literal member
    let close = p
        .iter()
        .enumerate()
        .skip(body_start + 1)
        .find(|(_, c)| **c == ']')
        .map(|(i, _)| i)?;
    let members = &p[body_start..close];
    Some((GlobToken::Class { members, negated }, close + 1))
}

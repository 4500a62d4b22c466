//! Structural descriptors for nested call arguments and return values.
//!
//! A call like `f(x, (y, 2), scale=0.5)` is flattened into its dynamic leaves `[x, y]` plus a
//! [`TreeDef`] recording where those leaves sit and which positions hold literals. Two calls with
//! equal `TreeDef`s have the same argument shape and may share one traced graph.

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::hash::{Hash, Hasher};

#[derive(Debug, thiserror::Error)]
pub enum TreeError {
    #[error("Tree definition expects {expected} leaves, got {got}")]
    LeafCountMismatch { expected: usize, got: usize },
    #[error("Duplicate mapping key {0}")]
    DuplicateKey(String),
    #[error("Expected a call tree of the form ((receiver, *args), kwargs), got {0}")]
    NotACallTree(TreeDef),
}

/// A literal value embedded in a tree shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Literal {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl Literal {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Literal::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Literal::Int(i) => Some(*i as f64),
            Literal::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Literal::Bool(b) => Some(*b as i64),
            Literal::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Literal::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Literal::None => "none",
            Literal::Bool(_) => "bool",
            Literal::Int(_) => "int",
            Literal::Float(_) => "float",
            Literal::Str(_) => "str",
        }
    }
}

impl PartialEq for Literal {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Literal::None, Literal::None) => true,
            (Literal::Bool(a), Literal::Bool(b)) => a == b,
            (Literal::Int(a), Literal::Int(b)) => a == b,
            // Bitwise so that argument shapes hash consistently, NaN included.
            (Literal::Float(a), Literal::Float(b)) => a.to_bits() == b.to_bits(),
            (Literal::Str(a), Literal::Str(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Literal {}

impl Hash for Literal {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Literal::None => {}
            Literal::Bool(b) => b.hash(state),
            Literal::Int(i) => i.hash(state),
            Literal::Float(f) => f.to_bits().hash(state),
            Literal::Str(s) => s.hash(state),
        }
    }
}

impl Display for Literal {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Literal::None => write!(f, "None"),
            Literal::Bool(b) => write!(f, "{b}"),
            Literal::Int(i) => write!(f, "{i}"),
            Literal::Float(x) => write!(f, "{x:?}"),
            Literal::Str(s) => write!(f, "{s:?}"),
        }
    }
}

impl From<i64> for Literal {
    fn from(v: i64) -> Self {
        Literal::Int(v)
    }
}

impl From<f64> for Literal {
    fn from(v: f64) -> Self {
        Literal::Float(v)
    }
}

impl From<bool> for Literal {
    fn from(v: bool) -> Self {
        Literal::Bool(v)
    }
}

impl From<&str> for Literal {
    fn from(v: &str) -> Self {
        Literal::Str(v.to_string())
    }
}

/// The shape of a flattened tree: where its leaves sit and which positions are literals.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TreeDef {
    Leaf,
    Const(Literal),
    Seq(Vec<TreeDef>),
    Map(Vec<(String, TreeDef)>),
}

impl TreeDef {
    pub fn num_leaves(&self) -> usize {
        match self {
            TreeDef::Leaf => 1,
            TreeDef::Const(_) => 0,
            TreeDef::Seq(items) => items.iter().map(|x| x.num_leaves()).sum(),
            TreeDef::Map(items) => items.iter().map(|(_, x)| x.num_leaves()).sum(),
        }
    }

    pub fn unflatten<T>(&self, leaves: Vec<T>) -> Result<Tree<T>, TreeError> {
        let expected = self.num_leaves();
        if leaves.len() != expected {
            return Err(TreeError::LeafCountMismatch {
                expected,
                got: leaves.len(),
            });
        }
        let mut leaves = leaves.into_iter();
        Ok(self.rebuild(&mut leaves))
    }

    fn rebuild<T>(&self, leaves: &mut impl Iterator<Item = T>) -> Tree<T> {
        match self {
            // num_leaves was checked against the iterator length up front
            TreeDef::Leaf => match leaves.next() {
                Some(x) => Tree::Leaf(x),
                None => Tree::Const(Literal::None),
            },
            TreeDef::Const(c) => Tree::Const(c.clone()),
            TreeDef::Seq(items) => Tree::Seq(items.iter().map(|x| x.rebuild(leaves)).collect()),
            TreeDef::Map(items) => Tree::Map(
                items
                    .iter()
                    .map(|(k, x)| (k.clone(), x.rebuild(leaves)))
                    .collect(),
            ),
        }
    }

    /// Splits a call tree `((receiver, *args), kwargs)` into its positional and keyword parts.
    pub fn split_call(&self) -> Option<(&[TreeDef], &[(String, TreeDef)])> {
        match self {
            TreeDef::Seq(parts) if parts.len() == 2 => match (&parts[0], &parts[1]) {
                (TreeDef::Seq(args), TreeDef::Map(kwargs)) => Some((args.as_slice(), kwargs.as_slice())),
                _ => None,
            },
            _ => None,
        }
    }
}

impl Display for TreeDef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            TreeDef::Leaf => write!(f, "*"),
            TreeDef::Const(c) => write!(f, "{c}"),
            TreeDef::Seq(items) => {
                write!(f, "(")?;
                for (i, x) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{x}")?;
                }
                write!(f, ")")
            }
            TreeDef::Map(items) => {
                write!(f, "{{")?;
                for (i, (k, x)) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k}: {x}")?;
                }
                write!(f, "}}")
            }
        }
    }
}

/// A nested value: leaves of type `T` mixed with literals, sequences and string-keyed maps.
#[derive(Debug, Clone, PartialEq)]
pub enum Tree<T> {
    Leaf(T),
    Const(Literal),
    Seq(Vec<Tree<T>>),
    Map(Vec<(String, Tree<T>)>),
}

impl<T> Tree<T> {
    /// Flattens into leaves in depth-first order. Map entries are visited in key order so that
    /// keyword order never changes the resulting [`TreeDef`].
    pub fn flatten(self) -> (Vec<T>, TreeDef) {
        let mut leaves = Vec::new();
        let def = self.flatten_into(&mut leaves);
        (leaves, def)
    }

    fn flatten_into(self, leaves: &mut Vec<T>) -> TreeDef {
        match self {
            Tree::Leaf(x) => {
                leaves.push(x);
                TreeDef::Leaf
            }
            Tree::Const(c) => TreeDef::Const(c),
            Tree::Seq(items) => TreeDef::Seq(items.into_iter().map(|x| x.flatten_into(leaves)).collect()),
            Tree::Map(mut items) => {
                items.sort_by(|a, b| a.0.cmp(&b.0));
                TreeDef::Map(
                    items
                        .into_iter()
                        .map(|(k, x)| (k, x.flatten_into(leaves)))
                        .collect(),
                )
            }
        }
    }

    pub fn leaves(&self) -> Vec<&T> {
        let mut out = Vec::new();
        self.collect_leaves(&mut out);
        out
    }

    fn collect_leaves<'a>(&'a self, out: &mut Vec<&'a T>) {
        match self {
            Tree::Leaf(x) => out.push(x),
            Tree::Const(_) => {}
            Tree::Seq(items) => items.iter().for_each(|x| x.collect_leaves(out)),
            Tree::Map(items) => items.iter().for_each(|(_, x)| x.collect_leaves(out)),
        }
    }

    pub fn map<U>(self, f: &mut impl FnMut(T) -> U) -> Tree<U> {
        match self {
            Tree::Leaf(x) => Tree::Leaf(f(x)),
            Tree::Const(c) => Tree::Const(c),
            Tree::Seq(items) => Tree::Seq(items.into_iter().map(|x| x.map(f)).collect()),
            Tree::Map(items) => Tree::Map(items.into_iter().map(|(k, x)| (k, x.map(f))).collect()),
        }
    }

    pub fn try_map<U, E>(self, f: &mut impl FnMut(T) -> Result<U, E>) -> Result<Tree<U>, E> {
        Ok(match self {
            Tree::Leaf(x) => Tree::Leaf(f(x)?),
            Tree::Const(c) => Tree::Const(c),
            Tree::Seq(items) => Tree::Seq(
                items
                    .into_iter()
                    .map(|x| x.try_map(f))
                    .collect::<Result<_, _>>()?,
            ),
            Tree::Map(items) => Tree::Map(
                items
                    .into_iter()
                    .map(|(k, x)| Ok((k, x.try_map(f)?)))
                    .collect::<Result<_, E>>()?,
            ),
        })
    }

    pub fn as_leaf(&self) -> Option<&T> {
        match self {
            Tree::Leaf(x) => Some(x),
            _ => None,
        }
    }

    pub fn into_leaf(self) -> Option<T> {
        match self {
            Tree::Leaf(x) => Some(x),
            _ => None,
        }
    }

    pub fn as_literal(&self) -> Option<&Literal> {
        match self {
            Tree::Const(c) => Some(c),
            _ => None,
        }
    }

    /// Reads a sequence of integer literals, as used for shapes and axis lists.
    pub fn as_int_list(&self) -> Option<Vec<i64>> {
        match self {
            Tree::Const(c) => c.as_i64().map(|x| vec![x]),
            Tree::Seq(items) => items.iter().map(|x| x.as_literal()?.as_i64()).collect(),
            _ => None,
        }
    }

    pub fn ints(values: &[i64]) -> Self {
        Tree::Seq(values.iter().map(|x| Tree::Const(Literal::Int(*x))).collect())
    }
}

impl<T: Display> Display for Tree<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Tree::Leaf(x) => write!(f, "{x}"),
            Tree::Const(c) => write!(f, "{c}"),
            Tree::Seq(items) => {
                write!(f, "(")?;
                for (i, x) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{x}")?;
                }
                if items.len() == 1 {
                    write!(f, ",")?;
                }
                write!(f, ")")
            }
            Tree::Map(items) => {
                write!(f, "{{")?;
                for (i, (k, x)) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k}: {x}")?;
                }
                write!(f, "}}")
            }
        }
    }
}

impl<T> From<Literal> for Tree<T> {
    fn from(c: Literal) -> Self {
        Tree::Const(c)
    }
}

impl<T> From<i64> for Tree<T> {
    fn from(v: i64) -> Self {
        Tree::Const(Literal::Int(v))
    }
}

impl<T> From<f64> for Tree<T> {
    fn from(v: f64) -> Self {
        Tree::Const(Literal::Float(v))
    }
}

impl<T> From<bool> for Tree<T> {
    fn from(v: bool) -> Self {
        Tree::Const(Literal::Bool(v))
    }
}

/// Positional and keyword arguments of one call.
#[derive(Debug, Clone, PartialEq)]
pub struct CallArgs<T> {
    pub args: Vec<Tree<T>>,
    pub kwargs: Vec<(String, Tree<T>)>,
}

impl<T> Default for CallArgs<T> {
    fn default() -> Self {
        Self {
            args: Vec::new(),
            kwargs: Vec::new(),
        }
    }
}

impl<T> CallArgs<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_leaves(values: impl IntoIterator<Item = T>) -> Self {
        Self {
            args: values.into_iter().map(Tree::Leaf).collect(),
            kwargs: Vec::new(),
        }
    }

    pub fn arg(mut self, value: impl Into<Tree<T>>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn kwarg(mut self, name: impl Into<String>, value: impl Into<Tree<T>>) -> Self {
        self.kwargs.push((name.into(), value.into()));
        self
    }

    pub fn get(&self, index: usize) -> Option<&Tree<T>> {
        self.args.get(index)
    }

    pub fn get_kwarg(&self, name: &str) -> Option<&Tree<T>> {
        self.kwargs.iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }

    /// Positional argument `index`, or the keyword `name` when not passed positionally.
    pub fn get_param(&self, index: usize, name: &str) -> Option<&Tree<T>> {
        self.get(index).or_else(|| self.get_kwarg(name))
    }

    /// Builds the canonical call tree `((receiver, *args), kwargs)`.
    pub fn into_call_tree(self, receiver: Option<T>) -> Tree<T> {
        let mut positional = Vec::with_capacity(self.args.len() + 1);
        if let Some(r) = receiver {
            positional.push(Tree::Leaf(r));
        }
        positional.extend(self.args);
        Tree::Seq(vec![Tree::Seq(positional), Tree::Map(self.kwargs)])
    }

    /// Inverse of [`CallArgs::into_call_tree`]. With `has_receiver` the first positional entry is
    /// split off as the receiver.
    pub fn from_call_tree(tree: Tree<T>, has_receiver: bool) -> Result<(Option<Tree<T>>, Self), TreeError> {
        let shape_error = |tree: Tree<T>| TreeError::NotACallTree(tree.flatten().1);
        let parts = match tree {
            Tree::Seq(parts) if parts.len() == 2 => parts,
            other => return Err(shape_error(other)),
        };
        let mut parts = parts.into_iter();
        let (positional, kwargs) = match (parts.next(), parts.next()) {
            (Some(Tree::Seq(p)), Some(Tree::Map(k))) => (p, k),
            (Some(a), Some(b)) => return Err(shape_error(Tree::Seq(vec![a, b]))),
            _ => return Err(TreeError::NotACallTree(TreeDef::Seq(vec![]))),
        };
        let mut positional = positional.into_iter();
        let receiver = if has_receiver { positional.next() } else { None };
        Ok((
            receiver,
            Self {
                args: positional.collect(),
                kwargs,
            },
        ))
    }

    pub fn map<U>(self, f: &mut impl FnMut(T) -> U) -> CallArgs<U> {
        CallArgs {
            args: self.args.into_iter().map(|x| x.map(f)).collect(),
            kwargs: self.kwargs.into_iter().map(|(k, x)| (k, x.map(f))).collect(),
        }
    }

    pub fn try_map<U, E>(self, f: &mut impl FnMut(T) -> Result<U, E>) -> Result<CallArgs<U>, E> {
        Ok(CallArgs {
            args: self
                .args
                .into_iter()
                .map(|x| x.try_map(f))
                .collect::<Result<_, _>>()?,
            kwargs: self
                .kwargs
                .into_iter()
                .map(|(k, x)| Ok((k, x.try_map(f)?)))
                .collect::<Result<_, E>>()?,
        })
    }

    pub fn check_unique_kwargs(&self) -> Result<(), TreeError> {
        for (i, (k, _)) in self.kwargs.iter().enumerate() {
            if self.kwargs[..i].iter().any(|(other, _)| other == k) {
                return Err(TreeError::DuplicateKey(k.clone()));
            }
        }
        Ok(())
    }
}

use crate::traced_graph::{GraphId, NodeId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, thiserror::Error)]
pub enum NameSpaceError {
    #[error("Name `{name}` is not reserved in namespace `{namespace}`")]
    Unreserved { name: String, namespace: String },
    #[error("Name `{name}` in namespace `{namespace}` is already bound to {bound:?}")]
    AlreadyBound {
        name: String,
        namespace: String,
        bound: NameOwner,
    },
    #[error("Name `{name}` in namespace `{namespace}` is not bound to {owner:?}")]
    NotOwned {
        name: String,
        namespace: String,
        owner: NameOwner,
    },
}

/// What a reserved name is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NameOwner {
    Node(NodeId),
    Graph(GraphId),
}

const RESERVED_WORDS: &[&str] = &[
    "Self", "abstract", "as", "async", "await", "become", "box", "break", "const", "continue",
    "crate", "do", "dyn", "else", "enum", "extern", "false", "final", "fn", "for", "gen", "if",
    "impl", "in", "let", "loop", "macro", "match", "mod", "move", "mut", "override", "priv", "pub",
    "ref", "return", "static", "struct", "super", "trait", "true", "try", "type", "typeof",
    "union", "unsafe", "unsized", "use", "virtual", "where", "while", "yield", "bool", "char",
    "str", "f32", "f64", "i8", "i16", "i32", "i64", "i128", "isize", "u8", "u16", "u32", "u64",
    "u128", "usize", "None", "Some", "inf", "nan",
];

/// Keywords and primitive type names a generated name may never take. `self` is allowed since
/// every graph names its module input that way.
pub fn is_reserved_word(name: &str) -> bool {
    RESERVED_WORDS.contains(&name)
}

/// Maps anything outside `[A-Za-z0-9_]` to `_` and guards a leading digit.
pub(crate) fn sanitize(candidate: &str) -> String {
    let mut name: String = candidate
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if name.is_empty() {
        name.push('_');
    }
    if name.starts_with(|c: char| c.is_ascii_digit()) {
        name.insert(0, '_');
    }
    name
}

/// `foo` -> `foo_1`, `foo_1` -> `foo_2`.
fn increment_suffix(name: &str) -> String {
    if let Some((base, digits)) = name.rsplit_once('_') {
        if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
            if let Some(n) = digits.parse::<u64>().ok().and_then(|n| n.checked_add(1)) {
                return format!("{base}_{n}");
            }
        }
    }
    format!("{name}_1")
}

/// `linear.weight` relative to `net` in `net.linear.weight`; empty when equal; `None` when `name`
/// is not under `prefix`.
pub fn get_suffix_name<'a>(prefix: &str, name: &'a str) -> Option<&'a str> {
    if prefix == name {
        return Some("");
    }
    name.strip_prefix(prefix)?.strip_prefix('.')
}

/// Per-scope unique name allocator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NameSpace {
    name: String,
    qualname: String,
    used_names: BTreeMap<String, Option<NameOwner>>,
}

impl NameSpace {
    pub fn new(name: &str, qualname: &str) -> Self {
        Self {
            name: name.to_string(),
            qualname: qualname.to_string(),
            used_names: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn qualname(&self) -> &str {
        &self.qualname
    }

    /// Reserves a fresh identifier derived from `candidate`, optionally binding it to `owner`.
    /// A name already bound to the same owner is returned unchanged.
    pub fn create_unique_name(&mut self, candidate: &str, owner: Option<NameOwner>) -> String {
        if let Some(owner) = owner {
            if self.used_names.get(candidate) == Some(&Some(owner)) {
                return candidate.to_string();
            }
        }
        let mut name = sanitize(candidate);
        while self.used_names.contains_key(&name) || is_reserved_word(&name) {
            name = increment_suffix(&name);
        }
        self.used_names.insert(name.clone(), owner);
        name
    }

    pub fn associate_name_with_obj(&mut self, name: &str, owner: NameOwner) -> Result<(), NameSpaceError> {
        match self.used_names.get_mut(name) {
            None => Err(NameSpaceError::Unreserved {
                name: name.to_string(),
                namespace: self.qualname.clone(),
            }),
            Some(Some(bound)) => Err(NameSpaceError::AlreadyBound {
                name: name.to_string(),
                namespace: self.qualname.clone(),
                bound: *bound,
            }),
            Some(slot) => {
                *slot = Some(owner);
                Ok(())
            }
        }
    }

    /// Unbinds `name` from `owner` and releases it, so a later `create_unique_name` may hand it
    /// out again.
    pub fn unassociate_name_with_obj(&mut self, name: &str, owner: NameOwner) -> Result<(), NameSpaceError> {
        match self.used_names.get(name) {
            None => Err(NameSpaceError::Unreserved {
                name: name.to_string(),
                namespace: self.qualname.clone(),
            }),
            Some(slot) if *slot == Some(owner) => {
                self.used_names.remove(name);
                Ok(())
            }
            Some(_) => Err(NameSpaceError::NotOwned {
                name: name.to_string(),
                namespace: self.qualname.clone(),
                owner,
            }),
        }
    }

    /// Unions the reservation tables. Entries of `other` win on collision.
    pub fn merge(&mut self, other: &NameSpace) {
        self.used_names
            .extend(other.used_names.iter().map(|(k, v)| (k.clone(), *v)));
    }

    pub fn owner_of(&self, name: &str) -> Option<NameOwner> {
        self.used_names.get(name).copied().flatten()
    }

    pub fn is_reserved(&self, name: &str) -> bool {
        self.used_names.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.used_names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.used_names.is_empty()
    }

    pub(crate) fn clear(&mut self) {
        self.used_names.clear();
    }
}

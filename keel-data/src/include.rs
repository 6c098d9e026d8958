//! Eager-load directives.
//!
//! A [`Navigation`] names a relation between two entity types. Includes are
//! kept in an arena-backed tree ([`IncludeTree`]): each node carries an
//! [`IncludePath`] token plus the indices of its children. Types are erased
//! at the node level and checked when a node is attached.

use serde_json::Value;
use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;

use crate::context::DbContext;
use crate::entity::Entity;
use crate::error::DataError;
use crate::query::{lookup, Body, Condition, DocumentQuery, Expr};
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relation {
    /// The source's `foreign_key` field holds the id of one target.
    Reference { foreign_key: &'static str },
    /// Every target whose `foreign_key` field holds the source's id.
    Collection { foreign_key: &'static str },
}

/// A navigation property from `F` to `T`.
///
/// ```ignore
/// const ORDERS: Navigation<User, Order> = Navigation::collection("orders", "user_id");
/// const OWNER: Navigation<Order, User> = Navigation::reference("user", "user_id");
/// ```
pub struct Navigation<F, T> {
    name: &'static str,
    relation: Relation,
    _marker: PhantomData<fn(&F) -> T>,
}

impl<F, T> Navigation<F, T> {
    pub const fn reference(name: &'static str, foreign_key: &'static str) -> Self {
        Self {
            name,
            relation: Relation::Reference { foreign_key },
            _marker: PhantomData,
        }
    }

    pub const fn collection(name: &'static str, foreign_key: &'static str) -> Self {
        Self {
            name,
            relation: Relation::Collection { foreign_key },
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn relation(&self) -> Relation {
        self.relation
    }
}

impl<F, T> Clone for Navigation<F, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<F, T> Copy for Navigation<F, T> {}

impl<F, T> fmt::Debug for Navigation<F, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Navigation")
            .field("name", &self.name)
            .field("relation", &self.relation)
            .finish()
    }
}

/// Type-erased include token: everything a backend-independent loader needs
/// to fetch and embed the related documents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncludePath {
    pub name: &'static str,
    pub relation: Relation,
    pub source_id_column: &'static str,
    pub target_kind: &'static str,
    pub target_id_column: &'static str,
    source_type: TypeId,
    target_type: TypeId,
}

impl IncludePath {
    pub fn of<F: Entity, T: Entity>(nav: Navigation<F, T>) -> Self {
        Self {
            name: nav.name,
            relation: nav.relation,
            source_id_column: F::id_column(),
            target_kind: T::table_name(),
            target_id_column: T::id_column(),
            source_type: TypeId::of::<F>(),
            target_type: TypeId::of::<T>(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncludeNode {
    pub path: IncludePath,
    pub children: Vec<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IncludeTree {
    nodes: Vec<IncludeNode>,
    roots: Vec<usize>,
    last: Option<usize>,
}

impl IncludeTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn roots(&self) -> &[usize] {
        &self.roots
    }

    pub fn node(&self, index: usize) -> &IncludeNode {
        &self.nodes[index]
    }

    /// Append a top-level include.
    pub fn push_root(&mut self, path: IncludePath) -> usize {
        let index = self.nodes.len();
        self.nodes.push(IncludeNode {
            path,
            children: Vec::new(),
        });
        self.roots.push(index);
        self.last = Some(index);
        index
    }

    /// Attach `path` under the most recently added node.
    pub fn push_child(&mut self, path: IncludePath) -> Result<usize, DataError> {
        let parent = self.last.ok_or_else(|| {
            DataError::invalid_state("include must be called before then_include")
        })?;
        if self.nodes[parent].path.target_type != path.source_type {
            return Err(DataError::InvalidState(format!(
                "then_include({}) does not start from the target of include({})",
                path.name, self.nodes[parent].path.name
            )));
        }
        let index = self.nodes.len();
        self.nodes.push(IncludeNode {
            path,
            children: Vec::new(),
        });
        self.nodes[parent].children.push(index);
        self.last = Some(index);
        Ok(index)
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.roots.clear();
        self.last = None;
    }

    /// Dotted include paths in depth-first declaration order.
    pub fn paths(&self) -> Vec<String> {
        let mut out = Vec::with_capacity(self.nodes.len());
        for &root in &self.roots {
            self.collect_paths(root, "", &mut out);
        }
        out
    }

    fn collect_paths(&self, index: usize, prefix: &str, out: &mut Vec<String>) {
        let node = &self.nodes[index];
        let path = if prefix.is_empty() {
            node.path.name.to_string()
        } else {
            format!("{prefix}.{}", node.path.name)
        };
        out.push(path.clone());
        for &child in &node.children {
            self.collect_paths(child, &path, out);
        }
    }

    /// Document kinds reached by any include, in depth-first order, without
    /// duplicates.
    pub fn kinds(&self) -> Vec<&'static str> {
        let mut out: Vec<&'static str> = Vec::new();
        let mut stack: Vec<usize> = self.roots.iter().rev().copied().collect();
        while let Some(index) = stack.pop() {
            let node = &self.nodes[index];
            if !out.contains(&node.path.target_kind) {
                out.push(node.path.target_kind);
            }
            stack.extend(node.children.iter().rev());
        }
        out
    }
}

type ResolveFuture<'a> = Pin<Box<dyn Future<Output = Result<(), DataError>> + Send + 'a>>;

/// Load every include in `tree` and embed the related documents into
/// `bodies` under each navigation's name. A reference becomes an object (or
/// `null` when the key dangles), a collection becomes an array in insertion
/// order. One query is issued per include node.
pub(crate) async fn resolve_includes<S: Store>(
    context: &DbContext<S>,
    tree: &IncludeTree,
    bodies: &mut [Body],
) -> Result<(), DataError> {
    if bodies.is_empty() {
        return Ok(());
    }
    for &root in tree.roots() {
        resolve_node(context, tree, root, bodies).await?;
    }
    Ok(())
}

fn resolve_node<'a, S: Store>(
    context: &'a DbContext<S>,
    tree: &'a IncludeTree,
    index: usize,
    parents: &'a mut [Body],
) -> ResolveFuture<'a> {
    Box::pin(async move {
        let node = tree.node(index);
        let path = &node.path;

        let (parent_key, target_key) = match path.relation {
            Relation::Reference { foreign_key } => (foreign_key, path.target_id_column),
            Relation::Collection { foreign_key } => (path.source_id_column, foreign_key),
        };

        let mut keys: Vec<Value> = Vec::new();
        for parent in parents.iter() {
            let key = lookup(parent, parent_key);
            if !key.is_null() && !keys.contains(key) {
                keys.push(key.clone());
            }
        }

        let mut related: Vec<Body> = if keys.is_empty() {
            Vec::new()
        } else {
            let query = DocumentQuery::new().filter(Some(Expr::Condition(Condition::In {
                field: target_key.to_string(),
                values: keys,
            })));
            tracing::debug!(include = path.name, kind = path.target_kind, "loading include");
            context
                .fetch(path.target_kind, &query)
                .await?
                .into_iter()
                .map(|doc| doc.body)
                .collect()
        };

        for &child in &node.children {
            resolve_node(context, tree, child, &mut related).await?;
        }

        let mut grouped: HashMap<String, Vec<Value>> = HashMap::new();
        for body in related {
            let key = lookup(&body, target_key).to_string();
            grouped.entry(key).or_default().push(Value::Object(body));
        }

        for parent in parents.iter_mut() {
            let key = lookup(parent, parent_key).to_string();
            let matched = grouped.get(&key);
            let value = match path.relation {
                Relation::Reference { .. } => matched
                    .and_then(|values| values.first().cloned())
                    .unwrap_or(Value::Null),
                Relation::Collection { .. } => Value::Array(matched.cloned().unwrap_or_default()),
            };
            parent.insert(path.name.to_string(), value);
        }
        Ok(())
    })
}

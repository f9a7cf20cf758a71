// Copyright (c) 2020-present, UMD Database Group.
//
// This program is free software: you can use, redistribute, and/or modify
// it under the terms of the GNU Affero General Public License, version 3
// or later ("AGPL"), as published by the Free Software Foundation.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or
// FITNESS FOR A PARTICULAR PURPOSE.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <http://www.gnu.org/licenses/>.

//! The schema model: a [`Graph`] of [`Node`]s carrying [`Field`]s and
//! [`Link`]s, each bound to a resolver.
//!
//! Resolvers are explicit descriptors rather than bare callables: the
//! variant says whether the engine hands them the request context or a
//! forked task set. Batching of sibling fields works on [`ResolverId`]s,
//! interned by pointer identity when the graph is built, so two fields
//! sharing one resolver instance are fetched in a single call.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::context::Context;
use crate::error::{Result, WeftError};
use crate::executor::queue::SubmitTasks;
use crate::executor::TaskValue;
use crate::query::{OptionMap, QueryItem};
use crate::value::{Ident, Value};

/// How many references a link produces per source row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cardinality {
    /// Zero or one reference; `Nothing` renders as null.
    Maybe,
    /// Exactly one reference; `Nothing` is an error.
    One,
    /// A sequence of references.
    Many,
}

/// A declared option on a field or link.
#[derive(Debug, Clone)]
pub struct OptionDef {
    /// Option name.
    pub name: String,
    /// Default value; [`Value::Nothing`] marks the option as required.
    pub default: Value,
}

impl OptionDef {
    /// An option the query must provide.
    pub fn required(name: impl Into<String>) -> Self {
        OptionDef {
            name: name.into(),
            default: Value::Nothing,
        }
    }

    /// An option substituted with `default` when the query omits it.
    pub fn with_default(name: impl Into<String>, default: Value) -> Self {
        OptionDef {
            name: name.into(),
            default,
        }
    }
}

/// Arguments handed to a field resolver.
pub struct FieldArgs {
    /// Request context, present for context-aware resolvers.
    pub ctx: Option<Context>,
    /// The batched selections this call must produce values for.
    pub fields: Vec<QueryItem>,
    /// Source row idents; `None` when resolving at the root node.
    pub ids: Option<Vec<Ident>>,
}

/// Arguments handed to a link resolver.
pub struct LinkArgs {
    /// Request context, present for context-aware resolvers.
    pub ctx: Option<Context>,
    /// Declared `requires` values: the single root value, or a sequence
    /// with one entry per source row.
    pub reqs: Option<Value>,
    /// Fully-specified option values, when the link declares options.
    pub options: Option<OptionMap>,
}

/// Synchronous resolver callable.
pub type SyncFieldFn = dyn Fn(FieldArgs) -> Result<TaskValue> + Send + Sync;
/// Asynchronous resolver callable.
pub type AsyncFieldFn =
    dyn Fn(FieldArgs) -> BoxFuture<'static, Result<TaskValue>> + Send + Sync;
/// Synchronous link resolver callable.
pub type SyncLinkFn = dyn Fn(LinkArgs) -> Result<TaskValue> + Send + Sync;
/// Asynchronous link resolver callable.
pub type AsyncLinkFn = dyn Fn(LinkArgs) -> BoxFuture<'static, Result<TaskValue>> + Send + Sync;

/// A field resolver body: runs on a worker thread or as a task on the
/// event loop, matching the executor in use.
#[derive(Clone)]
pub enum FieldFn {
    /// Blocking callable.
    Sync(Arc<SyncFieldFn>),
    /// Future-returning callable.
    Async(Arc<AsyncFieldFn>),
}

/// A link resolver body.
#[derive(Clone)]
pub enum LinkFn {
    /// Blocking callable.
    Sync(Arc<SyncLinkFn>),
    /// Future-returning callable.
    Async(Arc<AsyncLinkFn>),
}

/// Deferred row producer returned by a [`Subquery`] resolver: invoked once
/// the forked task set drains, it assembles the rows from the results of
/// the internal submissions.
pub type SubqueryProc = Box<dyn FnOnce() -> Result<Value> + Send>;

/// A resolver that schedules its own internal work instead of returning
/// rows directly.
///
/// The engine forks a child task set, hands the resolver a submission
/// scope bound to it, and pulls the rows from the returned
/// [`SubqueryProc`] once every internal task has completed.
pub trait Subquery: Send + Sync {
    /// Enqueue internal work for `fields` over `ids` and return the
    /// deferred row producer.
    fn run(
        &self,
        fields: &[QueryItem],
        ids: &[Ident],
        ctx: &Context,
        tasks: &mut dyn SubmitTasks,
    ) -> Result<SubqueryProc>;
}

/// Field resolver descriptor.
#[derive(Clone)]
pub enum FieldResolver {
    /// Plain resolver: sees only its arguments.
    Plain(FieldFn),
    /// Context-aware resolver: additionally receives the request context.
    WithContext(FieldFn),
    /// Subquery resolver, see [`Subquery`].
    Subquery(Arc<dyn Subquery>),
}

impl FieldResolver {
    /// Plain blocking resolver from a closure returning rows.
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn(FieldArgs) -> Result<Value> + Send + Sync + 'static,
    {
        FieldResolver::Plain(FieldFn::Sync(Arc::new(move |args| {
            f(args).map(TaskValue::Data)
        })))
    }

    /// Context-aware blocking resolver.
    pub fn sync_with_context<F>(f: F) -> Self
    where
        F: Fn(FieldArgs) -> Result<Value> + Send + Sync + 'static,
    {
        FieldResolver::WithContext(FieldFn::Sync(Arc::new(move |args| {
            f(args).map(TaskValue::Data)
        })))
    }

    /// Plain asynchronous resolver.
    pub fn async_fn<F, Fut>(f: F) -> Self
    where
        F: Fn(FieldArgs) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value>> + Send + 'static,
    {
        FieldResolver::Plain(FieldFn::Async(Arc::new(move |args| {
            let fut = f(args);
            Box::pin(async move { fut.await.map(TaskValue::Data) })
        })))
    }

    /// Context-aware asynchronous resolver.
    pub fn async_with_context<F, Fut>(f: F) -> Self
    where
        F: Fn(FieldArgs) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value>> + Send + 'static,
    {
        FieldResolver::WithContext(FieldFn::Async(Arc::new(move |args| {
            let fut = f(args);
            Box::pin(async move { fut.await.map(TaskValue::Data) })
        })))
    }

    /// Subquery resolver.
    pub fn subquery(subquery: Arc<dyn Subquery>) -> Self {
        FieldResolver::Subquery(subquery)
    }
}

impl fmt::Debug for FieldResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldResolver::Plain(_) => f.write_str("FieldResolver::Plain"),
            FieldResolver::WithContext(_) => f.write_str("FieldResolver::WithContext"),
            FieldResolver::Subquery(_) => f.write_str("FieldResolver::Subquery"),
        }
    }
}

/// Link resolver descriptor.
#[derive(Clone)]
pub enum LinkResolver {
    /// Plain resolver.
    Plain(LinkFn),
    /// Context-aware resolver.
    WithContext(LinkFn),
}

impl LinkResolver {
    /// Plain blocking resolver from a closure returning idents.
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn(LinkArgs) -> Result<Value> + Send + Sync + 'static,
    {
        LinkResolver::Plain(LinkFn::Sync(Arc::new(move |args| {
            f(args).map(TaskValue::Data)
        })))
    }

    /// Context-aware blocking resolver.
    pub fn sync_with_context<F>(f: F) -> Self
    where
        F: Fn(LinkArgs) -> Result<Value> + Send + Sync + 'static,
    {
        LinkResolver::WithContext(LinkFn::Sync(Arc::new(move |args| {
            f(args).map(TaskValue::Data)
        })))
    }

    /// Plain asynchronous resolver.
    pub fn async_fn<F, Fut>(f: F) -> Self
    where
        F: Fn(LinkArgs) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value>> + Send + 'static,
    {
        LinkResolver::Plain(LinkFn::Async(Arc::new(move |args| {
            let fut = f(args);
            Box::pin(async move { fut.await.map(TaskValue::Data) })
        })))
    }
}

impl fmt::Debug for LinkResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkResolver::Plain(_) => f.write_str("LinkResolver::Plain"),
            LinkResolver::WithContext(_) => f.write_str("LinkResolver::WithContext"),
        }
    }
}

/// Stable handle for a resolver instance, assigned when the graph is
/// built. Fields sharing a handle are batched into one resolver call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResolverId(u32);

/// A scalar member of a node.
#[derive(Debug, Clone)]
pub struct Field {
    /// Member name.
    pub name: String,
    /// Declared options.
    pub options: Vec<OptionDef>,
    /// Resolver descriptor.
    pub resolver: FieldResolver,
    pub(crate) resolver_id: ResolverId,
}

impl Field {
    /// A field without options.
    pub fn new(name: impl Into<String>, resolver: FieldResolver) -> Self {
        Field {
            name: name.into(),
            options: Vec::new(),
            resolver,
            resolver_id: ResolverId(u32::MAX),
        }
    }

    /// Declares options on the field.
    pub fn with_options(mut self, options: Vec<OptionDef>) -> Self {
        self.options = options;
        self
    }

    /// The batching handle assigned by [`Graph::new`].
    pub fn resolver_id(&self) -> ResolverId {
        self.resolver_id
    }
}

/// An edge member of a node.
#[derive(Debug, Clone)]
pub struct Link {
    /// Member name.
    pub name: String,
    /// Target node name.
    pub node: String,
    /// How many references the link produces.
    pub cardinality: Cardinality,
    /// Name of a sibling field whose value feeds the resolver.
    pub requires: Option<String>,
    /// Declared options.
    pub options: Vec<OptionDef>,
    /// Resolver descriptor.
    pub resolver: LinkResolver,
}

impl Link {
    /// A link without requires or options.
    pub fn new(
        name: impl Into<String>,
        node: impl Into<String>,
        cardinality: Cardinality,
        resolver: LinkResolver,
    ) -> Self {
        Link {
            name: name.into(),
            node: node.into(),
            cardinality,
            requires: None,
            options: Vec::new(),
            resolver,
        }
    }

    /// Declares the sibling field whose value feeds the resolver.
    pub fn with_requires(mut self, requires: impl Into<String>) -> Self {
        self.requires = Some(requires.into());
        self
    }

    /// Declares options on the link.
    pub fn with_options(mut self, options: Vec<OptionDef>) -> Self {
        self.options = options;
        self
    }
}

/// One member of a node.
#[derive(Debug, Clone)]
pub enum NodeItem {
    /// Scalar member.
    Field(Field),
    /// Edge member.
    Link(Link),
}

impl NodeItem {
    /// Member name.
    pub fn name(&self) -> &str {
        match self {
            NodeItem::Field(f) => &f.name,
            NodeItem::Link(l) => &l.name,
        }
    }

    /// Declared options.
    pub fn options(&self) -> &[OptionDef] {
        match self {
            NodeItem::Field(f) => &f.options,
            NodeItem::Link(l) => &l.options,
        }
    }
}

/// A named type of the graph; the root node has no name.
#[derive(Debug, Clone)]
pub struct Node {
    /// Node name, `None` for the root node.
    pub name: Option<String>,
    items: Vec<NodeItem>,
    fields_map: HashMap<String, usize>,
}

impl Node {
    /// A named node.
    pub fn new(name: impl Into<String>, items: Vec<NodeItem>) -> Self {
        Node::build(Some(name.into()), items)
    }

    /// The distinguished root node.
    pub fn root(items: Vec<NodeItem>) -> Self {
        Node::build(None, items)
    }

    fn build(name: Option<String>, items: Vec<NodeItem>) -> Self {
        let fields_map = items
            .iter()
            .enumerate()
            .map(|(idx, item)| (item.name().to_owned(), idx))
            .collect();
        Node {
            name,
            items,
            fields_map,
        }
    }

    /// True for the root node.
    pub fn is_root(&self) -> bool {
        self.name.is_none()
    }

    /// Name used in diagnostics.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("__root__")
    }

    /// Members in declared order.
    pub fn items(&self) -> &[NodeItem] {
        &self.items
    }

    /// Member lookup by name.
    pub fn item(&self, name: &str) -> Option<&NodeItem> {
        self.fields_map.get(name).map(|idx| &self.items[*idx])
    }

    /// Field member lookup; fails when the member is absent or a link.
    pub fn field(&self, name: &str) -> Result<&Field> {
        match self.item(name) {
            Some(NodeItem::Field(f)) => Ok(f),
            _ => Err(WeftError::Schema(format!(
                "node \"{}\" has no field \"{}\"",
                self.display_name(),
                name
            ))),
        }
    }

    /// Link member lookup; fails when the member is absent or a field.
    pub fn link(&self, name: &str) -> Result<&Link> {
        match self.item(name) {
            Some(NodeItem::Link(l)) => Ok(l),
            _ => Err(WeftError::Schema(format!(
                "node \"{}\" has no link \"{}\"",
                self.display_name(),
                name
            ))),
        }
    }

    fn items_mut(&mut self) -> &mut [NodeItem] {
        &mut self.items
    }
}

/// The schema: named nodes plus the distinguished root node.
///
/// Constructed once and shared across requests behind an `Arc`.
#[derive(Debug)]
pub struct Graph {
    nodes: Vec<Node>,
    root: Node,
    nodes_map: HashMap<String, usize>,
}

impl Graph {
    /// Builds a graph from its nodes. Exactly one node must be the root
    /// (built with [`Node::root`]); named nodes must be unique. Resolver
    /// handles are interned here: fields constructed from clones of the
    /// same resolver descriptor receive the same [`ResolverId`].
    pub fn new(nodes: Vec<Node>) -> Result<Graph> {
        let mut root = None;
        let mut named = Vec::new();
        let mut nodes_map = HashMap::new();
        for node in nodes {
            match &node.name {
                None => {
                    if root.replace(node).is_some() {
                        return Err(WeftError::Schema(
                            "graph defines more than one root node".to_owned(),
                        ));
                    }
                }
                Some(name) => {
                    if nodes_map.insert(name.clone(), named.len()).is_some() {
                        return Err(WeftError::Schema(format!(
                            "graph defines node \"{}\" more than once",
                            name
                        )));
                    }
                    named.push(node);
                }
            }
        }
        let root = root.ok_or_else(|| {
            WeftError::Schema("graph does not define a root node".to_owned())
        })?;

        let mut graph = Graph {
            nodes: named,
            root,
            nodes_map,
        };
        graph.assign_resolver_ids();
        Ok(graph)
    }

    fn assign_resolver_ids(&mut self) {
        let mut interned: HashMap<(u8, usize), ResolverId> = HashMap::new();
        let mut next = 0u32;
        let mut assign = |field: &mut Field| {
            let key = resolver_key(&field.resolver);
            let id = *interned.entry(key).or_insert_with(|| {
                let id = ResolverId(next);
                next += 1;
                id
            });
            field.resolver_id = id;
        };
        for node in self
            .nodes
            .iter_mut()
            .chain(std::iter::once(&mut self.root))
        {
            for item in node.items_mut() {
                if let NodeItem::Field(field) = item {
                    assign(field);
                }
            }
        }
    }

    /// The root node.
    pub fn root(&self) -> &Node {
        &self.root
    }

    /// Named node lookup.
    pub fn node(&self, name: &str) -> Result<&Node> {
        self.nodes_map
            .get(name)
            .map(|idx| &self.nodes[*idx])
            .ok_or_else(|| {
                WeftError::Schema(format!("graph has no node \"{}\"", name))
            })
    }

    /// Named nodes in declaration order.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }
}

fn resolver_key(resolver: &FieldResolver) -> (u8, usize) {
    match resolver {
        FieldResolver::Plain(FieldFn::Sync(f)) => (0, Arc::as_ptr(f) as *const () as usize),
        FieldResolver::Plain(FieldFn::Async(f)) => (1, Arc::as_ptr(f) as *const () as usize),
        FieldResolver::WithContext(FieldFn::Sync(f)) => {
            (2, Arc::as_ptr(f) as *const () as usize)
        }
        FieldResolver::WithContext(FieldFn::Async(f)) => {
            (3, Arc::as_ptr(f) as *const () as usize)
        }
        FieldResolver::Subquery(s) => (4, Arc::as_ptr(s) as *const () as usize),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_fields() -> FieldResolver {
        FieldResolver::sync(|_| Ok(Value::Seq(vec![])))
    }

    #[test]
    fn shared_resolvers_intern_to_one_id() {
        let shared = noop_fields();
        let other = noop_fields();
        let node = Node::new(
            "User",
            vec![
                NodeItem::Field(Field::new("id", shared.clone())),
                NodeItem::Field(Field::new("name", shared)),
                NodeItem::Field(Field::new("photo", other)),
            ],
        );
        let graph = Graph::new(vec![node, Node::root(vec![])]).unwrap();
        let user = graph.node("User").unwrap();
        let id = user.field("id").unwrap().resolver_id();
        let name = user.field("name").unwrap().resolver_id();
        let photo = user.field("photo").unwrap().resolver_id();
        assert_eq!(id, name);
        assert_ne!(id, photo);
    }

    #[test]
    fn graph_requires_exactly_one_root() {
        assert!(matches!(
            Graph::new(vec![Node::new("User", vec![])]).unwrap_err(),
            WeftError::Schema(_)
        ));
        assert!(matches!(
            Graph::new(vec![Node::root(vec![]), Node::root(vec![])]).unwrap_err(),
            WeftError::Schema(_)
        ));
    }

    #[test]
    fn duplicate_node_names_are_rejected() {
        let err = Graph::new(vec![
            Node::new("User", vec![]),
            Node::new("User", vec![]),
            Node::root(vec![]),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn member_lookups() {
        let node = Node::new(
            "Product",
            vec![
                NodeItem::Field(Field::new("name", noop_fields())),
                NodeItem::Link(Link::new(
                    "company",
                    "Company",
                    Cardinality::One,
                    LinkResolver::sync(|_| Ok(Value::Int(1))),
                )
                .with_requires("company_id")),
            ],
        );
        assert!(node.field("name").is_ok());
        assert!(node.field("company").is_err());
        assert!(node.link("company").is_ok());
        assert_eq!(node.link("company").unwrap().requires.as_deref(), Some("company_id"));
        assert!(node.link("name").is_err());
    }
}

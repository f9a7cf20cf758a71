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

//! The query workflow and the engine facade.
//!
//! A request walks the query tree top-down. At every node the selections
//! are split into field groups (batched by resolver identity) and links;
//! groups are submitted to the executor at once, links wait only for the
//! resolver producing their `requires` value. Completions write into the
//! [`Index`] and recurse through links until the queue drains, then the
//! frozen index is wrapped in a [`Proxy`].
//!
//! Control flow between completions is expressed as [`Step`] values
//! registered as queue callbacks and interpreted by
//! [`QueryWorkflow::run_step`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use log::{debug, warn};

use crate::cache::{collect_entries, query_hash, update_index, Cache, CachedEntry};
use crate::context::Context;
use crate::error::{Result, WeftError};
use crate::executor::queue::{Dep, Queue, TaskSetId, Workflow};
use crate::executor::{
    process, process_blocking, ExecutionMode, Executor, Submission, Task, TaskValue,
};
use crate::graph::{
    Cardinality, Field, FieldArgs, FieldFn, FieldResolver, Graph, Link, LinkArgs, LinkFn,
    LinkResolver, Node, NodeItem, ResolverId, SubqueryProc,
};
use crate::query::{init_options, QueryField, QueryItem, QueryLink, QueryNode};
use crate::result::{Index, Proxy};
use crate::value::{ident_of, Ident, Value};

/// One segment of a workflow path: the root entry, then the storage slot
/// of every link traversed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PathSeg {
    /// The request entry point.
    Root,
    /// A traversed link, identified by its `index_key`.
    Link(String),
}

/// Position of a node in the traversal.
pub type NodePath = Vec<PathSeg>;

fn child_path(path: &NodePath, link: &QueryLink) -> NodePath {
    let mut child = path.clone();
    child.push(PathSeg::Link(link.index_key.clone()));
    child
}

/// Where a field group's rows come from.
pub enum FieldsSource {
    /// A plain resolver submission.
    Task(Submission),
    /// A subquery's deferred row producer, ready once its task set drained.
    Forked(SubqueryProc),
}

/// A continuation fired by the queue when its dependency completes.
pub enum Step {
    /// Validate and store the rows of a completed field group.
    StoreFields {
        path: NodePath,
        node: Option<String>,
        items: Vec<QueryItem>,
        ids: Option<Vec<Ident>>,
        source: FieldsSource,
    },
    /// Schedule a link whose `requires` value is now in the index.
    ScheduleLink {
        path: NodePath,
        node: Option<String>,
        query_link: QueryLink,
        ids: Option<Vec<Ident>>,
    },
    /// Validate and store a completed link, then recurse.
    StoreLink {
        path: NodePath,
        node: Option<String>,
        query_link: QueryLink,
        ids: Option<Vec<Ident>>,
        dep: Submission,
    },
    /// Schedule the next step of an ordered node.
    OrderedNext {
        path: NodePath,
        node: Option<String>,
        ids: Option<Vec<Ident>>,
        steps: VecDeque<OrderedStep>,
    },
}

/// One sequential step of an ordered node.
pub enum OrderedStep {
    /// A run of adjacent selections sharing a resolver.
    Fields {
        resolver: FieldResolver,
        items: Vec<QueryItem>,
    },
    /// A single link.
    Link { query_link: QueryLink },
}

/// Work to run once a subtree completes.
enum DoneStep {
    /// Serialize the fresh subtrees of a cached link and submit the
    /// write-back.
    WriteCache {
        node: String,
        query_link: QueryLink,
        ids: Vec<Ident>,
        ttl: u32,
    },
}

fn node_of<'a>(graph: &'a Graph, name: &Option<String>) -> Result<&'a Node> {
    match name {
        None => Ok(graph.root()),
        Some(name) => graph.node(name),
    }
}

struct FieldGroup {
    id: ResolverId,
    resolver: FieldResolver,
    items: Vec<QueryItem>,
}

struct SplitOutput {
    groups: Vec<FieldGroup>,
    links: Vec<QueryLink>,
    resolver_of: HashMap<String, ResolverId>,
}

fn add_to_group(
    out: &mut SplitOutput,
    group_of: &mut HashMap<ResolverId, usize>,
    field: &Field,
    item: QueryItem,
) {
    out.resolver_of
        .insert(field.name.clone(), field.resolver_id());
    let idx = *group_of.entry(field.resolver_id()).or_insert_with(|| {
        out.groups.push(FieldGroup {
            id: field.resolver_id(),
            resolver: field.resolver.clone(),
            items: Vec::new(),
        });
        out.groups.len() - 1
    });
    let group = &mut out.groups[idx];
    if group.items.iter().all(|i| i.index_key() != item.index_key()) {
        group.items.push(item);
    }
}

/// Partitions an unordered selection set into field groups keyed by
/// resolver identity and a list of links. A link's `requires` field is
/// implicitly added to the batch so its value is in the index before the
/// link resolver runs.
fn split_query(node: &Node, query: &QueryNode) -> Result<SplitOutput> {
    let mut out = SplitOutput {
        groups: Vec::new(),
        links: Vec::new(),
        resolver_of: HashMap::new(),
    };
    let mut group_of = HashMap::new();
    for item in query.items() {
        match item {
            QueryItem::Field(query_field) => {
                let field = node.field(&query_field.name)?;
                add_to_group(&mut out, &mut group_of, field, item.clone());
            }
            QueryItem::Link(query_link) => match node.item(&query_link.name) {
                Some(NodeItem::Link(link)) => {
                    if let Some(requires) = &link.requires {
                        let required = node.field(requires)?;
                        add_to_group(
                            &mut out,
                            &mut group_of,
                            required,
                            QueryItem::Field(QueryField::new(requires.clone())),
                        );
                    }
                    out.links.push(query_link.clone());
                }
                // a link selection over a schema field is a complex field
                Some(NodeItem::Field(field)) => {
                    add_to_group(&mut out, &mut group_of, field, item.clone());
                }
                None => {
                    return Err(WeftError::Schema(format!(
                        "node \"{}\" has no member \"{}\"",
                        node.display_name(),
                        query_link.name
                    )))
                }
            },
        }
    }
    Ok(out)
}

fn push_ordered_field(
    steps: &mut VecDeque<OrderedStep>,
    current: &mut Option<ResolverId>,
    field: &Field,
    item: QueryItem,
) {
    if *current == Some(field.resolver_id()) {
        if let Some(OrderedStep::Fields { items, .. }) = steps.back_mut() {
            if items.iter().all(|i| i.index_key() != item.index_key()) {
                items.push(item);
            }
            return;
        }
    }
    steps.push_back(OrderedStep::Fields {
        resolver: field.resolver.clone(),
        items: vec![item],
    });
    *current = Some(field.resolver_id());
}

/// Groups an ordered selection set into sequential steps: adjacent
/// selections sharing a resolver form one run, links break runs.
fn group_query(node: &Node, query: &QueryNode) -> Result<VecDeque<OrderedStep>> {
    let mut steps = VecDeque::new();
    let mut current: Option<ResolverId> = None;
    for item in query.items() {
        match item {
            QueryItem::Field(query_field) => {
                let field = node.field(&query_field.name)?;
                push_ordered_field(&mut steps, &mut current, field, item.clone());
            }
            QueryItem::Link(query_link) => match node.item(&query_link.name) {
                Some(NodeItem::Link(link)) => {
                    if let Some(requires) = &link.requires {
                        let required = node.field(requires)?;
                        push_ordered_field(
                            &mut steps,
                            &mut current,
                            required,
                            QueryItem::Field(QueryField::new(requires.clone())),
                        );
                    }
                    steps.push_back(OrderedStep::Link {
                        query_link: query_link.clone(),
                    });
                    current = None;
                }
                Some(NodeItem::Field(field)) => {
                    push_ordered_field(&mut steps, &mut current, field, item.clone());
                }
                None => {
                    return Err(WeftError::Schema(format!(
                        "node \"{}\" has no member \"{}\"",
                        node.display_name(),
                        query_link.name
                    )))
                }
            },
        }
    }
    Ok(steps)
}

fn shape_error(expected: String, returned: &Value) -> WeftError {
    WeftError::ResolverShape {
        expected,
        returned: returned.describe(),
        hint: None,
    }
}

/// Validates the shape of a field resolver result and writes each row
/// into the index under the corresponding storage slot.
fn store_fields(
    index: &mut Index,
    node: &Node,
    items: &[QueryItem],
    ids: &Option<Vec<Ident>>,
    result: Value,
) -> Result<()> {
    match (&node.name, ids) {
        (Some(name), Some(ids)) => {
            let expected = || {
                format!(
                    "sequence (len: {}) of sequences (len: {})",
                    ids.len(),
                    items.len()
                )
            };
            let rows = match result {
                Value::Seq(rows) if rows.len() == ids.len() => rows,
                other => return Err(shape_error(expected(), &other)),
            };
            for (id, row) in ids.iter().zip(rows) {
                let values = match row {
                    Value::Seq(values) if values.len() == items.len() => values,
                    other => return Err(shape_error(expected(), &other)),
                };
                let record = index.get_or_insert(name, id);
                for (item, value) in items.iter().zip(values) {
                    record.insert(item.index_key().to_owned(), value);
                }
            }
            Ok(())
        }
        (None, None) => {
            let values = match result {
                Value::Seq(values) if values.len() == items.len() => values,
                other => {
                    return Err(shape_error(
                        format!("sequence (len: {})", items.len()),
                        &other,
                    ))
                }
            };
            for (item, value) in items.iter().zip(values) {
                index.root_mut().insert(item.index_key().to_owned(), value);
            }
            Ok(())
        }
        _ => Err(WeftError::Internal(
            "ids must be provided exactly for named nodes".to_owned(),
        )),
    }
}

/// Converts one resolver-produced element into the stored link value.
fn link_value(link: &Link, element: &Value) -> Result<Value> {
    match link.cardinality {
        Cardinality::Maybe => match element {
            Value::Nothing => Ok(Value::Null),
            other => Ok(Value::Ref(crate::result::Reference {
                node: link.node.clone(),
                ident: ident_of(other)?,
            })),
        },
        Cardinality::One => match element {
            Value::Nothing => Err(WeftError::NullNonOptional(format!(
                "link \"{}\" resolved to Nothing",
                link.name
            ))),
            other => Ok(Value::Ref(crate::result::Reference {
                node: link.node.clone(),
                ident: ident_of(other)?,
            })),
        },
        Cardinality::Many => match element {
            Value::Seq(items) => Ok(Value::Seq(
                items
                    .iter()
                    .map(|item| {
                        Ok(Value::Ref(crate::result::Reference {
                            node: link.node.clone(),
                            ident: ident_of(item)?,
                        }))
                    })
                    .collect::<Result<Vec<_>>>()?,
            )),
            other => Err(shape_error("sequence of hashable idents".to_owned(), other)),
        },
    }
}

/// Validates the shape of a link resolver result against the link's
/// cardinality and writes references into the index.
fn store_links(
    index: &mut Index,
    node: &Node,
    link: &Link,
    query_link: &QueryLink,
    ids: &Option<Vec<Ident>>,
    result: &Value,
) -> Result<()> {
    match (&node.name, ids) {
        (Some(name), Some(ids)) if link.requires.is_some() => {
            let expected = || match link.cardinality {
                Cardinality::Many => format!(
                    "sequence (len: {}) of sequences of hashable idents",
                    ids.len()
                ),
                _ => format!("sequence (len: {}) of hashable idents", ids.len()),
            };
            let elements = match result {
                Value::Seq(elements) if elements.len() == ids.len() => elements,
                other => return Err(shape_error(expected(), other)),
            };
            for (id, element) in ids.iter().zip(elements) {
                let stored = link_value(link, element)?;
                index
                    .get_or_insert(name, id)
                    .insert(query_link.index_key.clone(), stored);
            }
            Ok(())
        }
        (Some(name), Some(ids)) => {
            // no requires: a single result shared by every source row
            let stored = link_value(link, result)?;
            for id in ids {
                index
                    .get_or_insert(name, id)
                    .insert(query_link.index_key.clone(), stored.clone());
            }
            Ok(())
        }
        (None, None) => {
            let stored = link_value(link, result)?;
            index
                .root_mut()
                .insert(query_link.index_key.clone(), stored);
            Ok(())
        }
        _ => Err(WeftError::Internal(
            "ids must be provided exactly for named nodes".to_owned(),
        )),
    }
}

/// Reduces a validated link result to the flat list of target idents the
/// recursion continues with.
fn link_result_to_ids(from_list: bool, link: &Link, result: &Value) -> Result<Vec<Ident>> {
    let collect_one = |element: &Value| -> Result<Vec<Ident>> {
        match (link.cardinality, element) {
            (Cardinality::Maybe, Value::Nothing) => Ok(Vec::new()),
            (Cardinality::One, Value::Nothing) => Err(WeftError::NullNonOptional(format!(
                "link \"{}\" resolved to Nothing",
                link.name
            ))),
            (Cardinality::Many, Value::Seq(items)) => {
                items.iter().map(ident_of).collect::<Result<Vec<_>>>()
            }
            (Cardinality::Many, other) => {
                Err(shape_error("sequence of hashable idents".to_owned(), other))
            }
            (_, other) => Ok(vec![ident_of(other)?]),
        }
    };
    if from_list {
        let elements = match result {
            Value::Seq(elements) => elements,
            other => return Err(shape_error("sequence".to_owned(), other)),
        };
        let mut ids = Vec::new();
        for element in elements {
            ids.extend(collect_one(element)?);
        }
        Ok(ids)
    } else {
        collect_one(result)
    }
}

/// Reads the `requires` values for `ids` out of the index.
fn link_reqs(index: &Index, node: &str, requires: &str, ids: &[Ident]) -> Result<Vec<Value>> {
    let rows = index.node(node).ok_or_else(|| {
        WeftError::Internal(format!("no rows stored for node \"{}\"", node))
    })?;
    ids.iter()
        .map(|id| {
            rows.get(id)
                .and_then(|record| record.get(requires))
                .cloned()
                .ok_or_else(|| {
                    WeftError::Internal(format!(
                        "requires field \"{}\" is not resolved for {}[{}]",
                        requires, node, id
                    ))
                })
        })
        .collect()
}

/// Per-request orchestrator: walks the query, schedules resolvers and
/// assembles the index.
pub struct QueryWorkflow {
    graph: Arc<Graph>,
    query: Arc<QueryNode>,
    ctx: Context,
    cache: Option<Arc<dyn Cache>>,
    index: Index,
    task_set: TaskSetId,
    in_progress: HashMap<NodePath, usize>,
    done_steps: HashMap<NodePath, Vec<DoneStep>>,
}

impl QueryWorkflow {
    fn new(
        graph: Arc<Graph>,
        query: Arc<QueryNode>,
        ctx: Context,
        cache: Option<Arc<dyn Cache>>,
        task_set: TaskSetId,
    ) -> Self {
        QueryWorkflow {
            graph,
            query,
            ctx,
            cache,
            index: Index::new(),
            task_set,
            in_progress: HashMap::new(),
            done_steps: HashMap::new(),
        }
    }

    fn start(&mut self, queue: &mut Queue<Step>) -> Result<()> {
        let query = self.query.clone();
        self.process_node(queue, vec![PathSeg::Root], None, &query, None)
    }

    fn process_node(
        &mut self,
        queue: &mut Queue<Step>,
        path: NodePath,
        node_name: Option<String>,
        query: &QueryNode,
        ids: Option<Vec<Ident>>,
    ) -> Result<()> {
        let graph = Arc::clone(&self.graph);
        let node = node_of(&graph, &node_name)?;
        debug!(
            "processing node \"{}\" ({} selections) at {:?}",
            node.display_name(),
            query.items().len(),
            path
        );

        if query.is_ordered() {
            let steps = group_query(node, query)?;
            if steps.is_empty() {
                return self.finish_path(queue, &path);
            }
            *self.in_progress.entry(path.clone()).or_insert(0) += steps.len();
            return self.run_ordered(queue, path, node_name, ids, steps);
        }

        let split = split_query(node, query)?;
        let total = split.groups.len() + split.links.len();
        if total == 0 {
            return self.finish_path(queue, &path);
        }
        *self.in_progress.entry(path.clone()).or_insert(0) += total;

        let mut dep_of: HashMap<ResolverId, Dep> = HashMap::new();
        for group in split.groups {
            let dep =
                self.schedule_fields(queue, &path, &node_name, group.resolver, group.items, ids.clone())?;
            dep_of.insert(group.id, dep);
        }
        for query_link in split.links {
            let link = node.link(&query_link.name)?;
            match &link.requires {
                Some(requires) => {
                    // defer behind the resolver producing the value
                    let resolver = split.resolver_of.get(requires).ok_or_else(|| {
                        WeftError::Internal(format!(
                            "no resolver scheduled for requires field \"{}\"",
                            requires
                        ))
                    })?;
                    let dep = dep_of[resolver].clone();
                    queue.add_callback(
                        dep,
                        Step::ScheduleLink {
                            path: path.clone(),
                            node: node_name.clone(),
                            query_link,
                            ids: ids.clone(),
                        },
                    );
                }
                None => {
                    let _ = self.schedule_link(queue, &path, &node_name, query_link, ids.clone())?;
                }
            }
        }
        Ok(())
    }

    fn run_ordered(
        &mut self,
        queue: &mut Queue<Step>,
        path: NodePath,
        node_name: Option<String>,
        ids: Option<Vec<Ident>>,
        mut steps: VecDeque<OrderedStep>,
    ) -> Result<()> {
        let step = match steps.pop_front() {
            Some(step) => step,
            None => return Ok(()),
        };
        let dep = match step {
            OrderedStep::Fields { resolver, items } => Some(
                self.schedule_fields(queue, &path, &node_name, resolver, items, ids.clone())?,
            ),
            OrderedStep::Link { query_link } => {
                self.schedule_link(queue, &path, &node_name, query_link, ids.clone())?
            }
        };
        if steps.is_empty() {
            return Ok(());
        }
        match dep {
            Some(dep) => queue.add_callback(
                dep,
                Step::OrderedNext {
                    path,
                    node: node_name,
                    ids,
                    steps,
                },
            ),
            // the step resolved synchronously, continue with the next one
            None => return self.run_ordered(queue, path, node_name, ids, steps),
        }
        Ok(())
    }

    fn schedule_fields(
        &mut self,
        queue: &mut Queue<Step>,
        path: &NodePath,
        node_name: &Option<String>,
        resolver: FieldResolver,
        items: Vec<QueryItem>,
        ids: Option<Vec<Ident>>,
    ) -> Result<Dep> {
        match resolver {
            FieldResolver::Subquery(subquery) => {
                let sub_ids = ids.clone().ok_or_else(|| {
                    WeftError::Internal(
                        "subquery fields can only resolve at named nodes".to_owned(),
                    )
                })?;
                let child = queue.fork(Some(self.task_set));
                let proc = {
                    let mut scope = queue.scope(child);
                    subquery.run(&items, &sub_ids, &self.ctx, &mut scope)?
                };
                let dep = Dep::Set(child);
                queue.add_callback(
                    dep.clone(),
                    Step::StoreFields {
                        path: path.clone(),
                        node: node_name.clone(),
                        items,
                        ids,
                        source: FieldsSource::Forked(proc),
                    },
                );
                Ok(dep)
            }
            FieldResolver::Plain(func) => {
                self.submit_fields(queue, path, node_name, func, None, items, ids)
            }
            FieldResolver::WithContext(func) => {
                let ctx = self.ctx.clone();
                self.submit_fields(queue, path, node_name, func, Some(ctx), items, ids)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn submit_fields(
        &mut self,
        queue: &mut Queue<Step>,
        path: &NodePath,
        node_name: &Option<String>,
        func: FieldFn,
        ctx: Option<Context>,
        items: Vec<QueryItem>,
        ids: Option<Vec<Ident>>,
    ) -> Result<Dep> {
        let args = FieldArgs {
            ctx,
            fields: items.clone(),
            ids: ids.clone(),
        };
        let task = match func {
            FieldFn::Sync(f) => Task::Blocking(Box::new(move || f(args))),
            FieldFn::Async(f) => Task::Future(f(args)),
        };
        let submission = queue.submit(self.task_set, task);
        let dep = Dep::Task(submission.id);
        queue.add_callback(
            dep.clone(),
            Step::StoreFields {
                path: path.clone(),
                node: node_name.clone(),
                items,
                ids,
                source: FieldsSource::Task(submission),
            },
        );
        Ok(dep)
    }

    /// Submits a link resolver. With `requires`, the values are read from
    /// the index first; with `@cached`, the ids served from cache are
    /// replayed into the index and excluded from the resolver call. When
    /// every id is a cache hit nothing is submitted and `None` is
    /// returned.
    fn schedule_link(
        &mut self,
        queue: &mut Queue<Step>,
        path: &NodePath,
        node_name: &Option<String>,
        query_link: QueryLink,
        ids: Option<Vec<Ident>>,
    ) -> Result<Option<Dep>> {
        let graph = Arc::clone(&self.graph);
        let node = node_of(&graph, node_name)?;
        let link = node.link(&query_link.name)?;
        debug!("scheduling link \"{}\" at {:?}", query_link.name, path);

        let caching = query_link.cached_ttl().filter(|_| self.cache.is_some());
        if caching.is_some() {
            if node.is_root() {
                return Err(WeftError::Unsupported(
                    "caching is not supported for root-level links".to_owned(),
                ));
            }
            if link.requires.is_none() {
                return Err(WeftError::Unsupported(format!(
                    "@cached requires link \"{}\" to declare a `requires` field",
                    link.name
                )));
            }
        }

        let mut remaining_ids = ids;
        let mut reqs = None;
        if let Some(requires) = &link.requires {
            match &node.name {
                None => {
                    reqs = Some(
                        self.index
                            .root()
                            .get(requires.as_str())
                            .cloned()
                            .ok_or_else(|| {
                                WeftError::Internal(format!(
                                    "requires field \"{}\" is not resolved at the root node",
                                    requires
                                ))
                            })?,
                    );
                }
                Some(name) => {
                    let link_ids = remaining_ids.as_ref().ok_or_else(|| {
                        WeftError::Internal(
                            "ids must be provided exactly for named nodes".to_owned(),
                        )
                    })?;
                    let per_id = link_reqs(&self.index, name, requires, link_ids)?;
                    if let Some(ttl) = caching {
                        let (cached, fresh_ids, fresh_reqs) =
                            self.cache_lookup(&query_link, link_ids, &per_id);
                        if !cached.is_empty() {
                            debug!(
                                "link \"{}\": {} id(s) served from cache, {} to resolve",
                                query_link.name,
                                cached.len(),
                                fresh_ids.len()
                            );
                            update_index(&mut self.index, node, &query_link, &cached)?;
                        }
                        if fresh_ids.is_empty() {
                            // every subtree came from cache, nothing to resolve
                            self.untrack(queue, path)?;
                            return Ok(None);
                        }
                        self.done_steps
                            .entry(child_path(path, &query_link))
                            .or_default()
                            .push(DoneStep::WriteCache {
                                node: name.clone(),
                                query_link: query_link.clone(),
                                ids: fresh_ids.clone(),
                                ttl,
                            });
                        remaining_ids = Some(fresh_ids);
                        reqs = Some(Value::Seq(fresh_reqs));
                    } else {
                        reqs = Some(Value::Seq(per_id));
                    }
                }
            }
        }

        let options = if link.options.is_empty() {
            None
        } else {
            Some(query_link.options.clone())
        };
        let (func, ctx) = match &link.resolver {
            LinkResolver::Plain(func) => (func.clone(), None),
            LinkResolver::WithContext(func) => (func.clone(), Some(self.ctx.clone())),
        };
        let args = LinkArgs { ctx, reqs, options };
        let task = match func {
            LinkFn::Sync(f) => Task::Blocking(Box::new(move || f(args))),
            LinkFn::Async(f) => Task::Future(f(args)),
        };
        let submission = queue.submit(self.task_set, task);
        let dep = Dep::Task(submission.id);
        queue.add_callback(
            dep.clone(),
            Step::StoreLink {
                path: path.clone(),
                node: node_name.clone(),
                query_link,
                ids: remaining_ids,
                dep: submission,
            },
        );
        Ok(Some(dep))
    }

    /// Partitions `ids` into cache hits and misses. Adapter failures are
    /// logged and degrade to a full miss.
    fn cache_lookup(
        &self,
        query_link: &QueryLink,
        ids: &[Ident],
        reqs: &[Value],
    ) -> (Vec<(Ident, CachedEntry)>, Vec<Ident>, Vec<Value>) {
        let cache = self.cache.as_ref().expect("cache_lookup without a cache");
        let keys: Vec<String> = reqs.iter().map(|req| query_hash(query_link, req)).collect();
        let mut seen = HashSet::new();
        let unique: Vec<String> = keys
            .iter()
            .filter(|key| seen.insert((*key).clone()))
            .cloned()
            .collect();
        let found = match cache.get_many(&unique) {
            Ok(found) => found,
            Err(e) => {
                warn!(
                    "cache get_many failed, treating {} key(s) as misses: {}",
                    unique.len(),
                    e
                );
                HashMap::new()
            }
        };
        let mut cached = Vec::new();
        let mut fresh_ids = Vec::new();
        let mut fresh_reqs = Vec::new();
        for ((id, req), key) in ids.iter().zip(reqs).zip(&keys) {
            match found.get(key) {
                Some(entry) => cached.push((id.clone(), entry.clone())),
                None => {
                    fresh_ids.push(id.clone());
                    fresh_reqs.push(req.clone());
                }
            }
        }
        (cached, fresh_ids, fresh_reqs)
    }

    /// Stores a completed link and recurses into its target node.
    fn process_link(
        &mut self,
        queue: &mut Queue<Step>,
        path: NodePath,
        node_name: Option<String>,
        query_link: QueryLink,
        ids: Option<Vec<Ident>>,
        result: Value,
    ) -> Result<()> {
        let graph = Arc::clone(&self.graph);
        let node = node_of(&graph, &node_name)?;
        let link = node.link(&query_link.name)?;
        store_links(&mut self.index, node, link, &query_link, &ids, &result)?;
        let from_list = ids.is_some() && link.requires.is_some();
        let mut to_ids = link_result_to_ids(from_list, link, &result)?;
        // sources sharing a target must not resolve (and store) it twice
        let mut seen = HashSet::new();
        to_ids.retain(|id| seen.insert(id.clone()));
        let child = child_path(&path, &query_link);
        if to_ids.is_empty() {
            // nothing beneath this link, the subtree is vacuously complete;
            // pending done-steps (cache write-backs) still fire for it
            self.finish_path(queue, &child)?;
            return Ok(());
        }
        let target = link.node.clone();
        let nested = query_link.node.clone();
        self.process_node(queue, child, Some(target), &nested, Some(to_ids))
    }

    fn untrack(&mut self, queue: &mut Queue<Step>, path: &NodePath) -> Result<()> {
        let count = self.in_progress.get_mut(path).ok_or_else(|| {
            WeftError::Internal(format!("path {:?} is not tracked", path))
        })?;
        if *count == 0 {
            return Err(WeftError::Internal(format!(
                "path {:?} is already complete",
                path
            )));
        }
        *count -= 1;
        if *count == 0 {
            self.finish_path(queue, path)?;
        }
        Ok(())
    }

    /// Fires once every field group and every link subtree under `path`
    /// completed: runs the pending done-steps and releases the parent.
    fn finish_path(&mut self, queue: &mut Queue<Step>, path: &NodePath) -> Result<()> {
        debug!("subtree at {:?} complete", path);
        if let Some(steps) = self.done_steps.remove(path) {
            for step in steps {
                match step {
                    DoneStep::WriteCache {
                        node,
                        query_link,
                        ids,
                        ttl,
                    } => self.write_link_cache(queue, node, query_link, ids, ttl)?,
                }
            }
        }
        if path.len() > 1 {
            let parent = path[..path.len() - 1].to_vec();
            self.untrack(queue, &parent)?;
        }
        Ok(())
    }

    /// Serializes the freshly-resolved subtrees of a cached link and
    /// submits the write-back. The write never gates the response; it
    /// completes before the root task set drains.
    fn write_link_cache(
        &mut self,
        queue: &mut Queue<Step>,
        node_name: String,
        query_link: QueryLink,
        ids: Vec<Ident>,
        ttl: u32,
    ) -> Result<()> {
        let graph = Arc::clone(&self.graph);
        let node = graph.node(&node_name)?;
        let link = node.link(&query_link.name)?;
        let requires = link.requires.as_ref().ok_or_else(|| {
            WeftError::Internal("cached link without a requires field".to_owned())
        })?;
        let reqs = link_reqs(&self.index, &node_name, requires, &ids)?;
        let entries = collect_entries(&self.index, &graph, node, &query_link, &ids, &reqs)?;
        let cache = self
            .cache
            .clone()
            .ok_or_else(|| WeftError::Internal("cache write-back without a cache".to_owned()))?;
        debug!(
            "caching {} subtree(s) of link \"{}\" for {}s",
            entries.len(),
            query_link.name,
            ttl
        );
        queue.submit(
            self.task_set,
            Task::Blocking(Box::new(move || {
                if let Err(e) = cache.set_many(entries, ttl) {
                    warn!("cache set_many failed, skipping write-back: {}", e);
                }
                Ok(TaskValue::Data(Value::Null))
            })),
        );
        Ok(())
    }
}

impl Workflow for QueryWorkflow {
    type Step = Step;
    type Output = Proxy;

    fn run_step(&mut self, step: Step, queue: &mut Queue<Step>) -> Result<()> {
        match step {
            Step::StoreFields {
                path,
                node,
                items,
                ids,
                source,
            } => {
                let result = match source {
                    FieldsSource::Task(submission) => submission.result()?.materialize()?,
                    FieldsSource::Forked(proc) => proc()?,
                };
                let graph = Arc::clone(&self.graph);
                let target = node_of(&graph, &node)?;
                store_fields(&mut self.index, target, &items, &ids, result)?;
                self.untrack(queue, &path)
            }
            Step::ScheduleLink {
                path,
                node,
                query_link,
                ids,
            } => {
                let _ = self.schedule_link(queue, &path, &node, query_link, ids)?;
                Ok(())
            }
            Step::StoreLink {
                path,
                node,
                query_link,
                ids,
                dep,
            } => {
                let result = dep.result()?.materialize()?;
                self.process_link(queue, path, node, query_link, ids, result)
            }
            Step::OrderedNext {
                path,
                node,
                ids,
                steps,
            } => self.run_ordered(queue, path, node, ids, steps),
        }
    }

    fn finish(mut self) -> Result<Proxy> {
        self.index.finish();
        Ok(Proxy::root(Arc::new(self.index), self.query))
    }
}

/// Binds an executor and an optional cache; entry point for requests.
pub struct Engine {
    executor: Arc<dyn Executor>,
    cache: Option<Arc<dyn Cache>>,
}

impl Engine {
    /// An engine without result caching.
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        Engine {
            executor,
            cache: None,
        }
    }

    /// An engine with a link-level result cache.
    pub fn with_cache(executor: Arc<dyn Executor>, cache: Arc<dyn Cache>) -> Self {
        Engine {
            executor,
            cache: Some(cache),
        }
    }

    fn prepare(
        &self,
        graph: &Arc<Graph>,
        query: &QueryNode,
        ctx: Option<HashMap<String, Value>>,
    ) -> Result<(Queue<Step>, TaskSetId, QueryWorkflow)> {
        let query = Arc::new(init_options(graph, query)?);
        let mut queue = Queue::new(self.executor.clone());
        let task_set = queue.fork(None);
        let mut workflow = QueryWorkflow::new(
            graph.clone(),
            query,
            Context::new(ctx.unwrap_or_default()),
            self.cache.clone(),
            task_set,
        );
        workflow.start(&mut queue)?;
        Ok((queue, task_set, workflow))
    }

    /// Executes `query` against `graph`, driving callback dispatch on the
    /// calling thread. Requires a [`ExecutionMode::Blocking`] executor.
    pub fn execute_sync(
        &self,
        graph: &Arc<Graph>,
        query: &QueryNode,
        ctx: Option<HashMap<String, Value>>,
    ) -> Result<Proxy> {
        if self.executor.mode() != ExecutionMode::Blocking {
            return Err(WeftError::Execution(
                "execute_sync requires a blocking executor; use execute instead".to_owned(),
            ));
        }
        let (queue, root, workflow) = self.prepare(graph, query, ctx)?;
        process_blocking(queue, workflow, root)
    }

    /// Executes `query` against `graph` cooperatively.
    pub async fn execute(
        &self,
        graph: &Arc<Graph>,
        query: &QueryNode,
        ctx: Option<HashMap<String, Value>>,
    ) -> Result<Proxy> {
        let (queue, root, workflow) = self.prepare(graph, query, ctx)?;
        process(queue, workflow, root).await
    }
}

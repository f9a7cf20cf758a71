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

//! The client query tree and the option initializer.
//!
//! A query is a tree of selections over the graph: [`QueryField`]s select
//! scalar storage slots, [`QueryLink`]s select edges and carry a nested
//! [`QueryNode`]. Before execution every query passes through
//! [`init_options`], which fills each declared option from the query or
//! from the schema default and recomputes the storage keys, producing a
//! fully-specified tree without touching the input.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use blake2::{Blake2b, Digest};

use crate::error::{Result, WeftError};
use crate::graph::{Graph, Node, NodeItem, OptionDef};
use crate::value::{hash_value, Value};

/// Option values attached to one query field or link, keyed by name.
pub type OptionMap = BTreeMap<String, Value>;

/// Storage slot for a selection: the bare name when there are no options,
/// otherwise the name tagged with a digest of the option entries, so that
/// distinct option sets on the same schema member land in distinct slots.
pub fn index_key(name: &str, options: &OptionMap) -> String {
    if options.is_empty() {
        return name.to_owned();
    }
    let mut hasher = Blake2b::new();
    for (key, value) in options {
        hasher.update((key.len() as u64).to_le_bytes());
        hasher.update(key.as_bytes());
        hash_value(value, &mut hasher);
    }
    let mut digest = base64::encode(hasher.finalize());
    digest.truncate(8);
    format!("{}[{}]", name, digest)
}

/// Directive attached to a query link.
///
/// Only `cached` is material to the engine; everything else is carried
/// through untouched and ignored.
#[derive(Debug, Clone, PartialEq)]
pub enum Directive {
    /// `@cached(ttl)`: cache the link subtree per requires-value.
    Cached {
        /// Time to live, in seconds.
        ttl: u32,
    },
    /// Any directive the engine does not recognize.
    Unknown {
        /// The directive name as written in the query.
        name: String,
    },
}

/// A scalar selection.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryField {
    /// Schema member name.
    pub name: String,
    /// Fully-specified option values.
    pub options: OptionMap,
    /// Storage slot, a pure function of name and options.
    pub index_key: String,
}

impl QueryField {
    /// A selection without options.
    pub fn new(name: impl Into<String>) -> Self {
        QueryField::with_options(name, OptionMap::new())
    }

    /// A selection with options.
    pub fn with_options(name: impl Into<String>, options: OptionMap) -> Self {
        let name = name.into();
        let index_key = index_key(&name, &options);
        QueryField {
            name,
            options,
            index_key,
        }
    }
}

/// An edge selection with a nested selection set.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryLink {
    /// Schema member name.
    pub name: String,
    /// Fully-specified option values.
    pub options: OptionMap,
    /// Storage slot, a pure function of name and options.
    pub index_key: String,
    /// Selections under the link target.
    pub node: Arc<QueryNode>,
    /// Directives written on the link.
    pub directives: Vec<Directive>,
}

impl QueryLink {
    /// An edge selection without options or directives.
    pub fn new(name: impl Into<String>, node: QueryNode) -> Self {
        let name = name.into();
        let index_key = index_key(&name, &OptionMap::new());
        QueryLink {
            name,
            options: OptionMap::new(),
            index_key,
            node: Arc::new(node),
            directives: Vec::new(),
        }
    }

    /// Replaces the option values, recomputing the storage slot.
    pub fn with_options(mut self, options: OptionMap) -> Self {
        self.index_key = index_key(&self.name, &options);
        self.options = options;
        self
    }

    /// Attaches a `@cached(ttl)` directive.
    pub fn cached(mut self, ttl: u32) -> Self {
        self.directives.push(Directive::Cached { ttl });
        self
    }

    /// The TTL of the `cached` directive, if present.
    pub fn cached_ttl(&self) -> Option<u32> {
        self.directives.iter().find_map(|d| match d {
            Directive::Cached { ttl } => Some(*ttl),
            _ => None,
        })
    }
}

/// One item of a selection set.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryItem {
    /// Scalar selection.
    Field(QueryField),
    /// Edge selection.
    Link(QueryLink),
}

impl QueryItem {
    /// The selected member name.
    pub fn name(&self) -> &str {
        match self {
            QueryItem::Field(f) => &f.name,
            QueryItem::Link(l) => &l.name,
        }
    }

    /// The storage slot of the selection.
    pub fn index_key(&self) -> &str {
        match self {
            QueryItem::Field(f) => &f.index_key,
            QueryItem::Link(l) => &l.index_key,
        }
    }

    /// The option values of the selection.
    pub fn options(&self) -> &OptionMap {
        match self {
            QueryItem::Field(f) => &f.options,
            QueryItem::Link(l) => &l.options,
        }
    }
}

/// An ordered selection set.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryNode {
    items: Vec<QueryItem>,
    ordered: bool,
    fields_map: HashMap<String, usize>,
}

impl QueryNode {
    /// A selection set whose siblings may run concurrently.
    pub fn unordered(items: Vec<QueryItem>) -> Self {
        QueryNode::new(items, false)
    }

    /// A selection set whose siblings run strictly one after another.
    pub fn ordered(items: Vec<QueryItem>) -> Self {
        QueryNode::new(items, true)
    }

    fn new(items: Vec<QueryItem>, ordered: bool) -> Self {
        let fields_map = items
            .iter()
            .enumerate()
            .map(|(idx, item)| (item.name().to_owned(), idx))
            .collect();
        QueryNode {
            items,
            ordered,
            fields_map,
        }
    }

    /// The selections, in declared order.
    pub fn items(&self) -> &[QueryItem] {
        &self.items
    }

    /// Whether siblings must execute sequentially.
    pub fn is_ordered(&self) -> bool {
        self.ordered
    }

    /// Selection lookup by member name.
    pub fn item(&self, name: &str) -> Option<&QueryItem> {
        self.fields_map.get(name).map(|idx| &self.items[*idx])
    }
}

/// Rewrites `query` into a fully-specified tree: every option declared by
/// the schema gets a value, either from the query or from the declared
/// default. A defaultless option with no query value fails with
/// [`WeftError::MissingRequiredOption`]. The input is not mutated.
pub fn init_options(graph: &Graph, query: &QueryNode) -> Result<QueryNode> {
    init_node(graph, graph.root(), query)
}

fn init_node(graph: &Graph, node: &Node, query: &QueryNode) -> Result<QueryNode> {
    let mut items = Vec::with_capacity(query.items().len());
    for item in query.items() {
        let member = node.item(item.name()).ok_or_else(|| {
            WeftError::Schema(format!(
                "node \"{}\" has no member \"{}\"",
                node.display_name(),
                item.name()
            ))
        })?;
        match item {
            QueryItem::Field(field) => {
                let options = fill_options(member.options(), &field.options, &field.name)?;
                items.push(QueryItem::Field(QueryField::with_options(
                    field.name.clone(),
                    options,
                )));
            }
            QueryItem::Link(link) => {
                let nested = match member {
                    // a real link recurses into the target node
                    NodeItem::Link(graph_link) => {
                        init_node(graph, graph.node(&graph_link.node)?, &link.node)?
                    }
                    // a complex field keeps its selection set as written
                    NodeItem::Field(_) => (*link.node).clone(),
                };
                let options = fill_options(member.options(), &link.options, &link.name)?;
                let rewritten = QueryLink {
                    name: link.name.clone(),
                    index_key: index_key(&link.name, &options),
                    options,
                    node: Arc::new(nested),
                    directives: link.directives.clone(),
                };
                items.push(QueryItem::Link(rewritten));
            }
        }
    }
    Ok(QueryNode::new(items, query.is_ordered()))
}

fn fill_options(
    declared: &[OptionDef],
    provided: &OptionMap,
    owner: &str,
) -> Result<OptionMap> {
    if declared.is_empty() {
        // nothing declared: options pass through as written
        return Ok(provided.clone());
    }
    let mut out = OptionMap::new();
    for def in declared {
        let value = match provided.get(&def.name) {
            Some(value) => value.clone(),
            None => match &def.default {
                Value::Nothing => {
                    return Err(WeftError::MissingRequiredOption(format!(
                        "required option \"{}\" for \"{}\" was not provided",
                        def.name, owner
                    )))
                }
                default => default.clone(),
            },
        };
        out.insert(def.name.clone(), value);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Cardinality, Field, FieldResolver, Link, LinkResolver, Node};

    fn photo_graph() -> Graph {
        let user = Node::new(
            "User",
            vec![
                NodeItem::Field(Field::new(
                    "photo",
                    FieldResolver::sync(|_| Ok(Value::Null)),
                )
                .with_options(vec![OptionDef::with_default("size", Value::Int(100))])),
                NodeItem::Field(Field::new(
                    "report",
                    FieldResolver::sync(|_| Ok(Value::Null)),
                )
                .with_options(vec![OptionDef::required("year")])),
            ],
        );
        let root = Node::root(vec![NodeItem::Link(
            Link::new(
                "user",
                "User",
                Cardinality::One,
                LinkResolver::sync(|_| Ok(Value::Int(1))),
            )
            .with_options(vec![OptionDef::required("id")]),
        )]);
        Graph::new(vec![user, root]).unwrap()
    }

    fn user_query(items: Vec<QueryItem>) -> QueryNode {
        QueryNode::unordered(vec![QueryItem::Link(
            QueryLink::new("user", QueryNode::unordered(items)).with_options(
                OptionMap::from([("id".to_owned(), Value::Int(1))]),
            ),
        )])
    }

    #[test]
    fn index_key_is_pure_and_option_sensitive() {
        let plain = OptionMap::new();
        let a = OptionMap::from([("size".to_owned(), Value::Int(50))]);
        let b = OptionMap::from([("size".to_owned(), Value::Int(100))]);
        assert_eq!(index_key("photo", &plain), "photo");
        assert_eq!(index_key("photo", &a), index_key("photo", &a));
        assert_ne!(index_key("photo", &a), index_key("photo", &b));
        assert_ne!(index_key("photo", &a), index_key("avatar", &a));
    }

    #[test]
    fn defaults_are_filled_in() {
        let graph = photo_graph();
        let query = user_query(vec![QueryItem::Field(QueryField::new("photo"))]);
        let out = init_options(&graph, &query).unwrap();

        let link = match out.item("user").unwrap() {
            QueryItem::Link(l) => l,
            _ => panic!("expected a link"),
        };
        let photo = match link.node.item("photo").unwrap() {
            QueryItem::Field(f) => f,
            _ => panic!("expected a field"),
        };
        assert_eq!(photo.options.get("size"), Some(&Value::Int(100)));
        // the slot changed because the options did
        assert_ne!(photo.index_key, "photo");
    }

    #[test]
    fn provided_options_win_over_defaults() {
        let graph = photo_graph();
        let query = user_query(vec![QueryItem::Field(QueryField::with_options(
            "photo",
            OptionMap::from([("size".to_owned(), Value::Int(50))]),
        ))]);
        let out = init_options(&graph, &query).unwrap();
        let link = match out.item("user").unwrap() {
            QueryItem::Link(l) => l,
            _ => panic!(),
        };
        assert_eq!(
            link.node.item("photo").unwrap().options().get("size"),
            Some(&Value::Int(50))
        );
    }

    #[test]
    fn missing_required_option_fails() {
        let graph = photo_graph();
        let query = user_query(vec![QueryItem::Field(QueryField::new("report"))]);
        let err = init_options(&graph, &query).unwrap_err();
        assert!(matches!(err, WeftError::MissingRequiredOption(_)));
        assert!(err.to_string().contains("year"));
    }

    #[test]
    fn input_query_is_not_mutated() {
        let graph = photo_graph();
        let query = user_query(vec![QueryItem::Field(QueryField::new("photo"))]);
        let copy = query.clone();
        init_options(&graph, &query).unwrap();
        assert_eq!(query, copy);
    }

    #[test]
    fn unknown_member_is_rejected() {
        let graph = photo_graph();
        let query = user_query(vec![QueryItem::Field(QueryField::new("nickname"))]);
        assert!(matches!(
            init_options(&graph, &query).unwrap_err(),
            WeftError::Schema(_)
        ));
    }

    #[test]
    fn unknown_directives_are_carried() {
        let node = QueryNode::unordered(vec![QueryItem::Field(QueryField::new("photo"))]);
        let mut link = QueryLink::new("user", node)
            .with_options(OptionMap::from([("id".to_owned(), Value::Int(1))]));
        link.directives.push(Directive::Unknown {
            name: "trace".to_owned(),
        });
        assert_eq!(link.cached_ttl(), None);
        let link = link.cached(30);
        assert_eq!(link.cached_ttl(), Some(30));
    }
}

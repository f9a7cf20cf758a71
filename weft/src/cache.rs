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

//! Link-level result caching.
//!
//! A link carrying `@cached(ttl)` stores the subtree resolved for each
//! `requires` value under a key derived from the query shape, the value
//! and [`CACHE_VERSION`]. On later requests the engine replays cached
//! subtrees straight into the index and only resolves the misses.
//! Payloads retain [`Reference`]s at link boundaries and are cloned on
//! read, so a replayed entry is isolated from in-place assembly.

use std::collections::HashMap;
use std::sync::Mutex;

use blake2::{Blake2b, Digest};
use serde::{Deserialize, Serialize};

use crate::error::{Result, WeftError};
use crate::graph::{Graph, Node, NodeItem};
use crate::query::{QueryItem, QueryLink, QueryNode};
use crate::result::{Index, Record, Reference};
use crate::value::{hash_value, Ident, Value};

/// Version tag embedded in every cache key; bump to invalidate across
/// deploys.
pub const CACHE_VERSION: &str = "1";

/// Key/value store with TTL, invoked at link granularity.
///
/// Both operations degrade gracefully: the engine logs failures and treats
/// them as misses/no-ops, they never fail a request.
pub trait Cache: Send + Sync {
    /// Fetches the entries stored under `keys`; absent keys are simply
    /// missing from the result.
    fn get_many(&self, keys: &[String]) -> Result<HashMap<String, CachedEntry>>;

    /// Stores `items` with a time-to-live in seconds.
    fn set_many(&self, items: HashMap<String, CachedEntry>, ttl: u32) -> Result<()>;
}

/// One cached link subtree for one `requires` value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedEntry {
    /// Exactly the value the engine would store at the source cell: a
    /// reference, null, or a sequence of references.
    pub link_refs: Value,
    /// Partial index snapshot beneath the link, references retained at
    /// link boundaries.
    pub nodes: HashMap<String, HashMap<Ident, Record>>,
}

/// Derives the cache key for `link` resolved with the `requires` value
/// `req`: a digest over every descendant selection's storage slot, the
/// stable hash of `req`, and [`CACHE_VERSION`]. Adding any field to the
/// subtree changes the key.
pub fn query_hash(link: &QueryLink, req: &Value) -> String {
    let mut hasher = Blake2b::new();
    hash_link(link, &mut hasher);
    hash_value(req, &mut hasher);
    hasher.update(CACHE_VERSION.as_bytes());
    base64::encode(hasher.finalize())
}

fn hash_link(link: &QueryLink, hasher: &mut Blake2b) {
    hasher.update(link.index_key.as_bytes());
    hash_node(&link.node, hasher);
}

fn hash_node(node: &QueryNode, hasher: &mut Blake2b) {
    for item in node.items() {
        match item {
            QueryItem::Field(field) => hasher.update(field.index_key.as_bytes()),
            QueryItem::Link(link) => hash_link(link, hasher),
        }
    }
}

fn refs_of(value: &Value) -> Vec<&Reference> {
    match value {
        Value::Ref(r) => vec![r],
        Value::Seq(items) => items
            .iter()
            .filter_map(|v| match v {
                Value::Ref(r) => Some(r),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// Serializes the freshly-populated subtrees under `query_link` into cache
/// entries, one per distinct `requires` value. Must run after the
/// workflow beneath the link's target node completed.
pub fn collect_entries(
    index: &Index,
    graph: &Graph,
    node: &Node,
    query_link: &QueryLink,
    ids: &[Ident],
    reqs: &[Value],
) -> Result<HashMap<String, CachedEntry>> {
    let node_name = node.name.as_deref().ok_or_else(|| {
        WeftError::Unsupported("caching is not supported for root-level links".to_owned())
    })?;
    let mut out = HashMap::new();
    for (id, req) in ids.iter().zip(reqs) {
        let key = query_hash(query_link, req);
        if out.contains_key(&key) {
            continue;
        }
        let record = index
            .node(node_name)
            .and_then(|rows| rows.get(id))
            .ok_or_else(|| {
                WeftError::Internal(format!("no record stored for {}[{}]", node_name, id))
            })?;
        let link_refs = record
            .get(&query_link.index_key)
            .ok_or_else(|| {
                WeftError::Internal(format!(
                    "link \"{}\" is not resolved for {}[{}]",
                    query_link.name, node_name, id
                ))
            })?
            .clone();
        let mut nodes = HashMap::new();
        for reference in refs_of(&link_refs) {
            collect_node(index, graph, reference, &query_link.node, &mut nodes)?;
        }
        out.insert(key, CachedEntry { link_refs, nodes });
    }
    Ok(out)
}

fn collect_node(
    index: &Index,
    graph: &Graph,
    reference: &Reference,
    query_node: &QueryNode,
    out: &mut HashMap<String, HashMap<Ident, Record>>,
) -> Result<()> {
    let record = index.record(reference).ok_or_else(|| {
        WeftError::Internal(format!("no record stored for {}", reference))
    })?;
    let graph_node = graph.node(&reference.node)?;

    let mut snapshot = Record::new();
    let mut nested = Vec::new();
    for item in query_node.items() {
        let value = record.get(item.index_key()).ok_or_else(|| {
            WeftError::Internal(format!(
                "field \"{}\" is not resolved for {}",
                item.name(),
                reference
            ))
        })?;
        snapshot.insert(item.index_key().to_owned(), value.clone());
        if let QueryItem::Link(query_link) = item {
            // only real links recurse; complex fields stored their record
            // inline and carry no references
            if matches!(graph_node.item(&query_link.name), Some(NodeItem::Link(_))) {
                for r in refs_of(value) {
                    nested.push((r.clone(), query_link.node.clone()));
                }
            }
        }
    }
    out.entry(reference.node.clone())
        .or_default()
        .entry(reference.ident.clone())
        .or_default()
        .extend(snapshot);

    for (r, query_node) in nested {
        collect_node(index, graph, &r, &query_node, out)?;
    }
    Ok(())
}

/// Replays cached entries into the index: writes the link value at each
/// source cell and merges the partial snapshots. The entries must already
/// be deep copies.
pub fn update_index(
    index: &mut Index,
    node: &Node,
    query_link: &QueryLink,
    entries: &[(Ident, CachedEntry)],
) -> Result<()> {
    let node_name = node.name.as_deref().ok_or_else(|| {
        WeftError::Unsupported("caching is not supported for root-level links".to_owned())
    })?;
    for (id, entry) in entries {
        index
            .get_or_insert(node_name, id)
            .insert(query_link.index_key.clone(), entry.link_refs.clone());
        for (target, rows) in &entry.nodes {
            for (ident, record) in rows {
                index.get_or_insert(target, ident).extend(record.clone());
            }
        }
    }
    Ok(())
}

/// Process-local cache adapter.
///
/// Entries live for the lifetime of the adapter; the TTL is accepted and
/// ignored. Useful in tests and single-process deployments.
#[derive(Default)]
pub struct InMemoryCache {
    store: Mutex<HashMap<String, CachedEntry>>,
}

impl InMemoryCache {
    /// An empty cache.
    pub fn new() -> Self {
        InMemoryCache::default()
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.store.lock().unwrap().len()
    }

    /// True when nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Cache for InMemoryCache {
    fn get_many(&self, keys: &[String]) -> Result<HashMap<String, CachedEntry>> {
        let store = self.store.lock().unwrap();
        Ok(keys
            .iter()
            .filter_map(|key| store.get(key).map(|e| (key.clone(), e.clone())))
            .collect())
    }

    fn set_many(&self, items: HashMap<String, CachedEntry>, _ttl: u32) -> Result<()> {
        self.store.lock().unwrap().extend(items);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Cardinality, Field, FieldResolver, Link, LinkResolver};
    use crate::query::QueryField;

    fn company_graph() -> Graph {
        let fields = FieldResolver::sync(|_| Ok(Value::Seq(vec![])));
        let company = Node::new(
            "Company",
            vec![NodeItem::Field(Field::new("name", fields.clone()))],
        );
        let product = Node::new(
            "Product",
            vec![
                NodeItem::Field(Field::new("company_id", fields)),
                NodeItem::Link(
                    Link::new(
                        "company",
                        "Company",
                        Cardinality::One,
                        LinkResolver::sync(|_| Ok(Value::Int(10))),
                    )
                    .with_requires("company_id"),
                ),
            ],
        );
        Graph::new(vec![company, product, Node::root(vec![])]).unwrap()
    }

    fn company_query_link() -> QueryLink {
        QueryLink::new(
            "company",
            QueryNode::unordered(vec![QueryItem::Field(QueryField::new("name"))]),
        )
        .cached(10)
    }

    fn populated_index() -> Index {
        let mut index = Index::new();
        let product = index.get_or_insert("Product", &Ident::Int(1));
        product.insert("company_id".to_owned(), Value::Int(10));
        product.insert(
            "company".to_owned(),
            Value::Ref(Reference::new("Company", 10)),
        );
        let company = index.get_or_insert("Company", &Ident::Int(10));
        company.insert("name".to_owned(), Value::from("apple"));
        index
    }

    #[test]
    fn query_hash_is_stable_and_shape_sensitive() {
        let link = company_query_link();
        let req = Value::Int(10);
        assert_eq!(query_hash(&link, &req), query_hash(&link, &req));
        assert_ne!(query_hash(&link, &req), query_hash(&link, &Value::Int(20)));

        let wider = QueryLink::new(
            "company",
            QueryNode::unordered(vec![
                QueryItem::Field(QueryField::new("name")),
                QueryItem::Field(QueryField::new("id")),
            ]),
        )
        .cached(10);
        assert_ne!(query_hash(&link, &req), query_hash(&wider, &req));
    }

    #[test]
    fn collect_then_update_round_trips() {
        let graph = company_graph();
        let index = populated_index();
        let node = graph.node("Product").unwrap();
        let link = company_query_link();

        let entries = collect_entries(
            &index,
            &graph,
            node,
            &link,
            &[Ident::Int(1)],
            &[Value::Int(10)],
        )
        .unwrap();
        assert_eq!(entries.len(), 1);
        let entry = entries.values().next().unwrap();
        assert_eq!(
            entry.link_refs,
            Value::Ref(Reference::new("Company", 10))
        );
        assert_eq!(
            entry.nodes["Company"][&Ident::Int(10)]["name"],
            Value::from("apple")
        );

        let mut replay = Index::new();
        update_index(
            &mut replay,
            node,
            &link,
            &[(Ident::Int(1), entry.clone())],
        )
        .unwrap();
        assert_eq!(
            replay.node("Product").unwrap()[&Ident::Int(1)]["company"],
            Value::Ref(Reference::new("Company", 10))
        );
        assert_eq!(
            replay.record(&Reference::new("Company", 10)).unwrap()["name"],
            Value::from("apple")
        );
    }

    #[test]
    fn shared_requires_values_share_one_entry() {
        let graph = company_graph();
        let mut index = populated_index();
        let product3 = index.get_or_insert("Product", &Ident::Int(3));
        product3.insert("company_id".to_owned(), Value::Int(10));
        product3.insert(
            "company".to_owned(),
            Value::Ref(Reference::new("Company", 10)),
        );
        let node = graph.node("Product").unwrap();
        let link = company_query_link();

        let entries = collect_entries(
            &index,
            &graph,
            node,
            &link,
            &[Ident::Int(1), Ident::Int(3)],
            &[Value::Int(10), Value::Int(10)],
        )
        .unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn root_links_refuse_caching() {
        let graph = company_graph();
        let link = company_query_link();
        let mut index = Index::new();
        let err = update_index(&mut index, graph.root(), &link, &[]).unwrap_err();
        assert!(matches!(err, WeftError::Unsupported(_)));
    }

    #[test]
    fn in_memory_cache_round_trips() {
        let cache = InMemoryCache::new();
        let entry = CachedEntry {
            link_refs: Value::Ref(Reference::new("Company", 10)),
            nodes: HashMap::new(),
        };
        cache
            .set_many(HashMap::from([("k1".to_owned(), entry.clone())]), 10)
            .unwrap();
        let got = cache
            .get_many(&["k1".to_owned(), "k2".to_owned()])
            .unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got["k1"], entry);
    }
}

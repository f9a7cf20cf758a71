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

//! The normalized result store and its read side.
//!
//! The [`Index`] is written exactly once per request while the workflow
//! runs, then frozen with [`Index::finish`] and shared read-only behind an
//! `Arc` by [`Proxy`] values, which follow [`Reference`]s lazily.

use std::collections::{BTreeMap, HashMap};
use std::fmt::{Display, Formatter};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WeftError};
use crate::query::{QueryItem, QueryNode};
use crate::value::{Ident, Value};

/// One stored row: `index_key` to value.
pub type Record = BTreeMap<String, Value>;

/// A symbolic edge into the index: node name plus row ident.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Reference {
    /// Target node name.
    pub node: String,
    /// Target row ident.
    pub ident: Ident,
}

impl Reference {
    /// Builds a reference to `node` addressed by `ident`.
    pub fn new(node: impl Into<String>, ident: impl Into<Ident>) -> Self {
        Reference {
            node: node.into(),
            ident: ident.into(),
        }
    }
}

impl Display for Reference {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[{}]", self.node, self.ident)
    }
}

/// Normalized per-request result store.
///
/// Two-level map `node name -> ident -> record`, plus a dedicated record
/// for the root node. Creation on first write is explicit via the
/// `get_or_insert` operations; reads never allocate.
#[derive(Debug, Default)]
pub struct Index {
    root: Record,
    nodes: HashMap<String, HashMap<Ident, Record>>,
    finished: bool,
}

impl Index {
    /// Creates an empty, writable index.
    pub fn new() -> Self {
        Index::default()
    }

    /// The root record.
    pub fn root(&self) -> &Record {
        &self.root
    }

    /// Mutable access to the root record.
    pub fn root_mut(&mut self) -> &mut Record {
        debug_assert!(!self.finished, "index is frozen");
        &mut self.root
    }

    /// The rows stored for `node`, if any were written.
    pub fn node(&self, node: &str) -> Option<&HashMap<Ident, Record>> {
        self.nodes.get(node)
    }

    /// The record a reference points at, if it was written.
    pub fn record(&self, reference: &Reference) -> Option<&Record> {
        self.nodes
            .get(&reference.node)
            .and_then(|rows| rows.get(&reference.ident))
    }

    /// Row table for `node`, created when absent.
    pub fn get_or_insert_node(&mut self, node: &str) -> &mut HashMap<Ident, Record> {
        debug_assert!(!self.finished, "index is frozen");
        self.nodes.entry(node.to_owned()).or_default()
    }

    /// Record for `(node, ident)`, created when absent.
    pub fn get_or_insert(&mut self, node: &str, ident: &Ident) -> &mut Record {
        debug_assert!(!self.finished, "index is frozen");
        self.nodes
            .entry(node.to_owned())
            .or_default()
            .entry(ident.clone())
            .or_default()
    }

    /// Freezes the index for read-only proxying.
    pub fn finish(&mut self) {
        self.finished = true;
    }

    /// True once [`Index::finish`] ran.
    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

/// A value read through a proxy.
#[derive(Debug)]
pub enum ProxyValue {
    /// A plain stored value (scalar, record, sequence, or null).
    Data(Value),
    /// A single followed reference.
    One(Proxy),
    /// A sequence of followed references.
    Many(Vec<Proxy>),
}

impl ProxyValue {
    /// The contained plain value, for callers that know the field is not
    /// a link.
    pub fn data(self) -> Result<Value> {
        match self {
            ProxyValue::Data(v) => Ok(v),
            other => Err(WeftError::Internal(format!(
                "expected a plain value, found {:?}",
                other
            ))),
        }
    }

    /// The contained proxy, for callers that know the field is a `One`
    /// link.
    pub fn one(self) -> Result<Proxy> {
        match self {
            ProxyValue::One(p) => Ok(p),
            other => Err(WeftError::Internal(format!(
                "expected a single reference, found {:?}",
                other
            ))),
        }
    }

    /// The contained proxies, for callers that know the field is a `Many`
    /// link.
    pub fn many(self) -> Result<Vec<Proxy>> {
        match self {
            ProxyValue::Many(p) => Ok(p),
            other => Err(WeftError::Internal(format!(
                "expected a sequence of references, found {:?}",
                other
            ))),
        }
    }
}

/// Lazy read-only view over a frozen [`Index`].
///
/// A proxy is scoped to one record (the root record or one referenced row)
/// and to the query node that selected it; field access goes through the
/// query node's `fields_map` to find the storage slot, and stored
/// references come back as new proxies.
#[derive(Debug, Clone)]
pub struct Proxy {
    index: Arc<Index>,
    target: Option<Reference>,
    node: Arc<QueryNode>,
}

impl Proxy {
    /// A proxy over the root record.
    pub fn root(index: Arc<Index>, node: Arc<QueryNode>) -> Self {
        Proxy {
            index,
            target: None,
            node,
        }
    }

    /// A proxy over a referenced row.
    pub fn at(index: Arc<Index>, reference: Reference, node: Arc<QueryNode>) -> Self {
        Proxy {
            index,
            target: Some(reference),
            node,
        }
    }

    /// The reference this proxy is scoped to, `None` for the root record.
    pub fn reference(&self) -> Option<&Reference> {
        self.target.as_ref()
    }

    /// Field names in the order the query declared them.
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.node.items().iter().map(|item| item.name())
    }

    fn record(&self) -> Result<&Record> {
        match &self.target {
            None => Ok(self.index.root()),
            Some(reference) => self.index.record(reference).ok_or_else(|| {
                WeftError::Internal(format!("no record stored for {}", reference))
            }),
        }
    }

    /// Resolves a selected field by name.
    pub fn get(&self, name: &str) -> Result<ProxyValue> {
        let item = self.node.item(name).ok_or_else(|| {
            WeftError::Internal(format!("field \"{}\" was not selected by the query", name))
        })?;
        let record = self.record()?;
        let value = record.get(item.index_key()).ok_or_else(|| {
            WeftError::Internal(format!("field \"{}\" is not resolved", name))
        })?;
        match (item, value) {
            (QueryItem::Link(link), Value::Ref(reference)) => Ok(ProxyValue::One(Proxy::at(
                self.index.clone(),
                reference.clone(),
                link.node.clone(),
            ))),
            (QueryItem::Link(link), Value::Seq(items))
                if items.iter().all(|v| matches!(v, Value::Ref(_))) =>
            {
                let proxies = items
                    .iter()
                    .map(|v| match v {
                        Value::Ref(reference) => {
                            Proxy::at(self.index.clone(), reference.clone(), link.node.clone())
                        }
                        _ => unreachable!(),
                    })
                    .collect();
                Ok(ProxyValue::Many(proxies))
            }
            (_, value) => Ok(ProxyValue::Data(value.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{QueryField, QueryLink};

    fn sample_index() -> Index {
        let mut index = Index::new();
        index
            .root_mut()
            .insert("product".to_owned(), Value::Ref(Reference::new("Product", 1)));
        let product = index.get_or_insert("Product", &Ident::Int(1));
        product.insert("name".to_owned(), Value::from("iphone"));
        product.insert(
            "company".to_owned(),
            Value::Ref(Reference::new("Company", 10)),
        );
        let company = index.get_or_insert("Company", &Ident::Int(10));
        company.insert("name".to_owned(), Value::from("apple"));
        index.finish();
        index
    }

    fn sample_query() -> Arc<QueryNode> {
        let company = QueryNode::unordered(vec![QueryItem::Field(QueryField::new("name"))]);
        let product = QueryNode::unordered(vec![
            QueryItem::Field(QueryField::new("name")),
            QueryItem::Link(QueryLink::new("company", company)),
        ]);
        Arc::new(QueryNode::unordered(vec![QueryItem::Link(
            QueryLink::new("product", product),
        )]))
    }

    #[test]
    fn reference_equality() {
        assert_eq!(Reference::new("User", 1), Reference::new("User", 1));
        assert_ne!(Reference::new("User", 1), Reference::new("User", 2));
        assert_ne!(Reference::new("User", 1), Reference::new("Company", 1));
    }

    #[test]
    fn get_or_insert_creates_rows_once() {
        let mut index = Index::new();
        index
            .get_or_insert("User", &Ident::Int(1))
            .insert("name".to_owned(), Value::from("steve"));
        index
            .get_or_insert("User", &Ident::Int(1))
            .insert("age".to_owned(), Value::Int(56));
        let rows = index.node("User").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[&Ident::Int(1)].len(), 2);
    }

    #[test]
    fn proxy_follows_references() {
        let index = Arc::new(sample_index());
        let root = Proxy::root(index, sample_query());

        let product = root.get("product").unwrap().one().unwrap();
        assert_eq!(
            product.get("name").unwrap().data().unwrap(),
            Value::from("iphone")
        );
        let company = product.get("company").unwrap().one().unwrap();
        assert_eq!(
            company.get("name").unwrap().data().unwrap(),
            Value::from("apple")
        );
        assert_eq!(company.reference(), Some(&Reference::new("Company", 10)));
    }

    #[test]
    fn proxy_reports_unresolved_fields() {
        let index = Arc::new(sample_index());
        let root = Proxy::root(index, sample_query());
        let product = root.get("product").unwrap().one().unwrap();
        // "company" is resolved, "price" was never selected
        assert!(product.get("price").is_err());
    }

    #[test]
    fn proxy_iterates_in_declared_order() {
        let index = Arc::new(sample_index());
        let root = Proxy::root(index, sample_query());
        let product = root.get("product").unwrap().one().unwrap();
        let names: Vec<_> = product.field_names().collect();
        assert_eq!(names, vec!["name", "company"]);
    }
}

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

//! Weft is a graph query execution engine: given a declarative schema (a
//! [`graph::Graph`]) and a client query tree (a [`query::QueryNode`]), it
//! orchestrates concurrent resolver invocations, batches sibling fields
//! sharing a resolver into single calls, threads `requires` values between
//! resolvers, assembles a normalized [`result::Index`] and exposes the
//! response through a lazy [`result::Proxy`]. Links can opt into an
//! external result cache with declarative TTLs.
//!
//! Execution is pluggable between a blocking thread pool and a
//! cooperative single-threaded backend; see [`executor`].
//!
//! ```no_run
//! use std::sync::Arc;
//! use weft::prelude::*;
//!
//! let root = Node::root(vec![NodeItem::Field(Field::new(
//!     "greeting",
//!     FieldResolver::sync(|_| Ok(Value::seq(["hello"]))),
//! ))]);
//! let graph = Arc::new(Graph::new(vec![root])?);
//! let engine = Engine::new(Arc::new(ThreadsExecutor::with_default_pool()?));
//!
//! let query = QueryNode::unordered(vec![QueryItem::Field(QueryField::new("greeting"))]);
//! let result = engine.execute_sync(&graph, &query, None)?;
//! assert_eq!(result.get("greeting")?.data()?, Value::from("hello"));
//! # Ok::<(), weft::error::WeftError>(())
//! ```

pub mod cache;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod executor;
pub mod graph;
pub mod prelude;
pub mod query;
pub mod result;
pub mod value;

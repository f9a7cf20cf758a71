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

//! A "prelude" for users of the weft crate.
//!
//! Like the standard library's prelude, this module simplifies importing of
//! common items. Unlike the standard prelude, the contents of this module
//! must be imported manually:
//!
//! ```
//! use weft::prelude::*;
//! ```

pub use crate::cache::{Cache, CachedEntry, InMemoryCache, CACHE_VERSION};
pub use crate::config::WEFT_CONF;
pub use crate::context::Context;
pub use crate::engine::{Engine, QueryWorkflow};
pub use crate::error::{Result, WeftError};
pub use crate::executor::cooperative::CooperativeExecutor;
pub use crate::executor::queue::{Dep, Queue, SubmitTasks, TaskSetId, Workflow};
pub use crate::executor::threads::ThreadsExecutor;
pub use crate::executor::{ExecutionMode, Executor, Submission, Task, TaskValue};
pub use crate::graph::{
    Cardinality, Field, FieldArgs, FieldResolver, Graph, Link, LinkArgs, LinkResolver, Node,
    NodeItem, OptionDef, ResolverId, Subquery, SubqueryProc,
};
pub use crate::query::{
    init_options, Directive, OptionMap, QueryField, QueryItem, QueryLink, QueryNode,
};
pub use crate::result::{Index, Proxy, ProxyValue, Record, Reference};
pub use crate::value::{Ident, Value};

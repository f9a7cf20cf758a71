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

//! Request-scoped execution context.
//!
//! The context is a read-only view over the mapping supplied by the caller
//! of `Engine::execute`. Resolvers declared as context-aware receive a
//! handle to it; everything else never sees it.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Result, WeftError};
use crate::value::Value;

/// Read-only view over the caller-supplied request context.
#[derive(Debug, Clone, Default)]
pub struct Context {
    vars: Arc<HashMap<String, Value>>,
}

impl Context {
    /// Wraps a caller-supplied mapping.
    pub fn new(vars: HashMap<String, Value>) -> Self {
        Context {
            vars: Arc::new(vars),
        }
    }

    /// Returns the value stored under `key`, if any.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.vars.get(key)
    }

    /// Returns the value stored under `key` or fails with
    /// [`WeftError::MissingContextKey`].
    pub fn require(&self, key: &str) -> Result<&Value> {
        self.vars.get(key).ok_or_else(|| {
            WeftError::MissingContextKey(format!(
                "key \"{}\" is not specified in the query context",
                key
            ))
        })
    }

    /// Number of entries in the context.
    pub fn len(&self) -> usize {
        self.vars.len()
    }

    /// True when the caller supplied no context.
    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

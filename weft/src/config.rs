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

//! Process-wide configuration. Values are read once from the environment
//! when `WEFT_CONF` is first dereferenced.

use lazy_static::lazy_static;

lazy_static! {
    /// Global weft settings.
    pub static ref WEFT_CONF: WeftConf = WeftConf::from_env();
}

/// Engine defaults that hosts rarely need to touch.
#[derive(Debug, Clone)]
pub struct WeftConf {
    /// Default width of the thread-pool executor.
    /// Overridden with `WEFT_WORKER_THREADS`.
    pub worker_threads: usize,
    /// TTL in seconds applied when a `@cached` directive omits it.
    /// Overridden with `WEFT_DEFAULT_CACHE_TTL`.
    pub default_cache_ttl: u32,
}

impl WeftConf {
    fn from_env() -> Self {
        WeftConf {
            worker_threads: read_env("WEFT_WORKER_THREADS").unwrap_or_else(|| {
                std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(4)
            }),
            default_cache_ttl: read_env("WEFT_DEFAULT_CACHE_TTL").unwrap_or(60),
        }
    }
}

fn read_env<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let conf = WeftConf::from_env();
        assert!(conf.worker_threads >= 1);
        assert!(conf.default_cache_ttl > 0);
    }
}

//! Per-graph environment-variable configuration, thread-local and parsed
//! once on first access (`USE_FOREACTOR`/`DEPTH_<id>`/`QUEUE_<id>`/
//! `SQE_ASYNC_FLAG_<id>`/`UTHREADS_<id>` knobs).
//!
//! Four `<PREFIX>_<graph_id>` variable families, a `DEPTH_ <= QUEUE_`
//! consistency check, and "`UTHREADS_` absent means use the io_uring
//! backend" as the default. An environment variable that merely starts with
//! one of these prefixes but isn't actually `<prefix><u32>` is skipped with
//! a `log::warn!` rather than aborting the whole process over an unrelated
//! variable that happens to share a prefix.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

/// Resolved, validated configuration for one graph id.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GraphEnvConfig {
    pub pre_issue_depth: usize,
    pub uring_queue_len: usize,
    pub sqe_async_flag: bool,
    /// `Some(n)` selects the worker-pool backend with `n` threads.
    /// `None` selects the io_uring backend.
    pub thread_pool_size: Option<usize>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("environment variable {var}{graph_id} is not set")]
    Missing { graph_id: u32, var: &'static str },

    #[error("DEPTH_{graph_id} is negative ({depth})")]
    NegativeDepth { graph_id: u32, depth: i64 },

    #[error("QUEUE_{graph_id} = {queue_len} is not in range (0, 1024]")]
    QueueLenOutOfRange { graph_id: u32, queue_len: i64 },

    #[error("graph {graph_id} has DEPTH_ {depth} > QUEUE_ {queue_len}")]
    QueueShorterThanDepth {
        graph_id: u32,
        depth: usize,
        queue_len: usize,
    },

    #[error("UTHREADS_{graph_id} = {value} must be positive")]
    NonPositiveThreadCount { graph_id: u32, value: i64 },
}

struct EnvConfig {
    use_foreactor: bool,
    depths: HashMap<u32, i64>,
    queue_lens: HashMap<u32, i64>,
    async_flags: HashMap<u32, bool>,
    pool_sizes: HashMap<u32, i64>,
}

impl EnvConfig {
    fn parse_from_process_env() -> Self {
        let use_foreactor = std::env::var("USE_FOREACTOR").as_deref() == Ok("yes");

        let mut depths = HashMap::new();
        let mut queue_lens = HashMap::new();
        let mut async_flags = HashMap::new();
        let mut pool_sizes = HashMap::new();

        for (key, val) in std::env::vars() {
            if key.is_empty() || val.is_empty() {
                continue;
            }
            if let Some(suffix) = key.strip_prefix("DEPTH_") {
                if let Some((id, n)) = parse_suffix_and_int(suffix, &val) {
                    depths.insert(id, n);
                }
            } else if let Some(suffix) = key.strip_prefix("QUEUE_") {
                if let Some((id, n)) = parse_suffix_and_int(suffix, &val) {
                    queue_lens.insert(id, n);
                }
            } else if let Some(suffix) = key.strip_prefix("SQE_ASYNC_FLAG_") {
                if let Ok(id) = suffix.parse::<u32>() {
                    async_flags.insert(id, val == "yes");
                } else {
                    log::warn!("ignoring malformed graph id in env var {key}");
                }
            } else if let Some(suffix) = key.strip_prefix("UTHREADS_") {
                if let Some((id, n)) = parse_suffix_and_int(suffix, &val) {
                    pool_sizes.insert(id, n);
                }
            }
        }

        log::debug!(
            "scg env config: use_foreactor={use_foreactor} graphs_with_depth={}",
            depths.len()
        );

        EnvConfig {
            use_foreactor,
            depths,
            queue_lens,
            async_flags,
            pool_sizes,
        }
    }

    fn graph_config(&self, graph_id: u32) -> Result<GraphEnvConfig, ConfigError> {
        let depth_raw = *self.depths.get(&graph_id).ok_or(ConfigError::Missing {
            graph_id,
            var: "DEPTH_",
        })?;
        if depth_raw < 0 {
            return Err(ConfigError::NegativeDepth {
                graph_id,
                depth: depth_raw,
            });
        }
        let pre_issue_depth = depth_raw as usize;

        let queue_raw = *self.queue_lens.get(&graph_id).ok_or(ConfigError::Missing {
            graph_id,
            var: "QUEUE_",
        })?;
        if queue_raw <= 0 || queue_raw > 1024 {
            return Err(ConfigError::QueueLenOutOfRange {
                graph_id,
                queue_len: queue_raw,
            });
        }
        let uring_queue_len = queue_raw as usize;
        if uring_queue_len < pre_issue_depth {
            return Err(ConfigError::QueueShorterThanDepth {
                graph_id,
                depth: pre_issue_depth,
                queue_len: uring_queue_len,
            });
        }

        let sqe_async_flag = self.async_flags.get(&graph_id).copied().unwrap_or(false);

        let thread_pool_size = match self.pool_sizes.get(&graph_id).copied() {
            None => None,
            Some(n) if n <= 0 => {
                return Err(ConfigError::NonPositiveThreadCount { graph_id, value: n })
            }
            Some(n) => Some(n as usize),
        };

        Ok(GraphEnvConfig {
            pre_issue_depth,
            uring_queue_len,
            sqe_async_flag,
            thread_pool_size,
        })
    }
}

fn parse_suffix_and_int(suffix: &str, val: &str) -> Option<(u32, i64)> {
    match (suffix.parse::<u32>(), val.parse::<i64>()) {
        (Ok(id), Ok(n)) => Some((id, n)),
        _ => {
            log::warn!("ignoring malformed env var value for graph id suffix {suffix:?} = {val:?}");
            None
        }
    }
}

thread_local! {
    static ENV: RefCell<Option<Rc<EnvConfig>>> = const { RefCell::new(None) };
}

fn with_env<R>(f: impl FnOnce(&EnvConfig) -> R) -> R {
    ENV.with(|cell| {
        if let Some(env) = cell.borrow().as_ref() {
            return f(env);
        }
        let parsed = Rc::new(EnvConfig::parse_from_process_env());
        let result = f(&parsed);
        *cell.borrow_mut() = Some(parsed);
        result
    })
}

/// Whether the plugin's host process opted into asynchronous pre-issue at
/// all (`USE_FOREACTOR=yes`). When `false`, every wrapped call should fall
/// straight through to the real POSIX syscall with no graph involved.
pub fn use_foreactor() -> bool {
    with_env(|env| env.use_foreactor)
}

/// Resolve and validate the full configuration for one graph id.
pub fn graph_config(graph_id: u32) -> Result<GraphEnvConfig, ConfigError> {
    with_env(|env| env.graph_config(graph_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_depth_is_an_error_not_a_default() {
        let env = EnvConfig {
            use_foreactor: true,
            depths: HashMap::new(),
            queue_lens: HashMap::new(),
            async_flags: HashMap::new(),
            pool_sizes: HashMap::new(),
        };
        assert_eq!(
            env.graph_config(7),
            Err(ConfigError::Missing { graph_id: 7, var: "DEPTH_" })
        );
    }

    #[test]
    fn queue_shorter_than_depth_is_rejected() {
        let mut env = EnvConfig {
            use_foreactor: true,
            depths: HashMap::new(),
            queue_lens: HashMap::new(),
            async_flags: HashMap::new(),
            pool_sizes: HashMap::new(),
        };
        env.depths.insert(1, 8);
        env.queue_lens.insert(1, 4);
        assert_eq!(
            env.graph_config(1),
            Err(ConfigError::QueueShorterThanDepth {
                graph_id: 1,
                depth: 8,
                queue_len: 4
            })
        );
    }

    #[test]
    fn absent_uthreads_selects_uring_backend() {
        let mut env = EnvConfig {
            use_foreactor: true,
            depths: HashMap::new(),
            queue_lens: HashMap::new(),
            async_flags: HashMap::new(),
            pool_sizes: HashMap::new(),
        };
        env.depths.insert(2, 4);
        env.queue_lens.insert(2, 16);
        let cfg = env.graph_config(2).unwrap();
        assert_eq!(cfg.thread_pool_size, None);
        assert!(!cfg.sqe_async_flag);
    }

    #[test]
    fn present_uthreads_selects_pool_backend() {
        let mut env = EnvConfig {
            use_foreactor: true,
            depths: HashMap::new(),
            queue_lens: HashMap::new(),
            async_flags: HashMap::new(),
            pool_sizes: HashMap::new(),
        };
        env.depths.insert(3, 4);
        env.queue_lens.insert(3, 16);
        env.pool_sizes.insert(3, 2);
        let cfg = env.graph_config(3).unwrap();
        assert_eq!(cfg.thread_pool_size, Some(2));
    }
}

//! Herder List: the process-wide, read-mostly set of Herders, plus pool
//! lifecycle (`init_pool`/`destroy_pool`, spec section 4.1).

use std::fmt;
use std::sync::{Arc, RwLock};

use slab::Slab;

use crate::config::HerderConfig;
use crate::error::HerderError;
use crate::herder::Herder;
use crate::pool_registry;
use crate::worker_pool::WorkerPool;
use crate::Result;

/// The process-wide set of Herders, one per online CPU, keyed by slab slot
/// rather than CPU id directly (mirrors the `Slab<Arc<Session>>` this
/// crate's source repository used to hold its own live connections).
///
/// Written only at [`init_pool`] and [`destroy_pool`]; read (for the
/// least-loaded scan) by [`dispatch`](crate::dispatch::dispatch).
pub struct HerderList {
    herders: RwLock<Slab<Arc<Herder>>>,
}

impl fmt::Debug for HerderList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let len = self.herders.read().map(|h| h.len()).unwrap_or(0);
        f.debug_struct("HerderList").field("herders", &len).finish()
    }
}

impl HerderList {
    /// A snapshot of the current herders, for tests and diagnostics.
    pub fn herders(&self) -> Vec<Arc<Herder>> {
        self.herders
            .read()
            .expect("herder list lock poisoned")
            .iter()
            .map(|(_, h)| h.clone())
            .collect()
    }

    pub(crate) fn read(&self) -> std::sync::RwLockReadGuard<'_, Slab<Arc<Herder>>> {
        self.herders.read().expect("herder list lock poisoned")
    }
}

fn cpu_ids(config: &HerderConfig) -> Result<Vec<usize>> {
    if let Some(ids) = &config.cpu_ids {
        return Ok(ids.clone());
    }
    let count = std::thread::available_parallelism()
        .map(|n| n.get())
        .map_err(|e| HerderError::ResourceExhausted(e.to_string()))?;
    Ok((0..count).collect())
}

/// Instantiates one Herder per online CPU (or per `config.cpu_ids`, if
/// set), each with its own Readiness Engine, empty shard, and pinned
/// execution context running the Herder Run Loop.
///
/// On failure, every previously-created Herder is torn down in reverse
/// order and the worker pool handle is left untouched (spec section 4.1).
pub fn init_pool(worker_pool: Arc<dyn WorkerPool>, config: HerderConfig) -> Result<HerderList> {
    let ids = cpu_ids(&config)?;
    if ids.is_empty() {
        return Err(HerderError::ResourceExhausted("no CPUs available".into()));
    }

    pool_registry::acquire();

    let mut herders: Slab<Arc<Herder>> = Slab::with_capacity(ids.len());
    let mut spawned: Vec<Arc<Herder>> = Vec::with_capacity(ids.len());
    for cpu in ids {
        match Herder::spawn(cpu, worker_pool.clone(), config.clone()) {
            Ok(herder) => {
                let herder = Arc::new(herder);
                herders.insert(herder.clone());
                spawned.push(herder);
            }
            Err(e) => {
                tracing::error!(cpu, error = %e, "failed to create herder, rolling back pool init");
                for herder in spawned.into_iter().rev() {
                    herder.begin_shutdown();
                    herder.join();
                    herder.destroy_all();
                }
                pool_registry::release();
                return Err(e);
            }
        }
    }

    tracing::info!(herders = herders.len(), "herder pool initialized");
    Ok(HerderList {
        herders: RwLock::new(herders),
    })
}

/// Tears down every Herder in `herders`, in list order: signals and joins
/// each pinned execution context, destroys its Readiness Engine, then
/// walks and destroys its shard. Teardown does not fail; per-herder
/// errors are logged and execution continues (spec section 7).
pub fn destroy_pool(herders: HerderList) -> Result<()> {
    let mut list = herders.herders.write().expect("herder list lock poisoned");
    for herder in list.drain() {
        herder.begin_shutdown();
        herder.join();
        herder.destroy_all();
        tracing::info!(cpu = herder.cpu(), "herder torn down");
    }
    pool_registry::release();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker_pool::ChannelWorkerPool;

    fn test_config(cpus: usize) -> HerderConfig {
        HerderConfig {
            cpu_ids: Some((0..cpus).collect()),
            wait_timeout: std::time::Duration::from_millis(20),
            ..Default::default()
        }
    }

    #[test]
    fn init_pool_creates_one_herder_per_configured_cpu() {
        let (pool, _rx) = ChannelWorkerPool::new(64);
        let list = init_pool(Arc::new(pool), test_config(4)).unwrap();
        assert_eq!(list.herders().len(), 4);
        destroy_pool(list).unwrap();
    }

    #[test]
    fn destroy_pool_leaves_no_herders() {
        let (pool, _rx) = ChannelWorkerPool::new(64);
        let list = init_pool(Arc::new(pool), test_config(2)).unwrap();
        destroy_pool(list).unwrap();
    }
}

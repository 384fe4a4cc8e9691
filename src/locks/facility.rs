//! Lock facility, guard builder and composite guard
//!
//! Locks are `parking_lot` reader/writer locks behind `Arc`, handed out as
//! owned guards so one composite guard can hold any subset of them. Any
//! request touching a cluster map also takes RECONFIGURATION for reading,
//! unless the calling thread already holds it.

use super::{LockMode, LockName, LockStatus};
use crate::domain::{CtrlConfig, NodesMap, ResourceDefinitionMap, StorPoolDefinitionMap};
use crate::error::{Error, Result};
use crate::metrics::ControllerMetrics;
use lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{RawRwLock, RwLock};
use std::cell::Cell;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

thread_local! {
    static RECONFIGURATION_HOLDS: Cell<usize> = const { Cell::new(0) };
}

/// Number of RECONFIGURATION holds of guards living on the calling thread
pub fn reconfiguration_holds() -> usize {
    RECONFIGURATION_HOLDS.with(|c| c.get())
}

// =============================================================================
// Facility
// =============================================================================

struct Locks {
    reconfiguration: Arc<RwLock<()>>,
    ctrl_config: Arc<RwLock<CtrlConfig>>,
    nodes: Arc<RwLock<NodesMap>>,
    stor_pool_dfns: Arc<RwLock<StorPoolDefinitionMap>>,
    rsc_dfns: Arc<RwLock<ResourceDefinitionMap>>,
}

/// Owner of the cluster maps and the locks guarding them
#[derive(Clone)]
pub struct LockFacility {
    locks: Arc<Locks>,
    timeout: Duration,
    metrics: Option<ControllerMetrics>,
}

impl LockFacility {
    /// Facility over empty maps; `timeout` bounds the wait for each lock
    pub fn new(timeout: Duration) -> Self {
        Self {
            locks: Arc::new(Locks {
                reconfiguration: Arc::new(RwLock::new(())),
                ctrl_config: Arc::new(RwLock::new(CtrlConfig::new())),
                nodes: Arc::new(RwLock::new(NodesMap::new())),
                stor_pool_dfns: Arc::new(RwLock::new(StorPoolDefinitionMap::new())),
                rsc_dfns: Arc::new(RwLock::new(ResourceDefinitionMap::new())),
            }),
            timeout,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: ControllerMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn builder(&self) -> LockGuardBuilder {
        LockGuardBuilder {
            facility: self.clone(),
            requests: BTreeMap::new(),
        }
    }

    /// Current state of every lock, in acquisition order
    pub fn status(&self) -> Vec<LockStatus> {
        fn status<T>(name: LockName, lock: &RwLock<T>) -> LockStatus {
            LockStatus {
                name,
                locked: lock.is_locked(),
                exclusive: lock.is_locked_exclusive(),
            }
        }
        LockName::ORDER
            .iter()
            .map(|&name| match name {
                LockName::Reconfiguration => status(name, &self.locks.reconfiguration),
                LockName::CtrlConfig => status(name, &self.locks.ctrl_config),
                LockName::NodesMap => status(name, &self.locks.nodes),
                LockName::StorPoolDfnMap => status(name, &self.locks.stor_pool_dfns),
                LockName::RscDfnMap => status(name, &self.locks.rsc_dfns),
            })
            .collect()
    }
}

impl std::fmt::Debug for LockFacility {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockFacility")
            .field("timeout", &self.timeout)
            .field("status", &self.status())
            .finish()
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Collects the locks of one bundle
pub struct LockGuardBuilder {
    facility: LockFacility,
    requests: BTreeMap<LockName, LockMode>,
}

impl LockGuardBuilder {
    pub fn read(self, names: &[LockName]) -> Self {
        names.iter().fold(self, |b, &name| b.add(name, LockMode::Read))
    }

    pub fn write(self, names: &[LockName]) -> Self {
        names.iter().fold(self, |b, &name| b.add(name, LockMode::Write))
    }

    /// Add one lock; asking for the same lock twice keeps the stronger mode
    pub fn add(mut self, name: LockName, mode: LockMode) -> Self {
        self.requests
            .entry(name)
            .and_modify(|m| *m = (*m).max(mode))
            .or_insert(mode);
        self
    }

    /// Acquire every requested lock in global order
    pub fn build(self) -> Result<LockGuard> {
        let mut guard = self.build_deferred();
        guard.lock()?;
        Ok(guard)
    }

    /// Guard that acquires nothing until `lock()` is called
    pub fn build_deferred(self) -> LockGuard {
        LockGuard {
            facility: self.facility,
            requests: self.requests,
            locked: false,
            acquired: Vec::new(),
            reconfiguration: None,
            ctrl_config: None,
            nodes: None,
            stor_pool_dfns: None,
            rsc_dfns: None,
        }
    }
}

// =============================================================================
// Guard
// =============================================================================

enum Held<T> {
    Read(ArcRwLockReadGuard<RawRwLock, T>),
    Write(ArcRwLockWriteGuard<RawRwLock, T>),
}

impl<T> Held<T> {
    fn acquire(lock: &Arc<RwLock<T>>, mode: LockMode, timeout: Duration) -> Option<Self> {
        match mode {
            LockMode::Read => lock.try_read_arc_for(timeout).map(Held::Read),
            LockMode::Write => lock.try_write_arc_for(timeout).map(Held::Write),
        }
    }

    fn get(&self) -> &T {
        match self {
            Held::Read(g) => &**g,
            Held::Write(g) => &**g,
        }
    }

    fn get_mut(&mut self) -> Option<&mut T> {
        match self {
            Held::Read(_) => None,
            Held::Write(g) => Some(&mut **g),
        }
    }
}

fn store<T>(slot: &mut Option<Held<T>>, held: Option<Held<T>>) -> bool {
    let acquired = held.is_some();
    *slot = held;
    acquired
}

fn view<T>(held: &Option<Held<T>>, name: LockName) -> Result<&T> {
    held.as_ref().map(Held::get).ok_or_else(|| Error::LockNotHeld {
        lock: name.to_string(),
        write: false,
    })
}

fn view_mut<T>(held: &mut Option<Held<T>>, name: LockName) -> Result<&mut T> {
    held.as_mut().and_then(Held::get_mut).ok_or_else(|| Error::LockNotHeld {
        lock: name.to_string(),
        write: true,
    })
}

/// A bundle of held locks, released together
///
/// Release happens exactly once, through `release()` or on drop. The guard
/// is bound to the thread that locked it.
pub struct LockGuard {
    facility: LockFacility,
    requests: BTreeMap<LockName, LockMode>,
    locked: bool,
    acquired: Vec<(LockName, LockMode)>,
    reconfiguration: Option<Held<()>>,
    ctrl_config: Option<Held<CtrlConfig>>,
    nodes: Option<Held<NodesMap>>,
    stor_pool_dfns: Option<Held<StorPoolDefinitionMap>>,
    rsc_dfns: Option<Held<ResourceDefinitionMap>>,
}

impl LockGuard {
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Locks held, in the order they were acquired
    pub fn held_locks(&self) -> &[(LockName, LockMode)] {
        &self.acquired
    }

    /// Acquire the bundle
    ///
    /// On timeout every lock taken by this call is released in reverse order.
    pub fn lock(&mut self) -> Result<()> {
        if self.locked {
            return Err(Error::Implementation("lock guard is already locked".to_string()));
        }

        let mut plan: Vec<(LockName, LockMode)> =
            self.requests.iter().map(|(n, m)| (*n, *m)).collect();
        if !plan.is_empty()
            && !self.requests.contains_key(&LockName::Reconfiguration)
            && reconfiguration_holds() == 0
        {
            plan.insert(0, (LockName::Reconfiguration, LockMode::Read));
        }

        let started = Instant::now();
        let timeout = self.facility.timeout;
        for (name, mode) in plan {
            if !self.acquire_one(name, mode, timeout) {
                self.release_acquired();
                warn!(
                    lock = %name,
                    mode = %mode,
                    timeout_ms = timeout.as_millis() as u64,
                    "Lock acquisition timed out"
                );
                if let Some(metrics) = &self.facility.metrics {
                    metrics.lock_timeouts_total.inc();
                }
                return Err(Error::LockTimeout {
                    lock: name.to_string(),
                });
            }
            if name == LockName::Reconfiguration {
                RECONFIGURATION_HOLDS.with(|c| c.set(c.get() + 1));
            }
            self.acquired.push((name, mode));
        }

        self.locked = true;
        if let Some(metrics) = &self.facility.metrics {
            metrics.lock_wait_seconds.observe(started.elapsed().as_secs_f64());
        }
        debug!(locks = ?self.acquired, "Lock bundle acquired");
        Ok(())
    }

    /// Release every held lock; no-op when nothing is held
    pub fn release(&mut self) {
        if self.locked {
            debug!(locks = ?self.acquired, "Releasing lock bundle");
        }
        self.release_acquired();
        self.locked = false;
    }

    fn acquire_one(&mut self, name: LockName, mode: LockMode, timeout: Duration) -> bool {
        let locks = Arc::clone(&self.facility.locks);
        match name {
            LockName::Reconfiguration => store(
                &mut self.reconfiguration,
                Held::acquire(&locks.reconfiguration, mode, timeout),
            ),
            LockName::CtrlConfig => store(
                &mut self.ctrl_config,
                Held::acquire(&locks.ctrl_config, mode, timeout),
            ),
            LockName::NodesMap => store(&mut self.nodes, Held::acquire(&locks.nodes, mode, timeout)),
            LockName::StorPoolDfnMap => store(
                &mut self.stor_pool_dfns,
                Held::acquire(&locks.stor_pool_dfns, mode, timeout),
            ),
            LockName::RscDfnMap => store(
                &mut self.rsc_dfns,
                Held::acquire(&locks.rsc_dfns, mode, timeout),
            ),
        }
    }

    fn release_acquired(&mut self) {
        while let Some((name, _)) = self.acquired.pop() {
            match name {
                LockName::Reconfiguration => {
                    self.reconfiguration = None;
                    RECONFIGURATION_HOLDS.with(|c| c.set(c.get().saturating_sub(1)));
                }
                LockName::CtrlConfig => self.ctrl_config = None,
                LockName::NodesMap => self.nodes = None,
                LockName::StorPoolDfnMap => self.stor_pool_dfns = None,
                LockName::RscDfnMap => self.rsc_dfns = None,
            }
        }
    }

    // -------------------------------------------------------------------------
    // Map access
    // -------------------------------------------------------------------------

    pub fn ctrl_config(&self) -> Result<&CtrlConfig> {
        view(&self.ctrl_config, LockName::CtrlConfig)
    }

    pub fn ctrl_config_mut(&mut self) -> Result<&mut CtrlConfig> {
        view_mut(&mut self.ctrl_config, LockName::CtrlConfig)
    }

    pub fn nodes(&self) -> Result<&NodesMap> {
        view(&self.nodes, LockName::NodesMap)
    }

    pub fn nodes_mut(&mut self) -> Result<&mut NodesMap> {
        view_mut(&mut self.nodes, LockName::NodesMap)
    }

    pub fn stor_pool_dfns(&self) -> Result<&StorPoolDefinitionMap> {
        view(&self.stor_pool_dfns, LockName::StorPoolDfnMap)
    }

    pub fn stor_pool_dfns_mut(&mut self) -> Result<&mut StorPoolDefinitionMap> {
        view_mut(&mut self.stor_pool_dfns, LockName::StorPoolDfnMap)
    }

    pub fn rsc_dfns(&self) -> Result<&ResourceDefinitionMap> {
        view(&self.rsc_dfns, LockName::RscDfnMap)
    }

    pub fn rsc_dfns_mut(&mut self) -> Result<&mut ResourceDefinitionMap> {
        view_mut(&mut self.rsc_dfns, LockName::RscDfnMap)
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("requests", &self.requests)
            .field("locked", &self.locked)
            .field("acquired", &self.acquired)
            .finish()
    }
}

//! Persistent lease store: bubbles, leases, and the transaction seam.
//!
//! The allocator never touches storage directly; it speaks the
//! [`LeaseStore`]/[`StoreTxn`] pair. One transaction covers one
//! allocation against one pool, and an abandoned transaction (dropped
//! without [`commit`](StoreTxn::commit)) applies nothing.
//!
//! [`MemoryStore`] is the bundled implementation: bubbles and leases
//! held in memory, serialized per pool, with optional JSON snapshots on
//! disk so leases survive a restart.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info};

use crate::cidr::AddressRange;
use crate::error::{Error, Result};

/// Identifies one lease pool in the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PoolId(String);

impl PoolId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A free contiguous address interval `[start, end]` within a pool.
///
/// The bubbles of a pool are disjoint and together cover exactly the
/// pool's unallocated addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bubble {
    pub id: u64,
    pub start: Ipv4Addr,
    pub end: Ipv4Addr,
}

impl Bubble {
    /// Number of addresses covered, inclusive.
    pub fn size(&self) -> u64 {
        u64::from(u32::from(self.end)) - u64::from(u32::from(self.start)) + 1
    }
}

/// Lifecycle state of a lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LeaseStatus {
    /// Offered to a client, not yet confirmed.
    Offered,
    /// Confirmed by a REQUEST/ACK exchange.
    Active,
}

/// An address assignment with its timestamps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub address: Ipv4Addr,
    pub hardware: Vec<u8>,
    pub status: LeaseStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// One transaction against one pool's rows.
///
/// Reads observe the pool state as of transaction start; writes are
/// staged and applied together by [`commit`](Self::commit). Dropping
/// the transaction discards the staged writes.
pub trait StoreTxn: Send {
    /// The free bubble with the lowest `start`, if any.
    fn lowest_bubble(&self) -> Option<Bubble>;

    /// Every free bubble in the pool, ordered by `start`.
    fn bubbles(&self) -> Vec<Bubble>;

    /// Stages new endpoints for an existing bubble.
    fn update_bubble(&mut self, id: u64, start: Ipv4Addr, end: Ipv4Addr);

    /// Stages insertion of a new bubble.
    fn insert_bubble(&mut self, start: Ipv4Addr, end: Ipv4Addr);

    /// Stages deletion of a bubble.
    fn delete_bubble(&mut self, id: u64);

    fn get_lease(&self, address: Ipv4Addr) -> Option<Lease>;

    fn put_lease(&mut self, lease: Lease);

    fn delete_lease(&mut self, address: Ipv4Addr);

    /// Applies every staged write atomically.
    fn commit(self) -> impl std::future::Future<Output = Result<()>> + Send;
}

/// The persistence boundary consumed by the allocator.
pub trait LeaseStore: Send + Sync {
    type Txn: StoreTxn;

    /// Creates a pool with one bubble spanning `range`. Idempotent for
    /// an already-provisioned pool.
    fn provision_pool(
        &self,
        pool: &PoolId,
        range: AddressRange,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Opens a transaction scoped to `pool`'s rows.
    ///
    /// Serialized per pool: a second `begin` against the same pool
    /// waits for the first transaction to commit or drop.
    fn begin(&self, pool: &PoolId) -> impl std::future::Future<Output = Result<Self::Txn>> + Send;

    /// Leases across all pools whose expiry is at or before `now`,
    /// paired with the pool owning each.
    fn expired_leases(
        &self,
        now: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<Vec<(PoolId, Lease)>>> + Send;

    /// Flushes state and releases resources.
    fn shutdown(&self) -> impl std::future::Future<Output = Result<()>> + Send;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PoolState {
    next_bubble_id: u64,
    bubbles: BTreeMap<u64, (Ipv4Addr, Ipv4Addr)>,
    leases: HashMap<Ipv4Addr, Lease>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    pools: BTreeMap<PoolId, PoolState>,
}

/// In-memory store with optional JSON persistence.
///
/// Each pool lives behind its own async mutex, so transactions against
/// different pools never contend while transactions against the same
/// pool are fully serialized.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    pools: Arc<StdMutex<HashMap<PoolId, Arc<Mutex<PoolState>>>>>,
    persist_path: Option<PathBuf>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a store backed by a JSON snapshot file, loading prior
    /// state if the file exists.
    pub fn with_persistence(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut pools = HashMap::new();
        if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            let snapshot: Snapshot = serde_json::from_str(&contents)?;
            for (id, state) in snapshot.pools {
                pools.insert(id, Arc::new(Mutex::new(state)));
            }
            info!(path = %path.display(), pools = pools.len(), "loaded lease snapshot");
        }
        Ok(Self {
            pools: Arc::new(StdMutex::new(pools)),
            persist_path: Some(path),
        })
    }

    fn pool(&self, pool: &PoolId) -> Result<Arc<Mutex<PoolState>>> {
        let pools = self
            .pools
            .lock()
            .map_err(|_| Error::StoreUnavailable("pool table poisoned".to_string()))?;
        pools
            .get(pool)
            .cloned()
            .ok_or_else(|| Error::StoreUnavailable(format!("pool {} is not provisioned", pool)))
    }

    async fn save(&self) -> Result<()> {
        let Some(path) = &self.persist_path else {
            return Ok(());
        };
        let handles: Vec<(PoolId, Arc<Mutex<PoolState>>)> = {
            let pools = self
                .pools
                .lock()
                .map_err(|_| Error::StoreUnavailable("pool table poisoned".to_string()))?;
            pools.iter().map(|(k, v)| (k.clone(), Arc::clone(v))).collect()
        };

        let mut snapshot = Snapshot::default();
        for (id, handle) in handles {
            let state = handle.lock().await;
            snapshot.pools.insert(
                id,
                PoolState {
                    next_bubble_id: state.next_bubble_id,
                    bubbles: state.bubbles.clone(),
                    leases: state.leases.clone(),
                },
            );
        }

        let contents = serde_json::to_string_pretty(&snapshot)?;
        std::fs::write(path, contents)?;
        debug!(path = %path.display(), "saved lease snapshot");
        Ok(())
    }
}

impl LeaseStore for MemoryStore {
    type Txn = MemoryTxn;

    async fn provision_pool(&self, pool: &PoolId, range: AddressRange) -> Result<()> {
        let mut pools = self
            .pools
            .lock()
            .map_err(|_| Error::StoreUnavailable("pool table poisoned".to_string()))?;
        if pools.contains_key(pool) {
            return Ok(());
        }
        let mut state = PoolState::default();
        state.bubbles.insert(0, (range.start(), range.end()));
        state.next_bubble_id = 1;
        pools.insert(pool.clone(), Arc::new(Mutex::new(state)));
        info!(pool = %pool, range = %range, "provisioned pool");
        Ok(())
    }

    async fn begin(&self, pool: &PoolId) -> Result<MemoryTxn> {
        let handle = self.pool(pool)?;
        let guard = handle.lock_owned().await;
        Ok(MemoryTxn {
            guard,
            staged: Vec::new(),
        })
    }

    async fn expired_leases(&self, now: DateTime<Utc>) -> Result<Vec<(PoolId, Lease)>> {
        let handles: Vec<(PoolId, Arc<Mutex<PoolState>>)> = {
            let pools = self
                .pools
                .lock()
                .map_err(|_| Error::StoreUnavailable("pool table poisoned".to_string()))?;
            pools.iter().map(|(k, v)| (k.clone(), Arc::clone(v))).collect()
        };

        let mut expired = Vec::new();
        for (id, handle) in handles {
            let state = handle.lock().await;
            for lease in state.leases.values() {
                if lease.is_expired_at(now) {
                    expired.push((id.clone(), lease.clone()));
                }
            }
        }
        Ok(expired)
    }

    async fn shutdown(&self) -> Result<()> {
        self.save().await
    }
}

enum Write {
    UpdateBubble { id: u64, start: Ipv4Addr, end: Ipv4Addr },
    InsertBubble { start: Ipv4Addr, end: Ipv4Addr },
    DeleteBubble { id: u64 },
    PutLease(Lease),
    DeleteLease(Ipv4Addr),
}

/// Transaction over one pool of a [`MemoryStore`].
///
/// Holds the pool's mutex for its whole lifetime, which is what makes
/// the read-then-write allocation sequence atomic per pool.
pub struct MemoryTxn {
    guard: OwnedMutexGuard<PoolState>,
    staged: Vec<Write>,
}

impl StoreTxn for MemoryTxn {
    fn lowest_bubble(&self) -> Option<Bubble> {
        self.bubbles().into_iter().next()
    }

    fn bubbles(&self) -> Vec<Bubble> {
        let mut bubbles: Vec<Bubble> = self
            .guard
            .bubbles
            .iter()
            .map(|(&id, &(start, end))| Bubble { id, start, end })
            .collect();
        bubbles.sort_by_key(|b| u32::from(b.start));
        bubbles
    }

    fn update_bubble(&mut self, id: u64, start: Ipv4Addr, end: Ipv4Addr) {
        self.staged.push(Write::UpdateBubble { id, start, end });
    }

    fn insert_bubble(&mut self, start: Ipv4Addr, end: Ipv4Addr) {
        self.staged.push(Write::InsertBubble { start, end });
    }

    fn delete_bubble(&mut self, id: u64) {
        self.staged.push(Write::DeleteBubble { id });
    }

    fn get_lease(&self, address: Ipv4Addr) -> Option<Lease> {
        self.guard.leases.get(&address).cloned()
    }

    fn put_lease(&mut self, lease: Lease) {
        self.staged.push(Write::PutLease(lease));
    }

    fn delete_lease(&mut self, address: Ipv4Addr) {
        self.staged.push(Write::DeleteLease(address));
    }

    async fn commit(mut self) -> Result<()> {
        for write in self.staged.drain(..) {
            match write {
                Write::UpdateBubble { id, start, end } => {
                    self.guard.bubbles.insert(id, (start, end));
                }
                Write::InsertBubble { start, end } => {
                    let id = self.guard.next_bubble_id;
                    self.guard.next_bubble_id += 1;
                    self.guard.bubbles.insert(id, (start, end));
                }
                Write::DeleteBubble { id } => {
                    self.guard.bubbles.remove(&id);
                }
                Write::PutLease(lease) => {
                    self.guard.leases.insert(lease.address, lease);
                }
                Write::DeleteLease(address) => {
                    self.guard.leases.remove(&address);
                }
            }
        }
        Ok(())
    }
}

//! Bubble allocator: hands out and reclaims pool addresses.
//!
//! Allocation takes the lowest free bubble's `start`, then shrinks the
//! bubble or deletes it once consumed. Release re-grows the free set,
//! merging with adjacent bubbles so free intervals stay maximal. The
//! decisions themselves are pure functions over bubbles
//! ([`plan_allocation`], [`plan_release`]); [`Allocator`] wraps them in
//! one store transaction per call, which is the only serialization
//! point in the crate.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};

use crate::cidr::AddressRange;
use crate::error::{Error, Result};
use crate::store::{Bubble, Lease, LeaseStatus, LeaseStore, PoolId, StoreTxn};

/// A staged change to a pool's bubble set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BubbleOp {
    Update { id: u64, start: Ipv4Addr, end: Ipv4Addr },
    Insert { start: Ipv4Addr, end: Ipv4Addr },
    Delete { id: u64 },
}

/// Decides how to consume one address from `bubble`.
///
/// Returns the address (always `bubble.start`, so allocation order is
/// deterministic lowest-first) and the bubble change to persist: shrink
/// when more addresses remain, delete when fully consumed.
pub fn plan_allocation(bubble: &Bubble) -> (Ipv4Addr, BubbleOp) {
    let candidate = bubble.start;
    let op = if bubble.start < bubble.end {
        BubbleOp::Update {
            id: bubble.id,
            start: Ipv4Addr::from(u32::from(bubble.start) + 1),
            end: bubble.end,
        }
    } else {
        BubbleOp::Delete { id: bubble.id }
    };
    (candidate, op)
}

/// Decides how to return `address` to a pool whose free set is
/// `bubbles` (ordered by start, disjoint).
///
/// Merges with a bubble ending just below and/or starting just above
/// so the free set stays maximal.
///
/// # Errors
///
/// [`Error::AddressNotUsable`] if `address` is outside `range`;
/// [`Error::AllocationConflict`] if it is already free.
pub fn plan_release(
    bubbles: &[Bubble],
    address: Ipv4Addr,
    range: AddressRange,
) -> Result<Vec<BubbleOp>> {
    if !range.contains(address) {
        return Err(Error::AddressNotUsable(address));
    }
    if bubbles.iter().any(|b| b.start <= address && address <= b.end) {
        return Err(Error::AllocationConflict(format!(
            "{} is already free",
            address
        )));
    }

    let addr = u32::from(address);
    let left = bubbles
        .iter()
        .find(|b| addr > 0 && u32::from(b.end) == addr - 1);
    let right = bubbles
        .iter()
        .find(|b| addr < u32::MAX && u32::from(b.start) == addr + 1);

    Ok(match (left, right) {
        (Some(l), Some(r)) => vec![
            BubbleOp::Update {
                id: l.id,
                start: l.start,
                end: r.end,
            },
            BubbleOp::Delete { id: r.id },
        ],
        (Some(l), None) => vec![BubbleOp::Update {
            id: l.id,
            start: l.start,
            end: address,
        }],
        (None, Some(r)) => vec![BubbleOp::Update {
            id: r.id,
            start: address,
            end: r.end,
        }],
        (None, None) => vec![BubbleOp::Insert {
            start: address,
            end: address,
        }],
    })
}

/// Decides how to carve `address` out of a pool whose free set is
/// `bubbles`, when a client claims that specific address rather than
/// taking the lowest free one.
///
/// `None` when the address is not free. Splitting an interior address
/// leaves two bubbles, so the free set stays disjoint and maximal
/// either way.
pub fn plan_claim(bubbles: &[Bubble], address: Ipv4Addr) -> Option<Vec<BubbleOp>> {
    let bubble = bubbles
        .iter()
        .find(|b| b.start <= address && address <= b.end)?;
    let addr = u32::from(address);

    Some(if bubble.start == bubble.end {
        vec![BubbleOp::Delete { id: bubble.id }]
    } else if address == bubble.start {
        vec![BubbleOp::Update {
            id: bubble.id,
            start: Ipv4Addr::from(addr + 1),
            end: bubble.end,
        }]
    } else if address == bubble.end {
        vec![BubbleOp::Update {
            id: bubble.id,
            start: bubble.start,
            end: Ipv4Addr::from(addr - 1),
        }]
    } else {
        vec![
            BubbleOp::Update {
                id: bubble.id,
                start: bubble.start,
                end: Ipv4Addr::from(addr - 1),
            },
            BubbleOp::Insert {
                start: Ipv4Addr::from(addr + 1),
                end: bubble.end,
            },
        ]
    })
}

fn apply<T: StoreTxn>(txn: &mut T, op: BubbleOp) {
    match op {
        BubbleOp::Update { id, start, end } => txn.update_bubble(id, start, end),
        BubbleOp::Insert { start, end } => txn.insert_bubble(start, end),
        BubbleOp::Delete { id } => txn.delete_bubble(id),
    }
}

/// Lease allocation over a [`LeaseStore`].
///
/// Every method runs as a single transaction against one pool; two
/// concurrent calls against the same pool serialize at the store and
/// can never return the same address.
#[derive(Debug, Clone)]
pub struct Allocator<S> {
    store: S,
}

impl<S: LeaseStore> Allocator<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Ensures `pool` exists with one bubble spanning `range`.
    pub async fn provision(&self, pool: &PoolId, range: AddressRange) -> Result<()> {
        self.store.provision_pool(pool, range).await
    }

    /// Allocates the lowest free address in `pool` and records a lease
    /// for `hardware`.
    ///
    /// # Errors
    ///
    /// [`Error::PoolExhausted`] when the pool has no free bubble.
    pub async fn allocate(
        &self,
        pool: &PoolId,
        hardware: &[u8],
        lease_time: Duration,
        status: LeaseStatus,
        now: DateTime<Utc>,
    ) -> Result<Lease> {
        let mut txn = self.store.begin(pool).await?;

        let bubble = txn
            .lowest_bubble()
            .ok_or_else(|| Error::PoolExhausted(pool.to_string()))?;
        let (address, op) = plan_allocation(&bubble);
        apply(&mut txn, op);

        let lease = Lease {
            address,
            hardware: hardware.to_vec(),
            status,
            created_at: now,
            updated_at: now,
            expires_at: now + lease_time,
        };
        txn.put_lease(lease.clone());
        txn.commit().await?;

        debug!(pool = %pool, address = %address, "allocated address");
        Ok(lease)
    }

    /// Confirms `address` for `hardware`, refreshing the lease expiry
    /// and marking it active.
    ///
    /// The address must be leased to this hardware already, or still
    /// free in the pool. The free case covers a client rebooting after
    /// its lease expired and was reclaimed: the claimed address is
    /// carved out of its bubble and leased afresh.
    ///
    /// # Errors
    ///
    /// [`Error::AddressNotUsable`] if the address is leased to
    /// different hardware, or neither leased nor free.
    pub async fn confirm(
        &self,
        pool: &PoolId,
        address: Ipv4Addr,
        hardware: &[u8],
        lease_time: Duration,
        now: DateTime<Utc>,
    ) -> Result<Lease> {
        let mut txn = self.store.begin(pool).await?;

        let lease = match txn.get_lease(address) {
            Some(mut lease) => {
                if lease.hardware != hardware {
                    return Err(Error::AddressNotUsable(address));
                }
                lease.status = LeaseStatus::Active;
                lease.updated_at = now;
                lease.expires_at = now + lease_time;
                lease
            }
            None => {
                let ops = plan_claim(&txn.bubbles(), address)
                    .ok_or(Error::AddressNotUsable(address))?;
                for op in ops {
                    apply(&mut txn, op);
                }
                Lease {
                    address,
                    hardware: hardware.to_vec(),
                    status: LeaseStatus::Active,
                    created_at: now,
                    updated_at: now,
                    expires_at: now + lease_time,
                }
            }
        };
        txn.put_lease(lease.clone());
        txn.commit().await?;

        debug!(pool = %pool, address = %address, "confirmed lease");
        Ok(lease)
    }

    /// Returns `address` to `pool`, deleting its lease and merging the
    /// freed address into the bubble set.
    pub async fn release(
        &self,
        pool: &PoolId,
        address: Ipv4Addr,
        range: AddressRange,
    ) -> Result<()> {
        let mut txn = self.store.begin(pool).await?;

        let ops = plan_release(&txn.bubbles(), address, range)?;
        for op in ops {
            apply(&mut txn, op);
        }
        txn.delete_lease(address);
        txn.commit().await?;

        debug!(pool = %pool, address = %address, "released address");
        Ok(())
    }

    /// Like [`release`](Self::release), but only if the lease on
    /// `address` exists and belongs to `hardware`. Used for
    /// client-initiated releases, where the claim is untrusted.
    pub async fn release_owned(
        &self,
        pool: &PoolId,
        address: Ipv4Addr,
        range: AddressRange,
        hardware: &[u8],
    ) -> Result<()> {
        let mut txn = self.store.begin(pool).await?;

        let lease = txn
            .get_lease(address)
            .ok_or(Error::AddressNotUsable(address))?;
        if lease.hardware != hardware {
            return Err(Error::AddressNotUsable(address));
        }

        let ops = plan_release(&txn.bubbles(), address, range)?;
        for op in ops {
            apply(&mut txn, op);
        }
        txn.delete_lease(address);
        txn.commit().await?;

        debug!(pool = %pool, address = %address, "released address");
        Ok(())
    }

    /// Releases every lease expired at `now`. `ranges` maps each pool
    /// to its configured range; leases in unknown pools are skipped.
    ///
    /// Returns the number of addresses reclaimed.
    pub async fn reclaim_expired(
        &self,
        now: DateTime<Utc>,
        ranges: &HashMap<PoolId, AddressRange>,
    ) -> Result<usize> {
        let expired = self.store.expired_leases(now).await?;
        let mut reclaimed = 0;
        for (pool, lease) in expired {
            let Some(&range) = ranges.get(&pool) else {
                warn!(pool = %pool, address = %lease.address, "expired lease in unknown pool");
                continue;
            };
            match self.release(&pool, lease.address, range).await {
                Ok(()) => reclaimed += 1,
                Err(error) => {
                    warn!(pool = %pool, address = %lease.address, %error, "reclaim failed");
                }
            }
        }
        Ok(reclaimed)
    }
}

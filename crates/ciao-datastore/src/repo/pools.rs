//! External address pool repository.
//!
//! Pool updates are whole-object replacements reconciled against the cached
//! snapshot: only members that were added, changed or removed reach the
//! durable tier, while the caller's `free`/`total_ips` are stored as given.
//!
//! Every member covers a block of addresses (a single address is a `/32`).
//! No two members anywhere may overlap, and a member cannot be removed while
//! one of its addresses is in the pool's `mapped` set.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::Ipv4Addr;

use ipnetwork::Ipv4Network;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::{DatastoreError, DatastoreResult};
use crate::network::{cidr_size, overlaps, parse_cidr};
use crate::store::{DurableStore, PoolDelta, check_pool_id};
use crate::types::*;

/// Cached pools keyed by ID.
pub struct PoolRepo {
    store: DurableStore,
    cache: RwLock<BTreeMap<String, Pool>>,
}

impl PoolRepo {
    pub(crate) fn load(store: DurableStore) -> DatastoreResult<Self> {
        let pools = store
            .list_pools()?
            .into_iter()
            .map(|p| (p.id.clone(), p))
            .collect::<BTreeMap<_, _>>();
        debug!(count = pools.len(), "pool cache loaded");
        Ok(Self {
            store,
            cache: RwLock::new(pools),
        })
    }

    pub async fn get(&self, pool_id: &str) -> Option<Pool> {
        self.cache.read().await.get(pool_id).cloned()
    }

    pub fn get_no_cache(&self, pool_id: &str) -> DatastoreResult<Option<Pool>> {
        self.store.get_pool(pool_id)
    }

    pub async fn list(&self) -> Vec<Pool> {
        self.cache.read().await.values().cloned().collect()
    }

    pub fn list_no_cache(&self) -> DatastoreResult<Vec<Pool>> {
        self.store.list_pools()
    }

    /// Look a pool up by name.
    pub async fn find_by_name(&self, name: &str) -> Option<Pool> {
        self.cache.read().await.values().find(|p| p.name == name).cloned()
    }

    /// Create a pool with its members.
    ///
    /// Fails with `Conflict` if the ID or name is taken, or if any member
    /// overlaps a member of another pool. Overlapping members within the
    /// pool itself are `Invalid`.
    pub async fn create(&self, pool: Pool) -> DatastoreResult<Pool> {
        let mut pool = pool;
        check_pool_id(&pool.id)?;
        canonicalize(&mut pool)?;
        check_unique_ids(&pool)?;
        check_mapped(&pool)?;

        let mut cache = self.cache.write().await;
        if cache.contains_key(&pool.id) {
            return Err(DatastoreError::Conflict(format!("pool {} exists", pool.id)));
        }
        if cache.values().any(|p| p.name == pool.name) {
            return Err(DatastoreError::Conflict(format!("pool name {} in use", pool.name)));
        }
        check_ownership(&cache, &pool)?;

        self.store.create_pool(&pool)?;
        cache.insert(pool.id.clone(), pool.clone());
        info!(pool_id = %pool.id, name = %pool.name, total_ips = pool.total_ips, "pool created");
        Ok(pool)
    }

    /// Replace a pool. Membership is reconciled against the cached snapshot;
    /// the counters in `pool` are taken as authoritative. The `mapped` set is
    /// owned by the mapping operations and kept as cached.
    pub async fn update(&self, pool: &Pool) -> DatastoreResult<()> {
        let next = pool.clone();
        self.modify(&pool.id, move |current| {
            let mapped = std::mem::take(&mut current.mapped);
            *current = next;
            current.mapped = mapped;
            Ok(())
        })
        .await
    }

    /// Read-modify-write a pool inside the pool domain's write section.
    pub async fn modify<R, F>(&self, pool_id: &str, f: F) -> DatastoreResult<R>
    where
        F: FnOnce(&mut Pool) -> DatastoreResult<R>,
    {
        let mut cache = self.cache.write().await;
        let current = cache
            .get(pool_id)
            .ok_or_else(|| DatastoreError::NotFound(format!("pool {pool_id}")))?;
        let mut next = current.clone();
        let out = f(&mut next)?;
        if next.id != current.id {
            return Err(DatastoreError::Invalid("pool ID cannot change".to_string()));
        }
        canonicalize(&mut next)?;
        check_unique_ids(&next)?;
        check_mapped(&next)?;
        check_ownership(&cache, &next)?;

        {
            let delta = reconcile(&cache[pool_id], &next);
            self.store.apply_pool_delta(&next, &delta)?;
        }
        cache.insert(next.id.clone(), next);
        Ok(out)
    }

    /// Delete a pool and its members. Fails with `NotFound` if absent and
    /// `Conflict` while any of its addresses is mapped.
    pub async fn delete(&self, pool_id: &str) -> DatastoreResult<()> {
        let mut cache = self.cache.write().await;
        let pool = cache
            .get(pool_id)
            .ok_or_else(|| DatastoreError::NotFound(format!("pool {pool_id}")))?;
        if !pool.mapped.is_empty() {
            return Err(DatastoreError::Conflict(format!(
                "pool {pool_id} has {} mapped addresses",
                pool.mapped.len()
            )));
        }
        self.store.delete_pool(pool_id)?;
        cache.remove(pool_id);
        info!(%pool_id, "pool deleted");
        Ok(())
    }

    /// Add an external subnet. The pool's counters grow by the size of the
    /// block. Host bits in `cidr` are cleared before it is stored.
    pub async fn add_external_subnet(&self, pool_id: &str, cidr: &str) -> DatastoreResult<ExternalSubnet> {
        let block = parse_cidr(cidr)?;
        let size = cidr_size(&block);
        let subnet = ExternalSubnet {
            id: uuid::Uuid::new_v4().to_string(),
            cidr: block.to_string(),
        };
        let added = subnet.clone();
        self.modify(pool_id, move |pool| {
            pool.subnets.push(added);
            pool.total_ips += size;
            pool.free += size;
            Ok(())
        })
        .await?;
        debug!(%pool_id, cidr = %subnet.cidr, "external subnet added");
        Ok(subnet)
    }

    /// Add individual external addresses, one counter step each.
    pub async fn add_external_ips(&self, pool_id: &str, addresses: &[Ipv4Addr]) -> DatastoreResult<Vec<ExternalIP>> {
        let ips: Vec<ExternalIP> = addresses
            .iter()
            .map(|&address| ExternalIP {
                id: uuid::Uuid::new_v4().to_string(),
                address,
            })
            .collect();
        let added = ips.clone();
        self.modify(pool_id, move |pool| {
            let count = added.len() as u64;
            pool.ips.extend(added);
            pool.total_ips += count;
            pool.free += count;
            Ok(())
        })
        .await?;
        debug!(%pool_id, count = ips.len(), "external addresses added");
        Ok(ips)
    }

    /// Remove an external subnet and shrink the counters by its size.
    ///
    /// Fails with `Conflict` while any address in the block is mapped.
    pub async fn delete_external_subnet(&self, pool_id: &str, subnet_id: &str) -> DatastoreResult<()> {
        self.modify(pool_id, |pool| {
            let idx = pool
                .subnets
                .iter()
                .position(|s| s.id == subnet_id)
                .ok_or_else(|| DatastoreError::NotFound(format!("subnet {subnet_id} in pool {pool_id}")))?;
            let removed = pool.subnets.remove(idx);
            let size = cidr_size(&parse_cidr(&removed.cidr)?);
            pool.total_ips = pool.total_ips.saturating_sub(size);
            pool.free = pool.free.saturating_sub(size);
            Ok(())
        })
        .await?;
        debug!(%pool_id, %subnet_id, "external subnet deleted");
        Ok(())
    }

    /// Remove a single external address. Fails with `Conflict` while it is
    /// mapped.
    pub async fn delete_external_ip(&self, pool_id: &str, ip_id: &str) -> DatastoreResult<()> {
        self.modify(pool_id, |pool| {
            let idx = pool
                .ips
                .iter()
                .position(|i| i.id == ip_id)
                .ok_or_else(|| DatastoreError::NotFound(format!("address {ip_id} in pool {pool_id}")))?;
            pool.ips.remove(idx);
            pool.total_ips = pool.total_ips.saturating_sub(1);
            pool.free = pool.free.saturating_sub(1);
            Ok(())
        })
        .await?;
        debug!(%pool_id, %ip_id, "external address deleted");
        Ok(())
    }
}

/// Every address a pool can hand out, individual addresses first.
pub(crate) fn pool_addresses(pool: &Pool) -> impl Iterator<Item = Ipv4Addr> + '_ {
    let singles = pool.ips.iter().map(|i| i.address);
    let blocks = pool
        .subnets
        .iter()
        .filter_map(|s| parse_cidr(&s.cidr).ok())
        .flat_map(|block| block.iter());
    singles.chain(blocks)
}

/// Whether any member of `pool` covers `address`.
pub(crate) fn owns(pool: &Pool, address: Ipv4Addr) -> bool {
    pool.ips.iter().any(|i| i.address == address)
        || pool
            .subnets
            .iter()
            .filter_map(|s| parse_cidr(&s.cidr).ok())
            .any(|block| block.contains(address))
}

/// Members of `next` that are new or changed, and IDs of `current` that are gone.
fn reconcile<'a>(current: &'a Pool, next: &'a Pool) -> PoolDelta<'a> {
    let old_subnets: HashMap<&str, &ExternalSubnet> =
        current.subnets.iter().map(|s| (s.id.as_str(), s)).collect();
    let new_subnet_ids: BTreeSet<&str> = next.subnets.iter().map(|s| s.id.as_str()).collect();
    let old_ips: HashMap<&str, &ExternalIP> = current.ips.iter().map(|i| (i.id.as_str(), i)).collect();
    let new_ip_ids: BTreeSet<&str> = next.ips.iter().map(|i| i.id.as_str()).collect();

    PoolDelta {
        added_subnets: next
            .subnets
            .iter()
            .filter(|s| old_subnets.get(s.id.as_str()) != Some(s))
            .collect(),
        removed_subnets: current
            .subnets
            .iter()
            .map(|s| s.id.as_str())
            .filter(|id| !new_subnet_ids.contains(id))
            .collect(),
        added_ips: next
            .ips
            .iter()
            .filter(|i| old_ips.get(i.id.as_str()) != Some(i))
            .collect(),
        removed_ips: current
            .ips
            .iter()
            .map(|i| i.id.as_str())
            .filter(|id| !new_ip_ids.contains(id))
            .collect(),
    }
}

fn check_unique_ids(pool: &Pool) -> DatastoreResult<()> {
    // Members are sorted by ID, so duplicates are adjacent.
    if pool.subnets.windows(2).any(|w| w[0].id == w[1].id) {
        return Err(DatastoreError::Invalid(format!("duplicate subnet ID in pool {}", pool.id)));
    }
    if pool.ips.windows(2).any(|w| w[0].id == w[1].id) {
        return Err(DatastoreError::Invalid(format!("duplicate address ID in pool {}", pool.id)));
    }
    Ok(())
}

/// Sort members and rewrite subnet CIDRs in normalized form.
fn canonicalize(pool: &mut Pool) -> DatastoreResult<()> {
    for subnet in &mut pool.subnets {
        subnet.cidr = parse_cidr(&subnet.cidr)?.to_string();
    }
    pool.normalize();
    Ok(())
}

/// A mapped address must stay covered by a member.
fn check_mapped(pool: &Pool) -> DatastoreResult<()> {
    match pool.mapped.iter().find(|&&a| !owns(pool, a)) {
        Some(address) => Err(DatastoreError::Conflict(format!(
            "address {address} in pool {} is mapped",
            pool.id
        ))),
        None => Ok(()),
    }
}

/// Each member as an address block, labelled for error messages.
fn member_blocks(pool: &Pool) -> DatastoreResult<Vec<(String, Ipv4Network)>> {
    let mut blocks = Vec::with_capacity(pool.subnets.len() + pool.ips.len());
    for s in &pool.subnets {
        blocks.push((format!("subnet {}", s.cidr), parse_cidr(&s.cidr)?));
    }
    for i in &pool.ips {
        let block = Ipv4Network::new(i.address, 32)
            .map_err(|e| DatastoreError::Invalid(format!("address {}: {e}", i.address)))?;
        blocks.push((format!("address {}", i.address), block));
    }
    Ok(blocks)
}

/// No address is covered by two members, in this pool or any other.
fn check_ownership(cache: &BTreeMap<String, Pool>, pool: &Pool) -> DatastoreResult<()> {
    let mine = member_blocks(pool)?;
    for (i, (label, block)) in mine.iter().enumerate() {
        if let Some((other, _)) = mine[i + 1..].iter().find(|(_, b)| overlaps(block, b)) {
            return Err(DatastoreError::Invalid(format!(
                "{label} overlaps {other} in pool {}",
                pool.id
            )));
        }
    }

    for other in cache.values().filter(|p| p.id != pool.id) {
        let theirs = member_blocks(other)?;
        for (label, block) in &mine {
            if let Some((their, _)) = theirs.iter().find(|(_, b)| overlaps(block, b)) {
                return Err(DatastoreError::Conflict(format!(
                    "{label} overlaps {their} of pool {}",
                    other.name
                )));
            }
        }
    }
    Ok(())
}

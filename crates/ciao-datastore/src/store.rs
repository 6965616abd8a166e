//! The redb-backed source of truth.
//!
//! Provides typed CRUD over every datastore table. All values are
//! JSON-serialized into redb's `&[u8]` value columns. The store supports
//! both on-disk and in-memory backends (the latter for testing).
//!
//! Nothing here caches: every read is a durable-tier round trip. The
//! repositories in [`crate::repo`] layer the in-memory tier on top.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableHandle, WriteTransaction};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{DatastoreError, DatastoreResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `DatastoreError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| DatastoreError::$variant(e.to_string())
    };
}

/// Membership changes to apply to a pool in one transaction.
#[derive(Debug, Default)]
pub(crate) struct PoolDelta<'a> {
    pub added_subnets: Vec<&'a ExternalSubnet>,
    pub removed_subnets: Vec<&'a str>,
    pub added_ips: Vec<&'a ExternalIP>,
    pub removed_ips: Vec<&'a str>,
}

/// Thread-safe durable store backed by redb.
#[derive(Clone)]
pub struct DurableStore {
    db: Arc<Database>,
}

impl DurableStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> DatastoreResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "durable store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> DatastoreResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory durable store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> DatastoreResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        for table in ALL_TABLES {
            txn.open_table(table).map_err(map_err!(Table))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic helpers ────────────────────────────────────────────

    fn put<T: Serialize>(&self, table: Table, key: &str, value: &T) -> DatastoreResult<()> {
        let value = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            t.insert(key, value.as_slice()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Insert only if `key` is absent, inside one write transaction.
    fn insert_new<T: Serialize>(&self, table: Table, key: &str, value: &T) -> DatastoreResult<()> {
        let value = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            if t.get(key).map_err(map_err!(Read))?.is_some() {
                return Err(DatastoreError::Conflict(format!(
                    "{} already exists in {}",
                    key,
                    table.name()
                )));
            }
            t.insert(key, value.as_slice()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get<T: DeserializeOwned>(&self, table: Table, key: &str) -> DatastoreResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table).map_err(map_err!(Table))?;
        match t.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value = serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn list<T: DeserializeOwned>(&self, table: Table) -> DatastoreResult<Vec<T>> {
        self.list_filtered(table, |_| true)
    }

    fn list_prefix<T: DeserializeOwned>(&self, table: Table, prefix: &str) -> DatastoreResult<Vec<T>> {
        self.list_filtered(table, |key| key.starts_with(prefix))
    }

    fn list_filtered<T, F>(&self, table: Table, keep: F) -> DatastoreResult<Vec<T>>
    where
        T: DeserializeOwned,
        F: Fn(&str) -> bool,
    {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in t.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if keep(key.value()) {
                let item = serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(item);
            }
        }
        Ok(results)
    }

    fn remove(&self, table: Table, key: &str) -> DatastoreResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            existed = t.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    // ── Tenants ────────────────────────────────────────────────────

    /// Insert a new tenant. Fails with `Conflict` if it already exists.
    pub fn add_tenant(&self, tenant: &Tenant) -> DatastoreResult<()> {
        self.insert_new(TENANTS, &tenant.id, tenant)?;
        debug!(tenant_id = %tenant.id, "tenant stored");
        Ok(())
    }

    /// Replace an existing tenant record.
    pub fn update_tenant(&self, tenant: &Tenant) -> DatastoreResult<()> {
        self.put(TENANTS, &tenant.id, tenant)
    }

    /// Get a tenant, with its devices assembled from the block-device table.
    pub fn get_tenant(&self, tenant_id: &str) -> DatastoreResult<Option<Tenant>> {
        let Some(mut tenant) = self.get::<Tenant>(TENANTS, tenant_id)? else {
            return Ok(None);
        };
        tenant.devices = self.get_tenant_devices(tenant_id)?;
        Ok(Some(tenant))
    }

    /// List all tenants, each with its devices.
    pub fn list_tenants(&self) -> DatastoreResult<Vec<Tenant>> {
        let mut tenants: Vec<Tenant> = self.list(TENANTS)?;
        let mut devices: BTreeMap<String, BTreeMap<String, BlockData>> = BTreeMap::new();
        for block in self.list_block_data()? {
            devices
                .entry(block.tenant_id.clone())
                .or_default()
                .insert(block.id.clone(), block);
        }
        for tenant in &mut tenants {
            tenant.devices = devices.remove(&tenant.id).unwrap_or_default();
        }
        Ok(tenants)
    }

    // ── Instances ──────────────────────────────────────────────────

    /// Insert a new instance. Fails with `Conflict` on a duplicate ID.
    pub fn add_instance(&self, instance: &Instance) -> DatastoreResult<()> {
        self.insert_new(INSTANCES, &instance.id, instance)
    }

    /// Replace an existing instance record.
    pub fn update_instance(&self, instance: &Instance) -> DatastoreResult<()> {
        self.put(INSTANCES, &instance.id, instance)
    }

    pub fn get_instance(&self, instance_id: &str) -> DatastoreResult<Option<Instance>> {
        self.get(INSTANCES, instance_id)
    }

    pub fn list_instances(&self) -> DatastoreResult<Vec<Instance>> {
        self.list(INSTANCES)
    }

    /// Delete an instance by ID. Returns true if it existed.
    pub fn delete_instance(&self, instance_id: &str) -> DatastoreResult<bool> {
        let existed = self.remove(INSTANCES, instance_id)?;
        debug!(%instance_id, existed, "instance deleted");
        Ok(existed)
    }

    // ── Workloads ──────────────────────────────────────────────────

    /// Insert or replace a workload template.
    pub fn put_workload(&self, workload: &Workload) -> DatastoreResult<()> {
        self.put(WORKLOADS, &workload.id, workload)?;
        debug!(workload_id = %workload.id, "workload stored");
        Ok(())
    }

    pub fn get_workload(&self, workload_id: &str) -> DatastoreResult<Option<Workload>> {
        self.get(WORKLOADS, workload_id)
    }

    pub fn list_workloads(&self) -> DatastoreResult<Vec<Workload>> {
        self.list(WORKLOADS)
    }

    // ── Pools ──────────────────────────────────────────────────────

    /// Insert a pool header and all its members in one transaction.
    ///
    /// Pool IDs may not contain the member key separator.
    pub fn create_pool(&self, pool: &Pool) -> DatastoreResult<()> {
        check_pool_id(&pool.id)?;
        let header = serde_json::to_vec(&PoolRecord::from(pool)).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut pools = txn.open_table(POOLS).map_err(map_err!(Table))?;
            if pools.get(pool.id.as_str()).map_err(map_err!(Read))?.is_some() {
                return Err(DatastoreError::Conflict(format!("pool {} already exists", pool.id)));
            }
            pools
                .insert(pool.id.as_str(), header.as_slice())
                .map_err(map_err!(Write))?;
        }
        let delta = PoolDelta {
            added_subnets: pool.subnets.iter().collect(),
            added_ips: pool.ips.iter().collect(),
            ..PoolDelta::default()
        };
        write_pool_members(&txn, &pool.id, &delta)?;
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(pool_id = %pool.id, name = %pool.name, "pool stored");
        Ok(())
    }

    /// Rewrite a pool header and apply a membership delta in one transaction.
    pub(crate) fn apply_pool_delta(&self, pool: &Pool, delta: &PoolDelta<'_>) -> DatastoreResult<()> {
        let header = serde_json::to_vec(&PoolRecord::from(pool)).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut pools = txn.open_table(POOLS).map_err(map_err!(Table))?;
            pools
                .insert(pool.id.as_str(), header.as_slice())
                .map_err(map_err!(Write))?;
        }
        write_pool_members(&txn, &pool.id, delta)?;
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(
            pool_id = %pool.id,
            subnets_added = delta.added_subnets.len(),
            subnets_removed = delta.removed_subnets.len(),
            ips_added = delta.added_ips.len(),
            ips_removed = delta.removed_ips.len(),
            "pool updated"
        );
        Ok(())
    }

    /// Get a pool with its members.
    pub fn get_pool(&self, pool_id: &str) -> DatastoreResult<Option<Pool>> {
        let Some(record) = self.get::<PoolRecord>(POOLS, pool_id)? else {
            return Ok(None);
        };
        self.assemble_pool(record).map(Some)
    }

    /// List all pools with their members.
    pub fn list_pools(&self) -> DatastoreResult<Vec<Pool>> {
        let records: Vec<PoolRecord> = self.list(POOLS)?;
        records.into_iter().map(|r| self.assemble_pool(r)).collect()
    }

    fn assemble_pool(&self, record: PoolRecord) -> DatastoreResult<Pool> {
        let prefix = member_key(&record.id, "");
        let mut pool = Pool {
            subnets: self.list_prefix(POOL_SUBNETS, &prefix)?,
            ips: self.list_prefix(POOL_ADDRESSES, &prefix)?,
            id: record.id,
            name: record.name,
            free: record.free,
            total_ips: record.total_ips,
            mapped: record.mapped,
        };
        pool.normalize();
        Ok(pool)
    }

    /// Delete a pool and all its members. Returns true if it existed.
    pub fn delete_pool(&self, pool_id: &str) -> DatastoreResult<bool> {
        let prefix = member_key(pool_id, "");
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut pools = txn.open_table(POOLS).map_err(map_err!(Table))?;
            existed = pools.remove(pool_id).map_err(map_err!(Write))?.is_some();
        }
        for table in [POOL_SUBNETS, POOL_ADDRESSES] {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            t.retain(|key, _| !key.starts_with(&prefix))
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%pool_id, existed, "pool deleted");
        Ok(existed)
    }

    // ── Mapped IPs ─────────────────────────────────────────────────

    /// Insert a mapped IP. Fails with `Conflict` on a duplicate ID.
    pub fn add_mapped_ip(&self, mapped: &MappedIP) -> DatastoreResult<()> {
        self.insert_new(MAPPED_IPS, &mapped.id, mapped)
    }

    /// All mapped IPs keyed by external address.
    pub fn list_mapped_ips(&self) -> DatastoreResult<BTreeMap<Ipv4Addr, MappedIP>> {
        let all: Vec<MappedIP> = self.list(MAPPED_IPS)?;
        Ok(all.into_iter().map(|m| (m.external_ip, m)).collect())
    }

    pub fn delete_mapped_ip(&self, mapping_id: &str) -> DatastoreResult<bool> {
        self.remove(MAPPED_IPS, mapping_id)
    }

    // ── Storage attachments ────────────────────────────────────────

    pub fn add_storage_attachment(&self, attachment: &StorageAttachment) -> DatastoreResult<()> {
        self.insert_new(ATTACHMENTS, &attachment.id, attachment)
    }

    pub fn get_storage_attachment(&self, attachment_id: &str) -> DatastoreResult<Option<StorageAttachment>> {
        self.get(ATTACHMENTS, attachment_id)
    }

    pub fn list_storage_attachments(&self) -> DatastoreResult<Vec<StorageAttachment>> {
        self.list(ATTACHMENTS)
    }

    pub fn delete_storage_attachment(&self, attachment_id: &str) -> DatastoreResult<bool> {
        self.remove(ATTACHMENTS, attachment_id)
    }

    // ── Block devices ──────────────────────────────────────────────

    pub fn add_block_data(&self, block: &BlockData) -> DatastoreResult<()> {
        self.insert_new(BLOCK_DEVICES, &block.id, block)
    }

    pub fn update_block_data(&self, block: &BlockData) -> DatastoreResult<()> {
        self.put(BLOCK_DEVICES, &block.id, block)
    }

    pub fn get_block_data(&self, block_id: &str) -> DatastoreResult<Option<BlockData>> {
        self.get(BLOCK_DEVICES, block_id)
    }

    pub fn list_block_data(&self) -> DatastoreResult<Vec<BlockData>> {
        self.list(BLOCK_DEVICES)
    }

    /// Block devices owned by one tenant, keyed by device ID.
    pub fn get_tenant_devices(&self, tenant_id: &str) -> DatastoreResult<BTreeMap<String, BlockData>> {
        Ok(self
            .list_block_data()?
            .into_iter()
            .filter(|b| b.tenant_id == tenant_id)
            .map(|b| (b.id.clone(), b))
            .collect())
    }

    pub fn delete_block_data(&self, block_id: &str) -> DatastoreResult<bool> {
        self.remove(BLOCK_DEVICES, block_id)
    }
}

/// Member keys are `{pool_id}:{member_id}`, so a `:` in a pool ID would let
/// one pool's prefix scan reach into another's members.
pub(crate) fn check_pool_id(pool_id: &str) -> DatastoreResult<()> {
    if pool_id.is_empty() || pool_id.contains(MEMBER_KEY_SEPARATOR) {
        return Err(DatastoreError::Invalid(format!("bad pool ID {pool_id:?}")));
    }
    Ok(())
}

/// Apply pool member inserts and removals inside an open transaction.
fn write_pool_members(txn: &WriteTransaction, pool_id: &str, delta: &PoolDelta<'_>) -> DatastoreResult<()> {
    {
        let mut subnets = txn.open_table(POOL_SUBNETS).map_err(map_err!(Table))?;
        for id in &delta.removed_subnets {
            subnets
                .remove(member_key(pool_id, id).as_str())
                .map_err(map_err!(Write))?;
        }
        for subnet in &delta.added_subnets {
            let value = serde_json::to_vec(subnet).map_err(map_err!(Serialize))?;
            subnets
                .insert(member_key(pool_id, &subnet.id).as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
    }
    {
        let mut ips = txn.open_table(POOL_ADDRESSES).map_err(map_err!(Table))?;
        for id in &delta.removed_ips {
            ips.remove(member_key(pool_id, id).as_str())
                .map_err(map_err!(Write))?;
        }
        for ip in &delta.added_ips {
            let value = serde_json::to_vec(ip).map_err(map_err!(Serialize))?;
            ips.insert(member_key(pool_id, &ip.id).as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
    }
    Ok(())
}

use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;

use crate::compactor;
use crate::engine::EngagementStore;
use crate::limits::*;
use crate::repository::DurableUserRepository;

pub type TenantStore = EngagementStore<DurableUserRepository>;

/// One engagement store per tenant, each with its own WAL and compactor.
/// Tenant = database name from the pgwire connection.
pub struct TenantManager {
    stores: DashMap<String, Arc<TenantStore>>,
    data_dir: PathBuf,
    compact_threshold: u64,
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64) -> Self {
        Self {
            stores: DashMap::new(),
            data_dir,
            compact_threshold,
        }
    }

    /// Get or lazily open the store for `tenant`.
    pub fn get_or_create(&self, tenant: &str) -> std::io::Result<Arc<TenantStore>> {
        if let Some(store) = self.stores.get(tenant) {
            return Ok(store.value().clone());
        }
        if tenant.len() > MAX_TENANT_NAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "tenant name too long",
            ));
        }

        // The name becomes the WAL file name, so it must already be a plain
        // file stem. Filtering instead would map `my.db` and `mydb` onto
        // one file behind two stores.
        if tenant.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty tenant name",
            ));
        }
        if !tenant
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid tenant name {tenant:?}: use letters, digits, '_' or '-'"),
            ));
        }

        // len() locks every shard, so check it before holding the entry.
        if self.stores.len() >= MAX_TENANTS {
            return Err(std::io::Error::other("too many tenants"));
        }

        // Two connections may race to open the same tenant; the entry lock
        // makes sure only one repository (and one WAL writer) is created.
        let entry = self.stores.entry(tenant.to_string());
        if let dashmap::mapref::entry::Entry::Occupied(existing) = &entry {
            return Ok(existing.get().clone());
        }

        let wal_path = self.data_dir.join(format!("{tenant}.wal"));
        let repo = Arc::new(DurableUserRepository::open(wal_path)?);
        tokio::spawn(compactor::run_compactor(repo.clone(), self.compact_threshold));

        let store = Arc::new(EngagementStore::new(repo));
        entry.or_insert(store.clone());
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.stores.len() as f64);
        tracing::info!("opened tenant {tenant}");
        Ok(store)
    }
}

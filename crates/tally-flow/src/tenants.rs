//! Tenant enumeration.

use std::collections::BTreeSet;

use async_trait::async_trait;
use tally_core::TenantId;

use crate::error::Result;

/// Source of the tenants a reseller-wide run consolidates.
#[async_trait]
pub trait TenantDirectory: Send + Sync {
    /// Returns every tenant eligible for consolidation.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be read.
    async fn eligible_tenants(&self) -> Result<Vec<TenantId>>;
}

/// Directory over a fixed tenant list.
#[derive(Debug, Clone, Default)]
pub struct StaticTenantDirectory {
    tenants: Vec<TenantId>,
}

impl StaticTenantDirectory {
    /// Creates a directory listing `tenants`.
    #[must_use]
    pub fn new(tenants: impl IntoIterator<Item = TenantId>) -> Self {
        Self {
            tenants: tenants.into_iter().collect(),
        }
    }
}

#[async_trait]
impl TenantDirectory for StaticTenantDirectory {
    async fn eligible_tenants(&self) -> Result<Vec<TenantId>> {
        Ok(self.tenants.clone())
    }
}

/// Drops excluded tenants and repeats, keeping first-seen order.
#[must_use]
pub fn filter_tenants(tenants: Vec<TenantId>, excluded: &BTreeSet<TenantId>) -> Vec<TenantId> {
    let mut seen = BTreeSet::new();
    tenants
        .into_iter()
        .filter(|t| !excluded.contains(t) && seen.insert(t.clone()))
        .collect()
}

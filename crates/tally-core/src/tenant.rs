//! Tenant identifiers.
//!
//! A tenant is the unit of billing data being merged: one customer billing
//! account. Tenant IDs travel in task payloads, key per-tenant records in the
//! run document and, in single-tenant mode, name shard tables.
//!
//! # Example
//!
//! ```rust
//! use tally_core::tenant::TenantId;
//!
//! let tenant = TenantId::new("01A2B3-C4D5E6-F7A8B9").unwrap();
//! assert_eq!(tenant.table_suffix(), "01A2B3_C4D5E6_F7A8B9");
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Maximum accepted tenant ID length.
pub const MAX_TENANT_ID_LEN: usize = 128;

/// A validated tenant identifier.
///
/// Tenant IDs must be:
/// - Non-empty and at most [`MAX_TENANT_ID_LEN`] characters
/// - ASCII alphanumeric, `-` or `_`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TenantId(String);

impl TenantId {
    /// Creates a new tenant ID after validating the format.
    ///
    /// # Errors
    ///
    /// Returns an error if the tenant ID is invalid.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        Self::validate(&id)?;
        Ok(Self(id))
    }

    /// Returns the tenant ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the suffix used when naming tables owned by this tenant.
    ///
    /// Hyphens are not valid in table names, so they become underscores.
    #[must_use]
    pub fn table_suffix(&self) -> String {
        self.0.replace('-', "_")
    }

    fn validate(id: &str) -> Result<()> {
        if id.is_empty() {
            return Err(Error::InvalidId {
                message: "tenant ID cannot be empty".to_string(),
            });
        }

        if id.len() > MAX_TENANT_ID_LEN {
            return Err(Error::InvalidId {
                message: format!(
                    "tenant ID '{id}' is too long (maximum {MAX_TENANT_ID_LEN} characters)"
                ),
            });
        }

        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(Error::InvalidId {
                message: format!(
                    "tenant ID '{id}' contains invalid characters (only letters, digits, hyphens and underscores allowed)"
                ),
            });
        }

        Ok(())
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for TenantId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for TenantId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl TryFrom<String> for TenantId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<TenantId> for String {
    fn from(value: TenantId) -> Self {
        value.0
    }
}

//! Content host reconciliation engine: import (rows -> remote) and export (remote -> rows).

use std::num::ParseIntError;

use hostsync_inventory::InventoryError;
use thiserror::Error;

pub mod config;
pub mod driver;
pub mod export;
pub mod index;
pub mod matcher;
pub mod projector;

pub use config::{CustomColumn, ExportOptions, ImportOptions, Settings};
pub use driver::{
    FinalizeReport, HostAction, HostOutcome, ImportRun, ImportSummary, RowOutcome,
    SubscriptionReport, SubscriptionResult,
};
pub use export::{ExportTable, ExportWalker};
pub use index::{list_all_hosts, ExistingIndex, PAGE_SIZE};
pub use matcher::{SubscriptionCriteria, SubscriptionLine};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("{0}")]
    Precondition(String),
    #[error("content host '{name}' must already exist with --itemized-subscriptions")]
    HostMustExist { name: String },
    #[error("content host '{hypervisor}' not found (hypervisor of '{guest}')")]
    HypervisorNotFound { hypervisor: String, guest: String },
    #[error("row is missing required column '{0}'")]
    MissingColumn(&'static str),
    #[error("organization '{0}' not found")]
    UnknownOrganization(String),
    #[error("{kind} '{name}' not found in organization '{organization}'")]
    UnknownReference {
        kind: &'static str,
        name: String,
        organization: String,
    },
    #[error("no matching subscription for {criteria}")]
    NoMatchingSubscription { criteria: String },
    #[error("invalid {column} value '{value}': {source}")]
    InvalidNumber {
        column: &'static str,
        value: String,
        #[source]
        source: ParseIntError,
    },
    #[error("malformed {column} value '{value}': {reason}")]
    Malformed {
        column: &'static str,
        value: String,
        reason: String,
    },
    #[error(transparent)]
    Inventory(#[from] InventoryError),
}

impl ReconcileError {
    /// Row-scoped failures abort only the current row; remote failures end the run.
    pub fn is_row_scoped(&self) -> bool {
        !matches!(self, Self::Inventory(_))
    }

    pub(crate) fn invalid_number(
        column: &'static str,
        value: Option<&str>,
    ) -> impl FnOnce(ParseIntError) -> Self {
        let value = value.unwrap_or_default().to_string();
        move |source| Self::InvalidNumber {
            column,
            value,
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_failures_are_not_row_scoped() {
        let remote = ReconcileError::Inventory(InventoryError::not_found("host", 4));
        assert!(!remote.is_row_scoped());
        assert!(ReconcileError::HostMustExist { name: "h".into() }.is_row_scoped());
        assert!(ReconcileError::NoMatchingSubscription {
            criteria: "sku=RH1".into()
        }
        .is_row_scoped());
    }
}

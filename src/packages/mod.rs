use async_trait::async_trait;

use crate::error::Result;
use crate::types::{Product, ProductInventory};

pub mod zypper;
pub use zypper::Zypper;

/// What the package manager knows about installed products.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledProducts {
    pub base: Product,
    pub inventory: ProductInventory,
}

#[async_trait]
pub trait PackageManager: Send + Sync {
    async fn installed_products(&self) -> Result<InstalledProducts>;

    /// Command line of a running package manager transaction, if any.
    /// Failing to find out is an error, never "idle".
    async fn running_transaction(&self) -> Result<Option<String>>;
}

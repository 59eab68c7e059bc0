//! Access to the profile table that holds quota counters.
//!
//! The [`QuotaStore`] trait is the seam between the reconciler and the row store. Production
//! uses [`PostgrestStore`], which talks to the table over the PostgREST HTTP interface;
//! tests inject [`InMemoryStore`].

use async_trait::async_trait;

use crate::types::{QuotaIncrement, UserId, UserQuotaRecord};

pub mod errors;
pub mod in_memory;
pub mod postgrest;

pub use errors::StoreError;
pub use in_memory::{InMemoryStore, StoreWrite};
pub use postgrest::PostgrestStore;

/// Row store holding per-user quota state.
///
/// Every method is a single round trip. Writes are keyed by profile id and touch only the
/// columns they name; a write that matches no row fails with [`StoreError::NotFound`].
#[async_trait]
pub trait QuotaStore: Send + Sync {
    /// Fetch every profile with `auto_scraper_enabled = true`, projected to the columns of
    /// [`UserQuotaRecord`]. No matching rows is an empty vector, not an error.
    async fn fetch_candidates(&self) -> Result<Vec<UserQuotaRecord>, StoreError>;

    /// Set `auto_scraper_enabled = false` on one profile.
    async fn disable_auto_scraper(&self, id: &UserId) -> Result<(), StoreError>;

    /// Write the counter triple of `increment` to one profile as a single row update.
    async fn record_increment(&self, id: &UserId, increment: &QuotaIncrement) -> Result<(), StoreError>;
}

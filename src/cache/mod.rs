//! Read caching for remote table queries.
//!
//! - `RequestCache` deduplicates concurrent and rapid-repeat reads in memory
//! - `QueryKey` derives stable cache keys from a table and query

mod key;
mod layer;

pub use key::QueryKey;
pub use layer::RequestCache;

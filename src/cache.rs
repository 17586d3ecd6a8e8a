pub mod entity_cache;
pub mod tiers;

pub use entity_cache::{CacheStats, EntityCache, Lookup};
pub use tiers::{BasicPlayer, EntityCaches, Tier};

pub mod cache;
pub mod memory;
pub mod postgres;
pub mod redis;

mod macros;

pub use cache::{Cache, CacheKey, CacheStats, CacheStore, CacheTier, CacheTtls, CacheWriterHandle};
pub use memory::MemoryStore;
pub use postgres::create_pool;
pub use redis::RedisStore;

pub mod postgres;
pub mod redis_cache;
pub mod redis_stream;
pub mod settlement;

pub use postgres::PostgresStore;
pub use redis_cache::RedisCache;
pub use redis_stream::RedisTriggerStream;
pub use settlement::{RetryPolicy, SettlementClient};

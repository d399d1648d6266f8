pub mod config;
pub mod file_store;
pub mod redis_store;

pub use config::{JobStore, StoreConfig};
pub use file_store::FileStore;
pub use redis_store::RedisStore;

mod presence_store_redis;

pub use presence_store_redis::*;

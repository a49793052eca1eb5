mod order_counter;
mod rocksdb;
mod seed;

pub use order_counter::RocksDbOrderCounter;
pub use rocksdb::{RocksDbStorage, StorageConfig};
pub use seed::{default_staff, seed_users};

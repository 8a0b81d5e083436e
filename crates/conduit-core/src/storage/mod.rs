pub(crate) mod keys;
mod rocksdb;
mod traits;

pub use self::rocksdb::RocksDbStorage;
pub use traits::{IndexKind, Storage, WriteBatchOp};

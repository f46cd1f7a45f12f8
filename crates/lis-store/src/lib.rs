//! # LIS Store
//!
//! 类型化仓储接口及其两种实现: 内存存储(测试/单机)与PostgreSQL存储。
//! 业务层只依赖trait, 不接触查询文本。

pub mod memory;
pub mod postgres;
pub mod repository;

pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use repository::*;

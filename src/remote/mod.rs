pub mod buffer_remote;
pub mod database;
pub mod fair;

pub use buffer_remote::BufferRemote;
pub use database::{Database, DatabaseClient};
pub use fair::{DistributionQuery, FairClient, UrlInfo};

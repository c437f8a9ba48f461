pub mod insert;
pub mod pool;

pub use insert::{bulk_insert, count_rows, prepare_rows, InsertRow, OnConflict};
pub use pool::{BarDatabase, ConnectionLease, DbPool};

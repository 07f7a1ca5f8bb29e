//! Data-access handle for the model engine.
//!
//! The engine never depends on more than [`SQLStore`]: positional-parameter
//! queries, statements, and a connection checkout for transactions.

pub mod error;
pub mod sqlite;
pub mod traits;

pub use error::SQLError;
pub use sqlite::{SqliteConnection, SqliteStore};
pub use traits::{Row, SQLStore, Value};

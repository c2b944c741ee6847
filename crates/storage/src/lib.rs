pub mod changeset;
pub mod error;
pub mod schema;
pub mod sqlite;
pub mod traits;

pub use changeset::{Changeset, ChangesetEntry};
pub use error::StorageError;
pub use sqlite::SqliteStore;
pub use traits::*;

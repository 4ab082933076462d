pub mod images;

pub use images::ImageRepository;

use super::{DatabaseError, establish_connection};
use rusqlite::Connection;
use std::path::Path;

/// Repositories open a fresh connection per operation; it is closed when the
/// returned handle drops, whichever way the operation exits.
pub trait Repository {
    fn db_path(&self) -> &Path;

    fn get_connection(&self) -> Result<Connection, DatabaseError> {
        establish_connection(self.db_path())
    }
}

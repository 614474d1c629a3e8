//! In-memory extent index and the structures layered on it: the resumable
//! key buffer the moving collector scans with, and the data-insertion path
//! that commits relocated extents.

pub mod insert;
pub mod keybuf;
pub mod tree;

pub use insert::InsertPath;
pub use keybuf::{Keybuf, PendingKey, DEFAULT_KEYBUF_CAPACITY};
pub use tree::ExtentTree;

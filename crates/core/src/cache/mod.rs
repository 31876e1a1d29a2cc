//! In-memory configuration snapshots.
//!
//! Both caches hold an immutable snapshot behind an `RwLock<Arc<_>>`: readers
//! clone the current `Arc` and keep a consistent view for as long as they
//! like; the single writer (the sync engine) builds a replacement off to the
//! side and swaps it in. A failed rebuild leaves the previous snapshot in
//! place.

mod meters;
mod registers;

pub use meters::{MeterCache, MeterEntry, MeterSnapshot};
pub use registers::{RegisterCache, RegisterSnapshot};

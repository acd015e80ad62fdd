pub mod memory;
pub mod sysfs;

use std::io;
use std::os::fd::OwnedFd;

pub use memory::MemoryStorage;
pub use sysfs::{SYSFS_GPIO_PATH, SysfsStorage};

/// File access used by [`Pin`](crate::Pin). Paths are relative to the
/// storage's base directory, e.g. `gpio1/value` or `export`.
pub trait PinStorage: Send + Sync {
    /// Reads at most `buf.len()` bytes with a single read call.
    fn read(&self, path: &str, buf: &mut [u8]) -> io::Result<usize>;
    fn write(&self, path: &str, data: &[u8]) -> io::Result<()>;
    /// Opens the file read-write and hands back the owned descriptor, for
    /// registration with a [`Watcher`](crate::Watcher).
    fn open(&self, path: &str) -> io::Result<OwnedFd>;
}

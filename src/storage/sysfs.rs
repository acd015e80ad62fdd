use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};

use super::PinStorage;

pub const SYSFS_GPIO_PATH: &str = "/sys/class/gpio";

pub struct SysfsStorage {
    base: PathBuf,
}

impl SysfsStorage {
    pub fn new<P: AsRef<Path>>(base: P) -> Self {
        Self {
            base: base.as_ref().to_path_buf(),
        }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }
}

impl Default for SysfsStorage {
    fn default() -> Self {
        Self::new(SYSFS_GPIO_PATH)
    }
}

impl PinStorage for SysfsStorage {
    fn read(&self, path: &str, buf: &mut [u8]) -> io::Result<usize> {
        let mut file = File::open(self.base.join(path))?;
        file.read(buf)
    }

    fn write(&self, path: &str, data: &[u8]) -> io::Result<()> {
        // sysfs attributes take the whole payload in one write
        let mut file = OpenOptions::new().write(true).open(self.base.join(path))?;
        file.write_all(data)
    }

    fn open(&self, path: &str) -> io::Result<OwnedFd> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(self.base.join(path))?;
        Ok(file.into())
    }
}

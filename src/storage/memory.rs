use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use rustix::event::{EventfdFlags, eventfd};

use super::PinStorage;

type ReadHook = Arc<dyn Fn(&str) -> Option<io::Result<Vec<u8>>> + Send + Sync>;
type WriteHook = Arc<dyn Fn(&str, &[u8]) -> io::Result<()> + Send + Sync>;
type OpenHook = Arc<dyn Fn(&str) -> io::Result<()> + Send + Sync>;

/// In-memory [`PinStorage`]. `open` hands out an eventfd; see [`trigger`](Self::trigger).
#[derive(Default)]
pub struct MemoryStorage {
    files: Mutex<FxHashMap<String, Vec<u8>>>,
    reads: Mutex<Vec<String>>,
    writes: Mutex<Vec<(String, Vec<u8>)>>,
    opened: Mutex<FxHashMap<String, OwnedFd>>,
    read_hook: RwLock<Option<ReadHook>>,
    write_hook: RwLock<Option<WriteHook>>,
    open_hook: RwLock<Option<OpenHook>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, path: &str, contents: impl Into<Vec<u8>>) {
        self.files.lock().insert(path.to_string(), contents.into());
    }

    pub fn contents(&self, path: &str) -> Option<Vec<u8>> {
        self.files.lock().get(path).cloned()
    }

    pub fn reads(&self) -> Vec<String> {
        self.reads.lock().clone()
    }

    /// Includes writes a hook rejected.
    pub fn writes(&self) -> Vec<(String, Vec<u8>)> {
        self.writes.lock().clone()
    }

    pub fn on_read<F>(&self, hook: F)
    where
        F: Fn(&str) -> Option<io::Result<Vec<u8>>> + Send + Sync + 'static,
    {
        *self.read_hook.write() = Some(Arc::new(hook));
    }

    pub fn on_write<F>(&self, hook: F)
    where
        F: Fn(&str, &[u8]) -> io::Result<()> + Send + Sync + 'static,
    {
        *self.write_hook.write() = Some(Arc::new(hook));
    }

    pub fn on_open<F>(&self, hook: F)
    where
        F: Fn(&str) -> io::Result<()> + Send + Sync + 'static,
    {
        *self.open_hook.write() = Some(Arc::new(hook));
    }

    pub fn clear_hooks(&self) {
        *self.read_hook.write() = None;
        *self.write_hook.write() = None;
        *self.open_hook.write() = None;
    }

    pub fn opened_fd(&self, path: &str) -> Option<RawFd> {
        self.opened.lock().get(path).map(|fd| fd.as_raw_fd())
    }

    /// Signals the eventfd behind `path`, waking any epoll watching it.
    pub fn trigger(&self, path: &str) -> io::Result<()> {
        let opened = self.opened.lock();
        let fd = opened.get(path).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("{path} was never opened"))
        })?;
        rustix::io::write(fd, &1u64.to_ne_bytes())?;
        Ok(())
    }
}

impl PinStorage for MemoryStorage {
    fn read(&self, path: &str, buf: &mut [u8]) -> io::Result<usize> {
        self.reads.lock().push(path.to_string());

        let hook = self.read_hook.read().clone();
        let data = match hook.and_then(|h| h(path)) {
            Some(result) => result?,
            None => self
                .files
                .lock()
                .get(path)
                .cloned()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, path.to_string()))?,
        };

        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        Ok(n)
    }

    fn write(&self, path: &str, data: &[u8]) -> io::Result<()> {
        self.writes.lock().push((path.to_string(), data.to_vec()));

        let hook = self.write_hook.read().clone();
        if let Some(hook) = hook {
            hook(path, data)?;
        }
        self.files.lock().insert(path.to_string(), data.to_vec());
        Ok(())
    }

    fn open(&self, path: &str) -> io::Result<OwnedFd> {
        let hook = self.open_hook.read().clone();
        if let Some(hook) = hook {
            hook(path)?;
        }

        let fd = eventfd(0, EventfdFlags::CLOEXEC | EventfdFlags::NONBLOCK)?;
        self.opened.lock().insert(path.to_string(), fd.try_clone()?);
        Ok(fd)
    }
}

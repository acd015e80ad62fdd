use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use log::{debug, error, warn};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use rustix::event::{EventfdFlags, epoll, eventfd};

use crate::error::{GpioError, Result};

/// The readiness syscalls a [`Watcher`] needs.
pub trait EventPoll: Send + Sync {
    fn set_nonblocking(&self, fd: BorrowedFd<'_>) -> io::Result<()>;
    /// Adds `fd` to the interest list, edge-triggered.
    fn register(&self, fd: BorrowedFd<'_>) -> io::Result<()>;
    fn wait(&self, ready: &mut Vec<RawFd>, max_events: usize) -> io::Result<()>;
}

pub struct Epoll {
    fd: OwnedFd,
}

impl Epoll {
    pub fn new() -> io::Result<Self> {
        let fd = epoll::create(epoll::CreateFlags::CLOEXEC)?;
        Ok(Self { fd })
    }
}

impl EventPoll for Epoll {
    fn set_nonblocking(&self, fd: BorrowedFd<'_>) -> io::Result<()> {
        rustix::io::ioctl_fionbio(fd, true)?;
        Ok(())
    }

    fn register(&self, fd: BorrowedFd<'_>) -> io::Result<()> {
        let data = epoll::EventData::new_u64(fd.as_raw_fd() as u64);
        epoll::add(
            &self.fd,
            fd,
            data,
            epoll::EventFlags::IN | epoll::EventFlags::ET,
        )?;
        Ok(())
    }

    fn wait(&self, ready: &mut Vec<RawFd>, max_events: usize) -> io::Result<()> {
        let mut events = epoll::EventVec::with_capacity(max_events);
        epoll::wait(&self.fd, &mut events, -1)?;
        ready.extend(events.iter().map(|event| event.data.u64() as RawFd));
        Ok(())
    }
}

type Callback = Arc<dyn Fn() + Send + Sync>;

struct WatchEntry {
    callback: Callback,
    seen_first_event: bool,
}

type Registry = RwLock<FxHashMap<RawFd, WatchEntry>>;

pub struct Watcher {
    poll: Mutex<Option<Arc<dyn EventPoll>>>,
    registry: Arc<Registry>,
    running: AtomicBool,
    // closing these while registered silently ends their epoll registration
    retained: Mutex<Vec<OwnedFd>>,
}

impl Watcher {
    pub fn new() -> Result<Self> {
        Self::with_poller(Epoll::new)
    }

    pub fn with_poller<P, F>(create: F) -> Result<Self>
    where
        P: EventPoll + 'static,
        F: FnOnce() -> io::Result<P>,
    {
        let poll: Arc<dyn EventPoll> = Arc::new(create().map_err(GpioError::Setup)?);
        Ok(Self {
            poll: Mutex::new(Some(poll)),
            registry: Arc::default(),
            running: AtomicBool::new(false),
            retained: Mutex::default(),
        })
    }

    fn poll(&self) -> Result<Arc<dyn EventPoll>> {
        self.poll.lock().clone().ok_or(GpioError::WatcherClosed)
    }

    /// Registers `fd` and the callback to run on each of its edges after the first.
    pub fn add_event<F>(&self, fd: impl AsFd, callback: F) -> Result<()>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let fd = fd.as_fd();
        let raw = fd.as_raw_fd();
        let poll = self.poll()?;

        // edge-triggered descriptors must be non-blocking
        poll.set_nonblocking(fd)
            .map_err(|source| GpioError::Registration { fd: raw, source })?;
        poll.register(fd)
            .map_err(|source| GpioError::Registration { fd: raw, source })?;

        self.registry.write().insert(
            raw,
            WatchEntry {
                callback: Arc::new(callback),
                seen_first_event: false,
            },
        );
        debug!("registered descriptor {raw} for edge events");
        Ok(())
    }

    pub fn add_file(&self, file: OwnedFd) {
        self.retained.lock().push(file);
    }

    /// Runs the wait loop on the calling thread until [`stop_watch`](Self::stop_watch)
    /// is observed or the wait fails for good.
    pub fn watch(&self) -> Result<()> {
        self.watch_until(&AtomicBool::new(false))
    }

    /// Like [`watch`](Self::watch), but also ends once `stop` is set. Unlike
    /// `stop_watch`, a `stop` raised before the loop starts is not lost.
    pub fn watch_until(&self, stop: &AtomicBool) -> Result<()> {
        let poll = self.poll()?;
        self.running.store(true, Ordering::SeqCst);

        let mut ready = Vec::new();
        while self.running.load(Ordering::SeqCst) && !stop.load(Ordering::SeqCst) {
            // room for at least one event even with nothing registered
            let max_events = self.registry.read().len().max(1);

            ready.clear();
            if let Err(e) = poll.wait(&mut ready, max_events) {
                if is_transient(&e) {
                    debug!("transient wait error, retrying: {e}");
                    continue;
                }
                error!("watch loop stopped: {e}");
                self.running.store(false, Ordering::SeqCst);
                return Err(GpioError::FatalWait(e));
            }

            for fd in ready.drain(..) {
                self.dispatch(fd);
            }
        }

        self.running.store(false, Ordering::SeqCst);
        debug!("watch loop stopped on request");
        Ok(())
    }

    /// Asks the loop to stop. A blocked wait is not interrupted, so the loop
    /// only exits after its next wake (see [`waker`](Self::waker)).
    pub fn stop_watch(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Releases the poll context. A loop still blocked in a wait keeps it
    /// alive until that wait returns.
    pub fn close(&self) {
        if self.poll.lock().take().is_some() {
            debug!("watcher closed");
        }
    }

    pub fn registered(&self) -> usize {
        self.registry.read().len()
    }

    /// Whether the next event on `fd` reaches its callback.
    pub fn is_armed(&self, fd: RawFd) -> bool {
        self.registry
            .read()
            .get(&fd)
            .is_some_and(|entry| entry.seen_first_event)
    }

    /// Registers an eventfd whose only job is to wake the wait loop.
    pub fn waker(&self) -> Result<Waker> {
        let fd = eventfd(0, EventfdFlags::CLOEXEC | EventfdFlags::NONBLOCK)
            .map_err(io::Error::from)?;
        self.add_event(&fd, || {})?;
        self.add_file(fd.try_clone()?);
        Ok(Waker { fd })
    }

    fn dispatch(&self, fd: RawFd) {
        let registry = Arc::clone(&self.registry);
        let spawned = thread::Builder::new()
            .name(format!("gpio-event-{fd}"))
            .spawn(move || handle_event(&registry, fd));
        if let Err(e) = spawned {
            warn!("unable to dispatch event for descriptor {fd}: {e}");
        }
    }
}

/// Handle for nudging a blocked [`Watcher::watch`].
pub struct Waker {
    fd: OwnedFd,
}

impl Waker {
    pub fn wake(&self) -> Result<()> {
        rustix::io::write(&self.fd, &1u64.to_ne_bytes()).map_err(io::Error::from)?;
        Ok(())
    }
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

fn handle_event(registry: &Registry, fd: RawFd) {
    let entry = registry
        .read()
        .get(&fd)
        .map(|entry| (Arc::clone(&entry.callback), entry.seen_first_event));
    let Some((callback, seen_first_event)) = entry else {
        debug!("event on unregistered descriptor {fd}");
        return;
    };

    if seen_first_event {
        callback();
    } else {
        debug!("suppressed registration event on descriptor {fd}");
    }

    if let Some(entry) = registry.write().get_mut(&fd) {
        entry.seen_first_event = true;
    }
}

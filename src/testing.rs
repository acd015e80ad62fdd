use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rustix::event::{EventfdFlags, eventfd};

use crate::watch::{EventPoll, Watcher};

type WaitFn = Arc<dyn Fn(&mut Vec<RawFd>, usize) -> io::Result<()> + Send + Sync>;

#[derive(Default)]
struct MockState {
    nonblock_err: Option<io::ErrorKind>,
    register_err: Option<io::ErrorKind>,
    wait_fn: Option<WaitFn>,
    registered: Vec<RawFd>,
}

#[derive(Clone, Default)]
pub(crate) struct MockPoll(Arc<Mutex<MockState>>);

impl MockPoll {
    pub(crate) fn failing(
        nonblock_err: Option<io::ErrorKind>,
        register_err: Option<io::ErrorKind>,
    ) -> Self {
        let poll = Self::default();
        {
            let mut state = poll.0.lock();
            state.nonblock_err = nonblock_err;
            state.register_err = register_err;
        }
        poll
    }

    pub(crate) fn on_wait<F>(&self, f: F)
    where
        F: Fn(&mut Vec<RawFd>, usize) -> io::Result<()> + Send + Sync + 'static,
    {
        self.0.lock().wait_fn = Some(Arc::new(f));
    }

    pub(crate) fn registered(&self) -> Vec<RawFd> {
        self.0.lock().registered.clone()
    }
}

impl EventPoll for MockPoll {
    fn set_nonblocking(&self, _fd: BorrowedFd<'_>) -> io::Result<()> {
        match self.0.lock().nonblock_err {
            Some(kind) => Err(io::Error::new(kind, "nonblock")),
            None => Ok(()),
        }
    }

    fn register(&self, fd: BorrowedFd<'_>) -> io::Result<()> {
        let mut state = self.0.lock();
        if let Some(kind) = state.register_err {
            return Err(io::Error::new(kind, "register"));
        }
        state.registered.push(fd.as_raw_fd());
        Ok(())
    }

    fn wait(&self, ready: &mut Vec<RawFd>, max_events: usize) -> io::Result<()> {
        let wait_fn = self.0.lock().wait_fn.clone();
        match wait_fn {
            Some(f) => f(ready, max_events),
            None => Err(io::Error::other("no wait behaviour set")),
        }
    }
}

pub(crate) fn mock_watcher(poll: &MockPoll) -> Arc<Watcher> {
    let poll = poll.clone();
    Arc::new(Watcher::with_poller(move || Ok(poll)).unwrap())
}

pub(crate) fn test_fd() -> OwnedFd {
    eventfd(0, EventfdFlags::CLOEXEC).unwrap()
}

pub(crate) fn wait_until(cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(1));
    }
}

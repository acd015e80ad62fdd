mod config;
mod error;
mod events;
mod manager;
mod pin;
mod storage;
#[cfg(test)]
mod testing;
mod watch;

pub use config::{AppConfig, PinConfig};
pub use error::{GpioError, Result};
pub use events::{EdgeEvent, EventHub};
pub use manager::GpioManager;
pub use pin::{Direction, Edge, Pin};
pub use storage::{MemoryStorage, PinStorage, SYSFS_GPIO_PATH, SysfsStorage};
pub use watch::{Epoll, EventPoll, Waker, Watcher};

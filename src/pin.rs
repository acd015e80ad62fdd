use std::fmt;
use std::io;
use std::os::fd::AsRawFd;
use std::sync::{Arc, Weak};

use log::debug;
use rustix::io::Errno;
use serde::{Deserialize, Serialize};

use crate::error::{GpioError, Result};
use crate::storage::PinStorage;
use crate::watch::Watcher;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    In,
    #[default]
    Out,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::In => "in",
            Direction::Out => "out",
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Edge {
    #[default]
    None,
    Rising,
    Falling,
    Both,
}

impl Edge {
    pub fn as_str(&self) -> &'static str {
        match self {
            Edge::None => "none",
            Edge::Rising => "rising",
            Edge::Falling => "falling",
            Edge::Both => "both",
        }
    }
}

#[derive(Clone)]
pub struct Pin {
    kernel_id: u32,
    pin_base: String,
    storage: Arc<dyn PinStorage>,
    watcher: Weak<Watcher>,
}

impl fmt::Debug for Pin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pin")
            .field("kernel_id", &self.kernel_id)
            .field("pin_base", &self.pin_base)
            .finish_non_exhaustive()
    }
}

impl Pin {
    /// `pin_base` names the directory that appears under the storage base
    /// once the pin is exported, usually `gpio<kernel_id>`.
    pub fn new(
        kernel_id: u32,
        pin_base: impl Into<String>,
        storage: Arc<dyn PinStorage>,
        watcher: &Arc<Watcher>,
    ) -> Self {
        Self {
            kernel_id,
            pin_base: pin_base.into(),
            storage,
            watcher: Arc::downgrade(watcher),
        }
    }

    pub fn kernel_id(&self) -> u32 {
        self.kernel_id
    }

    pub fn pin_base(&self) -> &str {
        &self.pin_base
    }

    pub fn direction(&self) -> Result<Direction> {
        let mut buf = [0u8; 3];
        let text = self.read_text(&mut buf, "direction")?;
        match text.as_str() {
            "out" => Ok(Direction::Out),
            "in" => Ok(Direction::In),
            _ => Err(GpioError::Parse {
                field: "direction",
                content: text,
            }),
        }
    }

    pub fn set_direction(&self, direction: Direction) -> Result<()> {
        self.write(direction.as_str().as_bytes(), "direction")
    }

    pub fn value(&self) -> Result<u8> {
        self.read_bit("value")
    }

    pub fn set_high(&self) -> Result<()> {
        self.write(b"1", "value")
    }

    pub fn set_low(&self) -> Result<()> {
        self.write(b"0", "value")
    }

    pub fn active_low(&self) -> Result<bool> {
        Ok(self.read_bit("active_low")? == 1)
    }

    pub fn set_active_low(&self, invert: bool) -> Result<()> {
        self.write(if invert { b"1" } else { b"0" }, "active_low")
    }

    pub fn edge(&self) -> Result<Edge> {
        let mut buf = [0u8; 8];
        let text = self.read_text(&mut buf, "edge")?;
        match text.as_str() {
            "rising" => Ok(Edge::Rising),
            "falling" => Ok(Edge::Falling),
            "both" => Ok(Edge::Both),
            "none" => Ok(Edge::None),
            _ => Err(GpioError::Parse {
                field: "edge",
                content: text,
            }),
        }
    }

    /// Registers the value file with the watcher before writing the edge, so
    /// a failed registration leaves the edge file untouched.
    pub fn set_edge<F>(&self, edge: Edge, callback: F) -> Result<()>
    where
        F: Fn(&Pin) + Send + Sync + 'static,
    {
        let watcher = self.watcher.upgrade().ok_or(GpioError::WatcherClosed)?;
        let file = self.storage.open(&self.path("value"))?;

        let pin = self.clone();
        watcher.add_event(&file, move || callback(&pin))?;
        debug!(
            "pin {} watching {} on descriptor {}",
            self.kernel_id,
            edge.as_str(),
            file.as_raw_fd()
        );
        watcher.add_file(file);

        self.write(edge.as_str().as_bytes(), "edge")
    }

    /// Exports the pin. Exporting an already exported pin is not an error.
    pub fn export(&self) -> Result<()> {
        match self.storage.write("export", self.kernel_id.to_string().as_bytes()) {
            Err(e) if is_busy(&e) => {
                debug!("pin {} already exported", self.kernel_id);
                Ok(())
            }
            result => Ok(result?),
        }
    }

    pub fn unexport(&self) -> Result<()> {
        self.storage
            .write("unexport", self.kernel_id.to_string().as_bytes())?;
        Ok(())
    }

    fn path(&self, file: &str) -> String {
        format!("{}/{}", self.pin_base, file)
    }

    fn read(&self, buf: &mut [u8], file: &str) -> Result<usize> {
        Ok(self.storage.read(&self.path(file), buf)?)
    }

    fn write(&self, data: &[u8], file: &str) -> Result<()> {
        Ok(self.storage.write(&self.path(file), data)?)
    }

    fn read_text(&self, buf: &mut [u8], file: &str) -> Result<String> {
        let n = self.read(buf, file)?;
        if n == 0 {
            return Err(GpioError::Range {
                path: self.path(file),
                expected: buf.len(),
                got: 0,
            });
        }
        let text = String::from_utf8_lossy(&buf[..n]);
        Ok(text.trim_end_matches('\n').to_string())
    }

    fn read_bit(&self, file: &'static str) -> Result<u8> {
        let mut buf = [0u8; 1];
        let n = self.read(&mut buf, file)?;
        if n != 1 {
            return Err(GpioError::Range {
                path: self.path(file),
                expected: 1,
                got: n,
            });
        }
        match buf[0] {
            b'1' => Ok(1),
            b'0' => Ok(0),
            other => Err(GpioError::Parse {
                field: file,
                content: char::from(other).to_string(),
            }),
        }
    }
}

fn is_busy(e: &io::Error) -> bool {
    e.raw_os_error() == Some(Errno::BUSY.raw_os_error())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use crate::testing::{MockPoll, mock_watcher};

    fn setup() -> (Pin, Arc<MemoryStorage>, Arc<Watcher>) {
        let storage = Arc::new(MemoryStorage::new());
        let watcher = Arc::new(Watcher::new().unwrap());
        let pin = Pin::new(1, "gpio1", storage.clone(), &watcher);
        (pin, storage, watcher)
    }

    fn busy() -> io::Error {
        io::Error::from_raw_os_error(Errno::BUSY.raw_os_error())
    }

    #[test]
    fn new_pin_keeps_identity() {
        let (pin, _, _) = setup();
        assert_eq!(pin.kernel_id(), 1);
        assert_eq!(pin.pin_base(), "gpio1");
    }

    #[test]
    fn direction_parses_known_values() {
        let (pin, storage, _) = setup();
        let cases = [
            ("out", Some(Direction::Out), None),
            ("in\n", Some(Direction::In), None),
            ("not-a-valid-value", None, Some("Not a known direction: 'not'")),
            ("", None, Some("Expected 3 byte(s) from gpio1/direction, got 0")),
        ];
        for (contents, expected, err) in cases {
            storage.insert("gpio1/direction", contents);
            let result = pin.direction();
            assert_eq!(result.as_ref().ok().copied(), expected);
            assert_eq!(result.as_ref().err().map(|e| e.to_string()).as_deref(), err);
            assert_eq!(result.unwrap_or_default(), expected.unwrap_or(Direction::Out));
            assert_eq!(storage.reads().last().unwrap(), "gpio1/direction");
        }

        storage.on_read(|_| Some(Err(io::Error::other("error"))));
        let err = pin.direction().unwrap_err();
        assert!(matches!(err, GpioError::Io(_)));
        assert_eq!(err.to_string(), "error");
    }

    #[test]
    fn set_direction_writes_field() {
        let (pin, storage, _) = setup();
        pin.set_direction(Direction::In).unwrap();
        assert_eq!(
            storage.writes(),
            vec![("gpio1/direction".to_string(), b"in".to_vec())]
        );
        assert_eq!(pin.direction().unwrap(), Direction::In);
    }

    #[test]
    fn value_requires_single_known_byte() {
        let (pin, storage, _) = setup();
        let cases = [
            ("1", Ok(1)),
            ("0", Ok(0)),
            ("not-a-valid-value", Err("Not a known value: 'n'")),
            ("", Err("Expected 1 byte(s) from gpio1/value, got 0")),
        ];
        for (contents, expected) in cases {
            storage.insert("gpio1/value", contents);
            let result = pin.value().map_err(|e| e.to_string());
            assert_eq!(result, expected.map_err(String::from));
            assert_eq!(storage.reads().last().unwrap(), "gpio1/value");
        }

        storage.on_read(|_| Some(Err(io::Error::other("error"))));
        assert_eq!(pin.value().unwrap_err().to_string(), "error");
    }

    #[test]
    fn set_high_and_low_round_trip() {
        let (pin, storage, _) = setup();

        pin.set_high().unwrap();
        assert_eq!(storage.contents("gpio1/value").unwrap(), b"1");
        assert_eq!(pin.value().unwrap(), 1);

        pin.set_low().unwrap();
        assert_eq!(storage.contents("gpio1/value").unwrap(), b"0");
        assert_eq!(pin.value().unwrap(), 0);
    }

    #[test]
    fn active_low_follows_value_contract() {
        let (pin, storage, _) = setup();
        let cases = [
            ("1", Ok(true)),
            ("0", Ok(false)),
            ("not-a-valid-value", Err("Not a known active_low: 'n'")),
            ("", Err("Expected 1 byte(s) from gpio1/active_low, got 0")),
        ];
        for (contents, expected) in cases {
            storage.insert("gpio1/active_low", contents);
            let result = pin.active_low().map_err(|e| e.to_string());
            assert_eq!(result, expected.map_err(String::from));
        }

        pin.set_active_low(true).unwrap();
        assert_eq!(storage.contents("gpio1/active_low").unwrap(), b"1");
        pin.set_active_low(false).unwrap();
        assert_eq!(storage.contents("gpio1/active_low").unwrap(), b"0");
    }

    #[test]
    fn edge_parses_known_values() {
        let (pin, storage, _) = setup();
        let cases = [
            ("rising\n", Ok(Edge::Rising)),
            ("falling\n", Ok(Edge::Falling)),
            ("none\n", Ok(Edge::None)),
            ("both\n", Ok(Edge::Both)),
            ("not-a-valid-value", Err("Not a known edge: 'not-a-va'")),
            ("", Err("Expected 8 byte(s) from gpio1/edge, got 0")),
        ];
        for (contents, expected) in cases {
            storage.insert("gpio1/edge", contents);
            let result = pin.edge().map_err(|e| e.to_string());
            assert_eq!(result, expected.map_err(String::from));
            assert_eq!(storage.reads().last().unwrap(), "gpio1/edge");
        }
        assert_eq!(pin.edge().unwrap_or_default(), Edge::None);
    }

    #[test]
    fn set_edge_registers_value_before_writing_edge() {
        let (pin, storage, watcher) = setup();

        let weak = Arc::downgrade(&watcher);
        storage.on_write(move |path, _| {
            let registered = weak.upgrade().map(|w| w.registered()).unwrap_or(0);
            if path == "gpio1/edge" && registered != 1 {
                return Err(io::Error::other("edge written before registration"));
            }
            Ok(())
        });

        pin.set_edge(Edge::Rising, |_| {}).unwrap();
        assert_eq!(storage.contents("gpio1/edge").unwrap(), b"rising");
        assert_eq!(watcher.registered(), 1);

        let fd = storage.opened_fd("gpio1/value").unwrap();
        assert!(!watcher.is_armed(fd));
    }

    #[test]
    fn set_edge_leaves_edge_untouched_on_open_failure() {
        let (pin, storage, watcher) = setup();
        storage.on_open(|_| Err(io::Error::from(io::ErrorKind::PermissionDenied)));

        let err = pin.set_edge(Edge::Both, |_| {}).unwrap_err();
        assert!(matches!(err, GpioError::Io(_)));
        assert!(storage.writes().is_empty());
        assert_eq!(watcher.registered(), 0);
    }

    #[test]
    fn set_edge_leaves_edge_untouched_on_registration_failure() {
        let cases = [
            (None, Some(io::ErrorKind::PermissionDenied)),
            (Some(io::ErrorKind::InvalidInput), None),
        ];
        for (nonblock_err, register_err) in cases {
            let storage = Arc::new(MemoryStorage::new());
            let watcher = mock_watcher(&MockPoll::failing(nonblock_err, register_err));
            let pin = Pin::new(1, "gpio1", storage.clone(), &watcher);

            let err = pin.set_edge(Edge::Rising, |_| {}).unwrap_err();
            assert!(matches!(err, GpioError::Registration { .. }));
            assert!(storage.contents("gpio1/edge").is_none());
            assert_eq!(watcher.registered(), 0);
        }
    }

    #[test]
    fn set_edge_leaves_edge_untouched_without_watcher() {
        let (pin, storage, watcher) = setup();
        watcher.close();

        let err = pin.set_edge(Edge::Falling, |_| {}).unwrap_err();
        assert!(matches!(err, GpioError::WatcherClosed));
        assert!(storage.writes().is_empty());

        drop(watcher);
        let err = pin.set_edge(Edge::Falling, |_| {}).unwrap_err();
        assert!(matches!(err, GpioError::WatcherClosed));
        assert!(storage.contents("gpio1/edge").is_none());
    }

    #[test]
    fn export_ignores_busy() {
        let (pin, storage, _) = setup();

        pin.export().unwrap();
        assert_eq!(storage.contents("export").unwrap(), b"1");

        storage.on_write(|_, _| Err(busy()));
        pin.export().unwrap();
        pin.export().unwrap();

        storage.on_write(|_, _| Err(io::Error::other("error")));
        assert_eq!(pin.export().unwrap_err().to_string(), "error");
    }

    #[test]
    fn unexport_propagates_errors() {
        let (pin, storage, _) = setup();

        pin.unexport().unwrap();
        assert_eq!(storage.contents("unexport").unwrap(), b"1");

        // busy is only forgiven on export
        storage.on_write(|_, _| Err(busy()));
        assert!(matches!(pin.unexport(), Err(GpioError::Io(_))));
    }
}

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{info, warn};
use rustc_hash::FxHashMap;
use tokio::sync::broadcast;

use crate::config::{AppConfig, PinConfig};
use crate::error::{GpioError, Result};
use crate::events::{EdgeEvent, EventHub, epoch_millis};
use crate::pin::{Direction, Edge, Pin};
use crate::storage::PinStorage;
use crate::watch::{Waker, Watcher};

/// Owns the configured pins and routes their edges into an [`EventHub`].
pub struct GpioManager {
    config: Arc<AppConfig>,
    watcher: Arc<Watcher>,
    pins: FxHashMap<String, Pin>,
    events: Arc<EventHub>,
    waker: Waker,
    stopping: AtomicBool,
}

impl GpioManager {
    /// Exports and configures every pin in `config`. Pins with an edge get
    /// registered with `watcher`; run [`watch`](Self::watch) to receive events.
    pub fn new(
        config: Arc<AppConfig>,
        storage: Arc<dyn PinStorage>,
        watcher: Arc<Watcher>,
    ) -> Result<Self> {
        config.validate()?;

        let events = Arc::new(EventHub::new(
            config.gpios.keys().cloned(),
            config.broadcast_capacity,
            config.event_history_capacity,
        ));
        for (name, cfg) in &config.gpios {
            if cfg.edge != Edge::None && cfg.direction != Direction::In {
                return Err(GpioError::InvalidState(format!(
                    "Edge detection requires an input pin: {name}"
                )));
            }
        }
        let waker = watcher.waker()?;

        let mut pins = FxHashMap::default();
        for (name, cfg) in &config.gpios {
            let pin = Pin::new(cfg.kernel_id, cfg.pin_base(), storage.clone(), &watcher);
            pins.insert(name.clone(), pin.clone());
            if let Err(e) = Self::configure(name, &pin, cfg, &events) {
                warn!("Unable to configure pin {name}, unexporting pins: {e}");
                let _ = unexport_pins(&pins);
                return Err(e);
            }
            info!(
                "Configured pin {name} (kernel id {}, {}, edge {})",
                cfg.kernel_id,
                cfg.direction.as_str(),
                cfg.edge.as_str()
            );
        }

        Ok(Self {
            config,
            watcher,
            pins,
            events,
            waker,
            stopping: AtomicBool::new(false),
        })
    }

    fn configure(name: &str, pin: &Pin, cfg: &PinConfig, events: &Arc<EventHub>) -> Result<()> {
        pin.export()?;
        pin.set_direction(cfg.direction)?;
        pin.set_active_low(cfg.active_low)?;

        if cfg.edge != Edge::None {
            let events = Arc::clone(events);
            let name = name.to_string();
            pin.set_edge(cfg.edge, move |pin| match pin.value() {
                Ok(value) => events.dispatch(EdgeEvent {
                    pin: name.clone(),
                    kernel_id: pin.kernel_id(),
                    value,
                    timestamp_ms: epoch_millis(),
                }),
                Err(e) => warn!("Unable to read pin {name} after edge: {e}"),
            })?;
        }
        Ok(())
    }

    pub fn pin(&self, name: &str) -> Result<&Pin> {
        self.pins
            .get(name)
            .ok_or_else(|| GpioError::NotFoundPin(name.to_string()))
    }

    pub fn pin_config(&self, name: &str) -> Result<&PinConfig> {
        self.config
            .gpios
            .get(name)
            .ok_or_else(|| GpioError::NotFoundPin(name.to_string()))
    }

    pub fn watcher(&self) -> &Arc<Watcher> {
        &self.watcher
    }

    pub fn read_value(&self, name: &str) -> Result<u8> {
        self.pin(name)?.value()
    }

    pub fn write_value(&self, name: &str, value: u8) -> Result<()> {
        if value > 1 {
            return Err(GpioError::InvalidValue("Value must be 0 or 1".into()));
        }
        if self.pin_config(name)?.direction != Direction::Out {
            return Err(GpioError::InvalidState(format!(
                "Pin {name} must be an output to set its value"
            )));
        }

        let pin = self.pin(name)?;
        if value == 1 { pin.set_high() } else { pin.set_low() }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EdgeEvent> {
        self.events.subscribe()
    }

    pub fn events(&self, name: &str, limit: Option<usize>) -> Result<Vec<EdgeEvent>> {
        self.pin_config(name)?;
        Ok(self.events.history(name, limit))
    }

    pub fn last_event(&self, name: &str) -> Result<Option<EdgeEvent>> {
        self.pin_config(name)?;
        Ok(self.events.last(name))
    }

    /// Runs the watch loop on the calling thread and closes the watcher
    /// once it ends. Returns at once after a [`shutdown`](Self::shutdown).
    pub fn watch(&self) -> Result<()> {
        let result = self.watcher.watch_until(&self.stopping);
        self.watcher.close();
        result
    }

    /// Stops [`watch`](Self::watch), whether it is already running or not
    /// yet started.
    pub fn shutdown(&self) -> Result<()> {
        self.stopping.store(true, Ordering::SeqCst);
        self.watcher.stop_watch();
        self.waker.wake()
    }

    /// Unexports every pin, returning the first failure after trying all.
    pub fn unexport_all(&self) -> Result<()> {
        unexport_pins(&self.pins)
    }
}

fn unexport_pins(pins: &FxHashMap<String, Pin>) -> Result<()> {
    let mut first_err = None;
    for (name, pin) in pins {
        if let Err(e) = pin.unexport() {
            warn!("Unable to unexport pin {name}: {e}");
            first_err.get_or_insert(e);
        }
    }
    first_err.map_or(Ok(()), Err)
}

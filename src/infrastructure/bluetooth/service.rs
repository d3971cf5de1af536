//! Bluetooth Service Module
//!
//! Main service that owns the serialized event queue and coordinates
//! scanning, connecting and the connected device sessions.
//!
//! Every transport callback and timer firing is pushed onto one queue and
//! handled to completion before the next, so no session state is ever
//! touched concurrently.

use crate::domain::models::{DeviceEvent, DeviceEventKind};
use crate::domain::settings::Settings;
use crate::domain::telemetry::{LogHeader, TelemetryRecord};
use crate::infrastructure::bluetooth::aggregator::SessionAggregator;
use crate::infrastructure::bluetooth::device::{DeviceSession, SessionConfig};
use crate::infrastructure::bluetooth::peripheral::PeripheralLink;
use crate::infrastructure::bluetooth::scanner::{BleScanner, DiscoveredDevice};
use crate::infrastructure::bluetooth::scheduler::{
    CoreEvent, Scheduler, TimerEvent, TimerKind, TimerSlot,
};
use crate::infrastructure::bluetooth::transport::{
    PeripheralId, RadioState, Transport, TransportError, TransportEvent,
};
use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Notifications for the application
#[derive(Debug, Clone, PartialEq)]
pub enum BleEvent {
    RadioState(RadioState),
    /// A sensor was added to (or moved within) the available list.
    Discovered {
        serial: String,
        rssi: i16,
        index: usize,
    },
    /// A user-selected connect did not succeed.
    ConnectFailed { serial: String, message: String },
    Device(DeviceEvent),
}

/// A user-selected connect waiting for the transport
struct PendingConnect {
    device: DiscoveredDevice,
    timeout: TimerSlot,
}

/// Main Bluetooth service coordinating all BLE operations
pub struct BluetoothService {
    transport: Arc<dyn Transport>,
    config: SessionConfig,
    connect_timeout: Duration,
    scheduler: Scheduler,
    queue_tx: mpsc::UnboundedSender<CoreEvent>,
    queue_rx: mpsc::UnboundedReceiver<CoreEvent>,
    scanner: BleScanner,
    pending: HashMap<PeripheralId, PendingConnect>,
    aggregator: SessionAggregator,
    radio_state: RadioState,
    device_tx: mpsc::UnboundedSender<DeviceEvent>,
    device_rx: mpsc::UnboundedReceiver<DeviceEvent>,
    subscriber: Option<mpsc::UnboundedSender<BleEvent>>,
}

impl BluetoothService {
    /// Create a new Bluetooth service. The transport adapter must push its
    /// callbacks into [`BluetoothService::queue`].
    pub fn new(transport: Arc<dyn Transport>, settings: &Settings) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (device_tx, device_rx) = mpsc::unbounded_channel();

        Self {
            scanner: BleScanner::new(transport.clone(), &settings.scan_serial_filter),
            transport,
            config: SessionConfig::from_settings(settings),
            connect_timeout: settings.connect_timeout(),
            scheduler: Scheduler::new(queue_tx.clone()),
            queue_tx,
            queue_rx,
            pending: HashMap::new(),
            aggregator: SessionAggregator::new(settings),
            radio_state: RadioState::Unknown,
            device_tx,
            device_rx,
            subscriber: None,
        }
    }

    /// Sender the transport adapter posts its callbacks to.
    pub fn queue(&self) -> mpsc::UnboundedSender<CoreEvent> {
        self.queue_tx.clone()
    }

    /// Replaces any previous subscriber.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<BleEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscriber = Some(tx);
        rx
    }

    pub fn radio_state(&self) -> RadioState {
        self.radio_state
    }

    pub fn scanner(&self) -> &BleScanner {
        &self.scanner
    }

    pub fn scanner_mut(&mut self) -> &mut BleScanner {
        &mut self.scanner
    }

    pub fn aggregator(&self) -> &SessionAggregator {
        &self.aggregator
    }

    pub fn aggregator_mut(&mut self) -> &mut SessionAggregator {
        &mut self.aggregator
    }

    pub fn is_connecting(&self, serial: &str) -> bool {
        self.pending
            .values()
            .any(|p| p.device.identity.matches_serial(serial))
    }

    fn require_radio(&self) -> Result<(), TransportError> {
        if self.radio_state != RadioState::PoweredOn {
            return Err(TransportError::RadioUnavailable(self.radio_state));
        }
        Ok(())
    }

    /// Start scanning for devices
    pub fn start_scan(&mut self) -> Result<()> {
        self.require_radio()?;
        self.scanner.start()?;
        Ok(())
    }

    /// Stop scanning
    pub fn stop_scan(&mut self) -> Result<()> {
        self.scanner.stop()?;
        Ok(())
    }

    /// Connect to an available device by serial. Scanning stops first.
    pub fn connect(&mut self, serial: &str) -> Result<()> {
        self.require_radio()?;
        if self.scanner.get(serial).is_none() {
            anyhow::bail!("Unknown device: {}", serial);
        }
        self.scanner.stop()?;

        let Some(device) = self.scanner.take(serial) else {
            anyhow::bail!("Unknown device: {}", serial);
        };
        info!("Connecting to {} ({})", device.identity.serial, device.peripheral_id.short());
        self.transport.connect(&device.peripheral_id)?;

        let mut timeout = TimerSlot::new();
        timeout.arm(self.scheduler.schedule(
            &device.peripheral_id,
            TimerKind::ConnectTimeout,
            self.connect_timeout,
        ));
        self.pending
            .insert(device.peripheral_id.clone(), PendingConnect { device, timeout });
        Ok(())
    }

    /// Abandon a connect that has not completed yet.
    pub fn cancel_connect(&mut self, serial: &str) -> Result<()> {
        let Some(id) = self
            .pending
            .iter()
            .find(|(_, p)| p.device.identity.matches_serial(serial))
            .map(|(id, _)| id.clone())
        else {
            return Ok(());
        };
        self.pending.remove(&id);
        self.transport.cancel_connection(&id)?;
        Ok(())
    }

    /// Disconnect a connected device. Its logs are turned off first.
    pub fn disconnect(&mut self, serial: &str) {
        let Some(mut device) = self.aggregator.remove(serial) else {
            debug!("Disconnect requested for unknown device {}", serial);
            return;
        };
        device.log_service_mut().stop(true);
        device.disconnect();
        info!("Disconnected from device {}", serial);
    }

    pub fn start_logging(&mut self) {
        self.aggregator.start_logging();
    }

    pub fn stop_logging(&mut self) {
        self.aggregator.stop_logging();
    }

    pub fn records(&self) -> &[TelemetryRecord] {
        self.aggregator.records()
    }

    pub fn header(&self) -> Option<&LogHeader> {
        self.aggregator.header()
    }

    /// Run the coordinator loop. Never returns while the service is alive
    /// since it holds a sender of its own queue.
    pub async fn run(&mut self) {
        while self.process_next().await {}
    }

    /// Wait for and handle one event. Returns `false` once the queue closed.
    pub async fn process_next(&mut self) -> bool {
        match self.queue_rx.recv().await {
            Some(event) => {
                self.handle(event);
                true
            }
            None => false,
        }
    }

    /// Handle everything already queued without waiting.
    pub fn process_pending(&mut self) {
        while let Ok(event) = self.queue_rx.try_recv() {
            self.handle(event);
        }
    }

    pub fn handle(&mut self, event: CoreEvent) {
        match event {
            CoreEvent::Transport(event) => self.handle_transport(event),
            CoreEvent::Timer(event) => self.handle_timer(event),
        }
        self.aggregator.pump();
        self.forward_device_events();
    }

    fn handle_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::RadioStateChanged(state) => self.on_radio_state(state),
            TransportEvent::Discovered(peripheral) => {
                let Some(index) = self.scanner.on_discovered(peripheral) else {
                    return;
                };
                if let Some(device) = self.scanner.available().iter().nth(index) {
                    let event = BleEvent::Discovered {
                        serial: device.identity.serial.clone(),
                        rssi: device.rssi,
                        index,
                    };
                    self.emit(event);
                }
            }
            TransportEvent::Connected(id) => self.on_connected(id),
            TransportEvent::ConnectFailed { peripheral, error } => {
                if let Some(pending) = self.pending.remove(&peripheral) {
                    let message = error.map(|e| e.to_string()).unwrap_or_default();
                    warn!(
                        "Failed to connect to {}: {}",
                        pending.device.identity.serial, message
                    );
                    self.emit(BleEvent::ConnectFailed {
                        serial: pending.device.identity.serial,
                        message,
                    });
                } else if let Some(device) = self.aggregator.get_by_peripheral_mut(&peripheral) {
                    device.on_connect_failed(error);
                }
            }
            TransportEvent::Disconnected { peripheral, error } => {
                if let Some(pending) = self.pending.remove(&peripheral) {
                    self.emit(BleEvent::ConnectFailed {
                        serial: pending.device.identity.serial,
                        message: error.map(|e| e.to_string()).unwrap_or_default(),
                    });
                } else if let Some(device) = self.aggregator.get_by_peripheral_mut(&peripheral) {
                    device.on_disconnected(error);
                }
            }
            TransportEvent::Peripheral { peripheral, event } => {
                match self.aggregator.get_by_peripheral_mut(&peripheral) {
                    Some(device) => device.on_gatt_event(event),
                    None => debug!("Event for unknown peripheral {}", peripheral.short()),
                }
            }
        }
    }

    fn on_radio_state(&mut self, state: RadioState) {
        info!("Radio state changed to {:?}", state);
        self.radio_state = state;
        if state == RadioState::PoweredOff {
            self.scanner.reset();
            let abandoned: Vec<PendingConnect> =
                self.pending.drain().map(|(_, pending)| pending).collect();
            for pending in abandoned {
                self.emit(BleEvent::ConnectFailed {
                    serial: pending.device.identity.serial,
                    message: "radio powered off".to_string(),
                });
            }
            for device in self.aggregator.devices_mut().iter_mut() {
                device.on_radio_state(state);
            }
        }
        self.emit(BleEvent::RadioState(state));
    }

    fn on_connected(&mut self, id: PeripheralId) {
        let link = PeripheralLink::new(self.transport.clone(), id.clone());

        if let Some(pending) = self.pending.remove(&id) {
            let identity = pending.device.identity;
            let serial = identity.serial.clone();
            info!("Connected to {} ({})", serial, id.short());

            let mut device = DeviceSession::new(
                identity,
                pending.device.rssi,
                link,
                self.scheduler.clone(),
                self.config,
            );
            device.set_observer(Some(self.device_tx.clone()));
            device.start();
            self.aggregator.add(device);
            self.emit(BleEvent::Device(DeviceEvent::new(
                &serial,
                DeviceEventKind::Connected,
            )));
            return;
        }

        match self.aggregator.get_by_peripheral_mut(&id) {
            Some(device) => device.on_connected(link),
            None => {
                debug!("Unexpected connection to {}, cancelling", id.short());
                if let Err(e) = self.transport.cancel_connection(&id) {
                    warn!("Failed to cancel connection to {}: {}", id.short(), e);
                }
            }
        }
    }

    fn handle_timer(&mut self, event: TimerEvent) {
        if event.kind == TimerKind::ConnectTimeout {
            let expired = self
                .pending
                .get_mut(&event.peripheral)
                .is_some_and(|p| p.timeout.fire(event.id));
            if !expired {
                return;
            }
            if let Some(pending) = self.pending.remove(&event.peripheral) {
                warn!(
                    "Timed out connecting to {}",
                    pending.device.identity.serial
                );
                if let Err(e) = self.transport.cancel_connection(&event.peripheral) {
                    warn!(
                        "Failed to cancel connection to {}: {}",
                        event.peripheral.short(),
                        e
                    );
                }
                self.emit(BleEvent::Device(DeviceEvent::new(
                    &pending.device.identity.serial,
                    DeviceEventKind::Disconnected,
                )));
            }
            return;
        }

        if let Some(device) = self.aggregator.get_by_peripheral_mut(&event.peripheral) {
            device.on_timer(&event);
        }
    }

    /// Forward device notifications and drop devices that are gone for good.
    fn forward_device_events(&mut self) {
        while let Ok(event) = self.device_rx.try_recv() {
            if event.kind == DeviceEventKind::Disconnected
                && self.aggregator.remove(&event.device_id).is_some()
            {
                info!("Device {} is gone", event.device_id);
            }
            self.emit(BleEvent::Device(event));
        }
    }

    fn emit(&self, event: BleEvent) {
        if let Some(subscriber) = &self.subscriber {
            let _ = subscriber.send(event);
        }
    }
}

//! Session Aggregator
//!
//! Owns the connected devices, fans logging commands out to all of them and
//! merges their telemetry into one arrival-ordered record buffer.

use crate::domain::settings::{EnabledLogs, Settings};
use crate::domain::telemetry::{
    iso_timestamp, LogHeader, LogType, SensorHeader, TelemetryEvent, TelemetryRecord,
};
use crate::infrastructure::bluetooth::device::DeviceSession;
use crate::infrastructure::bluetooth::protocol::LogRate;
use crate::infrastructure::bluetooth::registry::DeviceRegistry;
use crate::infrastructure::bluetooth::transport::PeripheralId;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub struct SessionAggregator {
    devices: DeviceRegistry<DeviceSession>,
    rate: LogRate,
    enabled_logs: EnabledLogs,
    supports_pressure: bool,
    logging: bool,
    logging_started_at: Option<OffsetDateTime>,
    header: Option<LogHeader>,
    records: Vec<TelemetryRecord>,
    telemetry_tx: mpsc::UnboundedSender<TelemetryEvent>,
    telemetry_rx: mpsc::UnboundedReceiver<TelemetryEvent>,
    record_observer: Option<mpsc::UnboundedSender<TelemetryRecord>>,
}

impl SessionAggregator {
    pub fn new(settings: &Settings) -> Self {
        let (telemetry_tx, telemetry_rx) = mpsc::unbounded_channel();
        Self {
            // Connected devices keep their arrival order.
            devices: DeviceRegistry::new(false),
            rate: LogRate::from_hz(settings.capped_log_rate_hz()),
            enabled_logs: settings.enabled_logs.clone(),
            supports_pressure: false,
            logging: false,
            logging_started_at: None,
            header: None,
            records: Vec::new(),
            telemetry_tx,
            telemetry_rx,
            record_observer: None,
        }
    }

    pub fn devices(&self) -> &DeviceRegistry<DeviceSession> {
        &self.devices
    }

    pub fn devices_mut(&mut self) -> &mut DeviceRegistry<DeviceSession> {
        &mut self.devices
    }

    pub fn get(&self, serial: &str) -> Option<&DeviceSession> {
        self.devices.get(serial)
    }

    pub fn get_mut(&mut self, serial: &str) -> Option<&mut DeviceSession> {
        self.devices.get_mut(serial)
    }

    pub fn get_by_peripheral_mut(&mut self, id: &PeripheralId) -> Option<&mut DeviceSession> {
        self.devices.get_by_peripheral_mut(id)
    }

    /// Take ownership of a connected device and start its telemetry service.
    pub fn add(&mut self, mut device: DeviceSession) {
        info!("Aggregator: adding device {}", device.id());
        let log_service = device.log_service_mut();
        log_service.set_observer(Some(self.telemetry_tx.clone()));
        log_service.start(true);

        self.devices.upsert(device);
        self.update_pressure_support();
    }

    pub fn remove(&mut self, serial: &str) -> Option<DeviceSession> {
        let (_, device) = self.devices.remove(serial)?;
        info!("Aggregator: removed device {}", device.id());
        self.update_pressure_support();
        Some(device)
    }

    fn update_pressure_support(&mut self) {
        self.supports_pressure = self
            .devices
            .iter()
            .any(|d| d.identity().firmware.firmware_type.supports_pressure());
    }

    /// At least one attached sensor can log pressure.
    pub fn supports_pressure(&self) -> bool {
        self.supports_pressure
    }

    pub fn rate(&self) -> LogRate {
        self.rate
    }

    pub fn set_rate(&mut self, rate: LogRate) {
        self.rate = rate;
    }

    pub fn set_enabled_logs(&mut self, enabled_logs: EnabledLogs) {
        self.enabled_logs = enabled_logs;
    }

    /// The kinds a start-logging command requests.
    pub fn requested_log_types(&self) -> Vec<LogType> {
        self.enabled_logs.to_list(self.supports_pressure)
    }

    pub fn is_logging(&self) -> bool {
        self.logging
    }

    /// Start a new logging session on every device. Previously buffered
    /// records are discarded.
    pub fn start_logging(&mut self) {
        let now = OffsetDateTime::now_utc();
        self.records.clear();
        self.logging_started_at = Some(now);
        self.header = Some(LogHeader {
            sensors: self
                .devices
                .iter()
                .map(|d| SensorHeader {
                    firmware: d.identity().firmware.name(),
                    serial_number: d.id().to_string(),
                })
                .collect(),
            app_ts: iso_timestamp(now),
        });

        let log_types = self.requested_log_types();
        info!(
            "Aggregator: start logging {:?} at {} Hz on {} device(s)",
            log_types,
            self.rate.hz(),
            self.devices.len()
        );
        for device in self.devices.iter_mut() {
            if let Err(e) = device.log_service_mut().enable_logs(self.rate, &log_types) {
                warn!("Aggregator: device {} did not start logging: {}", device.id(), e);
            }
        }
        self.logging = true;
    }

    pub fn stop_logging(&mut self) {
        info!("Aggregator: stop logging");
        self.logging = false;
        for device in self.devices.iter_mut() {
            if let Err(e) = device.log_service_mut().stop_logs() {
                warn!("Aggregator: device {} did not stop logging: {}", device.id(), e);
            }
        }
    }

    /// Records are also streamed here as they are buffered.
    pub fn set_record_observer(&mut self, observer: Option<mpsc::UnboundedSender<TelemetryRecord>>) {
        self.record_observer = observer;
    }

    /// Move decoded telemetry from the devices into the record buffer.
    pub fn pump(&mut self) {
        while let Ok(event) = self.telemetry_rx.try_recv() {
            match event {
                TelemetryEvent::Started { device_id } => {
                    debug!("Aggregator: telemetry started on {}", device_id);
                }
                TelemetryEvent::Frame {
                    device_id,
                    received_at,
                    frame,
                } => {
                    if !self.logging {
                        continue;
                    }
                    let record = TelemetryRecord::new(&device_id, received_at, &frame);
                    if let Some(observer) = &self.record_observer {
                        let _ = observer.send(record.clone());
                    }
                    self.records.push(record);
                }
            }
        }
    }

    pub fn records(&self) -> &[TelemetryRecord] {
        &self.records
    }

    pub fn take_records(&mut self) -> Vec<TelemetryRecord> {
        std::mem::take(&mut self.records)
    }

    pub fn header(&self) -> Option<&LogHeader> {
        self.header.as_ref()
    }

    pub fn logging_started_at(&self) -> Option<OffsetDateTime> {
        self.logging_started_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::firmware::DeviceIdentity;
    use crate::infrastructure::bluetooth::device::SessionConfig;
    use crate::infrastructure::bluetooth::peripheral::PeripheralLink;
    use crate::infrastructure::bluetooth::scheduler::{CoreEvent, Scheduler};
    use crate::infrastructure::bluetooth::transport::mock::{Call, MockTransport};
    use crate::infrastructure::bluetooth::transport::{CharacteristicRef, GattEvent};
    use std::sync::Arc;

    struct Fixture {
        transport: Arc<MockTransport>,
        scheduler: Scheduler,
        _queue: mpsc::UnboundedReceiver<CoreEvent>,
    }

    impl Fixture {
        fn new() -> Self {
            let (tx, rx) = mpsc::unbounded_channel();
            Self {
                transport: Arc::new(MockTransport::new()),
                scheduler: Scheduler::new(tx),
                _queue: rx,
            }
        }

        /// A connected R04 device; `firmware_type` 0 is tracker A, 6 tracker B.
        fn device(&self, serial: u32, firmware_type: u8) -> DeviceSession {
            let mut data = vec![0xA1, 0x04, 0x18, 0x00];
            data.extend_from_slice(&serial.to_le_bytes());
            data.extend_from_slice(&[firmware_type, 0x04]);
            let id = PeripheralId::new(format!("peripheral-{}", serial));
            self.transport.set_connected(&id, true);

            let mut device = DeviceSession::new(
                DeviceIdentity::from_advertisement(&data),
                -50,
                PeripheralLink::new(self.transport.clone(), id),
                self.scheduler.clone(),
                SessionConfig::default(),
            );
            device.start();
            device
        }
    }

    fn bring_up_log_service(aggregator: &mut SessionAggregator, serial: &str) {
        let device = aggregator.get_mut(serial).unwrap();
        let log = device.profile().log;
        let characteristic = CharacteristicRef::new(log.service, log.characteristic);
        device.on_gatt_event(GattEvent::ServicesDiscovered(Ok(vec![log.service])));
        device.on_gatt_event(GattEvent::CharacteristicsDiscovered {
            service: log.service,
            result: Ok(vec![log.characteristic]),
        });
        device.on_gatt_event(GattEvent::NotifyStateChanged {
            characteristic,
            result: Ok(true),
        });
        assert!(device.log_service().is_ready());
    }

    fn send_frame(aggregator: &mut SessionAggregator, serial: &str, bytes: &[u8]) {
        let device = aggregator.get_mut(serial).unwrap();
        let log = device.profile().log;
        device.on_gatt_event(GattEvent::ValueUpdated {
            characteristic: CharacteristicRef::new(log.service, log.characteristic),
            result: Ok(bytes.to_vec()),
        });
    }

    #[tokio::test(start_paused = true)]
    async fn test_pressure_flag_tracks_attached_devices() {
        let fixture = Fixture::new();
        let mut aggregator = SessionAggregator::new(&Settings::default());
        let mut enabled = EnabledLogs::default();
        enabled.pressure = true;
        aggregator.set_enabled_logs(enabled);

        aggregator.add(fixture.device(1, 0));
        assert!(!aggregator.supports_pressure());
        assert!(!aggregator.requested_log_types().contains(&LogType::Pressure));

        aggregator.add(fixture.device(2, 6));
        assert!(aggregator.supports_pressure());
        assert!(aggregator.requested_log_types().contains(&LogType::Pressure));

        aggregator.remove("2").unwrap();
        assert!(!aggregator.supports_pressure());
        assert!(aggregator.remove("2").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_logging_fans_out_and_buffers_in_arrival_order() {
        let fixture = Fixture::new();
        let mut aggregator = SessionAggregator::new(&Settings::default());
        aggregator.add(fixture.device(10, 0));
        aggregator.add(fixture.device(20, 0));
        let order: Vec<&str> = aggregator.devices().iter().map(|d| d.id()).collect();
        assert_eq!(order, vec!["10", "20"]);

        bring_up_log_service(&mut aggregator, "10");
        bring_up_log_service(&mut aggregator, "20");

        // Frames before logging starts are dropped.
        send_frame(&mut aggregator, "10", &[62, 0, 1, 0, 0, 0, 5, 0, 3, 0, 0, 0]);
        aggregator.pump();
        assert!(aggregator.records().is_empty());

        fixture.transport.take_calls();
        aggregator.start_logging();
        assert!(aggregator.is_logging());
        // 30 Hz, mag/accel/gyro autocal.
        let expected = vec![30, 93, 99, 108];
        assert_eq!(fixture.transport.writes(), vec![expected.clone(), expected]);

        let header = aggregator.header().unwrap();
        assert_eq!(header.sensors.len(), 2);
        assert_eq!(header.sensors[1].serial_number, "20");
        assert_eq!(header.sensors[0].firmware, "Tracker A (24)");

        let (tx, mut streamed) = mpsc::unbounded_channel();
        aggregator.set_record_observer(Some(tx));
        send_frame(&mut aggregator, "20", &[62, 0, 1, 0, 0, 0, 5, 0, 3, 0, 0, 0]);
        send_frame(&mut aggregator, "10", &[62, 0, 2, 0, 0, 0, 5, 0, 3, 0, 0, 0]);
        send_frame(&mut aggregator, "10", &[62, 0, 2, 0]);
        aggregator.pump();

        let records = aggregator.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].device_id, "20");
        assert_eq!(records[0].device_timestamp, 1);
        assert_eq!(records[0].values, vec![5.0, 3.0, 0.0]);
        assert_eq!(records[1].device_id, "10");
        assert_eq!(streamed.try_recv().unwrap(), records[0]);

        fixture.transport.take_calls();
        aggregator.stop_logging();
        assert_eq!(fixture.transport.writes(), vec![vec![0, 0], vec![0, 0]]);
        send_frame(&mut aggregator, "10", &[62, 0, 3, 0, 0, 0, 5, 0, 3, 0, 0, 0]);
        aggregator.pump();
        assert_eq!(aggregator.take_records().len(), 2);
        assert!(aggregator.records().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_devices_not_ready_are_skipped() {
        let fixture = Fixture::new();
        let mut aggregator = SessionAggregator::new(&Settings::default());
        aggregator.add(fixture.device(10, 0));
        fixture.transport.take_calls();

        aggregator.start_logging();
        assert!(aggregator.is_logging());
        assert!(!fixture
            .transport
            .calls()
            .iter()
            .any(|c| matches!(c, Call::Write(..))));
    }
}

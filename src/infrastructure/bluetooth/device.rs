//! Device Session
//!
//! Pairs a peripheral session with the identity parsed from its
//! advertisement and drives the connection state machine:
//!
//! ```text
//!                connect ok
//!  Disconnected ───────────────▶ Connected
//!       ▲  ▲                      │    ▲
//!       │  │  lost (error)        │    │ reconnected
//!       │  │  ┌───────────────────┘    │
//!       │  │  ▼                        │
//!       │  └─ Reconnecting ────────────┘
//!       │      deadline / connect failed
//!       │
//!       └──── disconnect() / radio off (from any state)
//! ```

use crate::domain::firmware::DeviceIdentity;
use crate::domain::models::{ConnectionState, DeviceEvent, DeviceEventKind};
use crate::domain::settings::Settings;
use crate::infrastructure::bluetooth::factory_service::FactoryService;
use crate::infrastructure::bluetooth::log_service::{ResendPolicy, TelemetryService};
use crate::infrastructure::bluetooth::peripheral::{
    GattService, PeripheralLink, PeripheralOutcome, PeripheralSession,
};
use crate::infrastructure::bluetooth::protocol::ProtocolProfile;
use crate::infrastructure::bluetooth::registry::RegistryEntry;
use crate::infrastructure::bluetooth::scheduler::{
    Scheduler, TimerEvent, TimerKind, TimerSlot,
};
use crate::infrastructure::bluetooth::transport::{
    GattEvent, PeripheralId, RadioState, TransportError,
};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Timing knobs of a device session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    pub reconnect_timeout: Duration,
    pub rssi_poll_interval: Duration,
    pub battery_poll_interval: Duration,
    pub resend: ResendPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

impl SessionConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            reconnect_timeout: settings.reconnect_timeout(),
            rssi_poll_interval: settings.rssi_poll_interval(),
            battery_poll_interval: settings.battery_poll_interval(),
            resend: ResendPolicy {
                timeout: settings.response_timeout(),
                max_retries: settings.max_command_retries,
            },
        }
    }
}

pub struct DeviceSession {
    identity: DeviceIdentity,
    profile: ProtocolProfile,
    scheduler: Scheduler,
    config: SessionConfig,
    peripheral: PeripheralSession,
    log_service: TelemetryService,
    factory_service: FactoryService,
    state: ConnectionState,
    rssi: i16,
    will_try_to_reconnect: bool,
    reconnect_deadline: TimerSlot,
    observer: Option<mpsc::UnboundedSender<DeviceEvent>>,
}

impl DeviceSession {
    pub fn new(
        identity: DeviceIdentity,
        rssi: i16,
        link: PeripheralLink,
        scheduler: Scheduler,
        config: SessionConfig,
    ) -> Self {
        let profile = ProtocolProfile::for_revision(identity.revision);
        let log_service = TelemetryService::new(
            &identity.serial,
            link.clone(),
            scheduler.clone(),
            profile,
            config.resend,
        );
        let factory_service = FactoryService::new(
            &identity.serial,
            link.clone(),
            scheduler.clone(),
            profile.factory,
            &identity.firmware,
            config.battery_poll_interval,
        );
        let state = if link.is_connected() {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        };

        Self {
            identity,
            profile,
            scheduler,
            config,
            peripheral: PeripheralSession::new(link),
            log_service,
            factory_service,
            state,
            rssi,
            will_try_to_reconnect: true,
            reconnect_deadline: TimerSlot::new(),
            observer: None,
        }
    }

    /// Serial number.
    pub fn id(&self) -> &str {
        &self.identity.serial
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn profile(&self) -> &ProtocolProfile {
        &self.profile
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Last RSSI reading.
    pub fn rssi(&self) -> i16 {
        self.rssi
    }

    pub fn last_battery_level(&self) -> Option<i32> {
        self.factory_service.last_battery_level()
    }

    pub fn will_try_to_reconnect(&self) -> bool {
        self.will_try_to_reconnect
    }

    pub fn set_will_try_to_reconnect(&mut self, enabled: bool) {
        self.will_try_to_reconnect = enabled;
    }

    pub fn peripheral(&self) -> &PeripheralSession {
        &self.peripheral
    }

    pub fn log_service(&self) -> &TelemetryService {
        &self.log_service
    }

    pub fn log_service_mut(&mut self) -> &mut TelemetryService {
        &mut self.log_service
    }

    pub fn factory_service(&self) -> &FactoryService {
        &self.factory_service
    }

    /// Replaces any previous observer.
    pub fn set_observer(&mut self, observer: Option<mpsc::UnboundedSender<DeviceEvent>>) {
        self.observer = observer;
    }

    /// Both handlers talk through the current connection instance.
    pub fn handlers_bound_to_current_link(&self) -> bool {
        let instance = self.peripheral.link().instance();
        self.log_service.link().instance() == instance
            && self.factory_service.link().instance() == instance
    }

    /// Register the handlers, start RSSI polling and bring the factory
    /// service up straight away for the battery keep-alive.
    pub fn start(&mut self) {
        self.peripheral
            .start_reading_rssi(&self.scheduler, self.config.rssi_poll_interval);

        self.peripheral.register(self.profile.log.service);
        self.peripheral.register(self.profile.factory.service);

        self.factory_service.set_observer(self.observer.clone());
        self.factory_service.start();
    }

    pub fn stop(&mut self) {
        self.peripheral.stop_reading_rssi();
        self.factory_service.stop_battery_polling();
        self.peripheral.clear_services();
    }

    /// User initiated disconnect. Terminal; never reconnects.
    pub fn disconnect(&mut self) {
        self.will_try_to_reconnect = false;
        self.reconnect_deadline.cancel();
        if self.state == ConnectionState::Disconnected {
            return;
        }

        self.state = ConnectionState::Disconnected;
        self.stop();
        info!("Device({}): disconnecting", self.id());
        self.cancel_connection();
    }

    /// Give up on an in-flight reconnect right away.
    pub fn cancel_reconnection(&mut self) {
        if self.state == ConnectionState::Disconnected {
            return;
        }
        self.state = ConnectionState::Disconnected;
        self.cancel_connection();
        self.reconnect_deadline.cancel();
        self.emit(DeviceEventKind::Disconnected);
    }

    pub fn on_radio_state(&mut self, state: RadioState) {
        if state != RadioState::PoweredOff {
            return;
        }

        let was = self.state;
        self.state = ConnectionState::Disconnected;
        self.reconnect_deadline.cancel();
        self.stop();
        if was != ConnectionState::Disconnected {
            self.emit(DeviceEventKind::Disconnected);
        }
    }

    /// The transport connected this device's peripheral again. `link` is the
    /// fresh connection instance.
    pub fn on_connected(&mut self, link: PeripheralLink) {
        match self.state {
            ConnectionState::Reconnecting => {}
            ConnectionState::Connected => {
                debug!("Device({}): ignoring duplicate connect", self.id());
                return;
            }
            ConnectionState::Disconnected => {
                debug!("Device({}): connected after giving up, cancelling", self.id());
                self.cancel_connection();
                return;
            }
        }

        self.reconnect_deadline.cancel();
        info!("Device({}): reconnected to {}", self.id(), link.id().short());
        self.state = ConnectionState::Connected;

        // The old session is dead and has no services.
        self.peripheral = PeripheralSession::new(link.clone());
        self.log_service.rebind(link.clone());
        self.factory_service.rebind(link);

        self.start();
        self.log_service.start(true);
        self.emit(DeviceEventKind::Reconnected);
    }

    pub fn on_connect_failed(&mut self, error: Option<TransportError>) {
        if self.state != ConnectionState::Reconnecting {
            return;
        }
        match error {
            Some(e) => warn!("Device({}): failed to reconnect: {}", self.id(), e),
            None => warn!("Device({}): failed to reconnect", self.id()),
        }

        self.reconnect_deadline.cancel();
        self.state = ConnectionState::Disconnected;
        self.emit(DeviceEventKind::Disconnected);
    }

    /// `error` is `None` for a clean disconnect.
    pub fn on_disconnected(&mut self, error: Option<TransportError>) {
        self.stop();

        let Some(error) = error else {
            self.reconnect_deadline.cancel();
            if self.state != ConnectionState::Disconnected {
                // A locked up sensor can drop the link without an error.
                self.emit(DeviceEventKind::Disconnected);
            }
            self.state = ConnectionState::Disconnected;
            debug!("Device({}): disconnected safely", self.id());
            return;
        };

        warn!("Device({}): lost connection: {}", self.id(), error);
        match self.state {
            ConnectionState::Connected if self.will_try_to_reconnect => self.begin_reconnect(),
            ConnectionState::Reconnecting => {
                debug!("Device({}): already reconnecting", self.id());
            }
            ConnectionState::Connected => {
                self.state = ConnectionState::Disconnected;
                self.emit(DeviceEventKind::Disconnected);
            }
            ConnectionState::Disconnected => {}
        }
    }

    fn begin_reconnect(&mut self) {
        self.state = ConnectionState::Reconnecting;

        // Characteristics of the lost link are never reused.
        self.log_service.invalidate();
        self.factory_service.invalidate();
        self.emit(DeviceEventKind::Reconnecting);

        let peripheral = self.peripheral.link().id().clone();
        if let Err(e) = self.peripheral.link().transport().connect(&peripheral) {
            error!("Device({}): reconnect request failed: {}", self.id(), e);
            self.state = ConnectionState::Disconnected;
            self.emit(DeviceEventKind::Disconnected);
            return;
        }

        self.reconnect_deadline.arm(self.scheduler.schedule(
            &peripheral,
            TimerKind::ReconnectDeadline,
            self.config.reconnect_timeout,
        ));
    }

    pub fn on_timer(&mut self, event: &TimerEvent) {
        match event.kind {
            TimerKind::ReconnectDeadline => {
                if self.reconnect_deadline.fire(event.id) {
                    info!("Device({}): giving up on reconnecting", self.id());
                    self.cancel_connection();
                    self.state = ConnectionState::Disconnected;
                    self.emit(DeviceEventKind::Disconnected);
                }
            }
            TimerKind::RssiPoll => self.peripheral.on_rssi_timer(&self.scheduler, event.id),
            TimerKind::CommandTimeout => self.log_service.on_response_timeout(event.id),
            TimerKind::BatteryPoll => self.factory_service.on_poll_timer(event.id),
            TimerKind::ConnectTimeout => {}
        }
    }

    pub fn on_gatt_event(&mut self, event: GattEvent) {
        let handlers: &mut [&mut dyn GattService] =
            &mut [&mut self.log_service, &mut self.factory_service];
        let outcome = self.peripheral.dispatch(event, handlers);

        match outcome {
            Some(PeripheralOutcome::Rssi(rssi)) => {
                self.rssi = rssi;
                self.emit(DeviceEventKind::Rssi(rssi));
            }
            Some(PeripheralOutcome::Error { kind, error }) => {
                self.emit(DeviceEventKind::Error {
                    kind,
                    message: error.to_string(),
                });
            }
            None => {}
        }
    }

    fn cancel_connection(&self) {
        let link = self.peripheral.link();
        if let Err(e) = link.transport().cancel_connection(link.id()) {
            error!("Device({}): cancel connection failed: {}", self.id(), e);
        }
    }

    fn emit(&self, kind: DeviceEventKind) {
        if let Some(observer) = &self.observer {
            let _ = observer.send(DeviceEvent::new(self.id(), kind));
        }
    }
}

impl RegistryEntry for DeviceSession {
    fn serial(&self) -> &str {
        &self.identity.serial
    }

    fn peripheral_id(&self) -> &PeripheralId {
        self.peripheral.link().id()
    }

    fn rssi(&self) -> i16 {
        self.rssi
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::peripheral::ServiceState;
    use crate::infrastructure::bluetooth::scheduler::CoreEvent;
    use crate::infrastructure::bluetooth::transport::mock::{Call, MockTransport};
    use crate::infrastructure::bluetooth::transport::CharacteristicRef;
    use std::sync::Arc;
    use uuid::Uuid;

    const ADVERTISEMENT: [u8; 10] = [0xA1, 0x04, 0x18, 0x00, 0x6F, 0xCA, 0x9A, 0x3B, 0x07, 0x04];

    struct Harness {
        transport: Arc<MockTransport>,
        device: DeviceSession,
        queue: mpsc::UnboundedReceiver<CoreEvent>,
        events: mpsc::UnboundedReceiver<DeviceEvent>,
    }

    fn connected_device() -> Harness {
        let transport = Arc::new(MockTransport::new());
        let id = PeripheralId::new("device-peripheral");
        transport.set_connected(&id, true);
        let (queue_tx, queue) = mpsc::unbounded_channel();
        let (events_tx, events) = mpsc::unbounded_channel();

        let mut device = DeviceSession::new(
            DeviceIdentity::from_advertisement(&ADVERTISEMENT),
            -60,
            PeripheralLink::new(transport.clone(), id),
            Scheduler::new(queue_tx),
            SessionConfig::default(),
        );
        device.set_observer(Some(events_tx));
        device.start();

        Harness {
            transport,
            device,
            queue,
            events,
        }
    }

    impl Harness {
        fn peripheral_id(&self) -> PeripheralId {
            self.device.peripheral().link().id().clone()
        }

        fn kinds(&mut self) -> Vec<DeviceEventKind> {
            let mut kinds = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                kinds.push(event.kind);
            }
            kinds
        }

        fn lose_link(&mut self) {
            self.transport.set_connected(&self.peripheral_id(), false);
            self.device.on_disconnected(Some(TransportError::Operation {
                operation: "link",
                message: "supervision timeout".into(),
            }));
        }

        /// Drive timers until one of `kind` fires.
        async fn fire(&mut self, kind: TimerKind) {
            loop {
                let Some(CoreEvent::Timer(event)) = self.queue.recv().await else {
                    panic!("queue closed");
                };
                let matched = event.kind == kind;
                self.device.on_timer(&event);
                if matched {
                    return;
                }
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_registers_services_and_starts_factory() {
        let h = connected_device();
        let profile = *h.device.profile();

        assert_eq!(h.device.state(), ConnectionState::Connected);
        assert!(h.device.peripheral().is_registered(&profile.log.service));
        assert!(h.device.peripheral().is_registered(&profile.factory.service));
        assert!(h.device.peripheral().is_reading_rssi());
        assert_eq!(
            h.transport.calls(),
            vec![
                Call::ReadRssi(h.peripheral_id()),
                Call::DiscoverServices(h.peripheral_id(), Some(vec![profile.factory.service])),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_reaches_handlers_and_reports_rssi() {
        let mut h = connected_device();
        let profile = *h.device.profile();

        h.device
            .on_gatt_event(GattEvent::ServicesDiscovered(Ok(vec![profile.factory.service])));
        h.device.on_gatt_event(GattEvent::CharacteristicsDiscovered {
            service: profile.factory.service,
            result: Ok(vec![profile.factory.characteristic]),
        });
        h.device.on_gatt_event(GattEvent::NotifyStateChanged {
            characteristic: CharacteristicRef::new(
                profile.factory.service,
                profile.factory.characteristic,
            ),
            result: Ok(true),
        });
        assert_eq!(h.device.factory_service().state(), ServiceState::Ready);

        h.device.on_gatt_event(GattEvent::ValueUpdated {
            characteristic: CharacteristicRef::new(
                profile.factory.service,
                profile.factory.characteristic,
            ),
            result: Ok(vec![148, 46, 55, 0, 0, 0]),
        });
        h.device.on_gatt_event(GattEvent::RssiRead(Ok(-48)));
        h.device.on_gatt_event(GattEvent::CharacteristicsDiscovered {
            service: Uuid::from_u128(5),
            result: Err(TransportError::Operation {
                operation: "discover",
                message: "gatt error".into(),
            }),
        });

        let kinds = h.kinds();
        assert_eq!(kinds[0], DeviceEventKind::BatteryLevel(55));
        assert_eq!(kinds[1], DeviceEventKind::Rssi(-48));
        assert!(matches!(kinds[2], DeviceEventKind::Error { .. }));
        assert_eq!(h.device.rssi(), -48);
        assert_eq!(h.device.last_battery_level(), Some(55));
        assert_eq!(h.device.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_link_reconnects_once() {
        let mut h = connected_device();
        h.transport.take_calls();

        h.lose_link();
        assert_eq!(h.device.state(), ConnectionState::Reconnecting);
        assert_eq!(h.kinds(), vec![DeviceEventKind::Reconnecting]);
        assert_eq!(h.device.log_service().state(), ServiceState::NotStarted);
        assert!(h
            .transport
            .calls()
            .contains(&Call::Connect(h.peripheral_id())));

        let old_instance = h.device.peripheral().link().instance();
        h.transport.set_connected(&h.peripheral_id(), true);
        let link = PeripheralLink::new(h.transport.clone(), h.peripheral_id());
        h.device.on_connected(link);

        assert_eq!(h.device.state(), ConnectionState::Connected);
        assert_eq!(h.kinds(), vec![DeviceEventKind::Reconnected]);
        assert_ne!(h.device.peripheral().link().instance(), old_instance);
        assert!(h.device.handlers_bound_to_current_link());
        assert_eq!(
            h.device.log_service().state(),
            ServiceState::DiscoveringService
        );

        // The deadline was cancelled; nothing else is emitted later.
        tokio::time::sleep(Duration::from_secs(60 * 11)).await;
        while let Ok(CoreEvent::Timer(event)) = h.queue.try_recv() {
            assert_ne!(event.kind, TimerKind::ReconnectDeadline);
            h.device.on_timer(&event);
        }
        assert!(h
            .kinds()
            .iter()
            .all(|k| !matches!(k, DeviceEventKind::Disconnected | DeviceEventKind::Reconnected)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_gives_up_after_deadline() {
        let mut h = connected_device();
        h.lose_link();
        h.transport.take_calls();

        h.fire(TimerKind::ReconnectDeadline).await;

        assert_eq!(h.device.state(), ConnectionState::Disconnected);
        assert_eq!(
            h.kinds(),
            vec![DeviceEventKind::Reconnecting, DeviceEventKind::Disconnected]
        );
        assert!(h
            .transport
            .calls()
            .contains(&Call::CancelConnection(h.peripheral_id())));

        // A late connect is refused rather than resurrecting the session.
        let link = PeripheralLink::new(h.transport.clone(), h.peripheral_id());
        h.device.on_connected(link);
        assert_eq!(h.device.state(), ConnectionState::Disconnected);
        assert!(h.kinds().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_is_terminal() {
        let mut h = connected_device();
        h.lose_link();
        h.kinds();

        h.device.disconnect();
        assert_eq!(h.device.state(), ConnectionState::Disconnected);
        assert!(!h.device.will_try_to_reconnect());
        assert!(h.kinds().is_empty());

        // The in-flight reconnect completes anyway.
        h.transport.set_connected(&h.peripheral_id(), true);
        let link = PeripheralLink::new(h.transport.clone(), h.peripheral_id());
        h.device.on_connected(link);
        assert_eq!(h.device.state(), ConnectionState::Disconnected);

        // A later error disconnect does not start reconnecting either.
        h.device.on_disconnected(Some(TransportError::Operation {
            operation: "link",
            message: "gone".into(),
        }));
        assert_eq!(h.device.state(), ConnectionState::Disconnected);
        assert!(h.kinds().is_empty());

        tokio::time::sleep(Duration::from_secs(60 * 11)).await;
        while let Ok(CoreEvent::Timer(event)) = h.queue.try_recv() {
            h.device.on_timer(&event);
        }
        assert!(h.kinds().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_while_connected_does_not_reconnect() {
        let mut h = connected_device();
        h.transport.take_calls();
        h.device.disconnect();
        assert_eq!(
            h.transport.calls(),
            vec![Call::CancelConnection(h.peripheral_id())]
        );

        h.lose_link();
        assert_eq!(h.device.state(), ConnectionState::Disconnected);
        assert!(!h.transport.calls().contains(&Call::Connect(h.peripheral_id())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_failure_and_clean_disconnect() {
        let mut h = connected_device();
        h.lose_link();
        h.device.on_connect_failed(None);
        assert_eq!(h.device.state(), ConnectionState::Disconnected);
        assert_eq!(
            h.kinds(),
            vec![DeviceEventKind::Reconnecting, DeviceEventKind::Disconnected]
        );

        let mut h = connected_device();
        h.device.on_disconnected(None);
        h.device.on_disconnected(None);
        assert_eq!(h.kinds(), vec![DeviceEventKind::Disconnected]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_radio_off_bypasses_reconnection() {
        let mut h = connected_device();
        h.lose_link();
        h.device.on_radio_state(RadioState::PoweredOff);
        assert_eq!(h.device.state(), ConnectionState::Disconnected);
        assert_eq!(
            h.kinds(),
            vec![DeviceEventKind::Reconnecting, DeviceEventKind::Disconnected]
        );

        h.device.on_radio_state(RadioState::PoweredOff);
        assert!(h.kinds().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_reconnection() {
        let mut h = connected_device();
        h.lose_link();
        h.device.cancel_reconnection();
        h.device.cancel_reconnection();
        assert_eq!(
            h.kinds(),
            vec![DeviceEventKind::Reconnecting, DeviceEventKind::Disconnected]
        );
    }
}

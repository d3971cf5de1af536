//! Battery/Factory Service
//!
//! Request/response codec on the factory characteristic. Once ready it polls
//! the battery capacity on a fixed interval; the second generation firmware
//! also treats that poll as a keep-alive.

use crate::domain::firmware::Firmware;
use crate::domain::models::{DeviceEvent, DeviceEventKind};
use crate::infrastructure::bluetooth::peripheral::{GattService, PeripheralLink, ServiceState};
use crate::infrastructure::bluetooth::protocol::{
    self, DecodeError, FactoryResponse, ServiceIds,
};
use crate::infrastructure::bluetooth::scheduler::{Scheduler, TimerKind, TimerSlot};
use crate::infrastructure::bluetooth::transport::{CharacteristicRef, WriteType};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

pub struct FactoryService {
    device_id: String,
    link: PeripheralLink,
    scheduler: Scheduler,
    ids: ServiceIds,
    supports_battery: bool,
    poll_interval: Duration,
    state: ServiceState,
    characteristic: Option<CharacteristicRef>,
    notifying: bool,
    polling: bool,
    poll: TimerSlot,
    last_battery_level: Option<i32>,
    observer: Option<mpsc::UnboundedSender<DeviceEvent>>,
}

impl FactoryService {
    pub fn new(
        device_id: &str,
        link: PeripheralLink,
        scheduler: Scheduler,
        ids: ServiceIds,
        firmware: &Firmware,
        poll_interval: Duration,
    ) -> Self {
        Self {
            device_id: device_id.to_string(),
            link,
            scheduler,
            ids,
            supports_battery: firmware.firmware_type.supports_battery(),
            poll_interval,
            state: ServiceState::NotStarted,
            characteristic: None,
            notifying: false,
            polling: false,
            poll: TimerSlot::new(),
            last_battery_level: None,
            observer: None,
        }
    }

    /// Battery levels are reported as `DeviceEvent`s on this channel.
    pub fn set_observer(&mut self, observer: Option<mpsc::UnboundedSender<DeviceEvent>>) {
        self.observer = observer;
    }

    pub fn state(&self) -> ServiceState {
        self.state
    }

    pub fn link(&self) -> &PeripheralLink {
        &self.link
    }

    /// Most recent battery reading in percent.
    pub fn last_battery_level(&self) -> Option<i32> {
        self.last_battery_level
    }

    pub fn is_polling(&self) -> bool {
        self.polling
    }

    pub fn start(&mut self) {
        if let (ServiceState::Ready, Some(characteristic)) = (self.state, self.characteristic) {
            if !self.notifying {
                self.state = ServiceState::EnablingNotifications;
                self.update_notify_value(&characteristic, true);
            } else {
                self.did_start();
            }
            return;
        }

        self.state = ServiceState::DiscoveringService;
        let _ = self.link.discover_services(&[self.ids.service]);
    }

    pub fn stop(&mut self) {
        self.stop_battery_polling();
        match self.characteristic {
            Some(characteristic) => {
                self.state = ServiceState::Stopping;
                self.update_notify_value(&characteristic, false);
            }
            None => self.state = ServiceState::NotStarted,
        }
    }

    /// Forget the characteristic of a lost link.
    pub fn invalidate(&mut self) {
        self.stop_battery_polling();
        self.state = ServiceState::NotStarted;
        self.characteristic = None;
        self.notifying = false;
    }

    pub fn rebind(&mut self, link: PeripheralLink) {
        self.invalidate();
        self.link = link;
    }

    /// Poll the battery capacity every poll interval. Only families with a
    /// battery gauge answer, so this is a no-op for the others.
    pub fn start_battery_polling(&mut self) {
        if !self.supports_battery || self.polling {
            return;
        }
        self.polling = true;
        self.poll_battery();
    }

    pub fn stop_battery_polling(&mut self) {
        self.polling = false;
        self.poll.cancel();
    }

    pub fn on_poll_timer(&mut self, id: u64) {
        if self.poll.fire(id) {
            self.poll_battery();
        }
    }

    /// Re-arms itself whether or not the previous request was answered.
    fn poll_battery(&mut self) {
        if !self.polling {
            return;
        }
        self.send_command(&protocol::battery_request());
        self.poll.arm(
            self.scheduler
                .schedule(self.link.id(), TimerKind::BatteryPoll, self.poll_interval),
        );
    }

    fn send_command(&self, bytes: &[u8]) {
        let Some(characteristic) = self.characteristic else {
            return;
        };
        debug!("FactorySvc({}): >> {:?}", self.device_id, bytes);
        let _ = self.link.write(&characteristic, bytes, WriteType::WithResponse);
    }

    fn update_notify_value(&self, characteristic: &CharacteristicRef, enabled: bool) {
        debug!(
            "FactorySvc({}): setting notification state to '{}'",
            self.device_id, enabled
        );
        let _ = self.link.set_notify(characteristic, enabled);
    }

    fn did_start(&mut self) {
        self.state = ServiceState::Ready;
        debug!("FactorySvc({}): factory service started", self.device_id);
        if !self.poll_interval.is_zero() {
            self.start_battery_polling();
        }
    }
}

impl GattService for FactoryService {
    fn service_uuid(&self) -> Uuid {
        self.ids.service
    }

    fn handle_service_discovered(&mut self) {
        if self.state != ServiceState::DiscoveringService {
            return;
        }
        self.state = ServiceState::DiscoveringCharacteristic;
        let _ = self
            .link
            .discover_characteristics(self.ids.service, &[self.ids.characteristic]);
    }

    fn handle_characteristics_discovered(&mut self, characteristics: &[Uuid]) {
        if self.state != ServiceState::DiscoveringCharacteristic
            || !characteristics.contains(&self.ids.characteristic)
        {
            return;
        }
        let characteristic = CharacteristicRef::new(self.ids.service, self.ids.characteristic);
        self.characteristic = Some(characteristic);
        self.state = ServiceState::EnablingNotifications;
        self.update_notify_value(&characteristic, true);
    }

    fn handle_notify_state(&mut self, characteristic: Uuid, notifying: bool) {
        if characteristic != self.ids.characteristic {
            return;
        }
        debug!(
            "FactorySvc({}): notification state set to '{}'",
            self.device_id, notifying
        );
        self.notifying = notifying;

        match (self.state, notifying) {
            (ServiceState::EnablingNotifications, true) => self.did_start(),
            (ServiceState::Stopping, false) => self.state = ServiceState::NotStarted,
            _ => {}
        }
    }

    fn handle_data(&mut self, characteristic: Uuid, bytes: &[u8]) {
        if characteristic != self.ids.characteristic {
            return;
        }
        debug!("FactorySvc({}): << {:?}", self.device_id, bytes);

        match protocol::decode_factory_response(bytes) {
            Ok(FactoryResponse::BatteryCapacity(percent)) => {
                self.last_battery_level = Some(percent);
                if let Some(observer) = &self.observer {
                    let _ = observer.send(DeviceEvent::new(
                        &self.device_id,
                        DeviceEventKind::BatteryLevel(percent),
                    ));
                }
            }
            Err(DecodeError::Empty) => {}
            Err(e @ (DecodeError::UnknownCommand(_) | DecodeError::UnknownInfo(_))) => {
                warn!("FactorySvc({}): {}", self.device_id, e);
            }
            Err(e) => {
                debug!("FactorySvc({}): dropping malformed response: {}", self.device_id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::firmware::{FirmwareType, ProtocolRevision};
    use crate::infrastructure::bluetooth::protocol::ProtocolProfile;
    use crate::infrastructure::bluetooth::scheduler::CoreEvent;
    use crate::infrastructure::bluetooth::transport::mock::{Call, MockTransport};
    use crate::infrastructure::bluetooth::transport::PeripheralId;
    use std::sync::Arc;

    fn service(
        firmware_type: FirmwareType,
    ) -> (
        Arc<MockTransport>,
        FactoryService,
        mpsc::UnboundedReceiver<CoreEvent>,
        mpsc::UnboundedReceiver<DeviceEvent>,
    ) {
        let transport = Arc::new(MockTransport::new());
        let id = PeripheralId::new("factory-peripheral");
        transport.set_connected(&id, true);
        let (queue_tx, queue) = mpsc::unbounded_channel();
        let (events_tx, events) = mpsc::unbounded_channel();
        let ids = ProtocolProfile::for_revision(ProtocolRevision::R04).factory;

        let mut service = FactoryService::new(
            "42",
            PeripheralLink::new(transport.clone(), id),
            Scheduler::new(queue_tx),
            ids,
            &Firmware::new(firmware_type, 24),
            Duration::from_secs(20),
        );
        service.set_observer(Some(events_tx));
        (transport, service, queue, events)
    }

    fn bring_up(service: &mut FactoryService) {
        let ids = service.ids;
        service.start();
        service.handle_service_discovered();
        service.handle_characteristics_discovered(&[ids.characteristic]);
        service.handle_notify_state(ids.characteristic, true);
    }

    #[tokio::test(start_paused = true)]
    async fn test_polls_battery_once_ready() {
        let (transport, mut service, mut queue, mut events) = service(FirmwareType::TrackerB);
        let ids = service.ids;
        bring_up(&mut service);

        assert_eq!(service.state(), ServiceState::Ready);
        assert!(service.is_polling());
        assert!(matches!(
            transport.calls().last(),
            Some(Call::Write(_, _, bytes, WriteType::WithResponse)) if bytes == &vec![147, 46]
        ));

        // Unanswered polls keep going.
        for _ in 0..2 {
            let Some(CoreEvent::Timer(event)) = queue.recv().await else {
                panic!("expected timer");
            };
            assert_eq!(event.kind, TimerKind::BatteryPoll);
            service.on_poll_timer(event.id);
        }
        assert_eq!(transport.writes().len(), 3);

        service.handle_data(ids.characteristic, &[148, 46, 87, 0, 0, 0]);
        assert_eq!(service.last_battery_level(), Some(87));
        assert_eq!(
            events.try_recv().unwrap(),
            DeviceEvent::new("42", DeviceEventKind::BatteryLevel(87))
        );

        service.stop();
        assert!(!service.is_polling());
        assert!(matches!(
            transport.calls().last(),
            Some(Call::SetNotify(_, _, false))
        ));
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(queue.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_generation_does_not_poll() {
        let (transport, mut service, _queue, _events) = service(FirmwareType::TrackerA);
        bring_up(&mut service);
        assert_eq!(service.state(), ServiceState::Ready);
        assert!(!service.is_polling());
        assert!(transport.writes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_responses_are_dropped() {
        let (_transport, mut service, _queue, mut events) = service(FirmwareType::TrackerBExtended);
        let ids = service.ids;
        bring_up(&mut service);

        service.handle_data(ids.characteristic, &[148, 46, 87]);
        service.handle_data(ids.characteristic, &[148, 12, 0, 0, 0, 0]);
        service.handle_data(ids.characteristic, &[7]);
        service.handle_data(ids.characteristic, &[]);

        assert_eq!(service.last_battery_level(), None);
        assert!(events.try_recv().is_err());
    }
}

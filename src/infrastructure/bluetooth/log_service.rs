//! Telemetry Service
//!
//! Owns the log characteristic of one sensor: brings notifications up, sends
//! log commands and decodes every frame the sensor streams back.
//!
//! On protocol revisions whose writes are not acknowledged by the link layer
//! the last command is resent every response timeout until a `RESPONSE`
//! frame arrives.

use crate::domain::telemetry::{LogType, TelemetryEvent};
use crate::infrastructure::bluetooth::peripheral::{
    GattService, PeripheralLink, ServiceError, ServiceState,
};
use crate::infrastructure::bluetooth::protocol::{
    self, DecodeError, LogCommand, LogFrame, LogRate, ProtocolProfile, MAX_LOG_TAGS,
};
use crate::infrastructure::bluetooth::scheduler::{Scheduler, TimerKind, TimerSlot};
use crate::infrastructure::bluetooth::transport::{CharacteristicRef, WriteType};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};
use uuid::Uuid;

const NAME: &str = "Log";

/// Resend policy for unacknowledged commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResendPolicy {
    pub timeout: Duration,
    /// `None` keeps resending for as long as the device stays silent.
    pub max_retries: Option<u32>,
}

impl Default for ResendPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(800),
            max_retries: None,
        }
    }
}

pub struct TelemetryService {
    device_id: String,
    link: PeripheralLink,
    scheduler: Scheduler,
    profile: ProtocolProfile,
    resend: ResendPolicy,
    state: ServiceState,
    characteristic: Option<CharacteristicRef>,
    notifying: bool,
    will_enable_notifications: bool,
    pending_command: Vec<u8>,
    retries: u32,
    response_timeout: TimerSlot,
    observer: Option<mpsc::UnboundedSender<TelemetryEvent>>,
}

impl TelemetryService {
    pub fn new(
        device_id: &str,
        link: PeripheralLink,
        scheduler: Scheduler,
        profile: ProtocolProfile,
        resend: ResendPolicy,
    ) -> Self {
        Self {
            device_id: device_id.to_string(),
            link,
            scheduler,
            profile,
            resend,
            state: ServiceState::NotStarted,
            characteristic: None,
            notifying: false,
            will_enable_notifications: true,
            pending_command: Vec::new(),
            retries: 0,
            response_timeout: TimerSlot::new(),
            observer: None,
        }
    }

    /// Replaces any previous observer.
    pub fn set_observer(&mut self, observer: Option<mpsc::UnboundedSender<TelemetryEvent>>) {
        self.observer = observer;
    }

    pub fn state(&self) -> ServiceState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == ServiceState::Ready
    }

    pub fn is_notifying(&self) -> bool {
        self.notifying
    }

    pub fn link(&self) -> &PeripheralLink {
        &self.link
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// The command still waiting for an acknowledgement, if any.
    pub fn pending_command(&self) -> Option<&[u8]> {
        (!self.pending_command.is_empty()).then_some(self.pending_command.as_slice())
    }

    /// Bring the service up. Signals `Started` right away when it is already
    /// ready in the requested notification mode.
    pub fn start(&mut self, enable_notifications: bool) {
        self.will_enable_notifications = enable_notifications;

        if let (ServiceState::Ready, Some(characteristic)) = (self.state, self.characteristic) {
            if !self.notifying && enable_notifications {
                self.state = ServiceState::EnablingNotifications;
                self.update_notify_value(&characteristic, true);
            } else {
                self.signal_started();
            }
            return;
        }

        self.state = ServiceState::DiscoveringService;
        let _ = self.link.discover_services(&[self.profile.log.service]);
    }

    /// Tear the service down, optionally turning every log off first.
    ///
    /// When logs are turned off on a revision that acknowledges the off
    /// command, notifications stay on until that acknowledgement arrives.
    pub fn stop(&mut self, turn_off_logs: bool) {
        let Some(characteristic) = self.characteristic else {
            self.state = ServiceState::NotStarted;
            return;
        };
        self.state = ServiceState::Stopping;

        if turn_off_logs {
            self.write_command(LogCommand::AllOff.encode());
        }

        if !self.profile.await_off_ack || !turn_off_logs {
            self.update_notify_value(&characteristic, false);
        }
    }

    /// Forget everything learned about the current link. Used when the link
    /// is lost; the service has to be discovered again from scratch.
    pub fn invalidate(&mut self) {
        self.state = ServiceState::NotStarted;
        self.characteristic = None;
        self.notifying = false;
        self.clear_pending();
    }

    /// Move the service onto a new connection instance.
    pub fn rebind(&mut self, link: PeripheralLink) {
        self.invalidate();
        self.link = link;
    }

    /// Enable `log_types` at `rate`. Enabled kinds accumulate on the device;
    /// an empty list turns every log off.
    pub fn enable_logs(&mut self, rate: LogRate, log_types: &[LogType]) -> Result<(), ServiceError> {
        let command = LogCommand::enable(rate, log_types);
        if command.tag_count() > MAX_LOG_TAGS {
            warn!(
                "LogSvc({}): more log ids than fit in one command: {:?}",
                self.device_id, log_types
            );
        }
        self.send_command(command)
    }

    pub fn stop_logs(&mut self) -> Result<(), ServiceError> {
        self.send_command(LogCommand::AllOff)
    }

    /// Ask for a `TIMESTAMP_FULL` frame by reading the characteristic.
    pub fn read_full_timestamp(&self) -> Result<(), ServiceError> {
        let characteristic = self.ready_characteristic()?;
        debug!("LogSvc({}): >> READ", self.device_id);
        self.link.read_value(&characteristic)?;
        Ok(())
    }

    /// Resend timer fired.
    pub fn on_response_timeout(&mut self, id: u64) {
        if !self.response_timeout.fire(id) {
            return;
        }
        if self.pending_command.is_empty() || !self.notifying || !self.link.is_connected() {
            return;
        }

        if let Some(max) = self.resend.max_retries {
            if self.retries >= max {
                warn!(
                    "LogSvc({}): giving up on {:?} after {} resends",
                    self.device_id, self.pending_command, self.retries
                );
                self.clear_pending();
                return;
            }
        }

        self.retries += 1;
        debug!(
            "LogSvc({}): no reply within {:?}, resending (attempt {})",
            self.device_id, self.resend.timeout, self.retries
        );
        let command = self.pending_command.clone();
        self.transmit(command);
    }

    fn send_command(&mut self, command: LogCommand) -> Result<(), ServiceError> {
        if let Err(e) = self.ready_characteristic() {
            warn!("LogSvc({}): can't send {:?}: {}", self.device_id, command, e);
            return Err(e);
        }
        self.write_command(command.encode());
        Ok(())
    }

    /// Write a new command, restarting the resend count.
    fn write_command(&mut self, bytes: Vec<u8>) {
        self.retries = 0;
        self.transmit(bytes);
    }

    fn transmit(&mut self, bytes: Vec<u8>) {
        let Some(characteristic) = self.characteristic else {
            debug!("LogSvc({}): can't send command to log service", self.device_id);
            return;
        };
        debug!(
            "LogSvc({}): >> {:?} ({:?})",
            self.device_id,
            bytes,
            LogCommand::parse(&bytes)
        );

        if self.profile.resend_unacknowledged {
            self.response_timeout.arm(self.scheduler.schedule(
                self.link.id(),
                TimerKind::CommandTimeout,
                self.resend.timeout,
            ));
            let _ = self
                .link
                .write(&characteristic, &bytes, WriteType::WithoutResponse);
            self.pending_command = bytes;
        } else {
            let _ = self
                .link
                .write(&characteristic, &bytes, WriteType::WithoutResponse);
        }
    }

    fn ready_characteristic(&self) -> Result<CharacteristicRef, ServiceError> {
        let characteristic = self.characteristic.ok_or(ServiceError::NoCharacteristic(NAME))?;
        if self.state != ServiceState::Ready {
            return Err(ServiceError::NotReady(NAME));
        }
        Ok(characteristic)
    }

    fn clear_pending(&mut self) {
        self.pending_command.clear();
        self.retries = 0;
        self.response_timeout.cancel();
    }

    fn update_notify_value(&self, characteristic: &CharacteristicRef, enabled: bool) {
        debug!(
            "LogSvc({}): setting notification state to '{}'",
            self.device_id, enabled
        );
        let _ = self.link.set_notify(characteristic, enabled);
    }

    fn signal_started(&self) {
        debug!("LogSvc({}): started", self.device_id);
        if let Some(observer) = &self.observer {
            let _ = observer.send(TelemetryEvent::Started {
                device_id: self.device_id.clone(),
            });
        }
    }

    fn handle_response(&mut self) {
        if self.profile.resend_unacknowledged {
            self.clear_pending();
        }

        if self.state == ServiceState::Stopping && self.profile.await_off_ack && self.notifying {
            if let Some(characteristic) = self.characteristic {
                self.update_notify_value(&characteristic, false);
            }
        }
    }
}

impl GattService for TelemetryService {
    fn service_uuid(&self) -> Uuid {
        self.profile.log.service
    }

    fn handle_service_discovered(&mut self) {
        if self.state != ServiceState::DiscoveringService {
            return;
        }
        self.state = ServiceState::DiscoveringCharacteristic;
        let _ = self
            .link
            .discover_characteristics(self.profile.log.service, &[self.profile.log.characteristic]);
    }

    fn handle_characteristics_discovered(&mut self, characteristics: &[Uuid]) {
        if self.state != ServiceState::DiscoveringCharacteristic
            || !characteristics.contains(&self.profile.log.characteristic)
        {
            return;
        }

        let characteristic =
            CharacteristicRef::new(self.profile.log.service, self.profile.log.characteristic);
        self.characteristic = Some(characteristic);

        if self.will_enable_notifications {
            self.state = ServiceState::EnablingNotifications;
            self.update_notify_value(&characteristic, true);
        } else {
            self.state = ServiceState::Ready;
            self.signal_started();
        }
    }

    fn handle_notify_state(&mut self, characteristic: Uuid, notifying: bool) {
        if characteristic != self.profile.log.characteristic {
            return;
        }
        debug!(
            "LogSvc({}): notification state set to '{}'",
            self.device_id, notifying
        );
        self.notifying = notifying;

        match (self.state, notifying) {
            (ServiceState::EnablingNotifications, true) => {
                self.state = ServiceState::Ready;
                self.signal_started();
            }
            (ServiceState::Stopping, false) => {
                self.state = ServiceState::NotStarted;
                self.clear_pending();
            }
            _ => {}
        }
    }

    fn handle_data(&mut self, characteristic: Uuid, bytes: &[u8]) {
        if characteristic != self.profile.log.characteristic {
            return;
        }
        trace!("LogSvc({}): << {:?}", self.device_id, bytes);
        let received_at = OffsetDateTime::now_utc();

        match protocol::decode_frame(bytes) {
            Ok(LogFrame::Response(bytes)) => {
                debug!("LogSvc({}): << {:?}", self.device_id, bytes);
                self.handle_response();
            }
            Ok(LogFrame::Telemetry(frame)) => {
                if let Some(observer) = &self.observer {
                    let _ = observer.send(TelemetryEvent::Frame {
                        device_id: self.device_id.clone(),
                        received_at,
                        frame,
                    });
                }
            }
            Err(DecodeError::Empty) => {}
            Err(e @ DecodeError::UnknownTag(_)) => {
                warn!("LogSvc({}): unhandled log type: {}", self.device_id, e);
            }
            Err(e) => {
                debug!("LogSvc({}): dropping malformed frame: {}", self.device_id, e);
            }
        }
    }
}

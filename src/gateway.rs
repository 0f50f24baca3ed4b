//! Composition root: supervises the link and connects it to the bus side.
//!
//! ```no_run
//! use diematic_lib::gateway::{DeviceGateway, GatewayConfig, MeasurementSink};
//! use diematic_lib::registers::Measurement;
//! use tokio_util::sync::CancellationToken;
//!
//! struct Print;
//!
//! impl MeasurementSink for Print {
//!     fn publish(&self, measurement: &Measurement) {
//!         println!("{measurement}");
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let gateway = DeviceGateway::new(GatewayConfig::new("192.168.1.7:88"), Print);
//!     gateway.run(&CancellationToken::new()).await?;
//!     Ok(())
//! }
//! ```
use crate::{
    link::LinkSession,
    poller::{CycleReport, PollCycleScheduler, WriteSlot},
    protocol as proto,
    registers::{Measurement, RegisterMap, DIEMATIC},
    Error, Result,
};
use log::*;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_modbus::Slave;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(700);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(6);
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_CONSECUTIVE_TIMEOUTS: u32 = 5;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// `host:port` of the serial to TCP adapter.
    pub address: String,
    pub device: Slave,
    pub connect_timeout: Duration,
    /// Silence after which the line counts as idle.
    pub read_timeout: Duration,
    /// Maximum wait for the reply to one request.
    pub request_timeout: Duration,
    pub reconnect_delay: Duration,
    pub max_consecutive_timeouts: u32,
}

impl GatewayConfig {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            device: Slave(proto::DEFAULT_DEVICE_ADDRESS),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            max_consecutive_timeouts: DEFAULT_MAX_CONSECUTIVE_TIMEOUTS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Polling,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self {
            LinkState::Disconnected => "disconnected",
            LinkState::Connecting => "connecting",
            LinkState::Polling => "polling",
        };
        f.write_str(state)
    }
}

/// Receiver of everything the gateway reports to the bus.
pub trait MeasurementSink: Send + Sync {
    /// Called for every decoded measurement of every poll cycle.
    fn publish(&self, measurement: &Measurement);

    fn link_state_changed(&self, _state: LinkState) {}
}

impl<T: MeasurementSink + ?Sized> MeasurementSink for Arc<T> {
    fn publish(&self, measurement: &Measurement) {
        (**self).publish(measurement)
    }

    fn link_state_changed(&self, state: LinkState) {
        (**self).link_state_changed(state)
    }
}

/// Translates named parameter changes into queued write commands.
#[derive(Debug, Clone)]
pub struct WriteHandle {
    map: &'static RegisterMap,
    slot: WriteSlot,
}

impl WriteHandle {
    /// Encodes `payload` for the writable parameter `parameter` and queues it.
    ///
    /// Fails with [`Error::WriteSlotFull`] while an earlier write is pending.
    pub fn submit(&self, parameter: &str, payload: &str) -> Result<()> {
        let writable = self
            .map
            .writable(parameter)
            .ok_or_else(|| Error::UnknownParameter(parameter.to_string()))?;
        let command = writable.encode(payload)?;
        debug!("Queueing {parameter}={payload} as {command:?}");
        self.slot.submit(command)
    }

    pub fn is_pending(&self) -> bool {
        self.slot.is_occupied()
    }
}

pub struct DeviceGateway<S> {
    config: GatewayConfig,
    map: &'static RegisterMap,
    sink: S,
    write_slot: WriteSlot,
}

impl<S: MeasurementSink> DeviceGateway<S> {
    pub fn new(config: GatewayConfig, sink: S) -> Self {
        Self {
            config,
            map: &DIEMATIC,
            sink,
            write_slot: WriteSlot::default(),
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Handle for the bus side to submit parameter writes.
    pub fn write_handle(&self) -> WriteHandle {
        WriteHandle {
            map: self.map,
            slot: self.write_slot.clone(),
        }
    }

    pub fn submit_write(&self, parameter: &str, payload: &str) -> Result<()> {
        self.write_handle().submit(parameter, payload)
    }

    fn scheduler(&self) -> PollCycleScheduler {
        PollCycleScheduler::new(&self.config, self.map, self.write_slot.clone())
    }

    fn set_state(&self, state: LinkState) {
        debug!("Link state: {state}");
        self.sink.link_state_changed(state);
    }

    /// Connects, runs a single poll cycle and disconnects.
    pub async fn poll_once(&self, cancel: &CancellationToken) -> Result<CycleReport> {
        let session = LinkSession::connect(&self.config, cancel).await?;
        let report = self.scheduler().run_cycle(&session, &self.sink).await;
        if let Err(err) = session.close().await {
            debug!("Session ended with: {err}");
        }
        report
    }

    /// Polls the device until `cancel` fires, reconnecting after failures.
    ///
    /// Every connection attempt creates a fresh session with its own receive
    /// task. Only returns once cancelled.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<()> {
        let mut scheduler = self.scheduler();
        info!(
            "Starting gateway for {} (device {:#04x})",
            self.config.address, self.config.device.0
        );

        while !cancel.is_cancelled() {
            self.set_state(LinkState::Connecting);
            match LinkSession::connect(&self.config, cancel).await {
                Ok(session) => {
                    self.set_state(LinkState::Polling);
                    scheduler.reset();
                    let reason = self.poll(&mut scheduler, &session, cancel).await;
                    match reason {
                        Error::Cancelled => {}
                        reason => warn!("Connection to {} lost: {reason}", session.peer()),
                    }
                    let closed = session.close().await;
                    if let Err(err) = closed {
                        debug!("Receive activity ended with: {err}");
                    }
                }
                Err(Error::Cancelled) => {}
                Err(err) => warn!("{err}"),
            }
            self.set_state(LinkState::Disconnected);

            if cancel.is_cancelled() {
                break;
            }
            info!("Reconnecting in {:?}", self.config.reconnect_delay);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
            }
        }

        info!("Gateway stopped");
        Ok(())
    }

    /// Runs cycles until one fails; returns the failure.
    async fn poll(
        &self,
        scheduler: &mut PollCycleScheduler,
        session: &LinkSession,
        cancel: &CancellationToken,
    ) -> Error {
        loop {
            if cancel.is_cancelled() {
                return Error::Cancelled;
            }
            match scheduler.run_cycle(session, &self.sink).await {
                Ok(report) => debug!("Poll cycle done: {report:?}"),
                Err(err) => return err,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    struct Discard;

    impl MeasurementSink for Discard {
        fn publish(&self, _measurement: &Measurement) {}
    }

    #[test]
    fn write_handle_translates_names() {
        let gateway = DeviceGateway::new(GatewayConfig::new("127.0.0.1:88"), Discard);
        let handle = gateway.write_handle();
        assert_matches!(
            handle.submit("boost", "1"),
            Err(Error::UnknownParameter(name)) if name == "boost"
        );
        assert_matches!(
            handle.submit("daytemp", "hot"),
            Err(Error::InvalidValue { .. })
        );
        assert!(!handle.is_pending());

        handle.submit("daytemp", "21.5").unwrap();
        assert!(handle.is_pending());
        assert_matches!(
            gateway.submit_write("mode", "8"),
            Err(Error::WriteSlotFull)
        );
    }

    #[test]
    fn defaults() {
        let config = GatewayConfig::new("heating:88");
        assert_eq!(config.device, Slave(0x0A));
        assert_eq!(config.read_timeout, Duration::from_millis(700));
        assert_eq!(config.request_timeout, Duration::from_secs(6));
        assert_eq!(config.max_consecutive_timeouts, 5);
        assert_eq!(LinkState::Polling.to_string(), "polling");
    }
}

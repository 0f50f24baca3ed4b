//! Poll cycle: every read block in order, then at most one queued write.
use crate::{
    gateway::{GatewayConfig, MeasurementSink},
    link::{Expectation, LinkSession},
    lock,
    protocol as proto,
    registers::{RegisterMap, WriteCommand},
    Error, Result,
};
use log::*;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_modbus::Slave;

/// Single-capacity holding area for the next write command.
///
/// Cloning yields another handle to the same slot.
#[derive(Debug, Clone, Default)]
pub struct WriteSlot(Arc<Mutex<Option<WriteCommand>>>);

impl WriteSlot {
    /// Queues `command`, or rejects it with [`Error::WriteSlotFull`] while
    /// another command has not been sent and resolved yet.
    pub fn submit(&self, command: WriteCommand) -> Result<()> {
        let mut slot = lock(&self.0);
        if slot.is_some() {
            return Err(Error::WriteSlotFull);
        }
        *slot = Some(command);
        Ok(())
    }

    pub fn is_occupied(&self) -> bool {
        lock(&self.0).is_some()
    }

    fn peek(&self) -> Option<WriteCommand> {
        lock(&self.0).clone()
    }

    fn release(&self) {
        lock(&self.0).take();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Acknowledged,
    /// Timed out or unencodable; the command is gone.
    Dropped,
}

/// Summary of one poll cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    pub blocks_read: usize,
    pub timeouts: usize,
    pub published: usize,
    pub write: Option<WriteOutcome>,
}

/// Drives the sequence of outbound requests over one session at a time.
#[derive(Debug)]
pub struct PollCycleScheduler {
    map: &'static RegisterMap,
    device: Slave,
    request_timeout: Duration,
    max_consecutive_timeouts: u32,
    consecutive_timeouts: u32,
    write_slot: WriteSlot,
}

impl PollCycleScheduler {
    pub fn new(config: &GatewayConfig, map: &'static RegisterMap, write_slot: WriteSlot) -> Self {
        Self {
            map,
            device: config.device,
            request_timeout: config.request_timeout,
            max_consecutive_timeouts: config.max_consecutive_timeouts,
            consecutive_timeouts: 0,
            write_slot,
        }
    }

    pub fn consecutive_timeouts(&self) -> u32 {
        self.consecutive_timeouts
    }

    /// Forgets the timeout history, e.g. for a new session.
    pub fn reset(&mut self) {
        self.consecutive_timeouts = 0;
    }

    /// Runs one full cycle on `session`, publishing decoded values to `sink`.
    ///
    /// Single request timeouts are tolerated. Fails with
    /// [`Error::Unresponsive`] once the consecutive timeout threshold is
    /// reached, and passes on any link or cancellation error.
    pub async fn run_cycle(
        &mut self,
        session: &LinkSession,
        sink: &dyn MeasurementSink,
    ) -> Result<CycleReport> {
        let mut report = CycleReport::default();

        for block in self.map.blocks_to_poll() {
            let frame = proto::encode_read_request(self.device, block.start, block.count);
            let expectation = Expectation::Registers { count: block.count };
            match self.transact(session, frame, expectation).await {
                Ok(payload) => {
                    report.blocks_read += 1;
                    for measurement in self.map.decode(block.start, &payload) {
                        trace!("Decoded {measurement}");
                        sink.publish(&measurement);
                        report.published += 1;
                    }
                }
                Err(Error::RequestTimeout(wait)) => {
                    report.timeouts += 1;
                    warn!(
                        "No reply for registers {}..{} within {wait:?} ({} in a row)",
                        block.start,
                        block.end(),
                        self.consecutive_timeouts
                    );
                    self.check_health()?;
                }
                Err(err) => return Err(err),
            }
        }

        if let Some(command) = self.write_slot.peek() {
            report.write = Some(self.send_write(session, &command).await?);
        }
        Ok(report)
    }

    async fn send_write(
        &mut self,
        session: &LinkSession,
        command: &WriteCommand,
    ) -> Result<WriteOutcome> {
        let frame = match proto::encode_write_request(self.device, command.address, &command.values) {
            Ok(frame) => frame,
            Err(err) => {
                warn!("Dropping write to register {}: {err}", command.address);
                self.write_slot.release();
                return Ok(WriteOutcome::Dropped);
            }
        };
        info!(
            "Writing {:?} to register {}",
            command.values, command.address
        );
        let expectation = Expectation::WriteAck {
            start: command.address,
            quantity: command.values.len() as u16,
        };
        match self.transact(session, frame, expectation).await {
            Ok(_) => {
                info!("Write to register {} acknowledged", command.address);
                self.write_slot.release();
                Ok(WriteOutcome::Acknowledged)
            }
            Err(Error::RequestTimeout(wait)) => {
                warn!(
                    "Write to register {} not acknowledged within {wait:?}, dropped",
                    command.address
                );
                self.write_slot.release();
                self.check_health()?;
                Ok(WriteOutcome::Dropped)
            }
            // Kept in the slot for the next session.
            Err(err) => Err(err),
        }
    }

    async fn transact(
        &mut self,
        session: &LinkSession,
        frame: proto::Frame,
        expectation: Expectation,
    ) -> Result<Vec<u8>> {
        let result = session
            .request(frame, expectation, self.request_timeout)
            .await;
        match &result {
            Ok(_) => self.consecutive_timeouts = 0,
            Err(Error::RequestTimeout(_)) => self.consecutive_timeouts += 1,
            Err(_) => {}
        }
        result
    }

    fn check_health(&self) -> Result<()> {
        if self.consecutive_timeouts >= self.max_consecutive_timeouts {
            Err(Error::Unresponsive(self.consecutive_timeouts))
        } else {
            Ok(())
        }
    }
}

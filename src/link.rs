//! TCP session to the regulator.
//!
//! A [`LinkSession`] owns one connection and one receive task. The task is the
//! only writer on the socket: the link is shared with the regulator's own bus
//! traffic, so a request goes out only after a read timeout has shown the line
//! to be silent. Replies are matched against the single pending request.
use crate::{
    gateway::GatewayConfig,
    lock,
    protocol::{self as proto, Frame, FrameError, ParsedReply},
    Error, Result,
};
use log::*;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_modbus::{Address, Quantity, Slave};
use tokio_util::sync::CancellationToken;

/// What a reply has to look like to resolve the pending request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expectation {
    /// Read reply carrying `count` registers.
    Registers { count: Quantity },
    /// Write acknowledgement echoing start address and quantity.
    WriteAck { start: Address, quantity: Quantity },
}

impl Expectation {
    pub fn matches(&self, reply: &ParsedReply<'_>) -> bool {
        match *self {
            Expectation::Registers { count } => {
                reply.is_read() && usize::from(reply.byte_count) == 2 * usize::from(count)
            }
            Expectation::WriteAck { start, quantity } => {
                reply.write_echo() == Some((start, quantity))
            }
        }
    }
}

#[derive(Debug)]
struct PendingRequest {
    frame: Frame,
    expectation: Expectation,
    transmissions: u32,
    resolve: oneshot::Sender<Vec<u8>>,
}

type PendingSlot = Arc<Mutex<Option<PendingRequest>>>;

/// One connection to the device.
///
/// Dropping the session stops its receive task.
#[derive(Debug)]
pub struct LinkSession {
    peer: String,
    pending: PendingSlot,
    cancel: CancellationToken,
    token: CancellationToken,
    receiver: Option<JoinHandle<Result<()>>>,
}

impl LinkSession {
    /// Connects to the device and spawns the receive task.
    ///
    /// Gives up after `connect_timeout`; never retries.
    pub async fn connect(config: &GatewayConfig, cancel: &CancellationToken) -> Result<Self> {
        let connect_error = |source| Error::Connect {
            address: config.address.clone(),
            source,
        };
        debug!("Connecting to {} ...", config.address);
        let stream = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            connected = tokio::time::timeout(
                config.connect_timeout,
                TcpStream::connect(config.address.as_str()),
            ) => match connected {
                Ok(Ok(stream)) => stream,
                Ok(Err(err)) => return Err(connect_error(err)),
                Err(_) => {
                    return Err(connect_error(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("no connection within {:?}", config.connect_timeout),
                    )))
                }
            },
        };
        stream.set_nodelay(true).map_err(connect_error)?;

        let pending = PendingSlot::default();
        let token = cancel.child_token();
        let receiver = Receiver {
            stream,
            device: config.device,
            read_timeout: config.read_timeout,
            pending: pending.clone(),
            token: token.clone(),
            buffer: Vec::with_capacity(proto::ANSWER_FRAME_MAX_LENGTH),
        };
        info!("Connected to {}", config.address);
        Ok(Self {
            peer: config.address.clone(),
            pending,
            cancel: cancel.clone(),
            token,
            receiver: Some(tokio::spawn(receiver.run())),
        })
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Whether the receive task is still running.
    pub fn is_open(&self) -> bool {
        !self.token.is_cancelled()
    }

    /// Makes `frame` the pending request and waits for the matching reply.
    ///
    /// Returns the register data of a read reply, or the echoed bytes of a
    /// write acknowledgement. Fails with [`Error::Busy`] while another request
    /// is pending, [`Error::RequestTimeout`] after `wait`.
    pub async fn request(
        &self,
        frame: Frame,
        expectation: Expectation,
        wait: Duration,
    ) -> Result<Vec<u8>> {
        let (resolve, resolved) = oneshot::channel();
        {
            let mut slot = lock(&self.pending);
            if slot.is_some() {
                return Err(Error::Busy);
            }
            if !self.is_open() {
                return Err(self.closed_error());
            }
            *slot = Some(PendingRequest {
                frame,
                expectation,
                transmissions: 0,
                resolve,
            });
        }

        let outcome = tokio::select! {
            biased;
            reply = resolved => reply.map_err(|_| self.closed_error()),
            _ = self.token.cancelled() => Err(self.closed_error()),
            _ = tokio::time::sleep(wait) => Err(Error::RequestTimeout(wait)),
        };
        if outcome.is_err() {
            lock(&self.pending).take();
        }
        outcome
    }

    fn closed_error(&self) -> Error {
        if self.cancel.is_cancelled() {
            Error::Cancelled
        } else {
            Error::link_closed()
        }
    }

    /// Stops the receive task and returns the reason it ended.
    pub async fn close(mut self) -> Result<()> {
        self.token.cancel();
        match self.receiver.take() {
            Some(receiver) => receiver
                .await
                .unwrap_or_else(|err| Err(Error::LinkLost(io::Error::other(err)))),
            None => Ok(()),
        }
    }
}

impl Drop for LinkSession {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

struct Receiver {
    stream: TcpStream,
    device: Slave,
    read_timeout: Duration,
    pending: PendingSlot,
    token: CancellationToken,
    buffer: Vec<u8>,
}

impl Receiver {
    async fn run(mut self) -> Result<()> {
        let _guard = self.token.clone().drop_guard();
        let result = self.receive().await;
        self.token.cancel();
        // Drops the resolver, waking a waiting request.
        lock(&self.pending).take();
        match &result {
            Ok(()) => debug!("Receive activity stopped"),
            Err(err) => warn!("Receive activity failed: {err}"),
        }
        result
    }

    async fn receive(&mut self) -> Result<()> {
        let mut chunk = [0u8; 1024];
        loop {
            let read = tokio::select! {
                _ = self.token.cancelled() => return Ok(()),
                read = tokio::time::timeout(self.read_timeout, self.stream.read(&mut chunk)) => read,
            };
            match read {
                Err(_) => self.on_idle().await?,
                Ok(Ok(0)) => {
                    return Err(Error::LinkLost(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed by peer",
                    )))
                }
                Ok(Ok(len)) => self.on_bytes(&chunk[..len]),
                Ok(Err(err)) => return Err(Error::LinkLost(err)),
            }
        }
    }

    /// The line is silent: drop leftovers and (re)send the pending request.
    async fn on_idle(&mut self) -> Result<()> {
        if !self.buffer.is_empty() {
            debug!(
                "Discarding {} incomplete bytes: {}",
                self.buffer.len(),
                hex::encode(&self.buffer)
            );
            self.buffer.clear();
        }
        let Some(frame) = self.next_transmission() else {
            return Ok(());
        };
        trace!("Send request {}", hex::encode(&frame));
        self.stream
            .write_all(&frame)
            .await
            .map_err(Error::LinkLost)
    }

    fn next_transmission(&self) -> Option<Frame> {
        let mut slot = lock(&self.pending);
        let pending = slot.as_mut()?;
        pending.transmissions += 1;
        if pending.transmissions > 1 {
            debug!("Resending request (attempt {})", pending.transmissions);
        }
        Some(pending.frame.clone())
    }

    fn on_bytes(&mut self, bytes: &[u8]) {
        trace!("Received {}", hex::encode(bytes));
        self.buffer.extend_from_slice(bytes);
        if self.buffer.len() > proto::ANSWER_FRAME_MAX_LENGTH {
            warn!("Discarding {} bytes without a valid frame", self.buffer.len());
            self.buffer.clear();
            return;
        }
        while !self.buffer.is_empty() {
            match proto::validate_reply(&self.buffer, self.device) {
                Ok(reply) => {
                    let consumed = reply.frame_len;
                    resolve(&self.pending, &reply);
                    self.buffer.drain(..consumed);
                }
                // The rest of the frame may still be on its way.
                Err(FrameError::LengthError { .. }) => return,
                // Foreign traffic or filler ahead of the frame start.
                Err(err @ (FrameError::AddressMismatch { .. } | FrameError::UnknownFunction(_))) => {
                    trace!("Skipping byte {:#04x}: {err}", self.buffer[0]);
                    self.buffer.remove(0);
                }
                Err(err) => {
                    debug!("Discarding reply {}: {err}", hex::encode(&self.buffer));
                    self.buffer.clear();
                }
            }
        }
    }
}

fn resolve(pending: &PendingSlot, reply: &ParsedReply<'_>) {
    let mut slot = lock(pending);
    if !slot
        .as_ref()
        .is_some_and(|pending| pending.expectation.matches(reply))
    {
        debug!(
            "Discarding reply (function {:#04x}, {} bytes) not matching the pending request",
            reply.function, reply.byte_count
        );
        return;
    }
    if let Some(pending) = slot.take() {
        // The requester may have timed out in the meantime.
        let _ = pending.resolve.send(reply.payload.to_vec());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{tests::read_reply, DEFAULT_DEVICE_ADDRESS};
    use assert_matches::assert_matches;
    use tokio::net::TcpListener;

    fn config(address: String) -> GatewayConfig {
        let mut config = GatewayConfig::new(address);
        config.read_timeout = Duration::from_millis(20);
        config.connect_timeout = Duration::from_secs(1);
        config
    }

    #[test]
    fn expectation_matching() {
        let frame = read_reply(DEFAULT_DEVICE_ADDRESS, &[1, 2]);
        let reply = proto::validate_reply(&frame, Slave(DEFAULT_DEVICE_ADDRESS)).unwrap();
        assert!(Expectation::Registers { count: 2 }.matches(&reply));
        assert!(!Expectation::Registers { count: 3 }.matches(&reply));
        assert!(!Expectation::WriteAck {
            start: 0,
            quantity: 1
        }
        .matches(&reply));

        let request = proto::encode_write_request(Slave(DEFAULT_DEVICE_ADDRESS), 14, &[200]).unwrap();
        let ack = proto::expected_write_ack(&request).unwrap();
        let reply = proto::validate_reply(&ack, Slave(DEFAULT_DEVICE_ADDRESS)).unwrap();
        assert!(Expectation::WriteAck {
            start: 14,
            quantity: 1
        }
        .matches(&reply));
        assert!(!Expectation::WriteAck {
            start: 15,
            quantity: 1
        }
        .matches(&reply));
        assert!(!Expectation::Registers { count: 2 }.matches(&reply));
    }

    #[tokio::test]
    async fn connect_error_without_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);
        let result = LinkSession::connect(&config(address), &CancellationToken::new()).await;
        assert_matches!(result, Err(Error::Connect { .. }));
    }

    #[tokio::test]
    async fn request_is_sent_when_idle_and_resolved() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let device = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 9];
            socket.read_exact(&mut request).await.unwrap();
            // Split the reply to check reassembly.
            let reply = read_reply(DEFAULT_DEVICE_ADDRESS, &[215, 3]);
            socket.write_all(&reply[..4]).await.unwrap();
            socket.write_all(&reply[4..]).await.unwrap();
            socket.write_all(&[proto::FRAME_FILLER]).await.unwrap();
            (request, socket)
        });

        let session = LinkSession::connect(&config(address), &CancellationToken::new())
            .await
            .unwrap();
        let frame = proto::encode_read_request(Slave(DEFAULT_DEVICE_ADDRESS), 7, 2);
        let payload = session
            .request(frame.clone(), Expectation::Registers { count: 2 }, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(payload, vec![0x00, 0xD7, 0x00, 0x03]);
        let (request, _socket) = device.await.unwrap();
        assert_eq!(request.to_vec(), frame);
        assert!(session.close().await.is_ok());
    }

    #[tokio::test]
    async fn reply_behind_foreign_bytes_is_found() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let device = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 9];
            socket.read_exact(&mut request).await.unwrap();
            // Filler, a stray byte and another station's frame share the segment.
            let mut segment = vec![proto::FRAME_FILLER, 0x7F];
            segment.extend(read_reply(0x02, &[9, 9]));
            segment.extend(read_reply(DEFAULT_DEVICE_ADDRESS, &[215, 3]));
            socket.write_all(&segment).await.unwrap();
            socket
        });

        let session = LinkSession::connect(&config(address), &CancellationToken::new())
            .await
            .unwrap();
        let frame = proto::encode_read_request(Slave(DEFAULT_DEVICE_ADDRESS), 7, 2);
        let payload = session
            .request(frame, Expectation::Registers { count: 2 }, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(payload, vec![0x00, 0xD7, 0x00, 0x03]);
        let _socket = device.await.unwrap();
        assert!(session.close().await.is_ok());
    }

    #[tokio::test]
    async fn mismatching_reply_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 9];
            while socket.read_exact(&mut request).await.is_ok() {
                let reply = read_reply(DEFAULT_DEVICE_ADDRESS, &[1, 2, 3]);
                if socket.write_all(&reply).await.is_err() {
                    break;
                }
            }
        });

        let session = LinkSession::connect(&config(address), &CancellationToken::new())
            .await
            .unwrap();
        let frame = proto::encode_read_request(Slave(DEFAULT_DEVICE_ADDRESS), 7, 2);
        let result = session
            .request(frame, Expectation::Registers { count: 2 }, Duration::from_millis(200))
            .await;
        assert_matches!(result, Err(Error::RequestTimeout(_)));
        assert!(session.is_open());
    }

    #[tokio::test]
    async fn only_one_pending_request() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let _device = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(socket);
        });

        let session = LinkSession::connect(&config(address), &CancellationToken::new())
            .await
            .unwrap();
        let frame = proto::encode_read_request(Slave(DEFAULT_DEVICE_ADDRESS), 7, 2);
        let (first, second) = tokio::join!(
            session.request(
                frame.clone(),
                Expectation::Registers { count: 2 },
                Duration::from_millis(300)
            ),
            async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                session
                    .request(frame.clone(), Expectation::Registers { count: 2 }, Duration::from_millis(300))
                    .await
            }
        );
        assert_matches!(first, Err(Error::RequestTimeout(_)));
        assert_matches!(second, Err(Error::Busy));
    }

    #[tokio::test]
    async fn peer_close_is_link_lost() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            drop(socket);
        });

        let session = LinkSession::connect(&config(address), &CancellationToken::new())
            .await
            .unwrap();
        let frame = proto::encode_read_request(Slave(DEFAULT_DEVICE_ADDRESS), 7, 2);
        let result = session
            .request(frame, Expectation::Registers { count: 2 }, Duration::from_secs(2))
            .await;
        assert_matches!(result, Err(Error::LinkLost(_)));
        assert!(!session.is_open());
        assert_matches!(session.close().await, Err(Error::LinkLost(_)));
    }

    #[tokio::test]
    async fn cancellation_ends_pending_request() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let _device = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(socket);
        });

        let cancel = CancellationToken::new();
        let session = LinkSession::connect(&config(address), &cancel).await.unwrap();
        let frame = proto::encode_read_request(Slave(DEFAULT_DEVICE_ADDRESS), 7, 2);
        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            stopper.cancel();
        });
        let result = session
            .request(frame, Expectation::Registers { count: 2 }, Duration::from_secs(5))
            .await;
        assert_matches!(result, Err(Error::Cancelled));
        assert!(session.close().await.is_ok());
    }
}

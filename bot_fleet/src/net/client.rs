//! A blocking TCP game client.
//!
//! One instance lives on one worker thread for the duration of one
//! connection attempt. Reads use a short timeout so the owning thread can
//! interleave its own queued writes between polls.

use std::{
    collections::HashMap,
    io::{self, Read},
    net::{Shutdown, TcpStream},
    sync::Arc,
    time::{Duration, Instant},
};

use super::{
    messages::{ClientboundPacket, PacketKind, ServerboundPacket},
    protocol::{Listener, PacketWriter, ProtocolClient, ProtocolError, SharedClientFactory},
    protocol_version::ProtocolVersion,
    utils::{self, FrameBuffer},
};
use crate::account::ServerTarget;

/// Default interval a poll waits for data before handing control back.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Default timeout for writing to the server.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(1);

const READ_CHUNK: usize = 8 * 1024;

struct StreamWriter<'a>(&'a mut TcpStream);

impl PacketWriter for StreamWriter<'_> {
    fn write_packet(&mut self, packet: &ServerboundPacket) -> Result<(), ProtocolError> {
        utils::write_prefixed(&mut *self.0, packet)?;
        Ok(())
    }
}

/// Blocking TCP implementation of [`ProtocolClient`].
pub struct TcpProtocolClient {
    stream: Option<TcpStream>,
    buffer: FrameBuffer,
    listeners: HashMap<PacketKind, Vec<Listener>>,
    poll_interval: Duration,
    version: ProtocolVersion,
}

impl TcpProtocolClient {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            stream: None,
            buffer: FrameBuffer::new(),
            listeners: HashMap::new(),
            poll_interval,
            version: ProtocolVersion::current(),
        }
    }

    /// Speak an older protocol version in the handshake.
    pub fn with_version(mut self, version: ProtocolVersion) -> Self {
        self.version = version;
        self
    }

    /// Factory producing a fresh client per connection attempt.
    pub fn factory(poll_interval: Duration) -> SharedClientFactory {
        Arc::new(move || -> Box<dyn ProtocolClient> { Box::new(Self::new(poll_interval)) })
    }

    /// Try each resolved address in turn; all of them share `deadline`.
    fn open_stream(target: &ServerTarget, deadline: Instant) -> Result<TcpStream, ProtocolError> {
        let addrs = target.resolve().map_err(|error| ProtocolError::Refused {
            target: target.to_string(),
            detail: error.to_string(),
        })?;

        let mut last_error = None;
        for addr in addrs {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ProtocolError::Timeout(format!("connecting to {target}")));
            }
            match TcpStream::connect_timeout(&addr, remaining) {
                Ok(stream) => return Ok(stream),
                Err(error) => last_error = Some(error),
            }
        }

        match last_error {
            Some(error)
                if matches!(
                    error.kind(),
                    io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
                ) =>
            {
                Err(ProtocolError::Timeout(format!("connecting to {target}")))
            }
            Some(error) => Err(ProtocolError::Refused {
                target: target.to_string(),
                detail: error.to_string(),
            }),
            None => Err(ProtocolError::Refused {
                target: target.to_string(),
                detail: "no addresses resolved".to_string(),
            }),
        }
    }

    /// Pull bytes until one login-phase packet is buffered or the deadline passes.
    fn recv_login_packet(
        stream: &mut TcpStream,
        buffer: &mut FrameBuffer,
        deadline: Instant,
    ) -> Result<ClientboundPacket, ProtocolError> {
        let mut chunk = [0; READ_CHUNK];
        loop {
            if let Some(packet) = buffer.next_frame::<ClientboundPacket>()? {
                return Ok(packet);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ProtocolError::Timeout("waiting for login".to_string()));
            }
            stream.set_read_timeout(Some(remaining))?;
            match stream.read(&mut chunk) {
                Ok(0) => {
                    return Err(ProtocolError::Violation(
                        "connection closed during login".to_string(),
                    ));
                }
                Ok(n) => buffer.push(&chunk[..n]),
                Err(error)
                    if matches!(
                        error.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                    ) =>
                {
                    return Err(ProtocolError::Timeout("waiting for login".to_string()));
                }
                Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
                Err(error) => return Err(error.into()),
            }
        }
    }

    /// Hand every buffered packet to its listeners.
    fn dispatch_buffered(&mut self) -> Result<bool, ProtocolError> {
        let Some(stream) = self.stream.as_mut() else {
            return Err(ProtocolError::NotConnected);
        };
        let mut dispatched = false;
        while let Some(packet) = self.buffer.next_frame::<ClientboundPacket>()? {
            dispatched = true;
            let kind = packet.kind();
            if let Some(listeners) = self.listeners.get_mut(&kind) {
                let mut writer = StreamWriter(&mut *stream);
                for listener in listeners.iter_mut() {
                    listener(&packet, &mut writer);
                }
            }
            if kind == PacketKind::Disconnect {
                // The server closes right after; anything still buffered is moot.
                let _ = stream.shutdown(Shutdown::Both);
                self.stream = None;
                self.buffer = FrameBuffer::new();
                break;
            }
        }
        Ok(dispatched)
    }
}

impl ProtocolClient for TcpProtocolClient {
    fn connect(
        &mut self,
        target: &ServerTarget,
        username: &str,
        online_mode: bool,
        timeout: Duration,
    ) -> Result<(), ProtocolError> {
        let deadline = Instant::now() + timeout;
        let mut stream = Self::open_stream(target, deadline)?;
        stream.set_nodelay(true)?;
        stream.set_write_timeout(Some(WRITE_TIMEOUT))?;

        utils::write_prefixed(
            &mut stream,
            &ServerboundPacket::Handshake {
                version: self.version,
                username: username.to_string(),
                online_mode,
            },
        )?;

        loop {
            match Self::recv_login_packet(&mut stream, &mut self.buffer, deadline)? {
                ClientboundPacket::LoginSuccess { .. } => break,
                ClientboundPacket::LoginRejected { reason }
                | ClientboundPacket::Disconnect { reason } => {
                    let _ = stream.shutdown(Shutdown::Both);
                    return Err(ProtocolError::Auth(reason));
                }
                ClientboundPacket::KeepAlive { id } => {
                    utils::write_prefixed(&mut stream, &ServerboundPacket::KeepAlive { id })?;
                }
                other => {
                    let _ = stream.shutdown(Shutdown::Both);
                    return Err(ProtocolError::Violation(format!(
                        "unexpected packet during login: {other}"
                    )));
                }
            }
        }

        stream.set_read_timeout(Some(self.poll_interval))?;
        self.stream = Some(stream);
        Ok(())
    }

    fn register_listener(&mut self, kind: PacketKind, listener: Listener) {
        self.listeners.entry(kind).or_default().push(listener);
    }

    fn write_packet(&mut self, packet: &ServerboundPacket) -> Result<(), ProtocolError> {
        let stream = self.stream.as_mut().ok_or(ProtocolError::NotConnected)?;
        utils::write_prefixed(stream, packet)?;
        Ok(())
    }

    fn poll(&mut self) -> Result<bool, ProtocolError> {
        // Packets that arrived together with the login reply.
        if self.dispatch_buffered()? {
            return Ok(true);
        }
        let stream = self.stream.as_mut().ok_or(ProtocolError::NotConnected)?;
        let mut chunk = [0; READ_CHUNK];
        match stream.read(&mut chunk) {
            Ok(0) => {
                self.stream = None;
                Err(ProtocolError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed by server",
                )))
            }
            Ok(n) => {
                self.buffer.push(&chunk[..n]);
                self.dispatch_buffered()
            }
            Err(error)
                if matches!(
                    error.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) =>
            {
                Ok(false)
            }
            Err(error) => {
                self.stream = None;
                Err(error.into())
            }
        }
    }

    fn disconnect(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = utils::write_prefixed(&mut stream, &ServerboundPacket::Disconnect);
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        net::TcpListener,
        sync::{Arc, Mutex},
        thread,
    };

    fn target_of(listener: &TcpListener) -> ServerTarget {
        listener.local_addr().unwrap().into()
    }

    /// Serve one connection with a scripted sequence of replies.
    fn scripted_server(
        replies: Vec<ClientboundPacket>,
    ) -> (ServerTarget, thread::JoinHandle<Vec<ServerboundPacket>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let target = target_of(&listener);
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut received =
                vec![utils::read_prefixed::<ServerboundPacket, _>(&mut stream).unwrap()];
            for reply in replies {
                utils::write_prefixed(&mut stream, &reply).unwrap();
            }
            stream
                .set_read_timeout(Some(Duration::from_millis(500)))
                .unwrap();
            while let Ok(packet) = utils::read_prefixed::<ServerboundPacket, _>(&mut stream) {
                received.push(packet);
            }
            received
        });
        (target, handle)
    }

    #[test]
    fn connect_refused_on_closed_port() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let target = target_of(&listener);
        drop(listener);

        let mut client = TcpProtocolClient::new(POLL_INTERVAL);
        let error = client
            .connect(&target, "bot", false, Duration::from_secs(2))
            .unwrap_err();
        assert_eq!(error.reason(), crate::errors::FailureReason::Refused);
        assert!(!client.is_connected());
    }

    #[test]
    fn connect_times_out_without_login_reply() {
        // Accepted by the kernel backlog but never answered.
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let target = target_of(&listener);

        let mut client = TcpProtocolClient::new(POLL_INTERVAL);
        let error = client
            .connect(&target, "bot", false, Duration::from_millis(300))
            .unwrap_err();
        assert_eq!(error.reason(), crate::errors::FailureReason::Timeout);
        drop(listener);
    }

    #[test]
    fn spent_budget_stops_before_dialing() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let target = target_of(&listener);

        let error = TcpProtocolClient::open_stream(&target, Instant::now()).unwrap_err();
        assert_eq!(error.reason(), crate::errors::FailureReason::Timeout);

        let mut client = TcpProtocolClient::new(POLL_INTERVAL);
        let error = client
            .connect(&target, "bot", false, Duration::ZERO)
            .unwrap_err();
        assert_eq!(error.reason(), crate::errors::FailureReason::Timeout);
        assert!(listener.set_nonblocking(true).is_ok());
        assert!(listener.accept().is_err());
    }

    #[test]
    fn login_rejected_is_auth_error() {
        let (target, server) = scripted_server(vec![ClientboundPacket::LoginRejected {
            reason: "You are banned".to_string(),
        }]);
        let mut client = TcpProtocolClient::new(POLL_INTERVAL);
        let error = client
            .connect(&target, "griefer", false, Duration::from_secs(2))
            .unwrap_err();
        assert_eq!(error.reason(), crate::errors::FailureReason::AuthError);
        let received = server.join().unwrap();
        assert!(matches!(
            &received[0],
            ServerboundPacket::Handshake { username, .. } if username == "griefer"
        ));
    }

    #[test]
    fn listeners_see_packets_after_login() {
        let (target, server) = scripted_server(vec![
            ClientboundPacket::LoginSuccess {
                uuid: "0".to_string(),
                username: "bot".to_string(),
            },
            ClientboundPacket::JoinGame {
                entity_id: 1,
                dimension: "minecraft:overworld".to_string(),
            },
            ClientboundPacket::KeepAlive { id: 41 },
        ]);

        let mut client = TcpProtocolClient::new(POLL_INTERVAL);
        client
            .connect(&target, "bot", false, Duration::from_secs(2))
            .unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let joined = seen.clone();
        client.register_listener(
            PacketKind::JoinGame,
            Box::new(move |packet, _| joined.lock().unwrap().push(packet.clone())),
        );
        client.register_listener(
            PacketKind::KeepAlive,
            Box::new(|packet, writer| {
                if let ClientboundPacket::KeepAlive { id } = packet {
                    writer
                        .write_packet(&ServerboundPacket::KeepAlive { id: *id })
                        .unwrap();
                }
            }),
        );

        let deadline = Instant::now() + Duration::from_secs(2);
        while seen.lock().unwrap().is_empty() && Instant::now() < deadline {
            client.poll().unwrap();
        }
        // Give the keepalive a chance to be dispatched too.
        for _ in 0..3 {
            client.poll().unwrap();
        }
        client.disconnect();
        assert!(!client.is_connected());

        assert_eq!(seen.lock().unwrap().len(), 1);
        let received = server.join().unwrap();
        assert!(received.contains(&ServerboundPacket::KeepAlive { id: 41 }));
        assert!(received.contains(&ServerboundPacket::Disconnect));
    }

    #[test]
    fn write_without_connection_fails() {
        let mut client = TcpProtocolClient::new(POLL_INTERVAL);
        assert!(matches!(
            client.write_packet(&ServerboundPacket::Disconnect),
            Err(ProtocolError::NotConnected)
        ));
    }
}

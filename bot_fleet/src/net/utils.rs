use bincode::{config, serde::decode_from_slice, serde::encode_to_vec};
use serde::{Serialize, de::DeserializeOwned};
use std::io::{self, Read, Write};

use super::errors::{Result, SerializationError};

/// Maximum allowed frame size (1MB) to prevent unbounded allocation
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Encode `value` into a length-prefixed frame.
pub fn encode_frame<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let payload = encode_to_vec(value, config::standard())?;
    if payload.len() > MAX_MESSAGE_SIZE {
        return Err(SerializationError::MessageTooLarge {
            actual: payload.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }
    let size = payload.len() as u32;
    let mut buf = Vec::with_capacity(4 + payload.len());
    buf.extend(size.to_le_bytes());
    buf.extend(payload);
    Ok(buf)
}

/// Decode a frame payload (without its length prefix).
pub fn decode_payload<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    let (value, read) = decode_from_slice(payload, config::standard())?;
    if read != payload.len() {
        return Err(SerializationError::InvalidFormat(format!(
            "{} trailing bytes after payload",
            payload.len() - read
        )));
    }
    Ok(value)
}

/// Accumulates bytes from a stream and yields complete frames.
///
/// Used wherever reads can stop mid-frame (read timeouts, non-blocking
/// sockets) so a partial frame is kept until the rest arrives.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Pop the next complete frame, if one is buffered.
    pub fn next_frame<T: DeserializeOwned>(&mut self) -> io::Result<Option<T>> {
        if self.buf.len() < 4 {
            return Ok(None);
        }
        let mut len_bytes = [0; 4];
        len_bytes.copy_from_slice(&self.buf[..4]);
        let len = u32::from_le_bytes(len_bytes) as usize;
        if len > MAX_MESSAGE_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame size {len} exceeds maximum allowed size of {MAX_MESSAGE_SIZE} bytes"),
            ));
        }
        if self.buf.len() < 4 + len {
            return Ok(None);
        }
        let frame: Vec<u8> = self.buf.drain(..4 + len).skip(4).collect();
        Ok(Some(decode_payload(&frame)?))
    }
}

pub fn read_prefixed<T: DeserializeOwned, R: Read>(reader: &mut R) -> io::Result<T> {
    let mut len_bytes = [0; 4];
    reader.read_exact(&mut len_bytes)?;
    let len = u32::from_le_bytes(len_bytes) as usize;

    if len > MAX_MESSAGE_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame size {len} exceeds maximum allowed size of {MAX_MESSAGE_SIZE} bytes"),
        ));
    }

    // A would block error after the prefix means the sender doesn't follow
    // the prefix protocol, so surface it as invalid data.
    let mut buf = vec![0; len];
    if let Err(error) = reader.read_exact(&mut buf) {
        let kind = match error.kind() {
            io::ErrorKind::WouldBlock => io::ErrorKind::InvalidData,
            kind => kind,
        };
        return Err(kind.into());
    }

    Ok(decode_payload(&buf)?)
}

pub fn write_prefixed<T: Serialize, W: Write>(writer: &mut W, value: &T) -> io::Result<()> {
    // Size and payload go out in one chunk to avoid read-side EOF races.
    let buf = encode_frame(value)?;
    writer.write_all(&buf)?;
    writer.flush()
}

#[cfg(test)]
mod tests {
    use std::io::{self, Write};
    use std::net::{TcpListener, TcpStream};

    use super::{FrameBuffer, MAX_MESSAGE_SIZE, encode_frame, read_prefixed, write_prefixed};
    use crate::net::messages::{ClientboundPacket, ServerboundPacket};

    fn setup() -> (TcpStream, TcpStream) {
        let server = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = server.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (stream, _) = server.accept().unwrap();
        (client, stream)
    }

    #[test]
    fn write_and_read() {
        let (mut client, mut stream) = setup();
        let value = "Hello, World!".to_string();
        assert!(write_prefixed(&mut stream, &value).is_ok());
        assert!(read_prefixed::<String, TcpStream>(&mut client).is_ok_and(|v| v == value));
    }

    #[test]
    fn truncated_payload_is_unexpected_eof() {
        let (mut client, mut stream) = setup();
        assert!(stream.write_all(&8u32.to_le_bytes()).is_ok());
        assert!(stream.write_all(&[1, 2, 3]).is_ok());
        drop(stream);
        assert_eq!(
            read_prefixed::<String, TcpStream>(&mut client).map_err(|e| e.kind()),
            Err(io::ErrorKind::UnexpectedEof)
        );
    }

    #[test]
    fn garbage_payload_is_invalid_data() {
        let (mut client, mut stream) = setup();
        // Variant index far outside the packet enum.
        assert!(stream.write_all(&1u32.to_le_bytes()).is_ok());
        assert!(stream.write_all(&[200]).is_ok());
        assert_eq!(
            read_prefixed::<ClientboundPacket, TcpStream>(&mut client).map_err(|e| e.kind()),
            Err(io::ErrorKind::InvalidData)
        );
    }

    #[test]
    fn reject_oversized_frame() {
        let (mut client, mut stream) = setup();
        let malicious_size = 2_000_000_000u32;
        assert!(stream.write_all(&malicious_size.to_le_bytes()).is_ok());
        assert_eq!(
            read_prefixed::<String, TcpStream>(&mut client).map_err(|e| e.kind()),
            Err(io::ErrorKind::InvalidData)
        );
    }

    #[test]
    fn refuse_to_encode_oversized_value() {
        let huge = "x".repeat(MAX_MESSAGE_SIZE + 1);
        assert!(encode_frame(&huge).is_err());
    }

    #[test]
    fn read_prefixed_with_partial_length() {
        let (mut client, mut stream) = setup();
        assert!(stream.write_all(&[0, 0]).is_ok());
        drop(stream);
        assert_eq!(
            read_prefixed::<String, TcpStream>(&mut client).map_err(|e| e.kind()),
            Err(io::ErrorKind::UnexpectedEof)
        );
    }

    #[test]
    fn frame_buffer_waits_for_complete_frames() {
        let frame = encode_frame(&ServerboundPacket::KeepAlive { id: 99 }).unwrap();
        let mut buffer = FrameBuffer::new();
        buffer.push(&frame[..3]);
        assert!(buffer.next_frame::<ServerboundPacket>().unwrap().is_none());
        buffer.push(&frame[3..]);
        buffer.push(&frame[..2]);
        assert_eq!(
            buffer.next_frame::<ServerboundPacket>().unwrap(),
            Some(ServerboundPacket::KeepAlive { id: 99 })
        );
        assert!(buffer.next_frame::<ServerboundPacket>().unwrap().is_none());
        assert!(!buffer.is_empty());
    }

    #[test]
    fn frame_buffer_rejects_oversized_prefix() {
        let mut buffer = FrameBuffer::new();
        buffer.push(&u32::MAX.to_le_bytes());
        assert_eq!(
            buffer
                .next_frame::<ServerboundPacket>()
                .map_err(|e| e.kind()),
            Err(io::ErrorKind::InvalidData)
        );
    }

    #[test]
    fn packets_arrive_in_order() {
        let (mut client, mut stream) = setup();
        let packets = vec![
            ServerboundPacket::KeepAlive { id: 7 },
            ServerboundPacket::Chat {
                message: "hello".to_string(),
            },
            ServerboundPacket::Disconnect,
        ];
        for packet in &packets {
            write_prefixed(&mut client, packet).unwrap();
        }
        for packet in &packets {
            let received: ServerboundPacket = read_prefixed(&mut stream).unwrap();
            assert_eq!(&received, packet);
        }
    }
}

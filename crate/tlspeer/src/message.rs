//! Length-prefixed message framing.
//!
//! Each message is a 2-byte unsigned big-endian length followed by
//! exactly that many payload bytes. There's no checksum or padding;
//! integrity is left to the TLS layer underneath.
//!
//! After any error the stream should be considered unusable, as there
//! is no way to find the next message boundary again.

use crate::error::{RecvError, SendError};
use std::io::{self, Read, Write};

/// Largest payload a message may carry, in bytes.
pub const MAX_MSG_SIZE: usize = 16384;

const HEADER_LEN: usize = 2;

/// One message of the wire protocol.
#[derive(Clone, PartialEq, Eq)]
pub struct Message {
    body: Vec<u8>,
}

impl Message {
    pub fn new(body: Vec<u8>) -> Self {
        Self { body }
    }

    /// Payload length, in bytes.
    pub fn size(&self) -> usize {
        self.body.len()
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn into_body(self) -> Vec<u8> {
        self.body
    }
}

impl From<Vec<u8>> for Message {
    fn from(body: Vec<u8>) -> Self {
        Self::new(body)
    }
}

impl From<&[u8]> for Message {
    fn from(body: &[u8]) -> Self {
        Self::new(body.to_vec())
    }
}

// Payloads may be key material; don't dump them into logs.
impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("size", &self.body.len())
            .finish_non_exhaustive()
    }
}

/// Write one message to `transport`.
///
/// Messages that are empty or larger than [MAX_MSG_SIZE] are rejected
/// before anything is written.
pub fn send<W: Write + ?Sized>(transport: &mut W, message: &Message) -> Result<(), SendError> {
    let size = message.size();
    if size == 0 || size > MAX_MSG_SIZE {
        log::error!("invalid TLS message size: {size}");
        return Err(SendError::InvalidSize(size));
    }
    let header = (size as u16).to_be_bytes();

    write_full(transport, &header).inspect_err(|err| {
        log::error!("sending TLS message header failed: {err}");
    })?;
    write_full(transport, message.body()).inspect_err(|err| {
        log::error!("sending TLS message payload failed: {err}");
    })?;
    transport.flush().map_err(|err| {
        log::error!("sending TLS message payload failed: {err}");
        SendError::from_io(err)
    })?;

    Ok(())
}

/// Read one message from `transport`.
///
/// The declared length is checked against [MAX_MSG_SIZE] before any
/// buffer is allocated for the body.
pub fn receive<R: Read + ?Sized>(transport: &mut R) -> Result<Message, RecvError> {
    let mut header = [0u8; HEADER_LEN];
    read_full(transport, &mut header).inspect_err(|err| {
        log::error!("reading TLS message header failed: {err}");
    })?;

    let declared = u16::from_be_bytes(header);
    let size = declared as usize;
    if size == 0 || size > MAX_MSG_SIZE {
        log::error!("length in TLS message header is invalid: {declared}");
        return Err(RecvError::InvalidSize(declared));
    }

    let mut body = vec![0u8; size];
    read_full(transport, &mut body).inspect_err(|err| {
        log::error!("reading TLS message body failed: {err}");
    })?;

    Ok(Message::new(body))
}

fn write_full<W: Write + ?Sized>(transport: &mut W, buf: &[u8]) -> Result<(), SendError> {
    let mut written = 0;
    while written < buf.len() {
        match transport.write(&buf[written..]) {
            Ok(0) => {
                return Err(SendError::ShortWrite {
                    expected: buf.len(),
                    written,
                });
            }
            Ok(n) => written += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(SendError::from_io(err)),
        }
    }

    Ok(())
}

/// Fill `buf`, looping over short reads.
///
/// End of stream before the first byte means the peer closed the
/// connection; end of stream later is a truncated message.
fn read_full<R: Read + ?Sized>(transport: &mut R, buf: &mut [u8]) -> Result<(), RecvError> {
    let mut read = 0;
    while read < buf.len() {
        match transport.read(&mut buf[read..]) {
            Ok(0) if read == 0 => return Err(RecvError::ConnectionClosed),
            Ok(0) => {
                return Err(RecvError::ShortRead {
                    expected: buf.len(),
                    read,
                });
            }
            Ok(n) => read += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) if is_closed(&err) && read == 0 => return Err(RecvError::ConnectionClosed),
            Err(err) if is_closed(&err) => {
                return Err(RecvError::ShortRead {
                    expected: buf.len(),
                    read,
                });
            }
            Err(err) => return Err(RecvError::Io(err)),
        }
    }

    Ok(())
}

/// Errors through which a closed or reset connection shows up.
///
/// rustls reports a peer that closed without close_notify as
/// [io::ErrorKind::UnexpectedEof].
fn is_closed(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
    )
}

impl SendError {
    fn from_io(err: io::Error) -> Self {
        if is_closed(&err) {
            SendError::ConnectionClosed
        } else {
            SendError::Io(err)
        }
    }
}

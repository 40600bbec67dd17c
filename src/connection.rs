// ABOUTME: Buffered TCP transport for SMPP sessions with frame-based IO
// ABOUTME: Accumulates bytes until a whole PDU is available, then parses it

use crate::codec::{CodecError, Frame};
use bytes::{Buf, BytesMut};
use std::io::{self, Cursor};
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::{TcpSocket, TcpStream};

/// One SMPP session transport.
///
/// Handles frame-based communication over TCP. The session state
/// machine (open → bound → unbound) is the driver's business; this type
/// only moves complete PDUs in and out.
#[derive(Debug)]
pub struct Connection {
    stream: BufWriter<TcpStream>,
    buffer: BytesMut,
}

impl Connection {
    pub fn new(socket: TcpStream) -> Connection {
        Connection {
            stream: BufWriter::new(socket),
            buffer: BytesMut::with_capacity(4 * 1024),
        }
    }

    /// Connect to `host:port`, optionally binding the local side to
    /// `our_host` first (multi-homed gateway hosts route per SMSC).
    pub async fn open(host: &str, port: u16, our_host: Option<&str>) -> io::Result<Connection> {
        let stream = match our_host {
            None => TcpStream::connect((host, port)).await?,
            Some(local) => {
                let local_addr: SocketAddr = format!("{local}:0")
                    .parse()
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
                let socket = if local_addr.is_ipv4() {
                    TcpSocket::new_v4()?
                } else {
                    TcpSocket::new_v6()?
                };
                socket.bind(local_addr)?;
                let remote: SocketAddr = tokio::net::lookup_host((host, port))
                    .await?
                    .next()
                    .ok_or_else(|| {
                        io::Error::new(io::ErrorKind::NotFound, "host resolved to no address")
                    })?;
                socket.connect(remote).await?
            }
        };
        Ok(Connection::new(stream))
    }

    /// Read a single frame from the stream.
    ///
    /// Waits until enough data for a whole PDU has been buffered. A
    /// clean EOF between frames returns `Ok(None)`; EOF in the middle
    /// of a frame is an error.
    pub async fn read_frame(&mut self) -> Result<Option<Frame>, CodecError> {
        loop {
            if let Some(frame) = self.parse_frame()? {
                return Ok(Some(frame));
            }

            if 0 == self.stream.read_buf(&mut self.buffer).await? {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                return Err(CodecError::Io(io::Error::new(
                    io::ErrorKind::ConnectionReset,
                    "connection reset by peer mid-frame",
                )));
            }
        }
    }

    /// Try to parse a frame out of the accumulated buffer. `Ok(None)`
    /// means more data is needed.
    fn parse_frame(&mut self) -> Result<Option<Frame>, CodecError> {
        let mut cursor = Cursor::new(&self.buffer[..]);
        match Frame::check(&mut cursor) {
            Ok(()) => {
                let len = u32::from_be_bytes([
                    self.buffer[0],
                    self.buffer[1],
                    self.buffer[2],
                    self.buffer[3],
                ]) as usize;
                cursor.set_position(0);
                let frame = Frame::parse(&mut cursor)?;
                self.buffer.advance(len);
                Ok(Some(frame))
            }
            Err(CodecError::Incomplete) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Write a single frame and flush it out.
    pub async fn write_frame(&mut self, frame: &Frame) -> Result<(), CodecError> {
        let bytes = frame.to_bytes()?;
        self.stream.write_all(&bytes).await?;
        self.stream.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdu;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn frame_exchange_over_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut conn = Connection::new(socket);
            let frame = conn.read_frame().await.unwrap().unwrap();
            assert_eq!(frame.sequence_number(), 3);
            conn.write_frame(&Frame::EnquireLinkResp(pdu::EnquireLinkResp::new(3)))
                .await
                .unwrap();
        });

        let mut client = Connection::open(&addr.ip().to_string(), addr.port(), None)
            .await
            .unwrap();
        client
            .write_frame(&Frame::EnquireLink(pdu::EnquireLink::new(3)))
            .await
            .unwrap();
        match client.read_frame().await.unwrap().unwrap() {
            Frame::EnquireLinkResp(resp) => assert_eq!(resp.sequence_number, 3),
            other => panic!("unexpected frame {other:?}"),
        }
        server.await.unwrap();
    }

    #[tokio::test]
    async fn clean_eof_yields_none() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            drop(socket);
        });
        let mut client = Connection::open(&addr.ip().to_string(), addr.port(), None)
            .await
            .unwrap();
        assert!(client.read_frame().await.unwrap().is_none());
        server.await.unwrap();
    }
}

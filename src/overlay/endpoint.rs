//! `OverlayEndpoint`: the per-session handle a forwarder engine bridges to
//! a local socket. Exposes a reliable byte-stream view and an unreliable
//! datagram view over two independently-opened libp2p streams that share
//! the same underlying (noise+yamux) connection.
//!
//! An engine picks exactly one view and must not touch the other (§9 of the
//! design notes: crossing the stream and datagram views is a latent bug), so
//! the two fields are `pub(crate)` and accessed only through the narrow
//! `byte_stream()`/`datagram()` accessors.

use std::io;

use libp2p::Stream;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

use crate::keys::SubPublicKey;

/// Length-prefix framing used on the datagram view so that
/// `send`/`on_message` boundaries survive being carried over a
/// byte-oriented muxed substream.
const MAX_DATAGRAM_LEN: u32 = 64 * 1024;

pub struct OverlayEndpoint {
    pub(crate) peer_sub_key: SubPublicKey,
    pub(crate) byte_stream: Option<Stream>,
    pub(crate) datagram_stream: Option<Stream>,
}

impl OverlayEndpoint {
    pub fn peer_sub_key(&self) -> &SubPublicKey {
        &self.peer_sub_key
    }

    /// Take ownership of the reliable byte-stream view. Panics if the
    /// endpoint was opened without one (programmer error: an engine must
    /// know ahead of time which view it uses).
    pub fn byte_stream(&mut self) -> &mut Stream {
        self.byte_stream
            .as_mut()
            .expect("engine requested byte_stream on a datagram-only endpoint")
    }

    pub fn into_byte_stream(mut self) -> Stream {
        self.byte_stream
            .take()
            .expect("engine requested byte_stream on a datagram-only endpoint")
    }

    pub fn into_datagram(mut self) -> DatagramChannel {
        let stream = self
            .datagram_stream
            .take()
            .expect("engine requested datagram view on a stream-only endpoint");
        DatagramChannel {
            stream,
            recv_buf: Vec::new(),
        }
    }

    /// Half-close the byte-stream view, if present.
    pub async fn end(&mut self) -> io::Result<()> {
        if let Some(stream) = self.byte_stream.as_mut() {
            stream.shutdown().await?;
        }
        Ok(())
    }
}

/// The unreliable-datagram view of an `OverlayEndpoint`. Each `send` maps to
/// exactly one `on_message`-shaped read on the remote side; delivery is
/// best-effort only insofar as a failed write drops the datagram instead of
/// retrying it (in-flight user bytes are never retried, per the bridging
/// discipline).
///
/// `recv` is selected against other branches in every engine that uses it, so
/// it must be cancellation-safe: it cannot lose bytes if dropped mid-frame.
/// `read_exact` does not have that property (a cancelled `read_exact` forgets
/// how many of its bytes already landed), so `recv` instead accumulates raw
/// `read()`s, each a single, cancellation-safe poll, into a buffer and only
/// consumes a complete frame once one is fully buffered.
pub struct DatagramChannel {
    stream: Stream,
    recv_buf: Vec<u8>,
}

const RECV_CHUNK: usize = 16 * 1024;

impl DatagramChannel {
    pub async fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
        send_frame(&mut self.stream, bytes).await
    }

    /// Read the next framed datagram, or `Ok(None)` on clean EOF between
    /// frames. See the struct docs: safe to drop and re-call mid-frame.
    pub async fn recv(&mut self) -> io::Result<Option<Vec<u8>>> {
        recv_frame(&mut self.stream, &mut self.recv_buf).await
    }

    /// Split into independent send/receive halves so the two directions of a
    /// session can be driven from separate tasks without a shared lock held
    /// across an await (holding such a lock across `recv`'s wait for the next
    /// frame would starve the other direction indefinitely).
    pub fn split(self) -> (DatagramSender, DatagramReceiver) {
        let (read, write) = tokio::io::split(self.stream);
        (
            DatagramSender { write },
            DatagramReceiver {
                read,
                recv_buf: self.recv_buf,
            },
        )
    }
}

/// The send half of a [`DatagramChannel`] after [`DatagramChannel::split`].
pub struct DatagramSender {
    write: WriteHalf<Stream>,
}

impl DatagramSender {
    pub async fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
        send_frame(&mut self.write, bytes).await
    }
}

/// The receive half of a [`DatagramChannel`] after [`DatagramChannel::split`].
pub struct DatagramReceiver {
    read: ReadHalf<Stream>,
    recv_buf: Vec<u8>,
}

impl DatagramReceiver {
    pub async fn recv(&mut self) -> io::Result<Option<Vec<u8>>> {
        recv_frame(&mut self.read, &mut self.recv_buf).await
    }
}

async fn send_frame<W: AsyncWrite + Unpin>(writer: &mut W, bytes: &[u8]) -> io::Result<()> {
    if bytes.len() as u64 > MAX_DATAGRAM_LEN as u64 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "datagram exceeds MAX_DATAGRAM_LEN",
        ));
    }
    let len = bytes.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(bytes).await?;
    writer.flush().await
}

async fn recv_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    recv_buf: &mut Vec<u8>,
) -> io::Result<Option<Vec<u8>>> {
    loop {
        if let Some(frame) = take_buffered_frame(recv_buf)? {
            return Ok(Some(frame));
        }
        let mut chunk = [0u8; RECV_CHUNK];
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            if recv_buf.is_empty() {
                return Ok(None);
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "peer closed mid-frame",
            ));
        }
        recv_buf.extend_from_slice(&chunk[..n]);
    }
}

/// Extract one complete length-prefixed frame from `recv_buf` if enough bytes
/// have accumulated, draining only the consumed prefix.
fn take_buffered_frame(recv_buf: &mut Vec<u8>) -> io::Result<Option<Vec<u8>>> {
    if recv_buf.len() < 4 {
        return Ok(None);
    }
    let len = u32::from_be_bytes(recv_buf[..4].try_into().expect("checked length"));
    if len > MAX_DATAGRAM_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "peer announced an oversized datagram",
        ));
    }
    let total = 4 + len as usize;
    if recv_buf.len() < total {
        return Ok(None);
    }
    let frame = recv_buf[4..total].to_vec();
    recv_buf.drain(..total);
    Ok(Some(frame))
}

/// Writes the 32-byte sub-public-key routing header that precedes every
/// newly opened stream, so the accepting side can route the stream to the
/// correct registered listener without a separate handshake protocol.
pub(crate) async fn write_routing_header(
    stream: &mut Stream,
    target: &SubPublicKey,
) -> io::Result<()> {
    stream.write_all(&target.to_bytes()).await?;
    stream.flush().await
}

pub(crate) async fn read_routing_header(stream: &mut Stream) -> io::Result<[u8; 32]> {
    let mut buf = [0u8; 32];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_round_trips_through_a_duplex_pipe() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        send_frame(&mut a, b"hello").await.unwrap();
        let mut recv_buf = Vec::new();
        let frame = recv_frame(&mut b, &mut recv_buf).await.unwrap();
        assert_eq!(frame, Some(b"hello".to_vec()));
    }

    #[tokio::test]
    async fn multiple_frames_are_parsed_in_order_from_one_read() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        send_frame(&mut a, b"first").await.unwrap();
        send_frame(&mut a, b"second").await.unwrap();

        let mut recv_buf = Vec::new();
        let first = recv_frame(&mut b, &mut recv_buf).await.unwrap();
        let second = recv_frame(&mut b, &mut recv_buf).await.unwrap();
        assert_eq!(first, Some(b"first".to_vec()));
        assert_eq!(second, Some(b"second".to_vec()));
    }

    #[tokio::test]
    async fn recv_frame_is_cancellation_safe_across_a_partial_length_prefix() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let mut recv_buf = Vec::new();

        // Write only the 4-byte length prefix, no body yet, and cancel a
        // `recv_frame` call parked waiting on it: a non-cancellation-safe
        // implementation (two `read_exact`s) would consume those 4 bytes and
        // then lose them when dropped.
        a.write_all(&3u32.to_be_bytes()).await.unwrap();
        {
            let recv = recv_frame(&mut b, &mut recv_buf);
            tokio::select! {
                _ = recv => panic!("recv_frame should not resolve before the body arrives"),
                _ = tokio::time::sleep(std::time::Duration::from_millis(20)) => {}
            }
        }

        // The prefix survives the cancellation; once the body lands, the
        // frame is parsed whole and nothing is misaligned.
        a.write_all(b"abc").await.unwrap();
        let frame = recv_frame(&mut b, &mut recv_buf).await.unwrap();
        assert_eq!(frame, Some(b"abc".to_vec()));
    }

    #[tokio::test]
    async fn recv_frame_returns_none_on_clean_eof_between_frames() {
        let (a, mut b) = tokio::io::duplex(4096);
        drop(a);
        let mut recv_buf = Vec::new();
        let frame = recv_frame(&mut b, &mut recv_buf).await.unwrap();
        assert_eq!(frame, None);
    }

    #[tokio::test]
    async fn recv_frame_errors_on_eof_mid_frame() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        a.write_all(&10u32.to_be_bytes()).await.unwrap();
        a.write_all(b"short").await.unwrap();
        drop(a);

        let mut recv_buf = Vec::new();
        let err = recv_frame(&mut b, &mut recv_buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn send_frame_rejects_an_oversized_datagram() {
        let (mut a, _b) = tokio::io::duplex(4096);
        let oversized = vec![0u8; MAX_DATAGRAM_LEN as usize + 1];
        let err = send_frame(&mut a, &oversized).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}

//! Wire framing: `[len: u32 big-endian][payload: len bytes]`.
//!
//! Read and write are free functions rather than methods on the channel
//! types so the timeout bookkeeping (recoverable before the header, fatal
//! after) stays in one place regardless of which channel calls it.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time;

use crate::error::{is_broken_pipe, Error, Result};

const HEADER_LEN: usize = 4;

/// Reads one length-prefixed frame.
///
/// `timeout` bounds the header read only: if no header byte has arrived by
/// the deadline, `Error::Timeout` is returned and the caller may retry. Once
/// at least one header byte has been read, running out of time (or hitting
/// a clean EOF) is `Error::Truncated` — the channel must be marked broken.
/// A clean EOF before any header byte is `Error::PeerClosed`, which is not
/// fatal in the same sense: the channel is simply done.
pub async fn read_frame<R>(reader: &mut R, max_frame_size: u32, timeout: Option<Duration>) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    let mut read = 0usize;
    while read < HEADER_LEN {
        let fut = reader.read(&mut header[read..]);
        let n = match timeout {
            Some(d) => match time::timeout(d, fut).await {
                Ok(res) => res?,
                Err(_elapsed) => {
                    return if read == 0 {
                        Err(Error::Timeout)
                    } else {
                        Err(Error::Truncated)
                    }
                }
            },
            None => fut.await?,
        };
        if n == 0 {
            return if read == 0 {
                Err(Error::PeerClosed)
            } else {
                Err(Error::Truncated)
            };
        }
        read += n;
    }

    let len = u32::from_be_bytes(header);
    if len > max_frame_size {
        return Err(Error::FrameTooLarge(len, max_frame_size));
    }

    let mut body = vec![0u8; len as usize];
    if len > 0 {
        let fut = reader.read_exact(&mut body);
        let result = match timeout {
            Some(d) => match time::timeout(d, fut).await {
                Ok(res) => res,
                Err(_elapsed) => return Err(Error::Truncated),
            },
            None => fut.await,
        };
        match result {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(Error::Truncated)
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(body)
}

/// Writes one length-prefixed frame and flushes it.
///
/// Header and payload are assembled into a single buffer before the first
/// `write_all`, so no frame is ever partially on the wire without also being
/// fully buffered locally — concurrent callers still need to serialize via a
/// lock of their own, since this function does not hold one.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8], max_frame_size: u32) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let len = payload.len() as u32;
    if len > max_frame_size {
        return Err(Error::FrameTooLarge(len, max_frame_size));
    }

    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(payload);

    match writer.write_all(&buf).await {
        Ok(()) => {}
        Err(e) if is_broken_pipe(&e) => return Err(Error::ConnectionBroken),
        Err(e) => return Err(e.into()),
    }
    match writer.flush().await {
        Ok(()) => Ok(()),
        Err(e) if is_broken_pipe(&e) => Err(Error::ConnectionBroken),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn round_trips_a_frame() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"hello", 1024).await.unwrap();
        assert_eq!(&buf[..4], &5u32.to_be_bytes());
        assert_eq!(&buf[4..], b"hello");

        let mut cursor = Cursor::new(buf);
        let frame = read_frame(&mut cursor, 1024, None).await.unwrap();
        assert_eq!(frame, b"hello");
    }

    #[tokio::test]
    async fn empty_frame_is_allowed() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"", 1024).await.unwrap();
        let mut cursor = Cursor::new(buf);
        let frame = read_frame(&mut cursor, 1024, None).await.unwrap();
        assert_eq!(frame, Vec::<u8>::new());
    }

    #[tokio::test]
    async fn oversized_header_is_rejected_before_allocating() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&100u32.to_be_bytes());
        let mut cursor = Cursor::new(buf);
        let err = read_frame(&mut cursor, 10, None).await.unwrap_err();
        assert!(matches!(err, Error::FrameTooLarge(100, 10)));
    }

    #[tokio::test]
    async fn clean_eof_before_header_is_peer_closed() {
        let mut cursor = Cursor::new(Vec::<u8>::new());
        let err = read_frame(&mut cursor, 1024, None).await.unwrap_err();
        assert!(matches!(err, Error::PeerClosed));
    }

    #[tokio::test]
    async fn short_body_after_header_is_truncated() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&10u32.to_be_bytes());
        buf.extend_from_slice(b"abc");
        let mut cursor = Cursor::new(buf);
        let err = read_frame(&mut cursor, 1024, None).await.unwrap_err();
        assert!(matches!(err, Error::Truncated));
    }

    #[tokio::test]
    async fn timeout_before_header_is_recoverable() {
        let (mut _client, mut server) = tokio::io::duplex(64);
        let err = read_frame(&mut server, 1024, Some(Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout));
    }

    #[tokio::test]
    async fn timeout_mid_body_is_truncated() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&10u32.to_be_bytes()).await.unwrap();
        client.write_all(b"abc").await.unwrap();
        let err = read_frame(&mut server, 1024, Some(Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Truncated));
    }
}

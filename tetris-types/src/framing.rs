//! Length-prefixed JSON framing shared by every link in the system.
//!
//! A frame is a 4-byte big-endian length N followed by exactly N bytes of a
//! JSON object. N must be in (0, 1 MiB]; an oversize declaration fails before
//! any body bytes are consumed so the caller can close the connection without
//! draining it.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::errors::ErrorKind;

pub const MAX_FRAME_LEN: usize = 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("frame read timed out")]
    Timeout,
    #[error("connection closed")]
    ConnectionClosed,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl FrameError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FrameError::Malformed(_) => ErrorKind::MalformedFrame,
            FrameError::Timeout => ErrorKind::Timeout,
            FrameError::ConnectionClosed | FrameError::Io(_) => ErrorKind::MalformedFrame,
        }
    }

    pub fn is_disconnect(&self) -> bool {
        matches!(self, FrameError::ConnectionClosed)
    }
}

/// Serialize `message` and write it as one frame.
pub async fn write_frame<S, T>(stream: &mut S, message: &T) -> Result<(), FrameError>
where
    S: AsyncWrite + Unpin,
    T: Serialize + ?Sized,
{
    let body = serde_json::to_vec(message).map_err(|e| FrameError::Malformed(e.to_string()))?;
    if body.len() > MAX_FRAME_LEN {
        return Err(FrameError::Malformed(format!(
            "frame of {} bytes exceeds the {} byte limit",
            body.len(),
            MAX_FRAME_LEN
        )));
    }
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    stream.write_all(&frame).await?;
    stream.flush().await?;
    Ok(())
}

/// Read exactly one frame and decode it as `T`. The payload must be a JSON
/// object; anything else is `Malformed`. EOF at a frame boundary is reported
/// as `ConnectionClosed` so callers can tell a clean hangup from a torn frame.
pub async fn read_frame<S, T>(stream: &mut S) -> Result<T, FrameError>
where
    S: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let len = match stream.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(FrameError::ConnectionClosed);
        }
        Err(e) => return Err(e.into()),
    };
    if len == 0 || len > MAX_FRAME_LEN {
        return Err(FrameError::Malformed(format!(
            "declared length {len} outside (0, {MAX_FRAME_LEN}]"
        )));
    }
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;

    let value: serde_json::Value =
        serde_json::from_slice(&body).map_err(|e| FrameError::Malformed(e.to_string()))?;
    if !value.is_object() {
        return Err(FrameError::Malformed(
            "payload is not a JSON object".to_string(),
        ));
    }
    serde_json::from_value(value).map_err(|e| FrameError::Malformed(e.to_string()))
}

/// `read_frame` with a per-read deadline.
pub async fn read_frame_timeout<S, T>(stream: &mut S, deadline: Duration) -> Result<T, FrameError>
where
    S: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    match tokio::time::timeout(deadline, read_frame(stream)).await {
        Ok(result) => result,
        Err(_) => Err(FrameError::Timeout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[tokio::test]
    async fn frames_round_trip_in_sequence() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let messages = vec![
            json!({ "action": "login", "data": { "email": "alice@x" } }),
            json!({ "status": "success", "message": "ok", "data": {} }),
            json!({ "type": "INPUT", "seq": 1 }),
        ];
        for msg in &messages {
            write_frame(&mut a, msg).await.unwrap();
        }
        for msg in &messages {
            let decoded: Value = read_frame(&mut b).await.unwrap();
            assert_eq!(&decoded, msg);
        }
    }

    #[tokio::test]
    async fn oversize_length_rejected_without_consuming_body() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let mut bytes = ((MAX_FRAME_LEN + 1) as u32).to_be_bytes().to_vec();
        // A valid frame follows the bogus header untouched.
        bytes.extend_from_slice(&2u32.to_be_bytes());
        bytes.extend_from_slice(b"{}");
        tokio::io::AsyncWriteExt::write_all(&mut a, &bytes)
            .await
            .unwrap();

        let err = read_frame::<_, Value>(&mut b).await.unwrap_err();
        assert!(matches!(err, FrameError::Malformed(_)));

        // The header was the only thing consumed.
        let next: Value = read_frame(&mut b).await.unwrap();
        assert_eq!(next, json!({}));
    }

    #[tokio::test]
    async fn zero_length_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        tokio::io::AsyncWriteExt::write_all(&mut a, &0u32.to_be_bytes())
            .await
            .unwrap();
        let err = read_frame::<_, Value>(&mut b).await.unwrap_err();
        assert!(matches!(err, FrameError::Malformed(_)));
    }

    #[tokio::test]
    async fn non_object_payload_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        write_frame(&mut a, &json!([1, 2, 3])).await.unwrap();
        let err = read_frame::<_, Value>(&mut b).await.unwrap_err();
        assert!(matches!(err, FrameError::Malformed(_)));
    }

    #[tokio::test]
    async fn eof_between_frames_is_connection_closed() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);
        let err = read_frame::<_, Value>(&mut b).await.unwrap_err();
        assert!(err.is_disconnect());
    }

    #[tokio::test]
    async fn stalled_read_times_out() {
        let (_a, mut b) = tokio::io::duplex(64);
        let err = read_frame_timeout::<_, Value>(&mut b, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, FrameError::Timeout));
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }
}

//! # TCP Transport
//!
//! Carries a replication session over any byte stream. Each message is
//! framed as a big-endian `u32` length followed by its bincode encoding.
//!
//! ```text
//! ┌──────────────┬────────────────────────────┐
//! │ len (u32 BE) │ bincode(Message), len bytes │
//! └──────────────┴────────────────────────────┘
//! ```
//!
//! Frames larger than `MAX_MESSAGE_SIZE` are rejected before any allocation,
//! so a hostile peer can't make us buffer gigabytes.

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use omega_protocol::config::MAX_MESSAGE_SIZE;
use omega_protocol::{Message, ProtocolStream};

/// Read one frame. `None` on a clean end of stream.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Message>> {
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e).context("failed to read frame length"),
    };
    if len > MAX_MESSAGE_SIZE {
        bail!("frame of {} bytes exceeds the {} byte limit", len, MAX_MESSAGE_SIZE);
    }
    let mut body = vec![0u8; len];
    reader
        .read_exact(&mut body)
        .await
        .context("truncated frame")?;
    Ok(Some(Message::decode(&body)?))
}

pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, message: &Message) -> Result<()> {
    let body = message.encode()?;
    if body.len() > MAX_MESSAGE_SIZE {
        bail!("refusing to send a {} byte frame", body.len());
    }
    writer.write_u32(body.len() as u32).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Pump a session over `io` until either side hangs up.
pub async fn run<S>(io: S, session: ProtocolStream) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut reader, mut writer) = tokio::io::split(io);
    let (inbound, mut outbound) = session.into_parts();

    let read = async {
        while let Some(message) = read_frame(&mut reader).await? {
            if inbound.send(message).await.is_err() {
                break;
            }
        }
        Ok::<_, anyhow::Error>(())
    };
    let write = async {
        while let Some(message) = outbound.recv().await {
            write_frame(&mut writer, &message).await?;
        }
        Ok::<_, anyhow::Error>(())
    };

    tokio::select! {
        result = read => result,
        result = write => result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use omega_protocol::{MemoryStorage, Omega, OmegaOptions, RangeRequest};

    #[tokio::test]
    async fn frames_survive_the_trip() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let message = Message::Have {
            start: 4,
            length: 12,
        };
        write_frame(&mut a, &message).await.unwrap();
        drop(a);

        assert_eq!(read_frame(&mut b).await.unwrap(), Some(message));
        assert_eq!(read_frame(&mut b).await.unwrap(), None);
    }

    #[tokio::test]
    async fn oversized_frames_are_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_u32(MAX_MESSAGE_SIZE as u32 + 1).await.unwrap();
        assert!(read_frame(&mut b).await.is_err());
    }

    #[tokio::test]
    async fn logs_replicate_over_a_byte_stream() {
        let source = Omega::open(Arc::new(MemoryStorage::new()), OmegaOptions::default())
            .await
            .unwrap();
        source.append(["alpha", "beta", "gamma"]).await.unwrap();
        let replica = Omega::open(Arc::new(MemoryStorage::new()), OmegaOptions::default())
            .await
            .unwrap();

        let (left, right) = tokio::io::duplex(64 * 1024);
        tokio::spawn(run(left, source.replicate()));
        tokio::spawn(run(right, replica.replicate()));

        let report = replica
            .download(RangeRequest::new(0, 3))
            .wait()
            .await
            .unwrap();
        assert!(report.is_complete());
        assert_eq!(replica.get(2).await.unwrap(), b"gamma");
    }
}

//! Framed message transport over a coordinator link.
//!
//! Every exchange is a fixed header followed by `extra_bytes` of payload and
//! a flush. The worker side blocks on `std::io`; the coordinator side uses
//! the async variants from its event loop.

use std::io::{Read, Write};

use anyhow::{Context, Result, anyhow};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::protocol::{HEADER_BYTES, Message};

/// Write one framed message. `msg.extra_bytes` is forced to the payload
/// length so header and payload can never disagree.
pub fn send_message<W: Write>(writer: &mut W, msg: &Message, payload: &[u8]) -> Result<()> {
    let mut msg = msg.clone();
    msg.extra_bytes = payload.len() as u32;
    writer
        .write_all(&msg.encode())
        .context("write message header")?;
    if !payload.is_empty() {
        writer.write_all(payload).context("write message payload")?;
    }
    writer.flush().context("flush message")?;
    Ok(())
}

/// Read one framed message. Short reads and EINTR are absorbed by
/// `read_exact`; EOF mid-header surfaces as an error (peer gone).
pub fn recv_message<R: Read>(reader: &mut R) -> Result<(Message, Vec<u8>)> {
    let mut header = [0u8; HEADER_BYTES];
    reader
        .read_exact(&mut header)
        .context("read message header")?;
    let msg = Message::decode(&header)?;
    if !msg.is_valid() {
        return Err(anyhow!("invalid message on link: {:?}", msg.msg_type));
    }
    let mut payload = vec![0u8; msg.extra_bytes as usize];
    if !payload.is_empty() {
        reader
            .read_exact(&mut payload)
            .context("read message payload")?;
    }
    Ok((msg, payload))
}

pub async fn write_message<W>(writer: &mut W, msg: &Message, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut msg = msg.clone();
    msg.extra_bytes = payload.len() as u32;
    writer.write_all(&msg.encode()).await?;
    if !payload.is_empty() {
        writer.write_all(payload).await?;
    }
    writer.flush().await?;
    Ok(())
}

pub async fn read_message<R>(reader: &mut R) -> Result<(Message, Vec<u8>)>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_BYTES];
    reader.read_exact(&mut header).await?;
    let msg = Message::decode(&header)?;
    if !msg.is_valid() {
        return Err(anyhow!("invalid message on link: {:?}", msg.msg_type));
    }
    let mut payload = vec![0u8; msg.extra_bytes as usize];
    if !payload.is_empty() {
        reader.read_exact(&mut payload).await?;
    }
    Ok((msg, payload))
}

#[cfg(test)]
#[path = "tests/link_tests.rs"]
mod tests;

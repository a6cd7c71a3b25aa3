//! Length-prefixed frames: a big-endian `u32` length followed by the bincode
//! encoding of the message.

use bincode::Options;
use serde::{de::DeserializeOwned, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const MAX_FRAME_LEN: u32 = 16 << 20;

pub async fn send<T>(stream: &mut (impl AsyncWrite + Unpin), message: &T) -> crate::Result<()>
where
    T: Serialize,
{
    let buf = bincode::options().serialize(message)?;
    let len = u32::try_from(buf.len())?;
    if len > MAX_FRAME_LEN {
        crate::bail!("outgoing frame of {len} bytes exceeds limit")
    }
    stream.write_u32(len).await?;
    stream.write_all(&buf).await?;
    stream.flush().await?;
    Ok(())
}

/// Receive the next frame. `None` if the remote closed the stream cleanly at a
/// frame boundary.
pub async fn recv<T>(stream: &mut (impl AsyncRead + Unpin)) -> crate::Result<Option<T>>
where
    T: DeserializeOwned,
{
    let mut prefix = [0; 4];
    let mut filled = 0;
    while filled < prefix.len() {
        match stream.read(&mut prefix[filled..]).await? {
            0 if filled == 0 => return Ok(None),
            0 => crate::bail!("stream closed after {filled} byte(s) of a frame length"),
            n => filled += n,
        }
    }
    let len = u32::from_be_bytes(prefix);
    if len > MAX_FRAME_LEN {
        crate::bail!("incoming frame of {len} bytes exceeds limit")
    }
    let mut buf = vec![0; len as _];
    stream.read_exact(&mut buf).await?;
    Ok(Some(bincode::options().deserialize(&buf)?))
}

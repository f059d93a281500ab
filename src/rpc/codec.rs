use anyhow::{Result, bail};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single frame; anything larger is treated as a corrupt
/// stream rather than an allocation request.
const MAX_FRAME_LEN: u64 = 16 * 1024 * 1024;

/// Write one varint-length-prefixed frame.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut prefix = [0u8; 10];
    let n = encode_uvarint(payload.len() as u64, &mut prefix);

    writer.write_all(&prefix[..n]).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;

    Ok(())
}

/// Read one varint-length-prefixed frame. `None` means the peer closed the
/// connection cleanly before a new frame started.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let len = match read_uvarint(reader).await? {
        Some(len) => len,
        None => return Ok(None),
    };

    if len > MAX_FRAME_LEN {
        bail!("frame length {len} exceeds the {MAX_FRAME_LEN} byte limit");
    }

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;

    Ok(Some(payload))
}

fn encode_uvarint(mut value: u64, buf: &mut [u8; 10]) -> usize {
    let mut i = 0;
    while value >= 0x80 {
        buf[i] = (value as u8) | 0x80;
        value >>= 7;
        i += 1;
    }
    buf[i] = value as u8;
    i + 1
}

async fn read_uvarint<R>(reader: &mut R) -> Result<Option<u64>>
where
    R: AsyncRead + Unpin,
{
    let mut value: u64 = 0;
    let mut shift = 0;

    for i in 0..10 {
        let mut byte = [0u8; 1];
        match reader.read_exact(&mut byte).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof && i == 0 => {
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        }

        value |= u64::from(byte[0] & 0x7f) << shift;
        if byte[0] & 0x80 == 0 {
            return Ok(Some(value));
        }
        shift += 7;
    }

    bail!("malformed length prefix");
}

//! Git pkt-line framing.
//!
//! The smart-transport protocols frame every message as four ASCII hex
//! digits giving the total length (including the length field itself),
//! followed by the payload. A length of `0000` is a "flush packet"
//! delimiting one section of the stream.

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt};

/// A flush packet, terminating one section of the stream.
pub const FLUSH: &[u8; 4] = b"0000";

/// Largest payload expressible in one pkt-line: `0xffff` total bytes minus
/// the four-byte length field.
pub const MAX_PAYLOAD: usize = 0xffff - 4;

/// Parse a four-hex-digit length prefix into the total pkt-line length.
pub fn parse_len(prefix: &[u8; 4]) -> Result<usize> {
    let text = std::str::from_utf8(prefix).context("pkt-line length is not ASCII")?;
    usize::from_str_radix(text, 16)
        .with_context(|| format!("malformed pkt-line length {text:?}"))
}

/// Encode the length prefix for a pkt-line carrying `payload_len` bytes.
///
/// Fails when the line would not fit in the four-digit length field.
pub fn encode_len(payload_len: usize) -> Result<[u8; 4]> {
    if payload_len > MAX_PAYLOAD {
        bail!("pkt-line payload too long: {payload_len} bytes");
    }
    let text = format!("{:04x}", payload_len + 4);
    let mut prefix = [0u8; 4];
    prefix.copy_from_slice(text.as_bytes());
    Ok(prefix)
}

/// Read one pkt-line from `reader`.
///
/// Returns `None` for a flush packet, otherwise the payload bytes. Short
/// reads and malformed length prefixes are errors.
pub async fn read_line<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut prefix = [0u8; 4];
    reader
        .read_exact(&mut prefix)
        .await
        .context("short read on pkt-line length")?;
    let len = parse_len(&prefix)?;
    if len == 0 {
        return Ok(None);
    }
    if len < 4 {
        bail!("pkt-line length {len} is shorter than its own prefix");
    }
    let mut payload = vec![0u8; len - 4];
    reader
        .read_exact(&mut payload)
        .await
        .context("short read on pkt-line payload")?;
    Ok(Some(payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_len_decodes_hex() {
        assert_eq!(parse_len(b"0000").unwrap(), 0);
        assert_eq!(parse_len(b"0010").unwrap(), 16);
        assert_eq!(parse_len(b"ffff").unwrap(), 0xffff);
    }

    #[test]
    fn parse_len_rejects_garbage() {
        assert!(parse_len(b"zzzz").is_err());
        assert!(parse_len(b"00 1").is_err());
    }

    #[test]
    fn encode_len_round_trips() {
        let prefix = encode_len(12).unwrap();
        assert_eq!(&prefix, b"0010");
        assert_eq!(parse_len(&prefix).unwrap(), 16);
    }

    #[test]
    fn encode_len_rejects_oversized_payloads() {
        assert!(encode_len(MAX_PAYLOAD).is_ok());
        assert!(encode_len(MAX_PAYLOAD + 1).is_err());
    }

    #[tokio::test]
    async fn read_line_splits_frames() {
        let mut input: &[u8] = b"0009hello0000";
        assert_eq!(
            read_line(&mut input).await.unwrap(),
            Some(b"hello".to_vec())
        );
        assert_eq!(read_line(&mut input).await.unwrap(), None);
    }

    #[tokio::test]
    async fn read_line_fails_on_truncated_payload() {
        let mut input: &[u8] = b"0009he";
        assert!(read_line(&mut input).await.is_err());
    }
}

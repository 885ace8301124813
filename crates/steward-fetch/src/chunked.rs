//! Strict chunked transfer-encoding codec.
//!
//! The decoder accepts exactly the framing the controller's payload
//! servers emit: a hex chunk-size line, that many bytes, a CRLF, and a
//! zero-size chunk followed by its own CRLF to terminate. Chunk
//! extensions, trailers, missing terminators, and short reads are all
//! fatal. Truncating silently would hand a partial payload to the
//! executor, which is worse than failing.

use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};
use tokio::time::timeout;

use crate::error::FetchError;

/// Longest accepted protocol line (status line, header, chunk size).
pub(crate) const MAX_LINE_LEN: usize = 16 * 1024;

/// Read one line up to and including `\n`, bounded by `read_timeout`.
///
/// Returns `None` on a clean end-of-stream before any byte. A line cut
/// off by EOF is returned without its terminator; callers that need the
/// terminator must check for it.
pub(crate) async fn read_line<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    read_timeout: Duration,
    stage: &'static str,
) -> Result<Option<Vec<u8>>, FetchError> {
    let mut line = Vec::new();
    let n = timeout(read_timeout, reader.read_until(b'\n', &mut line))
        .await
        .map_err(|_| FetchError::Timeout {
            stage,
            after: read_timeout,
        })?
        .map_err(|e| FetchError::Io { stage, source: e })?;
    if n == 0 {
        return Ok(None);
    }
    if line.len() > MAX_LINE_LEN {
        return Err(FetchError::MalformedResponse(format!(
            "{stage} line longer than {MAX_LINE_LEN} bytes"
        )));
    }
    Ok(Some(line))
}

/// Read exactly `buf.len()` bytes, bounded by `read_timeout`.
pub(crate) async fn read_exact<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
    read_timeout: Duration,
    stage: &'static str,
) -> Result<(), FetchError> {
    timeout(read_timeout, reader.read_exact(buf))
        .await
        .map_err(|_| FetchError::Timeout {
            stage,
            after: read_timeout,
        })?
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => FetchError::UnexpectedEof { stage },
            _ => FetchError::Io { stage, source: e },
        })?;
    Ok(())
}

/// Parse a chunk-size line: ASCII hex digits only, optional trailing
/// whitespace. Rejects chunk extensions and signs.
fn parse_chunk_size(line: &[u8]) -> Result<usize, FetchError> {
    let text = std::str::from_utf8(line)
        .map_err(|_| FetchError::ChunkDecode("chunk size line is not ascii".into()))?;
    let trimmed = text.trim_end();
    if trimmed.is_empty() || !trimmed.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(FetchError::ChunkDecode(format!(
            "invalid chunk size line {trimmed:?}"
        )));
    }
    usize::from_str_radix(trimmed, 16)
        .map_err(|_| FetchError::ChunkDecode(format!("chunk size {trimmed:?} out of range")))
}

/// Decode a chunked body from `reader` until the terminating zero chunk.
///
/// Every chunk, the final zero-size chunk included, must be followed by
/// CRLF. The accumulated body may not exceed `max_body_bytes`.
pub async fn decode_chunked<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    read_timeout: Duration,
    max_body_bytes: usize,
) -> Result<Vec<u8>, FetchError> {
    let mut body = Vec::new();
    loop {
        let line = read_line(reader, read_timeout, "chunk size")
            .await?
            .ok_or(FetchError::UnexpectedEof { stage: "chunk size" })?;
        let size = parse_chunk_size(&line)?;

        if size > 0 {
            if body.len() + size > max_body_bytes {
                return Err(FetchError::MalformedResponse(format!(
                    "chunked body larger than {max_body_bytes} bytes"
                )));
            }
            let start = body.len();
            body.resize(start + size, 0);
            read_exact(reader, &mut body[start..], read_timeout, "chunk data")
                .await
                .map_err(|e| match e {
                    FetchError::UnexpectedEof { .. } => {
                        FetchError::ChunkDecode("stream ended inside a chunk".into())
                    }
                    other => other,
                })?;
        }

        let mut crlf = [0u8; 2];
        read_exact(reader, &mut crlf, read_timeout, "chunk terminator")
            .await
            .map_err(|e| match e {
                FetchError::UnexpectedEof { .. } => {
                    FetchError::ChunkDecode("stream ended before chunk CRLF".into())
                }
                other => other,
            })?;
        if &crlf != b"\r\n" {
            return Err(FetchError::ChunkDecode(format!(
                "chunk not terminated by CRLF, got {crlf:?}"
            )));
        }

        if size == 0 {
            return Ok(body);
        }
    }
}

/// Encode `payload` as a chunked body with chunks of at most
/// `chunk_size` bytes, terminated by the zero chunk.
///
/// Used by test fixtures and by controller-side tooling that serves
/// payloads to the agent.
pub fn encode_chunked(payload: &[u8], chunk_size: usize) -> Vec<u8> {
    assert!(chunk_size > 0, "chunk size must be positive");
    let mut out = Vec::with_capacity(payload.len() + 32);
    for chunk in payload.chunks(chunk_size) {
        out.extend_from_slice(format!("{:x}\r\n", chunk.len()).as_bytes());
        out.extend_from_slice(chunk);
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"0\r\n\r\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tokio::io::BufReader;

    const TIMEOUT: Duration = Duration::from_secs(5);
    const MAX: usize = 1024 * 1024;

    async fn decode_bytes(input: &[u8]) -> Result<Vec<u8>, FetchError> {
        let mut reader = BufReader::new(input);
        decode_chunked(&mut reader, TIMEOUT, MAX).await
    }

    #[tokio::test]
    async fn test_round_trip_single_chunk() {
        let encoded = encode_chunked(b"hello world", 64);
        assert_eq!(decode_bytes(&encoded).await.unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn test_round_trip_many_small_chunks() {
        let payload: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();
        let encoded = encode_chunked(&payload, 7);
        assert_eq!(decode_bytes(&encoded).await.unwrap(), payload);
    }

    #[tokio::test]
    async fn test_empty_payload() {
        let encoded = encode_chunked(b"", 16);
        assert_eq!(encoded, b"0\r\n\r\n");
        assert_eq!(decode_bytes(&encoded).await.unwrap(), b"");
    }

    #[tokio::test]
    async fn test_missing_final_crlf_fails() {
        // Valid chunk, then the zero chunk with no trailing CRLF.
        let input = b"5\r\nhello\r\n0\r\n";
        assert!(matches!(
            decode_bytes(input).await,
            Err(FetchError::ChunkDecode(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_chunk_crlf_fails() {
        // Chunk data runs straight into the next size line.
        let input = b"5\r\nhello0\r\n\r\n";
        assert!(matches!(
            decode_bytes(input).await,
            Err(FetchError::ChunkDecode(_))
        ));
    }

    #[tokio::test]
    async fn test_bad_hex_size_fails() {
        for input in [
            b"xyz\r\nabc\r\n0\r\n\r\n".as_slice(),
            b"+5\r\nhello\r\n0\r\n\r\n".as_slice(),
            b"5;ext=1\r\nhello\r\n0\r\n\r\n".as_slice(),
            b"\r\n0\r\n\r\n".as_slice(),
        ] {
            assert!(
                matches!(decode_bytes(input).await, Err(FetchError::ChunkDecode(_))),
                "accepted invalid size line in {input:?}"
            );
        }
    }

    #[tokio::test]
    async fn test_truncated_chunk_fails() {
        let input = b"a\r\nhello";
        assert!(matches!(
            decode_bytes(input).await,
            Err(FetchError::ChunkDecode(_))
        ));
    }

    #[tokio::test]
    async fn test_eof_before_any_chunk_fails() {
        assert!(matches!(
            decode_bytes(b"").await,
            Err(FetchError::UnexpectedEof { .. })
        ));
    }

    #[tokio::test]
    async fn test_body_over_limit_fails() {
        let payload = vec![0x41u8; 64];
        let encoded = encode_chunked(&payload, 16);
        let mut reader = BufReader::new(encoded.as_slice());
        let result = decode_chunked(&mut reader, TIMEOUT, 32).await;
        assert!(matches!(result, Err(FetchError::MalformedResponse(_))));
    }

    proptest! {
        #[test]
        fn test_round_trip_arbitrary(
            payload in proptest::collection::vec(any::<u8>(), 0..4096),
            chunk_size in 1usize..512
        ) {
            let encoded = encode_chunked(&payload, chunk_size);
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
                .expect("runtime");
            let decoded = rt.block_on(async {
                let mut reader = BufReader::new(encoded.as_slice());
                decode_chunked(&mut reader, TIMEOUT, MAX).await
            });
            prop_assert_eq!(decoded.unwrap(), payload);
        }
    }
}

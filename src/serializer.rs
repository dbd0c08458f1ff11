//! Wire serialization of data segments.
//!
//! Format: `<length>,<checksum>,<payload>` where both numbers are ASCII
//! decimal without leading zeros. The frame delimiter is written by the
//! caller, not by [`DataSegmentSerializer::serialize`].

use crate::checksum::ChecksumBuilder;
use crate::error::StressError;
use crate::segment::{BufferPool, DataSegment};
use bytes::Buf;
use rand::rngs::StdRng;
use rand::Rng;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};

const FIELD_SEPARATOR: u8 = b',';

/// Decimal digits in `u64::MAX`
const MAX_FIELD_DIGITS: usize = 20;

/// Longest frame (delimiter excluded) carrying a payload of at most
/// `max_payload` bytes
pub const fn max_frame_length(max_payload: usize) -> usize {
    max_payload.saturating_add(2 * MAX_FIELD_DIGITS + 2)
}

/// Serializes segments onto a byte stream and parses them back out of frames
pub struct DataSegmentSerializer {
    pool: Arc<BufferPool>,
    max_length: usize,
    scratch: Vec<u8>,
}

impl DataSegmentSerializer {
    /// Frames declaring more than `max_length` payload bytes are rejected
    /// on decode.
    pub fn new(pool: Arc<BufferPool>, max_length: usize) -> Self {
        Self {
            pool,
            max_length,
            scratch: Vec::with_capacity(2 * MAX_FIELD_DIGITS + 2),
        }
    }

    /// Write `segment` to `writer`.
    ///
    /// With `rng` set the payload goes out in randomly sized chunks, mixing
    /// whole-chunk writes, short partial writes, flushes and delays. The
    /// resulting bytes are identical to the plain path. Cancellation is by
    /// dropping the returned future.
    pub async fn serialize<W>(
        &mut self,
        writer: &mut W,
        segment: &DataSegment,
        rng: Option<&mut StdRng>,
    ) -> Result<(), StressError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        self.scratch.clear();
        write!(
            self.scratch,
            "{},{},",
            segment.len(),
            segment.checksum()
        )?;
        writer.write_all(&self.scratch).await?;

        let payload = segment.as_bytes();
        match rng {
            None => writer.write_all(payload).await?,
            Some(rng) => write_chunked(writer, payload, rng).await?,
        }
        Ok(())
    }

    /// Parse and validate one frame (delimiter already stripped).
    ///
    /// Accepts any [`Buf`], so frames split across several buffers are
    /// parsed without flattening them first. On failure no segment escapes:
    /// a segment allocated for a payload that fails its checksum is dropped
    /// back into the pool before the error is returned.
    pub fn deserialize<B: Buf>(&mut self, mut frame: B) -> Result<DataSegment, StressError> {
        let length = self.read_field(&mut frame)?;
        let declared_checksum = self.read_field(&mut frame)?;

        let length = match usize::try_from(length) {
            Ok(length) if length <= self.max_length => length,
            _ => {
                return Err(StressError::mismatch(format!(
                    "declared length {} exceeds the maximum of {}",
                    length, self.max_length
                )))
            }
        };
        if length != frame.remaining() {
            return Err(StressError::mismatch(format!(
                "declared length {} does not match payload length {}",
                length,
                frame.remaining()
            )));
        }

        let mut segment = DataSegment::with_length(&self.pool, length);
        let mut builder = ChecksumBuilder::new();
        let mut filled = 0;
        while frame.has_remaining() {
            let chunk = frame.chunk();
            let take = chunk.len().min(length - filled);
            segment.as_bytes_mut()[filled..filled + take].copy_from_slice(&chunk[..take]);
            builder.update(&chunk[..take]);
            filled += take;
            frame.advance(take);
        }

        if builder.finish() != declared_checksum {
            return Err(StressError::mismatch(
                "declared checksum doesn't match payload checksum",
            ));
        }
        Ok(segment)
    }

    /// Consume one comma-terminated decimal field.
    fn read_field<B: Buf>(&mut self, frame: &mut B) -> Result<u64, StressError> {
        self.scratch.clear();
        loop {
            if !frame.has_remaining() {
                return Err(StressError::mismatch(
                    "should contain comma-separated values",
                ));
            }
            let chunk = frame.chunk();
            let (digits, consumed, done) = match chunk.iter().position(|&b| b == FIELD_SEPARATOR) {
                Some(pos) => (&chunk[..pos], pos + 1, true),
                None => (chunk, chunk.len(), false),
            };
            if self.scratch.len() + digits.len() > MAX_FIELD_DIGITS {
                return Err(StressError::mismatch("numeric field too long"));
            }
            self.scratch.extend_from_slice(digits);
            frame.advance(consumed);
            if done {
                return parse_decimal(&self.scratch);
            }
        }
    }
}

fn parse_decimal(digits: &[u8]) -> Result<u64, StressError> {
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return Err(StressError::mismatch(format!(
            "invalid numeric field {:?}",
            String::from_utf8_lossy(digits)
        )));
    }
    if digits.len() > 1 && digits[0] == b'0' {
        return Err(StressError::mismatch("numeric field has leading zeros"));
    }
    digits.iter().try_fold(0u64, |acc, &d| {
        acc.checked_mul(10)
            .and_then(|acc| acc.checked_add(u64::from(d - b'0')))
            .ok_or_else(|| StressError::mismatch("numeric field overflows u64"))
    })
}

async fn write_chunked<W>(writer: &mut W, mut source: &[u8], rng: &mut StdRng) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    while !source.is_empty() {
        if rng.gen_bool(0.05) {
            writer.write_all(&source[..1]).await?;
            source = &source[1..];
        } else {
            let chunk_size = rng.gen_range(1..=source.len());
            let (chunk, rest) = source.split_at(chunk_size);
            source = rest;

            if rng.gen_bool(0.9) {
                writer.write_all(chunk).await?;
            } else {
                // Single write calls; the transport may accept a prefix only.
                let mut pending = chunk;
                while !pending.is_empty() {
                    let written = writer.write(pending).await?;
                    if written == 0 {
                        return Err(std::io::ErrorKind::WriteZero.into());
                    }
                    pending = &pending[written..];
                }
            }
        }

        if rng.gen_bool(0.3) {
            writer.flush().await?;
        }

        if rng.gen_bool(0.05) {
            if rng.gen_bool(0.7) {
                tokio::time::sleep(Duration::from_millis(rng.gen_range(0..60))).await;
            } else {
                for _ in 0..rng.gen_range(0..1000) {
                    std::hint::spin_loop();
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::checksum;
    use bytes::Bytes;
    use rand::SeedableRng;

    fn serializer() -> DataSegmentSerializer {
        DataSegmentSerializer::new(BufferPool::for_workers(1, 4096), 4096)
    }

    async fn encode(serializer: &mut DataSegmentSerializer, payload: &[u8]) -> Vec<u8> {
        let pool = BufferPool::for_workers(1, 4096);
        let mut segment = DataSegment::with_length(&pool, payload.len());
        segment.as_bytes_mut().copy_from_slice(payload);
        let mut out = Vec::new();
        serializer.serialize(&mut out, &segment, None).await.unwrap();
        out
    }

    #[tokio::test]
    async fn test_wire_format() {
        let mut s = serializer();
        let encoded = encode(&mut s, b"abc").await;
        let expected = format!("3,{},abc", checksum(b"abc"));
        assert_eq!(encoded, expected.as_bytes());

        assert_eq!(encode(&mut s, b"").await, b"0,0,");
    }

    #[tokio::test]
    async fn test_round_trip_random_payloads() {
        let pool = BufferPool::for_workers(1, 256);
        let mut s = DataSegmentSerializer::new(pool.clone(), 256);
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..64 {
            let segment = DataSegment::random(&pool, &mut rng, 256);
            let mut wire = Vec::new();
            s.serialize(&mut wire, &segment, None).await.unwrap();

            let decoded = s.deserialize(Bytes::from(wire)).unwrap();
            assert_eq!(decoded.as_bytes(), segment.as_bytes());
            assert_eq!(decoded.checksum(), segment.checksum());
        }
        assert_eq!(pool.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_fault_injection_is_byte_identical() {
        let pool = BufferPool::for_workers(1, 2048);
        let mut s = DataSegmentSerializer::new(pool.clone(), 2048);
        let mut rng = StdRng::seed_from_u64(3);
        let mut chunking = StdRng::seed_from_u64(99);
        for _ in 0..16 {
            let segment = DataSegment::random(&pool, &mut rng, 2048);
            let mut plain = Vec::new();
            s.serialize(&mut plain, &segment, None).await.unwrap();

            let (mut tx, mut rx) = tokio::io::duplex(64);
            let reader = tokio::spawn(async move {
                let mut out = Vec::new();
                tokio::io::AsyncReadExt::read_to_end(&mut rx, &mut out).await.unwrap();
                out
            });
            s.serialize(&mut tx, &segment, Some(&mut chunking)).await.unwrap();
            drop(tx);
            assert_eq!(reader.await.unwrap(), plain);
        }
    }

    #[test]
    fn test_deserialize_segmented_buffer() {
        let mut s = serializer();
        let wire = format!("11,{},hello world", checksum(b"hello world"));
        let (head, tail) = wire.as_bytes().split_at(5);
        let chained = Bytes::copy_from_slice(head).chain(Bytes::copy_from_slice(tail));
        let segment = s.deserialize(chained).unwrap();
        assert_eq!(segment.as_bytes(), b"hello world");
    }

    #[test]
    fn test_corruption_detected() {
        let mut s = serializer();
        let payload = b"the quick brown fox";
        let header = format!("{},{},", payload.len(), checksum(payload));
        for i in 0..payload.len() {
            let mut corrupted = payload.to_vec();
            corrupted[i] ^= 0x01;
            let mut frame = header.clone().into_bytes();
            frame.extend_from_slice(&corrupted);
            let err = s.deserialize(Bytes::from(frame)).unwrap_err();
            assert!(err.is_data_mismatch(), "byte {} flip not detected", i);
        }
    }

    #[test]
    fn test_length_mismatch_detected() {
        let pool = BufferPool::for_workers(1, 64);
        let mut s = DataSegmentSerializer::new(pool.clone(), 64);
        let sum = checksum(b"abcd");
        for frame in [format!("4,{},abc", sum), format!("4,{},abcde", sum)] {
            let err = s.deserialize(Bytes::from(frame)).unwrap_err();
            assert!(err.to_string().contains("declared length"));
        }
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_malformed_headers() {
        let mut s = serializer();
        for frame in ["", "12", "3,", "x,0,", "03,0,abc", "-1,0,", "1,99999999999999999999999,a"] {
            let err = s.deserialize(Bytes::from(frame)).unwrap_err();
            assert!(err.is_data_mismatch(), "{:?} accepted", frame);
        }
    }

    #[test]
    fn test_oversized_length_rejected_before_renting() {
        let pool = BufferPool::for_workers(1, 8);
        let mut s = DataSegmentSerializer::new(pool.clone(), 8);

        let fits = format!("8,{},12345678", checksum(b"12345678"));
        assert_eq!(s.deserialize(Bytes::from(fits)).unwrap().len(), 8);

        let payload = vec![b'a'; 9];
        let mut frame = format!("9,{},", checksum(&payload)).into_bytes();
        frame.extend_from_slice(&payload);
        let err = s.deserialize(Bytes::from(frame)).unwrap_err();
        assert!(err.to_string().contains("exceeds the maximum"), "{}", err);

        // Header alone is enough to reject a huge declared length.
        let err = s
            .deserialize(Bytes::from_static(b"18446744073709551615,0,"))
            .unwrap_err();
        assert!(err.is_data_mismatch());
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.idle(), 1);
    }

    #[test]
    fn test_max_frame_length() {
        assert_eq!(max_frame_length(0), 42);
        assert_eq!(max_frame_length(8192), 8234);
        assert_eq!(max_frame_length(usize::MAX), usize::MAX);
    }

    #[test]
    fn test_checksum_failure_returns_buffer() {
        let pool = BufferPool::for_workers(1, 64);
        let mut s = DataSegmentSerializer::new(pool.clone(), 64);
        assert!(s.deserialize(Bytes::from_static(b"3,1,abc")).is_err());
        assert_eq!(pool.outstanding(), 0);
    }
}

//! Record file format
//!
//! Record Layout (little-endian):
//! ```text
//! +---------------------------+
//! | version            u32    |
//! | partition          u32+N  |
//! | type               u32+N  |
//! | identifier         u32+N  |
//! | key hash           20     |
//! | partition hash     20     |
//! | timestamp (ms)     u64    |
//! | header hash        20     |
//! | header size        u64    |
//! | body hash          20     |
//! | body size          u64    |
//! | body inline        u8     |
//! | crc32c             u32    |  over everything above
//! +---------------------------+
//! | header bytes              |
//! +---------------------------+
//! | body bytes (if inline)    |
//! +---------------------------+
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use netcache_common::{DIGEST_LENGTH, Error, Key, Result, Salt, Sha1Digest, compute_sha1};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Current on-disk format version
pub const STORAGE_VERSION: u32 = 4;

/// A cache entry
#[derive(Clone, Debug)]
pub struct Record {
    pub key: Key,
    pub timestamp: SystemTime,
    pub header: Bytes,
    pub body: Bytes,
    /// Salted SHA-1 of the body. Recomputed on every write.
    pub body_hash: Sha1Digest,
}

impl Record {
    /// Build a record, hashing the body with the cache salt
    #[must_use]
    pub fn new(key: Key, timestamp: SystemTime, header: Bytes, body: Bytes, salt: &Salt) -> Self {
        let body_hash = compute_sha1(&body, salt);
        Self {
            key,
            timestamp,
            header,
            body,
            body_hash,
        }
    }
}

/// Decoded fixed part of a record file
#[derive(Clone, Debug)]
pub struct RecordMetaData {
    pub version: u32,
    pub key: Key,
    pub timestamp: SystemTime,
    pub header_hash: Sha1Digest,
    pub header_size: u64,
    pub body_hash: Sha1Digest,
    pub body_size: u64,
    pub is_body_inline: bool,
    /// Offset of the header bytes within the file
    pub header_offset: usize,
}

/// A record read back from disk
#[derive(Clone, Debug)]
pub struct DecodedRecord {
    pub record: Record,
    pub metadata: RecordMetaData,
}

impl DecodedRecord {
    #[must_use]
    pub fn is_body_inline(&self) -> bool {
        self.metadata.is_body_inline
    }
}

fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_u32_le(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

fn timestamp_to_millis(timestamp: SystemTime) -> u64 {
    timestamp
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Encode a record. With `body_is_blob` the body is left out of the file
/// and only its hash is kept.
#[must_use]
pub fn encode_record(record: &Record, body_is_blob: bool, salt: &Salt) -> Bytes {
    let key = &record.key;
    let header_hash = compute_sha1(&record.header, salt);
    let body_hash = compute_sha1(&record.body, salt);
    let inline_body_len = if body_is_blob { 0 } else { record.body.len() };

    let mut buf = BytesMut::with_capacity(
        256 + key.partition().len()
            + key.record_type().len()
            + key.identifier().len()
            + record.header.len()
            + inline_body_len,
    );

    buf.put_u32_le(STORAGE_VERSION);
    put_string(&mut buf, key.partition());
    put_string(&mut buf, key.record_type());
    put_string(&mut buf, key.identifier());
    buf.put_slice(key.hash().as_bytes());
    buf.put_slice(key.partition_hash().as_bytes());
    buf.put_u64_le(timestamp_to_millis(record.timestamp));
    buf.put_slice(header_hash.as_bytes());
    buf.put_u64_le(record.header.len() as u64);
    buf.put_slice(body_hash.as_bytes());
    buf.put_u64_le(record.body.len() as u64);
    buf.put_u8(u8::from(!body_is_blob));

    let checksum = crc32c::crc32c(&buf);
    buf.put_u32_le(checksum);

    buf.put_slice(&record.header);
    if !body_is_blob {
        buf.put_slice(&record.body);
    }
    buf.freeze()
}

/// Bounds-checked reader over the metadata
struct Decoder<'a> {
    buf: &'a [u8],
}

impl<'a> Decoder<'a> {
    fn need(&self, needed: usize) -> Result<()> {
        if self.buf.remaining() < needed {
            return Err(Error::Truncated {
                needed,
                available: self.buf.remaining(),
            });
        }
        Ok(())
    }

    fn u8(&mut self) -> Result<u8> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    fn u32(&mut self) -> Result<u32> {
        self.need(4)?;
        Ok(self.buf.get_u32_le())
    }

    fn u64(&mut self) -> Result<u64> {
        self.need(8)?;
        Ok(self.buf.get_u64_le())
    }

    fn digest(&mut self) -> Result<Sha1Digest> {
        self.need(DIGEST_LENGTH)?;
        let mut bytes = [0u8; DIGEST_LENGTH];
        self.buf.copy_to_slice(&mut bytes);
        Ok(Sha1Digest::from_bytes(bytes))
    }

    fn string(&mut self) -> Result<String> {
        let len = self.u32()? as usize;
        self.need(len)?;
        let (s, rest) = self.buf.split_at(len);
        self.buf = rest;
        String::from_utf8(s.to_vec()).map_err(|_| Error::corrupt("string is not UTF-8"))
    }

    fn position(&self, start: &'a [u8]) -> usize {
        start.len() - self.buf.len()
    }
}

/// Decode and verify the fixed part of a record file
pub fn decode_record_metadata(data: &[u8]) -> Result<RecordMetaData> {
    let mut decoder = Decoder { buf: data };

    let version = decoder.u32()?;
    if version != STORAGE_VERSION {
        return Err(Error::VersionMismatch(version));
    }

    let partition = decoder.string()?;
    let record_type = decoder.string()?;
    let identifier = decoder.string()?;
    let hash = decoder.digest()?;
    let partition_hash = decoder.digest()?;
    let key = Key::from_parts(partition, record_type, identifier, hash, partition_hash)
        .map_err(|e| Error::corrupt(format!("stored key is unusable: {e}")))?;

    let timestamp = UNIX_EPOCH + Duration::from_millis(decoder.u64()?);
    let header_hash = decoder.digest()?;
    let header_size = decoder.u64()?;
    let body_hash = decoder.digest()?;
    let body_size = decoder.u64()?;
    let is_body_inline = match decoder.u8()? {
        0 => false,
        1 => true,
        other => return Err(Error::corrupt(format!("bad inline flag {other}"))),
    };

    let checksummed = decoder.position(data);
    let expected = decoder.u32()?;
    let actual = crc32c::crc32c(&data[..checksummed]);
    if expected != actual {
        return Err(Error::ChecksumMismatch { expected, actual });
    }

    Ok(RecordMetaData {
        version,
        key,
        timestamp,
        header_hash,
        header_size,
        body_hash,
        body_size,
        is_body_inline,
        header_offset: decoder.position(data),
    })
}

fn verify_digest(data: &[u8], expected: &Sha1Digest, salt: &Salt) -> Result<()> {
    let actual = compute_sha1(data, salt);
    if actual != *expected {
        return Err(Error::DigestMismatch {
            expected: expected.to_hex(),
            actual: actual.to_hex(),
        });
    }
    Ok(())
}

/// Slice out the header and check it against its hash
pub fn decode_record_header(data: &Bytes, metadata: &RecordMetaData, salt: &Salt) -> Result<Bytes> {
    let end = usize::try_from(metadata.header_size)
        .ok()
        .and_then(|size| metadata.header_offset.checked_add(size))
        .ok_or_else(|| Error::corrupt("header size overflows"))?;
    if end > data.len() {
        return Err(Error::Truncated {
            needed: end,
            available: data.len(),
        });
    }
    let header = data.slice(metadata.header_offset..end);
    verify_digest(&header, &metadata.header_hash, salt)?;
    Ok(header)
}

/// Decode a whole record file. A non-inline record comes back with an
/// empty body; the caller fetches it from the blob store.
pub fn decode_record(data: &Bytes, salt: &Salt, now: SystemTime) -> Result<DecodedRecord> {
    let metadata = decode_record_metadata(data)?;

    // Clock moved backwards or the file came from elsewhere.
    if metadata.timestamp > now {
        return Err(Error::corrupt("record timestamp is in the future"));
    }

    let header = decode_record_header(data, &metadata, salt)?;
    let body_offset = metadata.header_offset + header.len();

    let body = if metadata.is_body_inline {
        let expected_end = usize::try_from(metadata.body_size)
            .ok()
            .and_then(|size| body_offset.checked_add(size));
        if expected_end != Some(data.len()) {
            return Err(Error::corrupt(format!(
                "inline body is {} bytes, expected {}",
                data.len() - body_offset,
                metadata.body_size
            )));
        }
        let body = data.slice(body_offset..);
        verify_digest(&body, &metadata.body_hash, salt)?;
        body
    } else {
        Bytes::new()
    };

    let record = Record {
        key: metadata.key.clone(),
        timestamp: metadata.timestamp,
        header,
        body,
        body_hash: metadata.body_hash,
    };
    Ok(DecodedRecord { record, metadata })
}

#[cfg(test)]
mod tests {
    use super::*;
    use netcache_common::SALT_LENGTH;

    fn salt() -> Salt {
        Salt::from_bytes([5u8; SALT_LENGTH])
    }

    fn record(body: &'static [u8]) -> Record {
        let key = Key::new("partition", "Resource", "https://example.com/a", &salt()).unwrap();
        Record::new(
            key,
            UNIX_EPOCH + Duration::from_millis(1_700_000_000_123),
            Bytes::from_static(b"HTTP/1.1 200 OK"),
            Bytes::from_static(body),
            &salt(),
        )
    }

    #[test]
    fn test_inline_record() {
        let record = record(b"hello body");
        let data = encode_record(&record, false, &salt());

        let decoded = decode_record(&data, &salt(), SystemTime::now()).unwrap();
        assert!(decoded.is_body_inline());
        assert_eq!(decoded.record.key, record.key);
        assert_eq!(decoded.record.key.identifier(), "https://example.com/a");
        assert_eq!(decoded.record.timestamp, record.timestamp);
        assert_eq!(decoded.record.header, record.header);
        assert_eq!(decoded.record.body, record.body);
        assert_eq!(decoded.record.body_hash, record.body_hash);
        assert_eq!(decoded.metadata.body_size, 10);
    }

    #[test]
    fn test_blob_record_leaves_body_out() {
        let record = record(b"large body stored elsewhere");
        let data = encode_record(&record, true, &salt());
        let inline = encode_record(&record, false, &salt());
        assert_eq!(data.len() + record.body.len(), inline.len());

        let decoded = decode_record(&data, &salt(), SystemTime::now()).unwrap();
        assert!(!decoded.is_body_inline());
        assert!(decoded.record.body.is_empty());
        assert_eq!(decoded.record.body_hash, record.body_hash);
        assert_eq!(decoded.metadata.body_size, record.body.len() as u64);
    }

    #[test]
    fn test_empty_body_is_valid() {
        let record = record(b"");
        let data = encode_record(&record, false, &salt());
        let decoded = decode_record(&data, &salt(), SystemTime::now()).unwrap();
        assert!(decoded.record.body.is_empty());
        assert!(decoded.is_body_inline());
    }

    #[test]
    fn test_caller_body_hash_is_not_trusted() {
        let mut record = record(b"body");
        record.body_hash = Sha1Digest::default();
        let data = encode_record(&record, false, &salt());
        let decoded = decode_record(&data, &salt(), SystemTime::now()).unwrap();
        assert_eq!(decoded.record.body_hash, compute_sha1(b"body", &salt()));
    }

    #[test]
    fn test_truncated_records_are_rejected() {
        let data = encode_record(&record(b"hello body"), false, &salt());
        for len in [0, 3, 20, data.len() - 1] {
            let truncated = data.slice(..len);
            assert!(decode_record(&truncated, &salt(), SystemTime::now()).is_err());
        }
    }

    #[test]
    fn test_checksum_mismatch() {
        let data = encode_record(&record(b"hello body"), false, &salt());
        let mut corrupted = data.to_vec();
        // 'p' -> 'q' inside the partition string
        corrupted[8] ^= 0x01;
        let err = decode_record(&Bytes::from(corrupted), &salt(), SystemTime::now()).unwrap_err();
        assert!(matches!(err, Error::ChecksumMismatch { .. }));
    }

    #[test]
    fn test_body_corruption_is_detected() {
        let data = encode_record(&record(b"hello body"), false, &salt());
        let mut corrupted = data.to_vec();
        let last = corrupted.len() - 1;
        corrupted[last] ^= 0xff;
        let err = decode_record(&Bytes::from(corrupted), &salt(), SystemTime::now()).unwrap_err();
        assert!(matches!(err, Error::DigestMismatch { .. }));
        assert!(err.is_corruption());
    }

    #[test]
    fn test_wrong_salt_fails_header_check() {
        let data = encode_record(&record(b"hello body"), false, &salt());
        let other = Salt::from_bytes([6u8; SALT_LENGTH]);
        assert!(decode_record(&data, &other, SystemTime::now()).is_err());
    }

    #[test]
    fn test_version_mismatch() {
        let mut data = encode_record(&record(b"x"), false, &salt()).to_vec();
        data[..4].copy_from_slice(&(STORAGE_VERSION - 1).to_le_bytes());
        let err = decode_record(&Bytes::from(data), &salt(), SystemTime::now()).unwrap_err();
        assert!(matches!(err, Error::VersionMismatch(v) if v == STORAGE_VERSION - 1));
    }

    #[test]
    fn test_future_timestamp_is_rejected() {
        let record = record(b"x");
        let data = encode_record(&record, false, &salt());
        let before = record.timestamp - Duration::from_secs(1);
        assert!(decode_record(&data, &salt(), before).is_err());
    }

    #[test]
    fn test_metadata_only() {
        let record = record(b"hello body");
        let data = encode_record(&record, false, &salt());
        let metadata = decode_record_metadata(&data).unwrap();
        let header = decode_record_header(&data, &metadata, &salt()).unwrap();
        assert_eq!(header, record.header);
        assert_eq!(metadata.header_size, record.header.len() as u64);
    }
}

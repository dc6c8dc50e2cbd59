//! The WAL on-disk record codec.
//!
//! Integers are written in network byte order. Each record starts with a 16-bit header:
//! the top bit is the truncate flag, the next bit selects between a writer-introduction
//! record (0) and a writer-reference record (1), and the low 14 bits carry the writer
//! reference. The first record for a writer within a file is an introduction carrying the
//! full serialized writer id; subsequent records carry only the reference. References are
//! assigned sequentially from 0 and reset at every file rollover.
//!
//! ```text
//! introduction: [hdr:2][id_len:2][id:N][checksum:4][entry_len:4][idx:8][term:8][entry:M]
//! reference:    [hdr:2][checksum:4][entry_len:4][idx:8][term:8][entry:M]
//! ```
//!
//! The checksum is adler32 over `idx ‖ term ‖ entry`, or 0 when checksums are disabled.

use std::collections::HashMap;
use std::convert::TryInto;

use adler::Adler32;

use super::WriterId;

const TRUNCATE_BIT: u16 = 0b1000_0000_0000_0000;
const REF_BIT: u16 = 0b0100_0000_0000_0000;
const REF_MASK: u16 = 0b0011_1111_1111_1111;

/// The highest writer reference a single WAL file can hold.
pub const MAX_WRITER_REF: u16 = REF_MASK;

/// A record decoded from a WAL file.
#[derive(Debug, PartialEq, Eq)]
pub struct DecodedRecord<'a> {
    pub writer: WriterId,
    pub truncate: bool,
    pub index: u64,
    pub term: u64,
    pub entry: &'a [u8],
}

/// A fault encountered while decoding a record. Both variants are fatal to recovery.
#[derive(Debug, PartialEq, Eq)]
pub enum DecodeFault {
    BadChecksum,
    UnknownWriterRef(u16),
    BadWriterId,
}

pub fn checksum(index: u64, term: u64, entry: &[u8]) -> u32 {
    let mut hasher = Adler32::new();
    hasher.write_slice(&index.to_be_bytes());
    hasher.write_slice(&term.to_be_bytes());
    hasher.write_slice(entry);
    hasher.checksum()
}

/// Encode a record into `out`.
///
/// `introduce` carries the writer id when this is the writer's first record in the current
/// file; otherwise the record is reference-only.
pub fn encode(
    out: &mut Vec<u8>,
    writer_ref: u16,
    introduce: Option<&WriterId>,
    truncate: bool,
    index: u64,
    term: u64,
    entry: &[u8],
    with_checksum: bool,
) {
    debug_assert!(writer_ref <= REF_MASK);
    let mut header = writer_ref & REF_MASK;
    if truncate {
        header |= TRUNCATE_BIT;
    }
    if introduce.is_none() {
        header |= REF_BIT;
    }
    out.extend_from_slice(&header.to_be_bytes());
    if let Some(id) = introduce {
        let id_bytes = id.as_bytes();
        out.extend_from_slice(&(id_bytes.len() as u16).to_be_bytes());
        out.extend_from_slice(id_bytes);
    }
    let sum = if with_checksum { checksum(index, term, entry) } else { 0 };
    out.extend_from_slice(&sum.to_be_bytes());
    out.extend_from_slice(&(entry.len() as u32).to_be_bytes());
    out.extend_from_slice(&index.to_be_bytes());
    out.extend_from_slice(&term.to_be_bytes());
    out.extend_from_slice(entry);
}

/// The number of bytes `encode` will produce for the given shape.
pub fn encoded_len(introduce: Option<&WriterId>, entry_len: usize) -> usize {
    let intro = introduce.map(|id| 2 + id.as_bytes().len()).unwrap_or(0);
    2 + intro + 4 + 4 + 8 + 8 + entry_len
}

fn read_u16(buf: &[u8], at: usize) -> Option<u16> {
    buf.get(at..at + 2).map(|b| u16::from_be_bytes(b.try_into().unwrap()))
}

fn read_u32(buf: &[u8], at: usize) -> Option<u32> {
    buf.get(at..at + 4).map(|b| u32::from_be_bytes(b.try_into().unwrap()))
}

fn read_u64(buf: &[u8], at: usize) -> Option<u64> {
    buf.get(at..at + 8).map(|b| u64::from_be_bytes(b.try_into().unwrap()))
}

/// Decode the record starting at `at`, updating the per-file writer reference table.
///
/// Returns `Ok(None)` at end of data: either a clean end, zero padding, or a tail torn by a
/// crash mid-write. A checksum mismatch or a reference to an unknown writer is a fault.
pub fn decode<'a>(
    buf: &'a [u8],
    at: usize,
    refs: &mut HashMap<u16, WriterId>,
) -> Result<Option<(DecodedRecord<'a>, usize)>, DecodeFault> {
    let header = match read_u16(buf, at) {
        Some(h) => h,
        None => return Ok(None),
    };
    let truncate = header & TRUNCATE_BIT != 0;
    let is_ref = header & REF_BIT != 0;
    let writer_ref = header & REF_MASK;
    let mut pos = at + 2;

    let writer = if is_ref {
        match refs.get(&writer_ref) {
            Some(w) => w.clone(),
            None => return Err(DecodeFault::UnknownWriterRef(writer_ref)),
        }
    } else {
        let id_len = match read_u16(buf, pos) {
            Some(l) => l as usize,
            None => return Ok(None),
        };
        if header == 0 && id_len == 0 {
            // Zero padding at the end of a pre-allocated file.
            return Ok(None);
        }
        pos += 2;
        let id_bytes = match buf.get(pos..pos + id_len) {
            Some(b) => b,
            None => return Ok(None),
        };
        pos += id_len;
        let writer = WriterId::from_bytes(id_bytes).ok_or(DecodeFault::BadWriterId)?;
        refs.insert(writer_ref, writer.clone());
        writer
    };

    let sum = match read_u32(buf, pos) {
        Some(v) => v,
        None => return Ok(None),
    };
    pos += 4;
    let entry_len = match read_u32(buf, pos) {
        Some(v) => v as usize,
        None => return Ok(None),
    };
    pos += 4;
    let index = match read_u64(buf, pos) {
        Some(v) => v,
        None => return Ok(None),
    };
    pos += 8;
    let term = match read_u64(buf, pos) {
        Some(v) => v,
        None => return Ok(None),
    };
    pos += 8;
    let entry = match buf.get(pos..pos + entry_len) {
        Some(b) => b,
        None => return Ok(None),
    };
    pos += entry_len;

    if sum != 0 && sum != checksum(index, term, entry) {
        return Err(DecodeFault::BadChecksum);
    }

    Ok(Some((
        DecodedRecord {
            writer,
            truncate,
            index,
            term,
            entry,
        },
        pos,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip_one(truncate: bool, with_checksum: bool) {
        let writer = WriterId::from("node-1");
        let mut buf = Vec::new();
        encode(&mut buf, 0, Some(&writer), truncate, 7, 3, b"hello", with_checksum);
        assert_eq!(buf.len(), encoded_len(Some(&writer), 5));

        let mut refs = HashMap::new();
        let (rec, consumed) = decode(&buf, 0, &mut refs).unwrap().unwrap();
        assert_eq!(consumed, buf.len());
        assert_eq!(rec.writer, writer);
        assert_eq!(rec.truncate, truncate);
        assert_eq!(rec.index, 7);
        assert_eq!(rec.term, 3);
        assert_eq!(rec.entry, b"hello");
        assert_eq!(refs.get(&0), Some(&writer));
    }

    #[test]
    fn roundtrip_introduction() {
        roundtrip_one(false, true);
        roundtrip_one(true, true);
        roundtrip_one(false, false);
    }

    #[test]
    fn reference_records_resolve_through_the_intro() {
        let writer = WriterId::from("node-2");
        let mut buf = Vec::new();
        encode(&mut buf, 3, Some(&writer), false, 1, 1, b"a", true);
        let second_at = buf.len();
        encode(&mut buf, 3, None, false, 2, 1, b"b", true);
        assert_eq!(buf.len() - second_at, encoded_len(None, 1));

        let mut refs = HashMap::new();
        let (_, next) = decode(&buf, 0, &mut refs).unwrap().unwrap();
        let (rec, consumed) = decode(&buf, next, &mut refs).unwrap().unwrap();
        assert_eq!(consumed, buf.len());
        assert_eq!(rec.writer, writer);
        assert_eq!(rec.index, 2);
    }

    #[test]
    fn unknown_reference_is_a_fault() {
        let mut buf = Vec::new();
        encode(&mut buf, 9, None, false, 1, 1, b"a", true);
        let mut refs = HashMap::new();
        assert_eq!(decode(&buf, 0, &mut refs).unwrap_err(), DecodeFault::UnknownWriterRef(9));
    }

    #[test]
    fn corrupted_entry_fails_checksum() {
        let writer = WriterId::from("node-3");
        let mut buf = Vec::new();
        encode(&mut buf, 0, Some(&writer), false, 5, 2, b"payload", true);
        let last = buf.len() - 1;
        buf[last] ^= 0xff;
        let mut refs = HashMap::new();
        assert_eq!(decode(&buf, 0, &mut refs).unwrap_err(), DecodeFault::BadChecksum);
    }

    #[test]
    fn torn_tail_and_padding_end_the_scan() {
        let writer = WriterId::from("node-4");
        let mut buf = Vec::new();
        encode(&mut buf, 0, Some(&writer), false, 1, 1, b"abcdef", true);
        let full = buf.len();

        // Torn mid-record.
        let mut refs = HashMap::new();
        assert!(decode(&buf[..full - 3], 0, &mut refs).unwrap().is_none());

        // Zero padding after the last record.
        buf.extend_from_slice(&[0u8; 16]);
        let mut refs = HashMap::new();
        let (_, next) = decode(&buf, 0, &mut refs).unwrap().unwrap();
        assert!(decode(&buf, next, &mut refs).unwrap().is_none());
    }
}

use crate::error::{PipelineError, Result};
use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use bytes::Bytes;

const NSEC_PER_SEC: u32 = 1_000_000_000;

/// A compressed image message decoded from its serialized form.
///
/// `capture_sec`/`capture_nsec` come from the message header and are the
/// authoritative capture time; the container's arrival time is not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedImageRecord {
    pub capture_sec: u32,
    pub capture_nsec: u32,
    pub origin_tag: String,
    pub encoding_tag: String,
    pub payload: Bytes,
}

fn take<'a>(buf: &'a [u8], pos: usize, len: usize, field: &'static str) -> Result<&'a [u8]> {
    match pos.checked_add(len) {
        Some(end) if end <= buf.len() => Ok(&buf[pos..end]),
        _ => Err(PipelineError::MalformedRecord {
            field,
            offset: pos,
            needed: len,
            available: buf.len().saturating_sub(pos),
        }),
    }
}

fn read_u32(buf: &[u8], pos: usize, field: &'static str) -> Result<(u32, usize)> {
    let bytes = take(buf, pos, 4, field)?;
    Ok((LittleEndian::read_u32(bytes), pos + 4))
}

fn read_string(buf: &[u8], pos: usize, field: &'static str) -> Result<(String, usize)> {
    let (len, pos) = read_u32(buf, pos, field)?;
    let bytes = take(buf, pos, len as usize, field)?;
    Ok((String::from_utf8_lossy(bytes).into_owned(), pos + len as usize))
}

/// Decode a serialized compressed image message.
///
/// Layout (little-endian):
/// `u32 seq | u32 sec | u32 nsec | string frame_id | string format | u32 len | len bytes`
/// where a string is a `u32` byte length followed by UTF-8 bytes. The
/// sequence counter is read and dropped. Bytes after the payload are ignored.
pub fn decode_compressed_image(raw: &Bytes) -> Result<DecodedImageRecord> {
    let buf: &[u8] = raw;
    let (_seq, pos) = read_u32(buf, 0, "sequence_counter")?;
    let (capture_sec, pos) = read_u32(buf, pos, "capture_sec")?;
    let (capture_nsec, pos) = read_u32(buf, pos, "capture_nsec")?;
    let (origin_tag, pos) = read_string(buf, pos, "origin_tag")?;
    let (encoding_tag, pos) = read_string(buf, pos, "encoding_tag")?;
    let (payload_len, pos) = read_u32(buf, pos, "payload_length")?;
    take(buf, pos, payload_len as usize, "payload")?;

    if capture_nsec >= NSEC_PER_SEC {
        return Err(PipelineError::InvalidRecord(format!(
            "capture_nsec {} is not below one second",
            capture_nsec
        )));
    }

    Ok(DecodedImageRecord {
        capture_sec,
        capture_nsec,
        origin_tag,
        encoding_tag,
        payload: raw.slice(pos..pos + payload_len as usize),
    })
}

/// Serialize a record in the layout read by [`decode_compressed_image`].
pub fn encode_compressed_image(sequence_counter: u32, record: &DecodedImageRecord) -> Vec<u8> {
    let mut buf = Vec::with_capacity(
        24 + record.origin_tag.len() + record.encoding_tag.len() + record.payload.len(),
    );
    // Writing into a Vec cannot fail.
    let _ = buf.write_u32::<LittleEndian>(sequence_counter);
    let _ = buf.write_u32::<LittleEndian>(record.capture_sec);
    let _ = buf.write_u32::<LittleEndian>(record.capture_nsec);
    for s in [&record.origin_tag, &record.encoding_tag] {
        let _ = buf.write_u32::<LittleEndian>(s.len() as u32);
        buf.extend_from_slice(s.as_bytes());
    }
    let _ = buf.write_u32::<LittleEndian>(record.payload.len() as u32);
    buf.extend_from_slice(&record.payload);
    buf
}

//! Writers that produce small containers for tests.

use super::segment_log::{encode_frame, Compression};
use crate::error::Result;
use byteorder::{LittleEndian, WriteBytesExt};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Appends framed records to `segment-N.log` files, starting a new segment
/// once the current one would exceed `max_segment_size`.
pub(crate) struct SegmentWriter {
    root: PathBuf,
    compression: Compression,
    max_segment_size: u64,
    segment: u64,
    size: u64,
}

impl SegmentWriter {
    pub(crate) fn create(root: &Path) -> Result<Self> {
        fs::create_dir_all(root)?;
        Ok(SegmentWriter {
            root: root.to_path_buf(),
            compression: Compression::None,
            max_segment_size: u64::MAX,
            segment: 0,
            size: 0,
        })
    }

    pub(crate) fn compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    pub(crate) fn max_segment_size(mut self, bytes: u64) -> Self {
        self.max_segment_size = bytes;
        self
    }

    pub(crate) fn segment_path(&self) -> PathBuf {
        self.root.join(format!("segment-{}.log", self.segment))
    }

    pub(crate) fn append(&mut self, topic: &str, msg_type: &str, data: &[u8], timestamp: u64) -> Result<()> {
        let frame = encode_frame(topic, msg_type, self.compression, data, timestamp)?;
        if self.size > 0 && self.size + frame.len() as u64 > self.max_segment_size {
            self.segment += 1;
            self.size = 0;
        }
        let mut f = OpenOptions::new().create(true).append(true).open(self.segment_path())?;
        f.write_all(&frame)?;
        self.size += frame.len() as u64;
        Ok(())
    }
}

/// One message for [`write_bag`]: connection index, header time, payload.
pub(crate) struct BagMessage {
    pub conn: u32,
    pub sec: u32,
    pub nsec: u32,
    pub data: Vec<u8>,
}

const OP_MSG_DATA: u8 = 0x02;
const OP_BAG_HEADER: u8 = 0x03;
const OP_INDEX_DATA: u8 = 0x04;
const OP_CHUNK: u8 = 0x05;
const OP_CHUNK_INFO: u8 = 0x06;
const OP_CONNECTION: u8 = 0x07;
const BAG_HEADER_LEN: usize = 4096;

fn field(name: &str, value: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + name.len() + 1 + value.len());
    let _ = out.write_u32::<LittleEndian>((name.len() + 1 + value.len()) as u32);
    out.extend_from_slice(name.as_bytes());
    out.push(b'=');
    out.extend_from_slice(value);
    out
}

fn record(header: &[Vec<u8>], data: &[u8]) -> Vec<u8> {
    let header: Vec<u8> = header.concat();
    let mut out = Vec::with_capacity(8 + header.len() + data.len());
    let _ = out.write_u32::<LittleEndian>(header.len() as u32);
    out.extend_from_slice(&header);
    let _ = out.write_u32::<LittleEndian>(data.len() as u32);
    out.extend_from_slice(data);
    out
}

fn time(sec: u32, nsec: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(8);
    let _ = out.write_u32::<LittleEndian>(sec);
    let _ = out.write_u32::<LittleEndian>(nsec);
    out
}

fn connection(id: u32, topic: &str, msg_type: &str) -> Vec<u8> {
    let data = [
        field("topic", topic.as_bytes()),
        field("type", msg_type.as_bytes()),
        field("md5sum", b"8f7a12909da2c9d3332d540a0977563f"),
        field("message_definition", b"Header header\nstring format\nuint8[] data\n"),
    ]
    .concat();
    record(
        &[field("op", &[OP_CONNECTION]), field("conn", &id.to_le_bytes()), field("topic", topic.as_bytes())],
        &data,
    )
}

/// Write an uncompressed ROS1 (v2.0) bag with one chunk holding every
/// message. `connections` are `(topic, type)` pairs indexed by position.
pub(crate) fn write_bag(path: &Path, connections: &[(&str, &str)], messages: &[BagMessage]) -> Result<()> {
    let mut chunk_data = Vec::new();
    for (id, (topic, msg_type)) in connections.iter().enumerate() {
        chunk_data.extend(connection(id as u32, topic, msg_type));
    }
    let mut index: BTreeMap<u32, Vec<u8>> = BTreeMap::new();
    let mut counts: BTreeMap<u32, u32> = BTreeMap::new();
    for msg in messages {
        let offset = chunk_data.len() as u32;
        chunk_data.extend(record(
            &[field("op", &[OP_MSG_DATA]), field("conn", &msg.conn.to_le_bytes()), field("time", &time(msg.sec, msg.nsec))],
            &msg.data,
        ));
        let entry = index.entry(msg.conn).or_default();
        entry.extend(time(msg.sec, msg.nsec));
        entry.extend(offset.to_le_bytes());
        *counts.entry(msg.conn).or_default() += 1;
    }

    let chunk = record(
        &[
            field("op", &[OP_CHUNK]),
            field("compression", b"none"),
            field("size", &(chunk_data.len() as u32).to_le_bytes()),
        ],
        &chunk_data,
    );
    let mut index_records = Vec::new();
    for (conn, entries) in &index {
        index_records.extend(record(
            &[
                field("op", &[OP_INDEX_DATA]),
                field("ver", &1u32.to_le_bytes()),
                field("conn", &conn.to_le_bytes()),
                field("count", &counts[conn].to_le_bytes()),
            ],
            entries,
        ));
    }

    let magic = b"#ROSBAG V2.0\n";
    let chunk_pos = (magic.len() + BAG_HEADER_LEN) as u64;
    let index_pos = chunk_pos + (chunk.len() + index_records.len()) as u64;

    let header_fields = [
        field("op", &[OP_BAG_HEADER]),
        field("index_pos", &index_pos.to_le_bytes()),
        field("conn_count", &(connections.len() as u32).to_le_bytes()),
        field("chunk_count", &1u32.to_le_bytes()),
    ];
    let header_len: usize = header_fields.iter().map(Vec::len).sum();
    let padding = vec![b' '; BAG_HEADER_LEN - 8 - header_len];
    let bag_header = record(&header_fields, &padding);

    let start = messages.iter().map(|m| (m.sec, m.nsec)).min().unwrap_or((0, 0));
    let end = messages.iter().map(|m| (m.sec, m.nsec)).max().unwrap_or((0, 0));
    let mut chunk_info_data = Vec::new();
    for (conn, count) in &counts {
        chunk_info_data.extend(conn.to_le_bytes());
        chunk_info_data.extend(count.to_le_bytes());
    }
    let chunk_info = record(
        &[
            field("op", &[OP_CHUNK_INFO]),
            field("ver", &1u32.to_le_bytes()),
            field("chunk_pos", &chunk_pos.to_le_bytes()),
            field("start_time", &time(start.0, start.1)),
            field("end_time", &time(end.0, end.1)),
            field("count", &(counts.len() as u32).to_le_bytes()),
        ],
        &chunk_info_data,
    );

    let mut bag = Vec::new();
    bag.extend_from_slice(magic);
    bag.extend(bag_header);
    bag.extend(chunk);
    bag.extend(index_records);
    for (id, (topic, msg_type)) in connections.iter().enumerate() {
        bag.extend(connection(id as u32, topic, msg_type));
    }
    bag.extend(chunk_info);
    fs::write(path, bag)?;
    Ok(())
}

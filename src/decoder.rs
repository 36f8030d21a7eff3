//! The incremental, resumable stream decoder: a five-stage pipeline that
//! turns an inbound byte stream into framed SECS-II/HSMS messages.

use anyhow::{Context, Error, Result};
use byteorder::{BigEndian, ByteOrder};
use log::{debug, warn};

use crate::error::{BadFormatCode, FrameCorrupt};
use crate::format::SecsFormat;
use crate::header::{self, MessageHeader, MessageType};
use crate::item::{self, Item};
use crate::jis8;
use crate::message::SecsMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    FrameLength,
    Header,
    ItemFormat,
    ItemLength,
    ItemPayload,
}

struct ListBuilder {
    capacity: usize,
    children: Vec<Item>,
}

/// Per-connection decoder state. Not `Sync`; one instance per peer, driven
/// by a single logical reader.
pub struct StreamDecoder {
    buffer: Vec<u8>,
    write_offset: usize,
    decode_index: usize,
    previous_remained_count: usize,
    step: Stage,
    message_data_length: i64,
    msg_header: Option<MessageHeader>,
    format: Option<SecsFormat>,
    length_bits: u8,
    item_length: usize,
    stack: Vec<ListBuilder>,
    frames_decoded: u64,
    bytes_seen: u64,
    on_control: Box<dyn FnMut(MessageHeader) + Send>,
    on_data: Box<dyn FnMut(MessageHeader, SecsMessage) + Send>,
}

impl std::fmt::Debug for StreamDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamDecoder")
            .field("buffer_capacity", &self.buffer.len())
            .field("write_offset", &self.write_offset)
            .field("decode_index", &self.decode_index)
            .field("step", &self.step)
            .field("message_data_length", &self.message_data_length)
            .field("stack_depth", &self.stack.len())
            .field("frames_decoded", &self.frames_decoded)
            .field("bytes_seen", &self.bytes_seen)
            .finish()
    }
}

impl std::fmt::Display for StreamDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "StreamDecoder(frames_decoded={}, bytes_seen={})",
            self.frames_decoded, self.bytes_seen
        )
    }
}

impl StreamDecoder {
    /// `initial_buffer_bytes` is only a starting point; the decoder grows
    /// and compacts its own buffer as frames demand (see `rebalance`).
    pub fn new(
        initial_buffer_bytes: usize,
        on_control: impl FnMut(MessageHeader) + Send + 'static,
        on_data: impl FnMut(MessageHeader, SecsMessage) + Send + 'static,
    ) -> StreamDecoder {
        StreamDecoder {
            buffer: vec![0u8; initial_buffer_bytes.max(16)],
            write_offset: 0,
            decode_index: 0,
            previous_remained_count: 0,
            step: Stage::FrameLength,
            message_data_length: 0,
            msg_header: None,
            format: None,
            length_bits: 0,
            item_length: 0,
            stack: Vec::new(),
            frames_decoded: 0,
            bytes_seen: 0,
            on_control: Box::new(on_control),
            on_data: Box::new(on_data),
        }
    }

    /// The portion of the buffer external I/O should write into next.
    pub fn buffer_write_slice(&mut self) -> &mut [u8] {
        &mut self.buffer[self.write_offset..]
    }

    /// Drive the pipeline after `written_count` bytes were placed into the
    /// slice returned by [`Self::buffer_write_slice`]. Returns whether more
    /// bytes are needed to finish the in-progress frame.
    pub fn decode(&mut self, written_count: usize) -> Result<bool> {
        self.bytes_seen += written_count as u64;
        let mut length = written_count + self.previous_remained_count;
        let mut need = 0usize;

        loop {
            let stage_before = self.step;
            let (new_length, stage_need) = self.step_once(length)?;
            length = new_length;
            if self.step == stage_before {
                need = stage_need;
                break;
            }
        }

        self.rebalance(written_count, length, need);
        Ok(self.message_data_length > 0)
    }

    /// Drop all in-progress state without reallocating the buffer.
    pub fn reset(&mut self) {
        self.write_offset = 0;
        self.decode_index = 0;
        self.previous_remained_count = 0;
        self.step = Stage::FrameLength;
        self.message_data_length = 0;
        self.msg_header = None;
        self.format = None;
        self.length_bits = 0;
        self.item_length = 0;
        self.stack.clear();
        self.frames_decoded = 0;
        self.bytes_seen = 0;
    }

    pub fn frames_decoded(&self) -> u64 {
        self.frames_decoded
    }

    fn readable(&self, length: usize) -> &[u8] {
        &self.buffer[self.decode_index..self.decode_index + length]
    }

    /// Attempt the current stage once. Returns the (possibly consumed)
    /// `length` and, only if the stage didn't advance, how many more bytes
    /// it needs.
    fn step_once(&mut self, length: usize) -> Result<(usize, usize)> {
        match self.step {
            Stage::FrameLength => self.stage_frame_length(length),
            Stage::Header => self.stage_header(length),
            Stage::ItemFormat => self.stage_item_format(length),
            Stage::ItemLength => self.stage_item_length(length),
            Stage::ItemPayload => self.stage_item_payload(length),
        }
    }

    fn stage_frame_length(&mut self, length: usize) -> Result<(usize, usize)> {
        const NEED: usize = 4;
        if length < NEED {
            return Ok((length, NEED - length));
        }
        let frame_len = BigEndian::read_u32(self.readable(NEED));
        self.decode_index += NEED;
        self.message_data_length = frame_len as i64;
        self.step = Stage::Header;
        Ok((length - NEED, 0))
    }

    fn stage_header(&mut self, length: usize) -> Result<(usize, usize)> {
        const NEED: usize = MessageHeader::SIZE_BYTES;
        if length < NEED {
            return Ok((length, NEED - length));
        }
        let parsed = header::parse_header(self.readable(NEED)).context("parsing message header")?;
        self.decode_index += NEED;
        let length = length - NEED;
        self.message_data_length -= NEED as i64;
        if self.message_data_length < 0 {
            return Err(self.corrupt("header length exceeds declared frame length"));
        }
        self.msg_header = Some(parsed);

        if self.message_data_length == 0 {
            self.emit_header_only(parsed);
            self.step = Stage::FrameLength;
        } else {
            self.step = Stage::ItemFormat;
        }
        Ok((length, 0))
    }

    fn stage_item_format(&mut self, length: usize) -> Result<(usize, usize)> {
        const NEED: usize = 1;
        if length < NEED {
            return Ok((length, NEED - length));
        }
        let byte = self.readable(NEED)[0];
        self.decode_index += NEED;
        let length = length - NEED;
        self.message_data_length -= NEED as i64;
        if self.message_data_length < 0 {
            return Err(self.corrupt("item format byte exceeds declared frame length"));
        }

        let length_bits = byte & 0x03;
        if length_bits == 0 {
            let err = BadFormatCode(byte);
            warn!("{err}");
            return Err(Error::new(err));
        }
        let format = SecsFormat::from_format_byte(byte).map_err(|e| {
            warn!("{e}");
            Error::new(e)
        })?;

        self.format = Some(format);
        self.length_bits = length_bits;
        self.step = Stage::ItemLength;
        Ok((length, 0))
    }

    fn stage_item_length(&mut self, length: usize) -> Result<(usize, usize)> {
        let need = self.length_bits as usize;
        if length < need {
            return Ok((length, need - length));
        }
        let mut raw = [0u8; 4];
        raw[4 - need..].copy_from_slice(self.readable(need));
        let item_length = u32::from_be_bytes(raw) as usize;
        self.decode_index += need;
        let length = length - need;
        self.message_data_length -= need as i64;
        if self.message_data_length < 0 {
            return Err(self.corrupt("item length field exceeds declared frame length"));
        }

        self.item_length = item_length;
        self.step = Stage::ItemPayload;
        Ok((length, 0))
    }

    fn stage_item_payload(&mut self, length: usize) -> Result<(usize, usize)> {
        let format = self.format.expect("format set by stage_item_format");

        if format.is_list() {
            if self.item_length == 0 {
                let empty = item::list(Vec::new()).expect("empty list always constructible");
                self.complete_item(empty)?;
            } else {
                if self.item_length > item::MAX_LIST_CHILDREN {
                    return Err(self.corrupt(&format!(
                        "list declares {} children, exceeds {}",
                        self.item_length,
                        item::MAX_LIST_CHILDREN
                    )));
                }
                self.stack.push(ListBuilder {
                    capacity: self.item_length,
                    children: Vec::with_capacity(self.item_length),
                });
                self.step = Stage::ItemFormat;
            }
            return Ok((length, 0));
        }

        let need = self.item_length;
        if length < need {
            return Ok((length, need - length));
        }
        let payload_item = decode_leaf_payload(format, self.readable(need))?;
        self.decode_index += need;
        let length = length - need;
        self.message_data_length -= need as i64;
        if self.message_data_length < 0 {
            return Err(self.corrupt("item payload exceeds declared frame length"));
        }

        self.complete_item(payload_item)?;
        Ok((length, 0))
    }

    /// Hand a just-decoded leaf/empty-list item to its parent list builder,
    /// or, if the stack is empty, emit it as the message root.
    fn complete_item(&mut self, item: Item) -> Result<()> {
        if self.stack.is_empty() {
            self.emit_data_message(item);
            self.step = Stage::FrameLength;
            return Ok(());
        }

        let mut finished = item;
        loop {
            let top = self.stack.last_mut().expect("checked non-empty above");
            top.children.push(finished);
            if top.children.len() != top.capacity {
                self.step = Stage::ItemFormat;
                return Ok(());
            }
            let builder = self.stack.pop().expect("just matched capacity on top");
            let list_item = item::list(builder.children)?;
            if self.stack.is_empty() {
                self.emit_data_message(list_item);
                self.step = Stage::FrameLength;
                return Ok(());
            }
            finished = list_item;
        }
    }

    fn emit_header_only(&mut self, header: MessageHeader) {
        self.frames_decoded += 1;
        match header.message_type() {
            MessageType::Control => (self.on_control)(header),
            MessageType::Data => {
                let message =
                    SecsMessage::new(header.stream, header.function, header.reply_expected, String::new(), None);
                (self.on_data)(header, message);
            }
        }
        self.msg_header = None;
    }

    fn emit_data_message(&mut self, root: Item) {
        self.frames_decoded += 1;
        let header = self.msg_header.take().expect("header parsed before any item");
        let message = SecsMessage::new(
            header.stream,
            header.function,
            header.reply_expected,
            String::new(),
            Some(root),
        );
        (self.on_data)(header, message);
    }

    fn corrupt(&self, detail: &str) -> Error {
        let err = FrameCorrupt(detail.to_string());
        warn!("{err}");
        Error::new(err)
    }

    /// The single-entry-point buffer growth/compaction/reset algorithm.
    /// `length` is the leftover readable byte count after the stage loop
    /// stalled or drained; `need` is how many more bytes the stalled stage
    /// (if any) still requires.
    fn rebalance(&mut self, written_count: usize, length: usize, need: usize) {
        if length == 0 {
            self.write_offset = 0;
            self.decode_index = 0;
            self.previous_remained_count = 0;
            if need > self.buffer.len() {
                let new_cap = 2 * need;
                debug!("growing decode buffer to {new_cap} bytes (drained)");
                self.buffer = vec![0u8; new_cap];
            }
            return;
        }

        self.write_offset += written_count;
        let required = length + need;
        let capacity = self.buffer.len();

        if required > capacity {
            let new_cap = std::cmp::max(self.message_data_length.max(0) as usize / 2, required) * 2;
            debug!("growing decode buffer to {new_cap} bytes, preserving {length} tail bytes");
            let mut new_buffer = vec![0u8; new_cap];
            new_buffer[..length].copy_from_slice(&self.buffer[self.decode_index..self.decode_index + length]);
            self.buffer = new_buffer;
            self.write_offset = length;
            self.decode_index = 0;
        } else if required > capacity - self.write_offset {
            debug!("compacting decode buffer, {length} tail bytes");
            self.buffer.copy_within(self.decode_index..self.decode_index + length, 0);
            self.write_offset = length;
            self.decode_index = 0;
        }

        self.previous_remained_count = length;
    }
}

macro_rules! decode_be_array {
    ($bytes:expr, $t:ty, $size:expr) => {
        $bytes
            .chunks_exact($size)
            .map(|c| <$t>::from_be_bytes(c.try_into().expect("chunks_exact guarantees size")))
            .collect::<Vec<$t>>()
    };
}

/// Decode one leaf item's wire payload bytes (everything but List, which
/// the stage machine handles via the builder stack).
fn decode_leaf_payload(format: SecsFormat, bytes: &[u8]) -> Result<Item> {
    match format {
        SecsFormat::List => unreachable!("lists are assembled via the builder stack"),
        SecsFormat::Binary => item::binary(bytes.to_vec()),
        SecsFormat::U1 => item::u1(bytes.to_vec()),
        SecsFormat::Boolean => item::boolean(bytes.iter().map(|&b| b != 0).collect()),
        SecsFormat::Ascii => {
            let mut text = String::with_capacity(bytes.len());
            for &b in bytes {
                text.push(b as char);
            }
            item::ascii(text)
        }
        SecsFormat::Jis8 => {
            let text = jis8::decode(bytes).context("decoding jis8 item payload")?;
            item::jis8(text)
        }
        SecsFormat::I1 => item::i1(bytes.iter().map(|&b| b as i8).collect()),
        SecsFormat::I2 => item::i2(decode_be_array!(bytes, i16, 2)),
        SecsFormat::I4 => item::i4(decode_be_array!(bytes, i32, 4)),
        SecsFormat::I8 => item::i8(decode_be_array!(bytes, i64, 8)),
        SecsFormat::U2 => item::u2(decode_be_array!(bytes, u16, 2)),
        SecsFormat::U4 => item::u4(decode_be_array!(bytes, u32, 4)),
        SecsFormat::U8 => item::u8(decode_be_array!(bytes, u64, 8)),
        SecsFormat::F4 => item::f4(decode_be_array!(bytes, f32, 4)),
        SecsFormat::F8 => item::f8(decode_be_array!(bytes, f64, 8)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn recording_decoder(initial_bytes: usize) -> (StreamDecoder, Arc<Mutex<Vec<MessageHeader>>>, Arc<Mutex<Vec<SecsMessage>>>) {
        let controls = Arc::new(Mutex::new(Vec::new()));
        let datas = Arc::new(Mutex::new(Vec::new()));
        let controls_clone = controls.clone();
        let datas_clone = datas.clone();
        let decoder = StreamDecoder::new(
            initial_bytes,
            move |h| controls_clone.lock().unwrap().push(h),
            move |_h, m| datas_clone.lock().unwrap().push(m),
        );
        (decoder, controls, datas)
    }

    fn feed_all(decoder: &mut StreamDecoder, bytes: &[u8]) {
        let slice = decoder.buffer_write_slice();
        slice[..bytes.len()].copy_from_slice(bytes);
        decoder.decode(bytes.len()).unwrap();
    }

    #[test]
    fn header_only_data_message() {
        #[rustfmt::skip]
        let frame: [u8; 14] = [
            0x00, 0x00, 0x00, 0x0A,
            0x00, 0x01, 0x81, 0x0D,
            0x00, 0x00,
            0x00, 0x00, 0x00, 0x01,
        ];
        let (mut decoder, controls, datas) = recording_decoder(256);
        feed_all(&mut decoder, &frame);

        assert!(controls.lock().unwrap().is_empty());
        let datas = datas.lock().unwrap();
        assert_eq!(datas.len(), 1);
        assert_eq!(datas[0].stream, 1);
        assert_eq!(datas[0].function, 13);
        assert!(datas[0].reply_expected);
        assert!(datas[0].root.is_none());
    }

    #[test]
    fn single_ascii_item() {
        #[rustfmt::skip]
        let frame: [u8; 16] = [
            0x00, 0x00, 0x00, 0x12,
            0x00, 0x00, 0x01, 0x02,
            0x00, 0x00, 0x00, 0x00,
            0x00, 0x02,
            0x41, 0x06,
        ];
        let mut full = frame.to_vec();
        full.extend_from_slice(b"Hello!");

        let (mut decoder, _controls, datas) = recording_decoder(256);
        feed_all(&mut decoder, &full);

        let datas = datas.lock().unwrap();
        assert_eq!(datas.len(), 1);
        assert_eq!(datas[0].stream, 1);
        assert_eq!(datas[0].function, 2);
        assert_eq!(datas[0].root.as_ref().unwrap().as_ascii().unwrap(), "Hello!");
    }

    #[test]
    fn nested_list() {
        #[rustfmt::skip]
        let tree: [u8; 8] = [0x01, 0x02, 0xA9, 0x02, 0x12, 0x34, 0x01, 0x00];
        let payload_len = (header::MessageHeader::SIZE_BYTES + tree.len()) as u32;
        let mut frame = Vec::new();
        frame.extend_from_slice(&payload_len.to_be_bytes());
        frame.extend_from_slice(&[0x00, 0x00, 0x01, 0x03, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);
        frame.extend_from_slice(&tree);

        let (mut decoder, _controls, datas) = recording_decoder(256);
        feed_all(&mut decoder, &frame);

        let datas = datas.lock().unwrap();
        let root = datas[0].root.as_ref().unwrap();
        let children = root.children().unwrap();
        assert_eq!(children.len(), 2);
        assert_eq!(children[0].as_u2().unwrap(), &[0x1234]);
        assert_eq!(children[1].count(), 0);
    }

    #[test]
    fn split_delivery_one_byte_at_a_time() {
        #[rustfmt::skip]
        let tree: [u8; 8] = [0x01, 0x02, 0xA9, 0x02, 0x12, 0x34, 0x01, 0x00];
        let payload_len = (header::MessageHeader::SIZE_BYTES + tree.len()) as u32;
        let mut frame = Vec::new();
        frame.extend_from_slice(&payload_len.to_be_bytes());
        frame.extend_from_slice(&[0x00, 0x00, 0x01, 0x03, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);
        frame.extend_from_slice(&tree);

        let (mut decoder, _controls, datas) = recording_decoder(256);
        for (i, &byte) in frame.iter().enumerate() {
            let slice = decoder.buffer_write_slice();
            slice[0] = byte;
            let need_more = decoder.decode(1).unwrap();
            if i + 1 < frame.len() {
                assert!(need_more);
                assert!(datas.lock().unwrap().is_empty());
            }
        }
        assert_eq!(datas.lock().unwrap().len(), 1);
    }

    #[test]
    fn control_message_dispatch() {
        #[rustfmt::skip]
        let frame: [u8; 14] = [
            0x00, 0x00, 0x00, 0x0A,
            0xFF, 0xFF, 0x00, 0x00,
            0x00, 0x05,
            0x00, 0x00, 0x00, 0x07,
        ];
        let (mut decoder, controls, datas) = recording_decoder(256);
        feed_all(&mut decoder, &frame);

        assert!(datas.lock().unwrap().is_empty());
        let controls = controls.lock().unwrap();
        assert_eq!(controls.len(), 1);
        assert_eq!(controls[0].stype, 5);
    }

    #[test]
    fn buffer_grows_to_fit_a_large_declared_frame() {
        let (mut decoder, _controls, datas) = recording_decoder(64);

        // A single Binary item (lengthBits=2, since the value exceeds 0xFF
        // bytes) whose declared frame payload (the u32 length prefix) is
        // exactly 10_000 bytes.
        let target_payload_len = 10_000usize;
        let item_value_len = target_payload_len - header::MessageHeader::SIZE_BYTES - 3;
        let mut tree = Vec::new();
        tree.push(0x22); // Binary, lengthBits=2
        tree.extend_from_slice(&(item_value_len as u16).to_be_bytes());
        tree.extend(std::iter::repeat(0xABu8).take(item_value_len));
        assert_eq!(header::MessageHeader::SIZE_BYTES + tree.len(), target_payload_len);

        let mut frame = Vec::new();
        let payload_len = (header::MessageHeader::SIZE_BYTES + tree.len()) as u32;
        frame.extend_from_slice(&payload_len.to_be_bytes());
        frame.extend_from_slice(&[0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);
        frame.extend_from_slice(&tree);

        let first_chunk = 40usize;
        {
            let slice = decoder.buffer_write_slice();
            slice[..first_chunk].copy_from_slice(&frame[..first_chunk]);
        }
        let need_more = decoder.decode(first_chunk).unwrap();
        assert!(need_more);
        assert!(datas.lock().unwrap().is_empty());
        assert!(decoder.buffer.len() >= 10_000);

        let remaining = &frame[first_chunk..];
        {
            let slice = decoder.buffer_write_slice();
            assert!(slice.len() >= remaining.len());
            slice[..remaining.len()].copy_from_slice(remaining);
        }
        decoder.decode(remaining.len()).unwrap();

        let datas = datas.lock().unwrap();
        assert_eq!(datas.len(), 1);
        assert_eq!(datas[0].root.as_ref().unwrap().as_binary().unwrap().len(), item_value_len);
    }
}

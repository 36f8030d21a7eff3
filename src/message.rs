//! The decoded data-message payload (S, F, optional item tree) and the
//! whole-frame encoder.

use bytes::{BufMut, Bytes, BytesMut};

use crate::header::MessageHeader;
use crate::item::Item;

/// A decoded SECS-II data message: stream/function plus an optional root
/// item. `root` is `None` for header-only messages (payload length == 10).
/// `name` is a caller-assigned label with no wire representation; the
/// decoder always emits `""`.
#[derive(Debug, Clone, PartialEq)]
pub struct SecsMessage {
    pub stream: u8,
    pub function: u8,
    pub reply_expected: bool,
    pub name: String,
    pub root: Option<Item>,
}

impl SecsMessage {
    pub fn new(stream: u8, function: u8, reply_expected: bool, name: String, root: Option<Item>) -> SecsMessage {
        SecsMessage {
            stream,
            function,
            reply_expected,
            name,
            root,
        }
    }

    /// Encode this message's header and item tree into scatter/gather
    /// fragments, ready to be prepended with the 4-byte length.
    pub fn encode(&self, header: &MessageHeader) -> Vec<Bytes> {
        let mut fragments = Vec::with_capacity(2);
        fragments.push(header.encode());
        if let Some(root) = &self.root {
            root.collect_fragments(&mut fragments);
        }
        fragments
    }
}

/// Build the full on-wire frame for a message: `u32_be(payloadLen) ||
/// header || itemTree`. `header`'s `stype` should be 0 for a data message.
pub fn encode_frame(header: &MessageHeader, root: Option<&Item>) -> Vec<Bytes> {
    let mut item_fragments = Vec::new();
    if let Some(root) = root {
        root.collect_fragments(&mut item_fragments);
    }
    let payload_len: usize =
        MessageHeader::SIZE_BYTES + item_fragments.iter().map(|b| b.len()).sum::<usize>();

    let mut prefix = BytesMut::with_capacity(4 + MessageHeader::SIZE_BYTES);
    prefix.put_u32(payload_len as u32);
    header.write_to(&mut prefix);

    let mut frame = Vec::with_capacity(1 + item_fragments.len());
    frame.push(prefix.freeze());
    frame.extend(item_fragments);
    frame
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item;

    #[test]
    fn header_only_message_encodes_to_fourteen_bytes() {
        let header = MessageHeader {
            device_id: 1,
            stream: 1,
            reply_expected: true,
            function: 13,
            ptype: 0,
            stype: 0,
            system_bytes: 1,
        };
        let frame = encode_frame(&header, None);
        let total: usize = frame.iter().map(|b| b.len()).sum();
        assert_eq!(total, 14);
    }

    #[test]
    fn message_with_root_includes_item_fragments() {
        let header = MessageHeader {
            device_id: 0,
            stream: 1,
            reply_expected: false,
            function: 2,
            ptype: 0,
            stype: 0,
            system_bytes: 0,
        };
        let root = item::ascii("Hello!").unwrap();
        let frame = encode_frame(&header, Some(&root));
        let total: usize = frame.iter().map(|b| b.len()).sum();
        assert_eq!(total, 4 + 10 + root.encoded_len());
    }
}

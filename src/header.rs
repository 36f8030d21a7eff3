//! The 10-byte SECS-II/HSMS message header and SType-derived message kind.

use anyhow::{Error, Result};
use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, Bytes, BytesMut};

use crate::error::FrameCorrupt;

/// Whether a message's SType marks it as carrying SECS-II data (S/F + item
/// tree) or as an HSMS control message (session management).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Data,
    Control,
}

/// HSMS control message kind, per SEMI E37's SType assignment. The crate
/// only labels these; reacting to them (the select/deselect/linktest
/// session state machine) is the caller's job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlType {
    SelectReq,
    SelectRsp,
    DeselectReq,
    DeselectRsp,
    LinktestReq,
    LinktestRsp,
    RejectReq,
    SeparateReq,
    Unknown(u8),
}

impl ControlType {
    pub fn from_stype(stype: u8) -> ControlType {
        match stype {
            1 => ControlType::SelectReq,
            2 => ControlType::SelectRsp,
            3 => ControlType::DeselectReq,
            4 => ControlType::DeselectRsp,
            5 => ControlType::LinktestReq,
            6 => ControlType::LinktestRsp,
            7 => ControlType::RejectReq,
            9 => ControlType::SeparateReq,
            other => ControlType::Unknown(other),
        }
    }
}

/// Fixed 10-byte frame header: device id, stream/function (with the reply
/// bit folded into the stream byte on the wire), PType, SType, and the
/// system bytes / transaction id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub device_id: u16,
    pub stream: u8,
    pub reply_expected: bool,
    pub function: u8,
    pub ptype: u8,
    pub stype: u8,
    pub system_bytes: u32,
}

impl MessageHeader {
    pub const SIZE_BYTES: usize = 10;

    pub fn message_type(&self) -> MessageType {
        if self.stype == 0 {
            MessageType::Data
        } else {
            MessageType::Control
        }
    }

    /// `None` for data messages (SType == 0); `Some` otherwise.
    pub fn control_type(&self) -> Option<ControlType> {
        if self.stype == 0 {
            None
        } else {
            Some(ControlType::from_stype(self.stype))
        }
    }

    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u16(self.device_id);
        let s_byte = if self.reply_expected {
            self.stream | 0x80
        } else {
            self.stream & 0x7F
        };
        buf.put_u8(s_byte);
        buf.put_u8(self.function);
        buf.put_u8(self.ptype);
        buf.put_u8(self.stype);
        buf.put_u32(self.system_bytes);
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::SIZE_BYTES);
        self.write_to(&mut buf);
        buf.freeze()
    }
}

/// Parse a header from exactly [`MessageHeader::SIZE_BYTES`] bytes.
pub fn parse_header(buf: &[u8]) -> Result<MessageHeader> {
    if buf.len() < MessageHeader::SIZE_BYTES {
        return Err(Error::new(FrameCorrupt(format!(
            "header requires {} bytes, got {}",
            MessageHeader::SIZE_BYTES,
            buf.len()
        ))));
    }
    let device_id = BigEndian::read_u16(&buf[0..2]);
    let s_byte = buf[2];
    let system_bytes = BigEndian::read_u32(&buf[6..10]);
    Ok(MessageHeader {
        device_id,
        stream: s_byte & 0x7F,
        reply_expected: s_byte & 0x80 != 0,
        function: buf[3],
        ptype: buf[4],
        stype: buf[5],
        system_bytes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_reply_expected_header() {
        #[rustfmt::skip]
        let bytes: [u8; 10] = [
            0x00, 0x01, 0x81, 0x0D,
            0x00, 0x00,
            0x00, 0x00, 0x00, 0x01,
        ];
        let header = parse_header(&bytes).unwrap();
        assert_eq!(header.device_id, 1);
        assert_eq!(header.stream, 1);
        assert!(header.reply_expected);
        assert_eq!(header.function, 13);
        assert_eq!(header.stype, 0);
        assert_eq!(header.system_bytes, 1);
        assert_eq!(header.message_type(), MessageType::Data);
    }

    #[test]
    fn round_trips_through_encode() {
        let header = MessageHeader {
            device_id: 42,
            stream: 1,
            reply_expected: true,
            function: 13,
            ptype: 0,
            stype: 0,
            system_bytes: 7,
        };
        let encoded = header.encode();
        assert_eq!(parse_header(&encoded).unwrap(), header);
    }

    #[test]
    fn control_type_matches_stype() {
        let header = MessageHeader {
            device_id: 0xFFFF,
            stream: 0,
            reply_expected: false,
            function: 0,
            ptype: 0,
            stype: 5,
            system_bytes: 7,
        };
        assert_eq!(header.message_type(), MessageType::Control);
        assert_eq!(header.control_type(), Some(ControlType::LinktestReq));
    }
}

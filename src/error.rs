use thiserror::Error;

/// An item's encoded value exceeds the 3-byte length field's range (0xFFFFFF bytes).
#[derive(Error, Debug)]
#[error("item value is {actual_bytes} bytes, exceeds the 0xFFFFFF length field limit")]
pub struct ItemOversize {
    pub actual_bytes: usize,
}

/// Caller asked for an item's value as a format it isn't.
#[derive(Error, Debug)]
#[error("item has format {actual:?}, not the requested {expected:?}")]
pub struct WrongFormat {
    pub expected: crate::format::SecsFormat,
    pub actual: crate::format::SecsFormat,
}

/// An item header's format byte didn't match any defined SECS-II format code.
#[derive(Error, Debug)]
#[error("format byte 0x{0:02X} doesn't match any defined SECS-II format code")]
pub struct BadFormatCode(pub u8);

/// A list item claimed more children than the decoder is willing to hold.
#[derive(Error, Debug)]
#[error("list item declares {declared} children, exceeds the {limit} limit")]
pub struct ListOverflow {
    pub declared: usize,
    pub limit: usize,
}

/// The frame's 4-byte length prefix, 10-byte header, or item tree didn't
/// parse into a well-formed message.
#[derive(Error, Debug)]
#[error("malformed frame: {0}")]
pub struct FrameCorrupt(pub String);

/// A byte sequence isn't valid for the text format being encoded/decoded.
#[derive(Error, Debug)]
#[error("invalid {format:?} text at byte offset {offset}")]
pub struct InvalidText {
    pub format: crate::format::SecsFormat,
    pub offset: usize,
}

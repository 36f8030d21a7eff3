//! The recursive SECS-II value tree: lists, text, and typed numeric arrays.

use std::sync::{Arc, OnceLock};

use anyhow::{Error, Result};
use bytes::{BufMut, Bytes, BytesMut};
use once_cell::sync::Lazy;

use crate::error::{InvalidText, ItemOversize, ListOverflow, WrongFormat};
use crate::format::{length_bits_for, SecsFormat};
use crate::jis8;

/// A list's declared child count is a single wire byte; more than this
/// can never be represented on the wire.
pub const MAX_LIST_CHILDREN: usize = 255;

#[derive(Debug, Clone)]
enum ItemPayload {
    List(Arc<[Item]>),
    Binary(Arc<[u8]>),
    Boolean(Arc<[bool]>),
    Ascii(Arc<str>),
    /// Pre-validated, already-encoded JIS8 bytes; decoded to a `String`
    /// lazily by accessors.
    Jis8(Arc<[u8]>),
    I1(Arc<[i8]>),
    I2(Arc<[i16]>),
    I4(Arc<[i32]>),
    I8(Arc<[i64]>),
    U1(Arc<[u8]>),
    U2(Arc<[u16]>),
    U4(Arc<[u32]>),
    U8(Arc<[u64]>),
    F4(Arc<[f32]>),
    F8(Arc<[f64]>),
}

/// Manual: `F4`/`F8` compare bit-for-bit rather than via `f32`/`f64`'s
/// `PartialEq`, so `NaN` equals itself and `+0.0` doesn't equal `-0.0` —
/// matching the wire's byte-equal rule for numeric items.
impl PartialEq for ItemPayload {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ItemPayload::List(a), ItemPayload::List(b)) => a == b,
            (ItemPayload::Binary(a), ItemPayload::Binary(b)) => a == b,
            (ItemPayload::Boolean(a), ItemPayload::Boolean(b)) => a == b,
            (ItemPayload::Ascii(a), ItemPayload::Ascii(b)) => a == b,
            (ItemPayload::Jis8(a), ItemPayload::Jis8(b)) => a == b,
            (ItemPayload::I1(a), ItemPayload::I1(b)) => a == b,
            (ItemPayload::I2(a), ItemPayload::I2(b)) => a == b,
            (ItemPayload::I4(a), ItemPayload::I4(b)) => a == b,
            (ItemPayload::I8(a), ItemPayload::I8(b)) => a == b,
            (ItemPayload::U1(a), ItemPayload::U1(b)) => a == b,
            (ItemPayload::U2(a), ItemPayload::U2(b)) => a == b,
            (ItemPayload::U4(a), ItemPayload::U4(b)) => a == b,
            (ItemPayload::U8(a), ItemPayload::U8(b)) => a == b,
            (ItemPayload::F4(a), ItemPayload::F4(b)) => {
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.to_bits() == y.to_bits())
            }
            (ItemPayload::F8(a), ItemPayload::F8(b)) => {
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.to_bits() == y.to_bits())
            }
            _ => false,
        }
    }
}

/// A SECS-II item: a tagged value, either a leaf (text or numeric array)
/// or a `List` of child items.
#[derive(Debug, Clone)]
pub struct Item {
    format: SecsFormat,
    payload: ItemPayload,
    raw: Arc<OnceLock<Bytes>>,
}

impl PartialEq for Item {
    fn eq(&self, other: &Self) -> bool {
        self.format == other.format && self.payload == other.payload
    }
}

impl Item {
    fn new(format: SecsFormat, payload: ItemPayload) -> Item {
        Item {
            format,
            payload,
            raw: Arc::new(OnceLock::new()),
        }
    }

    pub fn format(&self) -> SecsFormat {
        self.format
    }

    /// Child count (List) or element count (everything else).
    pub fn count(&self) -> usize {
        match &self.payload {
            ItemPayload::List(v) => v.len(),
            ItemPayload::Binary(v) | ItemPayload::U1(v) => v.len(),
            ItemPayload::Boolean(v) => v.len(),
            ItemPayload::Ascii(s) => s.len(),
            ItemPayload::Jis8(v) => v.len(),
            ItemPayload::I1(v) => v.len(),
            ItemPayload::I2(v) => v.len(),
            ItemPayload::I4(v) => v.len(),
            ItemPayload::I8(v) => v.len(),
            ItemPayload::U2(v) => v.len(),
            ItemPayload::U4(v) => v.len(),
            ItemPayload::U8(v) => v.len(),
            ItemPayload::F4(v) => v.len(),
            ItemPayload::F8(v) => v.len(),
        }
    }

    fn value_byte_length(&self) -> usize {
        match &self.payload {
            ItemPayload::List(v) => v.len(),
            ItemPayload::Binary(v) | ItemPayload::U1(v) => v.len(),
            ItemPayload::Boolean(v) => v.len(),
            ItemPayload::Ascii(s) => s.len(),
            ItemPayload::Jis8(v) => v.len(),
            ItemPayload::I1(v) => v.len() * self.format.element_size(),
            ItemPayload::I2(v) => v.len() * self.format.element_size(),
            ItemPayload::I4(v) => v.len() * self.format.element_size(),
            ItemPayload::I8(v) => v.len() * self.format.element_size(),
            ItemPayload::U2(v) => v.len() * self.format.element_size(),
            ItemPayload::U4(v) => v.len() * self.format.element_size(),
            ItemPayload::U8(v) => v.len() * self.format.element_size(),
            ItemPayload::F4(v) => v.len() * self.format.element_size(),
            ItemPayload::F8(v) => v.len() * self.format.element_size(),
        }
    }

    pub fn children(&self) -> Result<&[Item], WrongFormat> {
        match &self.payload {
            ItemPayload::List(v) => Ok(v),
            _ => Err(WrongFormat {
                expected: SecsFormat::List,
                actual: self.format,
            }),
        }
    }

    pub fn as_ascii(&self) -> Result<&str, WrongFormat> {
        match &self.payload {
            ItemPayload::Ascii(s) => Ok(s),
            _ => Err(WrongFormat {
                expected: SecsFormat::Ascii,
                actual: self.format,
            }),
        }
    }

    pub fn as_jis8_string(&self) -> Result<String, WrongFormat> {
        match &self.payload {
            ItemPayload::Jis8(bytes) => {
                Ok(jis8::decode(bytes).expect("jis8 payload validated at construction"))
            }
            _ => Err(WrongFormat {
                expected: SecsFormat::Jis8,
                actual: self.format,
            }),
        }
    }

    /// Text accessor spanning both text formats, for callers that don't
    /// care which one they got.
    pub fn as_text(&self) -> Result<String, WrongFormat> {
        match &self.payload {
            ItemPayload::Ascii(s) => Ok(s.to_string()),
            ItemPayload::Jis8(_) => self.as_jis8_string(),
            _ => Err(WrongFormat {
                expected: SecsFormat::Ascii,
                actual: self.format,
            }),
        }
    }

    /// Asymmetric pattern match: `self` is the candidate value, `template`
    /// is the pattern (count == 0 on any field of the template means
    /// wildcard at that position).
    pub fn matches(&self, template: &Item) -> bool {
        if self.format != template.format {
            return false;
        }
        match (&self.payload, &template.payload) {
            (ItemPayload::List(a), ItemPayload::List(b)) => {
                if b.is_empty() {
                    return true;
                }
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.matches(y))
            }
            (ItemPayload::Ascii(a), ItemPayload::Ascii(b)) => b.is_empty() || a == b,
            (ItemPayload::Jis8(a), ItemPayload::Jis8(b)) => b.is_empty() || a == b,
            (ItemPayload::Binary(a), ItemPayload::Binary(b)) => b.is_empty() || a == b,
            (ItemPayload::U1(a), ItemPayload::U1(b)) => b.is_empty() || a == b,
            (ItemPayload::Boolean(a), ItemPayload::Boolean(b)) => b.is_empty() || a == b,
            (ItemPayload::I1(a), ItemPayload::I1(b)) => b.is_empty() || a == b,
            (ItemPayload::I2(a), ItemPayload::I2(b)) => b.is_empty() || a == b,
            (ItemPayload::I4(a), ItemPayload::I4(b)) => b.is_empty() || a == b,
            (ItemPayload::I8(a), ItemPayload::I8(b)) => b.is_empty() || a == b,
            (ItemPayload::U2(a), ItemPayload::U2(b)) => b.is_empty() || a == b,
            (ItemPayload::U4(a), ItemPayload::U4(b)) => b.is_empty() || a == b,
            (ItemPayload::U8(a), ItemPayload::U8(b)) => b.is_empty() || a == b,
            (ItemPayload::F4(a), ItemPayload::F4(b)) => {
                b.is_empty() || (a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.to_bits() == y.to_bits()))
            }
            (ItemPayload::F8(a), ItemPayload::F8(b)) => {
                b.is_empty() || (a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.to_bits() == y.to_bits()))
            }
            _ => unreachable!("format already checked equal above"),
        }
    }

    /// Encoded length of this item alone (header + payload for a leaf;
    /// header only for a list — children are separate fragments).
    pub fn encoded_len(&self) -> usize {
        self.raw_bytes().len()
    }

    /// Header plus, for non-List items, the payload bytes in wire order.
    /// Memoized: computed once, then shared via the `Bytes` refcount.
    pub fn raw_bytes(&self) -> Bytes {
        self.raw.get_or_init(|| self.encode_self()).clone()
    }

    fn encode_self(&self) -> Bytes {
        let value_len = self.value_byte_length();
        // Factories validate this fits before an Item is ever constructed.
        let length_bits =
            length_bits_for(value_len).expect("value length validated at construction");
        let mut buf = BytesMut::with_capacity(1 + length_bits as usize + value_len);
        buf.put_u8((self.format.code() & 0xFC) | length_bits);
        let len_bytes = (value_len as u32).to_be_bytes();
        buf.extend_from_slice(&len_bytes[4 - length_bits as usize..]);

        match &self.payload {
            ItemPayload::List(_) => {}
            ItemPayload::Binary(v) | ItemPayload::U1(v) => buf.extend_from_slice(v),
            ItemPayload::Boolean(v) => buf.extend(v.iter().map(|&b| if b { 1u8 } else { 0u8 })),
            ItemPayload::Ascii(s) => buf.extend_from_slice(s.as_bytes()),
            ItemPayload::Jis8(bytes) => buf.extend_from_slice(bytes),
            ItemPayload::I1(v) => buf.extend(v.iter().flat_map(|n| n.to_be_bytes())),
            ItemPayload::I2(v) => buf.extend(v.iter().flat_map(|n| n.to_be_bytes())),
            ItemPayload::I4(v) => buf.extend(v.iter().flat_map(|n| n.to_be_bytes())),
            ItemPayload::I8(v) => buf.extend(v.iter().flat_map(|n| n.to_be_bytes())),
            ItemPayload::U2(v) => buf.extend(v.iter().flat_map(|n| n.to_be_bytes())),
            ItemPayload::U4(v) => buf.extend(v.iter().flat_map(|n| n.to_be_bytes())),
            ItemPayload::U8(v) => buf.extend(v.iter().flat_map(|n| n.to_be_bytes())),
            ItemPayload::F4(v) => buf.extend(v.iter().flat_map(|n| n.to_be_bytes())),
            ItemPayload::F8(v) => buf.extend(v.iter().flat_map(|n| n.to_be_bytes())),
        }
        buf.freeze()
    }

    /// Depth-first collection of this item's (and its descendants')
    /// pre-encoded byte fragments, in wire order.
    pub fn collect_fragments(&self, out: &mut Vec<Bytes>) {
        out.push(self.raw_bytes());
        if let ItemPayload::List(children) = &self.payload {
            for child in children.iter() {
                child.collect_fragments(out);
            }
        }
    }
}

macro_rules! numeric_accessors {
    ($($variant:ident => ($as_fn:ident, $first_fn:ident, $t:ty)),+ $(,)?) => {
        impl Item {
            $(
                pub fn $as_fn(&self) -> Result<&[$t], WrongFormat> {
                    match &self.payload {
                        ItemPayload::$variant(v) => Ok(v),
                        _ => Err(WrongFormat { expected: SecsFormat::$variant, actual: self.format }),
                    }
                }

                pub fn $first_fn(&self) -> Result<$t, WrongFormat> {
                    self.$as_fn()?.first().copied().ok_or(WrongFormat {
                        expected: SecsFormat::$variant,
                        actual: self.format,
                    })
                }
            )+
        }
    };
}

numeric_accessors! {
    I1 => (as_i1, first_i1, i8),
    I2 => (as_i2, first_i2, i16),
    I4 => (as_i4, first_i4, i32),
    I8 => (as_i8, first_i8, i64),
    U2 => (as_u2, first_u2, u16),
    U4 => (as_u4, first_u4, u32),
    U8 => (as_u8, first_u8, u64),
    F4 => (as_f4, first_f4, f32),
    F8 => (as_f8, first_f8, f64),
    U1 => (as_u1, first_u1, u8),
    Binary => (as_binary, first_binary, u8),
    Boolean => (as_boolean, first_boolean, bool),
}

macro_rules! empty_singleton {
    ($name:ident, $format:expr, $payload:expr) => {
        static $name: Lazy<Item> = Lazy::new(|| Item::new($format, $payload));
    };
}

empty_singleton!(EMPTY_LIST, SecsFormat::List, ItemPayload::List(Arc::from(Vec::new())));
empty_singleton!(EMPTY_BINARY, SecsFormat::Binary, ItemPayload::Binary(Arc::from(Vec::new())));
empty_singleton!(EMPTY_BOOLEAN, SecsFormat::Boolean, ItemPayload::Boolean(Arc::from(Vec::new())));
empty_singleton!(EMPTY_ASCII, SecsFormat::Ascii, ItemPayload::Ascii(Arc::from(String::new())));
empty_singleton!(EMPTY_JIS8, SecsFormat::Jis8, ItemPayload::Jis8(Arc::from(Vec::new())));
empty_singleton!(EMPTY_I1, SecsFormat::I1, ItemPayload::I1(Arc::from(Vec::new())));
empty_singleton!(EMPTY_I2, SecsFormat::I2, ItemPayload::I2(Arc::from(Vec::new())));
empty_singleton!(EMPTY_I4, SecsFormat::I4, ItemPayload::I4(Arc::from(Vec::new())));
empty_singleton!(EMPTY_I8, SecsFormat::I8, ItemPayload::I8(Arc::from(Vec::new())));
empty_singleton!(EMPTY_U1, SecsFormat::U1, ItemPayload::U1(Arc::from(Vec::new())));
empty_singleton!(EMPTY_U2, SecsFormat::U2, ItemPayload::U2(Arc::from(Vec::new())));
empty_singleton!(EMPTY_U4, SecsFormat::U4, ItemPayload::U4(Arc::from(Vec::new())));
empty_singleton!(EMPTY_U8, SecsFormat::U8, ItemPayload::U8(Arc::from(Vec::new())));
empty_singleton!(EMPTY_F4, SecsFormat::F4, ItemPayload::F4(Arc::from(Vec::new())));
empty_singleton!(EMPTY_F8, SecsFormat::F8, ItemPayload::F8(Arc::from(Vec::new())));

/// Build a `List` item. More than [`MAX_LIST_CHILDREN`] children is rejected.
pub fn list(children: Vec<Item>) -> Result<Item> {
    if children.is_empty() {
        return Ok(EMPTY_LIST.clone());
    }
    if children.len() > MAX_LIST_CHILDREN {
        return Err(Error::new(ListOverflow {
            declared: children.len(),
            limit: MAX_LIST_CHILDREN,
        }));
    }
    Ok(Item::new(SecsFormat::List, ItemPayload::List(Arc::from(children))))
}

fn check_value_len(format: SecsFormat, value_byte_length: usize) -> Result<()> {
    if length_bits_for(value_byte_length).is_none() {
        return Err(Error::new(ItemOversize {
            actual_bytes: value_byte_length,
        })
        .context(format!("building a {format:?} item")));
    }
    Ok(())
}

pub fn binary(bytes: impl Into<Vec<u8>>) -> Result<Item> {
    let bytes = bytes.into();
    if bytes.is_empty() {
        return Ok(EMPTY_BINARY.clone());
    }
    check_value_len(SecsFormat::Binary, bytes.len())?;
    Ok(Item::new(SecsFormat::Binary, ItemPayload::Binary(Arc::from(bytes))))
}

pub fn boolean(values: Vec<bool>) -> Result<Item> {
    if values.is_empty() {
        return Ok(EMPTY_BOOLEAN.clone());
    }
    check_value_len(SecsFormat::Boolean, values.len())?;
    Ok(Item::new(SecsFormat::Boolean, ItemPayload::Boolean(Arc::from(values))))
}

pub fn ascii(text: impl AsRef<str>) -> Result<Item> {
    let text = text.as_ref();
    if text.is_empty() {
        return Ok(EMPTY_ASCII.clone());
    }
    for (offset, ch) in text.chars().enumerate() {
        if !ch.is_ascii() {
            return Err(Error::new(InvalidText {
                format: SecsFormat::Ascii,
                offset,
            }));
        }
    }
    check_value_len(SecsFormat::Ascii, text.len())?;
    Ok(Item::new(SecsFormat::Ascii, ItemPayload::Ascii(Arc::from(text))))
}

pub fn jis8(text: impl AsRef<str>) -> Result<Item> {
    let text = text.as_ref();
    if text.is_empty() {
        return Ok(EMPTY_JIS8.clone());
    }
    let bytes = jis8::encode(text)?;
    check_value_len(SecsFormat::Jis8, bytes.len())?;
    Ok(Item::new(SecsFormat::Jis8, ItemPayload::Jis8(Arc::from(bytes))))
}

macro_rules! numeric_factory {
    ($fn_name:ident, $variant:ident, $empty:ident, $t:ty) => {
        pub fn $fn_name(values: Vec<$t>) -> Result<Item> {
            if values.is_empty() {
                return Ok($empty.clone());
            }
            check_value_len(SecsFormat::$variant, values.len() * SecsFormat::$variant.element_size())?;
            Ok(Item::new(SecsFormat::$variant, ItemPayload::$variant(Arc::from(values))))
        }
    };
}

numeric_factory!(u1, U1, EMPTY_U1, u8);
numeric_factory!(u2, U2, EMPTY_U2, u16);
numeric_factory!(u4, U4, EMPTY_U4, u32);
numeric_factory!(u8, U8, EMPTY_U8, u64);
numeric_factory!(i1, I1, EMPTY_I1, i8);
numeric_factory!(i2, I2, EMPTY_I2, i16);
numeric_factory!(i4, I4, EMPTY_I4, i32);
numeric_factory!(i8, I8, EMPTY_I8, i64);
numeric_factory!(f4, F4, EMPTY_F4, f32);
numeric_factory!(f8, F8, EMPTY_F8, f64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_factories_return_the_interned_instance() {
        assert_eq!(binary(Vec::new()).unwrap(), EMPTY_BINARY.clone());
        assert_eq!(u2(Vec::new()).unwrap(), EMPTY_U2.clone());
        assert_eq!(list(Vec::new()).unwrap(), EMPTY_LIST.clone());
    }

    #[test]
    fn list_rejects_more_than_255_children() {
        let children: Vec<Item> = (0..=MAX_LIST_CHILDREN)
            .map(|_| binary(vec![1]).unwrap())
            .collect();
        assert!(list(children).is_err());
    }

    #[test]
    fn list_header_is_two_bytes() {
        let l = list(vec![binary(vec![1, 2, 3]).unwrap()]).unwrap();
        assert_eq!(l.raw_bytes(), Bytes::from_static(&[0x01, 0x01]));
    }

    #[test]
    fn ascii_item_encodes_header_and_payload() {
        let item = ascii("Hello!").unwrap();
        let raw = item.raw_bytes();
        assert_eq!(&raw[..], b"\x41\x06Hello!");
        assert_eq!(item.as_ascii().unwrap(), "Hello!");
    }

    #[test]
    fn u2_array_is_big_endian_on_wire() {
        let item = u2(vec![0x1234]).unwrap();
        assert_eq!(&item.raw_bytes()[..], &[0xA9, 0x02, 0x12, 0x34]);
        assert_eq!(item.as_u2().unwrap(), &[0x1234]);
        assert_eq!(item.first_u2().unwrap(), 0x1234);
    }

    #[test]
    fn wrong_format_accessor_fails() {
        let item = u2(vec![1]).unwrap();
        assert!(item.as_ascii().is_err());
        assert!(item.children().is_err());
    }

    #[test]
    fn matches_wildcard_and_positional_recursion() {
        let wildcard_u2 = u2(Vec::new()).unwrap();
        assert!(u2(vec![42]).unwrap().matches(&wildcard_u2));

        let template = list(vec![wildcard_u2.clone(), ascii("x").unwrap()]).unwrap();
        let value = list(vec![u2(vec![7]).unwrap(), ascii("x").unwrap()]).unwrap();
        assert!(value.matches(&template));

        let mismatched = list(vec![u2(vec![7]).unwrap(), ascii("y").unwrap()]).unwrap();
        assert!(!mismatched.matches(&template));
    }

    #[test]
    fn float_items_compare_byte_equal_not_value_equal() {
        let nan_a = f4(vec![f32::NAN]).unwrap();
        let nan_b = f4(vec![f32::NAN]).unwrap();
        assert_eq!(nan_a, nan_b);

        let pos_zero = f8(vec![0.0]).unwrap();
        let neg_zero = f8(vec![-0.0]).unwrap();
        assert_ne!(pos_zero, neg_zero);
        assert!(!pos_zero.matches(&neg_zero));
    }

    #[test]
    fn jis8_round_trips_through_item() {
        let item = jis8("\u{00A5}100").unwrap();
        assert_eq!(item.as_jis8_string().unwrap(), "\u{00A5}100");
    }

    #[test]
    fn oversized_item_is_rejected() {
        let huge = vec![0u8; 0x100_0001];
        assert!(binary(huge).is_err());
    }
}

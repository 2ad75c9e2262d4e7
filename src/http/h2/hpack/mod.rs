//! HPACK header compression (RFC 7541)
//!
//! One [`Encoder`] and one [`Decoder`] exist per connection, each with its
//! own [`DynamicTable`]. Both must see header blocks in the exact order they
//! travel on the wire, so the connection encodes blocks when frames are
//! emitted and decodes every block it receives, including blocks for
//! streams it is about to refuse.

pub mod huffman;
pub mod table;

pub use table::{DynamicTable, TableMatch, STATIC_TABLE};

use super::error::{Error, Result};
use super::DEFAULT_HEADER_TABLE_SIZE;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use table::entry_size;

/// Cookies shorter than this are never indexed (RFC 7541 Section 7.1.3)
const SHORT_COOKIE_LEN: usize = 20;

/// Fields that change per response and would only churn the table
const VOLATILE_NAMES: &[&str] = &[
    "content-length",
    "date",
    "etag",
    "last-modified",
    "age",
    "set-cookie",
];

/// One header field
#[derive(Clone, PartialEq, Eq)]
pub struct HeaderField {
    pub name: String,
    pub value: String,
    /// Never enter a dynamic table, on this hop or any later one
    pub sensitive: bool,
}

impl HeaderField {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        HeaderField {
            name: name.into(),
            value: value.into(),
            sensitive: false,
        }
    }

    pub fn sensitive(name: impl Into<String>, value: impl Into<String>) -> Self {
        HeaderField {
            sensitive: true,
            ..Self::new(name, value)
        }
    }

    /// Size counted against SETTINGS_MAX_HEADER_LIST_SIZE
    pub fn size(&self) -> usize {
        entry_size(&self.name, &self.value)
    }

    pub fn is_pseudo(&self) -> bool {
        self.name.starts_with(':')
    }
}

impl fmt::Debug for HeaderField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.sensitive {
            write!(f, "{}: <sensitive>", self.name)
        } else {
            write!(f, "{}: {}", self.name, self.value)
        }
    }
}

/// Ordered list of header fields
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderBlock {
    fields: Vec<HeaderField>,
}

impl HeaderBlock {
    pub fn new() -> Self {
        HeaderBlock::default()
    }

    /// Builder-style append
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.push(name, value);
        self
    }

    /// Builder-style append of a never-indexed field
    pub fn with_sensitive(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.push(HeaderField::sensitive(name, value));
        self
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.fields.push(HeaderField::new(name, value));
    }

    pub fn push_field(&mut self, field: HeaderField) {
        self.fields.push(field);
    }

    /// First value for `name`
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|f| f.name == name)
            .map(|f| f.value.as_str())
    }

    pub fn method(&self) -> Option<&str> {
        self.get(":method")
    }

    pub fn path(&self) -> Option<&str> {
        self.get(":path")
    }

    pub fn scheme(&self) -> Option<&str> {
        self.get(":scheme")
    }

    pub fn authority(&self) -> Option<&str> {
        self.get(":authority")
    }

    /// `:status` parsed as a number
    pub fn status(&self) -> Option<u16> {
        self.get(":status").and_then(|s| s.parse().ok())
    }

    pub fn iter(&self) -> std::slice::Iter<'_, HeaderField> {
        self.fields.iter()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Sum of field sizes as counted by SETTINGS_MAX_HEADER_LIST_SIZE
    pub fn list_size(&self) -> usize {
        self.fields.iter().map(HeaderField::size).sum()
    }
}

impl<'a> IntoIterator for &'a HeaderBlock {
    type Item = &'a HeaderField;
    type IntoIter = std::slice::Iter<'a, HeaderField>;

    fn into_iter(self) -> Self::IntoIter {
        self.fields.iter()
    }
}

impl<N: Into<String>, V: Into<String>> FromIterator<(N, V)> for HeaderBlock {
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
        HeaderBlock {
            fields: iter
                .into_iter()
                .map(|(n, v)| HeaderField::new(n, v))
                .collect(),
        }
    }
}

/// HPACK encoder
#[derive(Debug)]
pub struct Encoder {
    table: DynamicTable,
    /// Smallest and final size set since the last block
    pending_resize: Option<(usize, usize)>,
    use_huffman: bool,
}

impl Encoder {
    pub fn new() -> Self {
        Self::with_max_table_size(DEFAULT_HEADER_TABLE_SIZE as usize)
    }

    pub fn with_max_table_size(size: usize) -> Self {
        Encoder {
            table: DynamicTable::new(size),
            pending_resize: None,
            use_huffman: true,
        }
    }

    /// Disable Huffman coding (string literals are sent raw)
    pub fn set_use_huffman(&mut self, use_huffman: bool) {
        self.use_huffman = use_huffman;
    }

    /// Adopt a new table budget (the peer's SETTINGS_HEADER_TABLE_SIZE)
    ///
    /// The change is signalled at the start of the next block.
    pub fn set_max_table_size(&mut self, size: usize) {
        self.pending_resize = Some(match self.pending_resize {
            Some((min, _)) => (min.min(size), size),
            None => (size.min(self.table.max_size()), size),
        });
    }

    pub fn table(&self) -> &DynamicTable {
        &self.table
    }

    /// Encode one complete header block
    pub fn encode(&mut self, block: &HeaderBlock) -> Bytes {
        let mut dst = BytesMut::with_capacity(block.list_size() / 2 + 16);

        if let Some((min, size)) = self.pending_resize.take() {
            if min < size {
                encode_integer(&mut dst, min, 5, 0x20);
                self.table.set_max_size(min);
            }
            encode_integer(&mut dst, size, 5, 0x20);
            self.table.set_max_size(size);
        }

        for field in block {
            self.encode_field(field, &mut dst);
        }
        dst.freeze()
    }

    fn encode_field(&mut self, field: &HeaderField, dst: &mut BytesMut) {
        let sensitive = field.sensitive || is_implicitly_sensitive(field);
        let found = self.table.find(&field.name, &field.value);

        if let (TableMatch::Field(index), false) = (found, sensitive) {
            encode_integer(dst, index, 7, 0x80);
            return;
        }

        let name_index = match found {
            TableMatch::Field(index) | TableMatch::Name(index) => Some(index),
            TableMatch::None => None,
        };

        let budget = self.table.max_size();
        let (prefix, prefix_bits, index) = if sensitive {
            // Never indexed
            (0x10, 4, false)
        } else if budget == 0
            || field.size() > budget / 2
            || VOLATILE_NAMES.contains(&field.name.as_str())
        {
            // Without indexing
            (0x00, 4, false)
        } else {
            // Incremental indexing
            (0x40, 6, true)
        };

        match name_index {
            Some(i) => encode_integer(dst, i, prefix_bits, prefix),
            None => {
                encode_integer(dst, 0, prefix_bits, prefix);
                self.encode_string(&field.name, dst);
            }
        }
        self.encode_string(&field.value, dst);

        if index {
            self.table.insert(field.name.clone(), field.value.clone());
        }
    }

    fn encode_string(&self, value: &str, dst: &mut BytesMut) {
        let raw = value.as_bytes();
        let huffman_len = huffman::encoded_len(raw);
        if self.use_huffman && huffman_len < raw.len() {
            encode_integer(dst, huffman_len, 7, 0x80);
            huffman::encode(raw, dst);
        } else {
            encode_integer(dst, raw.len(), 7, 0x00);
            dst.put_slice(raw);
        }
    }
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}

fn is_implicitly_sensitive(field: &HeaderField) -> bool {
    field.name == "authorization"
        || field.name == "proxy-authorization"
        || (field.name == "cookie" && field.value.len() < SHORT_COOKIE_LEN)
}

/// HPACK decoder
#[derive(Debug)]
pub struct Decoder {
    table: DynamicTable,
    /// Our SETTINGS_HEADER_TABLE_SIZE; size updates may not exceed it
    max_allowed_size: usize,
    max_header_list_size: Option<usize>,
}

impl Decoder {
    pub fn new() -> Self {
        Self::with_max_table_size(DEFAULT_HEADER_TABLE_SIZE as usize)
    }

    pub fn with_max_table_size(size: usize) -> Self {
        Decoder {
            table: DynamicTable::new(size),
            max_allowed_size: size,
            max_header_list_size: None,
        }
    }

    /// Change the budget the peer's encoder may use
    ///
    /// The table itself shrinks only when the peer signals a size update.
    pub fn set_max_table_size(&mut self, size: usize) {
        self.max_allowed_size = size;
    }

    pub fn set_max_header_list_size(&mut self, size: Option<usize>) {
        self.max_header_list_size = size;
    }

    pub fn table(&self) -> &DynamicTable {
        &self.table
    }

    /// Decode one complete header block
    ///
    /// A field that is not UTF-8 does not stop decoding: the rest of the
    /// block still updates the table, then [`Error::MalformedField`] is
    /// returned.
    pub fn decode(&mut self, mut src: &[u8]) -> Result<HeaderBlock> {
        let mut block = HeaderBlock::new();
        let mut list_size = 0usize;
        let mut malformed: Option<String> = None;

        while src.has_remaining() {
            let first = src[0];

            let (field, sensitive) = if first & 0x80 != 0 {
                let index = decode_integer(&mut src, 7)?;
                (self.lookup(index)?, false)
            } else if first & 0x40 != 0 {
                let field = self.decode_literal(&mut src, 6)?;
                if field.opaque {
                    self.table
                        .insert_opaque(field.name.clone(), field.value.clone(), field.size);
                } else {
                    self.table.insert(field.name.clone(), field.value.clone());
                }
                (field, false)
            } else if first & 0x20 != 0 {
                if !block.is_empty() || malformed.is_some() {
                    return Err(Error::Compression(
                        "table size update after first header field".into(),
                    ));
                }
                let size = decode_integer(&mut src, 5)?;
                if size > self.max_allowed_size {
                    return Err(Error::Compression(format!(
                        "table size update {} above limit {}",
                        size, self.max_allowed_size
                    )));
                }
                self.table.set_max_size(size);
                continue;
            } else {
                let never_indexed = first & 0x10 != 0;
                (self.decode_literal(&mut src, 4)?, never_indexed)
            };

            list_size += field.size;
            if let Some(limit) = self.max_header_list_size {
                if list_size > limit {
                    return Err(Error::Compression(format!(
                        "header list size {} exceeds {}",
                        list_size, limit
                    )));
                }
            }

            if field.opaque {
                malformed.get_or_insert(field.name);
            } else if malformed.is_none() {
                block.push_field(HeaderField {
                    name: field.name,
                    value: field.value,
                    sensitive,
                });
            }
        }

        match malformed {
            Some(name) => Err(Error::MalformedField(format!("{} is not valid UTF-8", name))),
            None => Ok(block),
        }
    }

    fn lookup(&self, index: usize) -> Result<Decoded> {
        let (name, value) = self.table.get(index).ok_or_else(|| {
            Error::Compression(format!(
                "index {} outside table of {} entries",
                index,
                STATIC_TABLE.len() + self.table.len()
            ))
        })?;
        Ok(Decoded {
            size: entry_size(name, value),
            name: name.to_string(),
            value: value.to_string(),
            opaque: self.table.is_opaque(index),
        })
    }

    fn decode_literal(&self, src: &mut &[u8], prefix_bits: u8) -> Result<Decoded> {
        let name_index = decode_integer(src, prefix_bits)?;
        let (name, name_len, name_opaque) = if name_index == 0 {
            let raw = decode_string(src)?;
            let len = raw.len();
            let (text, opaque) = into_text(raw);
            (text, len, opaque)
        } else {
            let entry = self.lookup(name_index)?;
            let len = entry.name.len();
            (entry.name, len, entry.opaque)
        };
        let raw = decode_string(src)?;
        let value_len = raw.len();
        let (value, value_opaque) = into_text(raw);
        Ok(Decoded {
            size: name_len + value_len + table::ENTRY_OVERHEAD,
            name,
            value,
            opaque: name_opaque || value_opaque,
        })
    }
}

/// A field as read off the wire
struct Decoded {
    name: String,
    value: String,
    /// Entry size over the wire bytes
    size: usize,
    opaque: bool,
}

/// UTF-8 text of a header string, or a lossy copy flagged as opaque
fn into_text(raw: Vec<u8>) -> (String, bool) {
    match String::from_utf8(raw) {
        Ok(text) => (text, false),
        Err(e) => (String::from_utf8_lossy(e.as_bytes()).into_owned(), true),
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Encode an integer with an N-bit prefix (RFC 7541 Section 5.1)
pub fn encode_integer(dst: &mut BytesMut, value: usize, prefix_bits: u8, prefix: u8) {
    let max_first = (1usize << prefix_bits) - 1;

    if value < max_first {
        dst.put_u8(prefix | value as u8);
        return;
    }

    dst.put_u8(prefix | max_first as u8);
    let mut remaining = value - max_first;
    while remaining >= 128 {
        dst.put_u8((remaining & 0x7f) as u8 | 0x80);
        remaining >>= 7;
    }
    dst.put_u8(remaining as u8);
}

/// Decode an integer with an N-bit prefix
pub fn decode_integer(src: &mut &[u8], prefix_bits: u8) -> Result<usize> {
    if !src.has_remaining() {
        return Err(Error::Compression("truncated integer".into()));
    }

    let max_first = (1usize << prefix_bits) - 1;
    let first = (src.get_u8() as usize) & max_first;
    if first < max_first {
        return Ok(first);
    }

    let mut value = max_first;
    let mut shift = 0u32;
    loop {
        if !src.has_remaining() {
            return Err(Error::Compression("truncated integer".into()));
        }
        // Values past 2^28 are far beyond any sane table or string size
        if shift > 21 {
            return Err(Error::Compression("integer overflow".into()));
        }
        let byte = src.get_u8();
        value += ((byte & 0x7f) as usize) << shift;
        shift += 7;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
}

fn decode_string(src: &mut &[u8]) -> Result<Vec<u8>> {
    if !src.has_remaining() {
        return Err(Error::Compression("truncated string".into()));
    }
    let huffman_coded = src[0] & 0x80 != 0;
    let len = decode_integer(src, 7)?;
    if src.len() < len {
        return Err(Error::Compression(format!(
            "string length {} exceeds remaining {}",
            len,
            src.len()
        )));
    }

    let rest: &[u8] = *src;
    let (raw, rest) = rest.split_at(len);
    *src = rest;

    if huffman_coded {
        huffman::decode(raw)
    } else {
        Ok(raw.to_vec())
    }
}

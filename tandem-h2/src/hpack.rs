//! HPACK header compression (RFC 7541).
//!
//! One [`Encoder`] and one [`Decoder`] exist per connection. Both sides keep a
//! dynamic table that must evolve identically, so header blocks have to be
//! encoded in the order they are written and decoded in the order they
//! arrive.

use std::collections::VecDeque;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::H2Error;
use crate::huffman;

/// Initial SETTINGS_HEADER_TABLE_SIZE (RFC 7541 Section 4.2).
pub const DEFAULT_TABLE_SIZE: usize = 4096;

/// Per-entry accounting overhead (RFC 7541 Section 4.1).
const ENTRY_OVERHEAD: usize = 32;

/// A single header name-value pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HeaderField {
    pub name: Bytes,
    pub value: Bytes,
}

impl HeaderField {
    pub fn new(name: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Bytes this entry charges against a dynamic table budget.
    pub fn size(&self) -> usize {
        self.name.len() + self.value.len() + ENTRY_OVERHEAD
    }
}

/// An ordered header list as carried by one header block.
pub type HeaderList = Vec<HeaderField>;

/// RFC 7541 Appendix A, 1-based on the wire.
#[rustfmt::skip]
static STATIC_TABLE: [(&str, &str); 61] = [
    (":authority", ""), (":method", "GET"), (":method", "POST"), (":path", "/"),
    (":path", "/index.html"), (":scheme", "http"), (":scheme", "https"),
    (":status", "200"), (":status", "204"), (":status", "206"), (":status", "304"),
    (":status", "400"), (":status", "404"), (":status", "500"),
    ("accept-charset", ""), ("accept-encoding", "gzip, deflate"), ("accept-language", ""),
    ("accept-ranges", ""), ("accept", ""), ("access-control-allow-origin", ""),
    ("age", ""), ("allow", ""), ("authorization", ""), ("cache-control", ""),
    ("content-disposition", ""), ("content-encoding", ""), ("content-language", ""),
    ("content-length", ""), ("content-location", ""), ("content-range", ""),
    ("content-type", ""), ("cookie", ""), ("date", ""), ("etag", ""), ("expect", ""),
    ("expires", ""), ("from", ""), ("host", ""), ("if-match", ""),
    ("if-modified-since", ""), ("if-none-match", ""), ("if-range", ""),
    ("if-unmodified-since", ""), ("last-modified", ""), ("link", ""), ("location", ""),
    ("max-forwards", ""), ("proxy-authenticate", ""), ("proxy-authorization", ""),
    ("range", ""), ("referer", ""), ("refresh", ""), ("retry-after", ""), ("server", ""),
    ("set-cookie", ""), ("strict-transport-security", ""), ("transfer-encoding", ""),
    ("user-agent", ""), ("vary", ""), ("via", ""), ("www-authenticate", ""),
];

// -- Prefix integers (RFC 7541 Section 5.1) --

/// Write `value` with an N-bit prefix, OR-ing `flags` into the first byte.
pub fn encode_int(buf: &mut BytesMut, value: usize, prefix_bits: u8, flags: u8) {
    let limit = (1usize << prefix_bits) - 1;
    if value < limit {
        buf.put_u8(flags | value as u8);
        return;
    }
    buf.put_u8(flags | limit as u8);
    let mut rest = value - limit;
    while rest >= 0x80 {
        buf.put_u8(0x80 | (rest & 0x7f) as u8);
        rest >>= 7;
    }
    buf.put_u8(rest as u8);
}

/// Read an N-bit prefix integer from the front of `src`, advancing it.
pub fn decode_int(src: &mut &[u8], prefix_bits: u8) -> Result<usize, H2Error> {
    let (&first, mut rest) = src.split_first().ok_or(H2Error::CompressionError)?;
    let limit = (1usize << prefix_bits) - 1;
    let mut value = usize::from(first) & limit;
    if value == limit {
        let mut shift = 0u32;
        loop {
            let (&byte, tail) = rest.split_first().ok_or(H2Error::CompressionError)?;
            rest = tail;
            // Anything past 28 bits of continuation is not a sane table index
            // or string length.
            if shift > 21 {
                return Err(H2Error::CompressionError);
            }
            value += usize::from(byte & 0x7f) << shift;
            shift += 7;
            if byte & 0x80 == 0 {
                break;
            }
        }
    }
    *src = rest;
    Ok(value)
}

// -- String literals (RFC 7541 Section 5.2) --

fn encode_str(buf: &mut BytesMut, data: &[u8]) {
    let coded_len = huffman::encoded_len(data);
    if coded_len < data.len() {
        encode_int(buf, coded_len, 7, 0x80);
        let mut coded = Vec::with_capacity(coded_len);
        huffman::encode(data, &mut coded);
        buf.put_slice(&coded);
    } else {
        encode_int(buf, data.len(), 7, 0x00);
        buf.put_slice(data);
    }
}

fn decode_str(src: &mut &[u8]) -> Result<Bytes, H2Error> {
    let huffman_coded = src.first().is_some_and(|b| b & 0x80 != 0);
    let len = decode_int(src, 7)?;
    if src.len() < len {
        return Err(H2Error::CompressionError);
    }
    let (raw, rest) = src.split_at(len);
    *src = rest;
    if huffman_coded {
        Ok(huffman::decode(raw)?.into())
    } else {
        Ok(Bytes::copy_from_slice(raw))
    }
}

// -- Dynamic table (RFC 7541 Section 2.3.2) --

/// FIFO of recently indexed fields, newest first, bounded by a byte budget.
#[derive(Debug, Clone)]
pub struct DynamicTable {
    entries: VecDeque<HeaderField>,
    size: usize,
    max_size: usize,
}

impl DynamicTable {
    pub fn new(max_size: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            size: 0,
            max_size,
        }
    }

    /// Entry at a 0-based dynamic index (0 is the newest).
    pub fn get(&self, index: usize) -> Option<&HeaderField> {
        self.entries.get(index)
    }

    /// Add `field`, evicting oldest entries until it fits. A field larger
    /// than the whole budget empties the table and is not stored.
    pub fn insert(&mut self, field: HeaderField) {
        let cost = field.size();
        self.evict_to(self.max_size.saturating_sub(cost));
        if cost <= self.max_size {
            self.size += cost;
            self.entries.push_front(field);
        }
    }

    pub fn set_max_size(&mut self, max_size: usize) {
        self.max_size = max_size;
        self.evict_to(max_size);
    }

    fn evict_to(&mut self, target: usize) {
        while self.size > target {
            match self.entries.pop_back() {
                Some(old) => self.size -= old.size(),
                None => break,
            }
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Result of looking a field up across both tables, as 1-based wire indices.
enum Lookup {
    Field(usize),
    Name(usize),
    Miss,
}

fn lookup(table: &DynamicTable, field: &HeaderField) -> Lookup {
    let mut name_hit = None;
    for (i, &(name, value)) in STATIC_TABLE.iter().enumerate() {
        if field.name == name.as_bytes() {
            if field.value == value.as_bytes() {
                return Lookup::Field(i + 1);
            }
            name_hit.get_or_insert(i + 1);
        }
    }
    for (i, entry) in table.entries.iter().enumerate() {
        if entry.name == field.name {
            let index = STATIC_TABLE.len() + i + 1;
            if entry.value == field.value {
                return Lookup::Field(index);
            }
            name_hit.get_or_insert(index);
        }
    }
    name_hit.map_or(Lookup::Miss, Lookup::Name)
}

fn resolve(table: &DynamicTable, index: usize) -> Result<HeaderField, H2Error> {
    match index {
        0 => Err(H2Error::CompressionError),
        i if i <= STATIC_TABLE.len() => {
            let (name, value) = STATIC_TABLE[i - 1];
            Ok(HeaderField::new(name, value))
        }
        i => table
            .get(i - STATIC_TABLE.len() - 1)
            .cloned()
            .ok_or(H2Error::CompressionError),
    }
}

// -- Encoder --

/// HPACK encoder. Owns the send-side dynamic table.
#[derive(Debug, Clone)]
pub struct Encoder {
    table: DynamicTable,
    /// Smallest and final size set since the last block; announced at the
    /// start of the next block (RFC 7541 Section 4.2).
    pending_resize: Option<(usize, usize)>,
}

impl Encoder {
    pub fn new(max_table_size: usize) -> Self {
        Self {
            table: DynamicTable::new(max_table_size),
            pending_resize: None,
        }
    }

    /// Adopt a new table budget, typically the peer's
    /// SETTINGS_HEADER_TABLE_SIZE.
    pub fn set_max_table_size(&mut self, size: usize) {
        if size == self.table.max_size() && self.pending_resize.is_none() {
            return;
        }
        self.table.set_max_size(size);
        self.pending_resize = Some(match self.pending_resize {
            Some((low, _)) => (low.min(size), size),
            None => (size, size),
        });
    }

    pub fn table(&self) -> &DynamicTable {
        &self.table
    }

    /// Encode `headers` as one header block appended to `buf`.
    ///
    /// Exact matches become indexed fields. Everything else is a literal with
    /// incremental indexing when the entry fits the table budget, or a literal
    /// without indexing when it does not, so both tables stay in step.
    pub fn encode(&mut self, headers: &[HeaderField], buf: &mut BytesMut) {
        if let Some((low, last)) = self.pending_resize.take() {
            if low < last {
                encode_int(buf, low, 5, 0x20);
            }
            encode_int(buf, last, 5, 0x20);
        }
        for field in headers {
            self.encode_field(field, buf);
        }
    }

    fn encode_field(&mut self, field: &HeaderField, buf: &mut BytesMut) {
        let name_index = match lookup(&self.table, field) {
            Lookup::Field(index) => {
                encode_int(buf, index, 7, 0x80);
                return;
            }
            Lookup::Name(index) => index,
            Lookup::Miss => 0,
        };

        let indexed = field.size() <= self.table.max_size();
        if indexed {
            encode_int(buf, name_index, 6, 0x40);
        } else {
            encode_int(buf, name_index, 4, 0x00);
        }
        if name_index == 0 {
            encode_str(buf, &field.name);
        }
        encode_str(buf, &field.value);
        if indexed {
            self.table.insert(field.clone());
        }
    }
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new(DEFAULT_TABLE_SIZE)
    }
}

// -- Decoder --

/// HPACK decoder. Owns the receive-side dynamic table.
#[derive(Debug, Clone)]
pub struct Decoder {
    table: DynamicTable,
    /// Upper bound the peer may resize to: our advertised
    /// SETTINGS_HEADER_TABLE_SIZE.
    max_allowed: usize,
}

impl Decoder {
    pub fn new(max_table_size: usize) -> Self {
        Self {
            table: DynamicTable::new(max_table_size),
            max_allowed: max_table_size,
        }
    }

    pub fn table(&self) -> &DynamicTable {
        &self.table
    }

    /// Decode a complete header block.
    pub fn decode(&mut self, block: &[u8]) -> Result<HeaderList, H2Error> {
        let mut src = block;
        let mut headers = Vec::new();

        while let Some(&first) = src.first() {
            if first & 0x80 != 0 {
                // Indexed field: 1xxxxxxx
                let index = decode_int(&mut src, 7)?;
                headers.push(resolve(&self.table, index)?);
            } else if first & 0x40 != 0 {
                // Literal with incremental indexing: 01xxxxxx
                let field = self.read_literal(&mut src, 6)?;
                self.table.insert(field.clone());
                headers.push(field);
            } else if first & 0x20 != 0 {
                // Table size update: 001xxxxx, only ahead of the first field.
                if !headers.is_empty() {
                    return Err(H2Error::CompressionError);
                }
                let size = decode_int(&mut src, 5)?;
                if size > self.max_allowed {
                    return Err(H2Error::CompressionError);
                }
                self.table.set_max_size(size);
            } else {
                // Literal without indexing (0000xxxx) or never indexed
                // (0001xxxx). Neither touches the table.
                headers.push(self.read_literal(&mut src, 4)?);
            }
        }

        Ok(headers)
    }

    fn read_literal(&self, src: &mut &[u8], prefix_bits: u8) -> Result<HeaderField, H2Error> {
        let name_index = decode_int(src, prefix_bits)?;
        let name = if name_index == 0 {
            decode_str(src)?
        } else {
            resolve(&self.table, name_index)?.name
        };
        let value = decode_str(src)?;
        Ok(HeaderField { name, value })
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new(DEFAULT_TABLE_SIZE)
    }
}

//! HPACK static and dynamic tables (RFC 7541 Section 2.3)

use std::collections::VecDeque;

/// Per-entry overhead counted against the table budget
pub const ENTRY_OVERHEAD: usize = 32;

/// Static table entries (RFC 7541 Appendix A); index 1 is the first entry
pub static STATIC_TABLE: [(&str, &str); 61] = [
    (":authority", ""),
    (":method", "GET"),
    (":method", "POST"),
    (":path", "/"),
    (":path", "/index.html"),
    (":scheme", "http"),
    (":scheme", "https"),
    (":status", "200"),
    (":status", "204"),
    (":status", "206"),
    (":status", "304"),
    (":status", "400"),
    (":status", "404"),
    (":status", "500"),
    ("accept-charset", ""),
    ("accept-encoding", "gzip, deflate"),
    ("accept-language", ""),
    ("accept-ranges", ""),
    ("accept", ""),
    ("access-control-allow-origin", ""),
    ("age", ""),
    ("allow", ""),
    ("authorization", ""),
    ("cache-control", ""),
    ("content-disposition", ""),
    ("content-encoding", ""),
    ("content-language", ""),
    ("content-length", ""),
    ("content-location", ""),
    ("content-range", ""),
    ("content-type", ""),
    ("cookie", ""),
    ("date", ""),
    ("etag", ""),
    ("expect", ""),
    ("expires", ""),
    ("from", ""),
    ("host", ""),
    ("if-match", ""),
    ("if-modified-since", ""),
    ("if-none-match", ""),
    ("if-range", ""),
    ("if-unmodified-since", ""),
    ("last-modified", ""),
    ("link", ""),
    ("location", ""),
    ("max-forwards", ""),
    ("proxy-authenticate", ""),
    ("proxy-authorization", ""),
    ("range", ""),
    ("referer", ""),
    ("refresh", ""),
    ("retry-after", ""),
    ("server", ""),
    ("set-cookie", ""),
    ("strict-transport-security", ""),
    ("transfer-encoding", ""),
    ("user-agent", ""),
    ("vary", ""),
    ("via", ""),
    ("www-authenticate", ""),
];

/// Size of an entry as counted by the table budget
pub fn entry_size(name: &str, value: &str) -> usize {
    name.len() + value.len() + ENTRY_OVERHEAD
}

/// Result of searching both tables for a field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableMatch {
    /// Name and value found at this index
    Field(usize),
    /// Only the name found at this index
    Name(usize),
    None,
}

#[derive(Debug, Clone)]
struct Entry {
    name: String,
    value: String,
    /// Budget charge, counted on the wire bytes
    size: usize,
    /// The value was not UTF-8 and `value` holds a lossy copy
    opaque: bool,
}

/// FIFO table of recently indexed fields, bounded by a byte budget
///
/// The newest entry has dynamic index 1, i.e. absolute index 62.
#[derive(Debug, Clone)]
pub struct DynamicTable {
    entries: VecDeque<Entry>,
    size: usize,
    max_size: usize,
}

impl DynamicTable {
    pub fn new(max_size: usize) -> Self {
        DynamicTable {
            entries: VecDeque::new(),
            size: 0,
            max_size,
        }
    }

    /// Bytes currently used
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

    /// Change the budget, evicting oldest entries until the table fits
    pub fn set_max_size(&mut self, max_size: usize) {
        self.max_size = max_size;
        self.evict_to(max_size);
    }

    /// Add a field as the newest entry
    ///
    /// An entry larger than the whole budget empties the table and is not
    /// stored (RFC 7541 Section 4.4).
    pub fn insert(&mut self, name: String, value: String) {
        let size = entry_size(&name, &value);
        self.push(Entry {
            name,
            value,
            size,
            opaque: false,
        });
    }

    /// Add a field whose value arrived as bytes that are not UTF-8
    ///
    /// `size` is charged as the peer's encoder counts it, so both tables
    /// evict in step. Lookups of the entry report it as opaque.
    pub fn insert_opaque(&mut self, name: String, lossy_value: String, size: usize) {
        self.push(Entry {
            name,
            value: lossy_value,
            size,
            opaque: true,
        });
    }

    fn push(&mut self, entry: Entry) {
        if entry.size > self.max_size {
            self.entries.clear();
            self.size = 0;
            return;
        }
        self.evict_to(self.max_size - entry.size);
        self.size += entry.size;
        self.entries.push_front(entry);
    }

    /// Look up by absolute index (static entries first)
    pub fn get(&self, index: usize) -> Option<(&str, &str)> {
        if index == 0 {
            return None;
        }
        if index <= STATIC_TABLE.len() {
            return Some(STATIC_TABLE[index - 1]);
        }
        self.entries
            .get(index - STATIC_TABLE.len() - 1)
            .map(|e| (e.name.as_str(), e.value.as_str()))
    }

    /// Whether the dynamic entry at `index` holds a non-UTF-8 value
    pub fn is_opaque(&self, index: usize) -> bool {
        index > STATIC_TABLE.len()
            && self
                .entries
                .get(index - STATIC_TABLE.len() - 1)
                .map_or(false, |e| e.opaque)
    }

    /// Search static then dynamic entries, preferring a full match
    pub fn find(&self, name: &str, value: &str) -> TableMatch {
        let mut name_match = None;

        for (i, (n, v)) in STATIC_TABLE.iter().enumerate() {
            if *n == name {
                if *v == value {
                    return TableMatch::Field(i + 1);
                }
                name_match.get_or_insert(i + 1);
            }
        }
        for (i, e) in self.entries.iter().enumerate() {
            if e.name == name && !e.opaque {
                let index = STATIC_TABLE.len() + i + 1;
                if e.value == value {
                    return TableMatch::Field(index);
                }
                name_match.get_or_insert(index);
            }
        }

        name_match.map_or(TableMatch::None, TableMatch::Name)
    }

    fn evict_to(&mut self, limit: usize) {
        while self.size > limit {
            match self.entries.pop_back() {
                Some(entry) => self.size -= entry.size,
                None => break,
            }
        }
    }
}

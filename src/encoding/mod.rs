// On-disk building blocks shared by the writer and the view.
//
// Every value in a finished buffer is a `RawValue`: a u32 type tag followed by
// a u32 payload, both little endian. Scalars live entirely in the payload;
// everything else stores the dense per-kind index of a heap item there.
//
// A buffer is laid out as
// * the 32 byte header,
// * one offset table per heap section (unicode, vectors, bitvectors, sets,
//   maps), each entry 4 or 8 bytes wide depending on the format version,
// * the heap, in the same section order, every item 4-byte aligned.
use anyhow::bail;
use serde::{Deserialize, Serialize};

pub const HEADER_LEN: usize = 8 + 6 * 4;
pub const RAW_VALUE_LEN: usize = 8;
pub const SET_HEADER_LEN: usize = 4 + 4 + 2 * RAW_VALUE_LEN;
pub const MAP_HEADER_LEN: usize = 4 + 4 + 3 * RAW_VALUE_LEN;

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tag {
    Vector = 0,
    VectorHashable = 1,
    VectorI8 = 2,
    VectorU8 = 3,
    VectorI16 = 4,
    VectorU16 = 5,
    VectorI32 = 6,
    VectorU32 = 7,
    VectorFloat = 8,
    VectorEmpty = 9,
    Unicode = 10,
    Bitvector = 11,
    Bitvector0 = 12,
    Bitvector1 = 13,
    Bitvector01 = 14,
    Bitvector10 = 15,
    BitvectorPacked = 16,
    Set = 17,
    Map = 18,
    EmptySlot = 19,
    I32 = 20,
    U32 = 21,
    Float = 22,
    Bool = 23,
    Null = 24,
}

impl Tag {
    pub fn from_u32(t: u32) -> anyhow::Result<Self> {
        Ok(match t {
            0 => Tag::Vector,
            1 => Tag::VectorHashable,
            2 => Tag::VectorI8,
            3 => Tag::VectorU8,
            4 => Tag::VectorI16,
            5 => Tag::VectorU16,
            6 => Tag::VectorI32,
            7 => Tag::VectorU32,
            8 => Tag::VectorFloat,
            9 => Tag::VectorEmpty,
            10 => Tag::Unicode,
            11 => Tag::Bitvector,
            12 => Tag::Bitvector0,
            13 => Tag::Bitvector1,
            14 => Tag::Bitvector01,
            15 => Tag::Bitvector10,
            16 => Tag::BitvectorPacked,
            17 => Tag::Set,
            18 => Tag::Map,
            19 => Tag::EmptySlot,
            20 => Tag::I32,
            21 => Tag::U32,
            22 => Tag::Float,
            23 => Tag::Bool,
            24 => Tag::Null,
            _ => bail!("unknown value tag {}", t),
        })
    }

    /// General vectors, the only vectors that can reference other values.
    pub fn is_general_vector(self) -> bool {
        matches!(self, Tag::Vector | Tag::VectorHashable)
    }

    /// Element width on the heap for vectors that have a heap item.
    pub fn element_width(self) -> Option<usize> {
        match self {
            Tag::Vector | Tag::VectorHashable => Some(RAW_VALUE_LEN),
            Tag::VectorI8 | Tag::VectorU8 => Some(1),
            Tag::VectorI16 | Tag::VectorU16 => Some(2),
            Tag::VectorI32 | Tag::VectorU32 | Tag::VectorFloat => Some(4),
            _ => None,
        }
    }
}

/// Selects the offset width and the string hash of a file. Both travel with
/// the file and never change after it is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FormatVersion {
    Offset32OldHash,
    Offset32NewHash,
    Offset64NewHash,
}

impl Default for FormatVersion {
    fn default() -> Self {
        FormatVersion::Offset32NewHash
    }
}

impl FormatVersion {
    pub fn from_u32(v: u32) -> anyhow::Result<Self> {
        Ok(match v {
            0 => FormatVersion::Offset32OldHash,
            1 => FormatVersion::Offset32NewHash,
            2 => FormatVersion::Offset64NewHash,
            _ => bail!("unsupported version"),
        })
    }

    pub fn as_u32(self) -> u32 {
        match self {
            FormatVersion::Offset32OldHash => 0,
            FormatVersion::Offset32NewHash => 1,
            FormatVersion::Offset64NewHash => 2,
        }
    }

    pub fn offset_width(self) -> usize {
        match self {
            FormatVersion::Offset32OldHash | FormatVersion::Offset32NewHash => 4,
            FormatVersion::Offset64NewHash => 8,
        }
    }

    pub fn new_hash(self) -> bool {
        !matches!(self, FormatVersion::Offset32OldHash)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawValue {
    pub tag: Tag,
    pub data: u32,
}

impl RawValue {
    pub fn new(tag: Tag, data: u32) -> Self {
        RawValue { tag, data }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub root: RawValue,
    pub n_unicode: u32,
    pub n_vector: u32,
    pub n_bitvector: u32,
    pub n_set: u32,
    pub n_map: u32,
    pub version: FormatVersion,
}

impl Header {
    pub fn n_offsets(&self) -> usize {
        [
            self.n_unicode,
            self.n_vector,
            self.n_bitvector,
            self.n_set,
            self.n_map,
        ]
        .iter()
        .map(|n| *n as usize)
        .sum()
    }
}

/// Fixed-size heap record of a set or a map. `values` is absent for sets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableHeader {
    pub n_items: u32,
    pub hash: RawValue,
    pub keys: RawValue,
    pub values: Option<RawValue>,
}

impl TableHeader {
    pub fn encoded_len(&self) -> usize {
        if self.values.is_some() {
            MAP_HEADER_LEN
        } else {
            SET_HEADER_LEN
        }
    }
}

pub fn align4(v: u64) -> u64 {
    (v + 3) & !3
}

pub trait Encode: std::fmt::Debug {
    fn write_bytes(&self, buf: &mut Vec<u8>);
}

pub trait Decode: Sized {
    fn decode(r: &mut Reader) -> anyhow::Result<Self>;
}

impl Encode for u32 {
    fn write_bytes(&self, buf: &mut Vec<u8>) {
        buf.extend(self.to_le_bytes())
    }
}

impl Decode for u32 {
    fn decode(r: &mut Reader) -> anyhow::Result<Self> {
        r.read_u32()
    }
}

impl Encode for RawValue {
    fn write_bytes(&self, buf: &mut Vec<u8>) {
        (self.tag as u32).write_bytes(buf);
        self.data.write_bytes(buf);
    }
}

impl Decode for RawValue {
    fn decode(r: &mut Reader) -> anyhow::Result<Self> {
        let tag = Tag::from_u32(r.read_u32()?)?;
        let data = r.read_u32()?;
        Ok(RawValue { tag, data })
    }
}

impl Encode for Header {
    fn write_bytes(&self, buf: &mut Vec<u8>) {
        self.root.write_bytes(buf);
        for n in [
            self.n_unicode,
            self.n_vector,
            self.n_bitvector,
            self.n_set,
            self.n_map,
            self.version.as_u32(),
        ] {
            n.write_bytes(buf);
        }
    }
}

impl Decode for Header {
    fn decode(r: &mut Reader) -> anyhow::Result<Self> {
        Ok(Header {
            root: RawValue::decode(r)?,
            n_unicode: r.read_u32()?,
            n_vector: r.read_u32()?,
            n_bitvector: r.read_u32()?,
            n_set: r.read_u32()?,
            n_map: r.read_u32()?,
            version: FormatVersion::from_u32(r.read_u32()?)?,
        })
    }
}

impl Encode for TableHeader {
    fn write_bytes(&self, buf: &mut Vec<u8>) {
        self.n_items.write_bytes(buf);
        // padding
        0_u32.write_bytes(buf);
        self.hash.write_bytes(buf);
        self.keys.write_bytes(buf);
        if let Some(values) = &self.values {
            values.write_bytes(buf);
        }
    }
}

impl TableHeader {
    pub fn decode(r: &mut Reader, is_map: bool) -> anyhow::Result<Self> {
        let n_items = r.read_u32()?;
        r.read_u32()?;
        let hash = RawValue::decode(r)?;
        let keys = RawValue::decode(r)?;
        let values = if is_map {
            Some(RawValue::decode(r)?)
        } else {
            None
        };
        Ok(TableHeader {
            n_items,
            hash,
            keys,
            values,
        })
    }
}

pub struct Reader<'b> {
    data: &'b [u8],
    idx: usize,
}

impl<'b> Reader<'b> {
    pub fn new(data: &'b [u8]) -> Self {
        Reader { data, idx: 0 }
    }

    pub fn at(data: &'b [u8], idx: usize) -> Self {
        Reader { data, idx }
    }

    pub fn read_bytes(&mut self, n: usize) -> anyhow::Result<&'b [u8]> {
        let end = match self.idx.checked_add(n) {
            Some(end) if end <= self.data.len() => end,
            _ => bail!("truncated buffer"),
        };
        let out = &self.data[self.idx..end];
        self.idx = end;
        Ok(out)
    }

    pub fn read_u32(&mut self) -> anyhow::Result<u32> {
        Ok(u32::from_le_bytes(self.read_bytes(4)?.try_into()?))
    }

    pub fn read_u64(&mut self) -> anyhow::Result<u64> {
        Ok(u64::from_le_bytes(self.read_bytes(8)?.try_into()?))
    }
}

#[test]
fn test_header_bytes() -> anyhow::Result<()> {
    let header = Header {
        root: RawValue::new(Tag::VectorU8, 3),
        n_unicode: 1,
        n_vector: 4,
        n_bitvector: 0,
        n_set: 2,
        n_map: 1,
        version: FormatVersion::Offset64NewHash,
    };
    let mut buf = Vec::new();
    header.write_bytes(&mut buf);
    assert_eq!(HEADER_LEN, buf.len());
    assert_eq!(&buf[..8], &[3, 0, 0, 0, 3, 0, 0, 0]);
    assert_eq!(&buf[28..], &[2, 0, 0, 0]);
    assert_eq!(header, Header::decode(&mut Reader::new(&buf))?);
    assert_eq!(8, header.n_offsets());

    Ok(())
}

#[test]
fn test_table_header_len() {
    let set = TableHeader {
        n_items: 2,
        hash: RawValue::new(Tag::VectorU32, 0),
        keys: RawValue::new(Tag::VectorHashable, 1),
        values: None,
    };
    let mut buf = Vec::new();
    set.write_bytes(&mut buf);
    assert_eq!(SET_HEADER_LEN, buf.len());
    assert_eq!(set.encoded_len(), buf.len());

    let map = TableHeader {
        values: Some(RawValue::new(Tag::Vector, 2)),
        ..set
    };
    buf.clear();
    map.write_bytes(&mut buf);
    assert_eq!(MAP_HEADER_LEN, buf.len());
}

#[test]
fn test_bad_version() {
    assert!(FormatVersion::from_u32(3).is_err());
    assert_eq!(4, FormatVersion::default().offset_width());
    assert_eq!(2, FormatVersion::Offset64NewHash.as_u32());
}

#[test]
fn test_truncated() {
    let mut r = Reader::new(&[1, 2, 3]);
    assert!(r.read_u32().is_err());
}

// Read-only access to a finished buffer, just enough to walk its container
// graph and to check the layout in tests. Nothing is copied out of the buffer
// except the offset table.
use anyhow::bail;

use crate::{
    cycle::ContainerGraph,
    encoding::{Decode, Header, RawValue, Reader, TableHeader, Tag, HEADER_LEN},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    Unicode,
    Vector,
    Bitvector,
    Set,
    Map,
}

#[derive(Debug)]
pub struct GraphView<'b> {
    data: &'b [u8],
    header: Header,
    offsets: Vec<u64>,
    heap_base: usize,
}

impl<'b> GraphView<'b> {
    pub fn open(data: &'b [u8]) -> anyhow::Result<Self> {
        let mut r = Reader::new(data);
        let header = Header::decode(&mut r)?;
        let n = header.n_offsets();
        let width = header.version.offset_width();

        let mut offsets = Vec::new();
        offsets
            .try_reserve_exact(n)
            .map_err(|_| anyhow::anyhow!("out of memory"))?;
        for _ in 0..n {
            offsets.push(match width {
                4 => r.read_u32()? as u64,
                _ => r.read_u64()?,
            });
        }

        let heap_base = HEADER_LEN + n * width;
        let heap_len = (data.len() - heap_base) as u64;
        if offsets.iter().any(|o| *o >= heap_len) {
            bail!("offset out of range");
        }

        Ok(GraphView {
            data,
            header,
            offsets,
            heap_base,
        })
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn heap_len(&self) -> usize {
        self.data.len() - self.heap_base
    }

    /// The whole offset table, sections concatenated.
    pub fn offsets(&self) -> &[u64] {
        &self.offsets
    }

    fn section_range(&self, section: Section) -> (usize, usize) {
        let h = &self.header;
        let counts = [h.n_unicode, h.n_vector, h.n_bitvector, h.n_set, h.n_map];
        let idx = match section {
            Section::Unicode => 0,
            Section::Vector => 1,
            Section::Bitvector => 2,
            Section::Set => 3,
            Section::Map => 4,
        };
        let start: usize = counts[..idx].iter().map(|n| *n as usize).sum();
        (start, counts[idx] as usize)
    }

    fn reader(&self, section: Section, i: u32) -> anyhow::Result<Reader<'b>> {
        let (start, len) = self.section_range(section);
        if i as usize >= len {
            bail!("{:?} index {} out of range", section, i);
        }
        let offset = self.offsets[start + i as usize] as usize;
        Ok(Reader::at(self.data, self.heap_base + offset))
    }

    pub fn unicode(&self, i: u32) -> anyhow::Result<String> {
        let mut r = self.reader(Section::Unicode, i)?;
        let n = r.read_u32()?;
        let mut s = String::new();
        for _ in 0..n {
            match char::from_u32(r.read_u32()?) {
                Some(c) => s.push(c),
                None => bail!("invalid code point"),
            }
        }
        Ok(s)
    }

    pub fn vector_len(&self, i: u32) -> anyhow::Result<u32> {
        self.reader(Section::Vector, i)?.read_u32()
    }

    /// Elements of a general vector.
    pub fn vector_items(&self, i: u32) -> anyhow::Result<Vec<RawValue>> {
        let mut r = self.reader(Section::Vector, i)?;
        let n = r.read_u32()?;
        (0..n).map(|_| RawValue::decode(&mut r)).collect()
    }

    pub fn u32_items(&self, i: u32) -> anyhow::Result<Vec<u32>> {
        let mut r = self.reader(Section::Vector, i)?;
        let n = r.read_u32()?;
        (0..n).map(|_| r.read_u32()).collect()
    }

    pub fn bitvector(&self, i: u32) -> anyhow::Result<Vec<bool>> {
        let mut r = self.reader(Section::Bitvector, i)?;
        let n = r.read_u32()?;
        let bytes = r.read_bytes((n as usize).div_ceil(8))?;
        Ok((0..n as usize)
            .map(|b| bytes[b / 8] & (1 << (b % 8)) != 0)
            .collect())
    }

    pub fn set(&self, i: u32) -> anyhow::Result<TableHeader> {
        TableHeader::decode(&mut self.reader(Section::Set, i)?, false)
    }

    pub fn map(&self, i: u32) -> anyhow::Result<TableHeader> {
        TableHeader::decode(&mut self.reader(Section::Map, i)?, true)
    }
}

impl<'b> ContainerGraph for GraphView<'b> {
    fn root(&self) -> RawValue {
        self.header.root
    }

    fn n_containers(&self) -> u32 {
        self.header.n_vector + self.header.n_set + self.header.n_map
    }

    fn container_id(&self, v: RawValue) -> Option<u32> {
        match v.tag {
            t if t.is_general_vector() => Some(v.data),
            Tag::Set => Some(self.header.n_vector + v.data),
            Tag::Map => Some(self.header.n_vector + self.header.n_set + v.data),
            _ => None,
        }
    }

    fn children(&self, v: RawValue) -> anyhow::Result<Vec<RawValue>> {
        Ok(match v.tag {
            t if t.is_general_vector() => self.vector_items(v.data)?,
            Tag::Set => {
                let t = self.set(v.data)?;
                vec![t.hash, t.keys]
            }
            Tag::Map => {
                let t = self.map(v.data)?;
                let mut c = vec![t.hash, t.keys];
                c.extend(t.values);
                c
            }
            _ => Vec::new(),
        })
    }
}

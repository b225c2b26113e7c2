// The finalize pass: turns a populated value table into bytes.
//
// Runs in four steps:
// 1. every non-reserved private vector is emptied, compressed or checked for
//    hashability, in that order of preference,
// 2. surviving private vectors get a dense index, outside vectors follow them,
// 3. set and map hash tables are built into their reserved vectors,
// 4. offsets are computed for every heap item, then header, offset tables
//    and heap are streamed to the sink.
//
// The offsets are written before the heap they describe, so the size of
// every item is computed twice: once up front from `item_size` and once by
// actually encoding it. The two must agree.
use anyhow::bail;

use crate::{
    classify::compress_vector,
    encoding::{
        align4, Encode, FormatVersion, Header, RawValue, TableHeader, Tag, HEADER_LEN,
        RAW_VALUE_LEN,
    },
    hash_table::{self, TableRef},
    hashable::check_hashable,
    options::Options,
    sink::Sink,
    value::{
        Bitvector, HashTable, Handle, HeapBits, Items, OutsideItems, PrimKind, Value, ValueTable,
        VectorRef,
    },
};

#[cfg(test)]
mod layout_test;

fn vector_tag(kind: PrimKind) -> Tag {
    match kind {
        PrimKind::I8 => Tag::VectorI8,
        PrimKind::U8 => Tag::VectorU8,
        PrimKind::I16 => Tag::VectorI16,
        PrimKind::U16 => Tag::VectorU16,
        PrimKind::I32 => Tag::VectorI32,
        PrimKind::U32 => Tag::VectorU32,
        PrimKind::Float => Tag::VectorFloat,
    }
}

enum HeapItem<'t, 'a> {
    Unicode(&'t str),
    Private(&'t Items),
    Outside(&'t OutsideItems<'a>),
    Bits(&'t HeapBits),
    Table(TableHeader),
}

fn item_size(item: &HeapItem) -> u64 {
    let n = match item {
        HeapItem::Unicode(s) => 4 * (s.chars().count() + 2),
        HeapItem::Private(items) => {
            let width = items.kind().map_or(RAW_VALUE_LEN, |k| k.width());
            4 + items.len() * width
        }
        HeapItem::Outside(items) => 4 + items.len() * items.kind().width(),
        HeapItem::Bits(bits) => 4 + bits.bytes.len(),
        HeapItem::Table(t) => t.encoded_len(),
    };
    n as u64
}

fn write_prims(items: &OutsideItems, buf: &mut Vec<u8>) {
    match items {
        OutsideItems::I8(v) => buf.extend(v.iter().map(|x| *x as u8)),
        OutsideItems::U8(v) => buf.extend_from_slice(v),
        OutsideItems::I16(v) => v.iter().for_each(|x| buf.extend(x.to_le_bytes())),
        OutsideItems::U16(v) => v.iter().for_each(|x| buf.extend(x.to_le_bytes())),
        OutsideItems::I32(v) => v.iter().for_each(|x| buf.extend(x.to_le_bytes())),
        OutsideItems::U32(v) => v.iter().for_each(|x| x.write_bytes(buf)),
        OutsideItems::Float(v) => v.iter().for_each(|x| x.to_bits().write_bytes(buf)),
    }
}

/// A value table after step 2: every vector has its final shape and a dense
/// index.
struct Layout<'a> {
    table: ValueTable<'a>,
    // dense index of each private vector, `None` once it was emptied
    private_index: Vec<Option<u32>>,
    n_private: u32,
}

impl<'a> Layout<'a> {
    fn raw(&self, h: Handle) -> anyhow::Result<RawValue> {
        Ok(match self.table.get(h) {
            Value::I32(v) => RawValue::new(Tag::I32, *v as u32),
            Value::U32(v) => RawValue::new(Tag::U32, *v),
            Value::Float(v) => RawValue::new(Tag::Float, v.to_bits()),
            Value::Bool(v) => RawValue::new(Tag::Bool, *v as u32),
            Value::Null => RawValue::new(Tag::Null, 0),
            Value::EmptySlot => RawValue::new(Tag::EmptySlot, 0),
            Value::Unicode(i) => RawValue::new(Tag::Unicode, *i),
            Value::Bitvector(bv) => match *bv {
                Bitvector::Zeros(n) => RawValue::new(Tag::Bitvector0, n),
                Bitvector::Ones(n) => RawValue::new(Tag::Bitvector1, n),
                Bitvector::Packed { n_bits, bits } => {
                    RawValue::new(Tag::BitvectorPacked, n_bits | bits << 5)
                }
                Bitvector::ZeroOne { zeros, ones } => {
                    RawValue::new(Tag::Bitvector01, zeros as u32 | (ones as u32) << 16)
                }
                Bitvector::OneZero { ones, zeros } => {
                    RawValue::new(Tag::Bitvector10, ones as u32 | (zeros as u32) << 16)
                }
                Bitvector::Heap(i) => RawValue::new(Tag::Bitvector, i),
            },
            Value::Vector(VectorRef::Empty) => RawValue::new(Tag::VectorEmpty, 0),
            Value::Vector(VectorRef::Private(id)) => {
                let idx = match self.private_index[*id as usize] {
                    Some(idx) => idx,
                    None => bail!("reference to an emptied vector"),
                };
                let pv = &self.table.private[*id as usize];
                let tag = match pv.items.kind() {
                    Some(kind) => vector_tag(kind),
                    None if pv.hashable => Tag::VectorHashable,
                    None => Tag::Vector,
                };
                RawValue::new(tag, idx)
            }
            Value::Vector(VectorRef::Outside(id)) => {
                let kind = self.table.outside[*id as usize].kind();
                RawValue::new(vector_tag(kind), self.n_private + id)
            }
            Value::Set(i) => RawValue::new(Tag::Set, *i),
            Value::Map(i) => RawValue::new(Tag::Map, *i),
        })
    }

    fn table_header(&self, t: &HashTable) -> anyhow::Result<TableHeader> {
        Ok(TableHeader {
            n_items: t.keys.len().try_into()?,
            hash: self.raw(t.serialize_hash)?,
            keys: self.raw(t.serialize_keys)?,
            values: t.serialize_values.map(|v| self.raw(v)).transpose()?,
        })
    }

    /// Every heap item, in section order, with the section lengths.
    fn heap_items(&self) -> anyhow::Result<(Vec<HeapItem<'_, 'a>>, [usize; 6])> {
        let t = &self.table;
        let mut items = Vec::new();
        let mut sections = [0; 6];

        items.extend(t.unicode.iter().map(|s| HeapItem::Unicode(s)));
        sections[0] = t.unicode.len();

        for (pv, idx) in t.private.iter().zip(self.private_index.iter()) {
            if idx.is_some() {
                items.push(HeapItem::Private(&pv.items));
            }
        }
        sections[1] = self.n_private as usize;

        items.extend(t.outside.iter().map(HeapItem::Outside));
        sections[2] = t.outside.len();

        items.extend(t.bitvectors.iter().map(HeapItem::Bits));
        sections[3] = t.bitvectors.len();

        for set in &t.sets {
            items.push(HeapItem::Table(self.table_header(set)?));
        }
        sections[4] = t.sets.len();

        for map in &t.maps {
            items.push(HeapItem::Table(self.table_header(map)?));
        }
        sections[5] = t.maps.len();

        Ok((items, sections))
    }

    fn write_item(&self, item: &HeapItem, buf: &mut Vec<u8>) -> anyhow::Result<()> {
        match item {
            HeapItem::Unicode(s) => {
                (s.chars().count() as u32).write_bytes(buf);
                for c in s.chars() {
                    (c as u32).write_bytes(buf);
                }
                0_u32.write_bytes(buf);
            }
            HeapItem::Private(items) => {
                (items.len() as u32).write_bytes(buf);
                match items {
                    Items::Values(handles) => {
                        for h in handles {
                            self.raw(*h)?.write_bytes(buf);
                        }
                    }
                    items => {
                        if let Some(prims) = items.prims() {
                            write_prims(&prims, buf);
                        }
                    }
                }
            }
            HeapItem::Outside(items) => {
                (items.len() as u32).write_bytes(buf);
                write_prims(items, buf);
            }
            HeapItem::Bits(bits) => {
                bits.n_bits.write_bytes(buf);
                buf.extend_from_slice(&bits.bytes);
            }
            HeapItem::Table(t) => t.write_bytes(buf),
        }
        Ok(())
    }
}

/// Gives every non-reserved private vector its final shape.
fn shape_vectors(table: &mut ValueTable, max_depth: u32) -> anyhow::Result<()> {
    let mut n_empty = 0;
    let mut n_compressed = 0;
    let mut n_hashable = 0;
    for i in 0..table.len() {
        let h = Handle(i as u32);
        if !matches!(table.get(h), Value::Vector(VectorRef::Private(_))) {
            continue;
        }
        let pv = table.private_at(h);
        if pv.reserved {
            continue;
        }
        if pv.items.is_empty() {
            table.replace(h, Value::Vector(VectorRef::Empty));
            n_empty += 1;
        } else if pv.items.kind().is_none() {
            if compress_vector(table, h) {
                n_compressed += 1;
            } else {
                let hashable = check_hashable(table, h, max_depth)?;
                table.private_at_mut(h).hashable = hashable;
                n_hashable += hashable as usize;
            }
        }
    }
    tracing::debug!(n_empty, n_compressed, n_hashable, "shaped vectors");
    Ok(())
}

fn assign_indices(table: &ValueTable) -> (Vec<Option<u32>>, u32) {
    let mut live = vec![false; table.private.len()];
    for v in &table.values {
        if let Value::Vector(VectorRef::Private(id)) = v {
            live[*id as usize] = true;
        }
    }
    let mut next = 0_u32;
    let index: Vec<Option<u32>> = live
        .into_iter()
        .map(|live| {
            live.then(|| {
                next += 1;
                next - 1
            })
        })
        .collect();
    (index, next)
}

fn write_offset(offset: u64, version: FormatVersion, buf: &mut Vec<u8>) -> anyhow::Result<()> {
    match version.offset_width() {
        4 => match u32::try_from(offset) {
            Ok(o) => o.write_bytes(buf),
            Err(_) => bail!("heap too large for 32-bit offsets"),
        },
        _ => buf.extend(offset.to_le_bytes()),
    }
    Ok(())
}

/// Lays out `table` and writes it to `sink`. The table is consumed whether
/// or not this succeeds.
pub fn finalize<S: Sink>(
    mut table: ValueTable,
    root: Option<Handle>,
    opts: &Options,
    sink: &mut S,
) -> anyhow::Result<Header> {
    let root = match root {
        Some(root) => root,
        None => bail!("root has not been set"),
    };

    shape_vectors(&mut table, opts.max_depth)?;

    for id in 0..table.sets.len() {
        hash_table::build(&mut table, TableRef::Set(id), opts.version, opts.max_depth)?;
    }
    for id in 0..table.maps.len() {
        hash_table::build(&mut table, TableRef::Map(id), opts.version, opts.max_depth)?;
    }

    let (private_index, n_private) = assign_indices(&table);
    let layout = Layout {
        table,
        private_index,
        n_private,
    };
    let t = &layout.table;

    let header = Header {
        root: layout.raw(root)?,
        n_unicode: t.unicode.len().try_into()?,
        n_vector: n_private + u32::try_from(t.outside.len())?,
        n_bitvector: t.bitvectors.len().try_into()?,
        n_set: t.sets.len().try_into()?,
        n_map: t.maps.len().try_into()?,
        version: opts.version,
    };

    let (items, sections) = layout.heap_items()?;
    debug_assert_eq!(
        [
            header.n_unicode,
            header.n_vector,
            header.n_bitvector,
            header.n_set,
            header.n_map
        ],
        [
            sections[0] as u32,
            (sections[1] + sections[2]) as u32,
            sections[3] as u32,
            sections[4] as u32,
            sections[5] as u32
        ]
    );
    debug_assert_eq!(header.n_offsets(), items.len());

    let mut offsets = Vec::new();
    offsets
        .try_reserve_exact(items.len())
        .map_err(|_| anyhow::anyhow!("out of memory"))?;
    let mut heap_len = 0;
    for item in &items {
        offsets.push(heap_len);
        heap_len = align4(heap_len + item_size(item));
    }
    if opts.version.offset_width() == 4 && heap_len > u32::MAX as u64 {
        bail!("heap too large for 32-bit offsets");
    }

    let mut buf = Vec::with_capacity(HEADER_LEN);
    header.write_bytes(&mut buf);
    sink.write(&buf)?;

    buf.clear();
    for offset in &offsets {
        write_offset(*offset, opts.version, &mut buf)?;
    }
    sink.write(&buf)?;
    sink.align4()?;

    let heap_base = sink.position();
    for (item, offset) in items.iter().zip(offsets.iter()) {
        assert_eq!(heap_base + offset, sink.position());
        buf.clear();
        layout.write_item(item, &mut buf)?;
        assert_eq!(item_size(item), buf.len() as u64);
        sink.write(&buf)?;
        sink.align4()?;
    }
    assert_eq!(heap_base + heap_len, sink.position());

    tracing::debug!(
        n_unicode = header.n_unicode,
        n_vector = header.n_vector,
        n_bitvector = header.n_bitvector,
        n_set = header.n_set,
        n_map = header.n_map,
        heap_len,
        "finalized graph"
    );

    Ok(header)
}

// Structural hashing of values under construction.
//
// The reader recomputes these hashes from lookup keys, so every function here
// is part of the file format: equal values must hash equally no matter how
// they are stored (an `I32(3)`, a `U32(3)`, a `3.0` float and an element of a
// `U8` vector all hash to 3), and changing any of them breaks existing files.
// Only the string hash depends on the format version.
use anyhow::bail;

use crate::{
    encoding::FormatVersion,
    value::{Bitvector, Handle, Items, OutsideItems, Value, ValueTable, VectorRef},
};

const NULL_HASH: u32 = 0x6e75_6c6c;

pub fn hash_u32(v: u32) -> u32 {
    v
}

pub fn hash_i32(v: i32) -> u32 {
    v as u32
}

pub fn hash_bool(v: bool) -> u32 {
    v as u32
}

pub fn hash_null() -> u32 {
    NULL_HASH
}

pub fn hash_float(v: f32) -> u32 {
    if v.fract() == 0.0 {
        if v >= i32::MIN as f32 && v < 0.0 {
            return hash_i32(v as i32);
        }
        if (0.0..4_294_967_296.0).contains(&v) {
            return hash_u32(v as u32);
        }
    }
    let b = v.to_bits();
    (b ^ (b >> 16)).wrapping_mul(0x45d9_f3b)
}

fn hash_string_v0(s: &str) -> u32 {
    let mut chars = s.chars().peekable();
    let first = match chars.peek() {
        Some(c) => *c as u32,
        None => return 0,
    };
    let mut x = first << 7;
    let mut n = 0_u32;
    for c in chars {
        x = x.wrapping_mul(1_000_003) ^ c as u32;
        n += 1;
    }
    x ^ n
}

fn hash_string_v1(s: &str) -> u32 {
    s.chars().fold(0x811c_9dc5_u32, |h, c| {
        (h ^ c as u32).wrapping_mul(0x0100_0193)
    })
}

pub fn hash_string(s: &str, version: FormatVersion) -> u32 {
    if version.new_hash() {
        hash_string_v1(s)
    } else {
        hash_string_v0(s)
    }
}

/// Order-dependent combiner for sequences (vectors and bitvectors).
pub struct SequenceHash {
    x: u32,
    mult: u32,
    remaining: u32,
}

impl SequenceHash {
    pub fn new(n_items: u32) -> Self {
        SequenceHash {
            x: 0x0034_5678,
            mult: 1_000_003,
            remaining: n_items,
        }
    }

    pub fn next(&mut self, h: u32) {
        self.remaining = self.remaining.wrapping_sub(1);
        self.x = (self.x ^ h).wrapping_mul(self.mult);
        self.mult = self
            .mult
            .wrapping_add(82_520_u32.wrapping_add(self.remaining.wrapping_mul(2)));
    }

    pub fn end(self) -> u32 {
        self.x.wrapping_add(97_531)
    }
}

fn hash_seq<I: ExactSizeIterator<Item = u32>>(it: I) -> u32 {
    let mut state = SequenceHash::new(it.len() as u32);
    for h in it {
        state.next(h);
    }
    state.end()
}

pub fn hash_bits(bits: &[bool]) -> u32 {
    let mut state = SequenceHash::new(bits.len() as u32);
    for chunk in bits.chunks(32) {
        let word = chunk
            .iter()
            .enumerate()
            .fold(0_u32, |acc, (i, b)| acc | ((*b as u32) << i));
        state.next(word);
    }
    state.end()
}

fn hash_items(table: &ValueTable, items: &Items, version: FormatVersion, max_depth: u32, depth: u32) -> anyhow::Result<u32> {
    Ok(match items {
        Items::Values(v) => {
            let mut state = SequenceHash::new(v.len() as u32);
            for h in v {
                state.next(hash_rec(table, *h, version, max_depth, depth + 1)?);
            }
            state.end()
        }
        Items::I8(v) => hash_seq(v.iter().map(|x| hash_i32(*x as i32))),
        Items::U8(v) => hash_seq(v.iter().map(|x| hash_u32(*x as u32))),
        Items::I16(v) => hash_seq(v.iter().map(|x| hash_i32(*x as i32))),
        Items::U16(v) => hash_seq(v.iter().map(|x| hash_u32(*x as u32))),
        Items::I32(v) => hash_seq(v.iter().map(|x| hash_i32(*x))),
        Items::U32(v) => hash_seq(v.iter().map(|x| hash_u32(*x))),
        Items::Float(v) => hash_seq(v.iter().map(|x| hash_float(*x))),
    })
}

fn hash_outside(items: &OutsideItems) -> u32 {
    match items {
        OutsideItems::I8(v) => hash_seq(v.iter().map(|x| hash_i32(*x as i32))),
        OutsideItems::U8(v) => hash_seq(v.iter().map(|x| hash_u32(*x as u32))),
        OutsideItems::I16(v) => hash_seq(v.iter().map(|x| hash_i32(*x as i32))),
        OutsideItems::U16(v) => hash_seq(v.iter().map(|x| hash_u32(*x as u32))),
        OutsideItems::I32(v) => hash_seq(v.iter().map(|x| hash_i32(*x))),
        OutsideItems::U32(v) => hash_seq(v.iter().map(|x| hash_u32(*x))),
        OutsideItems::Float(v) => hash_seq(v.iter().map(|x| hash_float(*x))),
    }
}

fn hash_rec(table: &ValueTable, h: Handle, version: FormatVersion, max_depth: u32, depth: u32) -> anyhow::Result<u32> {
    if depth >= max_depth {
        bail!("maximum recursion depth reached");
    }
    Ok(match table.get(h) {
        Value::I32(v) => hash_i32(*v),
        Value::U32(v) => hash_u32(*v),
        Value::Float(v) => hash_float(*v),
        Value::Bool(v) => hash_bool(*v),
        Value::Null => hash_null(),
        Value::Unicode(idx) => hash_string(&table.unicode[*idx as usize], version),
        Value::Bitvector(Bitvector::Heap(idx)) => {
            let heap = &table.bitvectors[*idx as usize];
            hash_bits(&(0..heap.n_bits).map(|i| heap.bit(i)).collect::<Vec<_>>())
        }
        Value::Bitvector(bv) => hash_bits(&table.bits(bv)),
        Value::Vector(VectorRef::Empty) => SequenceHash::new(0).end(),
        Value::Vector(VectorRef::Outside(id)) => hash_outside(&table.outside[*id as usize]),
        Value::Vector(VectorRef::Private(id)) => {
            let pv = &table.private[*id as usize];
            if pv.items.kind().is_none() && !pv.hashable {
                bail!("vector is not hashable");
            }
            hash_items(table, &pv.items, version, max_depth, depth)?
        }
        Value::EmptySlot => bail!("the empty slot sentinel is not hashable"),
        Value::Set(_) | Value::Map(_) => bail!("sets and maps are not hashable"),
    })
}

/// Hash of the value behind `h`, which must already be known to be hashable.
pub fn hash_value(table: &ValueTable, h: Handle, version: FormatVersion, max_depth: u32) -> anyhow::Result<u32> {
    hash_rec(table, h, version, max_depth, 0)
}

#[cfg(test)]
mod test {
    use super::*;

    const V: FormatVersion = FormatVersion::Offset32NewHash;

    #[test]
    fn test_numbers_agree() -> anyhow::Result<()> {
        let mut t = ValueTable::new();
        let a = t.scalar(Value::I32(3))?;
        let b = t.scalar(Value::U32(3))?;
        let c = t.scalar(Value::Float(3.0))?;
        let d = t.scalar(Value::Float(-7.0))?;
        let e = t.scalar(Value::I32(-7))?;
        assert_eq!(hash_value(&t, a, V, 10)?, hash_value(&t, b, V, 10)?);
        assert_eq!(hash_value(&t, a, V, 10)?, hash_value(&t, c, V, 10)?);
        assert_eq!(hash_value(&t, d, V, 10)?, hash_value(&t, e, V, 10)?);
        assert_eq!(hash_bool(true), hash_u32(1));
        Ok(())
    }

    #[test]
    fn test_vector_storage_does_not_matter() -> anyhow::Result<()> {
        let data = [1_i16, 2];
        let mut t = ValueTable::new();
        let one = t.scalar(Value::I32(1))?;
        let two = t.scalar(Value::U32(2))?;
        let general = t.private_vector(Items::Values(vec![one, two]), false)?;
        t.private_at_mut(general).hashable = true;
        let packed = t.private_vector(Items::U8(vec![1, 2]), false)?;
        let outside = t.outside_vector(OutsideItems::I16(&data))?;

        let h = hash_value(&t, general, V, 10)?;
        assert_eq!(h, hash_value(&t, packed, V, 10)?);
        assert_eq!(h, hash_value(&t, outside, V, 10)?);

        let reversed = t.private_vector(Items::U8(vec![2, 1]), false)?;
        assert_ne!(h, hash_value(&t, reversed, V, 10)?);
        Ok(())
    }

    #[test]
    fn test_string_versions() {
        assert_ne!(
            hash_string("hello", FormatVersion::Offset32OldHash),
            hash_string("hello", FormatVersion::Offset32NewHash)
        );
        assert_eq!(
            hash_string("hello", FormatVersion::Offset32NewHash),
            hash_string("hello", FormatVersion::Offset64NewHash)
        );
        assert_eq!(0, hash_string("", FormatVersion::Offset32OldHash));
    }

    #[test]
    fn test_bitvector_forms_agree() -> anyhow::Result<()> {
        let mut t = ValueTable::new();
        let mut bits = vec![false; 30];
        bits.extend([true; 5]);
        let inline = t.bitvector(&bits)?;
        assert_eq!(hash_bits(&bits), hash_value(&t, inline, V, 10)?);

        bits[0] = true;
        let heap = t.bitvector(&bits)?;
        assert_eq!(hash_bits(&bits), hash_value(&t, heap, V, 10)?);
        Ok(())
    }

    #[test]
    fn test_unhashable() -> anyhow::Result<()> {
        let mut t = ValueTable::new();
        let s = t.set()?;
        assert!(hash_value(&t, s, V, 10).is_err());
        let v = t.private_vector(Items::Values(Vec::new()), false)?;
        assert!(hash_value(&t, v, V, 10).is_err());
        Ok(())
    }
}

// The value table holds every value of a graph under construction.
//
// Values refer to each other only through `Handle`s, dense indices into
// `ValueTable::values`, so forward references and cycles need no special
// treatment: nothing is resolved until the layout pass runs. Variable-size
// payloads live in per-kind side tables (private vectors, outside vectors,
// strings, heap bitvectors, sets, maps) and the value itself only carries the
// side-table index.
use std::collections::HashMap;

use anyhow::anyhow;

/// Stable reference to a value inside a `Builder`. Never reused, never
/// invalidated before the builder is finalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(pub(crate) u32);

impl Handle {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimKind {
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    Float,
}

impl PrimKind {
    pub fn width(self) -> usize {
        match self {
            PrimKind::I8 | PrimKind::U8 => 1,
            PrimKind::I16 | PrimKind::U16 => 2,
            PrimKind::I32 | PrimKind::U32 | PrimKind::Float => 4,
        }
    }
}

/// Storage of a private vector. `Values` holds handles, every other variant
/// holds primitives directly.
#[derive(Debug, Clone, PartialEq)]
pub enum Items {
    Values(Vec<Handle>),
    I8(Vec<i8>),
    U8(Vec<u8>),
    I16(Vec<i16>),
    U16(Vec<u16>),
    I32(Vec<i32>),
    U32(Vec<u32>),
    Float(Vec<f32>),
}

impl Items {
    pub fn empty(kind: Option<PrimKind>) -> Self {
        match kind {
            None => Items::Values(Vec::new()),
            Some(PrimKind::I8) => Items::I8(Vec::new()),
            Some(PrimKind::U8) => Items::U8(Vec::new()),
            Some(PrimKind::I16) => Items::I16(Vec::new()),
            Some(PrimKind::U16) => Items::U16(Vec::new()),
            Some(PrimKind::I32) => Items::I32(Vec::new()),
            Some(PrimKind::U32) => Items::U32(Vec::new()),
            Some(PrimKind::Float) => Items::Float(Vec::new()),
        }
    }

    /// `None` for handle vectors.
    pub fn kind(&self) -> Option<PrimKind> {
        match self {
            Items::Values(_) => None,
            Items::I8(_) => Some(PrimKind::I8),
            Items::U8(_) => Some(PrimKind::U8),
            Items::I16(_) => Some(PrimKind::I16),
            Items::U16(_) => Some(PrimKind::U16),
            Items::I32(_) => Some(PrimKind::I32),
            Items::U32(_) => Some(PrimKind::U32),
            Items::Float(_) => Some(PrimKind::Float),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Items::Values(v) => v.len(),
            Items::I8(v) => v.len(),
            Items::U8(v) => v.len(),
            Items::I16(v) => v.len(),
            Items::U16(v) => v.len(),
            Items::I32(v) => v.len(),
            Items::U32(v) => v.len(),
            Items::Float(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Borrowed view of primitive storage, `None` for handle vectors.
    pub fn prims(&self) -> Option<OutsideItems<'_>> {
        Some(match self {
            Items::Values(_) => return None,
            Items::I8(v) => OutsideItems::I8(v),
            Items::U8(v) => OutsideItems::U8(v),
            Items::I16(v) => OutsideItems::I16(v),
            Items::U16(v) => OutsideItems::U16(v),
            Items::I32(v) => OutsideItems::I32(v),
            Items::U32(v) => OutsideItems::U32(v),
            Items::Float(v) => OutsideItems::Float(v),
        })
    }

    fn same_kind(&self, other: &Items) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

/// Caller-owned primitive storage, written to the heap as-is.
#[derive(Debug, Clone, Copy)]
pub enum OutsideItems<'a> {
    I8(&'a [i8]),
    U8(&'a [u8]),
    I16(&'a [i16]),
    U16(&'a [u16]),
    I32(&'a [i32]),
    U32(&'a [u32]),
    Float(&'a [f32]),
}

impl<'a> OutsideItems<'a> {
    pub fn kind(&self) -> PrimKind {
        match self {
            OutsideItems::I8(_) => PrimKind::I8,
            OutsideItems::U8(_) => PrimKind::U8,
            OutsideItems::I16(_) => PrimKind::I16,
            OutsideItems::U16(_) => PrimKind::U16,
            OutsideItems::I32(_) => PrimKind::I32,
            OutsideItems::U32(_) => PrimKind::U32,
            OutsideItems::Float(_) => PrimKind::Float,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            OutsideItems::I8(v) => v.len(),
            OutsideItems::U8(v) => v.len(),
            OutsideItems::I16(v) => v.len(),
            OutsideItems::U16(v) => v.len(),
            OutsideItems::I32(v) => v.len(),
            OutsideItems::U32(v) => v.len(),
            OutsideItems::Float(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

mod sealed {
    pub trait Sealed {}
}

/// Element types a primitive vector can hold.
pub trait Primitive: Copy + sealed::Sealed {
    const KIND: PrimKind;

    fn push_into(self, items: &mut Items) -> bool;
    fn into_items(v: Vec<Self>) -> Items;
    fn outside(v: &[Self]) -> OutsideItems<'_>;
}

macro_rules! primitive {
    ($t:ty, $variant:ident) => {
        impl sealed::Sealed for $t {}

        impl Primitive for $t {
            const KIND: PrimKind = PrimKind::$variant;

            fn push_into(self, items: &mut Items) -> bool {
                match items {
                    Items::$variant(v) => {
                        if v.try_reserve(1).is_err() {
                            return false;
                        }
                        v.push(self);
                        true
                    }
                    _ => panic!("appending {:?} to a vector of {:?}", Self::KIND, items.kind()),
                }
            }

            fn into_items(v: Vec<Self>) -> Items {
                Items::$variant(v)
            }

            fn outside(v: &[Self]) -> OutsideItems<'_> {
                OutsideItems::$variant(v)
            }
        }
    };
}

primitive!(i8, I8);
primitive!(u8, U8);
primitive!(i16, I16);
primitive!(u16, U16);
primitive!(i32, I32);
primitive!(u32, U32);
primitive!(f32, Float);

#[derive(Debug)]
pub struct PrivateVector {
    pub(crate) items: Items,
    // hash/key/value vectors of a set or map
    pub(crate) reserved: bool,
    pub(crate) hashable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HeapBits {
    pub(crate) n_bits: u32,
    pub(crate) bytes: Vec<u8>,
}

impl HeapBits {
    pub fn bit(&self, i: u32) -> bool {
        self.bytes[(i / 8) as usize] & (1 << (i % 8)) != 0
    }
}

/// The five shapes a bitvector can take. Everything but `Heap` fits inline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Bitvector {
    Zeros(u32),
    Ones(u32),
    Packed { n_bits: u32, bits: u32 },
    // a run of zeros followed by a run of ones
    ZeroOne { zeros: u16, ones: u16 },
    OneZero { ones: u16, zeros: u16 },
    Heap(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VectorRef {
    Empty,
    Private(u32),
    Outside(u32),
}

/// Private and outside vectors live in separate id spaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContainerId {
    Private(u32),
    Outside(u32),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    I32(i32),
    U32(u32),
    Float(f32),
    Bool(bool),
    Null,
    EmptySlot,
    Unicode(u32),
    Bitvector(Bitvector),
    Vector(VectorRef),
    Set(u32),
    Map(u32),
}

/// Key under which small values are interned. Floats are keyed by bit
/// pattern so that distinct NaNs and signed zeros stay distinct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum ScalarKey {
    I32(i32),
    U32(u32),
    Float(u32),
    Bool(bool),
    Null,
    EmptySlot,
}

impl ScalarKey {
    fn of(v: &Value) -> Option<Self> {
        Some(match *v {
            Value::I32(x) => ScalarKey::I32(x),
            Value::U32(x) => ScalarKey::U32(x),
            Value::Float(x) => ScalarKey::Float(x.to_bits()),
            Value::Bool(x) => ScalarKey::Bool(x),
            Value::Null => ScalarKey::Null,
            Value::EmptySlot => ScalarKey::EmptySlot,
            _ => return None,
        })
    }
}

#[derive(Debug)]
pub struct HashTable {
    pub(crate) keys: Vec<Handle>,
    // absent for sets
    pub(crate) values: Option<Vec<Handle>>,
    pub(crate) serialize_hash: Handle,
    pub(crate) serialize_keys: Handle,
    pub(crate) serialize_values: Option<Handle>,
}

fn push_checked<T>(v: &mut Vec<T>, t: T) -> anyhow::Result<usize> {
    v.try_reserve(1)
        .map_err(|_| anyhow!("out of memory"))?;
    v.push(t);
    Ok(v.len() - 1)
}

#[derive(Debug, Default)]
pub struct ValueTable<'a> {
    pub(crate) values: Vec<Value>,
    pub(crate) private: Vec<PrivateVector>,
    pub(crate) outside: Vec<OutsideItems<'a>>,
    pub(crate) unicode: Vec<String>,
    pub(crate) bitvectors: Vec<HeapBits>,
    pub(crate) sets: Vec<HashTable>,
    pub(crate) maps: Vec<HashTable>,

    scalars: HashMap<ScalarKey, Handle>,
    unicode_index: HashMap<String, Handle>,
    bitvector_index: HashMap<HeapBits, Handle>,
}

impl<'a> ValueTable<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, h: Handle) -> &Value {
        &self.values[h.index()]
    }

    pub fn contains(&self, h: Handle) -> bool {
        h.index() < self.values.len()
    }

    /// Swaps the whole value stored under `h`.
    pub fn replace(&mut self, h: Handle, v: Value) -> Value {
        std::mem::replace(&mut self.values[h.index()], v)
    }

    fn push_value(&mut self, v: Value) -> anyhow::Result<Handle> {
        let idx = push_checked(&mut self.values, v)?;
        Ok(Handle(idx as u32))
    }

    /// Creates a scalar, returning the existing handle if an identical scalar
    /// was created before.
    pub fn scalar(&mut self, v: Value) -> anyhow::Result<Handle> {
        let key = match ScalarKey::of(&v) {
            Some(key) => key,
            None => panic!("{:?} is not a scalar", v),
        };
        if let Some(h) = self.scalars.get(&key) {
            return Ok(*h);
        }
        self.scalars
            .try_reserve(1)
            .map_err(|_| anyhow!("out of memory"))?;
        let h = self.push_value(v)?;
        self.scalars.insert(key, h);
        Ok(h)
    }

    pub fn empty_slot(&mut self) -> anyhow::Result<Handle> {
        self.scalar(Value::EmptySlot)
    }

    pub fn unicode(&mut self, s: &str) -> anyhow::Result<Handle> {
        if let Some(h) = self.unicode_index.get(s) {
            return Ok(*h);
        }
        self.unicode_index
            .try_reserve(1)
            .map_err(|_| anyhow!("out of memory"))?;
        let idx = push_checked(&mut self.unicode, s.to_owned())?;
        let h = match self.push_value(Value::Unicode(idx as u32)) {
            Ok(h) => h,
            Err(e) => {
                self.unicode.pop();
                return Err(e);
            }
        };
        self.unicode_index.insert(s.to_owned(), h);
        Ok(h)
    }

    pub fn bitvector(&mut self, bits: &[bool]) -> anyhow::Result<Handle> {
        let n_bits: u32 = bits.len().try_into()?;
        let form = if bits.iter().all(|b| !*b) {
            Some(Bitvector::Zeros(n_bits))
        } else if bits.iter().all(|b| *b) {
            Some(Bitvector::Ones(n_bits))
        } else if n_bits <= 27 {
            let packed = bits
                .iter()
                .enumerate()
                .filter(|(_, b)| **b)
                .fold(0_u32, |acc, (i, _)| acc | (1 << i));
            Some(Bitvector::Packed {
                n_bits,
                bits: packed,
            })
        } else {
            two_runs(bits)
        };

        if let Some(form) = form {
            return self.push_value(Value::Bitvector(form));
        }

        let mut bytes = vec![0_u8; bits.len().div_ceil(8)];
        for (i, b) in bits.iter().enumerate() {
            if *b {
                bytes[i / 8] |= 1 << (i % 8);
            }
        }
        let heap = HeapBits { n_bits, bytes };
        if let Some(h) = self.bitvector_index.get(&heap) {
            return Ok(*h);
        }

        self.bitvector_index
            .try_reserve(1)
            .map_err(|_| anyhow!("out of memory"))?;
        let idx = push_checked(&mut self.bitvectors, heap.clone())?;
        let h = match self.push_value(Value::Bitvector(Bitvector::Heap(idx as u32))) {
            Ok(h) => h,
            Err(e) => {
                self.bitvectors.pop();
                return Err(e);
            }
        };
        self.bitvector_index.insert(heap, h);
        Ok(h)
    }

    pub fn private_vector(&mut self, items: Items, reserved: bool) -> anyhow::Result<Handle> {
        let idx = push_checked(
            &mut self.private,
            PrivateVector {
                items,
                reserved,
                hashable: false,
            },
        )?;
        match self.push_value(Value::Vector(VectorRef::Private(idx as u32))) {
            Ok(h) => Ok(h),
            Err(e) => {
                self.private.pop();
                Err(e)
            }
        }
    }

    pub fn outside_vector(&mut self, items: OutsideItems<'a>) -> anyhow::Result<Handle> {
        if items.is_empty() {
            return self.push_value(Value::Vector(VectorRef::Empty));
        }
        let idx = push_checked(&mut self.outside, items)?;
        match self.push_value(Value::Vector(VectorRef::Outside(idx as u32))) {
            Ok(h) => Ok(h),
            Err(e) => {
                self.outside.pop();
                Err(e)
            }
        }
    }

    /// Private vector id behind `h`, which must be a private vector.
    pub fn private_id(&self, h: Handle) -> usize {
        match self.get(h) {
            Value::Vector(VectorRef::Private(id)) => *id as usize,
            v => panic!("{:?} is not a private vector", v),
        }
    }

    pub fn private_at(&self, h: Handle) -> &PrivateVector {
        &self.private[self.private_id(h)]
    }

    pub fn private_at_mut(&mut self, h: Handle) -> &mut PrivateVector {
        let id = self.private_id(h);
        &mut self.private[id]
    }

    pub fn append(&mut self, vector: Handle, v: Handle) -> anyhow::Result<()> {
        if !self.contains(v) {
            anyhow::bail!("appended handle does not exist");
        }
        match &mut self.private_at_mut(vector).items {
            Items::Values(items) => {
                push_checked(items, v)?;
                Ok(())
            }
            items => panic!("appending a value to a vector of {:?}", items.kind()),
        }
    }

    pub fn append_prim<T: Primitive>(&mut self, vector: Handle, v: T) -> anyhow::Result<()> {
        if !v.push_into(&mut self.private_at_mut(vector).items) {
            anyhow::bail!("out of memory");
        }
        Ok(())
    }

    /// Moves `items` into an empty private vector of the same kind.
    pub fn transfer(&mut self, vector: Handle, items: Items) -> anyhow::Result<()> {
        if let Items::Values(handles) = &items {
            if handles.iter().any(|h| !self.contains(*h)) {
                anyhow::bail!("transferred handle does not exist");
            }
        }
        let pv = self.private_at_mut(vector);
        assert!(
            pv.items.same_kind(&items),
            "transferring {:?} into a vector of {:?}",
            items.kind(),
            pv.items.kind()
        );
        if !pv.items.is_empty() {
            anyhow::bail!("can only transfer into an empty vector");
        }
        pv.items = items;
        Ok(())
    }

    fn hash_table(&mut self, is_map: bool) -> anyhow::Result<Handle> {
        let serialize_hash = self.private_vector(Items::U32(Vec::new()), true)?;
        let serialize_keys = self.private_vector(Items::Values(Vec::new()), true)?;
        let serialize_values = if is_map {
            Some(self.private_vector(Items::Values(Vec::new()), true)?)
        } else {
            None
        };
        let table = HashTable {
            keys: Vec::new(),
            values: if is_map { Some(Vec::new()) } else { None },
            serialize_hash,
            serialize_keys,
            serialize_values,
        };
        let value = if is_map {
            Value::Map(push_checked(&mut self.maps, table)? as u32)
        } else {
            Value::Set(push_checked(&mut self.sets, table)? as u32)
        };
        match self.push_value(value) {
            Ok(h) => Ok(h),
            Err(e) => {
                if is_map {
                    self.maps.pop();
                } else {
                    self.sets.pop();
                }
                Err(e)
            }
        }
    }

    pub fn set(&mut self) -> anyhow::Result<Handle> {
        self.hash_table(false)
    }

    pub fn map(&mut self) -> anyhow::Result<Handle> {
        self.hash_table(true)
    }

    pub fn set_add(&mut self, set: Handle, key: Handle) -> anyhow::Result<()> {
        if !self.contains(key) {
            anyhow::bail!("key handle does not exist");
        }
        let id = match self.get(set) {
            Value::Set(id) => *id as usize,
            v => panic!("{:?} is not a set", v),
        };
        push_checked(&mut self.sets[id].keys, key)?;
        Ok(())
    }

    pub fn map_add(&mut self, map: Handle, key: Handle, value: Handle) -> anyhow::Result<()> {
        if !self.contains(key) || !self.contains(value) {
            anyhow::bail!("key or value handle does not exist");
        }
        let id = match self.get(map) {
            Value::Map(id) => *id as usize,
            v => panic!("{:?} is not a map", v),
        };
        let table = &mut self.maps[id];
        push_checked(&mut table.keys, key)?;
        if let Some(values) = &mut table.values {
            if let Err(e) = push_checked(values, value) {
                table.keys.pop();
                return Err(e);
            }
        }
        Ok(())
    }

    /// Container identity of a vector handle, `None` for everything that
    /// is not a non-empty vector.
    pub fn container_id(&self, h: Handle) -> Option<ContainerId> {
        match self.get(h) {
            Value::Vector(VectorRef::Private(id)) => Some(ContainerId::Private(*id)),
            Value::Vector(VectorRef::Outside(id)) => Some(ContainerId::Outside(*id)),
            _ => None,
        }
    }

    /// Logical bits of a bitvector value.
    pub fn bits(&self, bv: &Bitvector) -> Vec<bool> {
        match *bv {
            Bitvector::Zeros(n) => vec![false; n as usize],
            Bitvector::Ones(n) => vec![true; n as usize],
            Bitvector::Packed { n_bits, bits } => (0..n_bits).map(|i| bits & (1 << i) != 0).collect(),
            Bitvector::ZeroOne { zeros, ones } => std::iter::repeat(false)
                .take(zeros as usize)
                .chain(std::iter::repeat(true).take(ones as usize))
                .collect(),
            Bitvector::OneZero { ones, zeros } => std::iter::repeat(true)
                .take(ones as usize)
                .chain(std::iter::repeat(false).take(zeros as usize))
                .collect(),
            Bitvector::Heap(idx) => {
                let heap = &self.bitvectors[idx as usize];
                (0..heap.n_bits).map(|i| heap.bit(i)).collect()
            }
        }
    }
}

// Finds a single 0->1 or 1->0 transition with both runs short enough to be
// stored inline.
fn two_runs(bits: &[bool]) -> Option<Bitvector> {
    let first = *bits.first()?;
    let split = bits.iter().position(|b| *b != first)?;
    if bits[split..].iter().any(|b| *b == first) {
        return None;
    }
    let a: u16 = split.try_into().ok()?;
    let b: u16 = (bits.len() - split).try_into().ok()?;
    Some(if first {
        Bitvector::OneZero { ones: a, zeros: b }
    } else {
        Bitvector::ZeroOne { zeros: a, ones: b }
    })
}

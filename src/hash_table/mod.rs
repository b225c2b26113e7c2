// Open-addressed hash tables behind sets and maps.
//
// A table is three parallel vectors of `n_buckets` entries: the key hashes,
// the keys and (for maps) the values. Unused buckets hold hash 0 and the
// empty-slot sentinel. The bucket count and the probe sequence below are
// shared with the reader, which walks the same sequence to look a key up, so
// neither can change without breaking existing files.
//
// Both follow the CPython dict scheme (2/3 load factor, perturbed probe).
// They have not been checked against any other reader of this format.
//
// Keys are not deduplicated. Two equal keys both get a bucket, and a lookup
// finds whichever comes first in the probe sequence.
use anyhow::{anyhow, bail};

use crate::{
    encoding::FormatVersion,
    hash::hash_value,
    hashable::check_hashable,
    value::{Handle, Items, Value, ValueTable, VectorRef},
};

const MIN_BUCKETS: u64 = 8;
const PERTURB_SHIFT: u32 = 5;

/// Smallest power of two >= 8 keeping the load factor at or below 2/3.
pub fn n_buckets(n_keys: u32) -> anyhow::Result<u32> {
    let mut n = MIN_BUCKETS;
    while 3 * n_keys as u64 > 2 * n {
        n *= 2;
    }
    u32::try_from(n).map_err(|_| anyhow!("too many keys for a hash table"))
}

/// Bucket sequence for `hash` in a table of `n_buckets` (a power of two)
/// buckets. Once the perturbation is shifted out the sequence cycles
/// through every bucket.
pub struct Probe {
    i: u32,
    perturb: u32,
    mask: u32,
}

impl Probe {
    pub fn new(hash: u32, n_buckets: u32) -> Self {
        debug_assert!(n_buckets.is_power_of_two());
        let mask = n_buckets - 1;
        Probe {
            i: hash & mask,
            perturb: hash,
            mask,
        }
    }
}

impl Iterator for Probe {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        let slot = (self.i & self.mask) as usize;
        self.i = self
            .i
            .wrapping_mul(5)
            .wrapping_add(1)
            .wrapping_add(self.perturb);
        self.perturb >>= PERTURB_SHIFT;
        Some(slot)
    }
}

/// Assigns every key (by position in `hashes`) a bucket. Keys are placed in
/// order, so on a collision the earlier key keeps the earlier bucket.
pub fn place(hashes: &[u32], n_buckets: u32) -> Vec<Option<usize>> {
    let mut buckets = vec![None; n_buckets as usize];
    for (k, h) in hashes.iter().enumerate() {
        for slot in Probe::new(*h, n_buckets) {
            if buckets[slot].is_none() {
                buckets[slot] = Some(k);
                break;
            }
        }
    }
    buckets
}

#[derive(Debug, Clone, Copy)]
pub enum TableRef {
    Set(usize),
    Map(usize),
}

fn key_is_hashable(table: &ValueTable, h: Handle) -> bool {
    match table.get(h) {
        Value::Set(_) | Value::Map(_) | Value::EmptySlot => false,
        Value::Vector(VectorRef::Private(id)) => {
            let pv = &table.private[*id as usize];
            pv.items.kind().is_some() || pv.hashable
        }
        _ => true,
    }
}

/// Fills the reserved hash/key/value vectors of a set or map. Vectors must
/// already be classified so that key hashability is known.
pub fn build(table: &mut ValueTable, which: TableRef, version: FormatVersion, max_depth: u32) -> anyhow::Result<()> {
    let empty = table.empty_slot()?;

    let ht = match which {
        TableRef::Set(id) => &table.sets[id],
        TableRef::Map(id) => &table.maps[id],
    };
    let n_keys: u32 = ht.keys.len().try_into()?;
    let n = n_buckets(n_keys)?;

    let mut hashes = Vec::new();
    hashes
        .try_reserve_exact(ht.keys.len())
        .map_err(|_| anyhow!("out of memory"))?;
    for key in &ht.keys {
        if matches!(table.get(*key), Value::EmptySlot) {
            bail!("key in set/map is the empty slot sentinel");
        }
        if !key_is_hashable(table, *key) {
            bail!("key in set/map is not hashable");
        }
        hashes.push(hash_value(table, *key, version, max_depth)?);
    }

    let buckets = place(&hashes, n);
    let hash_items: Vec<u32> = buckets
        .iter()
        .map(|b| b.map_or(0, |k| hashes[k]))
        .collect();
    let key_items: Vec<Handle> = buckets
        .iter()
        .map(|b| b.map_or(empty, |k| ht.keys[k]))
        .collect();
    let value_items: Option<Vec<Handle>> = ht.values.as_ref().map(|values| {
        buckets
            .iter()
            .map(|b| b.map_or(empty, |k| values[k]))
            .collect()
    });

    let (sh, sk, sv) = (ht.serialize_hash, ht.serialize_keys, ht.serialize_values);

    tracing::trace!(?which, n_keys, n_buckets = n, "built hash table");

    table.transfer(sh, Items::U32(hash_items))?;
    table.transfer(sk, Items::Values(key_items))?;
    table.private_at_mut(sk).hashable = true;
    if let (Some(sv), Some(value_items)) = (sv, value_items) {
        table.transfer(sv, Items::Values(value_items))?;
        let hashable = check_hashable(table, sv, max_depth)?;
        table.private_at_mut(sv).hashable = hashable;
    }

    Ok(())
}

use std::collections::HashMap;

use rand::Rng;

use crate::{
    encoding::{align4, FormatVersion, RawValue, Tag},
    hash::hash_u32,
    hash_table::Probe,
    options::Options,
    sink::MockSink,
    value::{Handle, Items, OutsideItems, Value, ValueTable},
    view::GraphView,
};

use super::finalize;

const CHARS: [char; 6] = ['a', 'b', 'z', 'é', '€', '𝄞'];

fn random_table<'a>(rng: &mut impl Rng, pool: &'a [Vec<u16>]) -> (ValueTable<'a>, Handle) {
    let mut t = ValueTable::new();
    let mut made: Vec<Handle> = Vec::new();
    for _ in 0..rng.gen_range(0..60) {
        let h = match rng.gen_range(0..7) {
            0 => {
                let s: String = (0..rng.gen_range(0..6))
                    .map(|_| CHARS[rng.gen_range(0..CHARS.len())])
                    .collect();
                t.unicode(&s).unwrap()
            }
            1 => {
                let n = rng.gen_range(1..10);
                let items = match rng.gen_range(0..4) {
                    0 => Items::U8((0..n).map(|_| rng.gen()).collect()),
                    1 => Items::I16((0..n).map(|_| rng.gen()).collect()),
                    2 => Items::U32((0..n).map(|_| rng.gen()).collect()),
                    _ => Items::Float((0..n).map(|_| rng.gen()).collect()),
                };
                t.private_vector(items, false).unwrap()
            }
            2 => {
                let data = &pool[rng.gen_range(0..pool.len())];
                t.outside_vector(OutsideItems::U16(data)).unwrap()
            }
            3 => {
                let bits: Vec<bool> = (0..rng.gen_range(0..80)).map(|_| rng.gen()).collect();
                t.bitvector(&bits).unwrap()
            }
            4 => {
                let v = t.private_vector(Items::Values(Vec::new()), false).unwrap();
                for _ in 0..rng.gen_range(0..5) {
                    if made.is_empty() {
                        break;
                    }
                    let child = made[rng.gen_range(0..made.len())];
                    t.append(v, child).unwrap();
                }
                v
            }
            5 => {
                let s = t.set().unwrap();
                for _ in 0..rng.gen_range(0..12) {
                    let k = t.scalar(Value::I32(rng.gen_range(-50..50))).unwrap();
                    t.set_add(s, k).unwrap();
                }
                s
            }
            _ => {
                let m = t.map().unwrap();
                for _ in 0..rng.gen_range(0..12) {
                    let k = t.scalar(Value::U32(rng.gen())).unwrap();
                    let v = if made.is_empty() {
                        k
                    } else {
                        made[rng.gen_range(0..made.len())]
                    };
                    t.map_add(m, k, v).unwrap();
                }
                m
            }
        };
        made.push(h);
    }

    let root = t.private_vector(Items::Values(Vec::new()), false).unwrap();
    t.transfer(root, Items::Values(made)).unwrap();
    (t, root)
}

// Heap item sizes, recovered from the references into each section.
fn item_sizes(view: &GraphView) -> anyhow::Result<Vec<u64>> {
    let h = view.header().clone();
    let mut vector_width: HashMap<u32, usize> = HashMap::new();
    let mut pending = vec![h.root];
    for i in 0..h.n_set {
        let set = view.set(i)?;
        pending.extend([set.hash, set.keys]);
    }
    for i in 0..h.n_map {
        let map = view.map(i)?;
        pending.extend([map.hash, map.keys]);
        pending.extend(map.values);
    }
    while let Some(v) = pending.pop() {
        let width = match v.tag.element_width() {
            Some(width) => width,
            None => continue,
        };
        if vector_width.insert(v.data, width).is_none() && v.tag.is_general_vector() {
            pending.extend(view.vector_items(v.data)?);
        }
    }

    let mut sizes = Vec::new();
    for i in 0..h.n_unicode {
        sizes.push(4 * (view.unicode(i)?.chars().count() as u64 + 2));
    }
    for i in 0..h.n_vector {
        let width = vector_width[&i] as u64;
        sizes.push(4 + view.vector_len(i)? as u64 * width);
    }
    for i in 0..h.n_bitvector {
        sizes.push(4 + (view.bitvector(i)?.len() as u64).div_ceil(8));
    }
    sizes.extend((0..h.n_set).map(|_| 24));
    sizes.extend((0..h.n_map).map(|_| 32));
    Ok(sizes)
}

#[test]
fn test_offsets_predict_heap() {
    let mut rng = rand::thread_rng();
    let pool: Vec<Vec<u16>> = (0..4)
        .map(|i| (0..i * 3).map(|_| rng.gen()).collect())
        .collect();

    for _ in 0..200 {
        let (table, root) = random_table(&mut rng, &pool);
        let version = FormatVersion::from_u32(rng.gen_range(0..3)).unwrap();
        let opts = Options {
            version,
            ..Options::default()
        };
        let mut sink = MockSink::new();
        let header = finalize(table, Some(root), &opts, &mut sink).unwrap();

        let view = GraphView::open(&sink.data).unwrap();
        assert_eq!(&header, view.header());

        let offsets = view.offsets();
        let sizes = item_sizes(&view).unwrap();
        assert_eq!(offsets.len(), sizes.len());

        let heap_base = sink.data.len() - view.heap_len();
        assert_eq!(32 + offsets.len() * version.offset_width(), heap_base);
        for (i, (offset, size)) in offsets.iter().zip(sizes.iter()).enumerate() {
            let end = align4(offset + size);
            let next = offsets.get(i + 1).copied().unwrap_or(view.heap_len() as u64);
            assert_eq!(end, next);
            let pad = &sink.data[heap_base + (offset + size) as usize..heap_base + end as usize];
            assert!(pad.iter().all(|b| *b == 0));
        }
    }
}

#[test]
fn test_sink_failure_propagates() {
    let build = || {
        let mut t = ValueTable::new();
        let v = t.private_vector(Items::Values(Vec::new()), false).unwrap();
        let s = t.unicode("abc").unwrap();
        let m = t.map().unwrap();
        t.map_add(m, s, s).unwrap();
        t.append(v, s).unwrap();
        t.append(v, m).unwrap();
        (t, v)
    };

    let (t, root) = build();
    let mut sink = MockSink::new();
    finalize(t, Some(root), &Options::default(), &mut sink).unwrap();
    let n_writes = sink.n_writes;
    assert!(n_writes > 3);

    for crash_at in 0..n_writes {
        let (t, root) = build();
        let mut sink = MockSink::new();
        sink.schedule_crash(crash_at);
        let err = finalize(t, Some(root), &Options::default(), &mut sink).unwrap_err();
        assert_eq!("sink is down", err.to_string());
    }
}

#[test]
fn test_map_lookup_by_probe() -> anyhow::Result<()> {
    let mut t = ValueTable::new();
    let m = t.map()?;
    let mut expect = Vec::new();
    for i in 0..40_u32 {
        let k = t.scalar(Value::U32(i * 7919))?;
        let v = t.scalar(Value::I32(-(i as i32)))?;
        t.map_add(m, k, v)?;
        expect.push((i * 7919, -(i as i32)));
    }
    let mut sink = MockSink::new();
    finalize(t, Some(m), &Options::default(), &mut sink)?;

    let view = GraphView::open(&sink.data)?;
    let map = view.map(0)?;
    assert_eq!(40, map.n_items);
    let hashes = view.u32_items(map.hash.data)?;
    let keys = view.vector_items(map.keys.data)?;
    let values = view.vector_items(map.values.unwrap().data)?;
    assert_eq!(Tag::VectorHashable, map.keys.tag);
    assert_eq!(64, keys.len());

    for (k, v) in expect {
        let h = hash_u32(k);
        let slot = Probe::new(h, keys.len() as u32)
            .find(|slot| keys[*slot] == RawValue::new(Tag::U32, k))
            .unwrap();
        assert_eq!(h, hashes[slot]);
        assert_eq!(RawValue::new(Tag::I32, v as u32), values[slot]);
    }
    let n_empty = keys
        .iter()
        .filter(|k| **k == RawValue::new(Tag::EmptySlot, 0))
        .count();
    assert_eq!(64 - 40, n_empty);
    Ok(())
}

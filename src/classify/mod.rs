// Picks the narrowest primitive representation for a general vector.
//
// Only vectors made entirely of integers, or entirely of floats, compress.
// Integers are placed on one combined number line regardless of whether they
// were created signed or unsigned; the unsigned ladder is tried first when
// nothing is negative.
use crate::value::{Handle, Items, PrimKind, Value, ValueTable};

pub fn classify(table: &ValueTable, items: &[Handle]) -> Option<PrimKind> {
    let mut range: Option<(i64, i64)> = None;
    let mut saw_float = false;

    for h in items {
        let cur = match table.get(*h) {
            Value::I32(v) => *v as i64,
            Value::U32(v) => *v as i64,
            Value::Float(_) => {
                saw_float = true;
                if range.is_some() {
                    return None;
                }
                continue;
            }
            _ => return None,
        };
        if saw_float {
            return None;
        }
        range = Some(match range {
            None => (cur, cur),
            Some((lo, hi)) => (lo.min(cur), hi.max(cur)),
        });
    }

    if saw_float {
        return Some(PrimKind::Float);
    }

    let (lo, hi) = range?;
    if lo >= 0 {
        if hi <= u8::MAX as i64 {
            return Some(PrimKind::U8);
        } else if hi <= u16::MAX as i64 {
            return Some(PrimKind::U16);
        } else if hi <= u32::MAX as i64 {
            return Some(PrimKind::U32);
        }
    }

    if i8::MIN as i64 <= lo && hi <= i8::MAX as i64 {
        Some(PrimKind::I8)
    } else if i16::MIN as i64 <= lo && hi <= i16::MAX as i64 {
        Some(PrimKind::I16)
    } else if i32::MIN as i64 <= lo && hi <= i32::MAX as i64 {
        Some(PrimKind::I32)
    } else {
        // negative i32s mixed with u32s above i32::MAX
        None
    }
}

fn int_at(table: &ValueTable, h: Handle) -> i64 {
    match table.get(h) {
        Value::I32(v) => *v as i64,
        Value::U32(v) => *v as i64,
        v => panic!("{:?} in an integer vector", v),
    }
}

/// Re-encodes a handle stream as primitives of `kind`, reading each scalar's
/// raw value. Integers are narrowed by truncation.
pub fn compress(table: &ValueTable, items: &[Handle], kind: PrimKind) -> Items {
    let ints = items.iter().map(|h| int_at(table, *h));
    match kind {
        PrimKind::I8 => Items::I8(ints.map(|v| v as i8).collect()),
        PrimKind::U8 => Items::U8(ints.map(|v| v as u8).collect()),
        PrimKind::I16 => Items::I16(ints.map(|v| v as i16).collect()),
        PrimKind::U16 => Items::U16(ints.map(|v| v as u16).collect()),
        PrimKind::I32 => Items::I32(ints.map(|v| v as i32).collect()),
        PrimKind::U32 => Items::U32(ints.map(|v| v as u32).collect()),
        PrimKind::Float => Items::Float(
            items
                .iter()
                .map(|h| match table.get(*h) {
                    Value::Float(f) => *f,
                    v => panic!("{:?} in a float vector", v),
                })
                .collect(),
        ),
    }
}

/// Compresses the private general vector `h` in place if possible. Returns
/// whether it was compressed.
pub fn compress_vector(table: &mut ValueTable, h: Handle) -> bool {
    let pv = table.private_at(h);
    debug_assert!(!pv.reserved && !pv.items.is_empty());
    let items = match &pv.items {
        Items::Values(items) => items,
        _ => return false,
    };
    let kind = match classify(table, items) {
        Some(kind) => kind,
        None => return false,
    };
    let compressed = compress(table, items, kind);
    table.private_at_mut(h).items = compressed;
    true
}

#[cfg(test)]
pub(crate) fn parse_scalar(table: &mut ValueTable, token: &str) -> anyhow::Result<Handle> {
    match token {
        "null" => table.scalar(Value::Null),
        "true" => table.scalar(Value::Bool(true)),
        "false" => table.scalar(Value::Bool(false)),
        _ if token.starts_with('"') => table.unicode(token.trim_matches('"')),
        _ if token.ends_with('u') => table.scalar(Value::U32(token.trim_end_matches('u').parse()?)),
        _ if token.contains('.') => table.scalar(Value::Float(token.parse()?)),
        _ => table.scalar(Value::I32(token.parse()?)),
    }
}

#[cfg(test)]
fn kind_name(items: &Items) -> &'static str {
    match items.kind() {
        None => "general",
        Some(PrimKind::I8) => "i8",
        Some(PrimKind::U8) => "u8",
        Some(PrimKind::I16) => "i16",
        Some(PrimKind::U16) => "u16",
        Some(PrimKind::I32) => "i32",
        Some(PrimKind::U32) => "u32",
        Some(PrimKind::Float) => "float",
    }
}

#[test]
fn test_classify() {
    datadriven::walk("src/classify/testdata/", |f| {
        f.run(|test_case| match test_case.directive.as_str() {
            "classify" => {
                let mut table = ValueTable::new();
                let v = table.private_vector(Items::Values(Vec::new()), false).unwrap();
                for token in test_case.input.split_whitespace() {
                    let h = parse_scalar(&mut table, token).unwrap();
                    table.append(v, h).unwrap();
                }
                compress_vector(&mut table, v);
                let items = &table.private_at(v).items;
                let mut out = kind_name(items).to_owned();
                match items {
                    Items::I8(x) => out.push_str(&format!(" {:?}", x)),
                    Items::U8(x) => out.push_str(&format!(" {:?}", x)),
                    Items::I16(x) => out.push_str(&format!(" {:?}", x)),
                    Items::U16(x) => out.push_str(&format!(" {:?}", x)),
                    Items::I32(x) => out.push_str(&format!(" {:?}", x)),
                    Items::U32(x) => out.push_str(&format!(" {:?}", x)),
                    Items::Float(x) => out.push_str(&format!(" {:?}", x)),
                    Items::Values(_) => {}
                }
                out.push('\n');
                out
            }
            _ => panic!("unhandled"),
        })
    })
}

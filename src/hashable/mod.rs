// Decides whether a general vector may be used as a set member or map key.
//
// A vector is hashable when nothing reachable from it is a set or a map and
// it does not reach itself. The walk keeps an on-path mark per private vector:
// set on entry, cleared on exit, so a vector shared by two siblings is fine
// while a vector met again below itself is a cycle. Outside vectors only ever
// hold primitives and end the walk immediately.
use anyhow::bail;

use crate::value::{ContainerId, Handle, Items, Value, ValueTable};

struct Walk<'t, 'a> {
    table: &'t ValueTable<'a>,
    on_path: Vec<bool>,
    max_depth: u32,
}

impl<'t, 'a> Walk<'t, 'a> {
    fn visit(&mut self, h: Handle, depth: u32) -> anyhow::Result<bool> {
        if depth >= self.max_depth {
            bail!("maximum recursion depth reached");
        }

        let table = self.table;
        let id = match table.container_id(h) {
            Some(ContainerId::Outside(_)) => return Ok(true),
            Some(ContainerId::Private(id)) => id as usize,
            None => return Ok(leaf_is_hashable(table.get(h))),
        };

        let children = match &table.private[id].items {
            Items::Values(children) => children,
            _ => return Ok(true),
        };

        if self.on_path[id] {
            return Ok(false);
        }

        self.on_path[id] = true;
        for child in children {
            if !self.visit(*child, depth + 1)? {
                self.on_path[id] = false;
                return Ok(false);
            }
        }
        self.on_path[id] = false;

        Ok(true)
    }
}

fn leaf_is_hashable(v: &Value) -> bool {
    !matches!(v, Value::Set(_) | Value::Map(_))
}

/// Checks the private general vector `h`. Exceeding `max_depth` is an error,
/// not a verdict.
pub fn check_hashable(table: &ValueTable, h: Handle, max_depth: u32) -> anyhow::Result<bool> {
    let mut walk = Walk {
        table,
        on_path: vec![false; table.private.len()],
        max_depth,
    };
    walk.visit(h, 0)
}

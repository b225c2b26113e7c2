// Marks the containers of a finished graph that take part in a cycle.
//
// This is Tarjan's strongly connected components algorithm run from the
// root. Containers are general vectors, sets and maps, identified by a dense
// id; a set or map points at its key and value vectors, so a cycle through a
// map value passes through those vectors as well. Scalars, strings,
// bitvectors and primitive vectors are never containers.
//
// A component is cyclic if it has more than one member, or if its only
// member refers to itself directly.
use std::collections::{HashMap, HashSet};

use anyhow::bail;

use crate::encoding::RawValue;

/// The container structure of an encoded graph.
pub trait ContainerGraph {
    fn root(&self) -> RawValue;

    fn n_containers(&self) -> u32;

    /// Dense id of `v`, `None` if it is not a container. Ids of a
    /// well-formed graph are below `n_containers`.
    fn container_id(&self, v: RawValue) -> Option<u32>;

    /// Values directly referenced by the container `v`.
    fn children(&self, v: RawValue) -> anyhow::Result<Vec<RawValue>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleMarks {
    cyclic: Vec<bool>,
    component_size: Vec<u32>,
}

impl CycleMarks {
    pub fn is_cyclic(&self, id: u32) -> bool {
        self.cyclic.get(id as usize).copied().unwrap_or(false)
    }

    /// Size of the component containing `id`, 0 if unreachable from the
    /// root.
    pub fn component_size(&self, id: u32) -> u32 {
        self.component_size.get(id as usize).copied().unwrap_or(0)
    }

    pub fn n_cyclic(&self) -> usize {
        self.cyclic.iter().filter(|c| **c).count()
    }
}

struct Tarjan<'g, G: ContainerGraph> {
    graph: &'g G,
    max_depth: u32,
    counter: u32,
    visited: HashMap<u32, u32>,
    root: HashMap<u32, u32>,
    component: HashMap<u32, u32>,
    self_loops: HashSet<u32>,
    stack: Vec<u32>,
    n_components: u32,
    marks: CycleMarks,
}

impl<'g, G: ContainerGraph> Tarjan<'g, G> {
    fn id_of(&self, v: RawValue) -> anyhow::Result<Option<u32>> {
        match self.graph.container_id(v) {
            Some(id) if id >= self.graph.n_containers() => bail!("container id out of range"),
            id => Ok(id),
        }
    }

    fn visit(&mut self, v: RawValue, id: u32, depth: u32) -> anyhow::Result<()> {
        if depth >= self.max_depth {
            bail!("maximum recursion depth reached");
        }

        let pre = self.counter;
        self.counter += 1;
        self.visited.insert(id, pre);
        self.root.insert(id, pre);
        self.stack.push(id);

        for child in self.graph.children(v)? {
            let cid = match self.id_of(child)? {
                Some(cid) => cid,
                None => continue,
            };
            if cid == id {
                self.self_loops.insert(id);
            }
            if !self.visited.contains_key(&cid) {
                self.visit(child, cid, depth + 1)?;
            }
            if !self.component.contains_key(&cid) {
                let r = self.root[&id].min(self.root[&cid]);
                self.root.insert(id, r);
            }
        }

        if self.root[&id] == self.visited[&id] {
            self.finish(id);
        }
        Ok(())
    }

    // Pops the component represented by `id` off the stack.
    fn finish(&mut self, id: u32) {
        let c = self.n_components;
        self.n_components += 1;

        let mut members = Vec::new();
        while let Some(m) = self.stack.pop() {
            self.component.insert(m, c);
            members.push(m);
            if m == id {
                break;
            }
        }

        let size = members.len() as u32;
        let cyclic = size > 1 || self.self_loops.contains(&id);
        for m in members {
            self.marks.cyclic[m as usize] = cyclic;
            self.marks.component_size[m as usize] = size;
        }
    }
}

/// Runs the marker from the root of `graph`. Nesting deeper than
/// `max_depth` is an error.
pub fn mark_cycles<G: ContainerGraph>(graph: &G, max_depth: u32) -> anyhow::Result<CycleMarks> {
    let n = graph.n_containers() as usize;
    let mut t = Tarjan {
        graph,
        max_depth,
        counter: 0,
        visited: HashMap::new(),
        root: HashMap::new(),
        component: HashMap::new(),
        self_loops: HashSet::new(),
        stack: Vec::new(),
        n_components: 0,
        marks: CycleMarks {
            cyclic: vec![false; n],
            component_size: vec![0; n],
        },
    };

    let root = graph.root();
    if let Some(id) = t.id_of(root)? {
        t.visit(root, id, 0)?;
    }
    debug_assert!(t.stack.is_empty());

    tracing::debug!(
        n_containers = n,
        n_components = t.n_components,
        n_cyclic = t.marks.n_cyclic(),
        "marked cycles"
    );
    Ok(t.marks)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::encoding::Tag;

    // Containers are general vectors, edges by id. Every vector also holds a
    // scalar, which must be skipped.
    struct Adjacency(Vec<Vec<u32>>);

    impl ContainerGraph for Adjacency {
        fn root(&self) -> RawValue {
            RawValue::new(Tag::Vector, 0)
        }

        fn n_containers(&self) -> u32 {
            self.0.len() as u32
        }

        fn container_id(&self, v: RawValue) -> Option<u32> {
            (v.tag == Tag::Vector).then(|| v.data)
        }

        fn children(&self, v: RawValue) -> anyhow::Result<Vec<RawValue>> {
            let mut c: Vec<RawValue> = self.0[v.data as usize]
                .iter()
                .map(|id| RawValue::new(Tag::Vector, *id))
                .collect();
            c.push(RawValue::new(Tag::I32, v.data));
            Ok(c)
        }
    }

    #[test]
    fn test_cycle_and_self_loop() -> anyhow::Result<()> {
        // 0 -> {1, 4, 5}; 1 -> 2 -> 3 -> 1; 5 -> 5; 4 is a leaf
        let g = Adjacency(vec![
            vec![1, 4, 5],
            vec![2],
            vec![3],
            vec![1],
            vec![],
            vec![5],
        ]);
        let marks = mark_cycles(&g, 100)?;
        assert!(!marks.is_cyclic(0));
        for id in [1, 2, 3] {
            assert!(marks.is_cyclic(id));
            assert_eq!(3, marks.component_size(id));
        }
        assert!(!marks.is_cyclic(4));
        assert_eq!(1, marks.component_size(4));
        assert!(marks.is_cyclic(5));
        assert_eq!(1, marks.component_size(5));
        assert_eq!(4, marks.n_cyclic());
        Ok(())
    }

    #[test]
    fn test_two_components_sharing_an_edge() -> anyhow::Result<()> {
        // 0 <-> 1, 1 -> 2 <-> 3, 3 -> 1
        let g = Adjacency(vec![vec![1], vec![0, 2], vec![3], vec![2, 1], vec![]]);
        let marks = mark_cycles(&g, 100)?;
        for id in 0..4 {
            assert!(marks.is_cyclic(id));
        }
        // 3 -> 1 joins everything into one component
        assert_eq!(4, marks.component_size(0));
        assert_eq!(0, marks.component_size(4));
        Ok(())
    }

    #[test]
    fn test_dag_is_acyclic() -> anyhow::Result<()> {
        // diamond: shared children are not cycles
        let g = Adjacency(vec![vec![1, 2], vec![3], vec![3], vec![]]);
        let marks = mark_cycles(&g, 100)?;
        assert_eq!(0, marks.n_cyclic());
        Ok(())
    }

    #[test]
    fn test_dangling_edge() {
        let g = Adjacency(vec![vec![1], vec![2]]);
        let err = mark_cycles(&g, 100).unwrap_err();
        assert_eq!("container id out of range", err.to_string());
    }

    #[test]
    fn test_unknown_ids() -> anyhow::Result<()> {
        let marks = mark_cycles(&Adjacency(vec![vec![0]]), 100)?;
        assert!(marks.is_cyclic(0));
        assert!(!marks.is_cyclic(7));
        assert_eq!(0, marks.component_size(7));
        Ok(())
    }

    #[test]
    fn test_depth_limit() {
        let g = Adjacency((0..50).map(|i| vec![i + 1]).chain([vec![]]).collect());
        assert!(mark_cycles(&g, 10).is_err());
        assert!(mark_cycles(&g, 100).is_ok());
    }
}

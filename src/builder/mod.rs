// Public entry point for encoding a graph.
//
// A `Builder` hands out `Handle`s for every value it creates. Handles can be
// appended to vectors and added to sets and maps before the values they
// refer to are complete, which is how cyclic graphs get built. Nothing about
// the final layout is decided until one of the `finalize_*` calls, which
// consume the builder.
//
// The lifetime `'a` bounds caller-owned slices passed to
// `create_outside_vector`; they are written out without being copied.
use std::path::Path;

use crate::{
    encoding::Header,
    layout::finalize,
    options::Options,
    sink::{BufferSink, FileSink},
    value::{Handle, Items, PrimKind, Primitive, Value, ValueTable},
};


#[derive(Debug, Default)]
pub struct Builder<'a> {
    table: ValueTable<'a>,
    root: Option<Handle>,
    opts: Options,
}

impl<'a> Builder<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(opts: Options) -> Self {
        Builder {
            opts,
            ..Self::default()
        }
    }

    pub fn options(&self) -> &Options {
        &self.opts
    }

    /// Number of values created so far, interned ones counted once.
    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn create_i32(&mut self, v: i32) -> anyhow::Result<Handle> {
        self.table.scalar(Value::I32(v))
    }

    pub fn create_u32(&mut self, v: u32) -> anyhow::Result<Handle> {
        self.table.scalar(Value::U32(v))
    }

    pub fn create_float(&mut self, v: f32) -> anyhow::Result<Handle> {
        self.table.scalar(Value::Float(v))
    }

    pub fn create_bool(&mut self, v: bool) -> anyhow::Result<Handle> {
        self.table.scalar(Value::Bool(v))
    }

    pub fn create_null(&mut self) -> anyhow::Result<Handle> {
        self.table.scalar(Value::Null)
    }

    /// Equal strings share a handle.
    pub fn create_unicode(&mut self, s: &str) -> anyhow::Result<Handle> {
        self.table.unicode(s)
    }

    /// Equal bit sequences stored on the heap share a handle.
    pub fn create_bitvector(&mut self, bits: &[bool]) -> anyhow::Result<Handle> {
        self.table.bitvector(bits)
    }

    /// An empty vector of handles. It may end up compressed into a primitive
    /// vector if it only ever holds numbers.
    pub fn create_vector(&mut self) -> anyhow::Result<Handle> {
        self.table.private_vector(Items::empty(None), false)
    }

    pub fn create_prim_vector<T: Primitive>(&mut self) -> anyhow::Result<Handle> {
        self.table.private_vector(Items::empty(Some(T::KIND)), false)
    }

    pub fn create_vector_of(&mut self, kind: Option<PrimKind>) -> anyhow::Result<Handle> {
        self.table.private_vector(Items::empty(kind), false)
    }

    /// Zero-copy vector over caller memory.
    pub fn create_outside_vector<T: Primitive>(&mut self, items: &'a [T]) -> anyhow::Result<Handle> {
        self.table.outside_vector(T::outside(items))
    }

    /// Panics unless `vector` came from `create_vector`.
    pub fn append(&mut self, vector: Handle, v: Handle) -> anyhow::Result<()> {
        self.table.append(vector, v)
    }

    /// Panics unless `vector` holds elements of type `T`.
    pub fn append_prim<T: Primitive>(&mut self, vector: Handle, v: T) -> anyhow::Result<()> {
        self.table.append_prim(vector, v)
    }

    /// Moves `items` into `vector` in one step. Only allowed while `vector`
    /// is still empty.
    pub fn transfer(&mut self, vector: Handle, items: Vec<Handle>) -> anyhow::Result<()> {
        self.table.transfer(vector, Items::Values(items))
    }

    pub fn transfer_prims<T: Primitive>(&mut self, vector: Handle, items: Vec<T>) -> anyhow::Result<()> {
        self.table.transfer(vector, T::into_items(items))
    }

    pub fn create_set(&mut self) -> anyhow::Result<Handle> {
        self.table.set()
    }

    pub fn create_map(&mut self) -> anyhow::Result<Handle> {
        self.table.map()
    }

    /// Keys are not deduplicated.
    pub fn set_add(&mut self, set: Handle, key: Handle) -> anyhow::Result<()> {
        self.table.set_add(set, key)
    }

    pub fn map_add(&mut self, map: Handle, key: Handle, value: Handle) -> anyhow::Result<()> {
        self.table.map_add(map, key, value)
    }

    pub fn set_root(&mut self, root: Handle) -> anyhow::Result<()> {
        if !self.table.contains(root) {
            anyhow::bail!("root handle does not exist");
        }
        self.root = Some(root);
        Ok(())
    }

    /// Writes the graph to `path`, replacing it only if every step succeeds.
    pub fn finalize_to_file<P: AsRef<Path>>(self, path: P) -> anyhow::Result<Header> {
        let mut sink = FileSink::create(path)?;
        let header = finalize(self.table, self.root, &self.opts, &mut sink)?;
        sink.commit()?;
        Ok(header)
    }

    pub fn finalize_to_buffer(self) -> anyhow::Result<Vec<u8>> {
        let mut sink = BufferSink::new();
        finalize(self.table, self.root, &self.opts, &mut sink)?;
        Ok(sink.into_inner())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        cycle::{mark_cycles, ContainerGraph},
        encoding::{FormatVersion, RawValue, Tag},
        view::GraphView,
    };

    #[test]
    fn test_root_required() {
        let mut b = Builder::new();
        b.create_i32(1).unwrap();
        let err = b.finalize_to_buffer().unwrap_err();
        assert_eq!("root has not been set", err.to_string());
    }

    #[test]
    fn test_scalar_root() -> anyhow::Result<()> {
        let mut b = Builder::new();
        let h = b.create_i32(-1)?;
        b.set_root(h)?;
        let buf = b.finalize_to_buffer()?;
        assert_eq!(32, buf.len());
        let view = GraphView::open(&buf)?;
        assert_eq!(RawValue::new(Tag::I32, u32::MAX), view.root());
        assert_eq!(FormatVersion::Offset32NewHash, view.header().version);
        Ok(())
    }

    #[test]
    fn test_outside_vectors_follow_private() -> anyhow::Result<()> {
        let data = [1_u16, 2, 3];
        let empty: [f32; 0] = [];
        let mut b = Builder::new();
        let root = b.create_vector()?;
        let outside = b.create_outside_vector(&data)?;
        let nothing = b.create_outside_vector(&empty)?;
        let private = b.create_prim_vector::<i8>()?;
        b.append_prim(private, -3_i8)?;
        b.transfer(root, vec![outside, nothing, private])?;
        b.set_root(root)?;

        let buf = b.finalize_to_buffer()?;
        let view = GraphView::open(&buf)?;
        assert_eq!(3, view.header().n_vector);
        assert_eq!(
            vec![
                RawValue::new(Tag::VectorU16, 2),
                RawValue::new(Tag::VectorEmpty, 0),
                RawValue::new(Tag::VectorI8, 1),
            ],
            view.vector_items(0)?
        );
        assert_eq!(3, view.vector_len(2)?);
        // u16 payload written as-is
        let at = 32 + 3 * 4 + view.offsets()[2] as usize;
        assert_eq!(&buf[at + 4..at + 10], &[1, 0, 2, 0, 3, 0]);
        Ok(())
    }

    #[test]
    fn test_versions() -> anyhow::Result<()> {
        for version in [
            FormatVersion::Offset32OldHash,
            FormatVersion::Offset32NewHash,
            FormatVersion::Offset64NewHash,
        ] {
            let mut b = Builder::with_options(Options {
                version,
                ..Options::default()
            });
            let s = b.create_set()?;
            let k = b.create_unicode("key")?;
            b.set_add(s, k)?;
            b.set_root(s)?;
            let buf = b.finalize_to_buffer()?;

            let view = GraphView::open(&buf)?;
            assert_eq!(version, view.header().version);
            let set = view.set(0)?;
            let hashes = view.u32_items(set.hash.data)?;
            let h = crate::hash::hash_string("key", version);
            assert_eq!(1, hashes.iter().filter(|x| **x == h).count());
            let base = 32 + view.offsets().len() * version.offset_width();
            assert_eq!(base + view.heap_len(), buf.len());
        }
        Ok(())
    }

    // A -> B -> C -> A plus an acyclic D and a self-referencing E, all hung
    // off the root.
    #[test]
    fn test_cycle_scenario() -> anyhow::Result<()> {
        let mut b = Builder::new();
        let root = b.create_vector()?;
        let [a, bb, c, d, e] = [(); 5].map(|_| b.create_vector().unwrap());
        let one = b.create_i32(1)?;
        b.append(a, bb)?;
        b.append(bb, c)?;
        b.append(c, a)?;
        b.append(d, one)?;
        b.append(e, e)?;
        b.transfer(root, vec![a, d, e])?;
        b.set_root(root)?;

        let buf = b.finalize_to_buffer()?;
        let view = GraphView::open(&buf)?;
        let marks = mark_cycles(&view, 100)?;

        let items = view.vector_items(0)?;
        let a = view.container_id(items[0]).unwrap();
        let e = view.container_id(items[2]).unwrap();
        assert!(marks.is_cyclic(a));
        assert_eq!(3, marks.component_size(a));
        // d compressed to a u8 vector, which is not a container
        assert_eq!(Tag::VectorU8, items[1].tag);
        assert_eq!(None, view.container_id(items[1]));
        assert!(!marks.is_cyclic(items[1].data));
        assert!(marks.is_cyclic(e));
        assert_eq!(1, marks.component_size(e));
        assert!(!marks.is_cyclic(0));
        assert_eq!(4, marks.n_cyclic());

        // cyclic vectors are never marked hashable
        assert_eq!(Tag::Vector, view.vector_items(0)?[0].tag);
        Ok(())
    }

    #[test]
    fn test_failed_finalize_leaves_destination() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let dest = dir.path().join("graph.bin");
        std::fs::write(&dest, b"previous")?;

        let mut b = Builder::new();
        let s = b.create_set()?;
        let inner = b.create_map()?;
        b.set_add(s, inner)?;
        b.set_root(s)?;
        assert!(b.finalize_to_file(&dest).is_err());

        assert_eq!(b"previous".to_vec(), std::fs::read(&dest)?);
        assert_eq!(1, std::fs::read_dir(dir.path())?.count());
        Ok(())
    }

    #[test]
    fn test_file_matches_buffer() -> anyhow::Result<()> {
        let build = || -> anyhow::Result<Builder<'static>> {
            let mut b = Builder::new();
            let m = b.create_map()?;
            let k = b.create_unicode("x")?;
            let bits = b.create_bitvector(&[true, false, true])?;
            b.map_add(m, k, bits)?;
            b.set_root(m)?;
            Ok(b)
        };

        let dir = tempfile::tempdir()?;
        let dest = dir.path().join("graph.bin");
        let header = build()?.finalize_to_file(&dest)?;
        assert_eq!(1, header.n_map);
        assert_eq!(build()?.finalize_to_buffer()?, std::fs::read(&dest)?);
        Ok(())
    }
}

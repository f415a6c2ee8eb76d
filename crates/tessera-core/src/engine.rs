//! Engine: implementation registry and descriptor negotiation
//!
//! An [`Engine`] owns one priority-ordered implementation list per operator
//! family. Creating a primitive descriptor walks the list and returns the
//! first implementation that accepts the request. Composite implementations
//! use [`Engine::iter`] to negotiate their own sub-primitives, passing the
//! index of their own entry as `skip` so they never select themselves.
//!
//! ```rust
//! use tessera_core::{Engine, EngineConfig, Error, OpKind};
//!
//! let engine = Engine::builder()
//!     .config(EngineConfig::default())
//!     .register(OpKind::Reorder, "never", |_, _, _| Err(Error::invalid("declined")))
//!     .build();
//! assert_eq!(engine.implementations(OpKind::Reorder).len(), 1);
//! ```

use crate::attr::PrimitiveAttr;
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::op_desc::{OpDesc, OpKind};
use crate::primitive::PrimitiveDesc;
use crate::types::CpuIsa;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tessera_tracing::perf_event;

/// Creates a primitive descriptor for a request, or explains why not.
pub type PdFactory =
    Arc<dyn Fn(&OpDesc, &PrimitiveAttr, &Engine) -> Result<Arc<dyn PrimitiveDesc>> + Send + Sync>;

/// One entry of an implementation list
#[derive(Clone)]
pub struct ImplListItem {
    id: &'static str,
    create: PdFactory,
}

impl ImplListItem {
    pub fn new<F>(id: &'static str, create: F) -> Self
    where
        F: Fn(&OpDesc, &PrimitiveAttr, &Engine) -> Result<Arc<dyn PrimitiveDesc>> + Send + Sync + 'static,
    {
        Self {
            id,
            create: Arc::new(create),
        }
    }

    pub fn id(&self) -> &'static str {
        self.id
    }

    /// Ask the implementation to accept `op_desc`.
    pub fn create(&self, op_desc: &OpDesc, attr: &PrimitiveAttr, engine: &Engine) -> Result<Arc<dyn PrimitiveDesc>> {
        (self.create)(op_desc, attr, engine)
    }

    /// Position of the implementation named `id` in `list`.
    pub fn find(list: &[ImplListItem], id: &str) -> Option<usize> {
        list.iter().position(|item| item.id == id)
    }
}

impl fmt::Debug for ImplListItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImplListItem").field("id", &self.id).finish()
    }
}

/// Implementation registry plus the hardware it targets
pub struct Engine {
    config: EngineConfig,
    isa: CpuIsa,
    impls: HashMap<OpKind, Vec<ImplListItem>>,
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Instruction set the engine's implementations may use.
    pub fn isa(&self) -> CpuIsa {
        self.isa
    }

    pub fn mayiuse(&self, isa: CpuIsa) -> bool {
        self.isa >= isa
    }

    /// Registered implementations for an operator family, in priority order.
    pub fn implementations(&self, kind: OpKind) -> &[ImplListItem] {
        self.impls.get(&kind).map(Vec::as_slice).unwrap_or_default()
    }

    /// Implementation list that applies to `op_desc`.
    pub fn implementation_list(&self, op_desc: &OpDesc) -> &[ImplListItem] {
        self.implementations(op_desc.kind())
    }

    /// Negotiate a primitive descriptor: the first implementation in list
    /// order that accepts the request wins.
    #[tracing::instrument(skip(self, op_desc, attr), fields(op = %op_desc.kind()))]
    pub fn create_primitive_desc(&self, op_desc: &OpDesc, attr: &PrimitiveAttr) -> Result<Arc<dyn PrimitiveDesc>> {
        let mut candidates = self.iter(op_desc, attr, None)?;
        match candidates.next() {
            Some(pd) => {
                perf_event!("negotiated", candidates = candidates.candidate_count(), selected = pd.name());
                Ok(pd)
            }
            None => Err(Error::NoViableImplementation(op_desc.to_string())),
        }
    }

    /// Iterate accepted primitive descriptors for `op_desc`, skipping the
    /// list entry at index `skip`.
    ///
    /// Fails with [`Error::OutOfMemory`] when the candidate list cannot be
    /// allocated.
    pub fn iter<'a>(
        &'a self,
        op_desc: &'a OpDesc,
        attr: &'a PrimitiveAttr,
        skip: Option<usize>,
    ) -> Result<PrimitiveDescIterator<'a>> {
        let list = self.implementation_list(op_desc);
        let mut candidates = Vec::new();
        candidates
            .try_reserve_exact(list.len())
            .map_err(|_| Error::OutOfMemory {
                requested: list.len() * std::mem::size_of::<&ImplListItem>(),
            })?;
        candidates.extend(
            list.iter()
                .enumerate()
                .filter(|(idx, _)| Some(*idx) != skip)
                .map(|(_, item)| item),
        );

        Ok(PrimitiveDescIterator {
            engine: self,
            op_desc,
            attr,
            candidates,
            next: 0,
        })
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("isa", &self.isa)
            .field("impls", &self.impls)
            .finish()
    }
}

/// Builder for [`Engine`]
#[derive(Default)]
pub struct EngineBuilder {
    config: EngineConfig,
    impls: HashMap<OpKind, Vec<ImplListItem>>,
}

impl EngineBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Append an implementation to the list of `kind`. Earlier registrations
    /// have higher priority.
    pub fn register<F>(mut self, kind: OpKind, id: &'static str, create: F) -> Self
    where
        F: Fn(&OpDesc, &PrimitiveAttr, &Engine) -> Result<Arc<dyn PrimitiveDesc>> + Send + Sync + 'static,
    {
        self.impls.entry(kind).or_default().push(ImplListItem::new(id, create));
        self
    }

    /// Append an already constructed entry.
    pub fn register_item(mut self, kind: OpKind, item: ImplListItem) -> Self {
        self.impls.entry(kind).or_default().push(item);
        self
    }

    pub fn build(self) -> Engine {
        let isa = self.config.isa.unwrap_or_else(CpuIsa::detect);
        tracing::debug!(%isa, matmul_reduction = self.config.matmul_reduction, "engine_created");
        Engine {
            config: self.config,
            isa,
            impls: self.impls,
        }
    }
}

/// Lazily tries candidates in list order, yielding each accepted descriptor
pub struct PrimitiveDescIterator<'a> {
    engine: &'a Engine,
    op_desc: &'a OpDesc,
    attr: &'a PrimitiveAttr,
    candidates: Vec<&'a ImplListItem>,
    next: usize,
}

impl PrimitiveDescIterator<'_> {
    /// Number of candidates, the skipped entry excluded.
    pub fn candidate_count(&self) -> usize {
        self.candidates.len()
    }
}

impl Iterator for PrimitiveDescIterator<'_> {
    type Item = Arc<dyn PrimitiveDesc>;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(item) = self.candidates.get(self.next) {
            self.next += 1;
            match item.create(self.op_desc, self.attr, self.engine) {
                Ok(pd) => return Some(pd),
                Err(err) => {
                    tracing::debug!(
                        implementation = item.id(),
                        category = ?err.category(),
                        reason = %err,
                        "implementation_rejected"
                    );
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_desc::MemoryDesc;
    use crate::op_desc::ReorderDesc;
    use crate::scratchpad::ScratchpadRegistry;
    use crate::types::{Arg, DataType};
    use crate::{Primitive, Result};
    use parking_lot::Mutex;

    #[derive(Debug)]
    struct NamedPd {
        name: &'static str,
        op: OpDesc,
        attr: PrimitiveAttr,
        registry: ScratchpadRegistry,
    }

    impl PrimitiveDesc for NamedPd {
        fn name(&self) -> &'static str {
            self.name
        }

        fn op_desc(&self) -> &OpDesc {
            &self.op
        }

        fn attr(&self) -> &PrimitiveAttr {
            &self.attr
        }

        fn arg_md(&self, _arg: Arg) -> Option<&MemoryDesc> {
            None
        }

        fn scratchpad_registry(&self) -> &ScratchpadRegistry {
            &self.registry
        }

        fn create_primitive(self: Arc<Self>, _engine: &Engine) -> Result<Arc<dyn Primitive>> {
            Err(Error::runtime("not runnable"))
        }
    }

    fn accept(name: &'static str) -> impl Fn(&OpDesc, &PrimitiveAttr, &Engine) -> Result<Arc<dyn PrimitiveDesc>> {
        move |op: &OpDesc, attr: &PrimitiveAttr, _: &Engine| {
            Ok(Arc::new(NamedPd {
                name,
                op: op.clone(),
                attr: attr.clone(),
                registry: ScratchpadRegistry::new(),
            }) as Arc<dyn PrimitiveDesc>)
        }
    }

    fn reorder_op() -> Result<OpDesc> {
        let md = MemoryDesc::plain(vec![2, 2], DataType::F32)?;
        Ok(ReorderDesc::new(md.clone(), md)?.into())
    }

    #[test]
    fn test_first_accepting_implementation_wins() -> Result<()> {
        let engine = Engine::builder()
            .config(EngineConfig::default().with_isa(CpuIsa::Avx2))
            .register(OpKind::Reorder, "decline", |_, _, _| Err(Error::unsupported_tag("nope")))
            .register(OpKind::Reorder, "first", accept("first"))
            .register(OpKind::Reorder, "second", accept("second"))
            .build();

        let pd = engine.create_primitive_desc(&reorder_op()?, &PrimitiveAttr::default())?;
        assert_eq!(pd.name(), "first");
        assert_eq!(engine.isa(), CpuIsa::Avx2);
        assert!(engine.mayiuse(CpuIsa::Sse41));
        assert!(!engine.mayiuse(CpuIsa::Avx512Core));
        Ok(())
    }

    #[test]
    fn test_iterator_skips_given_index() -> Result<()> {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let record = |name: &'static str| {
            let calls = Arc::clone(&calls);
            let create = accept(name);
            move |op: &OpDesc, attr: &PrimitiveAttr, engine: &Engine| {
                calls.lock().push(name);
                create(op, attr, engine)
            }
        };
        let engine = Engine::builder()
            .register(OpKind::Reorder, "a", record("a"))
            .register(OpKind::Reorder, "b", record("b"))
            .build();

        let op = reorder_op()?;
        let attr = PrimitiveAttr::default();
        let skip = ImplListItem::find(engine.implementation_list(&op), "a");
        assert_eq!(skip, Some(0));

        let mut it = engine.iter(&op, &attr, skip)?;
        assert_eq!(it.candidate_count(), 1);
        assert_eq!(it.next().map(|pd| pd.name()), Some("b"));
        assert!(it.next().is_none());
        assert_eq!(*calls.lock(), vec!["b"]);
        Ok(())
    }

    #[test]
    fn test_no_viable_implementation() -> Result<()> {
        let engine = Engine::builder()
            .register(OpKind::Reorder, "decline", |_, _, _| Err(Error::invalid("nope")))
            .build();
        let err = engine.create_primitive_desc(&reorder_op()?, &PrimitiveAttr::default());
        assert!(matches!(err, Err(Error::NoViableImplementation(_))));

        let empty = Engine::builder().build();
        assert!(empty.implementation_list(&reorder_op()?).is_empty());
        Ok(())
    }
}

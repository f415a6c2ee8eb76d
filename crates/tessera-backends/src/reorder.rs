//! Strided reorder: copies a tensor between two layouts element by element.

use crate::tensor::{physical_offsets, resolve_any};
use std::sync::Arc;
use tessera_core::scratchpad::ScratchpadRegistry;
use tessera_core::{
    Arg, Engine, Error, ExecCtx, MemoryDesc, OpDesc, Primitive, PrimitiveAttr, PrimitiveDesc, ReorderDesc, Result,
};

pub const REF_REORDER_ID: &str = "ref:reorder";

#[derive(Debug)]
pub struct RefReorderPd {
    op: OpDesc,
    attr: PrimitiveAttr,
    registry: ScratchpadRegistry,
}

impl RefReorderPd {
    pub fn create(op: &OpDesc, attr: &PrimitiveAttr, _engine: &Engine) -> Result<Arc<Self>> {
        let reorder = op
            .as_reorder()
            .ok_or_else(|| Error::invalid(format!("expected a reorder, got {}", op.kind())))?;
        if !attr.has_default_values() {
            return Err(Error::UnsupportedAttr("reorders take no post-ops".into()));
        }
        if reorder.src().is_any() {
            return Err(Error::invalid("reorder source format must be concrete"));
        }
        if reorder.src().data_type() != reorder.dst().data_type() {
            return Err(Error::unsupported_data_type(format!(
                "conversion {} -> {} is not supported",
                reorder.src().data_type(),
                reorder.dst().data_type()
            )));
        }
        let resolved = ReorderDesc::new(reorder.src().clone(), resolve_any(reorder.dst()))?;
        Ok(Arc::new(Self {
            op: OpDesc::Reorder(resolved),
            attr: attr.clone(),
            registry: ScratchpadRegistry::new(),
        }))
    }

    fn desc(&self) -> Result<&ReorderDesc> {
        self.op
            .as_reorder()
            .ok_or_else(|| Error::runtime("reorder descriptor lost its operation"))
    }
}

impl PrimitiveDesc for RefReorderPd {
    fn name(&self) -> &'static str {
        REF_REORDER_ID
    }

    fn op_desc(&self) -> &OpDesc {
        &self.op
    }

    fn attr(&self) -> &PrimitiveAttr {
        &self.attr
    }

    fn arg_md(&self, arg: Arg) -> Option<&MemoryDesc> {
        let reorder = self.op.as_reorder()?;
        match arg {
            Arg::Src => Some(reorder.src()),
            Arg::Dst => Some(reorder.dst()),
            _ => None,
        }
    }

    fn scratchpad_registry(&self) -> &ScratchpadRegistry {
        &self.registry
    }

    fn create_primitive(self: Arc<Self>, _engine: &Engine) -> Result<Arc<dyn Primitive>> {
        Ok(Arc::new(RefReorder { pd: self }))
    }
}

pub struct RefReorder {
    pd: Arc<RefReorderPd>,
}

impl Primitive for RefReorder {
    fn pd(&self) -> &dyn PrimitiveDesc {
        self.pd.as_ref()
    }

    fn execute(&self, ctx: &ExecCtx<'_>) -> Result<()> {
        let desc = self.pd.desc()?;
        let src = ctx.input(Arg::Src)?;
        let dst = ctx.output(Arg::Dst)?;
        if src.desc().dims() != desc.src().dims() || dst.desc().dims() != desc.dst().dims() {
            return Err(Error::runtime(format!(
                "reorder bound to {} -> {}, expected {} -> {}",
                src.desc(),
                dst.desc(),
                desc.src(),
                desc.dst()
            )));
        }

        let elem = src.desc().data_type().size();
        let from = src.view().sub_view(0, src.desc().size())?.read_bytes()?;
        let to_view = dst.view().sub_view(0, dst.desc().size())?;
        let mut to = to_view.read_bytes()?;
        for (s, d) in physical_offsets(src.desc())
            .into_iter()
            .zip(physical_offsets(dst.desc()))
        {
            to[d * elem..(d + 1) * elem].copy_from_slice(&from[s * elem..(s + 1) * elem]);
        }
        to_view.write_bytes(&to)?;
        tracing::trace!(src = %src.desc(), dst = %dst.desc(), "reorder_done");
        Ok(())
    }
}

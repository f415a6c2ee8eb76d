//! Primitive descriptors, primitives and execution contexts
//!
//! Creation is split in two phases. A [`PrimitiveDesc`] is the immutable
//! outcome of negotiation: the implementation has accepted an operation
//! descriptor, resolved any `Any` formats and booked its scratchpad. A
//! [`Primitive`] is the runnable instance created from it. Both are
//! `Send + Sync` and hold no per-call state; everything a call touches is
//! passed in through an [`ExecCtx`].

use crate::attr::PrimitiveAttr;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::memory_desc::MemoryDesc;
use crate::op_desc::OpDesc;
use crate::scratchpad::{Grantor, ScratchpadRegistry};
use crate::storage::{Memory, StorageView};
use crate::types::Arg;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Outcome of a successful negotiation
pub trait PrimitiveDesc: fmt::Debug + Send + Sync {
    /// Identifier of the implementation that produced this descriptor.
    fn name(&self) -> &'static str;

    /// The request as accepted, with formats resolved.
    fn op_desc(&self) -> &OpDesc;

    fn attr(&self) -> &PrimitiveAttr;

    /// Resolved descriptor for an execution argument, if the primitive uses it.
    fn arg_md(&self, arg: Arg) -> Option<&MemoryDesc>;

    /// Scratchpad the primitive needs per call, nested registries included.
    fn scratchpad_registry(&self) -> &ScratchpadRegistry;

    /// Instantiate the runnable primitive.
    fn create_primitive(self: Arc<Self>, engine: &Engine) -> Result<Arc<dyn Primitive>>;
}

/// Runnable primitive instance
pub trait Primitive: Send + Sync {
    fn pd(&self) -> &dyn PrimitiveDesc;

    /// Run against the arguments and scratchpad bound in `ctx`.
    fn execute(&self, ctx: &ExecCtx<'_>) -> Result<()>;

    /// Convenience entry point: bind `args`, allocate a scratchpad when none
    /// is given, and execute.
    fn run(&self, args: ExecArgs, scratchpad: Option<StorageView>) -> Result<()> {
        let registry = self.pd().scratchpad_registry();
        let base = match scratchpad {
            Some(view) => Some(view),
            None if registry.size() > 0 => Some(registry.allocate()?.view()),
            None => None,
        };
        let grantor = Grantor::new(registry, base)?;
        self.execute(&ExecCtx::new(args, grantor))
    }
}

/// One bound argument
#[derive(Debug, Clone)]
pub struct MemoryArg {
    pub memory: Memory,
    /// Read-only binding
    pub is_const: bool,
}

impl MemoryArg {
    pub fn input(memory: Memory) -> Self {
        Self { memory, is_const: true }
    }

    pub fn output(memory: Memory) -> Self {
        Self {
            memory,
            is_const: false,
        }
    }
}

/// Arguments of one execution call, keyed by role
#[derive(Debug, Clone, Default)]
pub struct ExecArgs {
    args: HashMap<Arg, MemoryArg>,
}

impl ExecArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a read-only argument.
    pub fn input(mut self, arg: Arg, memory: Memory) -> Self {
        self.args.insert(arg, MemoryArg::input(memory));
        self
    }

    /// Bind a writable argument.
    pub fn output(mut self, arg: Arg, memory: Memory) -> Self {
        self.args.insert(arg, MemoryArg::output(memory));
        self
    }

    pub fn insert(&mut self, arg: Arg, memory_arg: MemoryArg) -> Option<MemoryArg> {
        self.args.insert(arg, memory_arg)
    }

    pub fn get(&self, arg: Arg) -> Option<&MemoryArg> {
        self.args.get(&arg)
    }

    pub fn contains(&self, arg: Arg) -> bool {
        self.args.contains_key(&arg)
    }

    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Arg, &MemoryArg)> {
        self.args.iter()
    }
}

/// Per-call execution context: bound arguments plus a scratchpad grantor
pub struct ExecCtx<'a> {
    args: ExecArgs,
    scratchpad: Grantor<'a>,
}

impl<'a> ExecCtx<'a> {
    pub fn new(args: ExecArgs, scratchpad: Grantor<'a>) -> Self {
        Self { args, scratchpad }
    }

    pub fn args(&self) -> &ExecArgs {
        &self.args
    }

    pub fn scratchpad(&self) -> &Grantor<'a> {
        &self.scratchpad
    }

    /// Bound argument, read or write.
    pub fn arg(&self, arg: Arg) -> Result<&MemoryArg> {
        self.args
            .get(arg)
            .ok_or_else(|| Error::runtime(format!("argument {arg} is not bound")))
    }

    /// Memory of an argument read by the primitive.
    pub fn input(&self, arg: Arg) -> Result<&Memory> {
        self.arg(arg).map(|bound| &bound.memory)
    }

    /// Memory of an argument written by the primitive.
    pub fn output(&self, arg: Arg) -> Result<&Memory> {
        let bound = self.arg(arg)?;
        if bound.is_const {
            return Err(Error::runtime(format!("argument {arg} is bound read-only")));
        }
        Ok(&bound.memory)
    }

    /// Memory of an optional argument.
    pub fn optional(&self, arg: Arg) -> Option<&Memory> {
        self.args.get(arg).map(|bound| &bound.memory)
    }
}

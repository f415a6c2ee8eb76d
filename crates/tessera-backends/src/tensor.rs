//! Logical-order access to strided tensors
//!
//! The reference kernels compute on dense row-major `f32` vectors indexed by
//! logical position. [`load`] gathers a tensor from whatever strides its
//! descriptor carries and [`store`] scatters back, leaving bytes outside the
//! tensor's elements untouched.

use tessera_core::{DataType, Error, Memory, MemoryDesc, Result};

/// Physical element offset of every logical index, in row-major order.
pub(crate) fn physical_offsets(desc: &MemoryDesc) -> Vec<usize> {
    let dims = desc.dims();
    let nelems = desc.nelems();
    let mut offsets = Vec::with_capacity(nelems);
    if nelems == 0 {
        return offsets;
    }
    let mut index = vec![0usize; dims.len()];
    for _ in 0..nelems {
        offsets.push(desc.offset_of(&index));
        for d in (0..dims.len()).rev() {
            index[d] += 1;
            if index[d] < dims[d] {
                break;
            }
            index[d] = 0;
        }
    }
    offsets
}

pub(crate) fn check_f32(desc: &MemoryDesc, what: &str) -> Result<()> {
    if desc.data_type() == DataType::F32 {
        Ok(())
    } else {
        Err(Error::unsupported_data_type(format!(
            "{what} is {}, reference kernels compute in f32",
            desc.data_type()
        )))
    }
}

/// Gather a tensor into logical row-major order.
pub(crate) fn load(memory: &Memory) -> Result<Vec<f32>> {
    check_f32(memory.desc(), "tensor")?;
    let raw = memory.read::<f32>()?;
    Ok(physical_offsets(memory.desc()).into_iter().map(|off| raw[off]).collect())
}

/// Scatter logical row-major `values` into a tensor.
pub(crate) fn store(memory: &Memory, values: &[f32]) -> Result<()> {
    check_f32(memory.desc(), "tensor")?;
    if values.len() != memory.desc().nelems() {
        return Err(Error::runtime(format!(
            "storing {} values into {}",
            values.len(),
            memory.desc()
        )));
    }
    let mut raw = memory.read::<f32>()?;
    for (off, &value) in physical_offsets(memory.desc()).into_iter().zip(values) {
        raw[off] = value;
    }
    memory.write(&raw)
}

/// Concrete descriptor: `Any` resolves to dense row-major.
pub(crate) fn resolve_any(desc: &MemoryDesc) -> MemoryDesc {
    if desc.is_any() {
        desc.to_plain()
    } else {
        desc.clone()
    }
}

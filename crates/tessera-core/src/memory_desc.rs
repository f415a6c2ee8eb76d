//! Tensor memory descriptors and the layout algebra over them
//!
//! A [`MemoryDesc`] describes *how* an N-dimensional tensor is laid out in a
//! flat buffer: logical dims, element type and either concrete strides or an
//! unspecified ("any") format that an implementation resolves during
//! negotiation. Descriptors are values. Every transformation in this module
//! (`reshape`, `permute_axes`, `retag`) returns a new descriptor over the
//! same bytes and never implies data movement.
//!
//! # Strides
//!
//! Strides are counted in elements. For a 4-D `nchw` tensor the element at
//! `[n, c, h, w]` lives at `n*s[0] + c*s[1] + h*s[2] + w*s[3]`.
//!
//! ```rust
//! use tessera_core::{DataType, FormatTag, MemoryDesc};
//!
//! let nchw = MemoryDesc::with_tag(vec![2, 8, 4, 4], DataType::F32, FormatTag::Nchw)?;
//! assert_eq!(nchw.strides(), Some(&[128, 16, 4, 1][..]));
//!
//! let nhwc = nchw.retag(FormatTag::Nhwc)?;
//! assert_eq!(nhwc.strides(), Some(&[128, 1, 32, 8][..]));
//! # Ok::<(), tessera_core::Error>(())
//! ```

use crate::error::{Error, Result};
use crate::types::{DataType, MAX_NDIMS};
use std::fmt;

/// Plain activation format tags, keyed by rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FormatTag {
    Ncw,
    Nchw,
    Ncdhw,
    Nwc,
    Nhwc,
    Ndhwc,
}

impl FormatTag {
    /// Channel-major ("ncsp") tag for an activation of the given rank.
    pub fn ncsp(ndims: usize) -> Result<Self> {
        match ndims {
            3 => Ok(FormatTag::Ncw),
            4 => Ok(FormatTag::Nchw),
            5 => Ok(FormatTag::Ncdhw),
            _ => Err(Error::unsupported_tag(format!("no channel-major tag for rank {ndims}"))),
        }
    }

    /// Channel-last ("nspc") tag for an activation of the given rank.
    pub fn nspc(ndims: usize) -> Result<Self> {
        match ndims {
            3 => Ok(FormatTag::Nwc),
            4 => Ok(FormatTag::Nhwc),
            5 => Ok(FormatTag::Ndhwc),
            _ => Err(Error::unsupported_tag(format!("no channel-last tag for rank {ndims}"))),
        }
    }

    pub fn ndims(self) -> usize {
        self.order().len()
    }

    pub fn is_channel_last(self) -> bool {
        matches!(self, FormatTag::Nwc | FormatTag::Nhwc | FormatTag::Ndhwc)
    }

    /// Logical dims from outermost to innermost in memory.
    fn order(self) -> &'static [usize] {
        match self {
            FormatTag::Ncw => &[0, 1, 2],
            FormatTag::Nchw => &[0, 1, 2, 3],
            FormatTag::Ncdhw => &[0, 1, 2, 3, 4],
            FormatTag::Nwc => &[0, 2, 1],
            FormatTag::Nhwc => &[0, 2, 3, 1],
            FormatTag::Ndhwc => &[0, 2, 3, 4, 1],
        }
    }

    /// Dense strides for `dims` laid out in this tag's order.
    pub fn strides(self, dims: &[usize]) -> Vec<usize> {
        let mut strides = vec![0; dims.len()];
        let mut running = 1;
        for &d in self.order().iter().rev() {
            strides[d] = running;
            running *= dims[d];
        }
        strides
    }
}

impl fmt::Display for FormatTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FormatTag::Ncw => "ncw",
            FormatTag::Nchw => "nchw",
            FormatTag::Ncdhw => "ncdhw",
            FormatTag::Nwc => "nwc",
            FormatTag::Nhwc => "nhwc",
            FormatTag::Ndhwc => "ndhwc",
        };
        f.write_str(name)
    }
}

/// How the bytes of a tensor are arranged
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FormatKind {
    /// Unspecified; resolved by the implementation that accepts it
    Any,
    /// Concrete strides in elements, one per dim
    Strided(Vec<usize>),
    /// Implementation-defined layout that cannot be reasoned about here
    Opaque,
}

/// Classification of a descriptor's layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Layout {
    Any,
    ChannelMajor,
    ChannelLast,
    Strided,
    Opaque,
}

/// Immutable N-dimensional tensor descriptor
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MemoryDesc {
    dims: Vec<usize>,
    data_type: DataType,
    format: FormatKind,
}

impl MemoryDesc {
    /// Create a descriptor, validating rank and stride count.
    pub fn new(dims: Vec<usize>, data_type: DataType, format: FormatKind) -> Result<Self> {
        if dims.is_empty() || dims.len() > MAX_NDIMS {
            return Err(Error::invalid(format!(
                "rank {} outside supported range [1, {}]",
                dims.len(),
                MAX_NDIMS
            )));
        }
        if let FormatKind::Strided(strides) = &format {
            if strides.len() != dims.len() {
                return Err(Error::invalid(format!(
                    "dims and strides must have same length: {} vs {}",
                    dims.len(),
                    strides.len()
                )));
            }
        }
        Ok(Self {
            dims,
            data_type,
            format,
        })
    }

    /// Descriptor whose format is left for negotiation.
    pub fn any(dims: Vec<usize>, data_type: DataType) -> Result<Self> {
        Self::new(dims, data_type, FormatKind::Any)
    }

    /// Dense row-major descriptor.
    pub fn plain(dims: Vec<usize>, data_type: DataType) -> Result<Self> {
        let strides = row_major_strides(&dims);
        Self::new(dims, data_type, FormatKind::Strided(strides))
    }

    /// Dense descriptor laid out according to `tag`.
    pub fn with_tag(dims: Vec<usize>, data_type: DataType, tag: FormatTag) -> Result<Self> {
        if dims.len() != tag.ndims() {
            return Err(Error::unsupported_tag(format!(
                "tag {tag} requires rank {}, got {}",
                tag.ndims(),
                dims.len()
            )));
        }
        let strides = tag.strides(&dims);
        Self::new(dims, data_type, FormatKind::Strided(strides))
    }

    /// Descriptor with explicit strides.
    pub fn with_strides(dims: Vec<usize>, data_type: DataType, strides: Vec<usize>) -> Result<Self> {
        Self::new(dims, data_type, FormatKind::Strided(strides))
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn ndims(&self) -> usize {
        self.dims.len()
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn format(&self) -> &FormatKind {
        &self.format
    }

    /// Strides in elements, if the format is concrete.
    pub fn strides(&self) -> Option<&[usize]> {
        match &self.format {
            FormatKind::Strided(strides) => Some(strides),
            _ => None,
        }
    }

    pub fn is_any(&self) -> bool {
        matches!(self.format, FormatKind::Any)
    }

    pub fn is_strided(&self) -> bool {
        matches!(self.format, FormatKind::Strided(_))
    }

    /// Total number of logical elements.
    pub fn nelems(&self) -> usize {
        self.dims.iter().product()
    }

    pub fn has_zero_dim(&self) -> bool {
        self.dims.contains(&0)
    }

    /// Bytes a buffer needs to hold this tensor.
    ///
    /// For strided formats this is the span up to the furthest element, for
    /// other formats the dense size.
    pub fn size(&self) -> usize {
        if self.has_zero_dim() {
            return 0;
        }
        match &self.format {
            FormatKind::Strided(strides) => (max_offset(&self.dims, strides) + 1) * self.data_type.size(),
            _ => self.nelems() * self.data_type.size(),
        }
    }

    /// Whether the strides are exactly the dense strides of `tag`.
    pub fn matches_tag(&self, tag: FormatTag) -> bool {
        match &self.format {
            FormatKind::Strided(strides) => {
                self.ndims() == tag.ndims() && *strides == tag.strides(&self.dims)
            }
            _ => false,
        }
    }

    /// Classify the layout.
    pub fn layout(&self) -> Layout {
        match &self.format {
            FormatKind::Any => Layout::Any,
            FormatKind::Opaque => Layout::Opaque,
            FormatKind::Strided(_) => {
                let ncsp = FormatTag::ncsp(self.ndims()).map(|t| self.matches_tag(t));
                let nspc = FormatTag::nspc(self.ndims()).map(|t| self.matches_tag(t));
                match (ncsp, nspc) {
                    (Ok(true), _) => Layout::ChannelMajor,
                    (_, Ok(true)) => Layout::ChannelLast,
                    _ => Layout::Strided,
                }
            }
        }
    }

    /// Same dims and data type, dense layout of `tag`.
    pub fn retag(&self, tag: FormatTag) -> Result<Self> {
        Self::with_tag(self.dims.clone(), self.data_type, tag)
    }

    /// Same dims and data type, dense row-major layout.
    pub fn to_plain(&self) -> Self {
        Self {
            dims: self.dims.clone(),
            data_type: self.data_type,
            format: FormatKind::Strided(row_major_strides(&self.dims)),
        }
    }

    /// Element offset of a logical index. Non-strided formats are addressed
    /// as dense row-major.
    pub fn offset_of(&self, index: &[usize]) -> usize {
        debug_assert_eq!(index.len(), self.ndims());
        match &self.format {
            FormatKind::Strided(strides) => index.iter().zip(strides).map(|(i, s)| i * s).sum(),
            _ => index
                .iter()
                .zip(row_major_strides(&self.dims))
                .map(|(i, s)| i * s)
                .sum(),
        }
    }

    /// Reinterpret the tensor with new dims over the same bytes.
    ///
    /// The element count must be preserved. For strided formats the new
    /// strides are derived from the old ones; the reshape fails when a group
    /// of merged dims is not contiguous in memory (it would require a copy).
    pub fn reshape(&self, new_dims: &[usize]) -> Result<Self> {
        if new_dims.is_empty() || new_dims.len() > MAX_NDIMS {
            return Err(Error::invalid(format!(
                "cannot reshape to rank {}: supported range is [1, {}]",
                new_dims.len(),
                MAX_NDIMS
            )));
        }
        let new_nelems: usize = new_dims.iter().product();
        if new_nelems != self.nelems() {
            return Err(Error::invalid(format!(
                "cannot reshape {:?} to {:?}: element count mismatch ({} vs {})",
                self.dims,
                new_dims,
                self.nelems(),
                new_nelems
            )));
        }

        let format = match &self.format {
            FormatKind::Any => FormatKind::Any,
            FormatKind::Opaque => {
                return Err(Error::unsupported_tag("cannot reshape an opaque layout".to_string()));
            }
            FormatKind::Strided(strides) => {
                if self.has_zero_dim() {
                    FormatKind::Strided(row_major_strides(new_dims))
                } else {
                    let new_strides = reshape_strides(&self.dims, strides, new_dims).ok_or_else(|| {
                        Error::invalid(format!(
                            "cannot reshape {:?} with strides {:?} to {:?} without a copy",
                            self.dims, strides, new_dims
                        ))
                    })?;
                    FormatKind::Strided(new_strides)
                }
            }
        };

        Ok(Self {
            dims: new_dims.to_vec(),
            data_type: self.data_type,
            format,
        })
    }

    /// Permute axes: input axis `d` becomes output axis `perm[d]`.
    pub fn permute_axes(&self, perm: &[usize]) -> Result<Self> {
        let ndims = self.ndims();
        if perm.len() != ndims {
            return Err(Error::invalid(format!(
                "permutation length mismatch: expected {}, got {}",
                ndims,
                perm.len()
            )));
        }

        let mut seen = vec![false; ndims];
        for &p in perm {
            if p >= ndims {
                return Err(Error::invalid(format!("permutation axis {p} out of range [0, {ndims})")));
            }
            if seen[p] {
                return Err(Error::invalid(format!("permutation axis {p} appears multiple times")));
            }
            seen[p] = true;
        }

        let mut dims = vec![0; ndims];
        for (d, &p) in perm.iter().enumerate() {
            dims[p] = self.dims[d];
        }

        let format = match &self.format {
            FormatKind::Strided(strides) => {
                let mut permuted = vec![0; ndims];
                for (d, &p) in perm.iter().enumerate() {
                    permuted[p] = strides[d];
                }
                FormatKind::Strided(permuted)
            }
            FormatKind::Any => FormatKind::Any,
            FormatKind::Opaque => {
                return Err(Error::unsupported_tag("cannot permute an opaque layout".to_string()));
            }
        };

        Ok(Self {
            dims,
            data_type: self.data_type,
            format,
        })
    }
}

impl fmt::Display for MemoryDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let layout = match self.layout() {
            Layout::Any => "any".to_string(),
            Layout::Opaque => "opaque".to_string(),
            Layout::ChannelMajor => "ncsp".to_string(),
            Layout::ChannelLast => "nspc".to_string(),
            Layout::Strided => format!("strided{:?}", self.strides().unwrap_or_default()),
        };
        let dims = self.dims.iter().map(|d| d.to_string()).collect::<Vec<_>>().join("x");
        write!(f, "{}:{}:{}", self.data_type, layout, dims)
    }
}

/// Row-major strides for the given dims
pub fn row_major_strides(dims: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; dims.len()];
    for i in (0..dims.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * dims[i + 1];
    }
    strides
}

fn max_offset(dims: &[usize], strides: &[usize]) -> usize {
    dims.iter()
        .zip(strides)
        .map(|(&d, &s)| d.saturating_sub(1) * s)
        .sum()
}

/// Derive strides for `new_dims` over memory described by `dims`/`strides`.
///
/// Unit dims of the source are dropped first; then source and target dims
/// are walked in groups with equal products. Inside each source group the
/// dims must be contiguous relative to each other.
fn reshape_strides(dims: &[usize], strides: &[usize], new_dims: &[usize]) -> Option<Vec<usize>> {
    let (old_dims, old_strides): (Vec<usize>, Vec<usize>) = dims
        .iter()
        .zip(strides)
        .filter(|(&d, _)| d != 1)
        .map(|(&d, &s)| (d, s))
        .unzip();

    let old_nd = old_dims.len();
    let new_nd = new_dims.len();
    let mut new_strides = vec![0; new_nd];

    let (mut oi, mut oj, mut ni, mut nj) = (0, 1, 0, 1);
    while ni < new_nd && oi < old_nd {
        let mut np = new_dims[ni];
        let mut op = old_dims[oi];

        while np != op {
            if np < op {
                np *= *new_dims.get(nj)?;
                nj += 1;
            } else {
                op *= *old_dims.get(oj)?;
                oj += 1;
            }
        }

        for ok in oi..oj - 1 {
            if old_strides[ok] != old_dims[ok + 1] * old_strides[ok + 1] {
                return None;
            }
        }

        new_strides[nj - 1] = old_strides[oj - 1];
        for nk in (ni + 1..nj).rev() {
            new_strides[nk - 1] = new_strides[nk] * new_dims[nk];
        }

        ni = nj;
        nj += 1;
        oi = oj;
        oj += 1;
    }

    // Trailing unit dims reuse the innermost stride seen so far.
    let last_stride = if ni >= 1 { new_strides[ni - 1] } else { 1 };
    for stride in new_strides.iter_mut().skip(ni) {
        *stride = last_stride;
    }

    Some(new_strides)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_strides() -> Result<()> {
        let nchw = MemoryDesc::with_tag(vec![2, 3, 4, 5], DataType::F32, FormatTag::Nchw)?;
        assert_eq!(nchw.strides(), Some(&[60, 20, 5, 1][..]));
        let nhwc = nchw.retag(FormatTag::Nhwc)?;
        assert_eq!(nhwc.strides(), Some(&[60, 1, 15, 3][..]));
        let ndhwc = MemoryDesc::with_tag(vec![1, 2, 3, 4, 5], DataType::F32, FormatTag::Ndhwc)?;
        assert_eq!(ndhwc.strides(), Some(&[120, 1, 40, 10, 2][..]));
        Ok(())
    }

    #[test]
    fn test_tag_rank_mismatch() {
        let result = MemoryDesc::with_tag(vec![2, 3, 4], DataType::F32, FormatTag::Nchw);
        assert!(matches!(result, Err(Error::UnsupportedTag(_))));
        assert!(FormatTag::ncsp(2).is_err());
        assert!(FormatTag::nspc(6).is_err());
    }

    #[test]
    fn test_matches_tag_and_layout() -> Result<()> {
        let nchw = MemoryDesc::with_tag(vec![2, 8, 4, 4], DataType::F32, FormatTag::Nchw)?;
        assert!(nchw.matches_tag(FormatTag::Nchw));
        assert!(!nchw.matches_tag(FormatTag::Nhwc));
        assert_eq!(nchw.layout(), Layout::ChannelMajor);
        assert_eq!(nchw.retag(FormatTag::Nhwc)?.layout(), Layout::ChannelLast);

        let any = MemoryDesc::any(vec![2, 8, 4, 4], DataType::F32)?;
        assert!(!any.matches_tag(FormatTag::Nchw));
        assert_eq!(any.layout(), Layout::Any);

        let odd = MemoryDesc::with_strides(vec![2, 3], DataType::F32, vec![1, 2])?;
        assert_eq!(odd.layout(), Layout::Strided);
        Ok(())
    }

    #[test]
    fn test_rank_limits() {
        assert!(MemoryDesc::plain(vec![], DataType::F32).is_err());
        assert!(MemoryDesc::plain(vec![1; MAX_NDIMS + 1], DataType::F32).is_err());
        assert!(MemoryDesc::with_strides(vec![2, 2], DataType::F32, vec![1]).is_err());
    }

    #[test]
    fn test_size_of_strided_span() -> Result<()> {
        let dense = MemoryDesc::plain(vec![2, 8, 4, 4], DataType::F32)?;
        assert_eq!(dense.size(), 1024);
        // Padded rows: 3 rows of 4 elements with a row pitch of 6.
        let padded = MemoryDesc::with_strides(vec![3, 4], DataType::F32, vec![6, 1])?;
        assert_eq!(padded.size(), (2 * 6 + 3 + 1) * 4);
        let empty = MemoryDesc::plain(vec![0, 4], DataType::F32)?;
        assert_eq!(empty.size(), 0);
        assert!(empty.has_zero_dim());
        Ok(())
    }

    #[test]
    fn test_reshape_contiguous() -> Result<()> {
        let md = MemoryDesc::plain(vec![2, 8, 4, 4], DataType::F32)?;
        let reshaped = md.reshape(&[2, 2, 4, 16])?;
        assert_eq!(reshaped.dims(), &[2, 2, 4, 16]);
        assert_eq!(reshaped.strides(), Some(&[128, 64, 16, 1][..]));
        Ok(())
    }

    #[test]
    fn test_reshape_count_mismatch() -> Result<()> {
        let md = MemoryDesc::plain(vec![4, 6], DataType::F32)?;
        assert!(matches!(md.reshape(&[5, 5]), Err(Error::InvalidArguments(_))));
        Ok(())
    }

    #[test]
    fn test_reshape_drops_and_adds_unit_dims() -> Result<()> {
        let md = MemoryDesc::plain(vec![2, 8, 4, 1, 1, 1], DataType::F32)?;
        let reduced = md.reshape(&[1, 2, 8, 4])?;
        assert_eq!(reduced.strides(), Some(&[64, 32, 4, 1][..]));
        let restored = reduced.reshape(&[2, 8, 4, 1, 1, 1])?;
        assert_eq!(restored.dims(), md.dims());
        assert_eq!(restored.nelems(), md.nelems());
        Ok(())
    }

    #[test]
    fn test_reshape_rejects_non_contiguous_merge() -> Result<()> {
        let nhwc = MemoryDesc::with_tag(vec![2, 8, 4, 4], DataType::F32, FormatTag::Nhwc)?;
        // Merging c with h is impossible in channel-last memory.
        assert!(nhwc.reshape(&[2, 32, 4]).is_err());
        // Merging h and w is fine: they are adjacent in memory.
        let merged = nhwc.reshape(&[2, 8, 16])?;
        assert_eq!(merged.strides(), Some(&[128, 1, 8][..]));
        Ok(())
    }

    #[test]
    fn test_reshape_any_keeps_format_open() -> Result<()> {
        let any = MemoryDesc::any(vec![4, 2, 1, 1], DataType::F32)?;
        let reshaped = any.reshape(&[1, 4, 2])?;
        assert!(reshaped.is_any());
        Ok(())
    }

    #[test]
    fn test_permute_swaps_dims_and_strides() -> Result<()> {
        let md = MemoryDesc::plain(vec![1, 2, 8, 4], DataType::F32)?;
        let transposed = md.permute_axes(&[0, 1, 3, 2])?;
        assert_eq!(transposed.dims(), &[1, 2, 4, 8]);
        assert_eq!(transposed.strides(), Some(&[64, 32, 1, 4][..]));
        assert_eq!(transposed.layout(), Layout::Strided);
        Ok(())
    }

    #[test]
    fn test_permute_validation() -> Result<()> {
        let md = MemoryDesc::plain(vec![2, 3, 4], DataType::F32)?;
        assert!(md.permute_axes(&[0, 1]).is_err());
        assert!(md.permute_axes(&[0, 1, 3]).is_err());
        assert!(md.permute_axes(&[0, 1, 1]).is_err());
        Ok(())
    }

    #[test]
    fn test_offset_of() -> Result<()> {
        let nhwc = MemoryDesc::with_tag(vec![2, 3, 4, 5], DataType::F32, FormatTag::Nhwc)?;
        // [n=1, c=2, h=3, w=4] -> 1*60 + 2*1 + 3*15 + 4*3
        assert_eq!(nhwc.offset_of(&[1, 2, 3, 4]), 60 + 2 + 45 + 12);
        Ok(())
    }

    #[test]
    fn test_display() -> Result<()> {
        let md = MemoryDesc::with_tag(vec![2, 8, 4, 4], DataType::F32, FormatTag::Nchw)?;
        assert_eq!(md.to_string(), "f32:ncsp:2x8x4x4");
        Ok(())
    }
}

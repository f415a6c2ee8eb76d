//! Error types for primitive creation and execution

use std::fmt;

/// Result type for tessera-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of an [`Error`].
///
/// Creation-time categories tell the caller whether trying the next
/// registered implementation makes sense; [`ErrorCategory::RuntimeFailure`]
/// is only produced while executing a primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Tag, data type, algorithm, attribute or hardware mismatch
    UnsupportedConfiguration,
    /// Allocation failure while negotiating or planning scratchpads
    ResourceExhaustion,
    /// Negotiation ran out of candidates
    NoViableImplementation,
    /// Malformed descriptor or inconsistent shapes
    InvalidArguments,
    /// A sub-primitive step failed during execution
    RuntimeFailure,
}

/// Errors that can occur while creating or executing primitives
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Memory format does not match what the implementation requires
    #[error("unsupported memory format: {0}")]
    UnsupportedTag(String),

    /// Data type combination is not supported
    #[error("unsupported data type: {0}")]
    UnsupportedDataType(String),

    /// Algorithm kind is not supported
    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// Propagation kind is not supported
    #[error("unsupported propagation kind: {0}")]
    UnsupportedPropKind(String),

    /// Primitive attributes (post-ops) are not supported
    #[error("unsupported attributes: {0}")]
    UnsupportedAttr(String),

    /// Hardware capability gate failed
    #[error("unsupported isa: requires {required}, engine provides {available}")]
    UnsupportedIsa { required: String, available: String },

    /// One of the tensors has a zero-sized dimension
    #[error("empty tensor: {0}")]
    EmptyTensor(String),

    /// Allocation failed
    #[error("out of memory: requested {requested} bytes")]
    OutOfMemory { requested: usize },

    /// Negotiation exhausted every candidate implementation
    #[error("no viable implementation for {0}")]
    NoViableImplementation(String),

    /// Inconsistent shapes, ranks or arguments
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    /// Execution-time failure
    #[error("runtime error: {0}")]
    Runtime(String),
}

impl Error {
    /// Create an invalid-arguments error
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArguments(msg.into())
    }

    /// Create a runtime error
    pub fn runtime(msg: impl Into<String>) -> Self {
        Self::Runtime(msg.into())
    }

    /// Create an unsupported-tag error
    pub fn unsupported_tag(msg: impl Into<String>) -> Self {
        Self::UnsupportedTag(msg.into())
    }

    /// Create an unsupported-data-type error
    pub fn unsupported_data_type(msg: impl Into<String>) -> Self {
        Self::UnsupportedDataType(msg.into())
    }

    /// Create an ISA gate error
    pub fn unsupported_isa(required: impl fmt::Display, available: impl fmt::Display) -> Self {
        Self::UnsupportedIsa {
            required: required.to_string(),
            available: available.to_string(),
        }
    }

    /// Category of this error
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::UnsupportedTag(_)
            | Self::UnsupportedDataType(_)
            | Self::UnsupportedAlgorithm(_)
            | Self::UnsupportedPropKind(_)
            | Self::UnsupportedAttr(_)
            | Self::UnsupportedIsa { .. }
            | Self::EmptyTensor(_) => ErrorCategory::UnsupportedConfiguration,
            Self::OutOfMemory { .. } => ErrorCategory::ResourceExhaustion,
            Self::NoViableImplementation(_) => ErrorCategory::NoViableImplementation,
            Self::InvalidArguments(_) => ErrorCategory::InvalidArguments,
            Self::Runtime(_) => ErrorCategory::RuntimeFailure,
        }
    }

    /// Whether a creation failure only means "this implementation does not
    /// apply", so the caller should move on to the next one.
    pub fn is_inapplicable(&self) -> bool {
        !matches!(self.category(), ErrorCategory::RuntimeFailure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categories_cover_taxonomy() {
        assert_eq!(
            Error::unsupported_tag("nhwc").category(),
            ErrorCategory::UnsupportedConfiguration
        );
        assert_eq!(
            Error::unsupported_isa("avx512_core", "avx2").category(),
            ErrorCategory::UnsupportedConfiguration
        );
        assert_eq!(
            Error::OutOfMemory { requested: 64 }.category(),
            ErrorCategory::ResourceExhaustion
        );
        assert_eq!(
            Error::NoViableImplementation("convolution".into()).category(),
            ErrorCategory::NoViableImplementation
        );
        assert_eq!(Error::runtime("boom").category(), ErrorCategory::RuntimeFailure);
    }

    #[test]
    fn runtime_failures_are_not_inapplicable() {
        assert!(Error::invalid("rank").is_inapplicable());
        assert!(!Error::runtime("step failed").is_inapplicable());
    }

    #[test]
    fn isa_error_message_names_both_levels() {
        let msg = Error::unsupported_isa("avx512_core", "avx2").to_string();
        assert!(msg.contains("avx512_core"));
        assert!(msg.contains("avx2"));
    }
}

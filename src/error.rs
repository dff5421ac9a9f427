use std::collections::TryReserveError;

/// Coarse classification of a [`CtcError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The caller handed in malformed tensors or labels.
    InvalidInput,
    /// Workspace sizing, allocation or the execution context failed.
    ResourceExhausted,
    /// The engine hit a numerical failure while computing a sequence.
    Computation,
}

/// Every way a CTC loss invocation can fail.
#[derive(Debug, thiserror::Error)]
pub enum CtcError {
    #[error("{what} mismatch: expected {expected}, got {got}")]
    ShapeMismatch {
        what: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("invalid alphabet: blank label {blank} with alphabet size {alphabet_size}")]
    InvalidAlphabet { blank: usize, alphabet_size: usize },

    #[error("labels are not grouped by batch: entry {entry} has batch {batch} after batch {previous}")]
    UnsortedLabels {
        entry: usize,
        batch: i64,
        previous: i64,
    },

    #[error(
        "label positions are not increasing: entry {entry} (batch {batch}) has position {position} after {previous}"
    )]
    UnorderedLabelPosition {
        entry: usize,
        batch: usize,
        position: i64,
        previous: i64,
    },

    #[error("label entry {entry} refers to batch {batch}, but the batch size is {batch_size}")]
    LabelBatchOutOfRange {
        entry: usize,
        batch: i64,
        batch_size: usize,
    },

    #[error("sequence {batch}: label {label} is outside the alphabet of size {alphabet_size}")]
    LabelOutOfRange {
        batch: usize,
        label: i64,
        alphabet_size: usize,
    },

    #[error("label entry {entry} has negative class index {label}")]
    NegativeLabel { entry: usize, label: i64 },

    #[error("sequence {batch}: negative target length {length}")]
    NegativeTargetLength { batch: usize, length: i64 },

    #[error("sequence {batch}: the blank label {blank} cannot be used as a target")]
    BlankLabel { batch: usize, blank: usize },

    #[error("sequence {batch}: length {length} is outside 0..={max_time}")]
    SequenceLengthOutOfRange {
        batch: usize,
        length: i64,
        max_time: usize,
    },

    #[error(
        "sequence {batch}: {label_length} labels need at least {required_time} time steps, but the sequence length is {sequence_length}"
    )]
    LabelsTooLong {
        batch: usize,
        label_length: usize,
        required_time: usize,
        sequence_length: usize,
    },

    #[error("symbol {symbol:?} is not in the lexicon")]
    UnknownSymbol { symbol: char },

    #[error("workspace size query failed: {reason}")]
    WorkspaceSize { reason: String },

    #[error("workspace holds {provided} bytes, but {required} bytes are required")]
    WorkspaceTooSmall { required: usize, provided: usize },

    #[error("failed to allocate a workspace of {bytes} bytes")]
    Allocation {
        bytes: usize,
        #[source]
        source: TryReserveError,
    },

    #[error("failed to build the compute thread pool")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error("sequence {batch}: {reason}")]
    Computation { batch: usize, reason: String },
}

impl CtcError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CtcError::ShapeMismatch { .. }
            | CtcError::InvalidAlphabet { .. }
            | CtcError::UnsortedLabels { .. }
            | CtcError::UnorderedLabelPosition { .. }
            | CtcError::LabelBatchOutOfRange { .. }
            | CtcError::LabelOutOfRange { .. }
            | CtcError::NegativeLabel { .. }
            | CtcError::NegativeTargetLength { .. }
            | CtcError::BlankLabel { .. }
            | CtcError::SequenceLengthOutOfRange { .. }
            | CtcError::LabelsTooLong { .. }
            | CtcError::UnknownSymbol { .. } => ErrorKind::InvalidInput,
            CtcError::WorkspaceSize { .. }
            | CtcError::WorkspaceTooSmall { .. }
            | CtcError::Allocation { .. }
            | CtcError::ThreadPool(_) => ErrorKind::ResourceExhausted,
            CtcError::Computation { .. } => ErrorKind::Computation,
        }
    }
}

pub type Result<T> = std::result::Result<T, CtcError>;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_error_kinds() {
        let err = CtcError::LabelsTooLong {
            batch: 0,
            label_length: 3,
            required_time: 3,
            sequence_length: 2,
        };
        assert_eq!(err.kind(), ErrorKind::InvalidInput);

        let err = CtcError::WorkspaceSize {
            reason: "empty alphabet".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::ResourceExhausted);

        let err = CtcError::Computation {
            batch: 1,
            reason: "non-finite activations".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::Computation);
        assert_eq!(err.to_string(), "sequence 1: non-finite activations");
    }
}

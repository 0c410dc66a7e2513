use thiserror::Error;

/// Errors raised while decoding or encoding the binary SDDS table files
/// used by the LHC and SPS formats.
#[derive(Debug, Error)]
pub enum SddsError {
    #[error("SDDS file failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("File does not start with the SDDS1 version tag")]
    MissingVersionTag,
    #[error("Malformed SDDS header line: {0}")]
    MalformedHeader(String),
    #[error("Unsupported SDDS data type '{0}'")]
    UnsupportedType(String),
    #[error("SDDS binary section ended early while reading '{0}'")]
    TruncatedData(String),
}

/// Errors raised while decoding or encoding TFS tables (MAD-NG format).
#[derive(Debug, Error)]
pub enum TfsError {
    #[error("TFS table failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Malformed TFS line: {0}")]
    MalformedLine(String),
    #[error("TFS data row has {found} entries, expected {expected}")]
    RowLengthMismatch { expected: usize, found: usize },
    #[error("Failed to parse TFS value '{0}'")]
    BadValue(String),
}

/// The error conditions of the turn-by-turn library.
///
/// Dispatch failures, structural violations of a wire format and shape
/// inconsistencies are distinct variants so that callers (and tests) can
/// branch on the condition rather than on message contents.
#[derive(Debug, Error)]
pub enum TbtError {
    #[error("Provided format '{requested}' is not supported, should be one of {valid:?}")]
    UnsupportedFormat {
        requested: String,
        valid: Vec<&'static str>,
    },
    #[error("Format '{format}' does not support {operation}, formats supporting it: {valid:?}")]
    UnsupportedDirection {
        format: &'static str,
        operation: &'static str,
        valid: Vec<&'static str>,
    },
    #[error("Malformed source: {0}")]
    MalformedSource(String),
    #[error("Inconsistent shape: {0}")]
    InconsistentShape(String),
    #[error("Only one of '{first}' and '{second}' should be provided")]
    ExclusiveParameterViolation {
        first: &'static str,
        second: &'static str,
    },
    #[error("IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("HDF5 error: {0}")]
    Hdf5Error(#[from] hdf5::Error),
    #[error("SDDS error: {0}")]
    SddsError(#[from] SddsError),
    #[error("TFS error: {0}")]
    TfsError(#[from] TfsError),
}

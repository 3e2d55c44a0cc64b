use thiserror::Error;

/// Represents all possible errors that can occur while loading or extracting from a package cache.
///
/// A missing object is not an error: lookups return `Option`, and these variants describe
/// why an object that *was* indexed could not be produced.
#[derive(Debug, Error)]
pub enum CacheError {
    /// A header had a bad magic or declared tables outside the file bounds.
    #[error("Malformed header: {0}")]
    MalformedHeader(String),
    /// Represents an error that occurs when the data in a file is invalid.
    #[error("Invalid data: {0}")]
    InvalidData(String),
    /// Represents an error that occurs when a file is not found in the storage.
    #[error("File not found: {0}")]
    FileNotFound(String),
    /// Represents an error that occurs when a file is not supported by the storage.
    #[error("Unsupported file type: {0}")]
    UnsupportedFileType(String),
    /// A block used a compression scheme this crate cannot decode.
    #[error("Unsupported compression type {0:#x}")]
    UnsupportedCompression(u8),
    /// A block failed to decompress.
    #[error("Decompression failed: {0}")]
    Decompression(String),
    /// A CDN request failed or returned unexpected data.
    #[error("Network error: {0}")]
    Network(String),
    /// Represents an error that occurs during I/O operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Represents an error that occurs for any other reason not covered by the above variants.
    #[error("Cache error: {0}")]
    Other(String),
}

impl From<glob::PatternError> for CacheError {
    fn from(error: glob::PatternError) -> Self {
        CacheError::Other(format!("Invalid pattern: {error}"))
    }
}

impl From<hex::FromHexError> for CacheError {
    fn from(error: hex::FromHexError) -> Self {
        CacheError::InvalidData(format!("Invalid hex: {error}"))
    }
}

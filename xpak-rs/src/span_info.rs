use crate::casc_encoding_key::EncodingKey;

/// One span of a TVFS file, as resolved through the container file table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpanInfo {
    pub encoding_key: EncodingKey,
    /// Offset of this span inside the logical file.
    pub ref_file_offset: u32,
    /// Decoded size of the span.
    pub content_size: u32,
    /// Row offset inside the container file table.
    pub cft_offset: u32,
}

use crate::span_info::SpanInfo;

/// A file listed by the root handler.
#[derive(Debug, Clone)]
pub struct Entry {
    pub name: String,
    pub spans: Vec<SpanInfo>,
}

impl Entry {
    pub fn new_with_spans(name: String, spans: Vec<SpanInfo>) -> Self {
        Self { name, spans }
    }

    /// Decoded size of the whole file.
    pub fn content_size(&self) -> u64 {
        self.spans.iter().map(|s| s.content_size as u64).sum()
    }
}

use crate::error::CacheError;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

/// A struct to hold a Delimiter Separated Value File (DSV)
#[derive(Debug)]
pub(crate) struct DSVFile {
    /// The delimiter string
    delimiter: String,
    /// The comment indicator string
    comment: Option<String>,
    /// The rows within the DSV file
    pub(crate) rows: Vec<Vec<String>>,
}

impl DSVFile {
    /// Initializes a new instance with a given delimiter and optional comment string
    pub(crate) fn new(delimiter: &str, comment: Option<&str>) -> Self {
        Self {
            delimiter: delimiter.to_string(),
            comment: comment.filter(|c| !c.is_empty()).map(str::to_string),
            rows: Vec::new(),
        }
    }

    /// Reads a DSV file from disk
    pub(crate) fn from_file<P: AsRef<Path>>(
        file: P,
        delimiter: &str,
        comment: Option<&str>,
    ) -> Result<Self, CacheError> {
        let file = File::open(file)?;
        let mut dsv = Self::new(delimiter, comment);
        dsv.load(file)?;
        Ok(dsv)
    }

    /// Loads DSV data from a reader (e.g., File, BufReader, etc.)
    pub(crate) fn load<R: Read>(&mut self, reader: R) -> Result<(), CacheError> {
        for line in BufReader::new(reader).lines() {
            let line = line?;
            let line = line.trim_end_matches('\r');
            if line.trim().is_empty() {
                continue;
            }
            if let Some(comment) = &self.comment {
                if line.starts_with(comment.as_str()) {
                    continue;
                }
            }
            self.rows
                .push(line.split(&self.delimiter).map(str::to_string).collect());
        }
        Ok(())
    }

    /// Gets the header row, if any (first row)
    pub(crate) fn header(&self) -> Option<&Vec<String>> {
        self.rows.first()
    }
}

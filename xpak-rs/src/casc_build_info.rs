use std::collections::HashMap;
use std::path::Path;

use crate::error::CacheError;
use crate::utility::dsv_file::DSVFile;

/// Represents build information loaded from a CASC `.build.info` file.
///
/// Only the first data row (the active product) is kept.
#[derive(Debug, Default)]
pub struct CascBuildInfo {
    variables: HashMap<String, Variable>,
}

/// Represents a variable entry in the build info.
#[derive(Debug)]
pub struct Variable {
    pub name: String,
    /// The declared type, e.g. `HEX:16`.
    pub var_type: String,
    pub value: String,
}

impl CascBuildInfo {
    /// Loads build info from the specified file and returns a new instance.
    pub fn with_file<P: AsRef<Path>>(file_name: P) -> Result<Self, CacheError> {
        let mut instance = CascBuildInfo::default();
        instance.load(file_name)?;
        Ok(instance)
    }

    /// Retrieves the value of a variable by name, or returns the provided default value if not found.
    pub fn get(&self, var_name: &str, default_value: &str) -> String {
        self.variables
            .get(var_name)
            .map_or_else(|| default_value.to_string(), |var| var.value.clone())
    }

    pub fn variable(&self, var_name: &str) -> Option<&Variable> {
        self.variables.get(var_name)
    }

    /// Loads build info variables from the specified file into this instance.
    pub fn load<P: AsRef<Path>>(&mut self, file_name: P) -> Result<(), CacheError> {
        let dsv = DSVFile::from_file(file_name, "|", Some("#"))?;
        self.load_rows(&dsv.rows)
    }

    fn load_rows(&mut self, rows: &[Vec<String>]) -> Result<(), CacheError> {
        if rows.len() < 2 {
            return Err(CacheError::InvalidData("Build info has no data rows".into()));
        }
        let header = &rows[0];
        let data = &rows[1];
        if header.len() != data.len() {
            return Err(CacheError::InvalidData(
                "Build info header/data length mismatch".into(),
            ));
        }
        for (info, value) in header.iter().zip(data.iter()) {
            let (name, var_type) = info.split_once('!').ok_or_else(|| {
                CacheError::InvalidData(format!("Build info header cell `{info}` has no type"))
            })?;
            self.variables.insert(
                name.to_string(),
                Variable {
                    name: name.to_string(),
                    var_type: var_type.to_string(),
                    value: value.clone(),
                },
            );
        }
        Ok(())
    }
}

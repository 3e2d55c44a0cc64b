use crate::error::CacheError;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

/// Represents the build configuration of a CASC storage (`key = value value ...` lines).
#[derive(Debug, Default)]
pub struct CascConfig {
    variables: HashMap<String, Variable>,
}

/// Represents a variable in the CASC configuration, with a name and a list of values.
#[derive(Debug, Eq, PartialEq, Hash)]
pub struct Variable {
    /// The name of the variable.
    pub name: String,
    /// The values associated with the variable.
    pub values: Vec<String>,
}

impl CascConfig {
    pub fn with_file<P: AsRef<Path>>(file_name: P) -> Result<Self, CacheError> {
        let mut config = CascConfig::default();
        config.load(File::open(file_name)?)?;
        Ok(config)
    }

    /// Retrieves a variable by name, if it exists.
    pub fn get(&self, var_name: &str) -> Option<&Variable> {
        self.variables.get(var_name)
    }

    /// Loads configuration variables from a reader.
    pub fn load<R: Read>(&mut self, reader: R) -> Result<(), CacheError> {
        for line in BufReader::new(reader).lines() {
            let line = line?;
            let line = line.trim();

            // Ignore empty lines and comments
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if let Some((name, value)) = line.split_once('=') {
                let variable = Variable {
                    name: name.trim().to_string(),
                    values: value.split_whitespace().map(str::to_string).collect(),
                };
                self.variables.insert(variable.name.clone(), variable);
            }
        }

        Ok(())
    }
}

/// Represents information about a file in the CASC storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CascFileInfo {
    /// The `/`-separated name of the file.
    pub file_name: String,
    /// The decoded size of the file in bytes.
    pub file_size: u64,
    /// Whether every span of the file is present in the local data files.
    pub exists: bool,
}

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HookError {
    #[error("function is already replaced")]
    AlreadyReplaced,
    #[error("module not loaded: {0}")]
    ModuleNotFound(String),
    #[error("symbol not found: {0}")]
    SymbolNotFound(String),
    #[error("could not allocate code memory")]
    AllocationFailed,
    #[error("could not change memory protection")]
    ProtectionFailed,
    #[error("prologue cannot be relocated")]
    RelocationFailed,
    #[error("unsupported on this target")]
    Unsupported,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleInfo {
    pub name: String,
    pub path: String,
    /// Lowest mapped address of the module's PT_LOAD segments.
    pub base_address: usize,
    /// Difference between link-time and run-time addresses (`dlpi_addr`).
    pub load_bias: usize,
    pub size: usize,
}

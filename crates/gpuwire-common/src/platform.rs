use std::path::PathBuf;

/// Returns the default directory for wire trace files.
/// `GPUWIRE_TRACE_DIR` wins; otherwise a `gpuwire-traces` directory under the
/// platform's temporary directory.
pub fn default_trace_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("GPUWIRE_TRACE_DIR") {
        return PathBuf::from(dir);
    }
    #[cfg(unix)]
    {
        let runtime_dir = std::env::var("XDG_RUNTIME_DIR")
            .unwrap_or_else(|_| "/tmp".to_string());
        PathBuf::from(runtime_dir).join("gpuwire-traces")
    }
    #[cfg(not(unix))]
    {
        std::env::temp_dir().join("gpuwire-traces")
    }
}

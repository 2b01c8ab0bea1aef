use std::path::PathBuf;

/// Returns the default trace file path for this process.
/// `DXCAP_TRACE_DIR` overrides the directory, otherwise the system temp dir is used.
pub fn default_trace_path() -> PathBuf {
    let dir = std::env::var_os("DXCAP_TRACE_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir);
    dir.join(format!("dxcap_{}.dxtrace", std::process::id()))
}

/// Returns the platform name string.
pub fn platform_name() -> &'static str {
    #[cfg(target_os = "windows")]
    { "windows" }
    #[cfg(target_os = "linux")]
    { "linux" }
    #[cfg(target_os = "macos")]
    { "macos" }
    #[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
    { "unknown" }
}

use std::path::{Path, PathBuf};

/// Platform-specific operations abstracted behind a common interface.
/// Each OS provides its own `NativePlatform` implementation so call sites
/// remain free of `#[cfg]` blocks.
pub trait Platform {
    /// Send a termination signal to the process identified by `pid`.
    fn kill_process(pid: &str) -> std::io::Result<std::process::Output>;

    /// Return PIDs of running processes whose command line matches `name`.
    /// Best-effort: an empty result means "none found or unable to scan".
    fn find_pids_by_name(name: &str) -> Vec<String>;

    /// Return PIDs of processes listening on `port`.
    fn find_pids_on_port(port: u16) -> Vec<String>;

    /// Spawn a child that tails / follows a log file.
    fn tail_file(path: &Path) -> std::io::Result<std::process::Child>;

    /// Set restrictive *directory* permissions (0o700 on Unix, no-op on Windows).
    fn restrict_dir_permissions(path: &Path);

    /// Set restrictive *file* permissions (0o600 on Unix, no-op on Windows).
    fn restrict_file_permissions(path: &Path);

    /// Binary filename for this platform (`"gameforge"` / `"gameforge.exe"`).
    fn binary_name() -> &'static str;

    /// Root data directory.
    /// Unix: `~/.gameforge`, Windows: `%APPDATA%\gameforge`.
    fn data_dir() -> PathBuf;
}

/// Honor `GAMEFORGE_DATA_DIR` before falling back to the platform default,
/// so tests and multi-instance deployments can relocate all state.
pub fn resolve_data_dir(default: PathBuf) -> PathBuf {
    match std::env::var("GAMEFORGE_DATA_DIR") {
        Ok(dir) if !dir.trim().is_empty() => PathBuf::from(dir),
        _ => default,
    }
}

#[cfg(unix)]
mod unix;
#[cfg(unix)]
pub use unix::NativePlatform;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
pub use windows::NativePlatform;

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

const APP_DIR: &str = "fmdial";

pub const DAEMON_TCP_PORT: u16 = 9877;

/// Distinguishes IPC sockets of successive mpv instances within one process.
static NEXT_SOCKET_ID: AtomicU64 = AtomicU64::new(1);

/// Fresh IPC socket name for one mpv instance.
#[cfg(unix)]
pub fn mpv_socket_name() -> String {
    let id = NEXT_SOCKET_ID.fetch_add(1, Ordering::Relaxed);
    format!(
        "{}/fmdial-mpv-{}-{}.sock",
        std::env::temp_dir().display(),
        std::process::id(),
        id
    )
}

#[cfg(windows)]
pub fn mpv_socket_name() -> String {
    let id = NEXT_SOCKET_ID.fetch_add(1, Ordering::Relaxed);
    format!("fmdial-mpv-{}-{}", std::process::id(), id)
}

#[cfg(unix)]
pub fn mpv_socket_arg(name: &str) -> String {
    format!("--input-ipc-server={}", name)
}

#[cfg(windows)]
pub fn mpv_socket_arg(name: &str) -> String {
    format!("--input-ipc-server=\\\\.\\pipe\\{}", name)
}

pub fn data_dir() -> PathBuf {
    // ~/.local/share/fmdial on unix (XDG layout, also on macOS)
    #[cfg(unix)]
    {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join(".local")
            .join("share")
            .join(APP_DIR)
    }
    #[cfg(windows)]
    {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
    }
}

pub fn config_dir() -> PathBuf {
    #[cfg(unix)]
    {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".config")
            .join(APP_DIR)
    }

    #[cfg(windows)]
    {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
    }
}

#[cfg(unix)]
pub fn mpv_binary_name() -> &'static str {
    "mpv"
}

#[cfg(windows)]
pub fn mpv_binary_name() -> &'static str {
    "mpv.exe"
}

/// Find mpv binary for playback.
/// Checks beside the current exe first, then PATH.  `MPV_PATH` overrides both.
pub fn find_mpv_binary() -> Option<PathBuf> {
    if let Ok(p) = std::env::var("MPV_PATH") {
        let path = PathBuf::from(p);
        if path.exists() {
            return Some(path);
        }
    }

    let exe_name = mpv_binary_name();

    if let Ok(current_exe) = std::env::current_exe() {
        if let Some(dir) = current_exe.parent() {
            let local_mpv = dir.join(exe_name);
            if local_mpv.exists() {
                return Some(local_mpv);
            }
        }
    }

    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(exe_name))
        .find(|p| p.exists())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_names_are_unique() {
        assert_ne!(mpv_socket_name(), mpv_socket_name());
    }

    #[test]
    fn test_dirs_end_with_app_name() {
        assert!(data_dir().ends_with(APP_DIR));
        assert!(config_dir().ends_with(APP_DIR));
    }
}

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

/// Global flag to control whether to use system-installed binaries from PATH
/// instead of ones shipped beside the executable.
static USE_SYSTEM_DEPS: AtomicBool = AtomicBool::new(false);

/// Set whether to use system dependencies (from PATH) instead of bundled ones.
pub fn set_use_system_deps(use_system: bool) {
    USE_SYSTEM_DEPS.store(use_system, Ordering::Relaxed);
}

/// Check whether to use system dependencies from PATH.
pub fn should_use_system_deps() -> bool {
    USE_SYSTEM_DEPS.load(Ordering::Relaxed)
}

pub fn data_dir() -> PathBuf {
    // On macOS and Linux, use ~/.local/share/radiko/ (XDG standard)
    #[cfg(unix)]
    {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join(".local")
            .join("share")
            .join("radiko")
    }
    #[cfg(windows)]
    {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("radiko")
    }
}

pub fn config_dir() -> PathBuf {
    #[cfg(unix)]
    {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".config")
            .join("radiko")
    }

    #[cfg(windows)]
    {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("radiko")
    }
}

/// Where recordings land unless the config says otherwise.
pub fn downloads_dir() -> PathBuf {
    dirs::download_dir().unwrap_or_else(|| {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("Downloads")
    })
}

#[cfg(unix)]
fn ffmpeg_binary_names() -> &'static [&'static str] {
    &["ffmpeg"]
}

#[cfg(windows)]
fn ffmpeg_binary_names() -> &'static [&'static str] {
    &["ffmpeg.exe", "ffmpeg"]
}

#[cfg(unix)]
fn ffplay_binary_names() -> &'static [&'static str] {
    &["ffplay"]
}

#[cfg(windows)]
fn ffplay_binary_names() -> &'static [&'static str] {
    &["ffplay.exe", "ffplay"]
}

fn find_beside_exe(names: &[&str]) -> Option<PathBuf> {
    let current_exe = std::env::current_exe().ok()?;
    let dir = current_exe.parent()?;
    for name in names {
        let p = dir.join(name);
        if p.exists() {
            return Some(p);
        }
        let p = dir.join("external").join(name);
        if p.exists() {
            return Some(p);
        }
    }
    None
}

fn find_on_path(names: &[&str]) -> Option<PathBuf> {
    let path = std::env::var("PATH").ok()?;
    #[cfg(unix)]
    let sep = ":";
    #[cfg(windows)]
    let sep = ";";
    for dir in path.split(sep) {
        for name in names {
            let p = PathBuf::from(dir).join(name);
            if p.exists() {
                return Some(p);
            }
        }
    }
    None
}

/// Find the ffmpeg binary used as the stream transcoder.
///
/// Searches in order:
/// 1. FFMPEG_PATH environment variable
/// 2. Beside current executable (unless use_system_deps is set)
/// 3. PATH
pub fn find_ffmpeg_binary() -> Option<PathBuf> {
    if let Ok(p) = std::env::var("FFMPEG_PATH") {
        let path = PathBuf::from(p);
        if path.exists() {
            return Some(path);
        }
    }

    if !should_use_system_deps() {
        if let Some(p) = find_beside_exe(ffmpeg_binary_names()) {
            return Some(p);
        }
    }

    find_on_path(ffmpeg_binary_names())
}

/// Find ffplay, which the interactive player uses as its audio output.
pub fn find_ffplay_binary() -> Option<PathBuf> {
    if let Ok(p) = std::env::var("FFPLAY_PATH") {
        let path = PathBuf::from(p);
        if path.exists() {
            return Some(path);
        }
    }
    if !should_use_system_deps() {
        if let Some(p) = find_beside_exe(ffplay_binary_names()) {
            return Some(p);
        }
    }
    find_on_path(ffplay_binary_names())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dirs_are_namespaced() {
        assert!(data_dir().ends_with("radiko"));
        assert!(config_dir().ends_with("radiko"));
    }

    #[test]
    fn system_deps_flag_round_trips() {
        set_use_system_deps(true);
        assert!(should_use_system_deps());
        set_use_system_deps(false);
        assert!(!should_use_system_deps());
    }
}

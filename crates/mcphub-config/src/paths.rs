//! XDG path resolution (spec.md §6).
//!
//! Resolution order for the config file: `--config <file>` overrides
//! `--config-dir <dir>/mcphub.json` overrides the XDG default
//! `<config_dir>/mcphub.json`. Session state and the persistent KV store
//! (M3) live under the XDG state directory.

use std::path::PathBuf;

/// Canonical XDG app name used for all path resolution.
pub const APP_NAME: &str = "mcphub";

/// Default config file name inside the resolved config directory.
pub const CONFIG_FILE_NAME: &str = "mcphub.json";

fn project_dirs() -> Option<directories::ProjectDirs> {
    directories::ProjectDirs::from("", "", APP_NAME)
}

pub fn config_dir() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.config_dir().to_path_buf())
}

pub fn state_dir() -> Option<PathBuf> {
    project_dirs().map(|dirs| {
        dirs.state_dir()
            .unwrap_or_else(|| dirs.data_local_dir())
            .to_path_buf()
    })
}

fn effective_uid() -> u32 {
    #[cfg(unix)]
    {
        // SAFETY: `geteuid` has no preconditions and always succeeds.
        unsafe { libc::geteuid() }
    }
    #[cfg(not(unix))]
    {
        0
    }
}

pub fn runtime_dir() -> PathBuf {
    if let Ok(root) = std::env::var("XDG_RUNTIME_DIR") {
        return PathBuf::from(root).join(APP_NAME);
    }
    std::env::temp_dir().join(format!("{APP_NAME}-{}", effective_uid()))
}

/// Fallback state directory when `ProjectDirs` resolution fails (e.g. no
/// `$HOME`), used by callers that must always produce a writable path.
pub fn state_dir_fallback() -> PathBuf {
    std::env::temp_dir().join(format!("{APP_NAME}-state"))
}

/// Resolve the config file path given explicit CLI overrides, per spec.md §6's
/// precedence: `--config` > `--config-dir`/`mcphub.json` > XDG default.
pub fn resolve_config_path(config_flag: Option<&str>, config_dir_flag: Option<&str>) -> PathBuf {
    if let Some(path) = config_flag {
        return PathBuf::from(path);
    }
    if let Some(dir) = config_dir_flag {
        return PathBuf::from(dir).join(CONFIG_FILE_NAME);
    }
    config_dir()
        .unwrap_or_else(state_dir_fallback)
        .join(CONFIG_FILE_NAME)
}

/// Persistent session-store subdirectory (M3), rooted under the state dir.
pub fn session_store_dir() -> PathBuf {
    state_dir().unwrap_or_else(state_dir_fallback).join("sessions")
}

/// PID file path for the running HTTP proxy instance, discovered by the
/// `proxy` stdio shim (spec.md §6: `<configDir>/server.pid`). `config_dir` is
/// the directory containing the resolved config file, not necessarily the
/// XDG config dir returned by `config_dir()` above (a `--config`/`--config-dir`
/// override changes it).
pub fn pid_file_path(config_dir: &std::path::Path) -> PathBuf {
    config_dir.join("server.pid")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_config_flag_wins() {
        let path = resolve_config_path(Some("/tmp/custom.json"), Some("/tmp/dir"));
        assert_eq!(path, PathBuf::from("/tmp/custom.json"));
    }

    #[test]
    fn config_dir_flag_used_when_no_explicit_file() {
        let path = resolve_config_path(None, Some("/tmp/dir"));
        assert_eq!(path, PathBuf::from("/tmp/dir").join(CONFIG_FILE_NAME));
    }

    #[test]
    fn falls_back_to_xdg_default_when_neither_flag_given() {
        let path = resolve_config_path(None, None);
        assert!(path.ends_with(CONFIG_FILE_NAME));
    }

    #[test]
    fn runtime_dir_uses_xdg_runtime_dir_when_present() {
        // SAFETY: single-threaded test, no other code reads this var concurrently.
        unsafe { std::env::set_var("XDG_RUNTIME_DIR", "/run/user/1000") };
        let path = runtime_dir();
        unsafe { std::env::remove_var("XDG_RUNTIME_DIR") };
        assert_eq!(path, PathBuf::from("/run/user/1000").join(APP_NAME));
    }
}

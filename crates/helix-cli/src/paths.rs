use anyhow::Result;
use std::path::PathBuf;

const HELIX_DIR: &str = ".helix";
const CONFIG_FILE: &str = "approvals.toml";
const POLICY_FILE: &str = "exec-approvals.json";

/// Environment variable to override the Helix state directory.
const HELIX_DIR_ENV: &str = "HELIX_DIR";

/// Resolve the Helix state directory.
/// Priority: HELIX_DIR env var > ~/.helix/
pub fn resolve_helix_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var(HELIX_DIR_ENV)
        && !dir.trim().is_empty()
    {
        return Ok(PathBuf::from(dir));
    }
    dirs::home_dir()
        .map(|h| h.join(HELIX_DIR))
        .ok_or_else(|| anyhow::anyhow!("Failed to determine home directory"))
}

/// Get the config file path: ~/.helix/approvals.toml
pub fn config_path() -> Result<PathBuf> {
    Ok(resolve_helix_dir()?.join(CONFIG_FILE))
}

/// Get the policy document path: ~/.helix/exec-approvals.json
pub fn policy_path() -> Result<PathBuf> {
    Ok(resolve_helix_dir()?.join(POLICY_FILE))
}

/// Serializes tests that mutate process environment variables.
#[cfg(test)]
pub(crate) fn env_lock() -> std::sync::MutexGuard<'static, ()> {
    use std::sync::{Mutex, OnceLock};
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_helix_dir() {
        let _lock = env_lock();
        unsafe { std::env::remove_var(HELIX_DIR_ENV) };
        let dir = resolve_helix_dir().unwrap();
        assert!(dir.ends_with(HELIX_DIR));
    }

    #[test]
    fn test_env_override() {
        let _lock = env_lock();
        unsafe { std::env::set_var(HELIX_DIR_ENV, "/tmp/test-helix") };
        let dir = resolve_helix_dir().unwrap();
        assert_eq!(dir, PathBuf::from("/tmp/test-helix"));
        unsafe { std::env::remove_var(HELIX_DIR_ENV) };
    }

    #[test]
    fn test_blank_override_is_ignored() {
        let _lock = env_lock();
        unsafe { std::env::set_var(HELIX_DIR_ENV, "  ") };
        let dir = resolve_helix_dir().unwrap();
        assert!(dir.ends_with(HELIX_DIR));
        unsafe { std::env::remove_var(HELIX_DIR_ENV) };
    }

    #[test]
    fn test_file_paths() {
        let _lock = env_lock();
        unsafe { std::env::set_var(HELIX_DIR_ENV, "/tmp/test-helix") };
        assert_eq!(
            config_path().unwrap(),
            PathBuf::from("/tmp/test-helix/approvals.toml")
        );
        assert_eq!(
            policy_path().unwrap(),
            PathBuf::from("/tmp/test-helix/exec-approvals.json")
        );
        unsafe { std::env::remove_var(HELIX_DIR_ENV) };
    }
}

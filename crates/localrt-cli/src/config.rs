//! Configuration file resolution for the CLI.
//!
//! Search order:
//! 1. `--config PATH`
//! 2. `$LOCALRT_CONFIG`
//! 3. `system.json` in the platform config directory
//! 4. Built-in defaults (host CPU only)
//!
//! `$LOCALRT_HIP_LIBRARY` then overrides the HIP runtime path.

use anyhow::{anyhow, Context, Result};
use directories::ProjectDirs;
use localrt_core::config::HIP_LIBRARY_ENV;
use localrt_core::SystemConfig;
use std::path::PathBuf;
use tracing::debug;

/// Environment variable naming a configuration file
const CONFIG_ENV: &str = "LOCALRT_CONFIG";

/// Config file name inside the platform config directory
const CONFIG_FILENAME: &str = "system.json";

/// Returns the platform config directory.
///
/// - macOS: `~/Library/Application Support/dev.localrt.localrt/`
/// - Linux: `~/.config/localrt/`
/// - Windows: `%APPDATA%\localrt\localrt\config\`
pub fn config_dir() -> Result<PathBuf> {
    ProjectDirs::from("dev", "localrt", "localrt")
        .map(|dirs| dirs.config_dir().to_path_buf())
        .ok_or_else(|| anyhow!("Could not determine config directory"))
}

/// Picks the config file to read, if any.
///
/// An explicit path must exist; the environment and platform locations
/// are skipped when absent.
fn find_config_file(
    explicit: Option<&PathBuf>,
    from_env: Option<PathBuf>,
    platform_dir: Option<PathBuf>,
) -> Result<Option<PathBuf>> {
    if let Some(path) = explicit {
        if !path.exists() {
            return Err(anyhow!("Config file not found: {}", path.display()));
        }
        return Ok(Some(path.clone()));
    }
    if let Some(path) = from_env {
        if !path.exists() {
            return Err(anyhow!(
                "Config file from ${} not found: {}",
                CONFIG_ENV,
                path.display()
            ));
        }
        return Ok(Some(path));
    }
    Ok(platform_dir
        .map(|dir| dir.join(CONFIG_FILENAME))
        .filter(|path| path.exists()))
}

/// Loads the system configuration for this invocation.
pub fn load_config(explicit: Option<&PathBuf>) -> Result<SystemConfig> {
    let path = find_config_file(
        explicit,
        std::env::var_os(CONFIG_ENV).map(PathBuf::from),
        config_dir().ok(),
    )?;
    let config = match path {
        Some(path) => {
            debug!("Reading config from {}", path.display());
            SystemConfig::from_file(&path)
                .with_context(|| format!("Failed to read config: {}", path.display()))?
        }
        None => {
            debug!("No config file found, using defaults");
            SystemConfig::default()
        }
    };
    Ok(apply_env_overrides(
        config,
        std::env::var_os(HIP_LIBRARY_ENV).map(PathBuf::from),
    ))
}

fn apply_env_overrides(mut config: SystemConfig, hip_library: Option<PathBuf>) -> SystemConfig {
    if let Some(library) = hip_library {
        debug!("HIP library overridden by ${}", HIP_LIBRARY_ENV);
        config.amdgpu.library = Some(library);
    }
    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use localrt_core::BackendKind;

    #[test]
    fn test_explicit_path_wins() {
        let dir = tempfile::tempdir().unwrap();
        let explicit = dir.path().join("a.json");
        let env = dir.path().join("b.json");
        std::fs::write(&explicit, "{}").unwrap();
        std::fs::write(&env, "{}").unwrap();

        let found = find_config_file(Some(&explicit), Some(env), None).unwrap();
        assert_eq!(found, Some(explicit));
    }

    #[test]
    fn test_missing_explicit_path_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.json");
        assert!(find_config_file(Some(&missing), None, None).is_err());
    }

    #[test]
    fn test_platform_dir_used_when_present() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            find_config_file(None, None, Some(dir.path().to_path_buf())).unwrap(),
            None
        );

        let file = dir.path().join(CONFIG_FILENAME);
        std::fs::write(&file, "{}").unwrap();
        assert_eq!(
            find_config_file(None, None, Some(dir.path().to_path_buf())).unwrap(),
            Some(file)
        );
    }

    #[test]
    fn test_load_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("system.json");
        std::fs::write(
            &path,
            r#"{ "backends": ["host", "amdgpu"], "host": { "worker_threads": 3 } }"#,
        )
        .unwrap();

        let config = load_config(Some(&path)).unwrap();
        assert_eq!(
            config.backends,
            vec![BackendKind::HostCpu, BackendKind::AmdGpu]
        );
        assert_eq!(config.host.worker_threads, Some(3));
    }

    #[test]
    fn test_invalid_file_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{ not json").unwrap();

        let err = load_config(Some(&path)).unwrap_err();
        assert!(format!("{:#}", err).contains("broken.json"));
    }

    #[test]
    fn test_hip_library_override() {
        let config = apply_env_overrides(
            SystemConfig::default(),
            Some(PathBuf::from("/opt/rocm/lib/libamdhip64.so")),
        );
        assert_eq!(
            config.amdgpu.library,
            Some(PathBuf::from("/opt/rocm/lib/libamdhip64.so"))
        );
        assert_eq!(
            apply_env_overrides(SystemConfig::default(), None).amdgpu.library,
            None
        );
    }
}

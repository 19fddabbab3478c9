use std::env;
use std::path::PathBuf;

pub fn user_home() -> Option<PathBuf> { home::home_dir() }

pub fn user_config() -> Option<PathBuf> {
    #[cfg(target_os = "macos")]
    {
        user_home().map(|p| p.join("Library/Application Support"))
    }
    #[cfg(not(target_os = "macos"))]
    {
        env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .filter(|p| p.is_absolute())
            .or_else(|| user_home().map(|p| p.join(".config")))
    }
}

/// `<user config dir>/cellar`.
pub fn cellar_config_dir() -> Option<PathBuf> { user_config().map(|p| p.join("cellar")) }

use std::path::PathBuf;

/// Returns the default socket path for the relay server.
pub fn default_socket_path() -> PathBuf {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        PathBuf::from(runtime_dir).join("relay.sock")
    } else {
        // SAFETY: getuid() is always safe to call and has no preconditions
        let uid = unsafe { libc::getuid() };
        PathBuf::from(format!("/tmp/relay-{uid}.sock"))
    }
}

/// Returns the config/data directory path for relay.
pub fn dirs_path() -> PathBuf {
    if let Ok(config_dir) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(config_dir).join("relay")
    } else if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home).join(".config").join("relay")
    } else {
        PathBuf::from("/tmp/relay")
    }
}

/// Returns the default PID file path for the relay server.
pub fn pid_file_path() -> PathBuf {
    dirs_path().join("relay.pid")
}

/// Returns the config file path for the relay server.
pub fn config_path() -> PathBuf {
    dirs_path().join("config.toml")
}

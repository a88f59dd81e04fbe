use std::env;
use std::path::PathBuf;
use std::time::Duration;

use pty_bridge_ipc::frame::DEFAULT_MAX_FRAME_BYTES;
use pty_bridge_terminal::DEFAULT_READ_BUFFER_BYTES;
use tracing::warn;

pub const DEFAULT_LISTEN: &str = "127.0.0.1:0";
pub const DEFAULT_CALL_TIMEOUT_SECS: u64 = 10;
pub const MIN_CALL_TIMEOUT_SECS: u64 = 1;
pub const MAX_CALL_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_KEEPALIVE_TIMEOUT_SECS: u64 = 20;
const MIN_KEEPALIVE_TIMEOUT_SECS: u64 = 1;
pub const DEFAULT_ERROR_LIMIT: usize = 10;
pub const DEFAULT_MAX_SESSIONS: usize = 32;
const FALLBACK_SHELL: &str = "/bin/bash";
const FALLBACK_EDITOR: &str = "vi";

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub listen: String,
    pub allow_remote: bool,
    /// Fixed bearer token; a random one is generated at startup when unset.
    pub token: Option<String>,
    pub call_timeout: Duration,
    pub keepalive_timeout: Duration,
    pub error_limit: usize,
    pub read_buffer_bytes: usize,
    pub max_sessions: usize,
    pub max_frame_bytes: usize,
    pub command: Vec<String>,
    pub runtime_dir: PathBuf,
    pub close_on_disconnect: bool,
    /// Directory searched for `app` mode entrypoints.
    pub app_dir: PathBuf,
    /// Editor command for `editor` mode; the file path is appended.
    pub editor: Vec<String>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl BridgeConfig {
    pub fn from_env() -> Self {
        Self {
            listen: env_string("PTY_BRIDGE_LISTEN").unwrap_or_else(|| DEFAULT_LISTEN.to_string()),
            allow_remote: env_bool("PTY_BRIDGE_ALLOW_REMOTE").unwrap_or(false),
            token: env_string("PTY_BRIDGE_TOKEN"),
            call_timeout: clamp_call_timeout(Duration::from_secs(parse_env_u64(
                "PTY_BRIDGE_CALL_TIMEOUT",
                DEFAULT_CALL_TIMEOUT_SECS,
            ))),
            keepalive_timeout: keepalive_timeout_from_env(),
            error_limit: parse_env_usize("PTY_BRIDGE_ERROR_LIMIT", DEFAULT_ERROR_LIMIT),
            read_buffer_bytes: parse_env_usize("PTY_BRIDGE_READ_BUFFER", DEFAULT_READ_BUFFER_BYTES),
            max_sessions: parse_env_usize("PTY_BRIDGE_MAX_SESSIONS", DEFAULT_MAX_SESSIONS),
            max_frame_bytes: parse_env_usize("PTY_BRIDGE_MAX_FRAME", DEFAULT_MAX_FRAME_BYTES),
            command: command_from_env(),
            runtime_dir: runtime_dir_from_env(),
            close_on_disconnect: env_bool("PTY_BRIDGE_CLOSE_ON_DISCONNECT").unwrap_or(true),
            app_dir: app_dir_from_env(),
            editor: editor_from_env(),
        }
    }

    pub fn with_listen(mut self, listen: impl Into<String>) -> Self {
        self.listen = listen.into();
        self
    }

    pub fn with_allow_remote(mut self, allow: bool) -> Self {
        self.allow_remote = allow;
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = clamp_call_timeout(timeout);
        self
    }

    pub fn with_keepalive_timeout(mut self, timeout: Duration) -> Self {
        self.keepalive_timeout = timeout;
        self
    }

    pub fn with_error_limit(mut self, limit: usize) -> Self {
        self.error_limit = limit;
        self
    }

    pub fn with_read_buffer_bytes(mut self, bytes: usize) -> Self {
        self.read_buffer_bytes = bytes;
        self
    }

    pub fn with_max_sessions(mut self, max: usize) -> Self {
        self.max_sessions = max;
        self
    }

    pub fn with_max_frame_bytes(mut self, max: usize) -> Self {
        self.max_frame_bytes = max;
        self
    }

    pub fn with_command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command = command.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_runtime_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.runtime_dir = dir.into();
        self
    }

    pub fn with_close_on_disconnect(mut self, close: bool) -> Self {
        self.close_on_disconnect = close;
        self
    }

    pub fn with_app_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.app_dir = dir.into();
        self
    }

    pub fn with_editor<I, S>(mut self, editor: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.editor = editor.into_iter().map(Into::into).collect();
        self
    }
}

pub fn clamp_call_timeout(timeout: Duration) -> Duration {
    timeout.clamp(
        Duration::from_secs(MIN_CALL_TIMEOUT_SECS),
        Duration::from_secs(MAX_CALL_TIMEOUT_SECS),
    )
}

fn parse_env_u64(key: &str, default: u64) -> u64 {
    match env::var(key) {
        Ok(value) => match value.trim().parse::<u64>() {
            Ok(parsed) => parsed,
            Err(_) => {
                warn!(key = key, value = %value, default = default, "Invalid env value, using default");
                default
            }
        },
        Err(_) => default,
    }
}

/// Timeouts of a second or less would drop every stream on its first check.
fn keepalive_timeout_from_env() -> Duration {
    let secs = parse_env_u64("PTY_BRIDGE_KEEPALIVE_TIMEOUT", DEFAULT_KEEPALIVE_TIMEOUT_SECS);
    if secs <= MIN_KEEPALIVE_TIMEOUT_SECS {
        warn!(
            value = secs,
            default = DEFAULT_KEEPALIVE_TIMEOUT_SECS,
            "PTY_BRIDGE_KEEPALIVE_TIMEOUT too short, using default"
        );
        return Duration::from_secs(DEFAULT_KEEPALIVE_TIMEOUT_SECS);
    }
    Duration::from_secs(secs)
}

fn parse_env_usize(key: &str, default: usize) -> usize {
    match env::var(key) {
        Ok(value) => match value.trim().parse::<usize>() {
            Ok(parsed) if parsed > 0 => parsed,
            _ => {
                warn!(key = key, value = %value, default = default, "Invalid env value, using default");
                default
            }
        },
        Err(_) => default,
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn env_bool(key: &str) -> Option<bool> {
    let value = env::var(key).ok()?;
    let parsed = parse_bool(&value);
    if parsed.is_none() {
        warn!(key = key, value = %value, "Invalid boolean env value, ignoring");
    }
    parsed
}

fn env_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(non_empty)
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn command_from_env() -> Vec<String> {
    if let Some(raw) = env_string("PTY_BRIDGE_COMMAND") {
        match shell_words::split(&raw) {
            Ok(words) if !words.is_empty() => return words,
            Ok(_) => warn!("PTY_BRIDGE_COMMAND is empty, using login shell"),
            Err(err) => warn!(error = %err, "Invalid PTY_BRIDGE_COMMAND, using login shell"),
        }
    }
    default_command()
}

fn default_command() -> Vec<String> {
    let shell = env_string("SHELL").unwrap_or_else(|| FALLBACK_SHELL.to_string());
    vec![shell, "-li".to_string()]
}

fn editor_from_env() -> Vec<String> {
    for key in ["PTY_BRIDGE_EDITOR", "EDITOR"] {
        let Some(raw) = env_string(key) else {
            continue;
        };
        match shell_words::split(&raw) {
            Ok(words) if !words.is_empty() => return words,
            _ => warn!(key = key, value = %raw, "Invalid editor command, ignoring"),
        }
    }
    vec![FALLBACK_EDITOR.to_string()]
}

fn app_dir_from_env() -> PathBuf {
    if let Some(dir) = env_string("PTY_BRIDGE_APP_DIR") {
        return PathBuf::from(dir);
    }
    let config_home = env_string("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| env_string("HOME").map(|home| PathBuf::from(home).join(".config")))
        .unwrap_or_else(env::temp_dir);
    config_home.join("pty-bridge").join("apps")
}

fn runtime_dir_from_env() -> PathBuf {
    if let Some(dir) = env_string("PTY_BRIDGE_RUNTIME_DIR") {
        return PathBuf::from(dir);
    }
    if let Some(dir) = env_string("XDG_RUNTIME_DIR") {
        return PathBuf::from(dir).join("pty-bridge");
    }
    match env_string("HOME") {
        Some(home) => PathBuf::from(home).join(".cache").join("pty-bridge"),
        None => env::temp_dir().join("pty-bridge"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    struct EnvGuard {
        key: &'static str,
        prev: Option<String>,
    }

    impl EnvGuard {
        fn set(key: &'static str, value: &str) -> Self {
            let prev = env::var(key).ok();
            // SAFETY: test-only env mutation, serialized by ENV_LOCK.
            unsafe {
                env::set_var(key, value);
            }
            Self { key, prev }
        }

        fn remove(key: &'static str) -> Self {
            let prev = env::var(key).ok();
            // SAFETY: test-only env mutation, serialized by ENV_LOCK.
            unsafe {
                env::remove_var(key);
            }
            Self { key, prev }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            if let Some(prev) = self.prev.take() {
                // SAFETY: test-only env restoration.
                unsafe {
                    env::set_var(self.key, prev);
                }
            } else {
                // SAFETY: test-only env cleanup.
                unsafe {
                    env::remove_var(self.key);
                }
            }
        }
    }

    #[test]
    fn test_defaults() {
        let _lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let _guards = [
            EnvGuard::remove("PTY_BRIDGE_LISTEN"),
            EnvGuard::remove("PTY_BRIDGE_TOKEN"),
            EnvGuard::remove("PTY_BRIDGE_CALL_TIMEOUT"),
            EnvGuard::remove("PTY_BRIDGE_MAX_SESSIONS"),
            EnvGuard::remove("PTY_BRIDGE_CLOSE_ON_DISCONNECT"),
        ];
        let config = BridgeConfig::from_env();
        assert_eq!(config.listen, DEFAULT_LISTEN);
        assert!(config.token.is_none());
        assert!(!config.allow_remote);
        assert_eq!(config.call_timeout, Duration::from_secs(10));
        assert_eq!(config.keepalive_timeout, Duration::from_secs(20));
        assert_eq!(config.error_limit, DEFAULT_ERROR_LIMIT);
        assert_eq!(config.max_sessions, DEFAULT_MAX_SESSIONS);
        assert_eq!(config.max_frame_bytes, 64 * 1024 * 1024);
        assert!(config.close_on_disconnect);
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let _lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let _a = EnvGuard::set("PTY_BRIDGE_MAX_SESSIONS", "lots");
        let _b = EnvGuard::set("PTY_BRIDGE_ERROR_LIMIT", "0");
        let _c = EnvGuard::set("PTY_BRIDGE_CLOSE_ON_DISCONNECT", "maybe");
        let config = BridgeConfig::from_env();
        assert_eq!(config.max_sessions, DEFAULT_MAX_SESSIONS);
        assert_eq!(config.error_limit, DEFAULT_ERROR_LIMIT);
        assert!(config.close_on_disconnect);
    }

    #[test]
    fn test_call_timeout_is_clamped() {
        let _lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let _a = EnvGuard::set("PTY_BRIDGE_CALL_TIMEOUT", "600");
        assert_eq!(BridgeConfig::from_env().call_timeout, Duration::from_secs(60));
        let _b = EnvGuard::set("PTY_BRIDGE_CALL_TIMEOUT", "0");
        assert_eq!(BridgeConfig::from_env().call_timeout, Duration::from_secs(1));
    }

    #[test]
    fn test_short_keepalive_uses_default() {
        let _lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        for short in ["0", "1"] {
            let _a = EnvGuard::set("PTY_BRIDGE_KEEPALIVE_TIMEOUT", short);
            assert_eq!(
                BridgeConfig::from_env().keepalive_timeout,
                Duration::from_secs(DEFAULT_KEEPALIVE_TIMEOUT_SECS)
            );
        }
        let _b = EnvGuard::set("PTY_BRIDGE_KEEPALIVE_TIMEOUT", "5");
        assert_eq!(BridgeConfig::from_env().keepalive_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_command_parsing() {
        let _lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let _a = EnvGuard::set("PTY_BRIDGE_COMMAND", "tmux new -A -s 'main session'");
        assert_eq!(
            BridgeConfig::from_env().command,
            vec!["tmux", "new", "-A", "-s", "main session"]
        );

        let _b = EnvGuard::set("PTY_BRIDGE_COMMAND", "unterminated 'quote");
        let _shell = EnvGuard::set("SHELL", "/bin/zsh");
        assert_eq!(BridgeConfig::from_env().command, vec!["/bin/zsh", "-li"]);
    }

    #[test]
    fn test_runtime_dir_resolution() {
        let _lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let _a = EnvGuard::remove("PTY_BRIDGE_RUNTIME_DIR");
        let _b = EnvGuard::set("XDG_RUNTIME_DIR", "/run/user/1000");
        assert_eq!(
            BridgeConfig::from_env().runtime_dir,
            PathBuf::from("/run/user/1000/pty-bridge")
        );
        let _c = EnvGuard::set("PTY_BRIDGE_RUNTIME_DIR", "/tmp/custom");
        assert_eq!(BridgeConfig::from_env().runtime_dir, PathBuf::from("/tmp/custom"));
    }

    #[test]
    fn test_editor_resolution() {
        let _lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let _a = EnvGuard::remove("PTY_BRIDGE_EDITOR");
        let _b = EnvGuard::remove("EDITOR");
        assert_eq!(BridgeConfig::from_env().editor, vec!["vi"]);

        let _c = EnvGuard::set("EDITOR", "nano");
        assert_eq!(BridgeConfig::from_env().editor, vec!["nano"]);

        let _d = EnvGuard::set("PTY_BRIDGE_EDITOR", "code --wait");
        assert_eq!(BridgeConfig::from_env().editor, vec!["code", "--wait"]);
    }

    #[test]
    fn test_app_dir_resolution() {
        let _lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let _a = EnvGuard::remove("PTY_BRIDGE_APP_DIR");
        let _b = EnvGuard::set("XDG_CONFIG_HOME", "/home/me/.config");
        assert_eq!(
            BridgeConfig::from_env().app_dir,
            PathBuf::from("/home/me/.config/pty-bridge/apps")
        );
        let _c = EnvGuard::set("PTY_BRIDGE_APP_DIR", "/opt/apps");
        assert_eq!(BridgeConfig::from_env().app_dir, PathBuf::from("/opt/apps"));
    }

    #[test]
    fn test_builder_pattern() {
        let _lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let config = BridgeConfig::from_env()
            .with_listen("127.0.0.1:9000")
            .with_token("secret")
            .with_call_timeout(Duration::from_millis(10))
            .with_keepalive_timeout(Duration::from_millis(300))
            .with_max_sessions(2)
            .with_command(["sh"])
            .with_close_on_disconnect(false);
        assert_eq!(config.listen, "127.0.0.1:9000");
        assert_eq!(config.token.as_deref(), Some("secret"));
        assert_eq!(config.call_timeout, Duration::from_secs(1));
        assert_eq!(config.keepalive_timeout, Duration::from_millis(300));
        assert_eq!(config.max_sessions, 2);
        assert_eq!(config.command, vec!["sh"]);
        assert!(!config.close_on_disconnect);
    }
}

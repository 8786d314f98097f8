use std::path::PathBuf;
use std::time::Duration;

/// Default per-operation timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Idle exit period applied when enabled without an explicit value.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Structure to configure the daemon and its browser session.
#[derive(Debug, Clone)]
pub struct Configuration {
    /// Run the browser headless. Defaults to true.
    pub headless: bool,
    /// Path of the browser supervisor binary; auto detected when unset.
    pub executable: Option<PathBuf>,
    /// Remote BiDi endpoint; when set the session never launches a local
    /// browser and never terminates the remote one.
    pub connect_url: Option<String>,
    /// Sent as `Authorization: Bearer …` to the remote endpoint.
    pub api_key: Option<String>,
    /// Directory screenshots and traces are written into.
    pub screenshot_dir: Option<PathBuf>,
    /// Default viewport applied to new pages.
    pub viewport: Option<(u32, u32)>,
    /// Default per-operation timeout.
    pub default_timeout: Duration,
    /// Exit the daemon after this much inactivity; disabled when `None`.
    pub idle_timeout: Option<Duration>,
    /// Run the command engine in-process instead of against the daemon.
    pub oneshot: bool,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            headless: true,
            executable: None,
            connect_url: None,
            api_key: None,
            screenshot_dir: None,
            viewport: None,
            default_timeout: DEFAULT_TIMEOUT,
            idle_timeout: None,
            oneshot: false,
        }
    }
}

impl Configuration {
    /// Build a configuration from the process environment.
    ///
    /// Recognized variables: `VIBIUM_CONNECT_URL`, `VIBIUM_CONNECT_API_KEY`,
    /// `VIBIUM_ONESHOT`, `VIBIUM_SCREENSHOT_DIR`, `VIBIUM_IDLE_TIMEOUT`
    /// (seconds, or `1` for the default period).
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("VIBIUM_CONNECT_URL") {
            if !url.is_empty() {
                config.connect_url = Some(url);
            }
        }
        if let Ok(key) = std::env::var("VIBIUM_CONNECT_API_KEY") {
            if !key.is_empty() {
                config.api_key = Some(key);
            }
        }
        if let Ok(v) = std::env::var("VIBIUM_ONESHOT") {
            config.oneshot = v == "1" || v.eq_ignore_ascii_case("true");
        }
        if let Ok(dir) = std::env::var("VIBIUM_SCREENSHOT_DIR") {
            if !dir.is_empty() {
                config.screenshot_dir = Some(PathBuf::from(dir));
            }
        }
        if let Ok(v) = std::env::var("VIBIUM_IDLE_TIMEOUT") {
            config.idle_timeout = parse_idle_timeout(&v);
        }

        config
    }

    pub fn with_headless(mut self, headless: bool) -> Self {
        self.headless = headless;
        self
    }

    pub fn with_executable(mut self, path: impl Into<PathBuf>) -> Self {
        self.executable = Some(path.into());
        self
    }

    pub fn with_connect_url(mut self, url: Option<String>) -> Self {
        self.connect_url = url;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_oneshot(mut self, oneshot: bool) -> Self {
        self.oneshot = oneshot;
        self
    }

    /// Whether the session attaches to a remote endpoint rather than
    /// launching its own browser.
    pub fn is_remote(&self) -> bool {
        self.connect_url.is_some()
    }
}

fn parse_idle_timeout(raw: &str) -> Option<Duration> {
    match raw.trim() {
        "" | "0" | "off" | "false" => None,
        "1" | "on" | "true" => Some(DEFAULT_IDLE_TIMEOUT),
        v => v.parse::<u64>().ok().map(Duration::from_secs),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_timeout_parsing() {
        assert_eq!(parse_idle_timeout("0"), None);
        assert_eq!(parse_idle_timeout("off"), None);
        assert_eq!(parse_idle_timeout("1"), Some(DEFAULT_IDLE_TIMEOUT));
        assert_eq!(parse_idle_timeout("90"), Some(Duration::from_secs(90)));
        assert_eq!(parse_idle_timeout("garbage"), None);
    }
}

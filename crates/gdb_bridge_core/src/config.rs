use std::time::Duration;

pub const DEFAULT_PROMPTS: &[&str] = &["(gdb)", "pwndbg>", "gef>", "gef➤"];

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub poll_interval: Duration,
    /// Delay after writing a marker echo before the buffer is captured again.
    pub settle_delay: Duration,
    pub interrupt_settle: Duration,
    pub poll_attempts: u32,
    pub blocking_poll_attempts: u32,
    pub call_timeout: Duration,
    pub timeout_retries: u32,
    pub command_budget: Duration,
    pub prompt_patterns: Vec<String>,
    pub gdb_binary: String,
    pub tmux_binary: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1000),
            settle_delay: Duration::from_millis(200),
            interrupt_settle: Duration::from_millis(500),
            poll_attempts: 1,
            blocking_poll_attempts: 3,
            call_timeout: Duration::from_millis(3000),
            timeout_retries: 1,
            command_budget: Duration::from_secs(15),
            prompt_patterns: DEFAULT_PROMPTS.iter().map(|p| p.to_string()).collect(),
            gdb_binary: "gdb".to_string(),
            tmux_binary: "tmux".to_string(),
        }
    }
}

impl BridgeConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let prompt_patterns = std::env::var("GDB_BRIDGE_PROMPTS")
            .ok()
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(String::from)
                    .collect::<Vec<_>>()
            })
            .filter(|patterns| !patterns.is_empty())
            .unwrap_or(defaults.prompt_patterns);

        Self {
            poll_interval: env_millis("GDB_BRIDGE_POLL_INTERVAL_MS").unwrap_or(defaults.poll_interval),
            settle_delay: env_millis("GDB_BRIDGE_SETTLE_MS").unwrap_or(defaults.settle_delay),
            interrupt_settle: env_millis("GDB_BRIDGE_INTERRUPT_SETTLE_MS")
                .unwrap_or(defaults.interrupt_settle),
            poll_attempts: env_u32("GDB_BRIDGE_POLL_ATTEMPTS")
                .filter(|n| *n > 0)
                .unwrap_or(defaults.poll_attempts),
            blocking_poll_attempts: env_u32("GDB_BRIDGE_BLOCKING_POLL_ATTEMPTS")
                .filter(|n| *n > 0)
                .unwrap_or(defaults.blocking_poll_attempts),
            call_timeout: env_millis("GDB_BRIDGE_CALL_TIMEOUT_MS").unwrap_or(defaults.call_timeout),
            timeout_retries: env_u32("GDB_BRIDGE_TIMEOUT_RETRIES").unwrap_or(defaults.timeout_retries),
            command_budget: env_millis("GDB_BRIDGE_COMMAND_BUDGET_MS")
                .unwrap_or(defaults.command_budget),
            prompt_patterns,
            gdb_binary: std::env::var("GDB_BRIDGE_GDB").unwrap_or(defaults.gdb_binary),
            tmux_binary: std::env::var("GDB_BRIDGE_TMUX").unwrap_or(defaults.tmux_binary),
        }
    }

    pub fn attempts_for(&self, may_block: bool) -> u32 {
        if may_block {
            self.blocking_poll_attempts
        } else {
            self.poll_attempts
        }
    }
}

fn env_millis(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
}

fn env_u32(key: &str) -> Option<u32> {
    std::env::var(key).ok().and_then(|v| v.parse::<u32>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BridgeConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.poll_attempts, 1);
        assert_eq!(config.blocking_poll_attempts, 3);
        assert_eq!(config.prompt_patterns, vec!["(gdb)", "pwndbg>", "gef>", "gef➤"]);
        assert_eq!(config.gdb_binary, "gdb");
    }

    #[test]
    fn test_attempts_for() {
        let config = BridgeConfig::default();
        assert_eq!(config.attempts_for(false), 1);
        assert_eq!(config.attempts_for(true), 3);
    }

    // Env-driven cases share one test so they never race each other on the
    // process-wide environment.
    #[test]
    fn test_from_env_defaults_and_overrides() {
        std::env::remove_var("GDB_BRIDGE_POLL_INTERVAL_MS");
        std::env::remove_var("GDB_BRIDGE_PROMPTS");
        std::env::remove_var("GDB_BRIDGE_BLOCKING_POLL_ATTEMPTS");

        let config = BridgeConfig::from_env();
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.prompt_patterns.len(), DEFAULT_PROMPTS.len());

        std::env::set_var("GDB_BRIDGE_POLL_INTERVAL_MS", "250");
        std::env::set_var("GDB_BRIDGE_PROMPTS", "(gdb), (lldb) ,,");
        std::env::set_var("GDB_BRIDGE_BLOCKING_POLL_ATTEMPTS", "0");

        let config = BridgeConfig::from_env();
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.prompt_patterns, vec!["(gdb)", "(lldb)"]);
        assert_eq!(config.blocking_poll_attempts, 3);

        std::env::remove_var("GDB_BRIDGE_POLL_INTERVAL_MS");
        std::env::remove_var("GDB_BRIDGE_PROMPTS");
        std::env::remove_var("GDB_BRIDGE_BLOCKING_POLL_ATTEMPTS");
    }
}

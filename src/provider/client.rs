//! Provider client configuration

/// Configuration for the command-backed provider client
#[derive(Debug, Clone)]
pub struct ProviderClientConfig {
    /// Executable to invoke
    ///
    /// The resolved prompt is passed as the final argument.
    pub command: String,

    /// Extra arguments placed before the prompt
    pub args: Vec<String>,

    /// Timeout for requests in seconds
    pub timeout_secs: u64,
}

impl Default for ProviderClientConfig {
    fn default() -> Self {
        Self {
            command: "llm".to_string(),
            args: Vec::new(),
            timeout_secs: 300,
        }
    }
}

impl ProviderClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = command.into();
        self
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    /// Parse a shell-like command line (`"llm -m fast"`) into command and args
    pub fn from_command_line(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace().map(str::to_string);
        let command = parts.next()?;
        Some(Self::new().with_command(command).with_args(parts.collect()))
    }
}

//! CLI command definitions

use crate::core::config::EngineConfig;
use clap::Args;
use serde_json::Value;

/// Run a pipeline
#[derive(Debug, Args, Clone)]
pub struct RunCommand {
    /// Path to pipeline YAML file
    #[arg(short, long)]
    pub file: String,

    /// Variable overrides (key=value, values parsed as JSON when possible)
    #[arg(long, value_parser = parse_key_value)]
    pub var: Vec<(String, String)>,

    /// Provider command line; the prompt is appended as the last argument
    #[arg(long, env = "PIPEWRIGHT_PROVIDER_CMD")]
    pub provider_cmd: Option<String>,

    /// Fail on unresolved template references
    #[arg(long)]
    pub strict_templates: bool,

    /// Maximum nesting depth
    #[arg(long)]
    pub max_depth: Option<usize>,

    /// Maximum number of steps across the whole run
    #[arg(long)]
    pub max_steps: Option<usize>,

    /// Don't persist checkpoints or saved outputs
    #[arg(long)]
    pub no_checkpoints: bool,

    /// Checkpoint database path (defaults to the user data directory)
    #[arg(long)]
    pub db: Option<String>,
}

impl RunCommand {
    /// Apply command-line overrides on top of an engine config
    pub fn apply_overrides(&self, mut config: EngineConfig) -> EngineConfig {
        if let Some(depth) = self.max_depth {
            config = config.with_max_nesting_depth(depth);
        }
        if let Some(steps) = self.max_steps {
            config = config.with_max_total_steps(steps);
        }
        if self.strict_templates {
            config = config.with_strict_templates(true);
        }
        config
    }

    /// Variable overrides as typed values
    pub fn variables(&self) -> Vec<(String, Value)> {
        self.var
            .iter()
            .map(|(key, raw)| (key.clone(), parse_value(raw)))
            .collect()
    }
}

/// Validate a pipeline configuration
#[derive(Debug, Args, Clone)]
pub struct ValidateCommand {
    /// Path to pipeline YAML file
    #[arg(short, long)]
    pub file: String,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Parse key=value pairs
pub fn parse_key_value(s: &str) -> Result<(String, String), String> {
    let parts: Vec<&str> = s.splitn(2, '=').collect();
    if parts.len() != 2 || parts[0].is_empty() {
        return Err(format!("Invalid key=value pair: {}", s));
    }
    Ok((parts[0].to_string(), parts[1].to_string()))
}

/// JSON scalars and documents keep their type; anything else is a string
pub fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

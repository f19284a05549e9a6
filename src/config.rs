use clap::{Args, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;

/// What to do with a request that arrives while `max_concurrent` CLI
/// processes are already running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum AdmissionPolicy {
    /// Fail fast with 429.
    Reject,
    /// Wait for a running invocation to finish.
    #[default]
    Queue,
}

/// Runtime configuration for the bridge.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// CLI executable, either a bare name looked up on `PATH` or a path.
    pub cli_path: String,
    /// Hard deadline for one invocation.
    pub timeout: Duration,
    /// Pass `--dangerously-skip-permissions` for unattended deployments.
    pub skip_permissions: bool,
    /// Ask the CLI for token-level `stream_event`s.
    pub partial_messages: bool,
    /// Working directory for the CLI process.
    pub working_dir: Option<PathBuf>,
    pub max_concurrent: usize,
    pub admission: AdmissionPolicy,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            cli_path: "claude".to_string(),
            timeout: Duration::from_secs(300),
            skip_permissions: false,
            partial_messages: false,
            working_dir: None,
            max_concurrent: 8,
            admission: AdmissionPolicy::Queue,
        }
    }
}

/// Command-line / environment form of [`BridgeConfig`].
#[derive(Debug, Clone, Args)]
pub struct BridgeArgs {
    /// Path or name of the claude CLI binary
    #[arg(long, env = "CLAUDE_BRIDGE_CLI_PATH", default_value = "claude")]
    pub cli_path: String,

    /// Maximum seconds a single CLI invocation may run
    #[arg(long, env = "CLAUDE_BRIDGE_TIMEOUT_SECS", default_value_t = 300)]
    pub timeout_secs: u64,

    /// Run the CLI with --dangerously-skip-permissions
    #[arg(long, env = "CLAUDE_BRIDGE_SKIP_PERMISSIONS")]
    pub skip_permissions: bool,

    /// Stream token-level deltas (--include-partial-messages)
    #[arg(long, env = "CLAUDE_BRIDGE_PARTIAL_MESSAGES")]
    pub partial_messages: bool,

    /// Working directory for CLI processes
    #[arg(long, env = "CLAUDE_BRIDGE_WORKING_DIR")]
    pub working_dir: Option<PathBuf>,

    /// Maximum number of concurrently running CLI processes
    #[arg(long, env = "CLAUDE_BRIDGE_MAX_CONCURRENT", default_value_t = 8)]
    pub max_concurrent: usize,

    /// Behaviour once max-concurrent is reached
    #[arg(long, env = "CLAUDE_BRIDGE_ADMISSION", value_enum, default_value = "queue")]
    pub admission: AdmissionPolicy,
}

impl From<BridgeArgs> for BridgeConfig {
    fn from(args: BridgeArgs) -> Self {
        Self {
            cli_path: args.cli_path,
            timeout: Duration::from_secs(args.timeout_secs),
            skip_permissions: args.skip_permissions,
            partial_messages: args.partial_messages,
            working_dir: args.working_dir,
            // A zero limit would deadlock every request.
            max_concurrent: args.max_concurrent.max(1),
            admission: args.admission,
        }
    }
}

//! A fake `claude` executable for driving the bridge end to end.
//!
//! One shell script is written per test binary. It records its arguments and
//! stdin into its working directory and then sources `scenario.sh` from that
//! directory, so every test picks its own behaviour without writing (and
//! racing to execute) a fresh executable. Outside a scenario directory it
//! behaves like `claude --version`.
#![allow(dead_code)]

use claude_bridge::{BridgeConfig, CliBinary};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

const FAKE_CLI: &str = r#"#!/bin/sh
if [ ! -f ./scenario.sh ]; then
    echo "fake-claude 0.0.0"
    exit 0
fi
for a in "$@"; do printf '%s\n' "$a"; done > args.txt
cat > prompt.txt
. ./scenario.sh
"#;

pub const SUCCESS: &str = r#"
printf '%s\n' '{"type":"system","subtype":"init","session_id":"s-1"}'
printf '%s\n' 'this line is not json'
printf '%s\n' '{"type":"assistant","message":{"content":[{"type":"text","text":"Hello"}]}}'
printf '%s\n' '{"type":"assistant","message":{"content":[{"type":"text","text":"world"}]}}'
printf '%s\n' '{"type":"result","subtype":"success","is_error":false,"result":"Hello\nworld","usage":{"input_tokens":12,"output_tokens":5}}'
"#;

pub const FAILS_MIDWAY: &str = r#"
printf '%s\n' '{"type":"assistant","message":{"content":[{"type":"text","text":"partial"}]}}'
echo "fatal: model overloaded" >&2
exit 3
"#;

pub const ERROR_RESULT: &str = r#"
printf '%s\n' '{"type":"result","subtype":"error_during_execution","is_error":true,"result":"No conversation found with session ID: nope"}'
"#;

pub const HANGS: &str = r#"
printf '%s\n' '{"type":"assistant","message":{"content":[{"type":"text","text":"thinking"}]}}'
exec sleep 30
"#;

pub const GARBLED_STDOUT: &str = r#"
printf '\377\376 garbage\n'
printf '%s\n' '{"type":"assistant","message":{"content":[{"type":"text","text":"after"}]}}'
printf '%s\n' '{"type":"result","subtype":"success","is_error":false,"result":"after","usage":{"input_tokens":3,"output_tokens":1}}'
"#;

pub const NOISY_STDERR: &str = r#"
printf '\377\376 warn\n' >&2
i=0
while [ $i -lt 2000 ]; do
    echo "warning line $i" >&2
    i=$((i + 1))
done
printf '%s\n' '{"type":"assistant","message":{"content":[{"type":"text","text":"fine"}]}}'
printf '%s\n' '{"type":"result","subtype":"success","is_error":false,"result":"fine","usage":{"input_tokens":2,"output_tokens":1}}'
"#;

pub const SILENT_EXIT: &str = r#"
exit 0
"#;

// More deltas than the event channel holds, then no exit.
pub const FLOODS_THEN_HANGS: &str = r#"
i=0
while [ $i -lt 300 ]; do
    printf '%s\n' '{"type":"assistant","message":{"content":[{"type":"text","text":"chunk"}]}}'
    i=$((i + 1))
done
exec sleep 30
"#;

fn fake_cli_path() -> &'static Path {
    static PATH: OnceLock<PathBuf> = OnceLock::new();
    PATH.get_or_init(|| {
        let dir = std::env::temp_dir().join(format!("claude-bridge-fake-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("claude");
        fs::write(&path, FAKE_CLI).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    })
}

/// A private working directory running `scenario` under the fake CLI.
pub struct FakeCli {
    pub dir: PathBuf,
}

impl FakeCli {
    pub fn new(scenario: &str) -> Self {
        let dir = std::env::temp_dir().join(format!("claude-bridge-test-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("scenario.sh"), scenario).unwrap();
        Self { dir }
    }

    pub fn binary(&self) -> CliBinary {
        CliBinary::resolve(fake_cli_path().to_str().unwrap()).unwrap()
    }

    pub fn config(&self) -> BridgeConfig {
        BridgeConfig {
            cli_path: fake_cli_path().to_string_lossy().into_owned(),
            working_dir: Some(self.dir.clone()),
            timeout: Duration::from_secs(20),
            ..BridgeConfig::default()
        }
    }

    pub fn args(&self) -> Vec<String> {
        fs::read_to_string(self.dir.join("args.txt"))
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    pub fn prompt(&self) -> String {
        fs::read_to_string(self.dir.join("prompt.txt")).unwrap()
    }
}

impl Drop for FakeCli {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.dir);
    }
}

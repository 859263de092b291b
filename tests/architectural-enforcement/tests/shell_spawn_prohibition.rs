//! Integration Test: Shell Spawn Prohibition
//!
//! **Policy**: Engine code runs as root and receives arguments from an
//! unprivileged peer. It MUST NOT hand anything to a shell.
//! **Required**: Spawn programs directly with an argument vector
//! (`tokio::process::Command::new(program).args(..)`).

use architectural_enforcement::{fail_on, production_lines, workspace_root, PRODUCTION_DIRS};

const SHELLS: &[&str] = &["\"sh\"", "\"bash\"", "\"/bin/sh\"", "\"/bin/bash\"", "\"zsh\"", "\"dash\""];

fn shell_spawn(code: &str) -> Option<&'static str> {
    if code.contains("Command::new(") && SHELLS.iter().any(|s| code.contains(s)) {
        return Some("Shell spawned");
    }
    if code.contains(".arg(\"-c\")") || code.contains("\"-c\",") {
        return Some("Shell command string");
    }
    if code.contains("libc::system(") || code.contains("popen(") {
        return Some("libc shell call");
    }
    None
}

#[test]
fn test_no_shell_spawns_in_production_code() {
    let root = workspace_root();
    let mut violations = Vec::new();

    for dir in PRODUCTION_DIRS {
        for (path, line, code) in production_lines(&root.join(dir)) {
            if let Some(kind) = shell_spawn(&code) {
                violations.push(format!("{}:{line} - {kind}: {}", path.display(), code.trim()));
            }
        }
    }

    fail_on(&violations, "engine code must never spawn a shell");
}

#[test]
fn test_production_dirs_exist() {
    let root = workspace_root();
    for dir in PRODUCTION_DIRS {
        assert!(root.join(dir).is_dir(), "{dir} missing: scans would pass vacuously");
    }
}

#[test]
fn test_shell_spawn_detection() {
    assert!(shell_spawn(r#"let c = Command::new("sh").arg("-c").arg(cmd);"#).is_some());
    assert!(shell_spawn(r#"ProcessCommand::new("/bin/bash")"#).is_some());
    assert!(shell_spawn(r#"ProcessCommand::new(&self.config.engine_binary)"#).is_none());
    assert!(shell_spawn(r#"command.args(&engine_args)"#).is_none());
}

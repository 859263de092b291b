//! Architectural Enforcement Integration Tests
//!
//! This package contains integration tests that enforce architectural principles
//! of the engine workspace:
//! - Engine code never spawns a shell
//! - Command handlers are registered on a dispatcher instance, never in a global table
//! - Engine library code propagates errors instead of panicking
//!
//! These tests are designed to catch violations early in the development cycle.

use std::path::{Path, PathBuf};

/// Production source directories, relative to the workspace root
pub const PRODUCTION_DIRS: &[&str] = &["engine/core/src", "engine/daemon/src", "ctl/src"];

/// Workspace root (two levels above this package)
#[must_use]
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("..")
        .join("..")
}

/// Production lines of every `.rs` file under `dir`
///
/// Everything from the first `#[cfg(test)]` on is test code and skipped;
/// line comments are stripped. Yields `(path, line_number, code)`.
#[must_use]
pub fn production_lines(dir: &Path) -> Vec<(PathBuf, usize, String)> {
    let mut lines = Vec::new();
    if !dir.exists() {
        return lines;
    }

    for entry in walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
    {
        let path = entry.path();
        if path.extension().and_then(|s| s.to_str()) != Some("rs") {
            continue;
        }
        let Ok(content) = std::fs::read_to_string(path) else {
            continue;
        };

        for (idx, line) in content.lines().enumerate() {
            if line.trim_start().starts_with("#[cfg(test)]") {
                break;
            }
            let code = line.split("//").next().unwrap_or(line);
            if !code.trim().is_empty() {
                lines.push((path.to_path_buf(), idx + 1, code.to_string()));
            }
        }
    }
    lines
}

/// Report violations and fail
pub fn fail_on(violations: &[String], rule: &str) {
    if violations.is_empty() {
        return;
    }
    eprintln!("\n❌ {rule}\n");
    for violation in violations {
        eprintln!("  ❌ {violation}");
    }
    panic!(
        "\nFound {} violation(s) of: {rule}\nFix these before merging!",
        violations.len()
    );
}

//! Security Module
//!
//! Validation of requests crossing the trust boundary from the unprivileged
//! surface into the privileged engine. Every request passes through
//! [`validate_request`] before any handler sees it.
//!
//! # Layers
//!
//! 1. Command whitelist (`PERMISSION_DENIED`)
//! 2. Content limits: string length and nesting depth (`VALIDATION_FAILED`)
//! 3. Shell metacharacters (`VALIDATION_FAILED`)
//! 4. Path arguments must stay under an allowed root (`VALIDATION_FAILED`)
//!
//! # Design Philosophy
//!
//! Validation is a denial gate, not a sanitizer: input is accepted as-is or
//! rejected with a reason, never rewritten. Handlers must still never pass
//! untrusted strings to a shell.
//!
//! Every function here is pure. Validators hold no state and can be called
//! from any number of connection tasks at once.

use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::protocol::{Command, ErrorCode, Message, MessageType, Payload};

/// Maximum length of any string argument, in characters
pub const MAX_STRING_LENGTH: usize = 4096;

/// Maximum nesting of mappings/sequences (the args map is level 1)
pub const MAX_NESTING_DEPTH: usize = 10;

/// Characters that can break out of a single shell token
pub const SHELL_METACHARACTERS: &[char] = &[';', '|', '`', '$', '&', '\n'];

/// Installation target mount point
pub const DEFAULT_TARGET_ROOT: &str = "/mnt";

/// Temporary files root
pub const DEFAULT_TEMP_ROOT: &str = "/tmp";

/// Runtime state root
pub const DEFAULT_RUNTIME_ROOT: &str = "/run/installer-engine";

/// Security settings
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Roots that path arguments must resolve under
    pub allowed_roots: Vec<PathBuf>,
    /// Maximum string argument length in characters (default: 4096)
    pub max_string_length: usize,
    /// Maximum nesting depth of arguments (default: 10)
    pub max_nesting_depth: usize,
    /// Rejections tolerated per connection before it is dropped (default: 5, 0 = never)
    pub max_violations: u32,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            allowed_roots: vec![
                PathBuf::from(DEFAULT_TARGET_ROOT),
                PathBuf::from(DEFAULT_TEMP_ROOT),
                PathBuf::from(DEFAULT_RUNTIME_ROOT),
            ],
            max_string_length: MAX_STRING_LENGTH,
            max_nesting_depth: MAX_NESTING_DEPTH,
            max_violations: 5,
        }
    }
}

impl SecurityConfig {
    /// Apply environment overrides
    ///
    /// - `ENGINE_ALLOWED_ROOTS`: colon-separated list of roots
    /// - `ENGINE_MAX_STRING_LENGTH`
    /// - `ENGINE_MAX_NESTING_DEPTH`
    /// - `ENGINE_MAX_VIOLATIONS`
    #[must_use]
    pub fn with_env(mut self) -> Self {
        if let Ok(roots) = std::env::var("ENGINE_ALLOWED_ROOTS") {
            let roots: Vec<PathBuf> = std::env::split_paths(&roots)
                .filter(|p| !p.as_os_str().is_empty())
                .collect();
            if !roots.is_empty() {
                self.allowed_roots = roots;
            }
        }
        if let Some(v) = env_parse("ENGINE_MAX_STRING_LENGTH") {
            self.max_string_length = v;
        }
        if let Some(v) = env_parse("ENGINE_MAX_NESTING_DEPTH") {
            self.max_nesting_depth = v;
        }
        if let Some(v) = env_parse("ENGINE_MAX_VIOLATIONS") {
            self.max_violations = v;
        }
        self
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

/// Reason a request was denied
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SecurityError {
    /// Command is not in the whitelist
    #[error("command {0:?} is not allowed")]
    CommandNotAllowed(String),

    /// Only requests may be sent to the engine
    #[error("expected a request, got {0:?}")]
    NotARequest(MessageType),

    /// Path contains a `..` segment
    #[error("argument `{arg}` contains a parent-directory segment")]
    PathTraversal {
        /// Argument name
        arg: String,
    },

    /// Path is not absolute
    #[error("argument `{arg}` must be an absolute path")]
    RelativePath {
        /// Argument name
        arg: String,
    },

    /// Path resolves outside every allowed root
    #[error("argument `{arg}` resolves outside the allowed roots: {path}")]
    PathOutsideRoots {
        /// Argument name
        arg: String,
        /// Normalized path
        path: String,
    },

    /// Path does not exist or cannot be resolved on disk
    #[error("argument `{arg}` does not name an existing file")]
    PathUnresolvable {
        /// Argument name
        arg: String,
    },

    /// Path argument is not a string (or list of strings)
    #[error("argument `{arg}` must be a path string")]
    InvalidPathValue {
        /// Argument name
        arg: String,
    },

    /// String argument exceeds the length limit
    #[error("argument `{arg}` is too long: {len} characters (max: {max})")]
    StringTooLong {
        /// Argument name
        arg: String,
        /// Actual length
        len: usize,
        /// Allowed length
        max: usize,
    },

    /// Arguments nest too deeply
    #[error("arguments nested deeper than {max} levels")]
    NestingTooDeep {
        /// Allowed depth
        max: usize,
    },

    /// String argument contains a shell metacharacter
    #[error("argument `{arg}` contains shell metacharacter {ch:?}")]
    ShellMetacharacter {
        /// Argument name
        arg: String,
        /// Offending character
        ch: char,
    },
}

impl SecurityError {
    /// Protocol error code for this rejection
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::CommandNotAllowed(_) => ErrorCode::PermissionDenied,
            Self::NotARequest(_) => ErrorCode::InvalidRequest,
            _ => ErrorCode::ValidationFailed,
        }
    }
}

/// Validate a decoded message before dispatch
///
/// Returns the parsed command when the request may proceed.
///
/// # Errors
///
/// Returns the first `SecurityError` found.
pub fn validate_request(message: &Message, config: &SecurityConfig) -> Result<Command, SecurityError> {
    let (Some(name), Some(args)) = (message.command_name(), message.args()) else {
        return Err(SecurityError::NotARequest(message.kind()));
    };

    let command = validate_command_name(name)?;
    validate_args(args, config)?;
    Ok(command)
}

/// Check a command identifier against the whitelist
///
/// # Errors
///
/// Returns `CommandNotAllowed` for anything outside the closed set.
pub fn validate_command_name(name: &str) -> Result<Command, SecurityError> {
    name.parse::<Command>()
        .map_err(|_| SecurityError::CommandNotAllowed(name.to_string()))
}

/// Validate an argument map: limits, metacharacters, and path rules
///
/// # Errors
///
/// Returns the first violation found.
pub fn validate_args(args: &Payload, config: &SecurityConfig) -> Result<(), SecurityError> {
    walk_map(args, "", 1, config)
}

fn walk_map(map: &Payload, prefix: &str, depth: usize, config: &SecurityConfig) -> Result<(), SecurityError> {
    if depth > config.max_nesting_depth {
        return Err(SecurityError::NestingTooDeep {
            max: config.max_nesting_depth,
        });
    }

    for (key, value) in map {
        let label = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };

        validate_string(&label, key, config)?;
        walk_value(value, &label, depth, config)?;

        if is_path_key(key) {
            validate_path_value(&label, value, &config.allowed_roots)?;
        }
    }
    Ok(())
}

fn walk_value(value: &Value, label: &str, depth: usize, config: &SecurityConfig) -> Result<(), SecurityError> {
    match value {
        Value::String(s) => validate_string(label, s, config),
        Value::Object(map) => walk_map(map, label, depth + 1, config),
        Value::Array(items) => {
            if depth + 1 > config.max_nesting_depth {
                return Err(SecurityError::NestingTooDeep {
                    max: config.max_nesting_depth,
                });
            }
            for (i, item) in items.iter().enumerate() {
                walk_value(item, &format!("{label}[{i}]"), depth + 1, config)?;
            }
            Ok(())
        }
        Value::Null | Value::Bool(_) | Value::Number(_) => Ok(()),
    }
}

/// Length and metacharacter checks for one string
fn validate_string(label: &str, s: &str, config: &SecurityConfig) -> Result<(), SecurityError> {
    let len = s.chars().count();
    if len > config.max_string_length {
        return Err(SecurityError::StringTooLong {
            arg: label.to_string(),
            len,
            max: config.max_string_length,
        });
    }

    if let Some(ch) = find_shell_metacharacter(s) {
        return Err(SecurityError::ShellMetacharacter {
            arg: label.to_string(),
            ch,
        });
    }

    Ok(())
}

/// First shell metacharacter in `s`, if any
#[must_use]
pub fn find_shell_metacharacter(s: &str) -> Option<char> {
    s.chars().find(|c| SHELL_METACHARACTERS.contains(c))
}

/// Whether an argument key names a filesystem path
#[must_use]
pub fn is_path_key(key: &str) -> bool {
    matches!(key, "path" | "paths" | "mount_point")
        || key.ends_with("_path")
        || key.ends_with("_dir")
        || key.ends_with("_file")
}

fn validate_path_value(label: &str, value: &Value, roots: &[PathBuf]) -> Result<(), SecurityError> {
    match value {
        Value::String(s) => validate_path(label, s, roots).map(|_| ()),
        Value::Array(items) => items.iter().enumerate().try_for_each(|(i, item)| match item {
            Value::String(s) => validate_path(&format!("{label}[{i}]"), s, roots).map(|_| ()),
            _ => Err(SecurityError::InvalidPathValue {
                arg: format!("{label}[{i}]"),
            }),
        }),
        _ => Err(SecurityError::InvalidPathValue {
            arg: label.to_string(),
        }),
    }
}

/// Lexically normalize an absolute path (drops `.` segments)
fn normalize(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect()
}

/// Validate one path argument against the allowed roots
///
/// Returns the normalized path on success.
///
/// # Errors
///
/// - `PathTraversal` if any segment is `..`
/// - `RelativePath` if the path is not absolute
/// - `PathOutsideRoots` if no allowed root contains it
pub fn validate_path(arg: &str, raw: &str, roots: &[PathBuf]) -> Result<PathBuf, SecurityError> {
    let path = Path::new(raw);

    if path.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(SecurityError::PathTraversal {
            arg: arg.to_string(),
        });
    }

    if !path.is_absolute() {
        return Err(SecurityError::RelativePath {
            arg: arg.to_string(),
        });
    }

    let normalized = normalize(path);
    if roots
        .iter()
        .any(|root| normalized.starts_with(normalize(root)))
    {
        Ok(normalized)
    } else {
        Err(SecurityError::PathOutsideRoots {
            arg: arg.to_string(),
            path: normalized.display().to_string(),
        })
    }
}

/// Validate a path argument and resolve it on disk, following symlinks
///
/// Use this before opening a file named by a request: the lexical check in
/// [`validate_path`] cannot see a symlink under an allowed root that points
/// elsewhere. The resolved path is checked again against the resolved
/// roots and returned for the caller to open.
///
/// # Errors
///
/// - anything [`validate_path`] rejects
/// - `PathUnresolvable` if the path does not exist
/// - `PathOutsideRoots` if the resolved path leaves every root
pub fn resolve_path(arg: &str, raw: &str, roots: &[PathBuf]) -> Result<PathBuf, SecurityError> {
    let normalized = validate_path(arg, raw, roots)?;

    let resolved = std::fs::canonicalize(&normalized).map_err(|_| SecurityError::PathUnresolvable {
        arg: arg.to_string(),
    })?;

    let inside = roots.iter().any(|root| {
        let root = std::fs::canonicalize(root).unwrap_or_else(|_| normalize(root));
        resolved.starts_with(root)
    });
    if inside {
        Ok(resolved)
    } else {
        // Report the requested path, not where the link points
        Err(SecurityError::PathOutsideRoots {
            arg: arg.to_string(),
            path: normalized.display().to_string(),
        })
    }
}

//! Integration Test: Handler Registry Locality
//!
//! **Policy**: Command handlers live in a `Dispatcher` value owned by the
//! server. There is no process-wide handler table and no mutable global
//! state reachable from a request.
//!
//! Plain atomics (id counters) are acceptable.

use architectural_enforcement::{fail_on, production_lines, workspace_root, PRODUCTION_DIRS};

const FORBIDDEN_GLOBAL_TYPES: &[&str] = &[
    "Dispatcher",
    "CommandHandler",
    "HashMap",
    "DashMap",
    "Mutex",
    "RwLock",
    "OnceLock",
    "OnceCell",
    "LazyLock",
    "Lazy<",
];

fn global_table(code: &str) -> Option<&'static str> {
    let trimmed = code.trim_start();
    if trimmed.starts_with("lazy_static!") || trimmed.starts_with("thread_local!") {
        return Some("Global state macro");
    }

    let decl = trimmed
        .strip_prefix("pub(crate) ")
        .or_else(|| trimmed.strip_prefix("pub "))
        .unwrap_or(trimmed);
    if !decl.starts_with("static ") {
        return None;
    }
    if decl.starts_with("static mut ") {
        return Some("Mutable static");
    }
    FORBIDDEN_GLOBAL_TYPES
        .iter()
        .any(|ty| decl.contains(ty))
        .then_some("Global handler table or shared state")
}

#[test]
fn test_no_global_handler_tables() {
    let root = workspace_root();
    let mut violations = Vec::new();

    for dir in PRODUCTION_DIRS {
        for (path, line, code) in production_lines(&root.join(dir)) {
            if let Some(kind) = global_table(&code) {
                violations.push(format!("{}:{line} - {kind}: {}", path.display(), code.trim()));
            }
        }
    }

    fail_on(&violations, "handlers must be registered on a Dispatcher instance");
}

#[test]
fn test_no_panicking_unwraps_in_engine_library() {
    let root = workspace_root();
    let mut violations = Vec::new();

    for (path, line, code) in production_lines(&root.join("engine/core/src")) {
        if code.contains(".unwrap()") || code.contains(".expect(") {
            violations.push(format!("{}:{line} - {}", path.display(), code.trim()));
        }
    }

    fail_on(&violations, "engine library code must propagate errors");
}

#[test]
fn test_global_table_detection() {
    assert!(global_table("static HANDLERS: OnceLock<Dispatcher> = OnceLock::new();").is_some());
    assert!(global_table("pub static REGISTRY: Mutex<HashMap<String, Handler>> = todo;").is_some());
    assert!(global_table("static mut COUNT: u32 = 0;").is_some());
    assert!(global_table("lazy_static! {").is_some());
    assert!(global_table("        static COUNTER: AtomicU64 = AtomicU64::new(1);").is_none());
    assert!(global_table("let handlers: HashMap<Command, Arc<dyn CommandHandler>>").is_none());
}

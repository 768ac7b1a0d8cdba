// ABOUTME: Verb (%h, %p, %r) and filesystem path expansion.
// ABOUTME: Used for IdentityFile, ProxyCommand, and synthesized ProxyJump commands.

use std::path::{Component, Path, PathBuf};

/// Substitute `%h`, `%p` and `%r` with the destination hostname, port and
/// user. Other `%` verbs are left untouched.
pub fn expand_verbs(value: &str, user: &str, port: &str, hostname: &str) -> String {
    value
        .replace("%h", hostname)
        .replace("%p", port)
        .replace("%r", user)
}

/// Resolve `path` to an absolute, lexically cleaned path.
///
/// Absolute paths are kept, a leading `~` is replaced by `home`, and
/// anything else is joined onto `base`.
pub fn expand_path(path: &str, base: &Path, home: &Path) -> PathBuf {
    let joined = if path.starts_with('/') {
        PathBuf::from(path)
    } else if let Some(rest) = path.strip_prefix('~') {
        home.join(rest.trim_start_matches('/'))
    } else {
        base.join(path)
    };
    clean(&joined)
}

/// Lexical cleanup: drops `.` segments and folds `..` into its parent.
fn clean(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

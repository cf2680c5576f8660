//! Shell command strings issued against targets.
//!
//! Paths are wrapped in single quotes; patterns are passed to `grep`
//! uninterpreted. Nothing here escapes embedded quotes, so every path
//! segment must already have gone through [`sanitize_segment`].

/// Entries of `dir` whose name ends with a match of the regex `pattern`.
///
/// Patterns are Perl-compatible. Where `grep -P` is unavailable (grep exits
/// 2) the listing is retried with `grep -E`.
pub fn list_matching(dir: &str, pattern: &str) -> String {
    format!(
        "ls '{dir}' | grep -P '{pattern}$' 2>/dev/null || {{ [ $? -eq 2 ] && ls '{dir}' | grep -E '{pattern}$'; }}"
    )
}

/// Entry of `dir` named exactly `name`.
pub fn list_exact(dir: &str, name: &str) -> String {
    format!("ls '{dir}' | grep -Fx '{name}'")
}

/// Long listing of `path`, only when it is a symbolic link.
pub fn symlink_probe(path: &str) -> String {
    format!("ls -ld '{path}' | grep '^l'")
}

/// Disk usage of `path` in kilobytes, as a bare number.
pub fn disk_usage_kb(path: &str) -> String {
    format!("du -sk '{path}' | awk '{{print $1}}'")
}

/// Succeeds when the target has an archive tool.
pub fn archive_tool_probe() -> String {
    "command -v tar".to_string()
}

/// Succeeds when `path` is a directory.
pub fn directory_probe(path: &str) -> String {
    format!("test -d '{path}'")
}

/// Tar stream of `dir/name` on stdout, entries rooted at `name`.
pub fn tar_stream(dir: &str, name: &str) -> String {
    format!("tar cf - -C '{dir}' '{name}'")
}

/// Raw bytes of one file on stdout.
pub fn cat(path: &str) -> String {
    format!("cat '{path}'")
}

/// Strip traversal sequences from a path segment before it is interpolated
/// into a command.
///
/// Every `../` is removed, repeatedly, and a segment that reduces to `..` or
/// `.` becomes empty.
pub fn sanitize_segment(segment: &str) -> String {
    let mut current = segment.to_string();
    loop {
        let next = current.replace("../", "").replace("/..", "");
        if next == current {
            break;
        }
        current = next;
    }
    match current.as_str() {
        ".." | "." => String::new(),
        _ => current,
    }
}

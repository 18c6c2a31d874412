//! Shell snippets for the handful of file operations the engine performs remotely.

const HEREDOC_MARKER: &str = "SWITCHYARD_EOF";

/// Single-quote `value` for a POSIX shell.
pub fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

fn sudo_prefix(sudo: bool) -> &'static str {
    if sudo {
        "sudo "
    } else {
        ""
    }
}

fn parent_dir(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) => "/",
        Some(idx) => &path[..idx],
        None => ".",
    }
}

/// Print a file; exits non-zero when it does not exist.
pub fn read_file(path: &str) -> String {
    format!("cat -- {}", quote(path))
}

/// Write `content` to a sibling temp file, then move it over `path`.
///
/// Readers see either the old file or the new one, never a partial write.
pub fn atomic_write(path: &str, content: &str, sudo: bool) -> String {
    let sudo = sudo_prefix(sudo);
    let tmp = format!("{}.new", path);
    format!(
        "{sudo}mkdir -p -- {dir} && {sudo}tee {tmp} > /dev/null <<'{marker}' && {sudo}mv -f -- {tmp} {path}\n{body}\n{marker}",
        sudo = sudo,
        dir = quote(parent_dir(path)),
        tmp = quote(&tmp),
        path = quote(path),
        marker = HEREDOC_MARKER,
        body = content.trim_end_matches('\n'),
    )
}

/// Plain (non-atomic) write, for files nothing reads concurrently.
pub fn write_file(path: &str, content: &str) -> String {
    format!(
        "mkdir -p -- {dir} && cat > {path} <<'{marker}'\n{body}\n{marker}",
        dir = quote(parent_dir(path)),
        path = quote(path),
        marker = HEREDOC_MARKER,
        body = content.trim_end_matches('\n'),
    )
}

pub fn remove_file(path: &str, sudo: bool) -> String {
    format!("{}rm -f -- {}", sudo_prefix(sudo), quote(path))
}

/// Inverse of [`quote`] for a single quoted word.
#[cfg(test)]
pub fn unquote(word: &str) -> String {
    word.trim()
        .strip_prefix('\'')
        .and_then(|w| w.strip_suffix('\''))
        .unwrap_or(word)
        .replace("'\\''", "'")
}

#[cfg(test)]
pub fn heredoc_marker() -> &'static str {
    HEREDOC_MARKER
}

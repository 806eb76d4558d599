//! Lexical path helpers. None of these touch the filesystem.

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};

/// Normalize a path, removing things like `.` and `..`.
///
/// CAUTION: This does not resolve symlinks (unlike [`std::fs::canonicalize`]).
///
/// Adapted from
/// <https://github.com/rust-lang/cargo/blob/f7acf448fc127df9a77c52cc2bba027790ac4931/crates/cargo-util/src/paths.rs#L76-L116>
pub fn normalize_path(path: &Utf8Path) -> Utf8PathBuf {
    let mut components = path.components().peekable();
    let mut ret = if let Some(c @ Utf8Component::Prefix(..)) = components.peek().cloned() {
        components.next();
        Utf8PathBuf::from(c.as_str())
    } else {
        Utf8PathBuf::new()
    };

    for component in components {
        match component {
            Utf8Component::Prefix(..) => unreachable!(),
            Utf8Component::RootDir => {
                ret.push(Utf8Component::RootDir);
            }
            Utf8Component::CurDir => {}
            Utf8Component::ParentDir => {
                if ret.ends_with(Utf8Component::ParentDir) {
                    ret.push(Utf8Component::ParentDir);
                } else {
                    let popped = ret.pop();
                    if !popped && !ret.has_root() {
                        ret.push(Utf8Component::ParentDir);
                    }
                }
            }
            Utf8Component::Normal(c) => {
                ret.push(c);
            }
        }
    }
    ret
}

/// Path of `to` as seen from the directory `from`. Both must be normalized
/// and either both absolute or both relative.
pub fn relative_path(from: &Utf8Path, to: &Utf8Path) -> Utf8PathBuf {
    let from: Vec<_> = from.components().collect();
    let to: Vec<_> = to.components().collect();

    let shared = from
        .iter()
        .zip(to.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut out = Utf8PathBuf::new();
    for _ in shared..from.len() {
        out.push("..");
    }
    for component in &to[shared..] {
        out.push(component.as_str());
    }

    if out.as_str().is_empty() {
        Utf8PathBuf::from(".")
    } else {
        out
    }
}

/// Deepest directory containing every path in `paths`.
pub fn common_ancestor<'a>(paths: impl IntoIterator<Item = &'a Utf8Path>) -> Option<Utf8PathBuf> {
    let mut iter = paths.into_iter();
    let mut acc: Vec<Utf8Component> = iter.next()?.components().collect();

    for path in iter {
        let shared = acc
            .iter()
            .zip(path.components())
            .take_while(|(a, b)| **a == *b)
            .count();
        acc.truncate(shared);
    }

    Some(acc.iter().map(|c| c.as_str()).collect())
}

/// Rewrites a manifest-relative entry so it is relative to another directory.
/// `offset` is the path from the new base to the entry's original base. A
/// trailing `/` marks a directory and survives the rewrite.
pub fn rebase_entry(entry: &str, offset: &Utf8Path) -> String {
    let is_dir = entry.ends_with('/');
    let mut rebased = normalize_path(&offset.join(entry)).into_string();

    if rebased.is_empty() {
        rebased.push('.');
    }
    if is_dir && !rebased.ends_with('/') {
        rebased.push('/');
    }

    rebased
}

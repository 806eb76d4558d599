use std::collections::BTreeSet;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;

use crate::paths::{rebase_entry, relative_path};

/// Entries starting with this marker reference a path variable and are never
/// rebased.
pub const PATH_VARIABLE_MARKER: &str = "<(";

/// The `variables` block of a manifest, as written.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SettingsFields {
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub read_only: Option<u8>,
}

/// Settings for one configuration tuple.
///
/// A value without an `isolate_dir` is the empty sentinel: it is the identity
/// of [`ConfigSettings::union`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigSettings {
    command: Vec<String>,
    files: Vec<String>,
    read_only: Option<u8>,
    isolate_dir: Option<Utf8PathBuf>,
}

impl ConfigSettings {
    pub fn empty() -> Self {
        Self::default()
    }

    /// `isolate_dir` is the absolute directory `files` are relative to.
    pub fn new(fields: SettingsFields, isolate_dir: impl Into<Utf8PathBuf>) -> Self {
        let isolate_dir = isolate_dir.into();
        debug_assert!(isolate_dir.is_absolute(), "{isolate_dir} must be absolute");

        let files: BTreeSet<String> = fields.files.into_iter().collect();

        Self {
            command: fields.command,
            files: files.into_iter().collect(),
            read_only: fields.read_only,
            isolate_dir: Some(isolate_dir),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.isolate_dir.is_none()
    }

    pub fn command(&self) -> &[String] {
        &self.command
    }

    pub fn files(&self) -> &[String] {
        &self.files
    }

    pub fn read_only(&self) -> Option<u8> {
        self.read_only
    }

    pub fn isolate_dir(&self) -> Option<&Utf8Path> {
        self.isolate_dir.as_deref()
    }

    pub(crate) fn without_command(&self) -> Self {
        Self {
            command: Vec::new(),
            ..self.clone()
        }
    }

    /// Merges two settings into a new value.
    ///
    /// The side with a command is authoritative, `self` on ties. Without any
    /// command, the side with files is authoritative, again `self` on ties,
    /// and when neither side has files `self` stays authoritative. The other
    /// side's files are rebased onto the authoritative `isolate_dir`.
    pub fn union(&self, rhs: &ConfigSettings) -> ConfigSettings {
        let (Some(self_dir), Some(rhs_dir)) = (&self.isolate_dir, &rhs.isolate_dir) else {
            return if self.is_empty() {
                rhs.clone()
            } else {
                self.clone()
            };
        };

        let self_wins = if !self.command.is_empty() || !rhs.command.is_empty() {
            !self.command.is_empty()
        } else if !self.files.is_empty() || !rhs.files.is_empty() {
            !self.files.is_empty()
        } else {
            true
        };

        let (auth, auth_dir, other, other_dir) = if self_wins {
            (self, self_dir, rhs, rhs_dir)
        } else {
            (rhs, rhs_dir, self, self_dir)
        };

        let offset = relative_path(auth_dir, other_dir);
        let mut files: BTreeSet<String> = auth.files.iter().cloned().collect();

        for entry in &other.files {
            if entry.starts_with(PATH_VARIABLE_MARKER) {
                files.insert(entry.clone());
            } else {
                files.insert(rebase_entry(entry, &offset));
            }
        }

        ConfigSettings {
            command: auth.command.clone(),
            files: files.into_iter().collect(),
            read_only: self.read_only.or(rhs.read_only),
            isolate_dir: Some(auth_dir.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(command: &[&str], files: &[&str], read_only: Option<u8>, dir: &str) -> ConfigSettings {
        ConfigSettings::new(
            SettingsFields {
                command: command.iter().map(|s| s.to_string()).collect(),
                files: files.iter().map(|s| s.to_string()).collect(),
                read_only,
            },
            dir,
        )
    }

    #[test]
    fn test_empty_is_identity() {
        let value = settings(&["run"], &["b", "a"], Some(1), "/src");
        assert_eq!(value.union(&ConfigSettings::empty()), value);
        assert_eq!(ConfigSettings::empty().union(&value), value);
        assert_eq!(
            ConfigSettings::empty().union(&ConfigSettings::empty()),
            ConfigSettings::empty()
        );
    }

    #[test]
    fn test_files_are_sorted() {
        let value = settings(&[], &["z", "a", "m", "a"], None, "/src");
        assert_eq!(value.files(), ["a", "m", "z"]);
    }

    #[test]
    fn test_command_side_wins_and_rebases_other() {
        let lhs = settings(&[], &["lib.so"], None, "/src/lib");
        let rhs = settings(&["./run"], &["data/"], Some(2), "/src/out");

        let merged = lhs.union(&rhs);
        assert_eq!(merged.command(), ["./run"]);
        assert_eq!(merged.isolate_dir(), Some(Utf8Path::new("/src/out")));
        assert_eq!(merged.files(), ["../lib/lib.so", "data/"]);
        assert_eq!(merged.read_only(), Some(2));
    }

    #[test]
    fn test_command_tie_favors_self() {
        let lhs = settings(&["left"], &[], Some(0), "/a");
        let rhs = settings(&["right"], &[], Some(1), "/b");

        assert_eq!(lhs.union(&rhs).command(), ["left"]);
        assert_eq!(rhs.union(&lhs).command(), ["right"]);
        assert_eq!(lhs.union(&rhs).read_only(), Some(0));
        assert_eq!(rhs.union(&lhs).read_only(), Some(1));
    }

    #[test]
    fn test_files_side_wins_without_command() {
        let lhs = settings(&[], &[], Some(1), "/a");
        let rhs = settings(&[], &["x"], None, "/b");

        let merged = lhs.union(&rhs);
        assert_eq!(merged.isolate_dir(), Some(Utf8Path::new("/b")));
        assert_eq!(merged.files(), ["x"]);
        assert_eq!(merged.read_only(), Some(1));
    }

    #[test]
    fn test_neither_side_has_files_keeps_self() {
        let lhs = settings(&[], &[], None, "/a");
        let rhs = settings(&[], &[], Some(2), "/b");

        let merged = lhs.union(&rhs);
        assert_eq!(merged.isolate_dir(), Some(Utf8Path::new("/a")));
        assert_eq!(merged.read_only(), Some(2));
    }

    #[test]
    fn test_path_variables_are_not_rebased() {
        let lhs = settings(&["run"], &[], None, "/src/out");
        let rhs = settings(&[], &["<(PRODUCT_DIR)/bin", "x"], None, "/src/other");

        assert_eq!(lhs.union(&rhs).files(), ["../other/x", "<(PRODUCT_DIR)/bin"]);
    }
}

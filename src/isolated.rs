//! The `.isolated` file: a resolved manifest with every input hashed.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use rayon::iter::{IntoParallelIterator, ParallelIterator};
use serde::{Deserialize, Serialize};

use crate::core::{Digest, HashAlgo, digest_file};
use crate::error::{IsolateError, ManifestError, MappingError};
use crate::manifest::{PATH_VARIABLE_MARKER, ResolvedConfig};
use crate::paths::{common_ancestor, normalize_path, relative_path};

pub const ISOLATED_VERSION: &str = "1.4";

/// One input, keyed by its path relative to the root directory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Content digest. Absent for symlinks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub h: Option<Digest>,
    /// Size in bytes. Absent for symlinks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s: Option<u64>,
    /// Unix permission bits.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub m: Option<u32>,
    /// Symlink target.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub l: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Isolated {
    pub algo: String,
    #[serde(default)]
    pub files: BTreeMap<String, FileEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    #[serde(default = "default_read_only")]
    pub read_only: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relative_cwd: Option<String>,
    pub version: String,
}

fn default_read_only() -> u8 {
    1
}

/// An [`Isolated`] together with the directory its file keys are relative to.
#[derive(Debug, Clone)]
pub struct IsolatedBuild {
    pub isolated: Isolated,
    pub root_dir: Utf8PathBuf,
}

impl IsolatedBuild {
    /// Absolute path of every hashed file, keyed by digest.
    pub fn inputs(&self) -> impl Iterator<Item = (Utf8PathBuf, &Digest, u64)> {
        self.isolated.files.iter().filter_map(|(path, entry)| {
            Some((self.root_dir.join(path), entry.h.as_ref()?, entry.s?))
        })
    }
}

impl Isolated {
    /// Hashes every input of a resolved configuration.
    ///
    /// `<(NAME)` references are replaced from `path_variables`; directories
    /// (entries ending in `/`) are expanded recursively. The root directory is
    /// the deepest directory holding both the isolate directory and every
    /// input.
    pub fn build(
        resolved: &ResolvedConfig,
        path_variables: &BTreeMap<String, String>,
        algo: HashAlgo,
    ) -> Result<IsolatedBuild, IsolateError> {
        let isolate_dir = resolved
            .isolate_dir
            .clone()
            .unwrap_or_else(|| Utf8PathBuf::from("/"));

        let mut inputs = Vec::new();
        for entry in &resolved.files {
            let entry = entry.replace(std::path::MAIN_SEPARATOR, "/");
            let entry = substitute(&entry, path_variables)?;
            expand(&isolate_dir, &entry, &mut inputs)?;
        }

        let root_dir = common_ancestor(
            std::iter::once(isolate_dir.as_path())
                .chain(inputs.iter().map(|path| path.parent().unwrap_or(path))),
        )
        .unwrap_or_else(|| isolate_dir.clone());

        let read_only = resolved.read_only.unwrap_or_else(default_read_only);

        let files = inputs
            .into_par_iter()
            .map(|path| {
                let entry = file_entry(&path, read_only, algo)?;
                Ok((relative_path(&root_dir, &path).into_string(), entry))
            })
            .collect::<Result<BTreeMap<_, _>, MappingError>>()?;

        let relative_cwd = relative_path(&root_dir, &isolate_dir);

        tracing::debug!("Hashed {} inputs under {root_dir}", files.len());

        Ok(IsolatedBuild {
            isolated: Isolated {
                algo: algo.name().to_string(),
                files,
                command: resolved.command.clone(),
                read_only,
                relative_cwd: (relative_cwd != ".").then(|| relative_cwd.into_string()),
                version: ISOLATED_VERSION.to_string(),
            },
            root_dir,
        })
    }

    pub fn hash_algo(&self) -> Result<HashAlgo, ManifestError> {
        HashAlgo::from_name(&self.algo)
    }

    pub fn to_json(&self) -> io::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parses an `.isolated` file, rejecting other major versions, unknown
    /// hash algorithms, malformed digests and paths that would land outside
    /// the directory the file is mapped into.
    pub fn from_json(buffer: &[u8]) -> Result<Self, ManifestError> {
        let isolated: Isolated =
            serde_json::from_slice(buffer).map_err(|source| ManifestError::Structure {
                location: "isolated".to_string(),
                source,
            })?;

        let major = |version: &str| version.split('.').next().map(str::to_string);
        if major(&isolated.version) != major(ISOLATED_VERSION) {
            return Err(ManifestError::Version(isolated.version));
        }

        let algo = isolated.hash_algo()?;

        if let Some(cwd) = &isolated.relative_cwd
            && !is_contained(cwd)
        {
            return Err(ManifestError::UnsafePath(cwd.clone()));
        }

        let links: BTreeSet<&str> = isolated
            .files
            .iter()
            .filter(|(_, entry)| entry.l.is_some())
            .map(|(path, _)| path.as_str())
            .collect();

        for (path, entry) in &isolated.files {
            let through_link = Utf8Path::new(path)
                .ancestors()
                .skip(1)
                .any(|parent| links.contains(parent.as_str()));
            if !is_contained(path) || through_link {
                return Err(ManifestError::UnsafePath(path.clone()));
            }

            if let Some(digest) = &entry.h
                && Digest::parse(digest.as_str(), algo).is_none()
            {
                return Err(ManifestError::InvalidDigest {
                    path: path.clone(),
                    digest: digest.to_string(),
                });
            }
        }

        Ok(isolated)
    }
}

/// Plain relative path made of normal components only.
fn is_contained(path: &str) -> bool {
    !path.is_empty()
        && Utf8Path::new(path)
            .components()
            .all(|component| matches!(component, Utf8Component::Normal(_)))
}

fn substitute(entry: &str, variables: &BTreeMap<String, String>) -> Result<String, ManifestError> {
    let mut out = String::with_capacity(entry.len());
    let mut rest = entry;

    while let Some(start) = rest.find(PATH_VARIABLE_MARKER) {
        out.push_str(&rest[..start]);
        let after = &rest[start + PATH_VARIABLE_MARKER.len()..];

        let end = after
            .find(')')
            .ok_or_else(|| ManifestError::UndefinedPathVariable {
                variable: after.to_string(),
                path: entry.to_string(),
            })?;

        let name = &after[..end];
        let value = variables
            .get(name)
            .ok_or_else(|| ManifestError::UndefinedPathVariable {
                variable: name.to_string(),
                path: entry.to_string(),
            })?;

        out.push_str(value);
        rest = &after[end + 1..];
    }

    out.push_str(rest);
    Ok(out)
}

/// Pushes the absolute path of every file `entry` stands for.
fn expand(
    isolate_dir: &Utf8Path,
    entry: &str,
    out: &mut Vec<Utf8PathBuf>,
) -> Result<(), MappingError> {
    let path = normalize_path(&isolate_dir.join(entry));

    let meta = match fs::symlink_metadata(&path) {
        Ok(meta) => meta,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Err(MappingError::NotFound(path));
        }
        Err(source) => return Err(MappingError::Io { path, source }),
    };

    match (entry.ends_with('/'), meta.is_dir()) {
        (false, false) => out.push(path),
        (false, true) => return Err(MappingError::MissingTrailingSlash(path)),
        (true, false) => return Err(MappingError::NotADirectory(path)),
        (true, true) => {
            let pattern = format!("{}/**/*", glob::Pattern::escape(path.as_str()));
            let paths = glob::glob(&pattern).map_err(|err| MappingError::Io {
                path: path.clone(),
                source: io::Error::other(err),
            })?;

            for found in paths {
                let found = found.map_err(|err| MappingError::Io {
                    path: path.clone(),
                    source: err.into(),
                })?;
                let found = Utf8PathBuf::try_from(found)?;

                let meta = fs::symlink_metadata(&found).map_err(|source| MappingError::Io {
                    path: found.clone(),
                    source,
                })?;
                if !meta.is_dir() {
                    out.push(found);
                }
            }
        }
    }

    Ok(())
}

fn file_entry(path: &Utf8Path, read_only: u8, algo: HashAlgo) -> Result<FileEntry, MappingError> {
    let io_err = |source| MappingError::Io {
        path: path.to_path_buf(),
        source,
    };

    let meta = fs::symlink_metadata(path).map_err(io_err)?;

    if meta.file_type().is_symlink() {
        let target = fs::read_link(path).map_err(io_err)?;
        let target = Utf8PathBuf::try_from(target)?;
        return Ok(FileEntry {
            l: Some(target.into_string()),
            ..Default::default()
        });
    }

    Ok(FileEntry {
        h: Some(digest_file(path, algo).map_err(io_err)?),
        s: Some(meta.len()),
        m: file_mode(&meta, read_only),
        l: None,
    })
}

#[cfg(unix)]
fn file_mode(meta: &fs::Metadata, read_only: u8) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;

    // Group and others never get write access.
    let mut mode = meta.permissions().mode() & 0o755;
    if read_only > 0 {
        mode &= !0o200;
    }
    Some(mode)
}

#[cfg(not(unix))]
fn file_mode(_: &fs::Metadata, _: u8) -> Option<u32> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::digest;

    fn tempdir() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().canonicalize().unwrap()).unwrap();
        (dir, path)
    }

    fn resolved(dir: &Utf8Path, files: &[&str]) -> ResolvedConfig {
        ResolvedConfig {
            command: vec!["./run".to_string()],
            files: files.iter().map(|s| s.to_string()).collect(),
            read_only: None,
            isolate_dir: Some(dir.to_path_buf()),
        }
    }

    #[test]
    fn test_build_hashes_and_expands() {
        let (_guard, root) = tempdir();
        fs::create_dir_all(root.join("out/data/deep")).unwrap();
        fs::write(root.join("out/run"), b"#!/bin/sh\n").unwrap();
        fs::write(root.join("out/data/a.txt"), b"a").unwrap();
        fs::write(root.join("out/data/deep/b.txt"), b"b").unwrap();
        fs::write(root.join("lib.so"), b"lib").unwrap();

        let config = resolved(&root.join("out"), &["run", "data/", "../lib.so"]);
        let built = Isolated::build(&config, &BTreeMap::new(), HashAlgo::Sha1).unwrap();

        assert_eq!(built.root_dir, root);
        let isolated = &built.isolated;
        assert_eq!(isolated.relative_cwd.as_deref(), Some("out"));
        assert_eq!(isolated.read_only, 1);
        assert_eq!(
            isolated.files.keys().collect::<Vec<_>>(),
            ["lib.so", "out/data/a.txt", "out/data/deep/b.txt", "out/run"]
        );

        let entry = &isolated.files["out/data/a.txt"];
        assert_eq!(entry.h, Some(digest(b"a", HashAlgo::Sha1)));
        assert_eq!(entry.s, Some(1));
        #[cfg(unix)]
        assert_eq!(entry.m.map(|m| m & 0o222), Some(0));

        assert_eq!(built.inputs().count(), 4);
    }

    #[test]
    fn test_build_mapping_errors() {
        let (_guard, root) = tempdir();
        fs::create_dir(root.join("dir")).unwrap();
        fs::write(root.join("file"), b"x").unwrap();

        let err = |files: &[&str]| {
            Isolated::build(&resolved(&root, files), &BTreeMap::new(), HashAlgo::Sha1).unwrap_err()
        };

        assert!(matches!(err(&["missing"]), IsolateError::Mapping(MappingError::NotFound(_))));
        assert!(matches!(
            err(&["dir"]),
            IsolateError::Mapping(MappingError::MissingTrailingSlash(_))
        ));
        assert!(matches!(
            err(&["file/"]),
            IsolateError::Mapping(MappingError::NotADirectory(_))
        ));
    }

    #[test]
    fn test_path_variables() {
        let mut vars = BTreeMap::new();
        vars.insert("PRODUCT_DIR".to_string(), "out/Release".to_string());

        assert_eq!(substitute("<(PRODUCT_DIR)/test", &vars).unwrap(), "out/Release/test");
        assert_eq!(substitute("plain", &vars).unwrap(), "plain");
        assert!(matches!(
            substitute("<(DEPTH)/x", &vars),
            Err(ManifestError::UndefinedPathVariable { ref variable, .. }) if variable == "DEPTH"
        ));
    }

    #[test]
    fn test_json_round_trip_and_version() {
        let mut files = BTreeMap::new();
        files.insert(
            "a".to_string(),
            FileEntry {
                h: Some(digest(b"a", HashAlgo::Sha1)),
                s: Some(1),
                m: Some(0o500),
                l: None,
            },
        );
        let isolated = Isolated {
            algo: "sha-1".to_string(),
            files,
            command: vec![],
            read_only: 1,
            relative_cwd: None,
            version: ISOLATED_VERSION.to_string(),
        };

        let json = isolated.to_json().unwrap();
        let text = String::from_utf8(json.clone()).unwrap();
        assert!(!text.contains("command"));
        assert!(!text.contains("\"l\""));
        assert_eq!(Isolated::from_json(&json).unwrap(), isolated);

        let older = br#"{"algo": "sha-1", "version": "1.0"}"#;
        assert_eq!(Isolated::from_json(older).unwrap().read_only, 1);

        let newer = br#"{"algo": "sha-1", "version": "2.0"}"#;
        assert!(matches!(Isolated::from_json(newer), Err(ManifestError::Version(_))));

        let algo = br#"{"algo": "md5", "version": "1.4"}"#;
        assert!(matches!(Isolated::from_json(algo), Err(ManifestError::Algorithm(_))));
    }

    fn with_file(path: &str, entry: serde_json::Value) -> Vec<u8> {
        serde_json::json!({
            "algo": "sha-1",
            "version": ISOLATED_VERSION,
            "files": { path: entry },
        })
        .to_string()
        .into_bytes()
    }

    #[test]
    fn test_from_json_rejects_escaping_paths() {
        let h = digest(b"a", HashAlgo::Sha1).to_string();
        let entry = serde_json::json!({"h": h, "s": 1});

        for path in ["../escaped.txt", "/etc/passwd", "a/../../b", "./a", ""] {
            assert!(
                matches!(
                    Isolated::from_json(&with_file(path, entry.clone())),
                    Err(ManifestError::UnsafePath(ref p)) if p == path
                ),
                "{path} was accepted"
            );
        }

        assert!(Isolated::from_json(&with_file("a/b.txt", entry)).is_ok());

        let cwd = br#"{"algo": "sha-1", "version": "1.4", "relative_cwd": "../.."}"#;
        assert!(matches!(Isolated::from_json(cwd), Err(ManifestError::UnsafePath(_))));
    }

    #[test]
    fn test_from_json_rejects_files_under_symlinks() {
        let h = digest(b"a", HashAlgo::Sha1).to_string();
        let json = serde_json::json!({
            "algo": "sha-1",
            "version": ISOLATED_VERSION,
            "files": {
                "link": {"l": "/tmp"},
                "link/x": {"h": h, "s": 1},
            },
        });

        assert!(matches!(
            Isolated::from_json(json.to_string().as_bytes()),
            Err(ManifestError::UnsafePath(ref p)) if p == "link/x"
        ));
    }

    #[test]
    fn test_from_json_rejects_malformed_digests() {
        let sha256 = digest(b"a", HashAlgo::Sha256).to_string();
        for h in ["not-hex", "ABCDEF", sha256.as_str()] {
            let json = with_file("a", serde_json::json!({"h": h}));
            assert!(matches!(
                Isolated::from_json(&json),
                Err(ManifestError::InvalidDigest { .. })
            ));
        }
    }
}

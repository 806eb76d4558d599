//! Platform-conditioned input manifests.
//!
//! A manifest lists the files and command a target needs, optionally
//! conditioned on configuration variables, and may include other manifests.
//! Loading one produces a [`Configs`], which can then be narrowed down to a
//! single configuration with [`Configs::resolve_for_config`].

pub mod configs;
pub mod expr;
mod literal;
pub mod settings;

use std::collections::BTreeMap;
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;

use crate::error::ManifestError;
use crate::paths::normalize_path;

pub use self::configs::{
    ConfigKey, Configs, MAX_CONFIG_VARIABLES, ResolvedConfig, all_configs, match_configs,
};
pub use self::expr::{ConfigValue, Expr};
pub use self::settings::{ConfigSettings, PATH_VARIABLE_MARKER, SettingsFields};

/// A manifest document, validated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    #[serde(default)]
    pub includes: Vec<String>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub variables: Option<SettingsFields>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Condition(pub String, pub ConditionBody);

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConditionBody {
    #[serde(default)]
    pub variables: SettingsFields,
}

impl Manifest {
    fn settings(&self) -> impl Iterator<Item = &SettingsFields> {
        self.variables
            .iter()
            .chain(self.conditions.iter().map(|Condition(_, body)| &body.variables))
    }
}

/// Parses manifest source text. `location` only shows up in errors.
pub fn parse_manifest(source: &str, location: &str) -> Result<Manifest, ManifestError> {
    let value = literal::parse(source, location)?;

    let manifest: Manifest =
        serde_json::from_value(value).map_err(|source| ManifestError::Structure {
            location: location.to_string(),
            source,
        })?;

    for fields in manifest.settings() {
        if let Some(read_only) = fields.read_only
            && read_only > 2
        {
            return Err(ManifestError::ReadOnly(read_only));
        }
    }

    Ok(manifest)
}

/// Turns a parsed manifest into [`Configs`].
///
/// `isolate_dir` is the absolute directory of the manifest; file entries and
/// includes are relative to it. Includes are read from disk.
pub fn load_manifest_as_config(
    isolate_dir: &Utf8Path,
    manifest: &Manifest,
    file_comment: Option<String>,
) -> Result<Configs, ManifestError> {
    let mut stack = Vec::new();
    load(isolate_dir, manifest, file_comment, false, &mut stack)
}

/// Reads, parses and loads the manifest at `path`, including its includes.
///
/// Leading `#` lines of the file become the file comment.
pub fn load_manifest_file(path: &Utf8Path) -> Result<Configs, ManifestError> {
    let mut stack = Vec::new();
    load_file(path, false, &mut stack)
}

fn load_file(
    path: &Utf8Path,
    strip_commands: bool,
    stack: &mut Vec<Utf8PathBuf>,
) -> Result<Configs, ManifestError> {
    let path = path
        .canonicalize_utf8()
        .map_err(|source| ManifestError::Read {
            path: path.to_path_buf(),
            source,
        })?;

    if stack.contains(&path) {
        return Err(ManifestError::IncludeCycle(path));
    }

    let source = fs::read_to_string(&path).map_err(|source| ManifestError::Read {
        path: path.clone(),
        source,
    })?;

    let manifest = parse_manifest(&source, path.as_str())?;
    let isolate_dir = path.parent().unwrap_or(Utf8Path::new("/")).to_path_buf();

    stack.push(path);
    let configs = load(
        &isolate_dir,
        &manifest,
        leading_comment(&source),
        strip_commands,
        stack,
    );
    stack.pop();

    configs
}

fn load(
    isolate_dir: &Utf8Path,
    manifest: &Manifest,
    file_comment: Option<String>,
    strip_commands: bool,
    stack: &mut Vec<Utf8PathBuf>,
) -> Result<Configs, ManifestError> {
    let mut conditions = Vec::with_capacity(manifest.conditions.len());
    let mut values = BTreeMap::new();

    for Condition(source, body) in &manifest.conditions {
        let expr = Expr::parse(source)?;
        expr.comparisons(&mut values);
        conditions.push((expr, body));
    }

    if values.len() > MAX_CONFIG_VARIABLES {
        return Err(ManifestError::TooManyVariables {
            count: values.len(),
            max: MAX_CONFIG_VARIABLES,
        });
    }

    let mut configs = Configs::new(file_comment, values.keys().cloned());
    let variables = configs.config_variables().to_vec();
    let candidates = all_configs(&values);

    if let Some(fields) = &manifest.variables {
        configs.set_config(
            vec![None; variables.len()],
            ConfigSettings::new(fields.clone(), isolate_dir),
        );
    }

    for (expr, body) in conditions {
        for key in match_configs(&expr, &variables, &candidates) {
            configs.set_config(key, ConfigSettings::new(body.variables.clone(), isolate_dir));
        }
    }

    // An includer's command always wins over anything its includes define.
    let strip_children = strip_commands || configs.has_command();
    if strip_commands {
        configs = configs.without_commands();
    }

    let mut included = Configs::new(None, []);
    for include in manifest.includes.iter().rev() {
        if Utf8Path::new(include).is_absolute() {
            return Err(ManifestError::AbsoluteInclude(include.clone()));
        }

        let path = normalize_path(&isolate_dir.join(include));
        let child = load_file(&path, strip_children, stack)?;
        included = child.union(&included);
    }

    Ok(configs.union(&included))
}

fn leading_comment(source: &str) -> Option<String> {
    let comment: String = source
        .lines()
        .take_while(|line| line.starts_with('#'))
        .map(|line| format!("{line}\n"))
        .collect();

    (!comment.is_empty()).then_some(comment)
}

use std::collections::{BTreeMap, BTreeSet};
use std::path::MAIN_SEPARATOR;

use camino::Utf8PathBuf;

use crate::error::ManifestError;
use crate::manifest::expr::{ConfigValue, Expr};
use crate::manifest::settings::ConfigSettings;

/// One slot per configuration variable; `None` matches any value.
pub type ConfigKey = Vec<Option<ConfigValue>>;

/// Settings selected for one concrete configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedConfig {
    pub command: Vec<String>,
    /// Files using the platform path separator.
    pub files: Vec<String>,
    pub read_only: Option<u8>,
    pub isolate_dir: Option<Utf8PathBuf>,
}

/// Settings for every configuration tuple a manifest distinguishes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Configs {
    file_comment: Option<String>,
    variables: Vec<String>,
    by_config: BTreeMap<ConfigKey, ConfigSettings>,
}

impl Configs {
    pub fn new(file_comment: Option<String>, variables: impl IntoIterator<Item = String>) -> Self {
        let variables: BTreeSet<String> = variables.into_iter().collect();

        Self {
            file_comment,
            variables: variables.into_iter().collect(),
            by_config: BTreeMap::new(),
        }
    }

    pub fn file_comment(&self) -> Option<&str> {
        self.file_comment.as_deref()
    }

    /// Variable names in slot order (always sorted).
    pub fn config_variables(&self) -> &[String] {
        &self.variables
    }

    pub fn len(&self) -> usize {
        self.by_config.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_config.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ConfigKey, &ConfigSettings)> {
        self.by_config.iter()
    }

    /// Stores settings for `key`, merging with anything already there.
    ///
    /// # Panics
    /// When `key` doesn't have one slot per variable.
    pub fn set_config(&mut self, key: ConfigKey, value: ConfigSettings) {
        assert_eq!(
            key.len(),
            self.variables.len(),
            "config tuple doesn't match variables {:?}",
            self.variables
        );

        let merged = match self.by_config.get(&key) {
            Some(existing) => existing.union(&value),
            None => value,
        };
        self.by_config.insert(key, merged);
    }

    /// Folds every stored entry matching `target` slot by slot, in key order.
    pub fn get_config(&self, target: &[Option<ConfigValue>]) -> ConfigSettings {
        self.by_config
            .iter()
            .filter(|(key, _)| {
                key.iter()
                    .zip(target)
                    .all(|(stored, wanted)| stored.is_none() || stored == wanted)
            })
            .fold(ConfigSettings::empty(), |acc, (_, settings)| {
                acc.union(settings)
            })
    }

    /// Merges two instances, remapping both onto the union of their variables.
    pub fn union(&self, rhs: &Configs) -> Configs {
        let mut out = Configs::new(
            self.file_comment.clone().or_else(|| rhs.file_comment.clone()),
            self.variables.iter().chain(&rhs.variables).cloned(),
        );

        let lhs = self.remapped(&out.variables);
        let mut rhs = rhs.remapped(&out.variables);

        for (key, settings) in lhs {
            let merged = match rhs.remove(&key) {
                Some(other) => settings.union(&other),
                None => settings,
            };
            out.by_config.insert(key, merged);
        }
        out.by_config.extend(rhs);

        out
    }

    fn remapped(&self, variables: &[String]) -> BTreeMap<ConfigKey, ConfigSettings> {
        let slots: Vec<Option<usize>> = variables
            .iter()
            .map(|name| self.variables.iter().position(|own| own == name))
            .collect();

        self.by_config
            .iter()
            .map(|(key, settings)| {
                let key = slots
                    .iter()
                    .map(|slot| slot.and_then(|i| key[i].clone()))
                    .collect();
                (key, settings.clone())
            })
            .collect()
    }

    pub(crate) fn without_commands(&self) -> Configs {
        Configs {
            file_comment: self.file_comment.clone(),
            variables: self.variables.clone(),
            by_config: self
                .by_config
                .iter()
                .map(|(key, settings)| (key.clone(), settings.without_command()))
                .collect(),
        }
    }

    pub(crate) fn has_command(&self) -> bool {
        self.by_config.values().any(|s| !s.command().is_empty())
    }

    /// Selects the settings for a concrete configuration.
    ///
    /// Every variable this instance knows about must be present in `values`;
    /// extra entries are ignored.
    pub fn resolve_for_config(
        &self,
        values: &BTreeMap<String, ConfigValue>,
    ) -> Result<ResolvedConfig, ManifestError> {
        let missing: Vec<String> = self
            .variables
            .iter()
            .filter(|name| !values.contains_key(*name))
            .cloned()
            .collect();

        if !missing.is_empty() {
            return Err(ManifestError::MissingVariables(missing));
        }

        let target: ConfigKey = self
            .variables
            .iter()
            .map(|name| values.get(name).cloned())
            .collect();

        let settings = self.get_config(&target);

        Ok(ResolvedConfig {
            command: settings.command().to_vec(),
            files: settings
                .files()
                .iter()
                .map(|file| file.replace('/', &MAIN_SEPARATOR.to_string()))
                .collect(),
            read_only: settings.read_only(),
            isolate_dir: settings.isolate_dir().map(|dir| dir.to_path_buf()),
        })
    }
}

/// Most variables one manifest's conditions may compare. Matching visits
/// every subset of them.
pub const MAX_CONFIG_VARIABLES: usize = 16;

/// Cross product of every value each variable is compared against.
pub fn all_configs(values: &BTreeMap<String, BTreeSet<ConfigValue>>) -> Vec<Vec<ConfigValue>> {
    values.values().fold(vec![Vec::new()], |acc, choices| {
        acc.iter()
            .flat_map(|prefix| {
                choices.iter().map(move |choice| {
                    let mut line = prefix.clone();
                    line.push(choice.clone());
                    line
                })
            })
            .collect()
    })
}

/// Returns every tuple, with any subset of slots left unbound, for which
/// `expr` is true using the bound slots alone.
///
/// # Panics
/// With more than [`MAX_CONFIG_VARIABLES`] variables.
pub fn match_configs(
    expr: &Expr,
    variables: &[String],
    all_configs: &[Vec<ConfigValue>],
) -> Vec<ConfigKey> {
    assert!(variables.len() <= MAX_CONFIG_VARIABLES, "too many config variables");
    let mut out = BTreeSet::new();

    for mask in 0u64..(1 << variables.len()) {
        let mut seen = BTreeSet::new();

        for line in all_configs {
            let key: ConfigKey = line
                .iter()
                .enumerate()
                .map(|(i, value)| (mask >> i & 1 == 1).then(|| value.clone()))
                .collect();

            if !seen.insert(key.clone()) {
                continue;
            }

            let bindings: BTreeMap<&str, &ConfigValue> = variables
                .iter()
                .zip(&key)
                .filter_map(|(name, value)| value.as_ref().map(|v| (name.as_str(), v)))
                .collect();

            if expr.eval(&bindings) == Some(true) {
                out.insert(key);
            }
        }
    }

    out.into_iter().collect()
}

// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Config file discovery, parsing and `extends` inheritance.
//!
//! ```text
//! resolve(hint)
//!   └── locate          explicit path, else the first .vitalsrc* in the working directory
//!       └── load_layer  parse, then if `extends` is set:
//!           ├── locate_extends   next to the extending file, else cwd / absolute
//!           ├── ConfigChain      reject self-extension and cycles
//!           └── load_layer       recurse, then deep-merge the layer over its parent
//! ```
//!
//! A broken `extends` never fails resolution: the layer keeps its own values
//! and the `extends` key is dropped. A broken top-level file disables
//! instrumentation.

use std::{
    fs,
    path::{Path, PathBuf},
};

use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::{Config, EXTENDS};
use crate::{
    error::ConfigError,
    flatten::{unflatten, FlatMetrics, DEFAULT_DELIMITER},
    util::{deep_merge, Primitive},
};

/// Looked up in the working directory, first match wins.
pub const CONFIG_FILE_NAMES: [&str; 5] = [
    ".vitalsrc",
    ".vitalsrc.js",
    ".vitalsrc.json",
    ".vitalsrc.yaml",
    ".vitalsrc.yml",
];

/// Extensions tried after the bare reference when resolving `extends`.
const EXTENDS_EXTENSIONS: [&str; 2] = ["js", "json"];

/// The config files visited so far while following `extends`, outermost first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigChain {
    files: Vec<PathBuf>,
}

impl ConfigChain {
    /// Returns the chain extended with `path`, which must be canonical.
    pub fn enter(&self, path: &Path) -> Result<ConfigChain, ConfigError> {
        if self.files.last().is_some_and(|last| last == path) {
            return Err(ConfigError::SelfExtension(path.to_path_buf()));
        }
        if self.contains(path) {
            return Err(ConfigError::Cycle {
                target: path.to_path_buf(),
                chain: self.to_string(),
            });
        }
        let mut files = self.files.clone();
        files.push(path.to_path_buf());
        Ok(ConfigChain { files })
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.files.iter().any(|file| file == path)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

impl std::fmt::Display for ConfigChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let files: Vec<String> = self
            .files
            .iter()
            .map(|file| file.display().to_string())
            .collect();
        write!(f, "{}", files.join(" -> "))
    }
}

#[derive(Debug, Clone)]
pub struct ConfigResolver {
    cwd: PathBuf,
}

impl ConfigResolver {
    pub fn new(cwd: impl Into<PathBuf>) -> Self {
        Self { cwd: cwd.into() }
    }

    /// A resolver rooted at the process working directory.
    pub fn from_current_dir() -> Self {
        Self::new(std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))
    }

    /// Resolves the config, never failing.
    ///
    /// Any problem with the top-level file yields [`Config::disabled`].
    pub fn resolve(&self, path_hint: Option<&Path>) -> Config {
        match self.try_resolve(path_hint) {
            Ok(values) => Config::with_defaults(values),
            Err(e) => {
                debug!("Config resolution failed: {e:?}");
                warn!("{e}. Starting without instrumentation.");
                Config::disabled()
            }
        }
    }

    /// Resolves the raw config values, before defaults are applied.
    pub fn try_resolve(&self, path_hint: Option<&Path>) -> Result<Map<String, Value>, ConfigError> {
        let path = self.locate(path_hint)?;
        debug!("Loading vitals config from {}", path.display());
        let canonical = canonicalize(&path)?;
        self.load_layer(&canonical, &ConfigChain::default())
    }

    fn locate(&self, path_hint: Option<&Path>) -> Result<PathBuf, ConfigError> {
        if let Some(hint) = path_hint {
            return Ok(self.cwd.join(hint));
        }
        CONFIG_FILE_NAMES
            .iter()
            .map(|name| self.cwd.join(name))
            .find(|candidate| candidate.is_file())
            .ok_or_else(|| ConfigError::NotFound(self.cwd.clone()))
    }

    fn load_layer(&self, path: &Path, chain: &ConfigChain) -> Result<Map<String, Value>, ConfigError> {
        let chain = chain.enter(path)?;
        let mut values = load_file(path)?;

        let Some(reference) = values.get(EXTENDS).cloned() else {
            return Ok(values);
        };

        match self.extend(path, &reference, &chain) {
            Ok(parent) => {
                debug!("{} extends {reference}", path.display());
                let mut merged = Value::Object(parent);
                deep_merge(&mut merged, Value::Object(std::mem::take(&mut values)));
                if let Value::Object(map) = merged {
                    values = map;
                }
            }
            Err(e) => {
                warn!("Ignoring {EXTENDS} in {}: {e}", path.display());
                values.remove(EXTENDS);
            }
        }
        Ok(values)
    }

    fn extend(
        &self,
        from: &Path,
        reference: &Value,
        chain: &ConfigChain,
    ) -> Result<Map<String, Value>, ConfigError> {
        let reference = reference.as_str().ok_or_else(|| ConfigError::Parse {
            path: from.to_path_buf(),
            reason: format!("{EXTENDS} must be a string, found {reference}"),
        })?;
        let target = self.locate_extends(from, reference)?;
        let target = canonicalize(&target)?;
        self.load_layer(&target, chain)
    }

    fn locate_extends(&self, from: &Path, reference: &str) -> Result<PathBuf, ConfigError> {
        let mut bases = Vec::with_capacity(2);
        if let Some(dir) = from.parent() {
            bases.push(dir.join(reference));
        }
        bases.push(self.cwd.join(reference));

        bases
            .iter()
            .flat_map(|base| {
                std::iter::once(base.clone()).chain(EXTENDS_EXTENSIONS.iter().map(|ext| {
                    let mut with_ext = base.clone().into_os_string();
                    with_ext.push(".");
                    with_ext.push(ext);
                    PathBuf::from(with_ext)
                }))
            })
            .find(|candidate| candidate.is_file())
            .ok_or_else(|| ConfigError::ExtendsNotFound {
                reference: reference.to_string(),
                from: from.to_path_buf(),
            })
    }
}

fn canonicalize(path: &Path) -> Result<PathBuf, ConfigError> {
    fs::canonicalize(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })
}

/// Parses a single config file according to its extension.
pub fn load_file(path: &Path) -> Result<Map<String, Value>, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let parse_error = |reason: String| ConfigError::Parse {
        path: path.to_path_buf(),
        reason,
    };

    let value = match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => serde_json::from_str(&contents).map_err(|e| parse_error(e.to_string()))?,
        Some("js") => parse_js_module(&contents).map_err(parse_error)?,
        Some("yaml" | "yml") => {
            serde_yaml::from_str(&contents).map_err(|e| parse_error(e.to_string()))?
        }
        // extensionless files hold either a JSON document or KEY=VALUE lines
        _ if contents.trim_start().starts_with('{') => {
            serde_json::from_str(&contents).map_err(|e| parse_error(e.to_string()))?
        }
        _ => parse_env_style(&contents).map_err(parse_error)?,
    };

    match value {
        Value::Object(map) => Ok(map),
        _ => Err(ConfigError::NotAMapping(path.to_path_buf())),
    }
}

/// Accepts a JSON object literal, optionally exported as a module.
///
/// ```text
/// module.exports = { "reportingInterval": 500 };
/// export default { "reportingInterval": 500 };
/// ```
fn parse_js_module(contents: &str) -> Result<Value, String> {
    let body = contents.trim();
    let body = body
        .strip_prefix("module.exports")
        .and_then(|rest| rest.trim_start().strip_prefix('='))
        .or_else(|| body.strip_prefix("export default"))
        .unwrap_or(body)
        .trim();
    let body = body.strip_suffix(';').unwrap_or(body).trim_end();
    serde_json::from_str(body).map_err(|e| format!("unsupported module body: {e}"))
}

/// `KEY=VALUE` lines with dotted keys, values coerced with [`Primitive::parse`].
fn parse_env_style(contents: &str) -> Result<Value, String> {
    let mut flat = FlatMetrics::new();
    for (number, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (key, raw) = line
            .split_once('=')
            .ok_or_else(|| format!("line {}: expected KEY=VALUE", number + 1))?;
        let key = key.trim();
        if key.is_empty() {
            return Err(format!("line {}: empty key", number + 1));
        }
        if let Some(value) = Primitive::parse(unquote(raw.trim())).into_value() {
            flat.insert(key.to_string(), value);
        }
    }

    if flat.is_empty() {
        return Ok(Value::Object(Map::new()));
    }
    Ok(unflatten(&flat, DEFAULT_DELIMITER))
}

fn unquote(raw: &str) -> &str {
    for quote in ['"', '\''] {
        if let Some(inner) = raw
            .strip_prefix(quote)
            .and_then(|rest| rest.strip_suffix(quote))
        {
            return inner;
        }
    }
    raw
}

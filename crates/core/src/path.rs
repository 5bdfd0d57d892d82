//! Symbolic path resolution.
//!
//! Step arguments refer to shared locations through `${name}` placeholders instead of hard-coded
//! paths. An [`ExecutionContext`] maps those names to concrete values for a single run and
//! [`resolve`] performs the substitution.
//!
//! Template syntax:
//! - `${name}` is replaced by the value bound to `name`
//! - `$$` produces a literal `$`
//! - any other `$` is kept as is

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{DefinitionError, Result};

/// Base working directory of the run.
pub const WORKDIR: &str = "workdir";
/// Shared target directory where toolchains place their outputs.
pub const TARGET_DIR: &str = "target_dir";
/// The pipeline's declared artifact, already resolved.
pub const ARTIFACT: &str = "artifact";

/// Symbols every run binds.
pub const WELL_KNOWN_SYMBOLS: [&str; 3] = [WORKDIR, TARGET_DIR, ARTIFACT];

/// Mapping from symbolic names to concrete values, owned by a single run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionContext {
    symbols: BTreeMap<String, String>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// A context where each name is declared but bound to an empty value.
    ///
    /// Used for validation: resolving against it proves every placeholder is known
    /// without requiring any real location.
    pub fn declared<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            symbols: names
                .into_iter()
                .map(|name| (name.into(), String::new()))
                .collect(),
        }
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.symbols.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.symbols.get(name).map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.symbols.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.symbols.keys().map(String::as_str)
    }

    pub fn workdir(&self) -> Option<&Path> {
        self.get(WORKDIR)
            .filter(|dir| !dir.is_empty())
            .map(Path::new)
    }

    pub fn resolve(&self, template: &str) -> Result<String> {
        resolve(template, self)
    }

    /// Resolve a template into a path. Relative results are anchored at `workdir` when bound.
    pub fn resolve_path(&self, template: &str) -> Result<PathBuf> {
        let resolved = PathBuf::from(self.resolve(template)?);
        match self.workdir() {
            Some(workdir) if resolved.is_relative() => Ok(workdir.join(resolved)),
            _ => Ok(resolved),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Segment<'a> {
    Text(&'a str),
    Symbol(&'a str),
}

fn segments(template: &str) -> Result<Vec<Segment<'_>>> {
    let mut out = Vec::new();
    let mut rest = template;

    while let Some(pos) = rest.find('$') {
        let (text, tail) = rest.split_at(pos);
        if !text.is_empty() {
            out.push(Segment::Text(text));
        }

        let after = &tail[1..];
        if let Some(remaining) = after.strip_prefix('$') {
            out.push(Segment::Text("$"));
            rest = remaining;
        } else if let Some(body) = after.strip_prefix('{') {
            let end = body
                .find('}')
                .ok_or_else(|| DefinitionError::UnterminatedPlaceholder {
                    template: template.to_string(),
                })?;
            out.push(Segment::Symbol(&body[..end]));
            rest = &body[end + 1..];
        } else {
            out.push(Segment::Text("$"));
            rest = after;
        }
    }

    if !rest.is_empty() {
        out.push(Segment::Text(rest));
    }

    Ok(out)
}

/// Substitute every placeholder in `template` with its value from `context`.
///
/// The first unknown placeholder aborts resolution with [`DefinitionError::UnresolvedPath`].
pub fn resolve(template: &str, context: &ExecutionContext) -> Result<String> {
    let mut resolved = String::with_capacity(template.len());

    for segment in segments(template)? {
        match segment {
            Segment::Text(text) => resolved.push_str(text),
            Segment::Symbol(name) => {
                let value = context
                    .get(name)
                    .ok_or_else(|| DefinitionError::UnresolvedPath {
                        token: name.to_string(),
                    })?;
                resolved.push_str(value);
            }
        }
    }

    Ok(resolved)
}

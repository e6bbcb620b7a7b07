//! Trace session configuration
//!
//! A [`TraceConfig`] is built once before a session starts and never mutated
//! while tracing. It can be assembled in code with the `with_*` methods or
//! loaded from a TOML file.
//!
//! # Example TOML
//! ```toml
//! include = ["*/app/*.py"]
//! exclude_functions = ["__repr__"]
//! enable_var_trace = true
//! include_stdlibs = ["json"]
//!
//! [line_ranges]
//! "app/core.py" = [[10, 40]]
//!
//! [start_trigger]
//! file = "app/main.py"
//! line = 20
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::ConfigError;
use crate::matcher::PatternMatcher;

/// Default upper bound on recorded call nesting per thread
pub const DEFAULT_MAX_CALL_DEPTH: usize = 512;

/// Inclusive line range `[start, end]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineRange(pub u32, pub u32);

impl LineRange {
    pub fn contains(&self, line: u32) -> bool {
        self.0 <= line && line <= self.1
    }
}

/// Location that turns on deferred capture once execution reaches it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartTrigger {
    pub file: String,
    pub line: u32,
}

impl StartTrigger {
    pub fn new(file: impl Into<String>, line: u32) -> Self {
        Self {
            file: file.into(),
            line,
        }
    }

    /// True if `file:line` is the trigger location. A relative trigger file
    /// matches any path ending with the same components.
    pub fn matches(&self, file: &str, line: u32) -> bool {
        line == self.line && (file == self.file || Path::new(file).ends_with(&self.file))
    }
}

/// Immutable configuration for one trace session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TraceConfig {
    /// Glob patterns selecting code of interest (empty = everything not rejected)
    pub include: Vec<String>,
    /// Function names never recorded, even in matched files
    pub exclude_functions: Vec<String>,
    /// Expressions evaluated on every recorded line instead of local diffing
    pub capture_expressions: Vec<String>,
    /// Per-file line filters for LineEvents
    pub line_ranges: BTreeMap<String, Vec<LineRange>>,
    /// Record changed local variables on each line
    pub enable_var_trace: bool,
    /// Reject files under the runtime's standard library / package roots
    pub ignore_system_paths: bool,
    /// Standard library and package roots of the host runtime
    pub system_roots: Vec<PathBuf>,
    /// Top-level stdlib packages kept even when system paths are ignored
    pub include_stdlibs: Vec<String>,
    /// Reject the tracer's own source files before any other rule
    pub ignore_self: bool,
    /// Path prefixes that belong to the tracer implementation
    pub self_paths: Vec<String>,
    /// Deferred activation location
    pub start_trigger: Option<StartTrigger>,
    /// Base directory for relative display paths
    pub source_base_dir: Option<PathBuf>,
    /// Calls nested deeper than this are not recorded
    pub max_call_depth: usize,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            include: Vec::new(),
            exclude_functions: Vec::new(),
            capture_expressions: Vec::new(),
            line_ranges: BTreeMap::new(),
            enable_var_trace: false,
            ignore_system_paths: true,
            system_roots: Vec::new(),
            include_stdlibs: Vec::new(),
            ignore_self: true,
            self_paths: Vec::new(),
            start_trigger: None,
            source_base_dir: None,
            max_call_depth: DEFAULT_MAX_CALL_DEPTH,
        }
    }
}

impl TraceConfig {
    /// Load configuration from a TOML file
    ///
    /// # Errors
    /// Returns error if the file cannot be read, is not valid TOML, or fails
    /// [`TraceConfig::validate`].
    pub fn from_toml<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).with_context(|| {
            format!("Failed to read trace config: {}", path.as_ref().display())
        })?;
        Self::from_toml_str(&content)
            .with_context(|| format!("Invalid trace config: {}", path.as_ref().display()))
    }

    /// Parse configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: TraceConfig =
            toml::from_str(content).context("Failed to parse TOML trace config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_include(mut self, pattern: impl Into<String>) -> Self {
        self.include.push(pattern.into());
        self
    }

    pub fn with_excluded_function(mut self, name: impl Into<String>) -> Self {
        self.exclude_functions.push(name.into());
        self
    }

    pub fn with_capture(mut self, expression: impl Into<String>) -> Self {
        self.capture_expressions.push(expression.into());
        self
    }

    pub fn with_line_range(mut self, file: impl Into<String>, start: u32, end: u32) -> Self {
        self.line_ranges
            .entry(file.into())
            .or_default()
            .push(LineRange(start, end));
        self
    }

    pub fn with_var_trace(mut self, enabled: bool) -> Self {
        self.enable_var_trace = enabled;
        self
    }

    pub fn with_system_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.system_roots.push(root.into());
        self
    }

    pub fn with_stdlib(mut self, package: impl Into<String>) -> Self {
        self.include_stdlibs.push(package.into());
        self
    }

    pub fn with_self_path(mut self, prefix: impl Into<String>) -> Self {
        self.self_paths.push(prefix.into());
        self
    }

    pub fn with_start_trigger(mut self, file: impl Into<String>, line: u32) -> Self {
        self.start_trigger = Some(StartTrigger::new(file, line));
        self
    }

    pub fn with_source_base_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.source_base_dir = Some(dir.into());
        self
    }

    pub fn with_ignore_system_paths(mut self, ignore: bool) -> Self {
        self.ignore_system_paths = ignore;
        self
    }

    pub fn with_max_call_depth(mut self, depth: usize) -> Self {
        self.max_call_depth = depth;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (file, ranges) in &self.line_ranges {
            if let Some(bad) = ranges.iter().find(|r| r.0 > r.1) {
                return Err(ConfigError::InvertedRange {
                    file: file.clone(),
                    start: bad.0,
                    end: bad.1,
                });
            }
        }

        if let Some(trigger) = &self.start_trigger {
            if trigger.file.trim().is_empty() {
                return Err(ConfigError::EmptyTriggerFile);
            }
            if trigger.line == 0 {
                return Err(ConfigError::ZeroTriggerLine);
            }
        }

        PatternMatcher::compile_patterns(&self.include)?;
        Ok(())
    }

    pub fn is_excluded_function(&self, name: &str) -> bool {
        self.exclude_functions.iter().any(|f| f == name)
    }

    /// Whether a LineEvent at `file:line` passes the configured line ranges.
    /// Files without configured ranges are unrestricted.
    pub fn allows_line(&self, file: &str, line: u32) -> bool {
        let path = Path::new(file);
        let ranges = self
            .line_ranges
            .iter()
            .find(|(key, _)| key.as_str() == file || path.ends_with(key.as_str()));
        match ranges {
            Some((_, ranges)) => ranges.iter().any(|r| r.contains(line)),
            None => true,
        }
    }

    /// Path shown in reports for `file`
    ///
    /// Relative to `source_base_dir` when the file lies inside it. Without a
    /// base dir, only the file name is kept (`pkg/__init__.py` for package
    /// initializers). Synthetic names like `<string>` are returned unchanged.
    pub fn display_path(&self, file: &str) -> String {
        if file.starts_with('<') && file.ends_with('>') {
            return file.to_string();
        }
        let path = Path::new(file);

        if let Some(base) = &self.source_base_dir {
            return match path.strip_prefix(base) {
                Ok(rel) => rel.to_string_lossy().into_owned(),
                Err(_) => file.to_string(),
            };
        }

        let name = match path.file_name() {
            Some(name) => name.to_string_lossy().into_owned(),
            None => return file.to_string(),
        };
        if name == "__init__.py" {
            if let Some(pkg) = path.parent().and_then(Path::file_name) {
                return format!("{}/{}", pkg.to_string_lossy(), name);
            }
        }
        name
    }
}

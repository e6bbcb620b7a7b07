//! File inclusion decisions
//!
//! [`PatternMatcher`] is a pure function of the [`TraceConfig`]: given a
//! source path it answers "is this code of interest?". It holds no cache;
//! memoization lives in [`crate::filter::EventFilter`].
//!
//! Rules, in order:
//! 1. `ignore_self`: paths under one of the tracer's own prefixes are rejected,
//!    as are synthetic names (`<string>`, `<frozen ...>`) and `sitecustomize`.
//! 2. `ignore_system_paths`: paths under a system root (or inside a
//!    `site-packages`/`dist-packages` directory) are rejected unless their
//!    top-level package is in `include_stdlibs`.
//! 3. An include glob matches → accept. No include globs → accept.
//! 4. Otherwise reject.

use regex::Regex;
use std::path::{Component, Path, PathBuf};

use crate::config::TraceConfig;
use crate::error::MatcherError;

const PACKAGE_DIRS: [&str; 2] = ["site-packages", "dist-packages"];

/// Compiled inclusion rules for one session
#[derive(Debug, Clone)]
pub struct PatternMatcher {
    include: Vec<Regex>,
    /// Patterns that failed to compile; they never match
    rejected_patterns: Vec<String>,
    ignore_self: bool,
    self_paths: Vec<PathBuf>,
    ignore_system_paths: bool,
    system_roots: Vec<PathBuf>,
    include_stdlibs: Vec<String>,
}

impl PatternMatcher {
    /// Build a matcher from a config.
    ///
    /// Malformed include globs are logged once here and then behave as
    /// patterns that match nothing.
    pub fn new(config: &TraceConfig) -> Self {
        let mut include = Vec::with_capacity(config.include.len());
        let mut rejected_patterns = Vec::new();
        for pattern in &config.include {
            match glob_to_regex(pattern) {
                Ok(re) => include.push(re),
                Err(e) => {
                    tracing::warn!("Ignoring include pattern: {}", e);
                    rejected_patterns.push(pattern.clone());
                }
            }
        }

        Self {
            include,
            rejected_patterns,
            ignore_self: config.ignore_self,
            self_paths: config
                .self_paths
                .iter()
                .filter_map(|p| normalize_path(p).ok())
                .collect(),
            ignore_system_paths: config.ignore_system_paths,
            system_roots: config
                .system_roots
                .iter()
                .filter_map(|p| normalize_path(&p.to_string_lossy()).ok())
                .collect(),
            include_stdlibs: config.include_stdlibs.clone(),
        }
    }

    /// Compile every glob, failing on the first malformed one
    pub fn compile_patterns(patterns: &[String]) -> Result<Vec<Regex>, MatcherError> {
        patterns.iter().map(|p| glob_to_regex(p)).collect()
    }

    /// Patterns dropped at construction because they did not compile
    pub fn rejected_patterns(&self) -> &[String] {
        &self.rejected_patterns
    }

    /// Decide inclusion; any failure means "no match"
    pub fn matches(&self, file: &str) -> bool {
        self.try_matches(file).unwrap_or(false)
    }

    /// Decide inclusion, surfacing path normalization failures
    pub fn try_matches(&self, file: &str) -> Result<bool, MatcherError> {
        if self.ignore_self && self.is_self_or_synthetic(file) {
            return Ok(false);
        }

        let path = normalize_path(file)?;

        if self.ignore_self && self.self_paths.iter().any(|p| path.starts_with(p)) {
            return Ok(false);
        }

        if self.ignore_system_paths {
            if let Some(package) = self.system_package(&path) {
                if !self.include_stdlibs.iter().any(|s| *s == package) {
                    return Ok(false);
                }
            }
        }

        if self.include.is_empty() && self.rejected_patterns.is_empty() {
            return Ok(true);
        }

        let posix = to_posix(&path);
        Ok(self.include.iter().any(|re| re.is_match(&posix)))
    }

    fn is_self_or_synthetic(&self, file: &str) -> bool {
        if file.starts_with('<') && file.ends_with('>') {
            return true;
        }
        matches!(
            Path::new(file).file_stem().and_then(|s| s.to_str()),
            Some("sitecustomize")
        )
    }

    /// Top-level package name if `path` is a system path, `None` otherwise
    fn system_package(&self, path: &Path) -> Option<String> {
        for root in &self.system_roots {
            if let Ok(rel) = path.strip_prefix(root) {
                return Some(top_level_package(rel));
            }
        }

        let components: Vec<_> = path.components().collect();
        for (i, component) in components.iter().enumerate() {
            if let Component::Normal(name) = component {
                if PACKAGE_DIRS.iter().any(|d| name.to_str() == Some(d)) {
                    let rest: PathBuf = components[i + 1..].iter().collect();
                    return Some(top_level_package(&rest));
                }
            }
        }
        None
    }
}

/// First component of a root-relative path, without a module extension
fn top_level_package(rel: &Path) -> String {
    let first = match rel.components().next() {
        Some(Component::Normal(name)) => Path::new(name),
        _ => return String::new(),
    };
    if rel.components().count() == 1 {
        // A single module file such as `os.py`
        first
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    } else {
        first.to_string_lossy().into_owned()
    }
}

/// Lexically normalize a path: drop `.`, fold `..`, collapse separators
pub fn normalize_path(file: &str) -> Result<PathBuf, MatcherError> {
    if file.is_empty() || file.contains('\0') {
        return Err(MatcherError::UnreadablePath(file.to_string()));
    }

    let mut out = PathBuf::new();
    for component in Path::new(file).components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                let popped = matches!(out.components().next_back(), Some(Component::Normal(_)))
                    && out.pop();
                if !popped && !out.has_root() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    Ok(out)
}

fn to_posix(path: &Path) -> String {
    let s = path.to_string_lossy();
    if std::path::MAIN_SEPARATOR == '/' {
        s.into_owned()
    } else {
        s.replace(std::path::MAIN_SEPARATOR, "/")
    }
}

/// Translate a shell glob into an anchored regex.
///
/// `*` and `**` match any run of characters including `/`, `?` matches one
/// character, `[...]` is a character class (`[!...]` negated).
pub fn glob_to_regex(pattern: &str) -> Result<Regex, MatcherError> {
    let invalid = |reason: &str| MatcherError::InvalidPattern {
        pattern: pattern.to_string(),
        reason: reason.to_string(),
    };

    let mut re = String::with_capacity(pattern.len() * 2 + 2);
    re.push('^');
    let chars: Vec<char> = pattern.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '*' => {
                while i + 1 < chars.len() && chars[i + 1] == '*' {
                    i += 1;
                }
                re.push_str(".*");
            }
            '?' => re.push('.'),
            '[' => {
                let mut j = i + 1;
                if chars.get(j) == Some(&'!') {
                    j += 1;
                }
                // A leading `]` is literal
                if chars.get(j) == Some(&']') {
                    j += 1;
                }
                let close = match chars[j.min(chars.len())..].iter().position(|c| *c == ']') {
                    Some(off) => j + off,
                    None => return Err(invalid("unclosed character class")),
                };
                let mut body = &chars[i + 1..close];
                re.push('[');
                if body.first() == Some(&'!') {
                    re.push('^');
                    body = &body[1..];
                }
                if body.is_empty() {
                    return Err(invalid("empty character class"));
                }
                for &c in body {
                    if matches!(c, '\\' | '[' | ']' | '^' | '&' | '~') {
                        re.push('\\');
                    }
                    re.push(c);
                }
                re.push(']');
                i = close;
            }
            c => re.push_str(&regex::escape(&c.to_string())),
        }
        i += 1;
    }
    re.push('$');

    Regex::new(&re).map_err(|e| invalid(&e.to_string()))
}

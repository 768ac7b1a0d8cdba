// ABOUTME: Ordered, deduplicated ssh_config sources and the loaded lookup store.
// ABOUTME: Rewrites home-relative Include lines before decoding each source.

use super::defaults::default_value;
use super::expand::expand_path;
use super::parser::Document;
use crate::error::{Error, Result};
use regex::{Captures, Regex};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

/// Paths consulted when the caller does not clear the source list.
pub const DEFAULT_CONFIG_PATHS: [&str; 2] = ["~/.ssh/config", "/etc/ssh/ssh_config"];

static INCLUDE_TILDE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(\s*include\s+)~(.+)$").expect("include tilde pattern is valid")
});

static INCLUDE_BARE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(\s*include\s+)([^~/\s].*)$").expect("include bare pattern is valid")
});

/// One configuration document before decoding.
#[derive(Debug, Clone)]
pub struct ConfigSource {
    path: PathBuf,
    content: Vec<u8>,
    /// Default files are skipped, not fatal, when they fail to decode.
    optional: bool,
}

impl ConfigSource {
    /// Read a config file. The path is expanded against `cwd` and `home`.
    pub fn from_path(path: &str, cwd: &Path, home: &Path) -> Result<Self> {
        let path = expand_path(path, cwd, home);
        let content = std::fs::read(&path).map_err(|source| Error::ReadConfig {
            path: path.clone(),
            source,
        })?;
        Ok(Self {
            path,
            content,
            optional: false,
        })
    }

    /// Wrap in-memory config data. Its origin is a synthetic path under
    /// `cwd` named after the SHA-256 of the content, so identical data
    /// deduplicates like identical files.
    pub fn from_data(content: impl Into<Vec<u8>>, cwd: &Path) -> Self {
        let content = content.into();
        let digest = Sha256::digest(&content);
        Self {
            path: cwd.join(format!("{digest:x}")),
            content,
            optional: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn decode(&self, home: &Path) -> Result<Document> {
        let text = std::str::from_utf8(&self.content).map_err(|e| Error::Parse {
            path: self.path.clone(),
            line: 0,
            message: format!("config is not valid UTF-8: {e}"),
        })?;
        let rewritten = rewrite_includes(text, home);
        Document::parse(&rewritten, &self.path, home)
    }
}

/// Ordered list of sources, highest priority first.
#[derive(Debug, Clone, Default)]
pub struct SourceList {
    sources: Vec<ConfigSource>,
}

impl SourceList {
    /// The default search chain, keeping only files that exist.
    pub fn defaults(cwd: &Path, home: &Path) -> Result<Self> {
        let mut list = Self::default();
        for candidate in DEFAULT_CONFIG_PATHS {
            let path = expand_path(candidate, cwd, home);
            if std::fs::symlink_metadata(&path).is_err() {
                continue;
            }
            let content = std::fs::read(&path).map_err(|source| Error::ReadConfig {
                path: path.clone(),
                source,
            })?;
            list.append(ConfigSource {
                path,
                content,
                optional: true,
            });
        }
        Ok(list)
    }

    /// Insert at the highest priority.
    pub fn unshift(&mut self, source: ConfigSource) {
        self.sources.insert(0, source);
        self.dedup();
    }

    /// Insert at the lowest priority.
    pub fn append(&mut self, source: ConfigSource) {
        self.sources.push(source);
        self.dedup();
    }

    pub fn clear(&mut self) {
        self.sources.clear();
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.sources.iter().map(ConfigSource::path)
    }

    /// Keep the first occurrence of every origin path.
    fn dedup(&mut self) {
        let mut seen = std::collections::HashSet::new();
        self.sources.retain(|s| seen.insert(s.path.clone()));
    }

    /// Decode every source once, producing the read-only lookup store.
    ///
    /// A default file that fails to decode is skipped with a warning;
    /// caller-supplied sources must decode.
    pub fn load(&self, home: &Path) -> Result<ConfigStore> {
        let mut sources = Vec::with_capacity(self.sources.len());
        for source in &self.sources {
            match source.decode(home) {
                Ok(document) => sources.push(LoadedSource {
                    path: source.path.clone(),
                    document,
                }),
                Err(e) if source.optional => {
                    tracing::warn!("Skipping {}: {}", source.path.display(), e);
                }
                Err(e) => return Err(e),
            }
        }
        tracing::debug!("Loaded {} ssh_config source(s)", sources.len());
        Ok(ConfigStore { sources })
    }
}

#[derive(Debug, Clone)]
struct LoadedSource {
    path: PathBuf,
    document: Document,
}

/// Decoded sources answering pattern-matched lookups.
#[derive(Debug, Clone, Default)]
pub struct ConfigStore {
    sources: Vec<LoadedSource>,
}

impl ConfigStore {
    /// First non-empty value for `keyword` across the sources, falling back
    /// to the built-in default.
    pub fn get(&self, host: &str, keyword: &str) -> String {
        self.get_with_base(host, keyword).0
    }

    /// Like [`get`](Self::get), also returning the directory of the source
    /// that defined the value (`None` for built-in defaults).
    pub fn get_with_base(&self, host: &str, keyword: &str) -> (String, Option<PathBuf>) {
        for source in &self.sources {
            match source.document.get(host, keyword) {
                Some(value) if !value.is_empty() => {
                    let base = source.path.parent().map(Path::to_path_buf);
                    return (value.to_string(), base);
                }
                _ => {}
            }
        }
        (default_value(keyword).to_string(), None)
    }

    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.sources.iter().map(|s| s.path.as_path())
    }
}

/// Make `Include` targets absolute: `~/x` becomes `<home>/x` and a bare
/// relative name becomes `<home>/.ssh/<name>`.
pub fn rewrite_includes(text: &str, home: &Path) -> String {
    let home = home.to_string_lossy();
    let mut out = String::with_capacity(text.len());
    for line in text.lines() {
        let rewritten = if INCLUDE_TILDE.is_match(line) {
            INCLUDE_TILDE
                .replace(line, |caps: &Captures| format!("{}{}{}", &caps[1], home, &caps[2]))
                .into_owned()
        } else if INCLUDE_BARE.is_match(line) {
            INCLUDE_BARE
                .replace(line, |caps: &Captures| {
                    format!("{}{}/.ssh/{}", &caps[1], home, &caps[2])
                })
                .into_owned()
        } else {
            line.to_string()
        };
        out.push_str(&rewritten);
        out.push('\n');
    }
    out
}

// ABOUTME: Decoder for the ssh_config(5) grammar subset used by sshc.
// ABOUTME: Produces Host blocks with ordered entries and resolves Include files.

use super::pattern::{Pattern, list_matches};
use crate::error::{Error, Result};
use std::path::{Path, PathBuf};

/// Maximum nesting of `Include` directives before decoding gives up.
const MAX_INCLUDE_DEPTH: usize = 16;

/// A decoded ssh_config document.
#[derive(Debug, Clone, Default)]
pub struct Document {
    blocks: Vec<HostBlock>,
}

#[derive(Debug, Clone)]
struct HostBlock {
    patterns: Vec<Pattern>,
    entries: Vec<Entry>,
}

#[derive(Debug, Clone)]
enum Entry {
    Setting { keyword: String, value: String },
    Include(Vec<Document>),
}

impl HostBlock {
    fn implicit() -> Self {
        Self {
            patterns: vec![Pattern::new("*")],
            entries: Vec::new(),
        }
    }
}

/// Decoding context shared by a document and everything it includes.
struct Decoder<'a> {
    home: &'a Path,
    depth: usize,
}

impl Document {
    /// Decode `text` that was read from `origin`.
    ///
    /// `home` is used to resolve `Include` targets that are not absolute.
    pub fn parse(text: &str, origin: &Path, home: &Path) -> Result<Self> {
        Decoder { home, depth: 0 }.decode(text, origin)
    }

    /// First value for `keyword` in a block matching `host`, top-down.
    pub fn get(&self, host: &str, keyword: &str) -> Option<&str> {
        self.blocks
            .iter()
            .filter(|block| list_matches(&block.patterns, host))
            .find_map(|block| lookup_entries(&block.entries, host, keyword))
    }
}

fn lookup_entries<'d>(entries: &'d [Entry], host: &str, keyword: &str) -> Option<&'d str> {
    for entry in entries {
        match entry {
            Entry::Setting { keyword: k, value } if k.eq_ignore_ascii_case(keyword) => {
                return Some(value.as_str());
            }
            Entry::Setting { .. } => {}
            Entry::Include(documents) => {
                if let Some(value) = documents.iter().find_map(|doc| doc.get(host, keyword)) {
                    return Some(value);
                }
            }
        }
    }
    None
}

impl Decoder<'_> {
    fn decode(&self, text: &str, origin: &Path) -> Result<Document> {
        let parse_error = |line: usize, message: String| Error::Parse {
            path: origin.to_path_buf(),
            line,
            message,
        };

        let mut blocks = vec![HostBlock::implicit()];

        for (index, raw) in text.lines().enumerate() {
            let line_no = index + 1;
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let (keyword, rest) = split_keyword(line);
            let keyword_lower = keyword.to_ascii_lowercase();
            if rest.is_empty() {
                return Err(parse_error(
                    line_no,
                    format!("missing value for {keyword}"),
                ));
            }

            match keyword_lower.as_str() {
                "host" => {
                    let patterns = split_args(strip_comment(rest))
                        .map_err(|m| parse_error(line_no, m))?;
                    if patterns.is_empty() {
                        return Err(parse_error(line_no, "Host without patterns".to_string()));
                    }
                    blocks.push(HostBlock {
                        patterns: patterns.iter().map(|p| Pattern::new(p)).collect(),
                        entries: Vec::new(),
                    });
                }
                "match" => {
                    return Err(parse_error(
                        line_no,
                        "Match directives are not supported".to_string(),
                    ));
                }
                "include" => {
                    let targets = split_args(strip_comment(rest))
                        .map_err(|m| parse_error(line_no, m))?;
                    let documents = self
                        .include(&targets)
                        .map_err(|e| match e {
                            Error::Parse { .. } => e,
                            other => parse_error(line_no, other.to_string()),
                        })?;
                    if let Some(block) = blocks.last_mut() {
                        block.entries.push(Entry::Include(documents));
                    }
                }
                // The command line is handed to the shell untouched.
                "proxycommand" => {
                    if let Some(block) = blocks.last_mut() {
                        block.entries.push(Entry::Setting {
                            keyword: keyword.to_string(),
                            value: rest.to_string(),
                        });
                    }
                }
                _ => {
                    let value = unquote(strip_comment(rest)).map_err(|m| parse_error(line_no, m))?;
                    if value.is_empty() {
                        return Err(parse_error(
                            line_no,
                            format!("missing value for {keyword}"),
                        ));
                    }
                    if let Some(block) = blocks.last_mut() {
                        block.entries.push(Entry::Setting {
                            keyword: keyword.to_string(),
                            value,
                        });
                    }
                }
            }
        }

        Ok(Document { blocks })
    }

    fn include(&self, targets: &[String]) -> Result<Vec<Document>> {
        if self.depth >= MAX_INCLUDE_DEPTH {
            return Err(Error::Parse {
                path: PathBuf::from(targets.join(" ")),
                line: 0,
                message: format!("Include nested deeper than {MAX_INCLUDE_DEPTH} levels"),
            });
        }

        let nested = Decoder {
            home: self.home,
            depth: self.depth + 1,
        };

        let mut documents = Vec::new();
        for target in targets {
            let path = self.include_path(target);
            let text = match std::fs::read_to_string(&path) {
                Ok(text) => text,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    tracing::debug!("Include target {} does not exist, skipping", path.display());
                    continue;
                }
                Err(source) => return Err(Error::ReadConfig { path, source }),
            };
            documents.push(nested.decode(&text, &path)?);
        }
        Ok(documents)
    }

    /// Absolute paths are used as-is, `~` is the home directory, anything
    /// else lives under `~/.ssh`.
    fn include_path(&self, target: &str) -> PathBuf {
        if let Some(rest) = target.strip_prefix('~') {
            self.home.join(rest.trim_start_matches('/'))
        } else if target.starts_with('/') {
            PathBuf::from(target)
        } else {
            self.home.join(".ssh").join(target)
        }
    }
}

/// Split a line into its keyword and the raw remainder, accepting both
/// `Key Value` and `Key=Value` forms.
fn split_keyword(line: &str) -> (&str, &str) {
    let end = line
        .find(|c: char| c.is_whitespace() || c == '=')
        .unwrap_or(line.len());
    let (keyword, rest) = line.split_at(end);
    let rest = rest.trim_start();
    let rest = rest.strip_prefix('=').unwrap_or(rest);
    (keyword, rest.trim())
}

/// Cut a trailing `#` comment that follows whitespace outside double quotes.
fn strip_comment(value: &str) -> &str {
    let mut quoted = false;
    let mut after_space = false;
    for (i, c) in value.char_indices() {
        match c {
            '"' => quoted = !quoted,
            '#' if after_space && !quoted => return value[..i].trim_end(),
            _ => {}
        }
        after_space = c.is_whitespace();
    }
    value
}

/// Remove double quotes wrapping the whole value. Quotes elsewhere are kept.
fn unquote(value: &str) -> std::result::Result<String, String> {
    if value.matches('"').count() % 2 != 0 {
        return Err("unterminated quoted value".to_string());
    }
    let inner = value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .filter(|inner| !inner.contains('"'));
    Ok(inner.unwrap_or(value).to_string())
}

/// Split on whitespace, keeping double-quoted runs together.
fn split_args(value: &str) -> std::result::Result<Vec<String>, String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut in_arg = false;
    for c in value.chars() {
        match c {
            '"' => {
                quoted = !quoted;
                in_arg = true;
            }
            c if c.is_whitespace() && !quoted => {
                if in_arg {
                    args.push(std::mem::take(&mut current));
                    in_arg = false;
                }
            }
            c => {
                current.push(c);
                in_arg = true;
            }
        }
    }
    if quoted {
        return Err("unterminated quoted value".to_string());
    }
    if in_arg {
        args.push(current);
    }
    Ok(args)
}

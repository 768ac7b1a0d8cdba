// ABOUTME: Glob-style host pattern matching for Host blocks and identity scopes.
// ABOUTME: Supports `*`, `?`, and leading `!` negation in pattern lists.

/// A single entry of a `Host` pattern list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pattern {
    glob: String,
    negated: bool,
}

impl Pattern {
    pub fn new(text: &str) -> Self {
        match text.strip_prefix('!') {
            Some(rest) => Self {
                glob: rest.to_string(),
                negated: true,
            },
            None => Self {
                glob: text.to_string(),
                negated: false,
            },
        }
    }

    pub fn is_negated(&self) -> bool {
        self.negated
    }

    fn matches(&self, host: &str) -> bool {
        glob_match(&self.glob, host)
    }
}

/// Returns true when `host` is selected by the pattern list.
///
/// Any matching negated pattern excludes the host outright; otherwise at
/// least one positive pattern has to match.
pub fn list_matches(patterns: &[Pattern], host: &str) -> bool {
    let mut matched = false;
    for pattern in patterns {
        if pattern.matches(host) {
            if pattern.is_negated() {
                return false;
            }
            matched = true;
        }
    }
    matched
}

/// Match `text` against a glob where `*` is any run of characters and `?`
/// is exactly one character.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();

    let (mut pi, mut ti) = (0, 0);
    // Position of the last `*` seen and the text index it was tried against.
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ti));
            pi += 1;
        } else if let Some((star_pi, star_ti)) = star {
            pi = star_pi + 1;
            ti = star_ti + 1;
            star = Some((star_pi, star_ti + 1));
        } else {
            return false;
        }
    }

    p[pi..].iter().all(|&c| c == '*')
}

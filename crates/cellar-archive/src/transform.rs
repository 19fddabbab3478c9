//! Entry-path rewriting applied while an archive is written.

/// Replace a leading path prefix of archive member names.
///
/// `from` only matches at a component boundary: `game` rewrites `game` and
/// `game/x` but not `gamedata`. Symlink targets are never rewritten.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformRule {
    pub from: String,
    pub to:   String,
}

impl TransformRule {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to:   to.into(),
        }
    }

    /// The rewritten name, or `None` when the rule does not match.
    pub fn apply(&self, name: &str) -> Option<String> {
        let rest = name.strip_prefix(self.from.as_str())?;
        if rest.is_empty() || rest.starts_with('/') {
            Some(format!("{}{}", self.to, rest))
        } else {
            None
        }
    }

    /// GNU tar `--transform` expression with the same semantics as
    /// [`TransformRule::apply`].
    pub fn to_tar_expression(&self) -> String {
        format!(
            "s,^{}\\(/\\|$\\),{}\\1,S",
            escape_pattern(&self.from),
            escape_replacement(&self.to)
        )
    }
}

/// Run `name` through every rule in order, each seeing the previous output.
pub fn apply_transforms(rules: &[TransformRule], name: &str) -> String {
    rules.iter().fold(name.to_string(), |current, rule| {
        rule.apply(&current).unwrap_or(current)
    })
}

fn escape_pattern(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '\\' | '.' | '[' | ']' | '*' | '^' | '$' | ',') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn escape_replacement(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '\\' | '&' | ',') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

use crate::errors::{MeridianError, Result};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

/// Flags accepted in a mount point expression. `g` and `y` are accepted and dropped.
const SUPPORTED_FLAGS: &[char] = &['i', 'm', 's', 'u', 'x'];
const IGNORED_FLAGS: &[char] = &['g', 'y'];

/// Canonical mount point triple as persisted on a resolver.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MountPoint {
    pub expression: String,
    pub regex: String,
    pub options: String,
}

/// Any of the shapes a caller may hand in for a mount point.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MountPointSpec {
    /// `/regex/flags` literal or a bare regex source
    Expression(String),
    Parts {
        #[serde(default)]
        expression: Option<String>,
        #[serde(default)]
        regex: Option<String>,
        #[serde(default)]
        options: Option<String>,
    },
}

impl From<&str> for MountPointSpec {
    fn from(value: &str) -> Self {
        MountPointSpec::Expression(value.to_string())
    }
}

impl From<MountPoint> for MountPointSpec {
    fn from(value: MountPoint) -> Self {
        MountPointSpec::Parts {
            expression: Some(value.expression),
            regex: Some(value.regex),
            options: Some(value.options),
        }
    }
}

impl MountPointSpec {
    /// Normalize into the canonical triple and check that it compiles.
    pub fn normalize(&self) -> Result<MountPoint> {
        let mount = match self {
            MountPointSpec::Expression(expression) => MountPoint::parse(expression)?,
            MountPointSpec::Parts {
                regex: Some(regex),
                options,
                ..
            } => MountPoint::from_parts(regex, options.as_deref().unwrap_or(""))?,
            MountPointSpec::Parts {
                expression: Some(expression),
                regex: None,
                ..
            } => MountPoint::parse(expression)?,
            MountPointSpec::Parts { .. } => {
                return Err(MeridianError::InvalidMountPoint(
                    "neither expression nor regex given".to_string(),
                ))
            }
        };
        mount.compile()?;
        Ok(mount)
    }
}

impl MountPoint {
    /// Parse `/regex/flags`. Anything else is taken as a bare regex source.
    pub fn parse(expression: &str) -> Result<Self> {
        if expression.is_empty() {
            return Err(MeridianError::InvalidMountPoint(
                "empty expression".to_string(),
            ));
        }

        if let Some(rest) = expression.strip_prefix('/') {
            if let Some(idx) = rest.rfind('/') {
                let flags = &rest[idx + 1..];
                if flags
                    .chars()
                    .all(|c| SUPPORTED_FLAGS.contains(&c) || IGNORED_FLAGS.contains(&c))
                {
                    return Self::from_parts(&rest[..idx], flags);
                }
            }
        }

        Self::from_parts(expression, "")
    }

    pub fn from_parts(regex: &str, options: &str) -> Result<Self> {
        if regex.is_empty() {
            return Err(MeridianError::InvalidMountPoint("empty regex".to_string()));
        }
        let options = normalize_flags(options)?;
        Ok(Self {
            expression: format!("/{regex}/{options}"),
            regex: regex.to_string(),
            options,
        })
    }

    pub fn compile(&self) -> Result<Regex> {
        let has = |flag: char| self.options.contains(flag);
        RegexBuilder::new(&self.regex)
            .case_insensitive(has('i'))
            .multi_line(has('m'))
            .dot_matches_new_line(has('s'))
            .ignore_whitespace(has('x'))
            .build()
            .map_err(|e| MeridianError::InvalidMountPoint(format!("{}: {e}", self.expression)))
    }

    pub fn is_match(&self, candidate: &str) -> Result<bool> {
        Ok(self.compile()?.is_match(candidate))
    }
}

fn normalize_flags(options: &str) -> Result<String> {
    let mut flags: Vec<char> = Vec::new();
    for c in options.chars() {
        if IGNORED_FLAGS.contains(&c) {
            continue;
        }
        if !SUPPORTED_FLAGS.contains(&c) {
            return Err(MeridianError::InvalidMountPoint(format!(
                "unsupported flag `{c}`"
            )));
        }
        if !flags.contains(&c) {
            flags.push(c);
        }
    }
    flags.sort_unstable();
    Ok(flags.into_iter().collect())
}

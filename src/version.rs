//! Alpine-style version parsing, ordering and dependency atoms.
//!
//! Versions look like `1.2.3b_alpha4_p5-r6`: dotted numbers, an optional
//! lowercase letter, an optional pre-release tag (`_alpha`, `_beta`, `_pre`,
//! `_rc`), an optional post-release tag (`_cvs`, `_svn`, `_git`, `_hg`,
//! `_p`) and an optional build revision (`-rN`). The total order over these
//! follows apk-tools: a missing pre-release tag sorts *above* any present
//! one (no tag means "release"), while a missing post-release tag sorts
//! *below* any present one (`1.0_p2 > 1.0`).
//!
//! Dependency atoms are `name[<op>version][@pin]`, with a leading `!`
//! marking a conflict. Misordered token streams degrade to an opaque name
//! with no constraint, which is what the reference resolver does.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

static VERSION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^([0-9]+)((?:\.[0-9]+)*)([a-z]?)(?:(_alpha|_beta|_pre|_rc)([0-9]*))?(?:(_cvs|_svn|_git|_hg|_p)([0-9]*))?(?:-r([0-9]+))?$",
    )
    .expect("version regex")
});

static ATOM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([^@=><~]+)(?:([=><~]+)([^@]+?))?(?:@([a-zA-Z0-9]+))?$").expect("atom regex")
});

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("invalid version {0:?}, could not parse")]
    Version(String),

    #[error("invalid version {version:?}, component {part:?} is not a number")]
    Number { version: String, part: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum PreTag {
    Alpha,
    Beta,
    Pre,
    Rc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum PostTag {
    Cvs,
    Svn,
    Git,
    Hg,
    P,
}

/// A parsed Alpine-style version.
///
/// Ordering ignores the original text, so two distinct spellings may
/// compare equal (`1_alpha` and `1_alpha0`). `Display` round-trips the text
/// exactly as parsed.
#[derive(Debug, Clone)]
pub struct Version {
    text: String,
    numbers: Vec<u64>,
    letter: Option<char>,
    pre: Option<PreTag>,
    pre_number: u64,
    post: Option<PostTag>,
    post_number: u64,
    revision: u64,
}

impl Version {
    /// Parse a version string, rejecting anything outside the grammar.
    pub fn parse(text: &str) -> Result<Self, ParseError> {
        let caps = VERSION_RE
            .captures(text)
            .ok_or_else(|| ParseError::Version(text.to_string()))?;

        let number = |s: &str| -> Result<u64, ParseError> {
            s.parse().map_err(|_| ParseError::Number {
                version: text.to_string(),
                part: s.to_string(),
            })
        };

        let mut numbers = vec![number(&caps[1])?];
        if let Some(rest) = caps.get(2) {
            for part in rest.as_str().split('.').filter(|s| !s.is_empty()) {
                numbers.push(number(part)?);
            }
        }

        let letter = caps.get(3).and_then(|m| m.as_str().chars().next());

        let pre = match caps.get(4).map(|m| m.as_str()) {
            Some("_alpha") => Some(PreTag::Alpha),
            Some("_beta") => Some(PreTag::Beta),
            Some("_pre") => Some(PreTag::Pre),
            Some("_rc") => Some(PreTag::Rc),
            _ => None,
        };
        let pre_number = match caps.get(5).map(|m| m.as_str()) {
            Some(s) if !s.is_empty() => number(s)?,
            _ => 0,
        };

        let post = match caps.get(6).map(|m| m.as_str()) {
            Some("_cvs") => Some(PostTag::Cvs),
            Some("_svn") => Some(PostTag::Svn),
            Some("_git") => Some(PostTag::Git),
            Some("_hg") => Some(PostTag::Hg),
            Some("_p") => Some(PostTag::P),
            _ => None,
        };
        let post_number = match caps.get(7).map(|m| m.as_str()) {
            Some(s) if !s.is_empty() => number(s)?,
            _ => 0,
        };

        let revision = match caps.get(8).map(|m| m.as_str()) {
            Some(s) if !s.is_empty() => number(s)?,
            _ => 0,
        };

        Ok(Self {
            text: text.to_string(),
            numbers,
            letter,
            pre,
            pre_number,
            post,
            post_number,
            revision,
        })
    }

    /// The original text this version was parsed from.
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// The dotted number components.
    pub fn numbers(&self) -> &[u64] {
        &self.numbers
    }

    /// Check this version against a constraint and its bound.
    ///
    /// `~` requires the bound's dotted numbers to be a prefix of this
    /// version's numbers, with everything past the prefix at least the
    /// bound (`1.7.1-r1` fits `~1.7` and `~1.7.1` but not `~1.7.1-r2`).
    pub fn satisfies(&self, constraint: Constraint, bound: &Version) -> bool {
        match constraint {
            Constraint::Any => true,
            Constraint::Equal => self == bound,
            Constraint::Less => self < bound,
            Constraint::LessEqual => self <= bound,
            Constraint::Greater => self > bound,
            Constraint::GreaterEqual => self >= bound,
            Constraint::Tilde => {
                self.numbers.len() >= bound.numbers.len()
                    && self.numbers[..bound.numbers.len()] == bound.numbers[..]
                    && self >= bound
            }
        }
    }
}

impl FromStr for Version {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        for (a, b) in self.numbers.iter().zip(other.numbers.iter()) {
            match a.cmp(b) {
                Ordering::Equal => {}
                ord => return ord,
            }
        }
        // A strict prefix is less than the longer sequence.
        match self.numbers.len().cmp(&other.numbers.len()) {
            Ordering::Equal => {}
            ord => return ord,
        }

        match self.letter.cmp(&other.letter) {
            Ordering::Equal => {}
            ord => return ord,
        }

        // No pre-release tag means "release", which outranks any pre-tag.
        let pre_rank = |p: Option<PreTag>| p.map_or(u8::MAX, |t| t as u8);
        match pre_rank(self.pre).cmp(&pre_rank(other.pre)) {
            Ordering::Equal => {}
            ord => return ord,
        }
        match self.pre_number.cmp(&other.pre_number) {
            Ordering::Equal => {}
            ord => return ord,
        }

        // Post-release tags are the other way around: none sorts lowest.
        let post_rank = |p: Option<PostTag>| p.map_or(0u8, |t| t as u8 + 1);
        match post_rank(self.post).cmp(&post_rank(other.post)) {
            Ordering::Equal => {}
            ord => return ord,
        }
        match self.post_number.cmp(&other.post_number) {
            Ordering::Equal => {}
            ord => return ord,
        }

        self.revision.cmp(&other.revision)
    }
}

impl Serialize for Version {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.text)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Version::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Version constraint operator of a dependency atom.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Constraint {
    #[default]
    Any,
    Equal,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    Tilde,
}

impl Constraint {
    fn from_op(op: &str) -> Option<Self> {
        match op {
            "=" => Some(Self::Equal),
            "<" => Some(Self::Less),
            "<=" => Some(Self::LessEqual),
            ">" => Some(Self::Greater),
            ">=" => Some(Self::GreaterEqual),
            "~" => Some(Self::Tilde),
            _ => None,
        }
    }

    fn op_str(&self) -> &'static str {
        match self {
            Self::Any => "",
            Self::Equal => "=",
            Self::Less => "<",
            Self::LessEqual => "<=",
            Self::Greater => ">",
            Self::GreaterEqual => ">=",
            Self::Tilde => "~",
        }
    }
}

/// A parsed dependency string: `name[<op>version][@pin]`.
///
/// The raw version text is kept alongside the parse so atoms whose version
/// falls outside the grammar (some `so:` provides carry such strings) still
/// round-trip; those never satisfy a versioned comparison.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Atom {
    pub name: String,
    pub constraint: Constraint,
    pub version_text: String,
    #[serde(skip)]
    pub version: Option<Version>,
    pub pin: String,
    pub conflict: bool,
}

impl Atom {
    /// Parse a dependency string. Never fails: anything that does not fit
    /// the grammar is treated as an opaque name with no constraint.
    pub fn parse(input: &str) -> Self {
        let (conflict, body) = match input.strip_prefix('!') {
            Some(rest) => (true, rest),
            None => (false, input),
        };

        let opaque = || Self {
            name: body.to_string(),
            constraint: Constraint::Any,
            version_text: String::new(),
            version: None,
            pin: String::new(),
            conflict,
        };

        let Some(caps) = ATOM_RE.captures(body) else {
            return opaque();
        };

        let (constraint, version_text) = match (caps.get(2), caps.get(3)) {
            (Some(op), Some(ver)) => match Constraint::from_op(op.as_str()) {
                Some(c) => (c, ver.as_str().to_string()),
                None => return opaque(),
            },
            _ => (Constraint::Any, String::new()),
        };

        let version = if version_text.is_empty() {
            None
        } else {
            Version::parse(&version_text).ok()
        };

        Self {
            name: caps[1].to_string(),
            constraint,
            version_text,
            version,
            pin: caps.get(4).map(|m| m.as_str().to_string()).unwrap_or_default(),
            conflict,
        }
    }

    /// Whether `candidate` satisfies this atom's version constraint.
    ///
    /// A constrained atom whose bound failed to parse matches nothing.
    pub fn matches_version(&self, candidate: &Version) -> bool {
        match self.constraint {
            Constraint::Any => true,
            _ => match &self.version {
                Some(bound) => candidate.satisfies(self.constraint, bound),
                None => false,
            },
        }
    }
}

impl fmt::Display for Atom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.conflict {
            f.write_str("!")?;
        }
        f.write_str(&self.name)?;
        if self.constraint != Constraint::Any {
            write!(f, "{}{}", self.constraint.op_str(), self.version_text)?;
        }
        if !self.pin.is_empty() {
            write!(f, "@{}", self.pin)?;
        }
        Ok(())
    }
}

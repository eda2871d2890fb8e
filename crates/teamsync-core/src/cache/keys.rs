//! Hierarchical cache keys and scopes.
//!
//! A key is an ordered list of typed segments: a domain, an operation, then
//! the operation's parameters in a fixed order. Two keys are equal exactly
//! when their segment lists are equal, so distinct parameter values (including
//! an absent filter versus an empty one) can never collide.
//!
//! A [`Scope`] is a key prefix; it contains every key that starts with it.

use std::fmt;

/// One component of a cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Segment {
    /// Fixed vocabulary: domains and operations.
    Tag(&'static str),
    /// Caller-supplied identifier (entity id, username).
    Id(String),
    /// Named parameter.
    Param(&'static str, ParamValue),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ParamValue {
    Absent,
    Int(i64),
    Text(String),
}

impl From<u32> for ParamValue {
    fn from(v: u32) -> Self {
        ParamValue::Int(i64::from(v))
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::Int(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Text(v.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        ParamValue::Text(v)
    }
}

impl<T: Into<ParamValue>> From<Option<T>> for ParamValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(ParamValue::Absent)
    }
}

/// Address of a single cached read result.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    segments: Vec<Segment>,
}

impl CacheKey {
    /// Start a key in `domain` for `operation`.
    pub fn new(domain: &'static str, operation: &'static str) -> Self {
        Self {
            segments: vec![Segment::Tag(domain), Segment::Tag(operation)],
        }
    }

    /// Key consisting of a domain only, for singleton reads.
    pub fn domain(domain: &'static str) -> Self {
        Self {
            segments: vec![Segment::Tag(domain)],
        }
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.segments.push(Segment::Id(id.into()));
        self
    }

    pub fn param(mut self, name: &'static str, value: impl Into<ParamValue>) -> Self {
        self.segments.push(Segment::Param(name, value.into()));
        self
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Scope that matches this key and everything nested below it.
    pub fn scope(&self) -> Scope {
        Scope {
            segments: self.segments.clone(),
        }
    }
}

/// Key prefix grouping entries that are invalidated together.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Scope {
    segments: Vec<Segment>,
}

impl Scope {
    /// Scope from a path of tags, e.g. `["connection-requests", "pending"]`.
    pub fn of(path: &[&'static str]) -> Self {
        Self {
            segments: path.iter().map(|tag| Segment::Tag(*tag)).collect(),
        }
    }

    /// Narrow this scope to a single entity id.
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.segments.push(Segment::Id(id.into()));
        self
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        key.segments.starts_with(&self.segments)
    }

    /// True when every key in `other` is also in `self`.
    pub fn covers(&self, other: &Scope) -> bool {
        other.segments.starts_with(&self.segments)
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }
}

impl From<CacheKey> for Scope {
    fn from(key: CacheKey) -> Self {
        Scope {
            segments: key.segments,
        }
    }
}

// Rendering is for logs and display only; identity is the segment list.

fn write_escaped(f: &mut fmt::Formatter<'_>, raw: &str) -> fmt::Result {
    for c in raw.chars() {
        match c {
            '%' => f.write_str("%25")?,
            '/' => f.write_str("%2F")?,
            '=' => f.write_str("%3D")?,
            _ => write!(f, "{}", c)?,
        }
    }
    Ok(())
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Segment::Tag(tag) => f.write_str(tag),
            Segment::Id(id) => write_escaped(f, id),
            Segment::Param(name, value) => {
                write!(f, "{}=", name)?;
                match value {
                    ParamValue::Absent => f.write_str("~"),
                    ParamValue::Int(n) => write!(f, "{}", n),
                    ParamValue::Text(s) => {
                        f.write_str("'")?;
                        write_escaped(f, s)?;
                        f.write_str("'")
                    }
                }
            }
        }
    }
}

fn write_path(f: &mut fmt::Formatter<'_>, segments: &[Segment]) -> fmt::Result {
    for (i, segment) in segments.iter().enumerate() {
        if i > 0 {
            f.write_str("/")?;
        }
        write!(f, "{}", segment)?;
    }
    Ok(())
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_path(f, &self.segments)
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_path(f, &self.segments)?;
        f.write_str("/*")
    }
}

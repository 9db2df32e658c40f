use std::fmt::Display;

use serde::{Deserialize, Serialize};

use crate::Error;

/// Separator used for the textual form of an [`AttributePath`].
pub const PATH_SEPARATOR: char = '/';

/// Identifies one attribute in a run's metadata tree.
///
/// A path is an ordered, non-empty sequence of string segments. Two paths are equal only if
/// their segments are equal; the `/`-joined text form is for display and ordering keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct AttributePath(Vec<String>);

impl AttributePath {
    pub fn new(segments: Vec<String>) -> Result<Self, Error> {
        if segments.is_empty() {
            return Err(Error::EmptyPath);
        }
        Ok(Self(segments))
    }

    /// Parse a `/`-separated path such as `metrics/loss`.
    pub fn parse(s: &str) -> Result<Self, Error> {
        let segments: Vec<String> = s
            .split(PATH_SEPARATOR)
            .filter(|seg| !seg.is_empty())
            .map(String::from)
            .collect();
        Self::new(segments)
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Always false, a path can not be constructed without segments.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl TryFrom<Vec<String>> for AttributePath {
    type Error = Error;

    fn try_from(value: Vec<String>) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<AttributePath> for Vec<String> {
    fn from(value: AttributePath) -> Self {
        value.0
    }
}

impl Display for AttributePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, segment) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "{PATH_SEPARATOR}")?;
            }
            f.write_str(segment)?;
        }
        Ok(())
    }
}

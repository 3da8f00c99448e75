//! Pattern matching over a growing byte buffer.
//!
//! The functions here carry no protocol knowledge: given the bytes received
//! so far and an ordered list of candidates, they report which candidate
//! matches earliest in the buffer. When two candidates start at the same
//! offset the one listed first wins.

use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;

use regex::bytes::Regex;

use crate::error::Result;

/// A candidate pattern for [`crate::DeviceSession::expect`].
#[derive(Clone)]
pub enum Pattern {
    /// Exact byte sequence.
    Literal(Vec<u8>),
    /// Regular expression over raw bytes; named groups are captured.
    Regex(Regex),
}

impl Pattern {
    /// Exact text pattern.
    pub fn literal(text: impl AsRef<[u8]>) -> Self {
        Self::Literal(
            text.as_ref()
                .to_vec(),
        )
    }

    /// Compile a regular expression pattern.
    pub fn regex(re: &str) -> Result<Self> {
        Ok(Self::Regex(Regex::new(re)?))
    }

    fn find(&self, haystack: &[u8]) -> Option<Found> {
        match self {
            Self::Literal(needle) => {
                if needle.is_empty() {
                    return Some(Found::empty());
                }
                haystack
                    .windows(needle.len())
                    .position(|w| w == needle.as_slice())
                    .map(|start| Found {
                        start,
                        end: start + needle.len(),
                        groups: HashMap::new(),
                    })
            },
            Self::Regex(re) => {
                let caps = re.captures(haystack)?;
                let whole = caps.get(0)?;
                let groups = re
                    .capture_names()
                    .flatten()
                    .filter_map(|name| {
                        caps.name(name)
                            .map(|m| (name.to_string(), String::from_utf8_lossy(m.as_bytes()).into_owned()))
                    })
                    .collect();
                Some(Found {
                    start: whole.start(),
                    end: whole.end(),
                    groups,
                })
            },
        }
    }
}

impl From<&str> for Pattern {
    fn from(text: &str) -> Self {
        Self::literal(text)
    }
}

impl fmt::Debug for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Literal(bytes) => write!(f, "{:?}", String::from_utf8_lossy(bytes)),
            Self::Regex(re) => write!(f, "/{}/", re.as_str()),
        }
    }
}

/// Render a candidate list for diagnostics.
pub fn describe(patterns: &[Pattern]) -> String {
    patterns
        .iter()
        .map(|p| format!("{p:?}"))
        .collect::<Vec<_>>()
        .join(" | ")
}

/// Location of a single pattern hit inside the buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Found {
    pub(crate) start: usize,
    pub(crate) end: usize,
    pub(crate) groups: HashMap<String, String>,
}

impl Found {
    fn empty() -> Self {
        Self {
            start: 0,
            end: 0,
            groups: HashMap::new(),
        }
    }
}

/// Find the candidate whose match starts earliest in `buffer`.
pub(crate) fn find_earliest(buffer: &[u8], patterns: &[Pattern]) -> Option<(usize, Found)> {
    let mut best: Option<(usize, Found)> = None;
    for (index, pattern) in patterns
        .iter()
        .enumerate()
    {
        let Some(found) = pattern.find(buffer) else {
            continue;
        };
        let better = match &best {
            Some((_, current)) => found.start < current.start,
            None => true,
        };
        if better {
            best = Some((index, found));
        }
    }
    best
}

/// Outcome of a successful expectation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchResult {
    /// Position of the matching pattern in the candidate list.
    pub index: usize,
    /// Named captures of a regex pattern.
    pub groups: HashMap<String, String>,
    /// Bytes received before the match.
    pub before: Vec<u8>,
    /// The matched bytes themselves.
    pub matched: Vec<u8>,
}

impl MatchResult {
    /// `before`, lossily decoded.
    pub fn before_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.before)
    }

    /// The matched bytes, lossily decoded.
    pub fn matched_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.matched)
    }

    /// A named capture.
    pub fn group(&self, name: &str) -> Option<&str> {
        self.groups
            .get(name)
            .map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_earliest_start_wins_over_list_order() {
        let patterns = [Pattern::literal("hello"), Pattern::literal("world")];
        let (index, found) = find_earliest(b"xx world hello", &patterns).unwrap();
        assert_eq!(index, 1);
        assert_eq!(found.start, 3);
        assert_eq!(found.end, 8);
    }

    #[test]
    fn test_tie_goes_to_first_listed() {
        let patterns = [Pattern::literal("abc"), Pattern::literal("ab")];
        let (index, _) = find_earliest(b"zabc", &patterns).unwrap();
        assert_eq!(index, 0);

        let swapped = [Pattern::literal("ab"), Pattern::literal("abc")];
        let (index, found) = find_earliest(b"zabc", &swapped).unwrap();
        assert_eq!(index, 0);
        assert_eq!(found.end, 3);
    }

    #[test]
    fn test_regex_named_groups() {
        let patterns = [Pattern::regex(r"block (?P<index>\d+)/(?P<count>\d+)\D").unwrap()];
        let (_, found) = find_earliest(b"\rblock 12/64\r\n", &patterns).unwrap();
        assert_eq!(found.groups["index"], "12");
        assert_eq!(found.groups["count"], "64");
    }

    #[test]
    fn test_no_match() {
        let patterns = [Pattern::literal("(plo)% ")];
        assert!(find_earliest(b"(plo)%", &patterns).is_none());
        assert!(find_earliest(b"", &patterns).is_none());
    }

    #[test]
    fn test_describe_lists_candidates() {
        let patterns = [Pattern::from("Erased"), Pattern::regex("a+b").unwrap()];
        assert_eq!(describe(&patterns), "\"Erased\" | /a+b/");
    }

    #[test]
    fn test_invalid_regex_is_reported() {
        assert!(matches!(
            Pattern::regex("(unclosed"),
            Err(crate::Error::Pattern(_))
        ));
    }
}

//! Lexical similarity and antonym matching.
//!
//! Both are deliberately coarse. [`SimilarityFn`] is the seam where a semantic
//! scorer can replace the token-overlap baseline.

use std::collections::HashSet;
use std::fmt;

use regex::Regex;

/// Scores how alike two textual representations are, in `[0, 1]`.
pub trait SimilarityFn: Send + Sync + fmt::Debug {
    /// Similarity of `a` and `b`.
    fn similarity(&self, a: &str, b: &str) -> f64;
}

/// Jaccard similarity over lower-cased whitespace tokens.
///
/// `|A ∩ B| / |A ∪ B|`, defined as 0 when either token set is empty.
#[derive(Debug, Default, Clone, Copy)]
pub struct JaccardSimilarity;

fn tokens(text: &str) -> HashSet<String> {
    text.split_whitespace().map(str::to_lowercase).collect()
}

impl SimilarityFn for JaccardSimilarity {
    #[allow(clippy::cast_precision_loss)]
    fn similarity(&self, a: &str, b: &str) -> f64 {
        let a = tokens(a);
        let b = tokens(b);
        if a.is_empty() || b.is_empty() {
            return 0.0;
        }
        let shared = a.intersection(&b).count();
        let union = a.len() + b.len() - shared;
        shared as f64 / union as f64
    }
}

/// Antonym pairs used when no custom list is configured.
pub const DEFAULT_ANTONYM_PAIRS: [(&str, &str); 8] = [
    ("should", "should not"),
    ("can", "cannot"),
    ("always", "never"),
    ("success", "failure"),
    ("safe", "unsafe"),
    ("increase", "decrease"),
    ("enable", "disable"),
    ("must", "must not"),
];

#[derive(Debug, Clone)]
struct Term {
    text: String,
    pattern: Regex,
}

impl Term {
    fn new(text: &str) -> Result<Self, regex::Error> {
        let words: Vec<String> = text.split_whitespace().map(regex::escape).collect();
        let pattern = Regex::new(&format!(r"(?i)\b{}\b", words.join(r"\s+")))?;
        Ok(Self {
            text: text.trim().to_lowercase(),
            pattern,
        })
    }
}

#[derive(Debug, Clone)]
struct AntonymPair {
    left: Term,
    right: Term,
}

impl AntonymPair {
    /// Whether `term` occurs in `text`, ignoring occurrences that are only part of
    /// `other` ("should" inside "should not").
    fn occurs(term: &Term, other: &Term, text: &str) -> bool {
        if other.text.len() > term.text.len() && term.pattern.is_match(&other.text) {
            let stripped = other.pattern.replace_all(text, " ");
            term.pattern.is_match(&stripped)
        } else {
            term.pattern.is_match(text)
        }
    }

    fn splits(&self, a: &str, b: &str) -> bool {
        let a_left = Self::occurs(&self.left, &self.right, a);
        let a_right = Self::occurs(&self.right, &self.left, a);
        let b_left = Self::occurs(&self.left, &self.right, b);
        let b_right = Self::occurs(&self.right, &self.left, b);
        (a_left && b_right && !b_left) || (a_right && b_left && !b_right)
    }
}

/// Compiled table of opposite terms.
#[derive(Debug, Clone)]
pub struct AntonymTable {
    pairs: Vec<AntonymPair>,
}

impl AntonymTable {
    /// Compiles a table from `(term, opposite)` pairs.
    pub fn new<I, S>(pairs: I) -> Result<Self, regex::Error>
    where
        I: IntoIterator<Item = (S, S)>,
        S: AsRef<str>,
    {
        let pairs = pairs
            .into_iter()
            .map(|(l, r)| {
                Ok(AntonymPair {
                    left: Term::new(l.as_ref())?,
                    right: Term::new(r.as_ref())?,
                })
            })
            .collect::<Result<Vec<_>, regex::Error>>()?;
        Ok(Self { pairs })
    }

    /// The built-in table.
    #[must_use]
    pub fn builtin() -> Self {
        Self::new(DEFAULT_ANTONYM_PAIRS).unwrap_or(Self { pairs: Vec::new() })
    }

    /// Returns the first pair that splits across `a` and `b`.
    #[must_use]
    pub fn find_split(&self, a: &str, b: &str) -> Option<(&str, &str)> {
        self.pairs
            .iter()
            .find(|p| p.splits(a, b))
            .map(|p| (p.left.text.as_str(), p.right.text.as_str()))
    }

    /// Returns true if any pair splits across `a` and `b`.
    #[must_use]
    pub fn contradicts(&self, a: &str, b: &str) -> bool {
        self.find_split(a, b).is_some()
    }

    /// Number of pairs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    /// Returns true if the table has no pairs.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

impl Default for AntonymTable {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jaccard_basics() {
        let j = JaccardSimilarity;
        assert!((j.similarity("Auth module is brittle", "auth MODULE is brittle") - 1.0).abs() < f64::EPSILON);
        assert!((j.similarity("a b", "b c") - 1.0 / 3.0).abs() < 1e-12);
        assert!(j.similarity("", "anything").abs() < f64::EPSILON);
        assert!(j.similarity("   ", "   ").abs() < f64::EPSILON);
    }

    #[test]
    fn builtin_table_compiles() {
        assert_eq!(AntonymTable::builtin().len(), DEFAULT_ANTONYM_PAIRS.len());
    }

    #[test]
    fn should_versus_should_not() {
        let table = AntonymTable::builtin();
        let a = "callers should retry the request on timeout";
        let b = "callers should not retry the request on timeout";
        assert_eq!(table.find_split(a, b), Some(("should", "should not")));
        assert!(table.contradicts(b, a));
        // Both sides say "should not": no split.
        assert!(!table.contradicts(b, b));
    }

    #[test]
    fn word_boundaries_respected() {
        let table = AntonymTable::builtin();
        // "cannot" must not count as "can".
        assert!(!table.contradicts("we cannot cache this", "we cannot cache that"));
        assert!(table.contradicts("we can cache this", "we cannot cache this"));
        // "unsafe" must not count as "safe".
        assert!(!table.contradicts("unsafe block", "unsafe blocks"));
    }

    #[test]
    fn custom_pairs_with_regex_metacharacters() {
        let table = AntonymTable::new([("p99 < 5ms", "p99 > 5ms")]).unwrap();
        assert_eq!(table.len(), 1);
        assert!(!table.contradicts("plain text", "other text"));
    }
}

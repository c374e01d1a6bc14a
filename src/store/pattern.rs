//! Glob-style key patterns (`*` matches any run, `?` one character).

use regex::Regex;

use crate::error::{Error, Result};

/// A compiled glob pattern.
#[derive(Debug, Clone)]
pub struct KeyPattern {
    glob: String,
    regex: Regex,
}

impl KeyPattern {
    pub fn new(glob: &str) -> Result<Self> {
        let mut source = String::with_capacity(glob.len() + 8);
        source.push('^');
        for c in glob.chars() {
            match c {
                '*' => source.push_str(".*"),
                '?' => source.push('.'),
                other => source.push_str(&regex::escape(&other.to_string())),
            }
        }
        source.push('$');
        let regex = Regex::new(&source)
            .map_err(|e| Error::Validation(format!("bad key pattern '{glob}': {e}")))?;
        Ok(Self {
            glob: glob.to_string(),
            regex,
        })
    }

    pub fn matches(&self, key: &str) -> bool {
        self.regex.is_match(key)
    }

    pub fn as_str(&self) -> &str {
        &self.glob
    }

    /// The equivalent SQL `LIKE` pattern, escaping with `\`.
    pub fn to_sql_like(&self) -> String {
        let mut like = String::with_capacity(self.glob.len());
        for c in self.glob.chars() {
            match c {
                '*' => like.push('%'),
                '?' => like.push('_'),
                '%' | '_' | '\\' => {
                    like.push('\\');
                    like.push(c);
                }
                other => like.push(other),
            }
        }
        like
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn star_matches_any_run() {
        let p = KeyPattern::new("flow-runs/*").unwrap();
        assert!(p.matches("flow-runs/abc"));
        assert!(p.matches("flow-runs/"));
        assert!(!p.matches("flow-awaits/abc"));
    }

    #[test]
    fn question_mark_matches_one_char() {
        let p = KeyPattern::new("job-?").unwrap();
        assert!(p.matches("job-1"));
        assert!(!p.matches("job-12"));
    }

    #[test]
    fn regex_metacharacters_are_literal() {
        let p = KeyPattern::new("a.b+(c)").unwrap();
        assert!(p.matches("a.b+(c)"));
        assert!(!p.matches("axb+(c)"));
    }

    #[test]
    fn sql_like_escapes_wildcards() {
        let p = KeyPattern::new("trigger_stats/*").unwrap();
        assert_eq!(p.to_sql_like(), "trigger\\_stats/%");
    }
}

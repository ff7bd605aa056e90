//! Glob key patterns (`idempotency:*`, `cache:balance:?:*`)
//!
//! `*` matches any run of characters, `?` exactly one. Every wildcard is a
//! capture group, so a matched key can be substituted into a target template
//! using `$1`, `$2`, ...

use regex::Regex;

use crate::error::{CoreError, Result};

#[derive(Debug, Clone)]
pub struct KeyPattern {
    glob: String,
    regex: Regex,
}

impl KeyPattern {
    pub fn new(glob: &str) -> Result<Self> {
        let mut re = String::with_capacity(glob.len() * 2 + 2);
        re.push('^');
        for c in glob.chars() {
            match c {
                '*' => re.push_str("(.*?)"),
                '?' => re.push_str("(.)"),
                other => re.push_str(&regex::escape(&other.to_string())),
            }
        }
        re.push('$');
        let regex = Regex::new(&re)
            .map_err(|e| CoreError::Config(format!("invalid key pattern '{}': {}", glob, e)))?;
        Ok(Self {
            glob: glob.to_string(),
            regex,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.glob
    }

    pub fn matches(&self, key: &str) -> bool {
        self.regex.is_match(key)
    }

    /// Wildcard captures, in order, if the key matches
    pub fn captures(&self, key: &str) -> Option<Vec<String>> {
        let caps = self.regex.captures(key)?;
        Some(
            caps.iter()
                .skip(1)
                .map(|m| m.map(|m| m.as_str().to_string()).unwrap_or_default())
                .collect(),
        )
    }

    /// Literal prefix before the first wildcard, useful for range scans
    pub fn literal_prefix(&self) -> &str {
        let end = self.glob.find(['*', '?']).unwrap_or(self.glob.len());
        &self.glob[..end]
    }

    /// SQL `LIKE` equivalent (escape character `\`)
    pub fn to_sql_like(&self) -> String {
        let mut out = String::with_capacity(self.glob.len());
        for c in self.glob.chars() {
            match c {
                '*' => out.push('%'),
                '?' => out.push('_'),
                '%' | '_' | '\\' => {
                    out.push('\\');
                    out.push(c);
                }
                other => out.push(other),
            }
        }
        out
    }
}

/// Replace `$1..$9` in `template` with the corresponding capture
pub fn substitute(template: &str, captures: &[String]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '$'
            && let Some(d) = chars.peek().and_then(|d| d.to_digit(10))
            && d >= 1
        {
            chars.next();
            if let Some(cap) = captures.get(d as usize - 1) {
                out.push_str(cap);
            }
            continue;
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_star_and_question() {
        let p = KeyPattern::new("idempotency:*").unwrap();
        assert!(p.matches("idempotency:cashout:42:abc"));
        assert!(p.matches("idempotency:"));
        assert!(!p.matches("saga:1"));

        let q = KeyPattern::new("lock:?").unwrap();
        assert!(q.matches("lock:a"));
        assert!(!q.matches("lock:ab"));
    }

    #[test]
    fn test_regex_metacharacters_are_literal() {
        let p = KeyPattern::new("cache:(rates).*").unwrap();
        assert!(p.matches("cache:(rates).usd"));
        assert!(!p.matches("cache:rates.usd"));
    }

    #[test]
    fn test_captures_and_substitute() {
        let p = KeyPattern::new("balance:*:*").unwrap();
        let caps = p.captures("balance:42:USD").unwrap();
        assert_eq!(caps, vec!["42".to_string(), "USD".to_string()]);
        assert_eq!(substitute("cache:balance:$1:$2:*", &caps), "cache:balance:42:USD:*");
        assert_eq!(substitute("cost $5", &caps), "cost ");
        assert_eq!(substitute("price$", &caps), "price$");
    }

    #[test]
    fn test_literal_prefix_and_sql_like() {
        let p = KeyPattern::new("job_result:*").unwrap();
        assert_eq!(p.literal_prefix(), "job_result:");
        assert_eq!(p.to_sql_like(), "job\\_result:%");
    }
}

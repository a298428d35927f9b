//! Cache key construction.
//!
//! Keys are `"{prefix}:{id}"`. Method keys append the method name and each
//! argument: `"{prefix}:{method}:{arg1}:{arg2}"`, with `%` and `:` inside
//! arguments percent-escaped so distinct argument lists never collide.

use std::fmt::{Display, Write};

pub struct CacheKeyBuilder;

impl CacheKeyBuilder {
    /// `"{prefix}:{id}"`
    pub fn build(prefix: &str, id: impl Display) -> String {
        format!("{}:{}", prefix, id)
    }

    /// Stable key for one call of `method` with `args`.
    pub fn method_key<A: Display + ?Sized>(prefix: &str, method: &str, args: &[&A]) -> String {
        let mut key = format!("{}:{}", prefix, method);
        for arg in args {
            key.push(':');
            push_escaped(&mut key, &arg.to_string());
        }
        key
    }

    /// Split a key into `(prefix, rest)` at the first `:`.
    pub fn parse(key: &str) -> Option<(&str, &str)> {
        key.split_once(':')
            .filter(|(prefix, rest)| !prefix.is_empty() && !rest.is_empty())
    }
}

fn push_escaped(out: &mut String, raw: &str) {
    for c in raw.chars() {
        match c {
            '%' => out.push_str("%25"),
            ':' => out.push_str("%3A"),
            c => {
                let _ = out.write_char(c);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build() {
        assert_eq!(CacheKeyBuilder::build("user", 42), "user:42");
        assert_eq!(CacheKeyBuilder::build("user", "a:b"), "user:a:b");
    }

    #[test]
    fn test_method_key_escapes_arguments() {
        let a = CacheKeyBuilder::method_key("svc", "find", &["a:b", "c"]);
        let b = CacheKeyBuilder::method_key("svc", "find", &["a", "b:c"]);
        assert_eq!(a, "svc:find:a%3Ab:c");
        assert_eq!(b, "svc:find:a:b%3Ac");
        assert_ne!(a, b);

        assert_eq!(
            CacheKeyBuilder::method_key("svc", "pct", &["100%"]),
            "svc:pct:100%25"
        );
        assert_eq!(CacheKeyBuilder::method_key::<str>("svc", "all", &[]), "svc:all");
    }

    #[test]
    fn test_parse() {
        assert_eq!(CacheKeyBuilder::parse("user:42"), Some(("user", "42")));
        assert_eq!(CacheKeyBuilder::parse("user:a:b"), Some(("user", "a:b")));
        assert_eq!(CacheKeyBuilder::parse("plain"), None);
        assert_eq!(CacheKeyBuilder::parse(":42"), None);
    }
}

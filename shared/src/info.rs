//! Backslash-delimited key/value strings (`\key\value\key\value`)
//!
//! Userinfo, serverinfo, and the payload of `infoResponse` all use this
//! encoding. Keys and values may not contain backslashes, quotes, or
//! semicolons; [`valid_info_item`] is the gate for untrusted input.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Ordered key/value map that renders as an info string
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfoMap {
    entries: Vec<(String, String)>,
}

impl InfoMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses an info string; a trailing key without value is dropped
    pub fn parse(text: &str) -> Self {
        let mut map = Self::new();
        let trimmed = text.strip_prefix('\\').unwrap_or(text);
        if trimmed.is_empty() {
            return map;
        }

        let mut parts = trimmed.split('\\');
        while let (Some(key), Some(value)) = (parts.next(), parts.next()) {
            map.set(key, value);
        }
        map
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// Value for `key`, or the empty string
    pub fn value_for(&self, key: &str) -> &str {
        self.get(key).unwrap_or("")
    }

    /// Sets a key; an empty value removes it
    pub fn set(&mut self, key: &str, value: &str) {
        if value.is_empty() {
            self.remove(key);
            return;
        }
        match self
            .entries
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
        {
            Some(entry) => entry.1 = value.to_string(),
            None => self.entries.push((key.to_string(), value.to_string())),
        }
    }

    pub fn remove(&mut self, key: &str) {
        self.entries.retain(|(k, _)| !k.eq_ignore_ascii_case(key));
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl fmt::Display for InfoMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (key, value) in &self.entries {
            write!(f, "\\{}\\{}", key, value)?;
        }
        Ok(())
    }
}

/// True if `item` can be embedded in an info string without breaking it
pub fn valid_info_item(item: &str) -> bool {
    !item.contains(|c: char| matches!(c, '\\' | '"' | ';'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_lookup() {
        let info = InfoMap::parse("\\name\\player\\protocol\\86\\qport\\1234");
        assert_eq!(info.get("name"), Some("player"));
        assert_eq!(info.value_for("PROTOCOL"), "86");
        assert_eq!(info.value_for("missing"), "");
    }

    #[test]
    fn test_set_replaces_and_empty_removes() {
        let mut info = InfoMap::parse("\\a\\1\\b\\2");
        info.set("a", "3");
        info.set("b", "");
        info.set("c", "4");
        assert_eq!(info.to_string(), "\\a\\3\\c\\4");
    }

    #[test]
    fn test_dangling_key_is_dropped() {
        let info = InfoMap::parse("\\a\\1\\b");
        assert_eq!(info.to_string(), "\\a\\1");
        assert!(InfoMap::parse("").is_empty());
    }

    #[test]
    fn test_valid_info_item() {
        assert!(valid_info_item("abc123"));
        assert!(!valid_info_item("a\\b"));
        assert!(!valid_info_item("a;b"));
        assert!(!valid_info_item("\"q\""));
    }
}

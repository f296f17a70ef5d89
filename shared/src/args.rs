//! Command line tokenizer used for connectionless packets and reliable commands
//!
//! Tokens are separated by whitespace. A double quote starts a quoted run that
//! may contain whitespace; inside a quoted run a backslash escapes the next
//! character, so `\"` and `\\` survive a round trip through [`escape`].

/// A tokenized command line
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Args {
    argv: Vec<String>,
}

impl Args {
    pub fn parse(text: &str) -> Self {
        let mut argv = Vec::new();
        let mut chars = text.chars().peekable();

        loop {
            while chars.peek().map_or(false, |c| c.is_whitespace()) {
                chars.next();
            }
            if chars.peek().is_none() {
                break;
            }

            let mut token = String::new();
            while let Some(&c) = chars.peek() {
                if c.is_whitespace() {
                    break;
                }
                chars.next();
                if c != '"' {
                    token.push(c);
                    continue;
                }
                while let Some(c) = chars.next() {
                    match c {
                        '"' => break,
                        '\\' => {
                            if let Some(escaped) = chars.next() {
                                token.push(escaped);
                            }
                        }
                        _ => token.push(c),
                    }
                }
            }
            argv.push(token);
        }

        Self { argv }
    }

    pub fn from_vec(argv: Vec<String>) -> Self {
        Self { argv }
    }

    pub fn argc(&self) -> usize {
        self.argv.len()
    }

    /// Argument `index`, or the empty string when out of range
    pub fn argv(&self, index: usize) -> &str {
        self.argv.get(index).map(String::as_str).unwrap_or("")
    }

    /// Arguments from `start` joined with single spaces
    pub fn concat_args(&self, start: usize) -> String {
        self.argv
            .get(start..)
            .map(|rest| rest.join(" "))
            .unwrap_or_default()
    }

    /// Arguments from `start` re-escaped so they tokenize back to the same list
    pub fn escaped_args(&self, start: usize) -> String {
        self.argv
            .get(start..)
            .map(|rest| rest.iter().map(|a| escape(a)).collect::<Vec<_>>().join(" "))
            .unwrap_or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.argv.iter().map(String::as_str)
    }
}

/// Quotes `text` if it would not tokenize to a single identical argument
pub fn escape(text: &str) -> String {
    let needs_quotes = text.is_empty()
        || text
            .chars()
            .any(|c| c.is_whitespace() || c == '"' || c == '\\' || c == ';');
    if !needs_quotes {
        return text.to_string();
    }

    let mut out = String::with_capacity(text.len() + 2);
    out.push('"');
    for c in text.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_whitespace_and_quotes() {
        let args = Args::parse("  getinfo   xyz \"two words\"  ");
        assert_eq!(args.argc(), 3);
        assert_eq!(args.argv(0), "getinfo");
        assert_eq!(args.argv(1), "xyz");
        assert_eq!(args.argv(2), "two words");
        assert_eq!(args.argv(7), "");
    }

    #[test]
    fn test_escape_survives_tokenizing() {
        let userinfo = "\\name\\bob \"the\" builder\\protocol\\86";
        let line = format!("connect {}", escape(userinfo));
        let args = Args::parse(&line);

        assert_eq!(args.argc(), 2);
        assert_eq!(args.argv(1), userinfo);
    }

    #[test]
    fn test_escape_leaves_plain_words() {
        assert_eq!(escape("plain"), "plain");
        assert_eq!(escape(""), "\"\"");
        assert_eq!(escape("a b"), "\"a b\"");
    }

    #[test]
    fn test_concat_and_escaped_args() {
        let args = Args::parse("rcon secret kick \"player one\"");
        assert_eq!(args.concat_args(2), "kick player one");
        assert_eq!(args.escaped_args(2), "kick \"player one\"");
        assert_eq!(args.concat_args(9), "");
    }

    #[test]
    fn test_empty_quoted_token() {
        let args = Args::parse("print \"\" end");
        assert_eq!(args.argc(), 3);
        assert_eq!(args.argv(1), "");
    }
}

//! Incremental IMAP command-line parser
//!
//! Extracts one command at a time as `(tag, name, args)` from bytes the
//! transport has already buffered. The parser never performs I/O: callers
//! `feed()` whatever arrived and retry. Every `read_*` method returns
//! `Ok(None)` while the current line is still incomplete, so a command
//! interrupted by a partial read resumes without losing bytes.
//!
//! Lines are bounded by [`MAX_IMAP_LINE`]; exceeding the bound is a fatal
//! error because the stream position can no longer be trusted. Syntax
//! errors on a complete line are non-fatal: the caller replies `BAD`,
//! calls [`Parser::reset`], and the next pipelined line parses normally.

use crate::config::MAX_IMAP_LINE;
use std::fmt;

/// One parsed command argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Arg {
    /// Bare atom token.
    Atom(String),
    /// Double-quoted string, escapes resolved.
    Quoted(String),
    /// Parenthesized list.
    List(Vec<Arg>),
}

impl Arg {
    /// The textual value of an atom or quoted string.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Atom(s) | Self::Quoted(s) => Some(s),
            Self::List(_) => None,
        }
    }
}

impl fmt::Display for Arg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Atom(s) => write!(f, "{s}"),
            Self::Quoted(s) => write!(f, "\"{s}\""),
            Self::List(items) => {
                write!(f, "(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, ")")
            }
        }
    }
}

/// A parse failure. `fatal` means the byte stream is unrecoverable and the
/// session must be destroyed; otherwise the error is confined to one line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    pub message: String,
    pub fatal: bool,
}

impl ParseError {
    fn syntax(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            fatal: false,
        }
    }

    fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            fatal: true,
        }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ParseError {}

type ParseResult<T> = Result<Option<T>, ParseError>;

/// Restartable line parser over caller-fed bytes. Errors travel in the
/// `read_*` results; the parser itself keeps no error state.
#[derive(Debug, Default)]
pub struct Parser {
    buf: Vec<u8>,
    /// Cursor into the current line.
    pos: usize,
    /// Discard bytes through the next LF before parsing resumes.
    skipping: bool,
}

impl Parser {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append freshly received bytes.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
        if self.skipping {
            self.discard_skipped();
        }
    }

    /// Finish with the current line: consume it (or arrange to skip it once
    /// its LF arrives) and clear per-command state. Bytes belonging to later
    /// pipelined lines are retained.
    pub fn reset(&mut self) {
        self.pos = 0;
        match self.find_line_end() {
            Some(end) => {
                self.buf.drain(..=end);
            }
            None => {
                self.buf.clear();
                self.skipping = true;
            }
        }
    }

    /// Next whitespace-delimited token on the current line.
    ///
    /// Returns `Ok(None)` until the line's terminator has been fed.
    pub fn read_word(&mut self) -> ParseResult<String> {
        let Some(end) = self.line_end()? else {
            return Ok(None);
        };
        self.skip_spaces(end);
        let start = self.pos;
        while self.pos < end && self.buf[self.pos] != b' ' {
            self.pos += 1;
        }
        Ok(Some(
            String::from_utf8_lossy(&self.buf[start..self.pos]).into_owned(),
        ))
    }

    /// Parse the remaining arguments on the current line.
    ///
    /// `max_count` of 0 means unlimited; exceeding a nonzero bound is a
    /// syntax error. Returns `Ok(None)` until the full line is available.
    pub fn read_args(&mut self, max_count: usize) -> ParseResult<Vec<Arg>> {
        let Some(end) = self.line_end()? else {
            return Ok(None);
        };
        let mut args = Vec::new();
        loop {
            self.skip_spaces(end);
            if self.pos >= end {
                return Ok(Some(args));
            }
            if max_count > 0 && args.len() == max_count {
                return Err(ParseError::syntax("Too many arguments."));
            }
            let arg = self.read_arg(end)?;
            args.push(arg);
        }
    }

    /// The current line, raw and whole, consumed. Used for SASL
    /// continuation responses, which are not IMAP commands.
    pub fn read_line(&mut self) -> ParseResult<String> {
        let Some(end) = self.find_line_end_checked()? else {
            return Ok(None);
        };
        let mut content = end;
        if content > 0 && self.buf[content - 1] == b'\r' {
            content -= 1;
        }
        let line = String::from_utf8_lossy(&self.buf[..content]).into_owned();
        self.buf.drain(..=end);
        self.pos = 0;
        Ok(Some(line))
    }

    // -- internals --

    fn read_arg(&mut self, end: usize) -> Result<Arg, ParseError> {
        match self.buf[self.pos] {
            b'"' => self.read_quoted(end),
            b'(' => self.read_list(end),
            b'{' => Err(ParseError::syntax("Literals are not allowed here.")),
            b')' => Err(ParseError::syntax("Unexpected ')'.")),
            _ => {
                let start = self.pos;
                while self.pos < end && !matches!(self.buf[self.pos], b' ' | b'(' | b')') {
                    self.pos += 1;
                }
                Ok(Arg::Atom(
                    String::from_utf8_lossy(&self.buf[start..self.pos]).into_owned(),
                ))
            }
        }
    }

    fn read_quoted(&mut self, end: usize) -> Result<Arg, ParseError> {
        self.pos += 1;
        let mut value = Vec::new();
        while self.pos < end {
            match self.buf[self.pos] {
                b'"' => {
                    self.pos += 1;
                    return Ok(Arg::Quoted(String::from_utf8_lossy(&value).into_owned()));
                }
                b'\\' if self.pos + 1 < end => {
                    value.push(self.buf[self.pos + 1]);
                    self.pos += 2;
                }
                b => {
                    value.push(b);
                    self.pos += 1;
                }
            }
        }
        Err(ParseError::syntax("Missing '\"'."))
    }

    fn read_list(&mut self, end: usize) -> Result<Arg, ParseError> {
        self.pos += 1;
        let mut items = Vec::new();
        loop {
            self.skip_spaces(end);
            if self.pos >= end {
                return Err(ParseError::syntax("Missing ')'."));
            }
            if self.buf[self.pos] == b')' {
                self.pos += 1;
                return Ok(Arg::List(items));
            }
            let item = self.read_arg(end)?;
            items.push(item);
        }
    }

    fn skip_spaces(&mut self, end: usize) {
        while self.pos < end && self.buf[self.pos] == b' ' {
            self.pos += 1;
        }
    }

    /// End of the current line's content (before CRLF), once complete.
    fn line_end(&self) -> ParseResult<usize> {
        let Some(lf) = self.find_line_end_checked()? else {
            return Ok(None);
        };
        let mut end = lf;
        if end > 0 && self.buf[end - 1] == b'\r' {
            end -= 1;
        }
        Ok(Some(end))
    }

    fn find_line_end_checked(&self) -> ParseResult<usize> {
        match self.find_line_end() {
            Some(lf) => {
                let content = if lf > 0 && self.buf[lf - 1] == b'\r' {
                    lf - 1
                } else {
                    lf
                };
                if content > MAX_IMAP_LINE {
                    return Err(ParseError::fatal("IMAP command line too large."));
                }
                Ok(Some(lf))
            }
            None => {
                if self.buf.len() > MAX_IMAP_LINE {
                    return Err(ParseError::fatal("IMAP command line too large."));
                }
                Ok(None)
            }
        }
    }

    fn find_line_end(&self) -> Option<usize> {
        self.buf.iter().position(|&b| b == b'\n')
    }

    fn discard_skipped(&mut self) {
        if let Some(lf) = self.find_line_end() {
            self.buf.drain(..=lf);
            self.skipping = false;
        } else {
            self.buf.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_line(line: &str) -> (String, String, Vec<Arg>) {
        let mut p = Parser::new();
        p.feed(line.as_bytes());
        let tag = p.read_word().unwrap().unwrap();
        let name = p.read_word().unwrap().unwrap();
        let args = p.read_args(0).unwrap().unwrap();
        (tag, name, args)
    }

    #[test]
    fn parses_tag_name_and_atoms() {
        let (tag, name, args) = parse_line("a1 LOGIN alice secret\r\n");
        assert_eq!(tag, "a1");
        assert_eq!(name, "LOGIN");
        assert_eq!(
            args,
            vec![
                Arg::Atom("alice".to_string()),
                Arg::Atom("secret".to_string())
            ]
        );
    }

    #[test]
    fn needs_more_data_until_newline_then_resumes() {
        let mut p = Parser::new();
        p.feed(b"a1 NO");
        assert_eq!(p.read_word().unwrap(), None);
        p.feed(b"OP\r\n");
        assert_eq!(p.read_word().unwrap().unwrap(), "a1");
        assert_eq!(p.read_word().unwrap().unwrap(), "NOOP");
        assert_eq!(p.read_args(0).unwrap().unwrap(), vec![]);
    }

    #[test]
    fn quoted_strings_resolve_escapes() {
        let (_, _, args) = parse_line("a1 LOGIN \"al ice\" \"p\\\"w\\\\d\"\r\n");
        assert_eq!(
            args,
            vec![
                Arg::Quoted("al ice".to_string()),
                Arg::Quoted("p\"w\\d".to_string())
            ]
        );
    }

    #[test]
    fn parses_parenthesized_lists() {
        let (_, _, args) = parse_line("a1 X (one (two three) \"f o\")\r\n");
        assert_eq!(
            args,
            vec![Arg::List(vec![
                Arg::Atom("one".to_string()),
                Arg::List(vec![
                    Arg::Atom("two".to_string()),
                    Arg::Atom("three".to_string())
                ]),
                Arg::Quoted("f o".to_string()),
            ])]
        );
    }

    #[test]
    fn unterminated_quote_is_nonfatal() {
        let mut p = Parser::new();
        p.feed(b"a1 LOGIN \"alice\r\n");
        p.read_word().unwrap().unwrap();
        p.read_word().unwrap().unwrap();
        let err = p.read_args(0).unwrap_err();
        assert!(!err.fatal);
        assert_eq!(err.message, "Missing '\"'.");
    }

    #[test]
    fn literals_are_rejected_nonfatally() {
        let mut p = Parser::new();
        p.feed(b"a1 LOGIN {5}\r\n");
        p.read_word().unwrap().unwrap();
        p.read_word().unwrap().unwrap();
        let err = p.read_args(0).unwrap_err();
        assert!(!err.fatal);
        assert_eq!(err.message, "Literals are not allowed here.");
    }

    #[test]
    fn too_many_arguments_is_nonfatal() {
        let mut p = Parser::new();
        p.feed(b"a1 LOGIN a b c\r\n");
        p.read_word().unwrap().unwrap();
        p.read_word().unwrap().unwrap();
        let err = p.read_args(2).unwrap_err();
        assert!(!err.fatal);
    }

    #[test]
    fn line_of_exactly_max_bytes_parses() {
        let mut p = Parser::new();
        let mut line = b"a1 NOOP ".to_vec();
        line.resize(MAX_IMAP_LINE, b'x');
        line.extend_from_slice(b"\r\n");
        p.feed(&line);
        assert_eq!(p.read_word().unwrap().unwrap(), "a1");
    }

    #[test]
    fn line_one_byte_over_max_is_fatal() {
        let mut p = Parser::new();
        let mut line = b"a1 NOOP ".to_vec();
        line.resize(MAX_IMAP_LINE + 1, b'x');
        line.extend_from_slice(b"\r\n");
        p.feed(&line);
        let err = p.read_word().unwrap_err();
        assert!(err.fatal);
    }

    #[test]
    fn unterminated_overlong_line_is_fatal_without_newline() {
        let mut p = Parser::new();
        p.feed(&vec![b'x'; MAX_IMAP_LINE + 1]);
        let err = p.read_word().unwrap_err();
        assert!(err.fatal);
    }

    #[test]
    fn reset_keeps_pipelined_lines() {
        let mut p = Parser::new();
        p.feed(b"a1 BOGUS junk\r\na2 NOOP\r\n");
        p.read_word().unwrap().unwrap();
        p.read_word().unwrap().unwrap();
        p.reset();
        assert_eq!(p.read_word().unwrap().unwrap(), "a2");
        assert_eq!(p.read_word().unwrap().unwrap(), "NOOP");
    }

    #[test]
    fn reset_on_incomplete_line_skips_its_remainder() {
        let mut p = Parser::new();
        p.feed(b"a1 PARTIAL");
        p.reset();
        p.feed(b" more junk\r\na2 NOOP\r\n");
        assert_eq!(p.read_word().unwrap().unwrap(), "a2");
    }

    #[test]
    fn read_line_returns_raw_continuation_data() {
        let mut p = Parser::new();
        p.feed(b"dGVzdA==\r\n");
        assert_eq!(p.read_line().unwrap().unwrap(), "dGVzdA==");
        // The line was consumed whole; nothing is left to read.
        assert_eq!(p.read_line().unwrap(), None);
    }

    #[test]
    fn bare_lf_terminates_a_line() {
        let mut p = Parser::new();
        p.feed(b"a1 NOOP\n");
        assert_eq!(p.read_word().unwrap().unwrap(), "a1");
        assert_eq!(p.read_word().unwrap().unwrap(), "NOOP");
    }
}

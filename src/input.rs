//! Reading user turns.
//!
//! A line ending in `\` flips multiline collection for the next line. A line
//! ending in `/` submits the buffer as-is without a trailing newline. Any
//! other line is kept with its newline.

use std::io::{self, BufRead};

/// Read one line. Returns the text and whether collection continues, or
/// `None` at end of input.
pub fn read_line<R: BufRead>(reader: &mut R, multiline: bool) -> io::Result<Option<(String, bool)>> {
    let mut line = String::new();
    if reader.read_line(&mut line)? == 0 {
        return Ok(None);
    }
    if line.ends_with('\n') {
        line.pop();
        if line.ends_with('\r') {
            line.pop();
        }
    }

    if line.is_empty() {
        return Ok(Some(("\n".to_string(), multiline)));
    }

    let mut more = multiline;
    if line.ends_with('/') {
        line.pop();
        return Ok(Some((line, false)));
    } else if line.ends_with('\\') {
        line.pop();
        more = !more;
    }
    line.push('\n');
    Ok(Some((line, more)))
}

/// Collect one user turn.
///
/// A result of length one or less hands control back without queuing input.
/// Returns `None` when input ended before anything was read.
pub fn read_user_input<R: BufRead>(reader: &mut R, multiline: bool) -> io::Result<Option<String>> {
    let mut buffer = String::new();
    loop {
        match read_line(reader, multiline)? {
            Some((line, more)) => {
                buffer.push_str(&line);
                if !more {
                    return Ok(Some(buffer));
                }
            }
            None if buffer.is_empty() => return Ok(None),
            None => return Ok(Some(buffer)),
        }
    }
}

/// Replace `\n`, `\r`, `\t`, `\'`, `\"`, `\\` and `\xHH` escapes. Unknown
/// escapes are kept verbatim, and so is `\xHH` above `\x7f`: a lone byte
/// past ASCII is not valid text on its own.
pub fn process_escapes(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some('\'') => out.push('\''),
            Some('"') => out.push('"'),
            Some('\\') => out.push('\\'),
            Some('x') => {
                let hex: String = chars.clone().take(2).collect();
                match u8::from_str_radix(&hex, 16) {
                    Ok(byte)
                        if byte.is_ascii()
                            && hex.len() == 2
                            && hex.chars().all(|c| c.is_ascii_hexdigit()) =>
                    {
                        out.push(char::from(byte));
                        chars.nth(1);
                    }
                    _ => out.push_str("\\x"),
                }
            }
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn plain_line_keeps_newline() {
        let mut input = Cursor::new("hello\n");
        assert_eq!(read_user_input(&mut input, false).unwrap().unwrap(), "hello\n");
        assert_eq!(read_user_input(&mut input, false).unwrap(), None);
    }

    #[test]
    fn slash_submits_without_newline() {
        let mut input = Cursor::new("first\\\nsecond/\nthird\n");
        assert_eq!(
            read_user_input(&mut input, false).unwrap().unwrap(),
            "first\nsecond"
        );
        assert_eq!(read_user_input(&mut input, false).unwrap().unwrap(), "third\n");
    }

    #[test]
    fn backslash_toggles_multiline() {
        let mut input = Cursor::new("a\nb\\\n");
        assert_eq!(read_user_input(&mut input, true).unwrap().unwrap(), "a\nb\n");

        let mut input = Cursor::new("a\\\nb\n");
        assert_eq!(read_user_input(&mut input, false).unwrap().unwrap(), "a\nb\n");
    }

    #[test]
    fn empty_line_is_the_pass_back_sentinel() {
        let mut input = Cursor::new("\r\n");
        let buffer = read_user_input(&mut input, false).unwrap().unwrap();
        assert!(buffer.len() <= 1);
    }

    #[test]
    fn eof_mid_collection_returns_partial_buffer() {
        let mut input = Cursor::new("partial\\\n");
        assert_eq!(read_user_input(&mut input, false).unwrap().unwrap(), "partial\n");
    }

    #[test]
    fn escapes() {
        assert_eq!(process_escapes(r"a\nb\tc\\d\'e\q"), "a\nb\tc\\d'e\\q");
        assert_eq!(process_escapes("trailing\\"), "trailing\\");
        assert_eq!(process_escapes(r"\x41\x4a!"), "AJ!");
        assert_eq!(process_escapes(r"\x+f \xz"), "\\x+f \\xz");
        assert_eq!(process_escapes(r"\xff\x7f"), "\\xff\u{7f}");
    }
}

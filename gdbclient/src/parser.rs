/// GDB/MI output parser
///
/// This module turns one line of GDB/MI output into a typed [`Record`].
/// It is pure: no I/O and no shared state.

use crate::types::*;
use crate::GdbError;
use regex::Regex;
use std::iter::Peekable;
use std::str::Chars;
use std::sync::OnceLock;

type Cursor<'a> = Peekable<Chars<'a>>;

/// Prompt emitted by GDB once it is ready for input
pub const PROMPT: &str = "(gdb)";

fn record_head() -> &'static Regex {
    static HEAD: OnceLock<Regex> = OnceLock::new();
    HEAD.get_or_init(|| {
        Regex::new(r"^(\d*)([\^*+=~@&])(.*)$").unwrap_or_else(|e| panic!("record head regex: {e}"))
    })
}

/// Parse a line of GDB/MI output
pub fn parse_record(line: &str) -> Result<Record, GdbError> {
    let line = line.trim_end_matches(&['\r', '\n'][..]);

    if line.trim() == PROMPT {
        return Ok(Record::Prompt);
    }

    let malformed = |reason: String| GdbError::MalformedRecord {
        line: line.to_string(),
        reason,
    };

    let caps = record_head()
        .captures(line)
        .ok_or_else(|| malformed("unrecognised record prefix".into()))?;

    let token = match &caps[1] {
        "" => 0,
        digits => digits
            .parse::<u32>()
            .map_err(|e| malformed(format!("bad token: {}", e)))?,
    };
    let body = &caps[3];

    let record = match &caps[2] {
        "~" => Record::Stream(parse_stream_record(StreamKind::Console, body).map_err(malformed)?),
        "@" => Record::Stream(parse_stream_record(StreamKind::Target, body).map_err(malformed)?),
        "&" => Record::Stream(parse_stream_record(StreamKind::Log, body).map_err(malformed)?),
        "^" => {
            let (class, fields) = parse_class_and_fields(body).map_err(malformed)?;
            let class = ResultClass::from_name(&class)
                .ok_or_else(|| malformed(format!("unknown result class: {}", class)))?;
            Record::Result(ResultRecord {
                token,
                class,
                fields,
                output: Vec::new(),
            })
        }
        prefix => {
            let kind = match prefix {
                "*" => AsyncKind::Exec,
                "+" => AsyncKind::Status,
                _ => AsyncKind::Notify,
            };
            let (class, fields) = parse_class_and_fields(body).map_err(malformed)?;
            Record::Async(AsyncRecord {
                token,
                kind,
                class: AsyncClass::from_name(&class),
                fields,
            })
        }
    };

    Ok(record)
}

/// Parse a stream record body (a single C-string)
fn parse_stream_record(kind: StreamKind, body: &str) -> Result<StreamRecord, String> {
    let mut chars = body.chars().peekable();
    let text = parse_c_string(&mut chars)?;
    expect_end(&mut chars)?;

    Ok(StreamRecord { kind, text })
}

/// Parse `class-name[,name=value]*`
fn parse_class_and_fields(body: &str) -> Result<(String, Fields), String> {
    let mut chars = body.chars().peekable();
    let class = parse_identifier(&mut chars)?;
    let mut fields = Fields::new();

    while let Some(ch) = chars.next() {
        if ch != ',' {
            return Err(format!("expected ',' after '{}' but found '{}'", class, ch));
        }
        let (name, value) = parse_result(&mut chars)?;
        fields.push(name, value);
    }

    Ok((class, fields))
}

fn expect_end(chars: &mut Cursor) -> Result<(), String> {
    match chars.next() {
        None => Ok(()),
        Some(ch) => Err(format!("unexpected trailing '{}'", ch)),
    }
}

/// Parse one `name=value` pair
fn parse_result(chars: &mut Cursor) -> Result<(String, Value), String> {
    let name = parse_identifier(chars)?;

    if chars.next() != Some('=') {
        return Err(format!("expected '=' after '{}'", name));
    }

    let value = parse_value(chars)?;
    Ok((name, value))
}

/// Parse an identifier (field or class name)
fn parse_identifier(chars: &mut Cursor) -> Result<String, String> {
    let mut identifier = String::new();

    while let Some(&ch) = chars.peek() {
        if ch.is_ascii_alphanumeric() || ch == '_' || ch == '-' {
            identifier.push(ch);
            chars.next();
        } else {
            break;
        }
    }

    if identifier.is_empty() {
        return Err("empty identifier".into());
    }

    Ok(identifier)
}

/// Parse a value (string, list, or tuple)
fn parse_value(chars: &mut Cursor) -> Result<Value, String> {
    match chars.peek() {
        Some('"') => parse_c_string(chars).map(Value::String),
        Some('[') => {
            chars.next();
            parse_sequence(chars, ']')
        }
        Some('{') => {
            chars.next();
            parse_sequence(chars, '}')
        }
        Some(other) => Err(format!("expected value but found '{}'", other)),
        None => Err("expected value but found end of line".into()),
    }
}

/// Parse the inside of `{...}` or `[...]`.
///
/// Named entries give a tuple whatever the brackets, bare values give a list.
fn parse_sequence(chars: &mut Cursor, close: char) -> Result<Value, String> {
    if chars.peek() == Some(&close) {
        chars.next();
        return Ok(if close == '}' {
            Value::Tuple(Fields::new())
        } else {
            Value::List(Vec::new())
        });
    }

    let named = !matches!(chars.peek(), Some('"') | Some('{') | Some('['));
    let mut fields = Fields::new();
    let mut list = Vec::new();

    loop {
        if named {
            let (name, value) = parse_result(chars)?;
            fields.push(name, value);
        } else {
            list.push(parse_value(chars)?);
        }

        match chars.next() {
            Some(',') => continue,
            Some(ch) if ch == close => break,
            Some(ch) => return Err(format!("expected ',' or '{}' but found '{}'", close, ch)),
            None => return Err(format!("unbalanced '{}'", close)),
        }
    }

    Ok(if named {
        Value::Tuple(fields)
    } else {
        Value::List(list)
    })
}

/// Parse a C-style string (removes quotes and handles escape sequences)
///
/// Octal escapes are raw bytes, so the text is assembled as bytes and
/// decoded once at the end.
fn parse_c_string(chars: &mut Cursor) -> Result<String, String> {
    if chars.next() != Some('"') {
        return Err("expected '\"'".into());
    }

    let mut bytes = Vec::new();
    let mut buf = [0u8; 4];
    let mut push = |bytes: &mut Vec<u8>, ch: char| {
        bytes.extend_from_slice(ch.encode_utf8(&mut buf).as_bytes());
    };

    loop {
        match chars.next() {
            None => return Err("unterminated string".into()),
            Some('"') => return Ok(String::from_utf8_lossy(&bytes).into_owned()),
            Some('\\') => match chars.next() {
                Some('n') => bytes.push(b'\n'),
                Some('t') => bytes.push(b'\t'),
                Some('r') => bytes.push(b'\r'),
                Some('\\') => bytes.push(b'\\'),
                Some('"') => bytes.push(b'"'),
                Some(d @ '0'..='7') => bytes.push(parse_octal_escape(d, chars)),
                Some(other) => {
                    bytes.push(b'\\');
                    push(&mut bytes, other);
                }
                None => return Err("unterminated string".into()),
            },
            Some(ch) => push(&mut bytes, ch),
        }
    }
}

/// `\NNN` escape, up to three octal digits
fn parse_octal_escape(first: char, chars: &mut Cursor) -> u8 {
    let mut code = first.to_digit(8).unwrap_or(0);

    for _ in 0..2 {
        match chars.peek().and_then(|c| c.to_digit(8)) {
            Some(digit) => {
                code = code * 8 + digit;
                chars.next();
            }
            None => break,
        }
    }

    (code & 0xff) as u8
}

//! Line grammar for P1 telegrams: `code[:subcode](value[*unit])`.

use super::telegram::Reading;
use nom::IResult;
use nom::bytes::complete::{take_till1, take_while1};
use nom::character::complete::char;
use nom::combinator::opt;
use nom::sequence::{delimited, pair, preceded};

/// Gas readings carry a capture timestamp before the volume
const GAS_FAMILY: &str = "0-1:24.2.";
const GAS_UNIT: &str = "m3";

fn is_code_char(c: char) -> bool {
    c.is_ascii_digit() || c == '-' || c == ':' || c == '.'
}

fn code(input: &str) -> IResult<&str, &str> {
    take_while1(is_code_char)(input)
}

fn value_group(input: &str) -> IResult<&str, (&str, Option<&str>)> {
    delimited(
        char('('),
        pair(
            take_till1(|c: char| c == ')' || c == '*'),
            opt(preceded(char('*'), take_till1(|c: char| c == ')'))),
        ),
        char(')'),
    )(input)
}

/// Collapse the `a-b:c:.d.e` spelling some meters emit into the standard
/// `a-b:c.d.e` form so lookups use a single key.
pub fn normalize_code(raw: &str) -> String {
    raw.replace(":.", ".").trim_end_matches(':').to_string()
}

/// Rightmost `digits.digits` literal in the line.
fn rightmost_decimal(line: &str) -> Option<&str> {
    let bytes = line.as_bytes();
    let mut end = bytes.len();
    while end > 0 {
        // Find the end of a digit run
        while end > 0 && !bytes[end - 1].is_ascii_digit() {
            end -= 1;
        }
        if end == 0 {
            return None;
        }
        let mut start = end;
        while start > 0 && bytes[start - 1].is_ascii_digit() {
            start -= 1;
        }
        if start >= 2 && bytes[start - 1] == b'.' && bytes[start - 2].is_ascii_digit() {
            let mut int_start = start - 1;
            while int_start > 0 && bytes[int_start - 1].is_ascii_digit() {
                int_start -= 1;
            }
            return Some(&line[int_start..end]);
        }
        end = start;
    }
    None
}

/// Parse one raw telegram line. Lines that do not match the grammar yield
/// `None` and are dropped by the caller.
pub fn parse_line(raw: &str) -> Option<Reading> {
    let line = raw.trim();
    let (rest, raw_code) = code(line).ok()?;
    let (_, (value, unit)) = value_group(rest).ok()?;
    let code = normalize_code(raw_code);

    if code.starts_with(GAS_FAMILY) {
        if let Some(volume) = rightmost_decimal(line) {
            return Some(Reading::new(code, volume, Some(GAS_UNIT)));
        }
    }

    Some(Reading::new(code, value, unit))
}

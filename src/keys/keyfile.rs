//! Reading and writing BIND key files.
//!
//! A public key file `K<zone>+<alg>+<tag>.key` contains a DNSKEY record in
//! zone file format. BIND precedes it with a header comment and the timing
//! metadata as comments:
//!
//! ```text
//! ; This is a zone-signing key, keyid 12345, for example.com.
//! ; Created: 20250101000000 (Wed Jan  1 00:00:00 2025)
//! ; Publish: 20250101000000 (Wed Jan  1 00:00:00 2025)
//! example.com. IN DNSKEY 256 3 8 AwEAAc...
//! ```
//!
//! The private key file carries the same metadata as `Publish: ...` lines
//! after the key material. Lines this module does not know about are kept
//! as they are when a file is rewritten.

use std::fmt;

use chrono::{DateTime, NaiveDateTime, Utc};

use super::{Role, Timing, TimingField};

/// The format of timestamps in key files.
const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";

/// The format of the human readable copy of a timestamp in comments.
const HUMAN_FORMAT: &str = "%a %b %e %H:%M:%S %Y";

//------------ ParsedKey -----------------------------------------------------

/// The information found in a public key file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParsedKey {
    /// The owner name of the DNSKEY record.
    pub owner: String,
    pub role: Role,
    pub algorithm: u8,
    pub key_tag: u16,
    pub timing: Timing,
}

//------------ ParseError ----------------------------------------------------

/// A key file did not have the expected content.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParseError(String);

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for ParseError {}

impl From<String> for ParseError {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for ParseError {
    fn from(value: &str) -> Self {
        Self(value.into())
    }
}

//------------ Base names ----------------------------------------------------

/// The base name of the files of a key.
pub fn base_name(owner: &str, algorithm: u8, key_tag: u16) -> String {
    format!("K{owner}+{algorithm:03}+{key_tag:05}")
}

/// Split a base name `K<owner>+<alg>+<tag>` into its parts.
pub fn split_base_name(base: &str) -> Option<(&str, u8, u16)> {
    let rest = base.strip_prefix('K')?;
    let mut parts = rest.rsplitn(3, '+');
    let key_tag = parts.next()?;
    let algorithm = parts.next()?;
    let owner = parts.next()?;
    if owner.is_empty() || key_tag.len() != 5 || algorithm.len() != 3 {
        return None;
    }
    Some((owner, algorithm.parse().ok()?, key_tag.parse().ok()?))
}

//------------ Parsing -------------------------------------------------------

/// Parse a public key file.
///
/// The base name is needed because BIND identifies a key by its file name;
/// a header or record that disagrees with the name makes the file invalid.
pub fn parse_public(base: &str, text: &str) -> Result<ParsedKey, ParseError> {
    let (name_owner, name_algorithm, name_tag) =
        split_base_name(base).ok_or_else(|| format!("'{base}' is not a key file name"))?;

    let mut timing = Timing::default();
    let mut header_tag = None;
    let mut record = None;

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(comment) = line.strip_prefix(';') {
            if let Some((field, value)) = parse_metadata_comment(comment)? {
                timing.set(field, Some(value));
            } else if let Some((_role, tag)) = parse_header(comment) {
                header_tag = Some(tag);
            }
            continue;
        }
        if record.is_some() {
            return Err("more than one record in public key file".into());
        }
        record = Some(parse_dnskey(line)?);
    }

    let (owner, flags, algorithm) = record.ok_or("no DNSKEY record found")?;

    if !owner.eq_ignore_ascii_case(name_owner) {
        return Err(format!("record owner {owner} does not match file name").into());
    }
    if algorithm != name_algorithm {
        return Err(format!("algorithm {algorithm} does not match file name").into());
    }
    if let Some(tag) = header_tag {
        if tag != name_tag {
            return Err(format!("key id {tag} does not match file name").into());
        }
    }
    if timing.get(TimingField::Created).is_none() {
        return Err("no Created timestamp".into());
    }

    Ok(ParsedKey {
        owner: name_owner.to_ascii_lowercase(),
        role: Role::from_flags(flags),
        algorithm,
        key_tag: name_tag,
        timing,
    })
}

/// Parse the timing lines of a private key file.
pub fn parse_private_timing(text: &str) -> Result<Timing, ParseError> {
    let mut timing = Timing::default();
    for line in text.lines() {
        if let Some((tag, value)) = line.split_once(':') {
            if let Some(field) = TimingField::from_tag(tag.trim()) {
                timing.set(field, Some(parse_timestamp(value.trim())?));
            }
        }
    }
    Ok(timing)
}

/// Parse a `YYYYMMDDHHMMSS` timestamp.
///
/// Anything after the first whitespace is ignored, which skips the human
/// readable copy BIND adds in comments.
pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, ParseError> {
    let digits = value.split_whitespace().next().unwrap_or_default();
    if digits.len() != 14 {
        return Err(format!("invalid timestamp '{value}'").into());
    }
    NaiveDateTime::parse_from_str(digits, TIMESTAMP_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|e| format!("invalid timestamp '{value}': {e}").into())
}

/// Parse a `Tag: value` metadata comment.
fn parse_metadata_comment(
    comment: &str,
) -> Result<Option<(TimingField, DateTime<Utc>)>, ParseError> {
    let Some((tag, value)) = comment.trim().split_once(':') else {
        return Ok(None);
    };
    let Some(field) = TimingField::from_tag(tag.trim()) else {
        return Ok(None);
    };
    Ok(Some((field, parse_timestamp(value.trim())?)))
}

/// Parse the `This is a zone-signing key, keyid N, for NAME` header.
fn parse_header(comment: &str) -> Option<(Role, u16)> {
    let rest = comment.trim().strip_prefix("This is a ")?;
    let (label, rest) = rest.split_once("-signing key, keyid ")?;
    let role = match label {
        "zone" => Role::Zsk,
        "key" => Role::Ksk,
        _ => return None,
    };
    let (tag, _) = rest.split_once(',')?;
    Some((role, tag.trim().parse().ok()?))
}

/// Parse a DNSKEY record into owner, flags and algorithm.
fn parse_dnskey(line: &str) -> Result<(String, u16, u8), ParseError> {
    let tokens: Vec<_> = line.split_whitespace().collect();
    let pos = tokens
        .iter()
        .position(|token| token.eq_ignore_ascii_case("DNSKEY"))
        .ok_or_else(|| format!("not a DNSKEY record: {line}"))?;
    if pos == 0 || tokens.len() < pos + 5 {
        return Err(format!("incomplete DNSKEY record: {line}").into());
    }
    let flags = tokens[pos + 1]
        .parse()
        .map_err(|_| format!("invalid DNSKEY flags '{}'", tokens[pos + 1]))?;
    let algorithm = tokens[pos + 3]
        .parse()
        .map_err(|_| format!("invalid DNSKEY algorithm '{}'", tokens[pos + 3]))?;
    Ok((tokens[0].to_string(), flags, algorithm))
}

//------------ Serializing ---------------------------------------------------

/// Format a timestamp the way key files store it.
pub fn format_timestamp(value: DateTime<Utc>) -> String {
    value.format(TIMESTAMP_FORMAT).to_string()
}

/// The header and metadata comments of a public key file.
pub fn public_header(owner: &str, role: Role, key_tag: u16, timing: &Timing) -> String {
    let mut out = format!(
        "; This is a {}-signing key, keyid {key_tag}, for {owner}\n",
        role.bind_label()
    );
    for (field, value) in timing.iter() {
        out.push_str(&format!(
            "; {}: {} ({})\n",
            field.tag(),
            format_timestamp(value),
            value.format(HUMAN_FORMAT)
        ));
    }
    out
}

/// Rewrite a public key file with new timing metadata.
///
/// The header and all metadata comments are replaced, everything else is
/// kept in its original order.
pub fn update_public(
    text: &str,
    owner: &str,
    role: Role,
    key_tag: u16,
    timing: &Timing,
) -> String {
    let mut out = public_header(owner, role, key_tag, timing);
    for line in text.lines() {
        if let Some(comment) = line.trim().strip_prefix(';') {
            if parse_header(comment).is_some() || is_metadata_comment(comment) {
                continue;
            }
        }
        out.push_str(line);
        out.push('\n');
    }
    out
}

/// Rewrite a private key file with new timing metadata.
pub fn update_private(text: &str, timing: &Timing) -> String {
    let mut out = String::with_capacity(text.len() + 128);
    for line in text.lines() {
        let is_timing = line
            .split_once(':')
            .is_some_and(|(tag, _)| TimingField::from_tag(tag.trim()).is_some());
        if !is_timing {
            out.push_str(line);
            out.push('\n');
        }
    }
    for (field, value) in timing.iter() {
        out.push_str(&format!("{}: {}\n", field.tag(), format_timestamp(value)));
    }
    out
}

fn is_metadata_comment(comment: &str) -> bool {
    comment
        .trim()
        .split_once(':')
        .is_some_and(|(tag, _)| TimingField::from_tag(tag.trim()).is_some())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const BASE: &str = "Kexample.com.+008+12345";

    const PUBLIC: &str = "\
; This is a key-signing key, keyid 12345, for example.com.
; Created: 20150601120000 (Mon Jun  1 12:00:00 2015)
; Publish: 20150601120000 (Mon Jun  1 12:00:00 2015)
; Activate: 20150611120000 (Thu Jun 11 12:00:00 2015)
example.com. 3600 IN DNSKEY 257 3 8 AwEAAcFcGsaxxdgiuuGmCkVI
";

    const PRIVATE: &str = "\
Private-key-format: v1.3
Algorithm: 8 (RSASHA256)
Modulus: AwEAAcFcGsaxxdgiuuGmCkVI
Created: 20150601120000
Publish: 20150601120000
Activate: 20150611120000
";

    fn ts(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap()
    }

    #[test]
    fn parse_bind_public_key() {
        let parsed = parse_public(BASE, PUBLIC).unwrap();
        assert_eq!(parsed.owner, "example.com.");
        assert_eq!(parsed.role, Role::Ksk);
        assert_eq!(parsed.algorithm, 8);
        assert_eq!(parsed.key_tag, 12345);
        assert_eq!(
            parsed.timing.get(TimingField::Created),
            Some(ts(2015, 6, 1))
        );
        assert_eq!(
            parsed.timing.get(TimingField::Activate),
            Some(ts(2015, 6, 11))
        );
        assert_eq!(parsed.timing.get(TimingField::Inactive), None);
    }

    #[test]
    fn reject_mismatching_files() {
        assert!(parse_public("Kexample.com.+008+54321", PUBLIC).is_err());
        assert!(parse_public("Kother.com.+008+12345", PUBLIC).is_err());
        assert!(parse_public("Kexample.com.+013+12345", PUBLIC).is_err());
        assert!(parse_public("not-a-key", PUBLIC).is_err());
        assert!(parse_public(BASE, "; Created: 20150601120000\n").is_err());
        assert!(parse_public(BASE, "example.com. IN DNSKEY 257 3 8 AwEAAc\n").is_err());
        assert!(parse_public(BASE, "; Created: 2015\nexample.com. IN DNSKEY 257 3 8 A\n").is_err());
    }

    #[test]
    fn split_names() {
        assert_eq!(
            split_base_name("Kexample.com.+008+00042"),
            Some(("example.com.", 8, 42))
        );
        assert_eq!(split_base_name("Kexample.com.+8+42"), None);
        assert_eq!(base_name("example.com.", 13, 42), "Kexample.com.+013+00042");
    }

    #[test]
    fn rewrite_keeps_record_and_key_material() {
        let mut timing = parse_public(BASE, PUBLIC).unwrap().timing;
        timing.set(TimingField::Inactive, Some(ts(2015, 7, 1)));

        let public = update_public(PUBLIC, "example.com.", Role::Ksk, 12345, &timing);
        assert!(public.starts_with("; This is a key-signing key, keyid 12345, for example.com.\n"));
        assert!(public.contains("; Inactive: 20150701120000 (Wed Jul  1 12:00:00 2015)\n"));
        assert!(public.ends_with("example.com. 3600 IN DNSKEY 257 3 8 AwEAAcFcGsaxxdgiuuGmCkVI\n"));
        assert_eq!(public.matches("; Created:").count(), 1);
        assert_eq!(parse_public(BASE, &public).unwrap().timing, timing);

        let private = update_private(PRIVATE, &timing);
        assert!(private.starts_with("Private-key-format: v1.3\nAlgorithm: 8 (RSASHA256)\n"));
        assert!(private.contains("Modulus: AwEAAcFcGsaxxdgiuuGmCkVI\n"));
        assert!(private.ends_with("Inactive: 20150701120000\n"));
        assert_eq!(parse_private_timing(&private).unwrap(), timing);
    }
}

use core::str::FromStr;
use std::time::Duration;

use domain::base::Name;
use jiff::{Span, SpanRelativeTo};

use crate::error::Error;

pub fn parse_name(arg: &str) -> Result<Name<Vec<u8>>, Error> {
    Name::from_str(&arg.to_lowercase()).map_err(|e| Error::from(e.to_string()))
}

/// Parse a duration.
///
/// Accepts a plain number of seconds or a span with units like `30d`,
/// `5d 12h` or `P1W`.
pub fn parse_duration(value: &str) -> Result<Duration, Error> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    let span: Span = value
        .parse()
        .map_err(|e| format!("unable to parse {value} as duration: {e}"))?;
    let signeddur = span
        .to_duration(SpanRelativeTo::days_are_24_hours())
        .map_err(|e| format!("unable to convert duration: {e}"))?;
    Duration::try_from(signeddur).map_err(|e| format!("unable to convert duration: {e}").into())
}

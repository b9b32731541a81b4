use std::time::Duration;

use anyhow::anyhow;
use nom::character::complete::char;
use nom::combinator::{map_res, opt};
use nom::sequence::{preceded, terminated, tuple};
use nom_supreme::ParserExt;
use serde::{Deserialize, Deserializer, Serializer};

use crate::common::parser::{NomResult, consume_all, p_u32};

/// Formats a duration as `HH:MM:SS`.
pub fn format_duration(duration: &Duration) -> String {
    let mut seconds = duration.as_secs();
    let hours = seconds / 3600;
    seconds %= 3600;
    let minutes = seconds / 60;
    seconds %= 60;
    format!("{hours:02}:{minutes:02}:{seconds:02}")
}

/// Formats a duration as `D-HH:MM:SS`, the walltime format understood by Slurm and
/// by the external program's `--timelimit` option.
pub fn format_slurm_time(duration: &Duration) -> String {
    let mut seconds = duration.as_secs();
    let days = seconds / 86400;
    seconds %= 86400;
    format!("{days}-{}", format_duration(&Duration::from_secs(seconds)))
}

fn p_hms_time(input: &str) -> NomResult<Duration> {
    map_res(
        tuple((
            p_u32,
            opt(preceded(char(':'), p_u32)),
            opt(preceded(char(':'), p_u32)),
        ))
        .context("[[HH:]MM:]SS value"),
        |parsed| match parsed {
            (seconds, None, None) => Ok(Duration::from_secs(seconds as u64)),
            (minutes, Some(seconds), None) => {
                Ok(Duration::from_secs(minutes as u64 * 60 + seconds as u64))
            }
            (hours, Some(minutes), Some(seconds)) => Ok(Duration::from_secs(
                hours as u64 * 3600 + minutes as u64 * 60 + seconds as u64,
            )),
            _ => Err(anyhow!("Invalid time specification")),
        },
    )(input)
}

fn p_slurm_duration(input: &str) -> NomResult<Duration> {
    map_res(
        tuple((opt(terminated(p_u32, char('-'))), p_hms_time)).context("[D-]HH:MM:SS value"),
        |(days, time)| -> anyhow::Result<Duration> {
            Ok(Duration::from_secs(days.unwrap_or(0) as u64 * 86400) + time)
        },
    )(input)
}

/// Parses time strings in the format [[hh:]mm:]ss.
pub fn parse_hms_time(input: &str) -> anyhow::Result<Duration> {
    consume_all(p_hms_time, input)
}

/// Parses time strings in the format [D-][[hh:]mm:]ss.
pub fn parse_slurm_duration(input: &str) -> anyhow::Result<Duration> {
    consume_all(p_slurm_duration, input)
}

/// Accepts either `[D-]HH:MM:SS` or humantime (`2h 30m`).
pub fn parse_duration_value(text: &str) -> anyhow::Result<Duration> {
    let text = text.trim();
    parse_slurm_duration(text)
        .or_else(|_| humantime::parse_duration(text))
        .map_err(|e| {
            anyhow!(
                "Could not parse duration `{text}`. Use either `[D-]HH:MM:SS` or humantime format (2hours): {e:?}"
            )
        })
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DurationValue {
    Seconds(u64),
    Text(String),
}

impl DurationValue {
    fn into_duration(self) -> anyhow::Result<Duration> {
        match self {
            DurationValue::Seconds(secs) => Ok(Duration::from_secs(secs)),
            DurationValue::Text(text) => parse_duration_value(&text),
        }
    }
}

pub fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    DurationValue::deserialize(deserializer)?
        .into_duration()
        .map_err(serde::de::Error::custom)
}

pub fn deserialize_opt_duration<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<DurationValue>::deserialize(deserializer)? {
        Some(value) => value
            .into_duration()
            .map(Some)
            .map_err(serde::de::Error::custom),
        None => Ok(None),
    }
}

pub fn serialize_duration<S: Serializer>(
    duration: &Duration,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&format_slurm_time(duration))
}

pub fn serialize_opt_duration<S: Serializer>(
    duration: &Option<Duration>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match duration {
        Some(duration) => serialize_duration(duration, serializer),
        None => serializer.serialize_none(),
    }
}

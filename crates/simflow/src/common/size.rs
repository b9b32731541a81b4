use anyhow::anyhow;
use nom::character::complete::{alpha0, space0};
use nom::combinator::map_res;
use nom::number::complete::double;
use nom::sequence::tuple;
use nom_supreme::ParserExt;
use serde::{Deserialize, Deserializer};

use crate::common::parser::{NomResult, consume_all};

fn unit_factor(unit: &str) -> anyhow::Result<f64> {
    match unit.to_ascii_lowercase().as_str() {
        "" | "mb" | "m" => Ok(1.0),
        "kb" | "k" => Ok(1.0 / 1024.0),
        "gb" | "g" => Ok(1024.0),
        "tb" | "t" => Ok(1024.0 * 1024.0),
        _ => Err(anyhow!("unknown memory unit `{unit}`")),
    }
}

fn p_memory(input: &str) -> NomResult<f64> {
    map_res(
        tuple((double, space0, alpha0)).context("memory value (e.g. `4 Gb`)"),
        |(value, _, unit)| -> anyhow::Result<f64> {
            if value < 0.0 {
                return Err(anyhow!("memory cannot be negative"));
            }
            Ok(value * unit_factor(unit)?)
        },
    )(input)
}

/// Parses a memory amount with an optional unit into megabytes.
pub fn parse_memory(text: &str) -> anyhow::Result<f64> {
    consume_all(p_memory, text.trim())
}

#[derive(Deserialize)]
#[serde(untagged)]
enum MemoryValue {
    Megabytes(f64),
    Text(String),
}

impl MemoryValue {
    fn into_megabytes(self) -> anyhow::Result<f64> {
        match self {
            MemoryValue::Megabytes(mb) if mb >= 0.0 => Ok(mb),
            MemoryValue::Megabytes(mb) => Err(anyhow!("memory cannot be negative: {mb}")),
            MemoryValue::Text(text) => parse_memory(&text),
        }
    }
}

pub fn deserialize_memory<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    MemoryValue::deserialize(deserializer)?
        .into_megabytes()
        .map_err(serde::de::Error::custom)
}

pub fn deserialize_opt_memory<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<MemoryValue>::deserialize(deserializer)? {
        Some(value) => value
            .into_megabytes()
            .map(Some)
            .map_err(serde::de::Error::custom),
        None => Ok(None),
    }
}

//! Reader for `key = value  # comment` processing templates.

use crate::core::epochs::parse_date;
use crate::types::{InsarError, InsarResult, PixelIndex};
use chrono::NaiveDate;
use regex::Regex;
use std::collections::BTreeMap;
use std::path::Path;

/// Prefix of the processing options in a template
pub const KEY_PREFIX: &str = "pysar.";

/// Parsed template with normalised keyword values
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Template {
    values: BTreeMap<String, String>,
}

/// Read a template file from disk
pub fn read_template<P: AsRef<Path>>(path: P) -> InsarResult<Template> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)?;
    let template = parse_template(&content)?;
    log::info!("Read {} options from {}", template.len(), path.display());
    Ok(template)
}

/// Parse template text; later keys override earlier ones
pub fn parse_template(content: &str) -> InsarResult<Template> {
    let line_pattern = Regex::new(r"^\s*([A-Za-z][\w.]*)\s*=\s*([^#]*?)\s*(?:#.*)?$")
        .map_err(|e| InsarError::Processing(format!("Regex error: {}", e)))?;

    let mut values = BTreeMap::new();
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with('%') {
            continue;
        }
        let Some(caps) = line_pattern.captures(trimmed) else {
            log::debug!("Skipping template line: {}", trimmed);
            continue;
        };
        let value = caps[2].trim();
        if value.is_empty() {
            continue;
        }
        values.insert(caps[1].to_string(), normalize_keyword(value));
    }

    Ok(Template { values })
}

/// Fold loose spellings of the keyword values
fn normalize_keyword(value: &str) -> String {
    match value.to_lowercase().as_str() {
        "default" | "auto" => "auto".to_string(),
        "n" | "no" | "off" | "false" => "no".to_string(),
        "y" | "yes" | "on" | "true" => "yes".to_string(),
        _ => value.to_string(),
    }
}

impl Template {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn insert(&mut self, key: &str, value: &str) {
        self.values.insert(key.to_string(), normalize_keyword(value));
    }

    /// Raw value, looked up with and without the option prefix
    pub fn raw(&self, key: &str) -> Option<&str> {
        self.values
            .get(&format!("{}{}", KEY_PREFIX, key))
            .or_else(|| self.values.get(key))
            .map(String::as_str)
    }

    /// Value unless missing or `auto`
    pub fn get(&self, key: &str) -> Option<&str> {
        self.raw(key).filter(|v| *v != "auto")
    }

    pub fn get_bool(&self, key: &str) -> InsarResult<Option<bool>> {
        match self.get(key) {
            None => Ok(None),
            Some("yes") => Ok(Some(true)),
            Some("no") => Ok(Some(false)),
            Some(other) => Err(InsarError::Configuration(format!(
                "{}: expected yes/no, got {}",
                key, other
            ))),
        }
    }

    pub fn get_f64(&self, key: &str) -> InsarResult<Option<f64>> {
        self.get(key)
            .map(|v| {
                v.parse::<f64>().map_err(|_| {
                    InsarError::Configuration(format!("{}: expected a number, got {}", key, v))
                })
            })
            .transpose()
    }

    pub fn get_usize(&self, key: &str) -> InsarResult<Option<usize>> {
        self.get(key)
            .map(|v| {
                v.parse::<usize>().map_err(|_| {
                    InsarError::Configuration(format!("{}: expected an integer, got {}", key, v))
                })
            })
            .transpose()
    }

    /// Value that may also be `no` (disabled)
    pub fn get_optional(&self, key: &str) -> Option<&str> {
        self.get(key).filter(|v| *v != "no")
    }
}

/// Split a list value on commas and whitespace
pub fn split_list(value: &str) -> Vec<&str> {
    value
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Dates list such as `20080520,20090817 090110`
pub fn parse_date_list(value: &str) -> InsarResult<Vec<NaiveDate>> {
    split_list(value).into_iter().map(parse_date).collect()
}

/// Index list with inclusive ranges, e.g. `1:5,25`
pub fn parse_index_list(value: &str) -> InsarResult<Vec<usize>> {
    let mut indices = Vec::new();
    for item in split_list(value) {
        let parse = |s: &str| {
            s.trim().parse::<usize>().map_err(|_| {
                InsarError::Configuration(format!("Invalid index '{}' in list {}", s, value))
            })
        };
        match item.split_once(':') {
            Some((start, end)) => {
                let (start, end) = (parse(start)?, parse(end)?);
                if start > end {
                    return Err(InsarError::Configuration(format!(
                        "Invalid index range {} in list {}",
                        item, value
                    )));
                }
                indices.extend(start..=end);
            }
            None => indices.push(parse(item)?),
        }
    }
    indices.sort_unstable();
    indices.dedup();
    Ok(indices)
}

/// Pixel coordinate given as `row,col`
pub fn parse_yx(value: &str) -> InsarResult<PixelIndex> {
    let parts = split_list(value);
    let parse = |s: &str| {
        s.parse::<usize>()
            .map_err(|_| InsarError::Configuration(format!("Invalid pixel coordinate: {}", value)))
    };
    match parts.as_slice() {
        [row, col] => Ok((parse(row)?, parse(col)?)),
        _ => Err(InsarError::Configuration(format!(
            "Pixel coordinate must be row,col, got {}",
            value
        ))),
    }
}

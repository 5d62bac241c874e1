use crate::types::{InsarError, InsarResult};
use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

/// Parse an acquisition date in `YYYYMMDD` or `YYMMDD` format
///
/// Two-digit years below 50 are taken as 20xx, the rest as 19xx.
pub fn parse_date(text: &str) -> InsarResult<NaiveDate> {
    let text = text.trim();
    if !text.is_ascii() {
        return Err(InsarError::InvalidFormat(format!("Invalid date: {}", text)));
    }
    let full = match text.len() {
        8 => text.to_string(),
        6 => {
            let yy: u32 = text[0..2].parse().map_err(|_| {
                InsarError::InvalidFormat(format!("Invalid date: {}", text))
            })?;
            let century = if yy < 50 { "20" } else { "19" };
            format!("{}{}", century, text)
        }
        _ => {
            return Err(InsarError::InvalidFormat(format!(
                "Date must be YYYYMMDD or YYMMDD: {}",
                text
            )))
        }
    };
    NaiveDate::parse_from_str(&full, "%Y%m%d")
        .map_err(|e| InsarError::InvalidFormat(format!("Invalid date {}: {}", text, e)))
}

/// Parse a pair label such as `070106-070709` or `20070106_20070709`
pub fn parse_date12(text: &str) -> InsarResult<(NaiveDate, NaiveDate)> {
    let parts: Vec<&str> = text.trim().split(|c| c == '-' || c == '_').collect();
    if parts.len() != 2 {
        return Err(InsarError::InvalidFormat(format!(
            "Pair label must be DATE1-DATE2: {}",
            text
        )));
    }
    let first = parse_date(parts[0])?;
    let second = parse_date(parts[1])?;
    Ok(if first <= second { (first, second) } else { (second, first) })
}

pub fn format_date8(date: NaiveDate) -> String {
    date.format("%Y%m%d").to_string()
}

pub fn format_date6(date: NaiveDate) -> String {
    date.format("%y%m%d").to_string()
}

/// Pair label in `YYMMDD-YYMMDD` form
pub fn format_date12(first: NaiveDate, second: NaiveDate) -> String {
    format!("{}-{}", format_date6(first), format_date6(second))
}

/// Date as decimal year, `year + (day_of_year - 1) / 365.25`
pub fn decimal_year(date: NaiveDate) -> f64 {
    date.year() as f64 + (date.ordinal() as f64 - 1.0) / 365.25
}

/// Why an epoch was taken out of the inversion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExclusionReason {
    /// Listed in the excluded-date configuration
    ExcludedDate,
    /// Before the start date or after the end date
    OutsideDateRange,
    /// Not reachable from the main network, even after repair
    Disconnected,
}

/// A single acquisition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Epoch {
    pub date: NaiveDate,
    pub index: usize,
    pub exclusion: Option<ExclusionReason>,
}

impl Epoch {
    pub fn is_excluded(&self) -> bool {
        self.exclusion.is_some()
    }

    pub fn label(&self) -> String {
        format_date8(self.date)
    }
}

/// Canonical, sorted set of acquisition dates
///
/// Excluded epochs are flagged and keep their index; nothing is removed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpochRegistry {
    epochs: Vec<Epoch>,
}

impl EpochRegistry {
    /// Build from any set of dates; duplicates are merged
    pub fn from_dates<I>(dates: I) -> InsarResult<Self>
    where
        I: IntoIterator<Item = NaiveDate>,
    {
        let mut sorted: Vec<NaiveDate> = dates.into_iter().collect();
        sorted.sort();
        sorted.dedup();

        if sorted.is_empty() {
            return Err(InsarError::InvalidFormat(
                "No acquisition dates provided".to_string(),
            ));
        }

        let epochs = sorted
            .into_iter()
            .enumerate()
            .map(|(index, date)| Epoch {
                date,
                index,
                exclusion: None,
            })
            .collect();

        Ok(Self { epochs })
    }

    pub fn from_date_strings(dates: &[&str]) -> InsarResult<Self> {
        let parsed = dates
            .iter()
            .map(|d| parse_date(d))
            .collect::<InsarResult<Vec<_>>>()?;
        Self::from_dates(parsed)
    }

    /// Enumerate epochs from the dates referenced by a set of pairs
    pub fn from_pairs(pairs: &[(NaiveDate, NaiveDate)]) -> InsarResult<Self> {
        Self::from_dates(pairs.iter().flat_map(|(a, b)| [*a, *b]))
    }

    pub fn len(&self) -> usize {
        self.epochs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.epochs.is_empty()
    }

    pub fn epochs(&self) -> &[Epoch] {
        &self.epochs
    }

    pub fn get(&self, index: usize) -> Option<&Epoch> {
        self.epochs.get(index)
    }

    pub fn date(&self, index: usize) -> NaiveDate {
        self.epochs[index].date
    }

    pub fn index_of(&self, date: NaiveDate) -> Option<usize> {
        self.epochs.binary_search_by(|e| e.date.cmp(&date)).ok()
    }

    pub fn is_excluded(&self, index: usize) -> bool {
        self.epochs.get(index).map_or(true, Epoch::is_excluded)
    }

    /// Indices of epochs that take part in the inversion
    pub fn active_indices(&self) -> Vec<usize> {
        self.epochs
            .iter()
            .filter(|e| !e.is_excluded())
            .map(|e| e.index)
            .collect()
    }

    pub fn num_active(&self) -> usize {
        self.epochs.iter().filter(|e| !e.is_excluded()).count()
    }

    /// Flag an epoch; the first recorded reason wins
    pub fn mark_excluded(&mut self, index: usize, reason: ExclusionReason) {
        if let Some(epoch) = self.epochs.get_mut(index) {
            if epoch.exclusion.is_none() {
                log::debug!("Excluding epoch {} ({:?})", epoch.label(), reason);
                epoch.exclusion = Some(reason);
            }
        }
    }

    pub fn reset_exclusions(&mut self) {
        for epoch in &mut self.epochs {
            epoch.exclusion = None;
        }
    }

    /// Days from epoch `first` to epoch `second`
    pub fn temporal_baseline_days(&self, first: usize, second: usize) -> i64 {
        (self.epochs[second].date - self.epochs[first].date).num_days()
    }

    /// Days of every epoch relative to the first acquisition
    pub fn tbase_days(&self) -> Vec<i64> {
        let t0 = self.epochs[0].date;
        self.epochs.iter().map(|e| (e.date - t0).num_days()).collect()
    }

    pub fn decimal_years(&self) -> Vec<f64> {
        self.epochs.iter().map(|e| decimal_year(e.date)).collect()
    }

    pub fn labels(&self, indices: &[usize]) -> Vec<String> {
        indices.iter().map(|&i| self.epochs[i].label()).collect()
    }
}

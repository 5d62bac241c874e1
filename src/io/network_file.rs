//! Plain-text network files: pair lists and baseline lists.

use crate::core::epochs::{format_date12, parse_date, parse_date12};
use crate::types::{InsarError, InsarResult};
use chrono::NaiveDate;
use std::io::Write;
use std::path::Path;

fn data_lines(content: &str) -> impl Iterator<Item = (usize, &str)> {
    content
        .lines()
        .enumerate()
        .map(|(i, l)| (i + 1, l.trim()))
        .filter(|(_, l)| !l.is_empty() && !l.starts_with('#'))
}

/// Pairs from a date12 list, one pair per line in the first column,
/// sorted and deduplicated
pub fn parse_date12_list(content: &str) -> InsarResult<Vec<(NaiveDate, NaiveDate)>> {
    let mut pairs = Vec::new();
    for (line_no, line) in data_lines(content) {
        let first = line.split_whitespace().next().unwrap_or_default();
        let pair = parse_date12(first).map_err(|e| {
            InsarError::InvalidFormat(format!("Line {}: {}", line_no, e))
        })?;
        pairs.push(pair);
    }
    pairs.sort_unstable();
    pairs.dedup();
    Ok(pairs)
}

pub fn read_date12_list<P: AsRef<Path>>(path: P) -> InsarResult<Vec<(NaiveDate, NaiveDate)>> {
    let path = path.as_ref();
    let pairs = parse_date12_list(&std::fs::read_to_string(path)?)?;
    log::info!("Read {} pairs from {}", pairs.len(), path.display());
    Ok(pairs)
}

pub fn write_date12_list<P: AsRef<Path>>(path: P, pairs: &[(NaiveDate, NaiveDate)]) -> InsarResult<()> {
    let mut file = std::fs::File::create(path.as_ref())?;
    for &(d1, d2) in pairs {
        writeln!(file, "{}", format_date12(d1, d2))?;
    }
    log::debug!("Wrote {} pairs to {}", pairs.len(), path.as_ref().display());
    Ok(())
}

/// Perpendicular baseline per acquisition from `date  bperp  ...` lines,
/// skipping the given dates
pub fn parse_baseline_list(content: &str, exclude: &[NaiveDate]) -> InsarResult<Vec<(NaiveDate, f64)>> {
    let mut records = Vec::new();
    for (line_no, line) in data_lines(content) {
        let mut columns = line.split_whitespace();
        let (Some(date), Some(bperp)) = (columns.next(), columns.next()) else {
            return Err(InsarError::InvalidFormat(format!(
                "Line {}: expected date and perpendicular baseline",
                line_no
            )));
        };
        let date = parse_date(date)?;
        if exclude.contains(&date) {
            continue;
        }
        let bperp = bperp.parse::<f64>().map_err(|_| {
            InsarError::InvalidFormat(format!("Line {}: invalid baseline {}", line_no, bperp))
        })?;
        records.push((date, bperp));
    }
    records.sort_by_key(|r| r.0);
    Ok(records)
}

pub fn read_baseline_list<P: AsRef<Path>>(
    path: P,
    exclude: &[NaiveDate],
) -> InsarResult<Vec<(NaiveDate, f64)>> {
    parse_baseline_list(&std::fs::read_to_string(path)?, exclude)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_date12_list_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reference_date12.txt");
        std::fs::write(&path, "# backbone\n070311-070426  0.8\n20070311_20070611\n070311-070426\n").unwrap();

        let pairs = read_date12_list(&path).unwrap();
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].0, NaiveDate::from_ymd_opt(2007, 3, 11).unwrap());

        let out = dir.path().join("out.txt");
        write_date12_list(&out, &pairs).unwrap();
        assert_eq!(std::fs::read_to_string(&out).unwrap(), "070311-070426\n070311-070611\n");
    }

    #[test]
    fn test_baseline_list_with_exclusion() {
        let content = "070106     0.0   0.03  0.0 0.0 2155.2 /slc/070106/\n\
                       070709  2631.9   0.07  0.0 0.0 2155.2 /slc/070709/\n\
                       070824  2787.3\n";
        let excluded = vec![NaiveDate::from_ymd_opt(2007, 7, 9).unwrap()];
        let records = parse_baseline_list(content, &excluded).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].1, 2787.3);

        assert!(parse_baseline_list("070106\n", &[]).is_err());
    }
}

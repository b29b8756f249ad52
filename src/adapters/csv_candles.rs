//! CSV candle loader for the paper broker's universe.
//!
//! Expected layout: a header row, then `date,open,high,low,close,volume`
//! with dates formatted `YYYY-MM-DD` in ascending order.

use std::path::Path;

use chrono::NaiveDate;

use crate::domain::candle::Candle;
use crate::domain::error::AlphaloopError;

fn data_err(path: &Path, reason: impl std::fmt::Display) -> AlphaloopError {
    AlphaloopError::Store {
        reason: format!("{}: {}", path.display(), reason),
    }
}

pub fn read_candles<P: AsRef<Path>>(path: P) -> Result<Vec<Candle>, AlphaloopError> {
    let path = path.as_ref();
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .map_err(|e| data_err(path, e))?;

    let mut candles = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| data_err(path, e))?;

        let field = |i: usize, name: &str| {
            record
                .get(i)
                .ok_or_else(|| data_err(path, format!("missing {} column", name)))
        };

        let date = NaiveDate::parse_from_str(field(0, "date")?, "%Y-%m-%d")
            .map_err(|e| data_err(path, format!("invalid date: {}", e)))?;
        let parse_f64 = |i: usize, name: &str| -> Result<f64, AlphaloopError> {
            field(i, name)?
                .parse()
                .map_err(|e| data_err(path, format!("invalid {} value: {}", name, e)))
        };

        let candle = Candle {
            date,
            open: parse_f64(1, "open")?,
            high: parse_f64(2, "high")?,
            low: parse_f64(3, "low")?,
            close: parse_f64(4, "close")?,
            volume: field(5, "volume")?
                .parse()
                .map_err(|e| data_err(path, format!("invalid volume value: {}", e)))?,
        };
        candles.push(candle);
    }

    if !candles.is_sorted_by_key(|c| c.date) {
        return Err(data_err(path, "candles are not in ascending date order"));
    }

    Ok(candles)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_csv(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", content).unwrap();
        file
    }

    const SAMPLE: &str = "date,open,high,low,close,volume\n\
        2024-03-01,240.0,242.5,239.0,241.0,1000000\n\
        2024-03-04,241.5,246.0,241.0,245.5,1200000\n";

    #[test]
    fn reads_well_formed_file() {
        let file = write_csv(SAMPLE);
        let candles = read_candles(file.path()).unwrap();
        assert_eq!(candles.len(), 2);
        assert_eq!(
            candles[0].date,
            NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()
        );
        assert_eq!(candles[1].close, 245.5);
        assert_eq!(candles[1].volume, 1_200_000);
    }

    #[test]
    fn rejects_bad_date() {
        let file = write_csv("date,open,high,low,close,volume\n03/01/2024,1,1,1,1,1\n");
        let err = read_candles(file.path()).unwrap_err();
        assert!(err.to_string().contains("invalid date"));
    }

    #[test]
    fn rejects_missing_column() {
        let file = write_csv("date,open,high,low,close,volume\n2024-03-01,1,1,1,1\n");
        let err = read_candles(file.path()).unwrap_err();
        assert!(err.to_string().contains("missing volume column"));
    }

    #[test]
    fn rejects_unsorted_dates() {
        let file = write_csv(
            "date,open,high,low,close,volume\n\
             2024-03-04,1,1,1,1,1\n\
             2024-03-01,1,1,1,1,1\n",
        );
        let err = read_candles(file.path()).unwrap_err();
        assert!(err.to_string().contains("ascending"));
    }

    #[test]
    fn missing_file_errors() {
        assert!(read_candles("/nonexistent/SBER.csv").is_err());
    }
}

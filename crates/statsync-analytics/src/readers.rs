//! Dataset readers: tab-delimited time series and the JSON population document.
//!
//! Both readers skip malformed rows and report them instead of failing the read.

use serde::Serialize;
use serde_json::Value as JsonValue;
use statsync_core::{PopulationRow, RowSkip, TimeSeriesRow};
use thiserror::Error;

/// Positional columns: series_id, year, period, value, footnote_codes.
pub const TIME_SERIES_FIELDS: usize = 5;

#[derive(Debug, Error)]
pub enum ReadError {
    #[error("population document is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("population document has no top-level \"data\" array")]
    MissingDataArray,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Loaded<T> {
    pub rows: Vec<T>,
    pub skipped: Vec<RowSkip>,
}

impl<T> Default for Loaded<T> {
    fn default() -> Self {
        Self {
            rows: Vec::new(),
            skipped: Vec::new(),
        }
    }
}

/// Parses the time-series file. No header is assumed: a header line fails the year
/// parse and is skipped like any other malformed row. Blank lines are ignored.
pub fn read_time_series(bytes: &[u8]) -> Loaded<TimeSeriesRow> {
    let mut loaded = Loaded::default();
    for (index, raw_line) in bytes.split(|b| *b == b'\n').enumerate() {
        let raw_line = raw_line.strip_suffix(b"\r").unwrap_or(raw_line);
        if raw_line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        match parse_time_series_line(raw_line) {
            Ok(row) => loaded.rows.push(row),
            Err(reason) => loaded.skipped.push(RowSkip {
                position: index + 1,
                reason,
            }),
        }
    }
    loaded
}

fn parse_time_series_line(raw_line: &[u8]) -> Result<TimeSeriesRow, String> {
    let line = std::str::from_utf8(raw_line).map_err(|e| format!("invalid utf-8: {e}"))?;
    let fields = line.split('\t').collect::<Vec<_>>();
    if fields.len() != TIME_SERIES_FIELDS {
        return Err(format!(
            "expected {TIME_SERIES_FIELDS} tab-separated fields, found {}",
            fields.len()
        ));
    }
    let year = fields[1]
        .trim()
        .parse::<i32>()
        .map_err(|_| format!("year {:?} is not an integer", fields[1]))?;
    Ok(TimeSeriesRow {
        series_id: fields[0].trim().to_string(),
        year,
        period: fields[2].trim().to_string(),
        value: parse_value(fields[3]),
        footnote_codes: fields[4].to_string(),
    })
}

/// Non-numeric and non-finite values (`-`, `NaN`, `inf`) become `None`.
pub fn parse_value(field: &str) -> Option<f32> {
    field
        .trim()
        .parse::<f32>()
        .ok()
        .filter(|value| value.is_finite())
}

/// Inverse of [`read_time_series`] for well-formed rows. A missing value is written as
/// an empty field.
pub fn serialize_time_series(rows: &[TimeSeriesRow]) -> Vec<u8> {
    let mut out = String::new();
    for row in rows {
        let value = row.value.map(|v| v.to_string()).unwrap_or_default();
        out.push_str(&format!(
            "{}\t{}\t{}\t{}\t{}\n",
            row.series_id, row.year, row.period, value, row.footnote_codes
        ));
    }
    out.into_bytes()
}

/// Parses `{"data": [{"Year": .., "Population": ..}, ..]}`. A missing or non-array
/// `data` field fails the whole read; a bad element is skipped.
pub fn read_population(bytes: &[u8]) -> Result<Loaded<PopulationRow>, ReadError> {
    let document: JsonValue = serde_json::from_slice(bytes)?;
    let data = document
        .get("data")
        .and_then(JsonValue::as_array)
        .ok_or(ReadError::MissingDataArray)?;

    let mut loaded = Loaded::default();
    for (index, element) in data.iter().enumerate() {
        let year = coerce_int(element.get("Year")).and_then(|y| i32::try_from(y).ok());
        let population = coerce_int(element.get("Population"));
        match (year, population) {
            (Some(year), Some(population)) => loaded.rows.push(PopulationRow { year, population }),
            (None, _) => loaded.skipped.push(RowSkip {
                position: index,
                reason: format!("Year {} is not an integer", describe(element.get("Year"))),
            }),
            (_, None) => loaded.skipped.push(RowSkip {
                position: index,
                reason: format!(
                    "Population {} is not an integer",
                    describe(element.get("Population"))
                ),
            }),
        }
    }
    Ok(loaded)
}

/// Integers, integral-or-truncated floats and numeric strings coerce; anything else does not.
fn coerce_int(value: Option<&JsonValue>) -> Option<i64> {
    let truncate = |f: f64| f.is_finite().then(|| f.trunc() as i64);
    match value? {
        JsonValue::Number(n) => n.as_i64().or_else(|| n.as_f64().and_then(truncate)),
        JsonValue::String(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().and_then(truncate))
        }
        _ => None,
    }
}

fn describe(value: Option<&JsonValue>) -> String {
    value.map_or_else(|| "<missing>".to_string(), ToString::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(series_id: &str, year: i32, period: &str, value: Option<f32>) -> TimeSeriesRow {
        TimeSeriesRow {
            series_id: series_id.to_string(),
            year,
            period: period.to_string(),
            value,
            footnote_codes: String::new(),
        }
    }

    #[test]
    fn trims_ids_and_keeps_unparseable_values_as_none() {
        let input = b"PRS30006032        \t2018\tQ01 \t       0.5\t\nPRS30006032\t2019\tQ01\t-\tP\n";
        let loaded = read_time_series(input);

        assert!(loaded.skipped.is_empty());
        assert_eq!(loaded.rows.len(), 2);
        assert_eq!(loaded.rows[0].series_id, "PRS30006032");
        assert_eq!(loaded.rows[0].period, "Q01");
        assert_eq!(loaded.rows[0].value, Some(0.5));
        assert_eq!(loaded.rows[1].value, None);
        assert_eq!(loaded.rows[1].footnote_codes, "P");
    }

    #[test]
    fn wrong_field_count_is_skipped_and_counted() {
        let input = b"S1\t2020\tQ01\t10\t\nS1\t2020\tQ02\t5\nS1\t2021\tQ01\t3\t\n";
        let loaded = read_time_series(input);

        assert_eq!(loaded.rows.len(), 2);
        assert_eq!(loaded.skipped.len(), 1);
        assert_eq!(loaded.skipped[0].position, 2);
        assert!(loaded.skipped[0].reason.contains("found 4"));
    }

    #[test]
    fn header_line_is_a_row_level_failure() {
        let input = b"series_id\tyear\tperiod\tvalue\tfootnote_codes\r\nS1\t2020\tQ01\t1.5\t\r\n\r\n";
        let loaded = read_time_series(input);

        assert_eq!(loaded.rows, vec![row("S1", 2020, "Q01", Some(1.5))]);
        assert_eq!(loaded.skipped.len(), 1);
        assert_eq!(loaded.skipped[0].position, 1);
    }

    #[test]
    fn non_finite_values_are_none() {
        assert_eq!(parse_value(" 1.25 "), Some(1.25));
        assert_eq!(parse_value("NaN"), None);
        assert_eq!(parse_value("inf"), None);
        assert_eq!(parse_value(""), None);
    }

    #[test]
    fn serialized_rows_read_back_identically() {
        let rows = vec![
            row("PRS30006011", 1995, "Q01", Some(2.6)),
            row("PRS30006011", 1995, "Q05", Some(-0.125)),
            row("PRS30006032", 2030, "Q01", None),
        ];
        let loaded = read_time_series(&serialize_time_series(&rows));
        assert!(loaded.skipped.is_empty());
        assert_eq!(loaded.rows, rows);

        let again = read_time_series(&serialize_time_series(&loaded.rows));
        assert_eq!(again.rows, rows);
    }

    #[test]
    fn population_coerces_strings_and_skips_bad_elements() {
        let input = br#"{"data": [
            {"Year": "2019", "Population": 328239523},
            {"Year": 2018, "Population": "327167434"},
            {"Year": "2017", "Population": 325719178.0},
            {"Year": "n/a", "Population": 1},
            {"Year": 2016}
        ]}"#;
        let loaded = read_population(input).unwrap();

        assert_eq!(
            loaded.rows,
            vec![
                PopulationRow { year: 2019, population: 328239523 },
                PopulationRow { year: 2018, population: 327167434 },
                PopulationRow { year: 2017, population: 325719178 },
            ]
        );
        assert_eq!(
            loaded.skipped.iter().map(|s| s.position).collect::<Vec<_>>(),
            vec![3, 4]
        );
    }

    #[test]
    fn population_requires_data_array() {
        assert!(matches!(
            read_population(br#"{"rows": []}"#),
            Err(ReadError::MissingDataArray)
        ));
        assert!(matches!(
            read_population(br#"{"data": {"Year": 2019}}"#),
            Err(ReadError::MissingDataArray)
        ));
        assert!(matches!(
            read_population(b"not json"),
            Err(ReadError::InvalidJson(_))
        ));
    }
}

//! The three reports. Pure functions over already-typed rows.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use statsync_core::{
    BestYearRecord, JoinedReportRow, PopulationRow, PopulationSummary, Reports, TimeSeriesRow,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    /// Inclusive population window.
    pub year_from: i32,
    pub year_to: i32,
    pub series_id: String,
    pub period: String,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            year_from: 2013,
            year_to: 2018,
            series_id: "PRS30006032".to_string(),
            period: "Q01".to_string(),
        }
    }
}

pub fn compute_reports(
    time_series: &[TimeSeriesRow],
    population: &[PopulationRow],
    config: &ReportConfig,
) -> Reports {
    Reports {
        population_summary: population_summary(population, config.year_from, config.year_to),
        best_year_per_series: best_year_per_series(time_series),
        joined_report: joined_report(time_series, population, &config.series_id, &config.period),
    }
}

/// Mean and sample standard deviation (divisor n - 1) of population within the window.
pub fn population_summary(
    rows: &[PopulationRow],
    year_from: i32,
    year_to: i32,
) -> PopulationSummary {
    let values = rows
        .iter()
        .filter(|row| (year_from..=year_to).contains(&row.year))
        .map(|row| row.population as f64)
        .collect::<Vec<_>>();
    let n = values.len();
    let mean = (n > 0).then(|| values.iter().sum::<f64>() / n as f64);
    let stddev = mean.filter(|_| n >= 2).map(|mean| {
        let squares = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>();
        (squares / (n - 1) as f64).sqrt()
    });

    PopulationSummary {
        year_from,
        year_to,
        row_count: n,
        mean_population: mean,
        stddev_population: stddev,
    }
}

/// Sums values per `(series_id, year)` and keeps the highest total per series.
///
/// Missing values are left out of the sum, so a year with only missing values totals 0.
/// When two years tie, the lowest year wins. Output is ordered by series id.
pub fn best_year_per_series(rows: &[TimeSeriesRow]) -> Vec<BestYearRecord> {
    let mut totals: BTreeMap<&str, BTreeMap<i32, f64>> = BTreeMap::new();
    for row in rows {
        let total = totals
            .entry(row.series_id.as_str())
            .or_default()
            .entry(row.year)
            .or_insert(0.0);
        if let Some(value) = row.value {
            *total += f64::from(value);
        }
    }

    totals
        .into_iter()
        .filter_map(|(series_id, years)| {
            let mut best: Option<(i32, f64)> = None;
            // ascending year order; strict comparison keeps the earliest year on ties
            for (year, total) in years {
                if best.map_or(true, |(_, best_total)| total > best_total) {
                    best = Some((year, total));
                }
            }
            best.map(|(year, total_value)| BestYearRecord {
                series_id: series_id.to_string(),
                year,
                total_value,
            })
        })
        .collect()
}

/// Inner join of the selected `(series_id, period)` rows with population on year.
/// Keeps time-series input order; unmatched years are dropped.
pub fn joined_report(
    time_series: &[TimeSeriesRow],
    population: &[PopulationRow],
    series_id: &str,
    period: &str,
) -> Vec<JoinedReportRow> {
    let mut by_year: HashMap<i32, Vec<i64>> = HashMap::new();
    for row in population {
        by_year.entry(row.year).or_default().push(row.population);
    }

    time_series
        .iter()
        .filter(|row| row.series_id == series_id && row.period == period)
        .flat_map(|row| {
            by_year
                .get(&row.year)
                .into_iter()
                .flatten()
                .map(move |&population| JoinedReportRow {
                    series_id: row.series_id.clone(),
                    year: row.year,
                    period: row.period.clone(),
                    value: row.value,
                    population,
                })
        })
        .collect()
}

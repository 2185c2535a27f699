//! Flat result files: combined per-trial CSV, summary CSV, and timestamped
//! output paths. The combined CSV can be read back for analysis.

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use csv::{Reader as CsvReader, Writer as CsvWriter};
use serde::Deserialize;
use uuid::Uuid;

use crate::decision::Decision;
use crate::results::{ExperimentResults, ParticipantRun, ParticipantSummary};
use crate::schedule::ThresholdSchedule;
use crate::trial::TrialOutcome;

const COMBINED_HEADER: [&str; 9] = [
    "participant",
    "trial_index",
    "threshold",
    "steps_attempted",
    "burst",
    "earnings",
    "decisions",
    "raw_responses",
    "error_reason",
];

const SUMMARY_HEADER: [&str; 9] = [
    "participant",
    "total_trials",
    "failed_trials",
    "avg_steps",
    "adjusted_steps",
    "burst_rate",
    "avg_earnings",
    "total_earnings",
    "std_steps",
];

/// `<dir>/<prefix>-YYYYmmdd-HHMMSS.<ext>`
pub fn timestamped_path(dir: &Path, prefix: &str, ext: &str) -> PathBuf {
    let timestamp = Utc::now().format("%Y%m%d-%H%M%S");
    dir.join(format!("{}-{}.{}", prefix, timestamp, ext))
}

/// Write one row per trial, tagged with its participant.
pub fn write_combined_csv<W: Write>(results: &ExperimentResults, writer: W) -> Result<()> {
    let mut wtr = CsvWriter::from_writer(writer);
    wtr.write_record(COMBINED_HEADER)?;
    for row in results.rows() {
        let outcome = row.outcome;
        wtr.write_record([
            row.participant.to_string(),
            outcome.trial_index.to_string(),
            outcome.threshold.to_string(),
            outcome.steps_attempted.to_string(),
            outcome.burst.to_string(),
            format!("{:.2}", outcome.earnings),
            outcome.decision_labels().join(", "),
            outcome.raw_responses.join(" | "),
            outcome.error_reason.clone().unwrap_or_default(),
        ])?;
    }
    wtr.flush()?;
    Ok(())
}

/// Write one row per summary, values rounded to two decimals.
pub fn write_summary_csv<W: Write>(summaries: &[ParticipantSummary], writer: W) -> Result<()> {
    let mut wtr = CsvWriter::from_writer(writer);
    wtr.write_record(SUMMARY_HEADER)?;
    for s in summaries {
        wtr.write_record([
            s.participant.clone(),
            s.total_trials.to_string(),
            s.failed_trials.to_string(),
            format!("{:.2}", s.avg_steps),
            format!("{:.2}", s.adjusted_steps),
            format!("{:.2}", s.burst_rate),
            format!("{:.2}", s.avg_earnings),
            format!("{:.2}", s.total_earnings),
            format!("{:.2}", s.std_steps),
        ])?;
    }
    wtr.flush()?;
    Ok(())
}

/// One row of the combined CSV.
#[derive(Debug, Deserialize)]
struct CombinedRow {
    participant: String,
    trial_index: usize,
    threshold: u32,
    steps_attempted: u32,
    burst: bool,
    earnings: f64,
    decisions: String,
    raw_responses: String,
    error_reason: String,
}

impl CombinedRow {
    fn into_outcome(self) -> Result<(String, TrialOutcome)> {
        let decisions = split_nonempty(&self.decisions, ",")
            .map(|label| {
                Decision::from_label(label)
                    .with_context(|| format!("Unknown decision label {label:?}"))
            })
            .collect::<Result<Vec<_>>>()?;
        let outcome = TrialOutcome {
            trial_index: self.trial_index,
            threshold: self.threshold,
            steps_attempted: self.steps_attempted,
            burst: self.burst,
            earnings: self.earnings,
            decisions,
            raw_responses: split_nonempty(&self.raw_responses, " | ")
                .map(str::to_string)
                .collect(),
            error_reason: Some(self.error_reason).filter(|r| !r.is_empty()),
            invalid_responses: Vec::new(),
        };
        Ok((self.participant, outcome))
    }
}

fn split_nonempty<'a>(field: &'a str, sep: &'a str) -> impl Iterator<Item = &'a str> {
    field.split(sep).map(str::trim).filter(|s| !s.is_empty())
}

/// Read a combined CSV back into per-participant runs, in first-seen order.
pub fn read_combined_csv<R: Read>(reader: R) -> Result<Vec<ParticipantRun>> {
    let mut rdr = CsvReader::from_reader(reader);
    let mut runs: Vec<ParticipantRun> = Vec::new();
    for (line, record) in rdr.deserialize::<CombinedRow>().enumerate() {
        let row = record.with_context(|| format!("Malformed combined CSV row {}", line + 1))?;
        let (participant, outcome) = row.into_outcome()?;
        match runs.iter_mut().find(|run| run.participant == participant) {
            Some(run) => run.outcomes.push(outcome),
            None => runs.push(ParticipantRun {
                participant,
                outcomes: vec![outcome],
            }),
        }
    }
    for run in &mut runs {
        run.outcomes.sort_by_key(|o| o.trial_index);
    }
    Ok(runs)
}

/// Rebuild summarizable results from a combined CSV file.
///
/// The schedule comes from the first participant's thresholds and the reward
/// from the first stopped trial with earnings; run metadata is fresh.
pub fn load_combined_csv(path: &Path) -> Result<ExperimentResults> {
    let file =
        File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let runs = read_combined_csv(file)?;
    let first = runs
        .first()
        .with_context(|| format!("No trials in {}", path.display()))?;
    let schedule =
        ThresholdSchedule::from_thresholds(first.outcomes.iter().map(|o| o.threshold).collect())?;
    let reward_per_step = runs
        .iter()
        .flat_map(|run| &run.outcomes)
        .find(|o| o.is_stopped() && o.steps_attempted > 0)
        .map(|o| o.earnings / o.steps_attempted as f64)
        .unwrap_or_default();

    let now = Utc::now();
    let mut results = ExperimentResults {
        run_id: Uuid::new_v4(),
        started_at: now,
        ended_at: now,
        min_threshold: schedule.iter().min().unwrap_or_default(),
        max_threshold: schedule.iter().max().unwrap_or_default(),
        reward_per_step,
        schedule,
        runs,
        failures: Vec::new(),
        summaries: Vec::new(),
        trend: Vec::new(),
    };
    results.compute_summary();
    Ok(results)
}

/// Paths written by `write_all`.
#[derive(Debug, Clone)]
pub struct WrittenFiles {
    pub combined_csv: PathBuf,
    pub summary_csv: PathBuf,
    pub results_json: PathBuf,
}

/// Write the combined CSV, summary CSV and full JSON into `dir`.
pub fn write_all(results: &ExperimentResults, dir: &Path) -> Result<WrittenFiles> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create output directory {}", dir.display()))?;

    let combined_csv = timestamped_path(dir, "BART_combined", "csv");
    let file = File::create(&combined_csv)
        .with_context(|| format!("Failed to create {}", combined_csv.display()))?;
    write_combined_csv(results, file)?;

    let summary_csv = timestamped_path(dir, "BART_summary", "csv");
    let file = File::create(&summary_csv)
        .with_context(|| format!("Failed to create {}", summary_csv.display()))?;
    write_summary_csv(&results.summaries, file)?;

    let results_json = timestamped_path(dir, "BART_results", "json");
    results
        .save(&results_json)
        .with_context(|| format!("Failed to write {}", results_json.display()))?;

    Ok(WrittenFiles {
        combined_csv,
        summary_csv,
        results_json,
    })
}

/// Test report rendering and persistence
///
/// The layout is a fixed 69-column box: a header block, then one section per
/// executed step with a PASS/FAIL line and per-channel value rows.
use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use std::{
    fmt::Write as _,
    fs,
    path::{Path, PathBuf},
};

use super::sequencer::result::{ChannelResults, StepResult};

/// Column of the closing `|` on every row.
const ROW_WIDTH: usize = 68;
const DATE_FORMAT: &str = "%d/%m/%Y %H:%M:%S";

#[derive(Debug, Clone)]
pub struct ReportHeader {
    pub group: String,
    pub model: String,
    pub customer: String,
    pub serial_number: String,
    pub tester_id: String,
    pub tested_at: DateTime<Local>,
}

fn divider(out: &mut String) {
    out.push('|');
    out.push_str(&"=".repeat(ROW_WIDTH - 1));
    out.push_str("|\n");
}

fn row(out: &mut String, text: &str) {
    let _ = writeln!(out, "{text:<width$}|", width = ROW_WIDTH);
}

/// Whole numbers keep one decimal (`1.0`), everything else prints as is.
fn plain(value: f64) -> String {
    if value.is_finite() && value.fract() == 0.0 {
        format!("{value:.1}")
    } else {
        value.to_string()
    }
}

fn cell(value: &str, unit: &str) -> String {
    format!("[ {value:<8}]{unit} ")
}

fn verdict(ok: bool) -> &'static str {
    if ok {
        "PASS"
    } else {
        "FAIL"
    }
}

/// A labelled row that grows one cell per channel.
struct Row {
    text: String,
}

impl Row {
    fn new(label: &str, width: usize) -> Self {
        Self {
            text: format!("|{label:<width$}"),
        }
    }

    fn push(&mut self, value: &str, unit: &str) {
        self.text.push_str(&cell(value, unit));
    }
}

fn channel_banner(out: &mut String, lead: usize, channel_ids: impl Iterator<Item = String>) {
    let mut banner = format!("|{}", "=".repeat(lead));
    for id in channel_ids {
        let _ = write!(banner, "[Channel {id}]==");
    }
    let _ = writeln!(out, "{banner:=<width$}|", width = ROW_WIDTH);
}

fn render_step(out: &mut String, step: &StepResult) {
    let status = if step.passed { "[ PASS ]" } else { "[ FAIL ]" };
    let _ = writeln!(out, "|-> {:<55}{status} |", step.description);

    let rows = match &step.channels {
        ChannelResults::DirectCurrent(channels) => {
            channel_banner(out, 14, channels.iter().map(|c| c.channel_id.to_string()));
            let mut rows = [
                Row::new("Load Current: ", 14),
                Row::new("Upper: ", 14),
                Row::new("Lower: ", 14),
                Row::new("Outcome: ", 14),
                Row::new("Power: ", 14),
            ];
            for c in channels {
                rows[0].push(&plain(c.load), "A");
                rows[1].push(&plain(c.upper_voltage), "V");
                rows[2].push(&plain(c.lower_voltage), "V");
                rows[3].push(&format!("{:.2}", c.outcome_voltage), "V");
                rows[4].push(&format!("{:.2}", c.power), "W");
            }
            Vec::from(rows)
        }
        ChannelResults::CurrentLimiting(channels) => {
            channel_banner(out, 15, channels.iter().map(|c| c.channel_id.to_string()));
            let mut rows = [
                Row::new("Under Voltage: ", 15),
                Row::new("Upper: ", 15),
                Row::new("Lower: ", 15),
                Row::new("Outcome: ", 15),
            ];
            for c in channels {
                rows[0].push(&plain(c.under_voltage), "V");
                rows[1].push(&plain(c.load_upper), "A");
                rows[2].push(&plain(c.load_lower), "A");
                rows[3].push(&format!("{:.2}", c.limit), "A");
            }
            Vec::from(rows)
        }
        ChannelResults::AutomaticShort(channels) => {
            channel_banner(out, 15, channels.iter().map(|c| c.channel_id.to_string()));
            let mut rows = [
                Row::new("Voltage Ref. : ", 15),
                Row::new("Shutdown: ", 15),
                Row::new("Recovery: ", 15),
                Row::new("Load: ", 15),
            ];
            for c in channels {
                rows[0].push(&plain(c.voltage_ref), "V");
                rows[1].push(verdict(c.shutdown), " ");
                rows[2].push(verdict(c.recovery), " ");
                rows[3].push(&plain(c.load), "A");
            }
            Vec::from(rows)
        }
    };

    for r in rows {
        row(out, &r.text);
    }
}

pub fn render_report(header: &ReportHeader, steps: &[StepResult]) -> String {
    let mut out = String::new();
    divider(&mut out);
    row(&mut out, "| Power Supply Test Report");
    row(&mut out, &format!("| Group: {}", header.group));
    row(&mut out, &format!("| Model: {}", header.model));
    row(&mut out, &format!("| Customer: {}", header.customer));
    row(&mut out, &format!("| Serial No: {}", header.serial_number));
    row(
        &mut out,
        &format!("| Test Date: {}", header.tested_at.format(DATE_FORMAT)),
    );
    row(&mut out, &format!("| Tested By: {}", header.tester_id));
    for step in steps {
        divider(&mut out);
        render_step(&mut out, step);
    }
    divider(&mut out);
    out
}

/// Write `text` to `{dir}/{serial}.txt`, creating `dir` if needed.
pub fn save_report(dir: &Path, serial: &str, text: &str) -> Result<PathBuf> {
    fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create report directory {}", dir.display()))?;
    let path = dir.join(format!("{serial}.txt"));
    fs::write(&path, text)
        .with_context(|| format!("Failed to write report {}", path.display()))?;
    log::info!("Saved report to {}", path.display());
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::sequencer::result::{
        CurrentLimitOutcome, DirectCurrentOutcome, ShortOutcome,
    };
    use chrono::TimeZone;

    fn header() -> Result<ReportHeader> {
        let tested_at = Local
            .with_ymd_and_hms(2024, 3, 7, 14, 5, 9)
            .single()
            .context("ambiguous local time")?;
        Ok(ReportHeader {
            group: "Bench".to_string(),
            model: "PSU-12".to_string(),
            customer: "ACME".to_string(),
            serial_number: "00000042".to_string(),
            tester_id: "op7".to_string(),
            tested_at,
        })
    }

    fn steps() -> Vec<StepResult> {
        vec![
            StepResult {
                step_id: 1,
                description: "Nominal load".to_string(),
                passed: true,
                channels: ChannelResults::DirectCurrent(vec![DirectCurrentOutcome {
                    channel_id: 1,
                    load: 1.0,
                    lower_voltage: 10.0,
                    upper_voltage: 12.0,
                    outcome_voltage: 11.0,
                    power: 11.0,
                }]),
            },
            StepResult {
                step_id: 2,
                description: "Limit".to_string(),
                passed: false,
                channels: ChannelResults::CurrentLimiting(vec![CurrentLimitOutcome {
                    channel_id: 1,
                    under_voltage: 10.0,
                    load_upper: 2.0,
                    load_lower: 1.0,
                    limit: 1.0,
                }]),
            },
            StepResult {
                step_id: 3,
                description: "Short".to_string(),
                passed: true,
                channels: ChannelResults::AutomaticShort(vec![ShortOutcome {
                    channel_id: 1,
                    voltage_ref: 10.0,
                    shutdown: true,
                    recovery: true,
                    load: 0.5,
                }]),
            },
        ]
    }

    #[test]
    fn every_row_is_69_columns() -> Result<()> {
        let text = render_report(&header()?, &steps());
        for line in text.lines() {
            assert_eq!(line.chars().count(), 69, "{line:?}");
            assert!(line.starts_with('|') && line.ends_with('|'), "{line:?}");
        }
        Ok(())
    }

    #[test]
    fn renders_header_and_step_rows() -> Result<()> {
        let text = render_report(&header()?, &steps());
        assert!(text.contains("| Test Date: 07/03/2024 14:05:09"));
        assert!(text.contains("| Serial No: 00000042"));
        assert!(text.contains(&format!("|-> {:<55}[ PASS ] |", "Nominal load")));
        assert!(text.contains(&format!("|-> {:<55}[ FAIL ] |", "Limit")));
        assert!(text.contains("|==============[Channel 1]=="));
        assert!(text.contains("|Load Current: [ 1.0     ]A "));
        assert!(text.contains("|Outcome:      [ 11.00   ]V "));
        assert!(text.contains("|Outcome:       [ 1.00    ]A "));
        assert!(text.contains("|Shutdown:      [ PASS    ]  "));
        assert!(text.contains("|Load:          [ 0.5     ]A "));
        Ok(())
    }

    #[test]
    fn saves_under_serial_name() -> Result<()> {
        let dir = std::env::temp_dir().join(format!("psu_bench_report_{}", std::process::id()));
        let path = save_report(&dir, "00000042", "body")?;
        assert_eq!(path, dir.join("00000042.txt"));
        assert_eq!(fs::read_to_string(&path)?, "body");
        fs::remove_dir_all(&dir)?;
        Ok(())
    }
}

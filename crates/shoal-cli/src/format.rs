//! Plain-text tables and coloured labels

use crossterm::style::{StyledContent, Stylize};
use shoal_core::{HostSpec, JobStatus};
use shoal_orchestrator::JobRecord;

/// Padding added after the widest cell of each column
const COLUMN_PADDING: usize = 4;

/// Lay `rows` out in left-aligned columns under `headers`
pub fn format_columns(headers: &[&str], rows: &[Vec<String>]) -> String {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.chars().count()).collect();
    for row in rows {
        for (i, cell) in row.iter().enumerate().take(widths.len()) {
            widths[i] = widths[i].max(cell.chars().count());
        }
    }

    let header_row: Vec<String> = headers.iter().map(|h| h.to_string()).collect();
    std::iter::once(&header_row)
        .chain(rows.iter())
        .map(|row| {
            let mut line = String::new();
            for (cell, width) in row.iter().zip(&widths) {
                line.push_str(&format!("{:<width$}", cell, width = width + COLUMN_PADDING));
            }
            line.trim_end().to_string()
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Status column text; `None` means the host never ran anything
pub fn status_text(status: Option<JobStatus>) -> String {
    match status {
        Some(status) => status.to_string(),
        None => "(no jobs)".to_string(),
    }
}

/// `[host]` prefix for output lines
pub fn host_label(host: &str) -> StyledContent<String> {
    format!("[{}]", host).cyan().bold()
}

pub fn status_styled(status: JobStatus) -> StyledContent<String> {
    let text = status.to_string();
    match status {
        JobStatus::Pending => text.yellow(),
        JobStatus::Cancelled => text.magenta(),
        JobStatus::Exited(0) => text.green(),
        JobStatus::Exited(_) => text.red(),
    }
}

pub fn error_prefix() -> StyledContent<&'static str> {
    "(shoal)".red().bold()
}

/// Output of a finished job, each line tagged with its host
pub fn render_job(host: &HostSpec, record: &JobRecord) -> String {
    let label = host_label(&host.to_string()).to_string();
    let output = record.replay();
    let text = String::from_utf8_lossy(&output);

    let mut rendered = format!("{} $ {}\n", label, record.command());
    for line in text.lines() {
        rendered.push_str(&format!("{} {}\n", label, line.trim_end_matches('\r')));
    }
    rendered.push_str(&format!(
        "{} exit code: {}",
        label,
        status_styled(record.status())
    ));
    rendered
}

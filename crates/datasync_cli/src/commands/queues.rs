//! Queue statistics.

use datasync_backend::{QueueBackend, QueueStats};
use serde::Serialize;
use std::path::Path;

/// Counts of one queue.
#[derive(Debug, Serialize)]
pub struct QueueReport {
    /// Queue name.
    pub name: String,
    /// Counts per state.
    #[serde(flatten)]
    pub stats: QueueStats,
    /// All rows.
    pub total: u64,
}

/// Collects the counts of every queue in the backend.
pub fn collect(backend: &dyn QueueBackend) -> Result<Vec<QueueReport>, Box<dyn std::error::Error>> {
    let mut reports = Vec::new();
    for name in backend.queue_names()? {
        let stats = backend.stats(&name)?;
        reports.push(QueueReport {
            total: stats.total(),
            name,
            stats,
        });
    }
    Ok(reports)
}

/// Runs the queues command.
pub fn run(path: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let backend = super::open_backend(path)?;
    let reports = collect(&backend)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&reports)?);
        }
        _ => {
            print_text_output(path, &reports);
        }
    }

    Ok(())
}

fn print_text_output(path: &Path, reports: &[QueueReport]) {
    println!("Datasync Queues");
    println!("===============");
    println!();
    println!("Database: {}", path.display());
    println!();

    if reports.is_empty() {
        println!("No queues.");
        return;
    }

    println!(
        "{:<28} {:>9} {:>9} {:>9} {:>9}",
        "QUEUE", "PENDING", "INFLIGHT", "DONE", "FAILED"
    );
    for report in reports {
        println!(
            "{:<28} {:>9} {:>9} {:>9} {:>9}",
            report.name,
            report.stats.pending,
            report.stats.inflight,
            report.stats.done,
            report.stats.failed
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use datasync_backend::{InMemoryBackend, QueueItem};
    use serde_json::json;

    #[test]
    fn collects_every_queue() {
        let backend = InMemoryBackend::new();
        backend.ensure_queue("datasync_ack_queue").unwrap();
        backend.ensure_queue("datasync_sync_queue").unwrap();
        backend
            .insert(QueueItem::new("a", "datasync_sync_queue", json!({}), Utc::now()))
            .unwrap();

        let mut reports = collect(&backend).unwrap();
        reports.sort_by(|a, b| a.name.cmp(&b.name));
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[1].name, "datasync_sync_queue");
        assert_eq!(reports[1].stats.pending, 1);
        assert_eq!(reports[1].total, 1);

        let value = serde_json::to_value(&reports[1]).unwrap();
        assert_eq!(value["pending"], 1);
    }
}

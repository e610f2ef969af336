//! Project summary appender.
//!
//! One TAB-separated line per workflow run, appended to
//! `<log-dir>/project/<project>.summary`. The file is append-only and
//! shared between runs, so a record is a single atomic write.
use crate::Result;
use std::io::Write;
use std::path::{Path, PathBuf};

/// One run's worth of summary columns.
#[derive(Debug, Clone)]
pub struct SummaryRecord<'a> {
    pub status: &'a str,
    pub exit_code: i32,
    pub task_file: &'a str,
    pub final_task_id: Option<u32>,
    pub hostname: &'a str,
    pub command: &'a str,
    pub log_file: &'a str,
}

/// Append a record, creating the project directory on first use. Returns
/// the summary file path.
pub fn append(log_dir: &Path, project: &str, record: &SummaryRecord<'_>) -> Result<PathBuf> {
    let project_dir = log_dir.join("project");
    std::fs::create_dir_all(&project_dir)?;
    let path = project_dir.join(format!("{}.summary", project));

    let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
    let final_task = record
        .final_task_id
        .map(|id| id.to_string())
        .unwrap_or_else(|| "-".to_string());
    let line = format!(
        "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\n",
        timestamp,
        record.status,
        record.exit_code,
        record.task_file,
        final_task,
        record.hostname,
        record.command,
        record.log_file
    );

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)?;
    file.write_all(line.as_bytes())?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_append_is_tab_separated_and_additive() {
        let dir = TempDir::new().unwrap();
        let record = SummaryRecord {
            status: "SUCCESS",
            exit_code: 0,
            task_file: "deploy.txt",
            final_task_id: Some(7),
            hostname: "web01",
            command: "systemctl restart app",
            log_file: "/var/log/tasker/deploy_x.log",
        };
        let path = append(dir.path(), "release", &record).unwrap();
        append(dir.path(), "release", &record).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let columns: Vec<&str> = lines[0].split('\t').collect();
        assert_eq!(columns.len(), 8);
        assert_eq!(columns[1], "SUCCESS");
        assert_eq!(columns[2], "0");
        assert_eq!(columns[4], "7");
    }

    #[test]
    fn test_missing_final_task_renders_dash() {
        let dir = TempDir::new().unwrap();
        let record = SummaryRecord {
            status: "FAILURE",
            exit_code: 20,
            task_file: "bad.txt",
            final_task_id: None,
            hostname: "-",
            command: "-",
            log_file: "-",
        };
        let path = append(dir.path(), "ops", &record).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("\t-\t"));
    }
}

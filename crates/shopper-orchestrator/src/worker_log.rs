use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Append-only status log written by one worker and tailed by the
/// orchestrator's progress watcher. Line protocol:
///
/// ```text
/// STATUS: <PHASE> key=value key=value
/// ERROR: stage=<stage> message="..."
/// ```
///
/// Workers never communicate with each other; the log file (plus the event
/// channel, in-process) is their only output.
pub struct WorkerLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl WorkerLog {
    pub fn create(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn status(&self, phase: &str, fields: &[(&str, String)]) {
        let mut line = format!("STATUS: {}", phase);
        for (k, v) in fields {
            line.push_str(&format!(" {}={}", k, v));
        }
        self.write_line(&line);
    }

    pub fn error(&self, stage: &str, message: &str) {
        self.write_line(&format!("ERROR: stage={} message=\"{}\"", stage, message));
    }

    fn write_line(&self, line: &str) {
        let mut file = self.file.lock().expect("log lock poisoned");
        // A failed log write must never take the worker down with it.
        let _ = writeln!(file, "{}", line);
        let _ = file.flush();
    }
}

/// What the progress watcher learned from one scan of a worker's log.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkerProgress {
    /// Phase token of the latest complete `STATUS:` line.
    pub phase: Option<String>,
    /// Latest `tps=<float>` seen on any complete status line.
    pub tps: Option<f64>,
    /// The latest complete status line verbatim; change detection keys off
    /// this to update last-progress timestamps.
    pub last_status_line: Option<String>,
}

/// Parse the tail of a worker log. The final line is skipped when the file
/// does not end in a newline (a worker may be mid-write).
pub fn parse_log_tail(content: &str) -> WorkerProgress {
    let mut lines: Vec<&str> = content.lines().collect();
    if !content.is_empty() && !content.ends_with('\n') {
        lines.pop();
    }

    let mut progress = WorkerProgress::default();
    for line in lines {
        let Some(rest) = line.strip_prefix("STATUS: ") else {
            continue;
        };
        let mut tokens = rest.split_whitespace();
        let Some(phase) = tokens.next() else {
            continue;
        };
        progress.phase = Some(phase.to_string());
        progress.last_status_line = Some(line.to_string());
        for token in tokens {
            if let Some(value) = token.strip_prefix("tps=") {
                if let Ok(tps) = value.parse::<f64>() {
                    progress.tps = Some(tps);
                }
            }
        }
    }
    progress
}

/// Read and parse the tail of a worker's log file. Missing files parse as
/// empty progress (the worker may not have started writing yet).
pub fn read_log_tail(path: &Path) -> WorkerProgress {
    match std::fs::read_to_string(path) {
        Ok(content) => parse_log_tail(&content),
        Err(_) => WorkerProgress::default(),
    }
}

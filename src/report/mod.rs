//! Result artifact writing.
//!
//! A finished recording turns into a set of gzip-compressed JSON files
//! plus an optional zip of response bodies, all named
//! `<prefix><suffix>` inside the task directory. Empty reductions
//! produce no file; consumers treat a missing artifact as "nothing
//! captured", never as an error.
//!
//! | Artifact | Content |
//! |----------|---------|
//! | `_requests.json.gz` | Final request records |
//! | `_page_data.json.gz` | Page-level navigation outcome |
//! | `_user_timing.json.gz` | Consolidated user-timing events |
//! | `_timeline_cpu.json.gz` | CPU slice table |
//! | `_script_timing.json.gz` | Per-script span periods |
//! | `_interactive.json.gz` | Interactive windows |
//! | `_long_tasks.json.gz` | Long-task periods |
//! | `_feature_usage.json.gz` | Blink feature first-use times |
//! | `_v8stats.json.gz` | V8 call stats |
//! | `_netlog_requests.json.gz` | Netlog-derived requests |
//! | `_coverage.json.gz` | Per-URL JS/CSS usage coverage |
//! | `_bodies.zip` | Text response bodies |
//! | `bodies/<id>` | Raw fetched bodies, keyed by request id |
//! | `_devtools.json.gz` | Raw protocol log (written live) |

// ============================================================================
// Imports
// ============================================================================

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::write::GzEncoder;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

use crate::config::{JobConfig, TaskPaths};
use crate::error::Result;
use crate::session::RecordingOutput;

// ============================================================================
// ProtocolLog
// ============================================================================

/// Line-oriented gzip log of every inbound protocol message, written
/// as messages arrive so a crashed run still leaves a usable log.
#[derive(Debug)]
pub struct ProtocolLog {
    encoder: GzEncoder<File>,
}

impl ProtocolLog {
    /// Creates (truncates) the log file.
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path)?;
        debug!(path = %path.display(), "protocol log opened");
        Ok(Self {
            encoder: GzEncoder::new(file, Compression::default()),
        })
    }

    /// Appends one message as a JSON line.
    pub fn append(&mut self, message: &Value) -> Result<()> {
        serde_json::to_writer(&mut self.encoder, message)?;
        self.encoder.write_all(b"\n")?;
        Ok(())
    }
}

// ============================================================================
// Artifact Writing
// ============================================================================

/// Writes every non-empty artifact for a finished recording. Returns
/// the paths written.
pub fn write_all(
    paths: &TaskPaths,
    config: &JobConfig,
    output: &RecordingOutput,
) -> Result<Vec<PathBuf>> {
    let mut written = Vec::new();
    let mut emit = |path: PathBuf| written.push(path);

    if !output.requests.is_empty() {
        emit(write_json_gz(
            paths.artifact("_requests.json.gz"),
            &output.requests,
        )?);
    }
    emit(write_json_gz(
        paths.artifact("_page_data.json.gz"),
        &output.page,
    )?);

    let trace = &output.trace;
    if !trace.user_timing.is_empty() {
        emit(write_json_gz(
            paths.artifact("_user_timing.json.gz"),
            &trace.user_timing,
        )?);
    }
    if !config.discard_timeline {
        if !trace.cpu.slices.is_empty() {
            emit(write_json_gz(
                paths.artifact("_timeline_cpu.json.gz"),
                &trace.cpu,
            )?);
        }
        if !trace.script_timing.threads.is_empty() {
            emit(write_json_gz(
                paths.artifact("_script_timing.json.gz"),
                &trace.script_timing,
            )?);
        }
    }
    if !trace.interactive.is_empty() {
        emit(write_json_gz(
            paths.artifact("_interactive.json.gz"),
            &trace.interactive,
        )?);
    }
    if !trace.long_tasks.is_empty() {
        emit(write_json_gz(
            paths.artifact("_long_tasks.json.gz"),
            &trace.long_tasks,
        )?);
    }
    if !trace.feature_usage.features.is_empty() || !trace.feature_usage.css_features.is_empty() {
        emit(write_json_gz(
            paths.artifact("_feature_usage.json.gz"),
            &trace.feature_usage,
        )?);
    }
    if config.v8rcs && !trace.v8_stats.threads.is_empty() {
        emit(write_json_gz(
            paths.artifact("_v8stats.json.gz"),
            &trace.v8_stats,
        )?);
    }
    if !trace.netlog_requests.is_empty() {
        emit(write_json_gz(
            paths.artifact("_netlog_requests.json.gz"),
            &trace.netlog_requests,
        )?);
    }
    if !output.coverage.is_empty() {
        emit(write_json_gz(
            paths.artifact("_coverage.json.gz"),
            &output.coverage,
        )?);
    }

    if config.archives_bodies() {
        if let Some(path) = write_bodies(paths, output)? {
            emit(path);
        }
        write_raw_bodies(paths, output)?;
    }

    info!(count = written.len(), "artifacts written");
    Ok(written)
}

/// Serializes `value` into a gzip-compressed JSON file.
fn write_json_gz<T: Serialize>(path: PathBuf, value: &T) -> Result<PathBuf> {
    let file = File::create(&path)?;
    let mut encoder = GzEncoder::new(file, Compression::default());
    serde_json::to_writer(&mut encoder, value)?;
    encoder.finish()?;
    debug!(path = %path.display(), "artifact written");
    Ok(path)
}

/// Archives fetched text bodies as `NNN-<request-id>-body.txt` entries.
/// Returns `None` when no record holds a body.
fn write_bodies(paths: &TaskPaths, output: &RecordingOutput) -> Result<Option<PathBuf>> {
    let records: Vec<_> = output
        .requests
        .iter()
        .filter(|r| r.body.is_some() && r.is_text())
        .collect();
    if records.is_empty() {
        return Ok(None);
    }

    let path = paths.artifact("_bodies.zip");
    let file = File::create(&path)?;
    let mut archive = ZipWriter::new(file);
    let options = SimpleFileOptions::default();
    for (index, record) in records.iter().enumerate() {
        let Some(body) = &record.body else {
            continue;
        };
        let name = format!("{:03}-{}-body.txt", index + 1, record.id);
        archive.start_file(name, options)?;
        archive.write_all(body)?;
    }
    archive.finish()?;
    debug!(path = %path.display(), count = records.len(), "bodies archived");
    Ok(Some(path))
}

/// Writes each fetched body uncompressed under `bodies/<request-id>` so
/// later passes can look bodies up by id without opening the archive.
fn write_raw_bodies(paths: &TaskPaths, output: &RecordingOutput) -> Result<()> {
    let dir = paths.dir().join("bodies");
    let mut count = 0usize;
    for record in &output.requests {
        let Some(body) = &record.body else {
            continue;
        };
        if count == 0 {
            fs::create_dir_all(&dir)?;
        }
        fs::write(dir.join(record.id.as_str()), body)?;
        count += 1;
    }
    if count > 0 {
        debug!(path = %dir.display(), count, "raw bodies written");
    }
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Read;

    use flate2::read::GzDecoder;
    use serde_json::json;
    use tempfile::TempDir;

    use crate::trace::TraceReductions;

    fn task_paths(dir: &TempDir) -> TaskPaths {
        TaskPaths::new(dir.path().to_path_buf(), "task1".to_string())
    }

    fn read_json_gz(path: &Path) -> Value {
        let mut decoder = GzDecoder::new(File::open(path).expect("open"));
        let mut raw = String::new();
        decoder.read_to_string(&mut raw).expect("decompress");
        serde_json::from_str(&raw).expect("json")
    }

    fn empty_output() -> RecordingOutput {
        RecordingOutput {
            requests: Vec::new(),
            page: crate::session::PageState::default(),
            trace: TraceReductions::default(),
            coverage: serde_json::Map::new(),
        }
    }

    #[test]
    fn test_empty_reductions_write_only_page_data() {
        let dir = TempDir::new().expect("tempdir");
        let paths = task_paths(&dir);
        let written =
            write_all(&paths, &JobConfig::default(), &empty_output()).expect("write_all");
        assert_eq!(written.len(), 1);
        assert!(written[0].ends_with("task1_page_data.json.gz"));
    }

    #[test]
    fn test_user_timing_round_trips() {
        let dir = TempDir::new().expect("tempdir");
        let paths = task_paths(&dir);
        let mut output = empty_output();
        output.trace.user_timing = vec![json!({"name": "navigationStart", "ts": 1})];

        write_all(&paths, &JobConfig::default(), &output).expect("write_all");
        let value = read_json_gz(&paths.artifact("_user_timing.json.gz"));
        assert_eq!(value[0]["name"], json!("navigationStart"));
    }

    #[test]
    fn test_discard_timeline_skips_cpu_table() {
        let dir = TempDir::new().expect("tempdir");
        let paths = task_paths(&dir);
        let mut output = empty_output();
        output
            .trace
            .cpu
            .slices
            .entry("1:1".to_string())
            .or_default()
            .insert("Task".to_string(), vec![100]);

        let config = JobConfig {
            discard_timeline: true,
            ..JobConfig::default()
        };
        write_all(&paths, &config, &output).expect("write_all");
        assert!(!paths.artifact("_timeline_cpu.json.gz").exists());

        write_all(&paths, &JobConfig::default(), &output).expect("write_all");
        assert!(paths.artifact("_timeline_cpu.json.gz").exists());
    }

    #[test]
    fn test_raw_bodies_written_by_id() {
        let dir = TempDir::new().expect("tempdir");
        let paths = task_paths(&dir);

        let mut store = crate::session::RequestStore::new();
        store.on_request_will_be_sent(
            &serde_json::from_value(json!({
                "requestId": "5.1",
                "timestamp": 1.0,
                "request": {"url": "https://example.com/app.js", "method": "GET"},
                "type": "Script"
            }))
            .expect("payload"),
            None,
        );
        let mut requests = store.finalize();
        requests[0].mime_type = Some("application/javascript".to_string());
        requests[0].body = Some(b"console.log(1)".to_vec());

        let mut output = empty_output();
        output.requests = requests;
        let config = JobConfig {
            bodies: true,
            ..JobConfig::default()
        };
        write_all(&paths, &config, &output).expect("write_all");

        let raw = fs::read(dir.path().join("bodies").join("5.1")).expect("raw body");
        assert_eq!(raw, b"console.log(1)");
        assert!(paths.artifact("_bodies.zip").exists());
    }

    #[test]
    fn test_coverage_artifact_written_when_present() {
        let dir = TempDir::new().expect("tempdir");
        let paths = task_paths(&dir);

        write_all(&paths, &JobConfig::default(), &empty_output()).expect("write_all");
        assert!(!paths.artifact("_coverage.json.gz").exists());

        let mut output = empty_output();
        output.coverage.insert(
            "https://x.test/app.js".to_string(),
            json!({"JS_bytes": 200, "JS_bytes_used": 100, "JS_percent_used": 50.0}),
        );
        write_all(&paths, &JobConfig::default(), &output).expect("write_all");
        let value = read_json_gz(&paths.artifact("_coverage.json.gz"));
        assert_eq!(value["https://x.test/app.js"]["JS_percent_used"], 50.0);
    }

    #[test]
    fn test_protocol_log_lines() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("log.json.gz");
        {
            let mut log = ProtocolLog::create(&path).expect("create");
            log.append(&json!({"method": "Page.loadEventFired"}))
                .expect("append");
            log.append(&json!({"id": 7})).expect("append");
        }
        let mut decoder = GzDecoder::new(File::open(&path).expect("open"));
        let mut raw = String::new();
        decoder.read_to_string(&mut raw).expect("decompress");
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("Page.loadEventFired"));
    }
}

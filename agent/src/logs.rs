//! Background log streamer: follow the cloud-init output plus any extra
//! job log files and ship new lines to the per-job CloudWatch stream.
//!
//! The cloud-init log is drained from offset zero before anything else, so
//! the stream always opens with the boot output's first line. Extra log
//! files usually do not exist until the job creates them; they are picked
//! up (and watched) as soon as they appear.

use std::io::Read;
use std::io::Seek;
use std::io::SeekFrom;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use aws_sdk_cloudwatchlogs::types::InputLogEvent;
use chrono::Utc;
use hyperdrive_protocol::AgentPayload;
use notify::RecursiveMode;
use notify::Watcher;
use tokio::sync::mpsc;
use tracing::warn;

use crate::CLOUD_INIT_LOG;
use crate::WORKFLOW_DIR;

/// Poll fallback while waiting for modification events; also how often
/// not-yet-existing extra logs are re-checked.
const IDLE_TICK: Duration = Duration::from_secs(1);

pub fn spawn_streamer(
    client: aws_sdk_cloudwatchlogs::Client,
    payload: &AgentPayload,
) -> tokio::task::JoinHandle<()> {
    let group = payload.log_group.clone();
    let stream = payload.jobid.clone();
    let mut paths = vec![PathBuf::from(CLOUD_INIT_LOG)];
    paths.extend(payload.extra_logs.iter().map(|p| resolve_log_path(p)));
    tokio::spawn(async move {
        if let Err(err) = stream_logs(&client, &group, &stream, paths).await {
            warn!("log streaming stopped: {err:#}");
        }
    })
}

/// Extra log paths come from the jobscript and are relative to the
/// workflow tree.
fn resolve_log_path(path: &str) -> PathBuf {
    let path = Path::new(path);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        Path::new(WORKFLOW_DIR).join(path)
    }
}

struct FileTail {
    path: PathBuf,
    offset: u64,
    watched: bool,
}

async fn stream_logs(
    client: &aws_sdk_cloudwatchlogs::Client,
    group: &str,
    stream: &str,
    paths: Vec<PathBuf>,
) -> anyhow::Result<()> {
    client
        .create_log_stream()
        .log_group_name(group)
        .log_stream_name(stream)
        .send()
        .await?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut watcher = notify::recommended_watcher(move |result: notify::Result<notify::Event>| {
        let _ = tx.send(result);
    })?;

    let mut tails: Vec<FileTail> = paths
        .into_iter()
        .map(|path| FileTail {
            path,
            offset: 0,
            watched: false,
        })
        .collect();

    let mut sequence_token: Option<String> = None;
    loop {
        for tail in &mut tails {
            if !tail.watched
                && tail.path.exists()
                && watcher.watch(&tail.path, RecursiveMode::NonRecursive).is_ok()
            {
                tail.watched = true;
            }
        }

        let timestamp = Utc::now().timestamp_millis();
        let mut events = Vec::new();
        for tail in &mut tails {
            let Ok((lines, offset)) = read_new_lines(&tail.path, tail.offset) else {
                continue;
            };
            tail.offset = offset;
            for line in lines {
                events.push(
                    InputLogEvent::builder()
                        .timestamp(timestamp)
                        .message(line)
                        .build()?,
                );
            }
        }
        if !events.is_empty() {
            let response = client
                .put_log_events()
                .log_group_name(group)
                .log_stream_name(stream)
                .set_log_events(Some(events))
                .set_sequence_token(sequence_token.take())
                .send()
                .await?;
            sequence_token = response.next_sequence_token().map(str::to_string);
        }

        // wake on the next modification, or tick over to re-check for
        // extra log files that have not appeared yet
        let _ = tokio::time::timeout(IDLE_TICK, rx.recv()).await;
    }
}

/// Read complete lines appended past `offset`; a trailing partial line is
/// held back until its newline arrives.
fn read_new_lines(path: &Path, offset: u64) -> std::io::Result<(Vec<String>, u64)> {
    let mut file = std::fs::File::open(path)?;
    let len = file.metadata()?.len();
    if len <= offset {
        return Ok((Vec::new(), offset));
    }
    file.seek(SeekFrom::Start(offset))?;
    let mut buf = Vec::new();
    file.take(len - offset).read_to_end(&mut buf)?;

    let consumed = match buf.iter().rposition(|byte| *byte == b'\n') {
        Some(index) => index + 1,
        None => 0,
    };
    let text = String::from_utf8_lossy(&buf[..consumed]);
    let lines = text.split_inclusive('\n').map(str::to_string).collect();
    Ok((lines, offset + consumed as u64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn reads_only_new_complete_lines() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("out.log");
        std::fs::write(&path, "first\nsecond\npar").expect("write");

        let (lines, offset) = read_new_lines(&path, 0).expect("read");
        assert_eq!(lines, vec!["first\n", "second\n"]);
        assert_eq!(offset, 13);

        // the partial line stays put until completed
        let (lines, offset) = read_new_lines(&path, offset).expect("read");
        assert_eq!(lines, Vec::<String>::new());
        assert_eq!(offset, 13);

        std::fs::write(&path, "first\nsecond\npartial\n").expect("append");
        let (lines, offset) = read_new_lines(&path, offset).expect("read");
        assert_eq!(lines, vec!["partial\n"]);
        assert_eq!(offset, 21);
    }

    #[test]
    fn missing_file_is_an_error_not_a_panic() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(read_new_lines(&dir.path().join("absent.log"), 0).is_err());
    }

    #[test]
    fn relative_extra_logs_resolve_under_the_workflow_tree() {
        assert_eq!(
            resolve_log_path("logs/align.log"),
            Path::new(WORKFLOW_DIR).join("logs/align.log")
        );
        assert_eq!(
            resolve_log_path("/var/log/custom.log"),
            PathBuf::from("/var/log/custom.log")
        );
    }
}

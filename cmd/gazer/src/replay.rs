//! Offline replay of a JSON-lines detection log.
//!
//! Each non-empty line is one frame in the shape accepted by
//! `POST /api/frames`. Lines starting with `#` are skipped.

use std::io::BufRead;
use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use gazer_reid::{FrameSummary, Session};
use tracing::{debug, warn};

use crate::wire::FrameInput;

/// Parses one log line. `Ok(None)` for blank and comment lines.
pub fn parse_line(line: &str) -> Result<Option<FrameInput>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    Ok(Some(serde_json::from_str(line)?))
}

/// Reads every frame from `path`, failing on the first bad line.
pub fn read_frames(path: &Path) -> Result<Vec<FrameInput>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    let mut frames = Vec::new();
    for (i, line) in std::io::BufReader::new(file).lines().enumerate() {
        let line = line?;
        if let Some(frame) =
            parse_line(&line).with_context(|| format!("{}:{}", path.display(), i + 1))?
        {
            frames.push(frame);
        }
    }
    Ok(frames)
}

/// Feeds `frames` through `session`, calling `on_frame` with each summary.
pub fn run<F>(session: &Session, frames: Vec<FrameInput>, mut on_frame: F) -> Result<()>
where
    F: FnMut(usize, &FrameSummary),
{
    for (i, input) in frames.into_iter().enumerate() {
        let frame = match input.frame() {
            Ok(f) => f,
            Err(e) => {
                warn!(frame = i, error = %e, "skipping image");
                None
            }
        };
        let use_tracking = input.use_tracking;
        let detections = input.into_detections(frame.as_ref());
        let summary = if use_tracking {
            session.summarize(session.track(detections))
        } else {
            session.identify(detections)
        };
        on_frame(i, &summary);
    }
    Ok(())
}

/// Waits until no resolution is queued or running, or `limit` passes.
/// Returns whether the pipeline went idle.
pub async fn settle(session: &Session, limit: Duration) -> Result<bool> {
    let deadline = Instant::now() + limit;
    loop {
        let status = session.status()?;
        if status.in_flight == 0 && status.queued == 0 {
            return Ok(true);
        }
        if Instant::now() >= deadline {
            debug!(in_flight = status.in_flight, queued = status.queued, "settle timed out");
            return Ok(false);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub fn format_summary(index: usize, summary: &FrameSummary) -> String {
    format!(
        "frame {:>5}: {} head(s) [{}]",
        index,
        summary.head_count,
        summary.names.join(", ")
    )
}

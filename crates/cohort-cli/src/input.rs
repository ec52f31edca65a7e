//! Candidate files
//!
//! One JSON object per line; blank lines are ignored. A batch directory holds
//! `<audience>/<YYYY-MM-DD>.jsonl` files, one per day.

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use cohort_engine::DayBatch;
use cohort_features::RawCandidate;
use std::path::Path;

/// Parse JSON-lines candidate text
pub(crate) fn parse_candidates(text: &str) -> Result<Vec<RawCandidate>> {
    let mut candidates = Vec::new();
    for (index, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let candidate: RawCandidate =
            serde_json::from_str(line).with_context(|| format!("line {}: not a candidate row", index + 1))?;
        candidates.push(candidate);
    }
    Ok(candidates)
}

pub(crate) async fn read_candidates(path: &Path) -> Result<Vec<RawCandidate>> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    parse_candidates(&text).with_context(|| format!("parsing {}", path.display()))
}

/// Day named by a `<YYYY-MM-DD>.jsonl` file, `None` for other files
pub(crate) fn day_of_file(path: &Path) -> Result<Option<NaiveDate>> {
    if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
        return Ok(None);
    }
    let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
        return Ok(None);
    };
    let day = NaiveDate::parse_from_str(stem, "%Y-%m-%d")
        .with_context(|| format!("{} is not named after a day", path.display()))?;
    Ok(Some(day))
}

/// All day batches under `<root>/<audience>/`, sorted by day
///
/// A missing directory means no days for the audience.
pub(crate) async fn read_batches(root: &Path, audience: &str) -> Result<Vec<DayBatch>> {
    let dir = root.join(audience);
    let mut entries = match tokio::fs::read_dir(&dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).with_context(|| format!("listing {}", dir.display())),
    };

    let mut batches = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let Some(day) = day_of_file(&path)? else {
            continue;
        };
        batches.push(DayBatch::new(day, read_candidates(&path).await?));
    }
    batches.sort_by_key(|b| b.day);
    if let Some(pair) = batches.windows(2).find(|w| w[0].day == w[1].day) {
        bail!("{} has two files for {}", dir.display(), pair[0].day);
    }
    Ok(batches)
}

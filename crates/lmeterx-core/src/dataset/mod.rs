use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::Deserialize;
use tracing::warn;

use crate::error::EngineError;

/// A reference to an image attached to a dataset entry.
#[derive(Debug, Clone, PartialEq)]
pub enum ImageRef {
    Path(PathBuf),
    Url(String),
    Base64(String),
}

/// One unit of work handed to a virtual user on each iteration.
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetEntry {
    pub id: String,
    pub prompts: Vec<String>,
    pub images: Vec<ImageRef>,
    /// For GENERIC tasks, the literal request body to send verbatim.
    pub raw_payload: Option<serde_json::Value>,
}

/// Where a task's dataset lives. Only local files are supported today.
pub enum DatasetSource {
    File(PathBuf),
}

/// A loaded, immutable dataset shared by every virtual user in a run. `next`
/// hands out entries round-robin via an atomic cursor, so it is safe to call
/// from many virtual users concurrently without a lock.
pub struct Dataset {
    entries: Vec<DatasetEntry>,
    cursor: AtomicUsize,
}

impl Dataset {
    pub fn from_entries(entries: Vec<DatasetEntry>) -> Result<Self, EngineError> {
        if entries.is_empty() {
            return Err(EngineError::Dataset("DATASET_EMPTY".to_string()));
        }
        Ok(Self {
            entries,
            cursor: AtomicUsize::new(0),
        })
    }

    pub async fn load(source: &DatasetSource, image_root: &Path) -> Result<Self, EngineError> {
        match source {
            DatasetSource::File(path) => {
                let raw = tokio::fs::read_to_string(path).await?;
                let entries = parse_dataset(&raw, image_root);
                Self::from_entries(entries)
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the next entry, advancing the shared cursor. Deterministic
    /// across repeated loads: the k-th call always returns `entries[k % len]`.
    pub fn next(&self) -> &DatasetEntry {
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % self.entries.len();
        &self.entries[idx]
    }

    /// Advances the cursor by `n` without returning anything, used to give
    /// each shard of a multi-process run a distinct starting offset so
    /// shards don't all begin on entry zero.
    pub fn skip(&self, n: usize) {
        self.cursor.fetch_add(n, Ordering::Relaxed);
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StringOrVec {
    One(String),
    Many(Vec<String>),
}

impl StringOrVec {
    fn into_vec(self) -> Vec<String> {
        match self {
            StringOrVec::One(s) => vec![s],
            StringOrVec::Many(v) => v,
        }
    }
}

#[derive(Debug, Deserialize)]
struct JsonlLine {
    id: Option<String>,
    prompt: Option<StringOrVec>,
    image_path: Option<StringOrVec>,
    image: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ShareGptTurn {
    from: String,
    value: String,
}

#[derive(Debug, Deserialize)]
struct ShareGptEntry {
    id: Option<String>,
    image: Option<String>,
    conversations: Vec<ShareGptTurn>,
}

fn resolve_image(raw: &str, image_root: &Path) -> ImageRef {
    if raw.starts_with("http://") || raw.starts_with("https://") {
        ImageRef::Url(raw.to_string())
    } else if raw.starts_with("data:") || looks_like_base64(raw) {
        ImageRef::Base64(raw.to_string())
    } else {
        ImageRef::Path(image_root.join(raw))
    }
}

fn looks_like_base64(raw: &str) -> bool {
    raw.len() > 64 && !raw.contains('/') && !raw.contains('\\')
}

fn check_image_path(images: &mut Vec<ImageRef>, entry_id: &str) {
    images.retain(|img| match img {
        ImageRef::Path(path) => {
            let exists = path.exists();
            if !exists {
                warn!(entry_id, path = %path.display(), "DATASET_IMAGE_MISSING");
            }
            exists
        }
        _ => true,
    });
}

fn parse_dataset(raw: &str, image_root: &Path) -> Vec<DatasetEntry> {
    let trimmed = raw.trim_start();
    if trimmed.starts_with('[') {
        parse_sharegpt(trimmed, image_root)
    } else {
        parse_jsonl(raw, image_root)
    }
}

fn parse_sharegpt(raw: &str, image_root: &Path) -> Vec<DatasetEntry> {
    let parsed: Vec<ShareGptEntry> = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "failed to parse ShareGPT dataset as JSON array");
            return Vec::new();
        }
    };

    parsed
        .into_iter()
        .enumerate()
        .map(|(idx, entry)| {
            let id = entry.id.unwrap_or_else(|| idx.to_string());
            let prompts = entry
                .conversations
                .into_iter()
                .filter(|turn| turn.from == "human")
                .map(|turn| turn.value)
                .collect();
            let mut images: Vec<ImageRef> = entry
                .image
                .into_iter()
                .map(|raw| resolve_image(&raw, image_root))
                .collect();
            check_image_path(&mut images, &id);
            DatasetEntry {
                id,
                prompts,
                images,
                raw_payload: None,
            }
        })
        .collect()
}

fn parse_jsonl(raw: &str, image_root: &Path) -> Vec<DatasetEntry> {
    let mut entries = Vec::new();
    let mut skipped = 0usize;

    for (idx, line) in raw.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match serde_json::from_str::<JsonlLine>(line) {
            Ok(parsed) => {
                let id = parsed.id.unwrap_or_else(|| idx.to_string());
                let prompts = parsed.prompt.map(StringOrVec::into_vec).unwrap_or_default();
                let mut images: Vec<ImageRef> = parsed
                    .image_path
                    .map(StringOrVec::into_vec)
                    .unwrap_or_default()
                    .into_iter()
                    .chain(parsed.image)
                    .map(|raw| resolve_image(&raw, image_root))
                    .collect();
                check_image_path(&mut images, &id);
                entries.push(DatasetEntry {
                    id,
                    prompts,
                    images,
                    raw_payload: None,
                });
            }
            Err(e) => {
                // Might still be a valid GENERIC request body even though it
                // doesn't match the LLM schema above.
                match serde_json::from_str::<serde_json::Value>(line) {
                    Ok(value) => entries.push(DatasetEntry {
                        id: idx.to_string(),
                        prompts: Vec::new(),
                        images: Vec::new(),
                        raw_payload: Some(value),
                    }),
                    Err(_) => {
                        skipped += 1;
                        warn!(line = idx, error = %e, "skipping malformed dataset line");
                    }
                }
            }
        }
    }

    if skipped > 0 {
        warn!(skipped, "dataset load skipped malformed lines");
    }

    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn jsonl_single_prompt_parses() {
        let raw = r#"{"id":"1","prompt":"hello"}"#;
        let entries = parse_jsonl(raw, Path::new("/tmp"));
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].prompts, vec!["hello".to_string()]);
    }

    #[test]
    fn jsonl_multi_prompt_parses() {
        let raw = r#"{"id":"1","prompt":["hi","there"]}"#;
        let entries = parse_jsonl(raw, Path::new("/tmp"));
        assert_eq!(entries[0].prompts, vec!["hi".to_string(), "there".to_string()]);
    }

    #[test]
    fn jsonl_malformed_line_is_skipped_not_fatal() {
        let raw = "{\"id\":\"1\",\"prompt\":\"ok\"}\nnot json at all garbage {{{\n{\"id\":\"2\",\"prompt\":\"also ok\"}";
        let entries = parse_jsonl(raw, Path::new("/tmp"));
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn jsonl_generic_line_kept_as_raw_payload() {
        let raw = r#"{"foo": "bar", "baz": 1}"#;
        let entries = parse_jsonl(raw, Path::new("/tmp"));
        assert_eq!(entries.len(), 1);
        assert!(entries[0].raw_payload.is_some());
        assert!(entries[0].prompts.is_empty());
    }

    #[test]
    fn sharegpt_extracts_human_turns_only() {
        let raw = r#"[{"id":"a","conversations":[{"from":"human","value":"q1"},{"from":"gpt","value":"a1"},{"from":"human","value":"q2"}]}]"#;
        let entries = parse_sharegpt(raw, Path::new("/tmp"));
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].prompts, vec!["q1".to_string(), "q2".to_string()]);
    }

    #[test]
    fn missing_image_path_is_dropped_not_fatal() {
        let dir = tempdir().unwrap();
        let raw = format!(
            r#"{{"id":"1","prompt":"hi","image_path":"{}/missing.png"}}"#,
            dir.path().display()
        );
        let entries = parse_jsonl(&raw, dir.path());
        assert_eq!(entries.len(), 1);
        assert!(entries[0].images.is_empty());
    }

    #[test]
    fn existing_image_path_is_kept() {
        let dir = tempdir().unwrap();
        let image_path = dir.path().join("pic.png");
        std::fs::write(&image_path, b"fake-bytes").unwrap();
        let raw = r#"{"id":"1","prompt":"hi","image_path":"pic.png"}"#;
        let entries = parse_jsonl(raw, dir.path());
        assert_eq!(entries[0].images.len(), 1);
    }

    #[test]
    fn from_entries_rejects_empty() {
        let result = Dataset::from_entries(Vec::new());
        assert!(result.is_err());
    }

    #[test]
    fn next_round_robins_deterministically() {
        let dataset = Dataset::from_entries(vec![
            DatasetEntry { id: "0".into(), prompts: vec![], images: vec![], raw_payload: None },
            DatasetEntry { id: "1".into(), prompts: vec![], images: vec![], raw_payload: None },
        ])
        .unwrap();
        let seq: Vec<String> = (0..5).map(|_| dataset.next().id.clone()).collect();
        assert_eq!(seq, vec!["0", "1", "0", "1", "0"]);
    }

    #[test]
    fn skip_offsets_the_cursor() {
        let dataset = Dataset::from_entries(vec![
            DatasetEntry { id: "0".into(), prompts: vec![], images: vec![], raw_payload: None },
            DatasetEntry { id: "1".into(), prompts: vec![], images: vec![], raw_payload: None },
            DatasetEntry { id: "2".into(), prompts: vec![], images: vec![], raw_payload: None },
        ])
        .unwrap();
        dataset.skip(1);
        assert_eq!(dataset.next().id, "1");
    }

    #[test]
    fn detects_sharegpt_by_leading_bracket() {
        let raw = r#"[{"conversations":[{"from":"human","value":"hi"}]}]"#;
        let entries = parse_dataset(raw, Path::new("/tmp"));
        assert_eq!(entries.len(), 1);
    }
}

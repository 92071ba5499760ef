use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::extractors::{MediaEngine, MediaReference};
use crate::utils::{ProcessTracker, UNTITLED};
use crate::AcquisitionError;

/// Caption keys yt-dlp reports that are not transcripts
const NON_TRANSCRIPT_TRACKS: &[&str] = &["live_chat"];

/// Normalized metadata persisted for every acquisition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataRecord {
    pub id: Option<String>,
    pub title: Option<String>,
    pub uploader: Option<String>,
    pub channel: Option<String>,
    pub view_count: Option<u64>,
    pub like_count: Option<u64>,
    /// Seconds
    pub duration: Option<f64>,
    /// `YYYYMMDD`, as reported upstream
    pub upload_date: Option<String>,
    pub description: Option<String>,
    pub tags: Option<Vec<String>>,
    pub categories: Option<Vec<String>>,
    /// The reference exactly as the caller supplied it
    #[serde(rename = "url")]
    pub source_url: String,
}

impl MetadataRecord {
    /// Build the fixed record shape, leaving absent or mistyped fields empty
    pub fn from_probe(info: &Value, source_url: &str) -> Self {
        Self {
            id: string_field(info, "id"),
            title: string_field(info, "title"),
            uploader: string_field(info, "uploader"),
            channel: string_field(info, "channel"),
            view_count: count_field(info, "view_count"),
            like_count: count_field(info, "like_count"),
            duration: info.get("duration").and_then(Value::as_f64),
            upload_date: string_field(info, "upload_date"),
            description: string_field(info, "description"),
            tags: string_list_field(info, "tags"),
            categories: string_list_field(info, "categories"),
            source_url: source_url.to_string(),
        }
    }

    /// Title used to name output files
    pub fn display_title(&self) -> &str {
        self.title
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .or(self.id.as_deref())
            .unwrap_or(UNTITLED)
    }
}

fn string_field(info: &Value, key: &str) -> Option<String> {
    info.get(key).and_then(Value::as_str).map(str::to_string)
}

fn count_field(info: &Value, key: &str) -> Option<u64> {
    let value = info.get(key)?;
    value
        .as_u64()
        .or_else(|| value.as_f64().filter(|v| *v >= 0.0).map(|v| v as u64))
}

fn string_list_field(info: &Value, key: &str) -> Option<Vec<String>> {
    info.get(key).and_then(Value::as_array).map(|items| {
        items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect()
    })
}

/// Full extraction payload of one probe, kept for the later stages
#[derive(Debug, Clone, PartialEq)]
pub struct RawProbeResult {
    info: Value,
}

impl RawProbeResult {
    pub fn new(info: Value) -> Self {
        Self { info }
    }

    pub fn id(&self) -> Option<&str> {
        self.info.get("id").and_then(Value::as_str)
    }

    /// Language codes with at least one caption track, in advertised order
    pub fn caption_languages(&self) -> Vec<String> {
        let Some(tracks) = self.info.get("subtitles").and_then(Value::as_object) else {
            return Vec::new();
        };

        tracks
            .iter()
            .filter(|(language, _)| !NON_TRANSCRIPT_TRACKS.contains(&language.as_str()))
            .filter(|(_, formats)| match formats {
                Value::Null => false,
                Value::Array(formats) => !formats.is_empty(),
                _ => true,
            })
            .map(|(language, _)| language.clone())
            .collect()
    }
}

/// Runs the single no-download probe of a pipeline invocation
pub struct MetadataExtractor<'a> {
    engine: &'a dyn MediaEngine,
}

impl<'a> MetadataExtractor<'a> {
    pub fn new(engine: &'a dyn MediaEngine) -> Self {
        Self { engine }
    }

    /// Probe `reference` once and normalize the result. Writes nothing.
    pub async fn probe(
        &self,
        reference: &MediaReference,
        processes: &ProcessTracker,
    ) -> Result<(MetadataRecord, RawProbeResult), AcquisitionError> {
        tracing::info!(
            "Probing {} metadata for: {}",
            self.engine.platform_name(),
            reference.url()
        );

        let info = self
            .engine
            .probe(reference.url(), processes)
            .await
            .map_err(AcquisitionError::Extraction)?;

        if !info.is_object() {
            return Err(AcquisitionError::Extraction(anyhow::anyhow!(
                "probe returned a {} instead of an object",
                json_kind(&info)
            )));
        }

        let record = MetadataRecord::from_probe(&info, reference.url());
        tracing::debug!("Probed `{}` ({:?})", record.display_title(), record.id);

        Ok((record, RawProbeResult::new(info)))
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractors::{validate_reference, MockMediaEngine};
    use serde_json::json;

    const URL: &str = "https://www.youtube.com/watch?v=abc123";

    #[test]
    fn test_from_probe_maps_known_fields() {
        let info = json!({
            "id": "abc123",
            "title": "My Video",
            "uploader": "Someone",
            "channel": "Someone's Channel",
            "view_count": 1200,
            "like_count": 34,
            "duration": 213,
            "upload_date": "20240131",
            "description": "A description",
            "tags": ["music", 7, "live"],
            "categories": ["Music"],
            "formats": [{"format_id": "251"}]
        });

        let record = MetadataRecord::from_probe(&info, URL);
        assert_eq!(record.id.as_deref(), Some("abc123"));
        assert_eq!(record.view_count, Some(1200));
        assert_eq!(record.duration, Some(213.0));
        assert_eq!(record.tags, Some(vec!["music".to_string(), "live".to_string()]));
        assert_eq!(record.categories, Some(vec!["Music".to_string()]));
        assert_eq!(record.source_url, URL);
    }

    #[test]
    fn test_from_probe_substitutes_null_for_missing_fields() {
        let record = MetadataRecord::from_probe(&json!({"id": "x", "view_count": "many"}), URL);
        assert_eq!(record.title, None);
        assert_eq!(record.view_count, None);
        assert_eq!(record.tags, None);

        let serialized = serde_json::to_value(&record).unwrap();
        let object = serialized.as_object().unwrap();
        for key in [
            "id", "title", "uploader", "channel", "view_count", "like_count", "duration",
            "upload_date", "description", "tags", "categories", "url",
        ] {
            assert!(object.contains_key(key), "missing key {key}");
        }
        assert_eq!(object["title"], Value::Null);
        assert_eq!(object["url"], json!(URL));
    }

    #[test]
    fn test_display_title_falls_back() {
        let titled = MetadataRecord::from_probe(&json!({"id": "x", "title": "T"}), URL);
        assert_eq!(titled.display_title(), "T");

        let untitled = MetadataRecord::from_probe(&json!({"id": "x", "title": "  "}), URL);
        assert_eq!(untitled.display_title(), "x");

        let empty = MetadataRecord::from_probe(&json!({}), URL);
        assert_eq!(empty.display_title(), UNTITLED);
    }

    #[test]
    fn test_caption_languages_keep_order_and_filter() {
        let raw = RawProbeResult::new(json!({
            "subtitles": {
                "fr": [{"ext": "vtt"}],
                "de": [{"ext": "vtt"}],
                "live_chat": [{"ext": "json"}],
                "es": []
            }
        }));
        assert_eq!(raw.caption_languages(), vec!["fr".to_string(), "de".to_string()]);

        assert!(RawProbeResult::new(json!({"subtitles": null})).caption_languages().is_empty());
        assert!(RawProbeResult::new(json!({})).caption_languages().is_empty());
    }

    #[tokio::test]
    async fn test_probe_calls_engine_once() {
        let mut engine = MockMediaEngine::new();
        engine.expect_platform_name().return_const("YouTube");
        engine
            .expect_probe()
            .times(1)
            .returning(|_, _| Ok(json!({"id": "abc123", "title": "My Video"})));

        let reference = validate_reference(URL).unwrap();
        let (record, raw) = MetadataExtractor::new(&engine)
            .probe(&reference, &ProcessTracker::new())
            .await
            .unwrap();

        assert_eq!(record.title.as_deref(), Some("My Video"));
        assert_eq!(raw.id(), Some("abc123"));
    }

    #[tokio::test]
    async fn test_probe_failure_is_extraction_error() {
        let mut engine = MockMediaEngine::new();
        engine.expect_platform_name().return_const("YouTube");
        engine
            .expect_probe()
            .returning(|_, _| Err(anyhow::anyhow!("Video unavailable")));

        let reference = validate_reference(URL).unwrap();
        let err = MetadataExtractor::new(&engine)
            .probe(&reference, &ProcessTracker::new())
            .await
            .unwrap_err();

        assert!(matches!(err, AcquisitionError::Extraction(_)));
        assert_eq!(err.cause_chain(), vec!["Video unavailable".to_string()]);
    }

    #[tokio::test]
    async fn test_probe_rejects_non_object_payload() {
        let mut engine = MockMediaEngine::new();
        engine.expect_platform_name().return_const("YouTube");
        engine.expect_probe().returning(|_, _| Ok(json!([1, 2])));

        let reference = validate_reference(URL).unwrap();
        let err = MetadataExtractor::new(&engine)
            .probe(&reference, &ProcessTracker::new())
            .await
            .unwrap_err();

        assert!(matches!(err, AcquisitionError::Extraction(_)));
    }
}

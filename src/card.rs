use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One feed item. Immutable once built by a content source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Card {
    /// Stable key, `lang:pageId`.
    pub id: String,
    pub title: String,
    pub body: String,
    pub link: String,
    #[serde(default)]
    pub thumbnail: Option<String>,
    #[serde(default)]
    pub attribution: Option<ImageAttribution>,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ImageAttribution {
    #[serde(default)]
    pub artist: Option<String>,
    #[serde(default)]
    pub license: Option<String>,
    #[serde(default)]
    pub source_url: Option<String>,
}

impl ImageAttribution {
    pub fn is_empty(&self) -> bool {
        self.artist.is_none() && self.license.is_none() && self.source_url.is_none()
    }

    pub fn credit_line(&self) -> Option<String> {
        match (&self.artist, &self.license) {
            (Some(artist), Some(license)) => Some(format!("{artist} ({license})")),
            (Some(artist), None) => Some(artist.clone()),
            (None, Some(license)) => Some(license.clone()),
            (None, None) => None,
        }
    }
}

pub fn card_id(lang: &str, page_id: i64) -> String {
    format!("{lang}:{page_id}")
}

/// Collapse runs of whitespace so extracts wrap cleanly.
pub fn normalize_text(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_language_scoped() {
        assert_eq!(card_id("en", 42), "en:42");
        assert_ne!(card_id("en", 42), card_id("de", 42));
    }

    #[test]
    fn normalize_collapses_whitespace() {
        assert_eq!(normalize_text("  Rust\n\n is   fast \t"), "Rust is fast");
    }

    #[test]
    fn credit_line_prefers_both_fields() {
        let attribution = ImageAttribution {
            artist: Some("Jane".into()),
            license: Some("CC BY-SA 4.0".into()),
            source_url: None,
        };
        assert_eq!(attribution.credit_line().as_deref(), Some("Jane (CC BY-SA 4.0)"));
        assert!(ImageAttribution::default().is_empty());
    }
}

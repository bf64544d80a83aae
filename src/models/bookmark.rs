use serde::{Deserialize, Serialize};
use chrono::{DateTime, Utc};
use validator::Validate;

use crate::utils::{display_host, serde_helpers::record_id};

/// Prefix carried by client-assigned ids that the backend has not confirmed.
pub const TEMP_ID_PREFIX: &str = "tmp-";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bookmark {
    #[serde(with = "record_id")]
    pub id: String,
    pub url: String,
    pub title: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
}

impl Bookmark {
    pub fn is_temporary(&self) -> bool {
        self.id.starts_with(TEMP_ID_PREFIX)
    }
}

/// Row sent to the backend on insert; id and timestamp are server-assigned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewBookmark {
    pub url: String,
    pub title: String,
    pub user_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreateBookmarkRequest {
    #[validate(length(max = 500))]
    pub title: String,
    #[validate(length(max = 2048))]
    pub url: String,
}

/// A list entry as the dashboard renders it.
#[derive(Debug, Clone, Serialize)]
pub struct BookmarkView {
    #[serde(flatten)]
    pub bookmark: Bookmark,
    pub host: String,
    pub pending: bool,
    pub copied: bool,
}

impl BookmarkView {
    pub fn new(bookmark: Bookmark, copied_id: Option<&str>) -> Self {
        let copied = copied_id == Some(bookmark.id.as_str());
        Self {
            host: display_host(&bookmark.url),
            pending: bookmark.is_temporary(),
            copied,
            bookmark,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_deserialize_backend_row() {
        let row = json!({
            "id": 17,
            "url": "https://docs.rs",
            "title": "Docs",
            "user_id": "u-1",
            "created_at": "2024-03-01T10:00:00+00:00"
        });

        let bookmark: Bookmark = serde_json::from_value(row).unwrap();
        assert_eq!(bookmark.id, "17");
        assert!(!bookmark.is_temporary());
    }

    #[test]
    fn test_view_marks_copied_and_pending() {
        let bookmark = Bookmark {
            id: format!("{}1700000000000", TEMP_ID_PREFIX),
            url: "https://example.com/page".to_string(),
            title: "Example".to_string(),
            user_id: "u-1".to_string(),
            created_at: Utc::now(),
        };

        let view = BookmarkView::new(bookmark.clone(), Some(bookmark.id.as_str()));
        assert_eq!(view.host, "example.com");
        assert!(view.pending);
        assert!(view.copied);

        let view = BookmarkView::new(bookmark, None);
        assert!(!view.copied);
    }
}

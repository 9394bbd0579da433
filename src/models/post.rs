use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;
use validator::Validate;

/// How many characters of content a feed row carries.
const SNIPPET_LEN: usize = 50;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Post {
    pub id: Uuid,
    pub title: String,
    pub content: String,
    pub author_id: Uuid,
    pub score: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Post {
    pub fn snippet(&self) -> String {
        self.content.chars().take(SNIPPET_LEN).collect()
    }
}

// Create post request
#[derive(Debug, Validate, Deserialize)]
pub struct CreatePostRequest {
    #[validate(length(min = 1, max = 300))]
    pub title: String,
    #[validate(length(min = 1))]
    pub content: String,
}

// Update post request
#[derive(Debug, Validate, Deserialize)]
pub struct UpdatePostRequest {
    #[validate(length(min = 1, max = 300))]
    pub title: Option<String>,
    #[validate(length(min = 1))]
    pub content: Option<String>,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct PostAuthor {
    pub id: Uuid,
    pub username: String,
}

// Full post response (detail view)
#[derive(Debug, Serialize)]
pub struct PostResponse {
    pub id: Uuid,
    pub title: String,
    pub content: String,
    pub author: PostAuthor,
    pub score: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub user_vote: Option<i16>,
}

// Post list response (for feeds)
#[derive(Debug, Serialize)]
pub struct PostListItem {
    pub id: Uuid,
    pub title: String,
    pub content_snippet: String,
    pub author: PostAuthor,
    pub score: i32,
    pub created_at: DateTime<Utc>,
    pub user_vote: Option<i16>,
}

#[derive(Debug, Serialize)]
pub struct PostPage {
    pub posts: Vec<PostListItem>,
    pub has_more: bool,
    pub next_cursor: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn post_with_content(content: &str) -> Post {
        Post {
            id: Uuid::new_v4(),
            title: "t".to_string(),
            content: content.to_string(),
            author_id: Uuid::new_v4(),
            score: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn snippet_truncates_long_content() {
        let post = post_with_content(&"x".repeat(200));
        assert_eq!(post.snippet().len(), 50);
    }

    #[test]
    fn snippet_keeps_short_content_whole() {
        let post = post_with_content("short enough");
        assert_eq!(post.snippet(), "short enough");
    }

    #[test]
    fn snippet_respects_char_boundaries() {
        let post = post_with_content(&"é".repeat(60));
        assert_eq!(post.snippet().chars().count(), 50);
    }
}

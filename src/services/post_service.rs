use std::collections::HashMap;

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::{
    error::{AppError, Result},
    loader::{BatchFetch, Batcher},
    models::{Post, PostAuthor, PostListItem, PostPage, PostResponse},
};

/// Server-side cap on feed page size, applied regardless of the caller's limit.
pub const MAX_PAGE_SIZE: u32 = 50;

/// Keyset cursor over the feed ordering `(created_at DESC, id DESC)`.
///
/// Derived from the last row of a page, never from a client-supplied offset,
/// so concurrent inserts ahead of the cursor cannot skip or duplicate rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageCursor {
    pub created_at: DateTime<Utc>,
    pub id: Uuid,
}

impl PageCursor {
    fn after(post: &Post) -> Self {
        Self {
            created_at: post.created_at,
            id: post.id,
        }
    }

    pub fn encode(&self) -> String {
        let raw = format!("{}.{}", self.created_at.timestamp_micros(), self.id);
        URL_SAFE_NO_PAD.encode(raw)
    }

    pub fn decode(token: &str) -> Result<Self> {
        let invalid = || AppError::BadRequest("Invalid cursor".to_string());

        let raw = URL_SAFE_NO_PAD.decode(token).map_err(|_| invalid())?;
        let raw = String::from_utf8(raw).map_err(|_| invalid())?;
        let (micros, id) = raw.split_once('.').ok_or_else(invalid)?;

        let micros: i64 = micros.parse().map_err(|_| invalid())?;
        let created_at = DateTime::from_timestamp_micros(micros).ok_or_else(invalid)?;
        let id = Uuid::parse_str(id).map_err(|_| invalid())?;

        Ok(Self { created_at, id })
    }
}

fn clamp_limit(limit: u32) -> usize {
    limit.min(MAX_PAGE_SIZE) as usize
}

fn split_page(mut rows: Vec<Post>, limit: usize) -> (Vec<Post>, bool) {
    let has_more = rows.len() > limit;
    rows.truncate(limit);
    (rows, has_more)
}

/// Newest-first page of posts with related data attached.
///
/// Fetches `limit + 1` rows to learn whether another page exists without a
/// second count query; page depth does not change the query cost.
pub async fn list_posts(
    db: &PgPool,
    viewer_id: Option<Uuid>,
    limit: u32,
    cursor: Option<&str>,
) -> Result<PostPage> {
    if limit == 0 {
        return Err(AppError::BadRequest("limit must be at least 1".to_string()));
    }

    let limit = clamp_limit(limit);
    let cursor = cursor.map(PageCursor::decode).transpose()?;

    let rows = match cursor {
        Some(cursor) => {
            sqlx::query_as::<_, Post>(
                r#"
                SELECT * FROM posts
                WHERE (created_at, id) < ($2, $3)
                ORDER BY created_at DESC, id DESC
                LIMIT $1
                "#,
            )
            .bind((limit + 1) as i64)
            .bind(cursor.created_at)
            .bind(cursor.id)
            .fetch_all(db)
            .await?
        }
        None => {
            sqlx::query_as::<_, Post>(
                "SELECT * FROM posts ORDER BY created_at DESC, id DESC LIMIT $1",
            )
            .bind((limit + 1) as i64)
            .fetch_all(db)
            .await?
        }
    };

    let (page, has_more) = split_page(rows, limit);
    let next_cursor = if has_more {
        page.last().map(|post| PageCursor::after(post).encode())
    } else {
        None
    };

    let posts = hydrate_list(db, &page, viewer_id).await?;

    Ok(PostPage {
        posts,
        has_more,
        next_cursor,
    })
}

pub async fn get_post_by_id_raw(db: &PgPool, post_id: Uuid) -> Result<Option<Post>> {
    let post = sqlx::query_as::<_, Post>("SELECT * FROM posts WHERE id = $1")
        .bind(post_id)
        .fetch_optional(db)
        .await?;

    Ok(post)
}

pub async fn get_post_by_id(
    db: &PgPool,
    post_id: Uuid,
    viewer_id: Option<Uuid>,
) -> Result<Option<PostResponse>> {
    let Some(post) = get_post_by_id_raw(db, post_id).await? else {
        return Ok(None);
    };

    let mut authors = Batcher::new(AuthorFetcher { db });
    let mut votes = Batcher::new(VoteStatusFetcher { db });

    authors.defer(post.author_id);
    if let Some(viewer) = viewer_id {
        votes.defer((post.id, viewer));
    }
    authors.flush().await?;
    votes.flush().await?;

    let author = authors
        .get(&post.author_id)
        .cloned()
        .ok_or_else(|| AppError::Internal(format!("author missing for post {}", post.id)))?;
    let user_vote = viewer_id.and_then(|viewer| votes.get(&(post.id, viewer)).copied());

    Ok(Some(PostResponse {
        id: post.id,
        title: post.title,
        content: post.content,
        author,
        score: post.score,
        created_at: post.created_at,
        updated_at: post.updated_at,
        user_vote,
    }))
}

pub async fn create_post(db: &PgPool, author_id: Uuid, title: &str, content: &str) -> Result<Post> {
    let now = Utc::now();

    let post = sqlx::query_as::<_, Post>(
        r#"
        INSERT INTO posts (id, title, content, author_id, score, created_at, updated_at)
        VALUES ($1, $2, $3, $4, 0, $5, $5)
        RETURNING *
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(title)
    .bind(content)
    .bind(author_id)
    .bind(now)
    .fetch_one(db)
    .await?;

    Ok(post)
}

pub async fn update_post(
    db: &PgPool,
    post_id: Uuid,
    title: Option<&str>,
    content: Option<&str>,
) -> Result<Option<Post>> {
    let post = sqlx::query_as::<_, Post>(
        r#"
        UPDATE posts
        SET title = COALESCE($1, title),
            content = COALESCE($2, content),
            updated_at = $3
        WHERE id = $4
        RETURNING *
        "#,
    )
    .bind(title)
    .bind(content)
    .bind(Utc::now())
    .bind(post_id)
    .fetch_optional(db)
    .await?;

    Ok(post)
}

/// Hard delete; vote rows go with the post via FK cascade.
pub async fn delete_post(db: &PgPool, post_id: Uuid) -> Result<()> {
    sqlx::query("DELETE FROM posts WHERE id = $1")
        .bind(post_id)
        .execute(db)
        .await?;

    Ok(())
}

/// Attach authors and the viewer's vote status to a page of posts.
///
/// Both lookups go through request-scoped batchers: one author query and one
/// vote-status query per page, no matter how many rows it holds.
async fn hydrate_list(
    db: &PgPool,
    posts: &[Post],
    viewer_id: Option<Uuid>,
) -> Result<Vec<PostListItem>> {
    let mut authors = Batcher::new(AuthorFetcher { db });
    let mut votes = Batcher::new(VoteStatusFetcher { db });

    for post in posts {
        authors.defer(post.author_id);
        if let Some(viewer) = viewer_id {
            votes.defer((post.id, viewer));
        }
    }
    authors.flush().await?;
    votes.flush().await?;

    posts
        .iter()
        .map(|post| {
            let author = authors
                .get(&post.author_id)
                .cloned()
                .ok_or_else(|| AppError::Internal(format!("author missing for post {}", post.id)))?;
            let user_vote = viewer_id.and_then(|viewer| votes.get(&(post.id, viewer)).copied());

            Ok(PostListItem {
                id: post.id,
                title: post.title.clone(),
                content_snippet: post.snippet(),
                author,
                score: post.score,
                created_at: post.created_at,
                user_vote,
            })
        })
        .collect()
}

pub struct AuthorFetcher<'a> {
    pub db: &'a PgPool,
}

#[async_trait]
impl<'a> BatchFetch for AuthorFetcher<'a> {
    type Key = Uuid;
    type Value = PostAuthor;

    async fn fetch(&self, keys: &[Uuid]) -> Result<HashMap<Uuid, PostAuthor>> {
        let rows = sqlx::query_as::<_, PostAuthor>("SELECT id, username FROM users WHERE id = ANY($1)")
            .bind(keys.to_vec())
            .fetch_all(self.db)
            .await?;

        // Re-key instead of relying on row order matching the key list.
        Ok(rows.into_iter().map(|author| (author.id, author)).collect())
    }
}

/// Looks up the viewing user's vote per (post, user) pair.
pub struct VoteStatusFetcher<'a> {
    pub db: &'a PgPool,
}

#[async_trait]
impl<'a> BatchFetch for VoteStatusFetcher<'a> {
    type Key = (Uuid, Uuid); // (post_id, user_id)
    type Value = i16;

    async fn fetch(&self, keys: &[(Uuid, Uuid)]) -> Result<HashMap<(Uuid, Uuid), i16>> {
        let (post_ids, user_ids): (Vec<Uuid>, Vec<Uuid>) = keys.iter().copied().unzip();

        let rows = sqlx::query_as::<_, (Uuid, Uuid, i16)>(
            r#"
            SELECT pv.post_id, pv.user_id, pv.vote_type
            FROM post_votes pv
            JOIN UNNEST($1::uuid[], $2::uuid[]) AS wanted(post_id, user_id)
              ON pv.post_id = wanted.post_id AND pv.user_id = wanted.user_id
            "#,
        )
        .bind(post_ids)
        .bind(user_ids)
        .fetch_all(self.db)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(post_id, user_id, vote_type)| ((post_id, user_id), vote_type))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn post_at(micros: i64) -> Post {
        Post {
            id: Uuid::new_v4(),
            title: "title".to_string(),
            content: "content".to_string(),
            author_id: Uuid::new_v4(),
            score: 0,
            created_at: DateTime::from_timestamp_micros(micros).unwrap(),
            updated_at: DateTime::from_timestamp_micros(micros).unwrap(),
        }
    }

    #[test]
    fn cursor_round_trips() {
        let cursor = PageCursor {
            created_at: DateTime::from_timestamp_micros(1_722_470_400_123_456).unwrap(),
            id: Uuid::new_v4(),
        };

        let decoded = PageCursor::decode(&cursor.encode()).unwrap();
        assert_eq!(decoded, cursor);
    }

    #[test]
    fn garbage_cursor_is_rejected() {
        assert!(PageCursor::decode("not base64 at all!!").is_err());
        assert!(PageCursor::decode(&URL_SAFE_NO_PAD.encode("nonsense")).is_err());
        assert!(PageCursor::decode(&URL_SAFE_NO_PAD.encode("123.not-a-uuid")).is_err());
    }

    #[test]
    fn limit_is_clamped_to_max_page_size() {
        assert_eq!(clamp_limit(1000), 50);
        assert_eq!(clamp_limit(50), 50);
        assert_eq!(clamp_limit(10), 10);
    }

    #[test]
    fn extra_row_signals_more_pages() {
        let rows: Vec<Post> = (0..11).map(|i| post_at(1_000_000 * i)).collect();
        let (page, has_more) = split_page(rows, 10);

        assert_eq!(page.len(), 10);
        assert!(has_more);
    }

    #[test]
    fn short_fetch_is_the_last_page() {
        let rows: Vec<Post> = (0..7).map(|i| post_at(1_000_000 * i)).collect();
        let (page, has_more) = split_page(rows, 10);

        assert_eq!(page.len(), 7);
        assert!(!has_more);
    }
}

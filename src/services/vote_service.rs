use sqlx::PgPool;
use uuid::Uuid;

use crate::{
    error::{AppError, Result},
    models::VoteResponse,
};

/// What a vote intent does to the stored vote row and the post score.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum VoteTransition {
    /// No row yet: insert one and move the score by the vote value.
    FirstVote { delta: i16 },
    /// Row exists with the opposite direction: flip it in place, the score
    /// moves two units (one to undo the old vote, one for the new).
    Reversal { delta: i16 },
    /// Row already holds the requested direction: nothing to write.
    NoChange,
}

pub(crate) fn transition(existing: Option<i16>, desired: i16) -> VoteTransition {
    match existing {
        None => VoteTransition::FirstVote { delta: desired },
        Some(current) if current == desired => VoteTransition::NoChange,
        Some(_) => VoteTransition::Reversal { delta: 2 * desired },
    }
}

/// Apply a user's vote intent to a post.
///
/// The vote row and the denormalized score move in one transaction; any
/// failure rolls both back. Re-sending the current direction is a no-op,
/// there is no vote retraction. Concurrent writers on the same post surface
/// as `Conflict` and the caller decides whether to retry.
pub async fn apply_vote(
    db: &PgPool,
    user_id: Uuid,
    post_id: Uuid,
    vote_type: i16,
) -> Result<VoteResponse> {
    if vote_type != 1 && vote_type != -1 {
        return Err(AppError::BadRequest(
            "vote_type must be 1 or -1".to_string(),
        ));
    }

    let mut tx = db.begin().await?;

    // Lock the caller's vote row (if any) for the rest of the transaction.
    let existing: Option<i16> = sqlx::query_scalar(
        "SELECT vote_type FROM post_votes WHERE user_id = $1 AND post_id = $2 FOR UPDATE",
    )
    .bind(user_id)
    .bind(post_id)
    .fetch_optional(&mut *tx)
    .await?;

    let delta = match transition(existing, vote_type) {
        VoteTransition::NoChange => {
            let score: i32 = sqlx::query_scalar("SELECT score FROM posts WHERE id = $1")
                .bind(post_id)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or_else(|| AppError::NotFound("Post not found".to_string()))?;
            tx.commit().await?;

            return Ok(VoteResponse {
                user_vote: Some(vote_type),
                score,
            });
        }
        VoteTransition::FirstVote { delta } => {
            sqlx::query(
                r#"
                INSERT INTO post_votes (id, user_id, post_id, vote_type, created_at, updated_at)
                VALUES ($1, $2, $3, $4, NOW(), NOW())
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(user_id)
            .bind(post_id)
            .bind(vote_type)
            .execute(&mut *tx)
            .await
            .map_err(map_vote_write_error)?;

            delta
        }
        VoteTransition::Reversal { delta } => {
            sqlx::query(
                "UPDATE post_votes SET vote_type = $1, updated_at = NOW() WHERE user_id = $2 AND post_id = $3",
            )
            .bind(vote_type)
            .bind(user_id)
            .bind(post_id)
            .execute(&mut *tx)
            .await
            .map_err(map_vote_write_error)?;

            delta
        }
    };

    // A missing post means zero rows here; the dropped transaction rolls the
    // vote row back with it.
    let score: i32 =
        sqlx::query_scalar("UPDATE posts SET score = score + $1 WHERE id = $2 RETURNING score")
            .bind(delta as i32)
            .bind(post_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(map_vote_write_error)?
            .ok_or_else(|| AppError::NotFound("Post not found".to_string()))?;

    tx.commit().await?;

    Ok(VoteResponse {
        user_vote: Some(vote_type),
        score,
    })
}

// SQLSTATEs: 23505 unique_violation (two first votes raced), 40001
// serialization_failure, 40P01 deadlock_detected, 23503 foreign_key_violation.
fn map_vote_write_error(err: sqlx::Error) -> AppError {
    if let sqlx::Error::Database(db_err) = &err {
        match db_err.code().as_deref() {
            Some("23505") | Some("40001") | Some("40P01") => {
                return AppError::Conflict(
                    "Another vote on this post is in progress, retry".to_string(),
                );
            }
            Some("23503") => return AppError::NotFound("Post not found".to_string()),
            _ => {}
        }
    }

    AppError::Database(err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn first_vote_moves_score_by_the_vote() {
        assert_eq!(transition(None, 1), VoteTransition::FirstVote { delta: 1 });
        assert_eq!(
            transition(None, -1),
            VoteTransition::FirstVote { delta: -1 }
        );
    }

    #[test]
    fn revote_in_same_direction_is_a_noop() {
        assert_eq!(transition(Some(1), 1), VoteTransition::NoChange);
        assert_eq!(transition(Some(-1), -1), VoteTransition::NoChange);
    }

    #[test]
    fn reversal_moves_score_by_two() {
        assert_eq!(
            transition(Some(-1), 1),
            VoteTransition::Reversal { delta: 2 }
        );
        assert_eq!(
            transition(Some(1), -1),
            VoteTransition::Reversal { delta: -2 }
        );
    }

    #[test]
    fn score_tracks_vote_rows_through_any_intent_stream() {
        let intents: &[(u32, i16)] = &[
            (0, 1),
            (0, 1),
            (1, -1),
            (0, -1),
            (2, 1),
            (1, -1),
            (1, 1),
            (2, -1),
            (0, -1),
        ];

        let mut votes: HashMap<u32, i16> = HashMap::new();
        let mut score: i32 = 0;

        for &(user, desired) in intents {
            match transition(votes.get(&user).copied(), desired) {
                VoteTransition::NoChange => {}
                VoteTransition::FirstVote { delta } | VoteTransition::Reversal { delta } => {
                    votes.insert(user, desired);
                    score += delta as i32;
                }
            }

            let expected: i32 = votes.values().map(|v| *v as i32).sum();
            assert_eq!(score, expected);
        }
    }
}

//! Complexity cache keyed by `(bead_id, description_hash)`
//!
//! A new hash never overwrites the entry for an old one. Old entries stay
//! behind for audit and simply stop matching once the bead's text changes.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use super::store::{col_ts, now_ts, Store, StoreError};
use crate::domain::{ComplexityEstimate, ComplexityScore, DescriptionHash, TokenEstimate};

/// What a cache write did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheWrite {
    Inserted,
    Updated,
    Unchanged,
}

/// One cached estimate with its key
#[derive(Debug, Clone, PartialEq)]
pub struct CachedComplexity {
    pub bead_id: String,
    pub description_hash: DescriptionHash,
    pub estimate: ComplexityEstimate,
    pub estimated_at: DateTime<Utc>,
}

fn estimate_from_raw(score: i64, tokens: i64) -> rusqlite::Result<ComplexityEstimate> {
    let invalid = |e: crate::domain::ValidationError| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Integer, Box::new(e))
    };
    Ok(ComplexityEstimate {
        score: ComplexityScore::new(score).map_err(invalid)?,
        tokens: TokenEstimate::new(tokens).map_err(invalid)?,
    })
}

impl Store {
    /// Upserts an estimate for one bead text
    pub fn cache_complexity(
        &self,
        bead_id: &str,
        hash: &DescriptionHash,
        estimate: ComplexityEstimate,
    ) -> Result<CacheWrite, StoreError> {
        self.with_conn(|conn| {
            let existing: Option<(i64, i64)> = conn
                .query_row(
                    "SELECT score, tokens FROM complexity_cache
                     WHERE bead_id = ?1 AND description_hash = ?2",
                    params![bead_id, hash.as_str()],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            let score = estimate.score.value() as i64;
            let tokens = estimate.tokens.value() as i64;

            let write = match existing {
                Some((s, t)) if s == score && t == tokens => return Ok(CacheWrite::Unchanged),
                Some(_) => CacheWrite::Updated,
                None => CacheWrite::Inserted,
            };

            conn.execute(
                "INSERT INTO complexity_cache (bead_id, description_hash, score, tokens, estimated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (bead_id, description_hash)
                 DO UPDATE SET score = excluded.score, tokens = excluded.tokens,
                               estimated_at = excluded.estimated_at",
                params![bead_id, hash.as_str(), score, tokens, now_ts()],
            )?;
            Ok(write)
        })
    }

    /// Returns the estimate for exactly this bead text, if one was cached
    pub fn get_cached_complexity(
        &self,
        bead_id: &str,
        hash: &DescriptionHash,
    ) -> Result<Option<ComplexityEstimate>, StoreError> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT score, tokens FROM complexity_cache
                     WHERE bead_id = ?1 AND description_hash = ?2",
                    params![bead_id, hash.as_str()],
                    |row| estimate_from_raw(row.get(0)?, row.get(1)?),
                )
                .optional()?)
        })
    }

    /// Every estimate ever cached for a bead, newest first
    pub fn complexity_history(&self, bead_id: &str) -> Result<Vec<CachedComplexity>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT bead_id, description_hash, score, tokens, estimated_at
                 FROM complexity_cache WHERE bead_id = ?1
                 ORDER BY estimated_at DESC",
            )?;
            let entries = stmt
                .query_map([bead_id], |row| {
                    Ok(CachedComplexity {
                        bead_id: row.get(0)?,
                        description_hash: DescriptionHash::from_stored(row.get(1)?),
                        estimate: estimate_from_raw(row.get(2)?, row.get(3)?)?,
                        estimated_at: col_ts(row, 4)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(entries)
        })
    }
}

//! Reads and transactional writes backing the transform pipeline.
//!
//! The `(email -> chunk-set)` relationship is an atomic replacement: derived
//! columns, chunk deletion and chunk inserts for one email always travel in
//! the same transaction.

use std::collections::HashMap;

use sqlx::{PgPool, Postgres, QueryBuilder, Transaction};

use crate::models::{DerivedRecord, EmailRow};
use crate::transform::pipeline::TransformOptions;

/// Ids of emails eligible for transformation, in primary-key order.
///
/// Skips deleted rows and rows without a raw body. Without `force` (and
/// without a single explicit email id) rows that already completed are
/// excluded, so re-runs only pick up new or previously failed emails.
pub async fn select_email_ids(
    pool: &PgPool,
    opts: &TransformOptions,
) -> Result<Vec<i64>, sqlx::Error> {
    let mut builder = QueryBuilder::<Postgres>::new(
        "SELECT id FROM emails WHERE deleted_at IS NULL AND body_text IS NOT NULL",
    );

    if let Some(email_id) = opts.email_id {
        builder.push(" AND id = ");
        builder.push_bind(email_id);
    }
    if let Some(account_id) = opts.account_id {
        builder.push(" AND account_id = ");
        builder.push_bind(account_id);
    }
    if !opts.force && opts.email_id.is_none() {
        builder.push(" AND transform_completed_at IS NULL");
    }
    builder.push(" ORDER BY id");
    if let Some(limit) = opts.limit {
        if opts.email_id.is_none() {
            builder.push(" LIMIT ");
            builder.push_bind(limit);
        }
    }

    builder.build_query_scalar::<i64>().fetch_all(pool).await
}

/// Load the raw rows for one batch, in id order.
pub async fn load_batch(pool: &PgPool, ids: &[i64]) -> Result<Vec<EmailRow>, sqlx::Error> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    sqlx::query_as::<_, EmailRow>(
        r#"
        SELECT id, account_id, subject, from_email, from_name, snippet,
               labels, has_attachments, body_text
        FROM emails
        WHERE id = ANY($1) AND body_text IS NOT NULL
        ORDER BY id
        "#,
    )
    .bind(ids)
    .fetch_all(pool)
    .await
}

/// Label id -> human-readable name, per account.
pub async fn load_label_maps(
    pool: &PgPool,
    account_ids: &[i32],
) -> Result<HashMap<i32, HashMap<String, String>>, sqlx::Error> {
    let mut out: HashMap<i32, HashMap<String, String>> = account_ids
        .iter()
        .map(|account_id| (*account_id, HashMap::new()))
        .collect();
    if account_ids.is_empty() {
        return Ok(out);
    }

    let rows: Vec<(i32, String, String)> = sqlx::query_as(
        "SELECT account_id, label_id, label_name FROM account_labels WHERE account_id = ANY($1)",
    )
    .bind(account_ids)
    .fetch_all(pool)
    .await?;

    for (account_id, label_id, label_name) in rows {
        out.entry(account_id).or_default().insert(label_id, label_name);
    }
    Ok(out)
}

/// Write one email's derived state: update the parent row, then replace its
/// chunk set.
pub async fn write_derived(
    tx: &mut Transaction<'_, Postgres>,
    record: &DerivedRecord,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE emails
        SET privacy_tier = $2,
            body_redacted = $3,
            snippet_redacted = $4,
            subject_embedding = $5,
            body_embedding = $6,
            body_pooled_embedding = $7,
            transform_completed_at = $8
        WHERE id = $1
        "#,
    )
    .bind(record.email_id)
    .bind(record.privacy_tier.code())
    .bind(&record.body_redacted)
    .bind(&record.snippet_redacted)
    .bind(&record.subject_embedding)
    .bind(&record.body_embedding)
    .bind(&record.body_pooled_embedding)
    .bind(record.transform_completed_at)
    .execute(&mut **tx)
    .await?;

    sqlx::query("DELETE FROM email_chunks WHERE email_id = $1")
        .bind(record.email_id)
        .execute(&mut **tx)
        .await?;

    for chunk in &record.chunks {
        sqlx::query(
            r#"
            INSERT INTO email_chunks (email_id, chunk_text, chunk_position, chunk_weight, chunk_embedding)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(record.email_id)
        .bind(&chunk.text)
        .bind(chunk.position)
        .bind(chunk.weight)
        .bind(&chunk.embedding)
        .execute(&mut **tx)
        .await?;
    }

    Ok(())
}

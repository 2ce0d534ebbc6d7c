//! [`QueueStore`] over the `queue_items` table.
//!
//! Pop is a single `DELETE ... RETURNING` over a `FOR UPDATE SKIP LOCKED`
//! subselect, so concurrent poppers never receive the same row.

use async_trait::async_trait;

use crate::error::Result;
use crate::store::{End, PushOp, QueueStore};
use crate::telemetry::metrics;

const PUSH_TAIL: &str = "INSERT INTO queue_items (queue, position, payload)
     VALUES ($1, nextval('queue_item_position'), $2)";

const PUSH_HEAD: &str = "INSERT INTO queue_items (queue, position, payload)
     VALUES ($1, -nextval('queue_item_position'), $2)";

const POP: &str = "DELETE FROM queue_items
     WHERE id = (
         SELECT id FROM queue_items
         WHERE queue = $1
         ORDER BY position
         LIMIT 1
         FOR UPDATE SKIP LOCKED
     )
     RETURNING payload";

// Positions are drawn in batch order; ORDER BY runs before the volatile
// nextval() calls in the select list.
const PUSH_BATCH: &str = "INSERT INTO queue_items (queue, position, payload)
     SELECT q,
            CASE WHEN h THEN -nextval('queue_item_position')
                 ELSE nextval('queue_item_position') END,
            p
     FROM UNNEST($1::text[], $2::bool[], $3::bytea[]) WITH ORDINALITY AS t(q, h, p, ord)
     ORDER BY ord";

#[async_trait]
impl QueueStore for super::Db {
    async fn push(&self, queue: &str, item: Vec<u8>, end: End) -> Result<()> {
        let sql = match end {
            End::Head => PUSH_HEAD,
            End::Tail => PUSH_TAIL,
        };
        sqlx::query(sql)
            .bind(queue)
            .bind(item)
            .execute(&self.pool)
            .await?;
        metrics::record_queue_op(queue, "push");
        Ok(())
    }

    async fn pop(&self, queue: &str) -> Result<Option<Vec<u8>>> {
        let item: Option<Vec<u8>> = sqlx::query_scalar(POP)
            .bind(queue)
            .fetch_optional(&self.pool)
            .await?;
        metrics::record_queue_op(queue, if item.is_some() { "pop" } else { "pop_empty" });
        Ok(item)
    }

    async fn len(&self, queue: &str) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM queue_items WHERE queue = $1")
            .bind(queue)
            .fetch_one(&self.pool)
            .await?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    /// One round trip for the whole batch. The insert is all-or-nothing,
    /// so a store failure fails the batch rather than skipping items.
    async fn push_batch(&self, ops: Vec<PushOp>) -> Result<usize> {
        if ops.is_empty() {
            return Ok(0);
        }

        let mut queues = Vec::with_capacity(ops.len());
        let mut heads = Vec::with_capacity(ops.len());
        let mut items = Vec::with_capacity(ops.len());
        for op in ops {
            queues.push(op.queue);
            heads.push(op.end == End::Head);
            items.push(op.item);
        }

        let inserted = sqlx::query(PUSH_BATCH)
            .bind(&queues)
            .bind(&heads)
            .bind(&items)
            .execute(&self.pool)
            .await?
            .rows_affected();

        for queue in &queues {
            metrics::record_queue_op(queue, "push_batch");
        }
        Ok(usize::try_from(inserted).unwrap_or(usize::MAX))
    }
}

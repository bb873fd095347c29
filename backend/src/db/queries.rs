//! # Database Queries
//!
//! SQL for every table of the core. Each function runs on the connection
//! that owns the current unit of work, so all of them participate in the
//! surrounding `BEGIN ... COMMIT`.
//!
//! ## Query Organization
//!
//! Queries are grouped by the table they operate on. Writes are upserts
//! keyed by `id` (`INSERT ... ON CONFLICT (id) DO UPDATE`), which keeps the
//! storage seam down to one write per entity.
//!
//! Wallet reads use `FOR UPDATE` so a read-modify-write of a balance holds
//! the row lock until the unit of work ends.

use chrono::{DateTime, NaiveDate, NaiveTime, Utc, Weekday};
use tokio_postgres::{Client, Row};
use tracing::debug;

use super::models::*;
use super::{classify, DatabaseError};

// ============================================
// HELPER FUNCTIONS
// ============================================

fn weekday_to_db(day: Weekday) -> i16 {
    day.num_days_from_monday() as i16
}

fn weekday_from_db(value: i16) -> Result<Weekday, DatabaseError> {
    match value {
        0 => Ok(Weekday::Mon),
        1 => Ok(Weekday::Tue),
        2 => Ok(Weekday::Wed),
        3 => Ok(Weekday::Thu),
        4 => Ok(Weekday::Fri),
        5 => Ok(Weekday::Sat),
        6 => Ok(Weekday::Sun),
        other => Err(DatabaseError::Decode(format!("day_of_week {}", other))),
    }
}

fn rules_to_db(rules: &[RecurringRule]) -> Result<serde_json::Value, DatabaseError> {
    serde_json::to_value(rules).map_err(|e| DatabaseError::Decode(e.to_string()))
}

fn rules_from_db(row: &Row) -> Result<Vec<RecurringRule>, DatabaseError> {
    let value: serde_json::Value = row.get("rules");
    serde_json::from_value(value).map_err(|e| DatabaseError::Decode(e.to_string()))
}

fn parse<T: std::str::FromStr<Err = UnknownVariant>>(row: &Row, column: &str) -> Result<T, DatabaseError> {
    let text: String = row.get(column);
    Ok(text.parse()?)
}

fn parse_opt<T: std::str::FromStr<Err = UnknownVariant>>(
    row: &Row,
    column: &str,
) -> Result<Option<T>, DatabaseError> {
    let text: Option<String> = row.get(column);
    match text {
        Some(text) => Ok(Some(text.parse()?)),
        None => Ok(None),
    }
}

fn collect<T>(rows: Vec<Row>, map: fn(&Row) -> Result<T, DatabaseError>) -> Result<Vec<T>, DatabaseError> {
    rows.iter().map(map).collect()
}

fn row_to_wallet(row: &Row) -> Result<Wallet, DatabaseError> {
    Ok(Wallet {
        id: row.get("id"),
        user_id: row.get("user_id"),
        balance: row.get("balance"),
        is_frozen: row.get("is_frozen"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn row_to_transaction(row: &Row) -> Result<LedgerTransaction, DatabaseError> {
    Ok(LedgerTransaction {
        id: row.get("id"),
        wallet_id: row.get("wallet_id"),
        transaction_type: parse(row, "transaction_type")?,
        amount: row.get("amount"),
        status: parse(row, "status")?,
        reference_id: row.get("reference_id"),
        note: row.get("note"),
        created_at: row.get("created_at"),
        completed_at: row.get("completed_at"),
    })
}

fn row_to_escrow(row: &Row) -> Result<Escrow, DatabaseError> {
    Ok(Escrow {
        id: row.get("id"),
        class_id: row.get("class_id"),
        student_id: row.get("student_id"),
        tutor_id: row.get("tutor_id"),
        amount: row.get("amount"),
        commission_rate_bps: row.get("commission_rate_bps"),
        commission_amount: row.get("commission_amount"),
        net_amount: row.get("net_amount"),
        refunded_amount: row.get("refunded_amount"),
        status: parse(row, "status")?,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        settled_at: row.get("settled_at"),
    })
}

fn row_to_commission_config(row: &Row) -> Result<CommissionConfig, DatabaseError> {
    Ok(CommissionConfig {
        id: row.get("id"),
        one_to_one_online_bps: row.get("one_to_one_online_bps"),
        one_to_one_offline_bps: row.get("one_to_one_offline_bps"),
        group_online_bps: row.get("group_online_bps"),
        group_offline_bps: row.get("group_offline_bps"),
        is_active: row.get("is_active"),
        created_at: row.get("created_at"),
    })
}

fn row_to_class_request(row: &Row) -> Result<ClassRequest, DatabaseError> {
    Ok(ClassRequest {
        id: row.get("id"),
        student_id: row.get("student_id"),
        tutor_id: row.get("tutor_id"),
        title: row.get("title"),
        mode: parse(row, "mode")?,
        budget: row.get("budget"),
        rules: rules_from_db(row)?,
        start_date: row.get::<_, NaiveDate>("start_date"),
        status: parse(row, "status")?,
        expires_at: row.get("expires_at"),
        class_id: row.get("class_id"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn row_to_application(row: &Row) -> Result<TutorApplication, DatabaseError> {
    Ok(TutorApplication {
        id: row.get("id"),
        request_id: row.get("request_id"),
        tutor_id: row.get("tutor_id"),
        proposed_price: row.get("proposed_price"),
        message: row.get("message"),
        status: parse(row, "status")?,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn row_to_class(row: &Row) -> Result<Class, DatabaseError> {
    Ok(Class {
        id: row.get("id"),
        tutor_id: row.get("tutor_id"),
        request_id: row.get("request_id"),
        title: row.get("title"),
        mode: parse(row, "mode")?,
        price: row.get("price"),
        student_limit: row.get("student_limit"),
        current_student_count: row.get("current_student_count"),
        rules: rules_from_db(row)?,
        start_date: row.get("start_date"),
        status: parse(row, "status")?,
        cancellation_reason: parse_opt(row, "cancellation_reason")?,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn row_to_assign(row: &Row) -> Result<ClassAssign, DatabaseError> {
    Ok(ClassAssign {
        id: row.get("id"),
        class_id: row.get("class_id"),
        student_id: row.get("student_id"),
        approval_status: parse(row, "approval_status")?,
        payment_status: parse(row, "payment_status")?,
        escrow_id: row.get("escrow_id"),
        payment_waived: row.get("payment_waived"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn row_to_lesson(row: &Row) -> Result<Lesson, DatabaseError> {
    Ok(Lesson {
        id: row.get("id"),
        class_id: row.get("class_id"),
        schedule_entry_id: row.get("schedule_entry_id"),
        sequence: row.get("sequence"),
        status: parse(row, "status")?,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn row_to_entry(row: &Row) -> Result<ScheduleEntry, DatabaseError> {
    let entry_type: String = row.get("entry_type");
    let kind = match entry_type.as_str() {
        "lesson" => EntryKind::Lesson {
            lesson_id: row
                .get::<_, Option<String>>("lesson_id")
                .ok_or_else(|| DatabaseError::Decode("lesson entry without lesson_id".into()))?,
        },
        "block" => EntryKind::Block {
            block_id: row
                .get::<_, Option<String>>("block_id")
                .ok_or_else(|| DatabaseError::Decode("block entry without block_id".into()))?,
        },
        other => return Err(DatabaseError::Decode(format!("entry_type {}", other))),
    };
    Ok(ScheduleEntry {
        id: row.get("id"),
        tutor_id: row.get("tutor_id"),
        start: row.get("start_at"),
        end: row.get("end_at"),
        kind,
        is_deleted: row.get("is_deleted"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn row_to_reschedule(row: &Row) -> Result<RescheduleRequest, DatabaseError> {
    Ok(RescheduleRequest {
        id: row.get("id"),
        lesson_id: row.get("lesson_id"),
        requester_id: row.get("requester_id"),
        responder_id: row.get("responder_id"),
        old_start: row.get("old_start"),
        old_end: row.get("old_end"),
        new_start: row.get("new_start"),
        new_end: row.get("new_end"),
        reason: row.get("reason"),
        status: parse(row, "status")?,
        created_at: row.get("created_at"),
        responded_at: row.get("responded_at"),
    })
}

fn row_to_block(row: &Row) -> Result<AvailabilityBlock, DatabaseError> {
    Ok(AvailabilityBlock {
        id: row.get("id"),
        tutor_id: row.get("tutor_id"),
        day_of_week: weekday_from_db(row.get("day_of_week"))?,
        start_time: row.get::<_, NaiveTime>("start_time"),
        end_time: row.get::<_, NaiveTime>("end_time"),
        kind: parse(row, "kind")?,
        created_at: row.get("created_at"),
    })
}

// ============================================
// WALLET QUERIES
// ============================================

/// Get a user's wallet, locking the row for the rest of the unit of work.
pub async fn get_wallet_by_user(client: &Client, user_id: &str) -> Result<Option<Wallet>, DatabaseError> {
    debug!("Fetching wallet for user: {}", user_id);
    let rows = client
        .query("SELECT * FROM wallets WHERE user_id = $1 FOR UPDATE", &[&user_id])
        .await?;
    rows.first().map(row_to_wallet).transpose()
}

/// Get a wallet by id, locking the row.
pub async fn get_wallet(client: &Client, id: &str) -> Result<Option<Wallet>, DatabaseError> {
    let rows = client
        .query("SELECT * FROM wallets WHERE id = $1 FOR UPDATE", &[&id])
        .await?;
    rows.first().map(row_to_wallet).transpose()
}

/// Every wallet, oldest first. Read without row locks.
pub async fn get_all_wallets(client: &Client) -> Result<Vec<Wallet>, DatabaseError> {
    let rows = client
        .query("SELECT * FROM wallets ORDER BY created_at ASC", &[])
        .await?;
    rows.iter().map(row_to_wallet).collect()
}

pub async fn upsert_wallet(client: &Client, wallet: &Wallet) -> Result<(), DatabaseError> {
    client
        .execute(
            r#"
            INSERT INTO wallets (id, user_id, balance, is_frozen, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO UPDATE SET
                balance = EXCLUDED.balance,
                is_frozen = EXCLUDED.is_frozen,
                updated_at = EXCLUDED.updated_at
            "#,
            &[
                &wallet.id,
                &wallet.user_id,
                &wallet.balance,
                &wallet.is_frozen,
                &wallet.created_at,
                &wallet.updated_at,
            ],
        )
        .await
        .map_err(classify)?;
    Ok(())
}

// ============================================
// TRANSACTION QUERIES
// ============================================

pub async fn get_transaction(client: &Client, id: &str) -> Result<Option<LedgerTransaction>, DatabaseError> {
    let rows = client.query("SELECT * FROM transactions WHERE id = $1", &[&id]).await?;
    rows.first().map(row_to_transaction).transpose()
}

pub async fn get_wallet_transactions(
    client: &Client,
    wallet_id: &str,
) -> Result<Vec<LedgerTransaction>, DatabaseError> {
    let rows = client
        .query(
            "SELECT * FROM transactions WHERE wallet_id = $1 ORDER BY created_at ASC, id ASC",
            &[&wallet_id],
        )
        .await?;
    collect(rows, row_to_transaction)
}

/// Record a transaction. Only `status` and `completed_at` may change later.
pub async fn upsert_transaction(client: &Client, tx: &LedgerTransaction) -> Result<(), DatabaseError> {
    debug!("Recording {} of {} on wallet {}", tx.transaction_type, tx.amount, tx.wallet_id);
    client
        .execute(
            r#"
            INSERT INTO transactions (
                id, wallet_id, transaction_type, amount, status,
                reference_id, note, created_at, completed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (id) DO UPDATE SET
                status = EXCLUDED.status,
                completed_at = EXCLUDED.completed_at
            "#,
            &[
                &tx.id,
                &tx.wallet_id,
                &tx.transaction_type.as_str(),
                &tx.amount,
                &tx.status.as_str(),
                &tx.reference_id,
                &tx.note,
                &tx.created_at,
                &tx.completed_at,
            ],
        )
        .await
        .map_err(classify)?;
    Ok(())
}

// ============================================
// ESCROW QUERIES
// ============================================

pub async fn get_escrow(client: &Client, id: &str) -> Result<Option<Escrow>, DatabaseError> {
    let rows = client.query("SELECT * FROM escrows WHERE id = $1", &[&id]).await?;
    rows.first().map(row_to_escrow).transpose()
}

pub async fn get_class_escrows(client: &Client, class_id: &str) -> Result<Vec<Escrow>, DatabaseError> {
    let rows = client
        .query("SELECT * FROM escrows WHERE class_id = $1 ORDER BY created_at ASC", &[&class_id])
        .await?;
    collect(rows, row_to_escrow)
}

pub async fn upsert_escrow(client: &Client, escrow: &Escrow) -> Result<(), DatabaseError> {
    client
        .execute(
            r#"
            INSERT INTO escrows (
                id, class_id, student_id, tutor_id, amount,
                commission_rate_bps, commission_amount, net_amount, refunded_amount,
                status, created_at, updated_at, settled_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (id) DO UPDATE SET
                refunded_amount = EXCLUDED.refunded_amount,
                status = EXCLUDED.status,
                updated_at = EXCLUDED.updated_at,
                settled_at = EXCLUDED.settled_at
            "#,
            &[
                &escrow.id,
                &escrow.class_id,
                &escrow.student_id,
                &escrow.tutor_id,
                &escrow.amount,
                &escrow.commission_rate_bps,
                &escrow.commission_amount,
                &escrow.net_amount,
                &escrow.refunded_amount,
                &escrow.status.as_str(),
                &escrow.created_at,
                &escrow.updated_at,
                &escrow.settled_at,
            ],
        )
        .await
        .map_err(classify)?;
    Ok(())
}

// ============================================
// COMMISSION QUERIES
// ============================================

pub async fn get_active_commission_config(client: &Client) -> Result<Option<CommissionConfig>, DatabaseError> {
    let rows = client
        .query("SELECT * FROM commission_configs WHERE is_active LIMIT 1", &[])
        .await?;
    rows.first().map(row_to_commission_config).transpose()
}

pub async fn insert_commission_config(client: &Client, config: &CommissionConfig) -> Result<(), DatabaseError> {
    if config.is_active {
        client
            .execute("UPDATE commission_configs SET is_active = FALSE WHERE is_active", &[])
            .await?;
    }
    client
        .execute(
            r#"
            INSERT INTO commission_configs (
                id, one_to_one_online_bps, one_to_one_offline_bps,
                group_online_bps, group_offline_bps, is_active, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
            &[
                &config.id,
                &config.one_to_one_online_bps,
                &config.one_to_one_offline_bps,
                &config.group_online_bps,
                &config.group_offline_bps,
                &config.is_active,
                &config.created_at,
            ],
        )
        .await
        .map_err(classify)?;
    Ok(())
}

// ============================================
// CLASS REQUEST QUERIES
// ============================================

pub async fn get_class_request(client: &Client, id: &str) -> Result<Option<ClassRequest>, DatabaseError> {
    let rows = client.query("SELECT * FROM class_requests WHERE id = $1", &[&id]).await?;
    rows.first().map(row_to_class_request).transpose()
}

pub async fn get_expirable_requests(
    client: &Client,
    now: DateTime<Utc>,
) -> Result<Vec<ClassRequest>, DatabaseError> {
    let rows = client
        .query(
            r#"
            SELECT * FROM class_requests
            WHERE status = 'pending' AND expires_at <= $1
            ORDER BY expires_at ASC
            "#,
            &[&now],
        )
        .await?;
    collect(rows, row_to_class_request)
}

pub async fn upsert_class_request(client: &Client, request: &ClassRequest) -> Result<(), DatabaseError> {
    client
        .execute(
            r#"
            INSERT INTO class_requests (
                id, student_id, tutor_id, title, mode, budget, rules, start_date,
                status, expires_at, class_id, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (id) DO UPDATE SET
                status = EXCLUDED.status,
                class_id = EXCLUDED.class_id,
                updated_at = EXCLUDED.updated_at
            "#,
            &[
                &request.id,
                &request.student_id,
                &request.tutor_id,
                &request.title,
                &request.mode.as_str(),
                &request.budget,
                &rules_to_db(&request.rules)?,
                &request.start_date,
                &request.status.as_str(),
                &request.expires_at,
                &request.class_id,
                &request.created_at,
                &request.updated_at,
            ],
        )
        .await
        .map_err(classify)?;
    Ok(())
}

// ============================================
// APPLICATION QUERIES
// ============================================

pub async fn get_application(client: &Client, id: &str) -> Result<Option<TutorApplication>, DatabaseError> {
    let rows = client.query("SELECT * FROM tutor_applications WHERE id = $1", &[&id]).await?;
    rows.first().map(row_to_application).transpose()
}

pub async fn get_request_applications(
    client: &Client,
    request_id: &str,
) -> Result<Vec<TutorApplication>, DatabaseError> {
    let rows = client
        .query(
            "SELECT * FROM tutor_applications WHERE request_id = $1 ORDER BY created_at ASC",
            &[&request_id],
        )
        .await?;
    collect(rows, row_to_application)
}

pub async fn upsert_application(client: &Client, application: &TutorApplication) -> Result<(), DatabaseError> {
    client
        .execute(
            r#"
            INSERT INTO tutor_applications (
                id, request_id, tutor_id, proposed_price, message, status, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO UPDATE SET
                status = EXCLUDED.status,
                updated_at = EXCLUDED.updated_at
            "#,
            &[
                &application.id,
                &application.request_id,
                &application.tutor_id,
                &application.proposed_price,
                &application.message,
                &application.status.as_str(),
                &application.created_at,
                &application.updated_at,
            ],
        )
        .await
        .map_err(classify)?;
    Ok(())
}

// ============================================
// CLASS QUERIES
// ============================================

pub async fn get_class(client: &Client, id: &str) -> Result<Option<Class>, DatabaseError> {
    let rows = client.query("SELECT * FROM classes WHERE id = $1", &[&id]).await?;
    rows.first().map(row_to_class).transpose()
}

pub async fn get_classes_in_progress(client: &Client) -> Result<Vec<Class>, DatabaseError> {
    let rows = client
        .query(
            "SELECT * FROM classes WHERE status IN ('active', 'ongoing') ORDER BY created_at ASC",
            &[],
        )
        .await?;
    collect(rows, row_to_class)
}

pub async fn upsert_class(client: &Client, class: &Class) -> Result<(), DatabaseError> {
    client
        .execute(
            r#"
            INSERT INTO classes (
                id, tutor_id, request_id, title, mode, price, student_limit,
                current_student_count, rules, start_date, status, cancellation_reason,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (id) DO UPDATE SET
                current_student_count = EXCLUDED.current_student_count,
                status = EXCLUDED.status,
                cancellation_reason = EXCLUDED.cancellation_reason,
                updated_at = EXCLUDED.updated_at
            "#,
            &[
                &class.id,
                &class.tutor_id,
                &class.request_id,
                &class.title,
                &class.mode.as_str(),
                &class.price,
                &class.student_limit,
                &class.current_student_count,
                &rules_to_db(&class.rules)?,
                &class.start_date,
                &class.status.as_str(),
                &class.cancellation_reason.map(|r| r.as_str()),
                &class.created_at,
                &class.updated_at,
            ],
        )
        .await
        .map_err(classify)?;
    Ok(())
}

// ============================================
// ENROLLMENT QUERIES
// ============================================

pub async fn get_class_assign(
    client: &Client,
    class_id: &str,
    student_id: &str,
) -> Result<Option<ClassAssign>, DatabaseError> {
    let rows = client
        .query(
            "SELECT * FROM class_assigns WHERE class_id = $1 AND student_id = $2",
            &[&class_id, &student_id],
        )
        .await?;
    rows.first().map(row_to_assign).transpose()
}

pub async fn get_class_assigns(client: &Client, class_id: &str) -> Result<Vec<ClassAssign>, DatabaseError> {
    let rows = client
        .query(
            "SELECT * FROM class_assigns WHERE class_id = $1 ORDER BY created_at ASC",
            &[&class_id],
        )
        .await?;
    collect(rows, row_to_assign)
}

pub async fn upsert_class_assign(client: &Client, assign: &ClassAssign) -> Result<(), DatabaseError> {
    client
        .execute(
            r#"
            INSERT INTO class_assigns (
                id, class_id, student_id, approval_status, payment_status,
                escrow_id, payment_waived, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (id) DO UPDATE SET
                approval_status = EXCLUDED.approval_status,
                payment_status = EXCLUDED.payment_status,
                escrow_id = EXCLUDED.escrow_id,
                payment_waived = EXCLUDED.payment_waived,
                updated_at = EXCLUDED.updated_at
            "#,
            &[
                &assign.id,
                &assign.class_id,
                &assign.student_id,
                &assign.approval_status.as_str(),
                &assign.payment_status.as_str(),
                &assign.escrow_id,
                &assign.payment_waived,
                &assign.created_at,
                &assign.updated_at,
            ],
        )
        .await
        .map_err(classify)?;
    Ok(())
}

// ============================================
// LESSON QUERIES
// ============================================

pub async fn get_lesson(client: &Client, id: &str) -> Result<Option<Lesson>, DatabaseError> {
    let rows = client.query("SELECT * FROM lessons WHERE id = $1", &[&id]).await?;
    rows.first().map(row_to_lesson).transpose()
}

pub async fn get_class_lessons(client: &Client, class_id: &str) -> Result<Vec<Lesson>, DatabaseError> {
    let rows = client
        .query(
            "SELECT * FROM lessons WHERE class_id = $1 ORDER BY sequence ASC",
            &[&class_id],
        )
        .await?;
    collect(rows, row_to_lesson)
}

pub async fn upsert_lesson(client: &Client, lesson: &Lesson) -> Result<(), DatabaseError> {
    client
        .execute(
            r#"
            INSERT INTO lessons (id, class_id, schedule_entry_id, sequence, status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO UPDATE SET
                status = EXCLUDED.status,
                updated_at = EXCLUDED.updated_at
            "#,
            &[
                &lesson.id,
                &lesson.class_id,
                &lesson.schedule_entry_id,
                &lesson.sequence,
                &lesson.status.as_str(),
                &lesson.created_at,
                &lesson.updated_at,
            ],
        )
        .await
        .map_err(classify)?;
    Ok(())
}

// ============================================
// SCHEDULE ENTRY QUERIES
// ============================================

pub async fn get_schedule_entry(client: &Client, id: &str) -> Result<Option<ScheduleEntry>, DatabaseError> {
    let rows = client.query("SELECT * FROM schedule_entries WHERE id = $1", &[&id]).await?;
    rows.first().map(row_to_entry).transpose()
}

/// Non-deleted entries of a tutor overlapping the half-open window.
pub async fn get_tutor_entries(
    client: &Client,
    tutor_id: &str,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Result<Vec<ScheduleEntry>, DatabaseError> {
    let rows = client
        .query(
            r#"
            SELECT * FROM schedule_entries
            WHERE tutor_id = $1 AND NOT is_deleted
              AND start_at < $3 AND end_at > $2
            ORDER BY start_at ASC
            "#,
            &[&tutor_id, &from, &to],
        )
        .await?;
    collect(rows, row_to_entry)
}

pub async fn get_block_entries(client: &Client, block_id: &str) -> Result<Vec<ScheduleEntry>, DatabaseError> {
    let rows = client
        .query(
            r#"
            SELECT * FROM schedule_entries
            WHERE entry_type = 'block' AND block_id = $1 AND NOT is_deleted
            ORDER BY start_at ASC
            "#,
            &[&block_id],
        )
        .await?;
    collect(rows, row_to_entry)
}

pub async fn upsert_schedule_entry(client: &Client, entry: &ScheduleEntry) -> Result<(), DatabaseError> {
    let (lesson_id, block_id) = match &entry.kind {
        EntryKind::Lesson { lesson_id } => (Some(lesson_id.as_str()), None),
        EntryKind::Block { block_id } => (None, Some(block_id.as_str())),
    };
    client
        .execute(
            r#"
            INSERT INTO schedule_entries (
                id, tutor_id, start_at, end_at, entry_type, lesson_id, block_id,
                is_deleted, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (id) DO UPDATE SET
                start_at = EXCLUDED.start_at,
                end_at = EXCLUDED.end_at,
                is_deleted = EXCLUDED.is_deleted,
                updated_at = EXCLUDED.updated_at
            "#,
            &[
                &entry.id,
                &entry.tutor_id,
                &entry.start,
                &entry.end,
                &entry.kind.type_name(),
                &lesson_id,
                &block_id,
                &entry.is_deleted,
                &entry.created_at,
                &entry.updated_at,
            ],
        )
        .await
        .map_err(classify)?;
    Ok(())
}

// ============================================
// RESCHEDULE QUERIES
// ============================================

pub async fn get_reschedule_request(
    client: &Client,
    id: &str,
) -> Result<Option<RescheduleRequest>, DatabaseError> {
    let rows = client.query("SELECT * FROM reschedule_requests WHERE id = $1", &[&id]).await?;
    rows.first().map(row_to_reschedule).transpose()
}

pub async fn get_pending_reschedule(
    client: &Client,
    lesson_id: &str,
) -> Result<Option<RescheduleRequest>, DatabaseError> {
    let rows = client
        .query(
            "SELECT * FROM reschedule_requests WHERE lesson_id = $1 AND status = 'pending'",
            &[&lesson_id],
        )
        .await?;
    rows.first().map(row_to_reschedule).transpose()
}

pub async fn upsert_reschedule_request(
    client: &Client,
    request: &RescheduleRequest,
) -> Result<(), DatabaseError> {
    client
        .execute(
            r#"
            INSERT INTO reschedule_requests (
                id, lesson_id, requester_id, responder_id, old_start, old_end,
                new_start, new_end, reason, status, created_at, responded_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (id) DO UPDATE SET
                status = EXCLUDED.status,
                responded_at = EXCLUDED.responded_at
            "#,
            &[
                &request.id,
                &request.lesson_id,
                &request.requester_id,
                &request.responder_id,
                &request.old_start,
                &request.old_end,
                &request.new_start,
                &request.new_end,
                &request.reason,
                &request.status.as_str(),
                &request.created_at,
                &request.responded_at,
            ],
        )
        .await
        .map_err(classify)?;
    Ok(())
}

// ============================================
// AVAILABILITY QUERIES
// ============================================

pub async fn get_availability_block(
    client: &Client,
    id: &str,
) -> Result<Option<AvailabilityBlock>, DatabaseError> {
    let rows = client.query("SELECT * FROM availability_blocks WHERE id = $1", &[&id]).await?;
    rows.first().map(row_to_block).transpose()
}

pub async fn get_tutor_availability(
    client: &Client,
    tutor_id: &str,
) -> Result<Vec<AvailabilityBlock>, DatabaseError> {
    let rows = client
        .query(
            "SELECT * FROM availability_blocks WHERE tutor_id = $1 ORDER BY created_at ASC",
            &[&tutor_id],
        )
        .await?;
    collect(rows, row_to_block)
}

pub async fn insert_availability_block(client: &Client, block: &AvailabilityBlock) -> Result<(), DatabaseError> {
    client
        .execute(
            r#"
            INSERT INTO availability_blocks (id, tutor_id, day_of_week, start_time, end_time, kind, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
            &[
                &block.id,
                &block.tutor_id,
                &weekday_to_db(block.day_of_week),
                &block.start_time,
                &block.end_time,
                &block.kind.as_str(),
                &block.created_at,
            ],
        )
        .await
        .map_err(classify)?;
    Ok(())
}

pub async fn delete_availability_block(client: &Client, id: &str) -> Result<(), DatabaseError> {
    let affected = client
        .execute("DELETE FROM availability_blocks WHERE id = $1", &[&id])
        .await?;
    if affected == 0 {
        return Err(DatabaseError::NotFound(format!("availability block {}", id)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_weekday_column_round_trip() {
        for day in [Weekday::Mon, Weekday::Wed, Weekday::Sun] {
            assert_eq!(weekday_from_db(weekday_to_db(day)).unwrap(), day);
        }
        assert!(weekday_from_db(7).is_err());
    }

    #[test]
    fn test_rules_serialize_as_json_array() {
        let rules = vec![RecurringRule {
            day_of_week: Weekday::Mon,
            start_time: NaiveTime::from_hms_opt(8, 0, 0).unwrap(),
            end_time: NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
        }];
        let value = rules_to_db(&rules).unwrap();
        assert_eq!(value[0]["startTime"], "08:00:00");
        let back: Vec<RecurringRule> = serde_json::from_value(value).unwrap();
        assert_eq!(back, rules);
    }
}

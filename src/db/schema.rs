//! Schema and server-side procedures for session-locked work distribution
//!
//! The session tables and procedures are task-agnostic and ship verbatim.
//! The task-side procedures depend on the embedder's task table, so they are
//! generated per table name; embedders whose tables use a different open-work
//! predicate adapt the generated text before installing it.

use anyhow::{Context, Result};
use sqlx::PgPool;

/// DDL for the `session` and `work_lock` tables.
///
/// `work_lock` holds exactly one row with `id = 1`; its exclusive row lock
/// serializes every rebalance across the cluster. The row is created at
/// install time and never modified.
pub const SESSION_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS session (
    id BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
    created TIMESTAMPTZ NOT NULL DEFAULT now(),
    expires TIMESTAMPTZ NOT NULL
);

CREATE TABLE IF NOT EXISTS work_lock (
    id BIGINT PRIMARY KEY,
    created TIMESTAMPTZ NOT NULL DEFAULT now()
);

INSERT INTO work_lock (id) VALUES (1) ON CONFLICT (id) DO NOTHING;
"#;

/// Session lifecycle procedures.
///
/// `bump_session` raises SQLSTATE `SL001` when the session is expired or
/// missing; a dead session can never be extended back to life. `end_session`
/// sets the `-infinity` sentinel and is idempotent.
pub const SESSION_PROCEDURES_SQL: &str = r#"
CREATE OR REPLACE FUNCTION start_session() RETURNS BIGINT AS $$
DECLARE
    new_id BIGINT;
BEGIN
    INSERT INTO session (expires)
    VALUES (now() + interval '2 minutes')
    RETURNING id INTO new_id;
    RETURN new_id;
END;
$$ LANGUAGE plpgsql;

CREATE OR REPLACE FUNCTION bump_session(p_session_id BIGINT) RETURNS VOID AS $$
BEGIN
    UPDATE session
    SET expires = now() + interval '2 minutes'
    WHERE id = p_session_id
      AND expires > now();
    IF NOT FOUND THEN
        RAISE EXCEPTION 'session % not found', p_session_id USING ERRCODE = 'SL001';
    END IF;
END;
$$ LANGUAGE plpgsql;

CREATE OR REPLACE FUNCTION end_session(p_session_id BIGINT) RETURNS VOID AS $$
BEGIN
    UPDATE session
    SET expires = '-infinity'
    WHERE id = p_session_id;
END;
$$ LANGUAGE plpgsql;
"#;

/// Generate the task-side procedures for an embedder task table.
///
/// The table must carry `id BIGINT`, a nullable `session_id BIGINT`
/// referencing `session.id`, and a `finished BOOLEAN` open-work flag.
/// `get_work` is the serialized rebalance: it locks the singleton `work_lock`
/// row, bumps the calling session, computes the ceiling share
/// `ceil(open / live_sessions)`, binds up to the deficit (capped by
/// `p_batch_size`) from unassigned or expired-session tasks in task-ID order,
/// and returns the rows bound to the session.
pub fn task_procedures_sql(task_table: &str) -> String {
    format!(
        r#"
CREATE OR REPLACE FUNCTION get_task_count() RETURNS BIGINT AS $$
    SELECT count(*) FROM {table} WHERE NOT finished;
$$ LANGUAGE sql;

CREATE OR REPLACE FUNCTION get_task_count_for_session(p_session_id BIGINT) RETURNS BIGINT AS $$
    SELECT count(*) FROM {table} WHERE session_id = p_session_id AND NOT finished;
$$ LANGUAGE sql;

CREATE OR REPLACE FUNCTION pickup_tasks_for_session(p_session_id BIGINT, p_limit BIGINT) RETURNS VOID AS $$
    UPDATE {table}
    SET session_id = p_session_id
    WHERE id IN (
        SELECT t.id
        FROM {table} t
        LEFT JOIN session s ON s.id = t.session_id
        WHERE NOT t.finished
          AND (t.session_id IS NULL OR s.id IS NULL OR s.expires <= now())
        ORDER BY t.id
        LIMIT greatest(p_limit, 0)
    );
$$ LANGUAGE sql;

CREATE OR REPLACE FUNCTION get_tasks_for_session(p_session_id BIGINT) RETURNS SETOF {table} AS $$
    SELECT * FROM {table}
    WHERE session_id = p_session_id AND NOT finished
    ORDER BY id;
$$ LANGUAGE sql;

CREATE OR REPLACE FUNCTION finish_tasks(p_task_ids BIGINT[]) RETURNS VOID AS $$
    UPDATE {table} SET finished = TRUE WHERE id = ANY(p_task_ids);
$$ LANGUAGE sql;

CREATE OR REPLACE FUNCTION get_work(p_session_id BIGINT, p_batch_size BIGINT) RETURNS SETOF {table} AS $$
DECLARE
    live_sessions BIGINT;
    open_tasks BIGINT;
    ideal BIGINT;
    current_load BIGINT;
BEGIN
    -- One rebalance at a time, cluster-wide.
    PERFORM 1 FROM work_lock WHERE id = 1 FOR UPDATE;

    -- Raises SL001 if this session is no longer live.
    PERFORM bump_session(p_session_id);

    SELECT count(*) INTO live_sessions FROM session WHERE expires > now();
    open_tasks := get_task_count();

    -- The bump above guarantees at least one live session.
    ideal := ceil(open_tasks::NUMERIC / live_sessions);
    current_load := get_task_count_for_session(p_session_id);

    IF current_load < ideal THEN
        PERFORM pickup_tasks_for_session(p_session_id, least(ideal - current_load, p_batch_size));
    END IF;

    RETURN QUERY SELECT * FROM get_tasks_for_session(p_session_id);
END;
$$ LANGUAGE plpgsql;
"#,
        table = task_table
    )
}

/// Install the session schema, the session procedures, and the task-side
/// procedures for `task_table` into the connected database.
pub async fn install_schema(pool: &PgPool, task_table: &str) -> Result<()> {
    sqlx::raw_sql(SESSION_SCHEMA_SQL)
        .execute(pool)
        .await
        .context("Failed to create session schema")?;

    sqlx::raw_sql(SESSION_PROCEDURES_SQL)
        .execute(pool)
        .await
        .context("Failed to install session procedures")?;

    sqlx::raw_sql(&task_procedures_sql(task_table))
        .execute(pool)
        .await
        .context("Failed to install task procedures")?;

    Ok(())
}

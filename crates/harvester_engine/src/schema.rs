//! SQLite schema, applied on every open. `CREATE ... IF NOT EXISTS` keeps it
//! idempotent; `user_version` marks the layout for later migrations.

pub const SCHEMA: &str = "
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS videos (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    code          TEXT    NOT NULL UNIQUE,
    title         TEXT    NOT NULL DEFAULT '',
    actors        TEXT    NOT NULL DEFAULT '',   -- comma-joined
    tags          TEXT    NOT NULL DEFAULT '',   -- comma-joined
    duration_secs INTEGER NOT NULL DEFAULT 0,
    cover_url     TEXT,
    preview_url   TEXT,
    detail_url    TEXT,
    delivered     INTEGER NOT NULL DEFAULT 0,    -- only ever 0 -> 1
    created_at    TEXT    NOT NULL,
    updated_at    TEXT    NOT NULL
);

CREATE INDEX IF NOT EXISTS videos_undelivered_idx ON videos(delivered, created_at);
CREATE INDEX IF NOT EXISTS videos_created_idx     ON videos(created_at);

CREATE TABLE IF NOT EXISTS subscriptions (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    destination      INTEGER NOT NULL,
    destination_kind TEXT    NOT NULL,
    rule             TEXT    NOT NULL,           -- 'ALL' | 'ACTOR' | 'TAG'
    keyword          TEXT    NOT NULL DEFAULT '',
    enabled          INTEGER NOT NULL DEFAULT 1,
    created_at       TEXT    NOT NULL,
    UNIQUE (destination, rule, keyword)
);

-- Append-only.
CREATE TABLE IF NOT EXISTS delivery_attempts (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    video_id       INTEGER NOT NULL REFERENCES videos(id),
    destination    INTEGER NOT NULL,
    outcome        TEXT    NOT NULL,             -- 'SUCCESS' | 'FAILED'
    failure_reason TEXT,
    delivered_at   TEXT    NOT NULL
);

CREATE INDEX IF NOT EXISTS attempts_pair_idx ON delivery_attempts(video_id, destination);

-- At most one success per (video, destination).
CREATE UNIQUE INDEX IF NOT EXISTS attempts_single_success_idx
    ON delivery_attempts(video_id, destination) WHERE outcome = 'SUCCESS';

PRAGMA user_version = 1;
";

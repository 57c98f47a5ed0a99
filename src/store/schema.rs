//! Database schema creation and teardown.
//!
//! All statements are idempotent (`IF [NOT] EXISTS`) so `db --init` can be
//! run repeatedly. `file.sha256` is unique per workspace via a partial
//! index: size-gated files carry no digest and may repeat; `path` has no
//! uniqueness constraint at all — one row per observation.

use rusqlite::Connection;

const CREATE_STATEMENTS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS workspace (
        id            INTEGER PRIMARY KEY,
        name          TEXT NOT NULL UNIQUE,
        creation_date TEXT NOT NULL DEFAULT (datetime('now'))
    )",
    "CREATE TABLE IF NOT EXISTS host (
        id            INTEGER PRIMARY KEY,
        workspace_id  INTEGER NOT NULL REFERENCES workspace(id) ON DELETE CASCADE,
        protocol      TEXT NOT NULL,
        address       TEXT NOT NULL,
        port          INTEGER NOT NULL DEFAULT 0,
        share         TEXT NOT NULL DEFAULT '',
        completed     INTEGER NOT NULL DEFAULT 0,
        creation_date TEXT NOT NULL DEFAULT (datetime('now')),
        UNIQUE(workspace_id, protocol, address, port, share)
    )",
    "CREATE TABLE IF NOT EXISTS match_rule (
        id              INTEGER PRIMARY KEY,
        search_location TEXT NOT NULL,
        search_pattern  TEXT NOT NULL,
        category        TEXT NOT NULL,
        relevance       TEXT NOT NULL,
        accuracy        TEXT NOT NULL,
        priority        INTEGER NOT NULL,
        creation_date   TEXT NOT NULL DEFAULT (datetime('now')),
        UNIQUE(search_location, search_pattern)
    )",
    "CREATE TABLE IF NOT EXISTS file (
        id            INTEGER PRIMARY KEY,
        workspace_id  INTEGER NOT NULL REFERENCES workspace(id) ON DELETE CASCADE,
        sha256        TEXT,
        size_bytes    INTEGER NOT NULL,
        content       BLOB,
        type_hint     TEXT,
        category      TEXT,
        match_rule_id INTEGER REFERENCES match_rule(id),
        review_result TEXT,
        comment       TEXT,
        creation_date TEXT NOT NULL DEFAULT (datetime('now'))
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_file_workspace_sha256
        ON file(workspace_id, sha256) WHERE sha256 IS NOT NULL",
    "CREATE TABLE IF NOT EXISTS path (
        id            INTEGER PRIMARY KEY,
        workspace_id  INTEGER NOT NULL REFERENCES workspace(id) ON DELETE CASCADE,
        host_id       INTEGER NOT NULL REFERENCES host(id) ON DELETE CASCADE,
        file_id       INTEGER NOT NULL REFERENCES file(id) ON DELETE CASCADE,
        full_path     TEXT NOT NULL,
        archive_chain TEXT NOT NULL DEFAULT '',
        match_rule_id INTEGER REFERENCES match_rule(id),
        access_time   TEXT,
        modified_time TEXT,
        creation_time TEXT,
        creation_date TEXT NOT NULL DEFAULT (datetime('now'))
    )",
    "CREATE INDEX IF NOT EXISTS idx_path_file_id ON path(file_id)",
    "CREATE INDEX IF NOT EXISTS idx_path_host_id ON path(host_id)",
    "CREATE TABLE IF NOT EXISTS review (
        id            INTEGER PRIMARY KEY,
        file_id       INTEGER NOT NULL REFERENCES file(id) ON DELETE CASCADE,
        verdict       TEXT NOT NULL,
        comment       TEXT,
        creation_date TEXT NOT NULL DEFAULT (datetime('now'))
    )",
];

const DROP_STATEMENTS: &[&str] = &[
    "DROP TABLE IF EXISTS review",
    "DROP TABLE IF EXISTS path",
    "DROP TABLE IF EXISTS file",
    "DROP TABLE IF EXISTS match_rule",
    "DROP TABLE IF EXISTS host",
    "DROP TABLE IF EXISTS workspace",
];

pub fn create_all(conn: &Connection) -> rusqlite::Result<()> {
    for statement in CREATE_STATEMENTS {
        conn.execute(statement, [])?;
    }
    Ok(())
}

pub fn drop_all(conn: &Connection) -> rusqlite::Result<()> {
    for statement in DROP_STATEMENTS {
        conn.execute(statement, [])?;
    }
    Ok(())
}

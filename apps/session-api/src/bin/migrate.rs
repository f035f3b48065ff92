//! Standalone migration runner for session-api.
//!
//! Usage:
//!   cargo run -p session-api --bin session-migrate
//!   cargo run -p session-api --bin session-migrate -- --test
//!
//! Reads DATABASE_URL from the environment (or .env via dotenvy).

use std::path::Path;
use std::process::ExitCode;

use diesel::pg::PgConnection;
use diesel::Connection;
use diesel_migrations::MigrationHarness;
use session_api::db::MIGRATIONS;

fn main() -> ExitCode {
    if dotenvy::dotenv().is_err() {
        let env_path = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
        let _ = dotenvy::from_path(env_path);
    }

    let Ok(mut database_url) = std::env::var("DATABASE_URL") else {
        eprintln!("DATABASE_URL env var is required");
        return ExitCode::FAILURE;
    };

    if std::env::args().any(|arg| arg == "--test") {
        database_url = with_test_db_suffix(&database_url);
    }

    println!("Connecting to database...");
    let mut conn = match PgConnection::establish(&database_url) {
        Ok(conn) => conn,
        Err(e) => {
            eprintln!("failed to connect to database: {e}");
            return ExitCode::FAILURE;
        }
    };

    println!("Running pending migrations...");
    let applied = match conn.run_pending_migrations(MIGRATIONS) {
        Ok(applied) => applied,
        Err(e) => {
            eprintln!("failed to run migrations: {e}");
            return ExitCode::FAILURE;
        }
    };

    if applied.is_empty() {
        println!("No pending migrations.");
    } else {
        for migration in &applied {
            println!("  Applied: {migration}");
        }
        println!("{} migration(s) applied.", applied.len());
    }
    ExitCode::SUCCESS
}

/// `postgres://host/jamroom?x=y` becomes `postgres://host/jamroom_test?x=y`.
fn with_test_db_suffix(database_url: &str) -> String {
    let (base, query) = match database_url.split_once('?') {
        Some((base, query)) => (base, Some(query)),
        None => (database_url, None),
    };
    let Some((prefix, db_name)) = base.rsplit_once('/') else {
        return database_url.to_string();
    };
    if db_name.is_empty() || db_name.ends_with("_test") {
        return database_url.to_string();
    }

    let mut updated = format!("{prefix}/{db_name}_test");
    if let Some(query) = query {
        updated.push('?');
        updated.push_str(query);
    }
    updated
}

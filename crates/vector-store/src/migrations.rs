use anyhow::{anyhow, Context, Result};
use include_dir::{include_dir, Dir};
use rusqlite::Connection;

static MIGRATIONS_DIR: Dir<'_> = include_dir!("$CARGO_MANIFEST_DIR/db/migrations");

/// One embedded schema step. The numeric file-name prefix is the schema
/// version the database ends up at once the step has run.
struct SchemaStep {
    version: i64,
    label: String,
    sql: String,
}

/// Bring the database up to the latest embedded schema.
///
/// Progress is tracked with `PRAGMA user_version`: a step applies only when
/// its version is above the database's current one, and the pragma is bumped
/// inside the same transaction as the DDL, so a crash can never record a step
/// it did not finish.
pub(crate) fn apply_migrations(conn: &mut Connection) -> Result<()> {
    let current = schema_version(conn)?;

    for step in embedded_steps()? {
        if step.version <= current {
            continue;
        }

        run_step(conn, &step)?;
        tracing::debug!(version = step.version, label = step.label.as_str(), "schema step applied");
    }

    Ok(())
}

fn schema_version(conn: &Connection) -> Result<i64> {
    conn.query_row("PRAGMA user_version", [], |row| row.get(0))
        .context("Failed to read schema version pragma")
}

fn run_step(conn: &mut Connection, step: &SchemaStep) -> Result<()> {
    let tx = conn
        .transaction()
        .with_context(|| format!("Failed to begin schema step {}", step.label))?;

    tx.execute_batch(&step.sql)
        .with_context(|| format!("Failed to run schema step {}", step.label))?;
    tx.pragma_update(None, "user_version", step.version)
        .with_context(|| format!("Failed to bump schema version to {}", step.version))?;

    tx.commit()
        .with_context(|| format!("Failed to finish schema step {}", step.label))
}

fn embedded_steps() -> Result<Vec<SchemaStep>> {
    let mut steps = Vec::new();

    for file in MIGRATIONS_DIR.files() {
        let path = file.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("sql") {
            continue;
        }

        let label = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .ok_or_else(|| anyhow!("Schema file {} has a non-UTF-8 name", path.display()))?
            .to_string();

        // File names look like `0001_init.sql`.
        let version = label
            .split('_')
            .next()
            .and_then(|prefix| prefix.parse::<i64>().ok())
            .filter(|version| *version >= 1)
            .ok_or_else(|| anyhow!("Schema file '{label}' needs a positive numeric prefix"))?;

        let sql = std::str::from_utf8(file.contents())
            .with_context(|| format!("Schema file '{label}' is not valid UTF-8"))?
            .to_string();

        steps.push(SchemaStep {
            version,
            label,
            sql,
        });
    }

    steps.sort_by_key(|step| step.version);

    for pair in steps.windows(2) {
        if pair[0].version == pair[1].version {
            return Err(anyhow!(
                "Schema version {} is defined twice ('{}' and '{}')",
                pair[0].version,
                pair[0].label,
                pair[1].label
            ));
        }
    }

    Ok(steps)
}

#[cfg(test)]
mod tests {
    use rusqlite::Connection;

    use super::{apply_migrations, embedded_steps, schema_version};

    #[test]
    fn embedded_steps_are_ordered_and_unique() {
        let steps = embedded_steps().expect("embedded schema should parse");
        assert!(!steps.is_empty());
        for pair in steps.windows(2) {
            assert!(pair[0].version < pair[1].version);
        }
    }

    #[test]
    fn migrations_advance_user_version_and_rerun_as_a_no_op() {
        let mut conn = Connection::open_in_memory().expect("in-memory db should open");
        assert_eq!(schema_version(&conn).expect("version should read"), 0);

        apply_migrations(&mut conn).expect("first run should apply");
        let after_first = schema_version(&conn).expect("version should read");
        assert!(after_first >= 1);

        apply_migrations(&mut conn).expect("second run should be a no-op");
        assert_eq!(schema_version(&conn).expect("version should read"), after_first);

        // The core tables exist once the schema is current.
        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' \
                 AND name IN ('documents', 'chunks', 'embedding_config', 'file_states')",
                [],
                |row| row.get(0),
            )
            .expect("table census should run");
        assert_eq!(tables, 4);
    }
}

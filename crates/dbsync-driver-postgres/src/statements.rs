//! Splitting `pg_dump` output into executable statements

/// Split a schema-only dump into individual executable statements.
///
/// Blank lines, `--` comment lines, session-level `SET` statements and
/// `pg_catalog.set_config` calls are dropped; remaining lines are joined
/// until one ends with `;`.
pub(crate) fn parse_sql_statements(sql: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut skipping = false;

    for line in sql.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with("--") {
            continue;
        }

        if skipping {
            if trimmed.ends_with(';') {
                skipping = false;
            }
            continue;
        }

        if current.is_empty() && is_session_noise(trimmed) {
            skipping = !trimmed.ends_with(';');
            continue;
        }

        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(trimmed);

        if trimmed.ends_with(';') {
            statements.push(std::mem::take(&mut current).trim().to_string());
        }
    }

    if !current.trim().is_empty() {
        statements.push(current.trim().to_string());
    }

    statements
}

fn is_session_noise(line: &str) -> bool {
    let upper = line.to_uppercase();
    upper.starts_with("SET ") || upper.contains("PG_CATALOG.SET_CONFIG")
}

//! Extension-specific index statements and drift detection
//!
//! Both functions are pure: they only read the strategy table, so they can be
//! used for fresh index creation, inside migration scripts, and by the
//! reindex orchestrator.

use super::DatabaseExtension;
use crate::error::Result;
use crate::utils::validate_identifier;
use std::collections::{BTreeMap, HashMap};

/// Embedding column every vector index is built on
pub const EMBEDDING_COLUMN: &str = "embedding";

/// Build the `CREATE INDEX` statement for a vector index
///
/// The statement text is a compatibility surface: existing deployments
/// compare live index definitions against it.
pub fn create_index_statement(
    extension: DatabaseExtension,
    table: &str,
    index_name: &str,
) -> Result<String> {
    let profile = extension.vector_profile()?;
    let table = validate_identifier(table)?;
    let index_name = validate_identifier(index_name)?;

    let mut statement = format!(
        "CREATE INDEX IF NOT EXISTS {} ON {} USING {} ({} {})",
        index_name, table, profile.access_method, EMBEDDING_COLUMN, profile.operator_class
    );
    if let Some(options) = profile.options {
        statement.push_str(&format!(" WITH (options = $${}$$)", options));
    }
    Ok(statement)
}

/// Decide which indexes have drifted from the active extension
///
/// An index needs a rebuild when it has no live definition or when its
/// definition does not mention the access method the active extension
/// builds (compared case-insensitively).
pub fn needs_reindex(
    extension: DatabaseExtension,
    index_names: &[&str],
    live_definitions: &HashMap<String, String>,
) -> Result<BTreeMap<String, bool>> {
    let keyword = extension.vector_profile()?.index_keyword();

    let decisions = index_names
        .iter()
        .map(|name| {
            let stale = match live_definitions.get(*name) {
                Some(definition) => !definition.to_lowercase().contains(&keyword),
                None => true,
            };
            (name.to_string(), stale)
        })
        .collect();

    Ok(decisions)
}

//! SQL fragments shared by the SQLite backend.

use rusqlite::types::Value as SqlValue;

use entryflow_core::{CoreError, EntryStatus, FilterComparator, FilterPredicate, TransitionCause};

/// Column list matching [`crate::sqlite`]'s entry row mapping.
pub(crate) const ENTRY_COLUMNS: &str = "id, node_id, parent_node_entry_id, input_hash, output_hash, \
     status, payload_json, error, diagnostic, outgoing_input_hash, outgoing_output_hash, \
     filter_outcome";

/// Column list matching [`crate::sqlite`]'s cache row mapping.
pub(crate) const CACHE_COLUMNS: &str = "node_id, node_hash, incoming_input_hash, \
     incoming_output_hash, outgoing_input_hash, outgoing_output_hash, filter_outcome, \
     explanation, created_at, updated_at";

/// Renders the statuses an entry may leave to reach `to` as a quoted SQL
/// list, e.g. `'PENDING'`.
///
/// Status strings are fixed identifiers, never user input.
pub(crate) fn status_sources(to: EntryStatus, cause: TransitionCause) -> String {
    EntryStatus::legal_sources(to, cause)
        .into_iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

/// A boolean SQL expression over `ne.payload_json` with its bound values.
#[derive(Debug)]
pub(crate) struct PredicateSql {
    pub expr: String,
    pub params: Vec<SqlValue>,
}

/// Builds the AND of `filters` as one SQL expression.
///
/// Placeholders are numbered from `first_param` so the caller can bind its
/// own values first. An empty filter list renders as `1` (everything passes).
pub(crate) fn filter_predicate(
    filters: &[FilterPredicate],
    first_param: usize,
) -> Result<PredicateSql, CoreError> {
    if filters.is_empty() {
        return Ok(PredicateSql {
            expr: "1".to_string(),
            params: Vec::new(),
        });
    }

    let mut clauses = Vec::with_capacity(filters.len());
    let mut params = Vec::with_capacity(filters.len() * 2);
    let mut next = first_param;

    for filter in filters {
        filter.validate()?;
        let path = next;
        let value = next + 1;
        next += 2;

        // Missing fields compare as the empty string.
        let field = format!("COALESCE(CAST(json_extract(ne.payload_json, ?{path}) AS TEXT), '')");
        let clause = match filter.comparator {
            FilterComparator::Equals => format!("{field} = ?{value}"),
            FilterComparator::NotEquals => format!("{field} <> ?{value}"),
            FilterComparator::Contains => format!("instr({field}, ?{value}) > 0"),
            FilterComparator::NotContains => format!("instr({field}, ?{value}) = 0"),
            FilterComparator::Like => format!("{field} LIKE ?{value}"),
            FilterComparator::NotLike => format!("{field} NOT LIKE ?{value}"),
        };
        clauses.push(format!("({clause})"));
        params.push(SqlValue::Text(filter.json_path()));
        params.push(SqlValue::Text(filter.value.clone()));
    }

    Ok(PredicateSql {
        expr: clauses.join(" AND "),
        params,
    })
}

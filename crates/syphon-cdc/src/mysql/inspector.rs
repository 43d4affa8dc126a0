//! Schema inspection and table resolution
//!
//! The introspection engine itself is an external collaborator
//! ([`SchemaInspector`]); this module owns turning the configured selectors
//! into the concrete, validated table list the snapshot and streaming phases
//! work from. Resolution happens once per run and the result is immutable
//! for the run's duration.

use std::collections::HashSet;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::common::{
    resolve_rename, ExtractError, Result, SchemaSelector,
};

/// One column of a validated table layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub data_type: String,
    /// Part of the primary key
    pub key: bool,
}

/// Validated column layout of a table, in ordinal order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableColumns {
    pub columns: Vec<ColumnDef>,
}

impl TableColumns {
    pub fn ordinal_of(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// First primary-key column, falling back to the first column. Used for
    /// keyset continuation while dumping chunks.
    pub fn key_column(&self) -> Option<&str> {
        self.columns
            .iter()
            .find(|c| c.key)
            .or_else(|| self.columns.first())
            .map(|c| c.name.as_str())
    }
}

/// A resolved (schema, table) tuple with its row filter, rename and layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedTable {
    pub schema: String,
    pub name: String,
    /// Target-side name ("" = unchanged)
    pub rename: String,
    /// Row filter for the copy phase, never empty (defaults to `true`)
    pub where_filter: String,
    pub columns: TableColumns,
}

impl ResolvedTable {
    pub fn target_name(&self) -> &str {
        if self.rename.is_empty() {
            &self.name
        } else {
            &self.rename
        }
    }
}

/// A resolved schema with its tables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedSource {
    pub schema: String,
    /// Target-side schema name ("" = unchanged)
    pub schema_rename: String,
    pub tables: Vec<ResolvedTable>,
}

impl ResolvedSource {
    pub fn target_schema(&self) -> &str {
        if self.schema_rename.is_empty() {
            &self.schema
        } else {
            &self.schema_rename
        }
    }
}

/// The introspection/validation engine, as the core needs it.
#[async_trait]
pub trait SchemaInspector: Send + Sync {
    async fn list_schemas(&self) -> Result<Vec<String>>;

    async fn list_tables(&self, schema: &str) -> Result<Vec<String>>;

    /// Validate a candidate table and return its column layout. An error
    /// here is a validation failure: the caller skips the table.
    async fn table_columns(&self, schema: &str, table: &str) -> Result<TableColumns>;

    /// Row count honoring the table's row filter.
    async fn count_rows(&self, schema: &str, table: &str, where_filter: &str) -> Result<i64>;

    async fn close(&self) -> Result<()>;
}

/// Apply the selector rules to produce the concrete ordered table list.
///
/// Candidates that fail validation are skipped with a warning, never failing
/// the run. The result contains no duplicate (schema, table) pair.
pub async fn resolve_sources(
    do_db: &[SchemaSelector],
    ignore_db: &[SchemaSelector],
    inspector: &dyn SchemaInspector,
) -> Result<Vec<ResolvedSource>> {
    let mut seen: HashSet<(String, String)> = HashSet::new();
    let mut out: Vec<ResolvedSource> = Vec::new();

    if do_db.is_empty() {
        // Replicate everything minus the ignore list.
        for schema in inspector.list_schemas().await? {
            if ignores_schema(ignore_db, &schema) {
                continue;
            }
            let mut source = ResolvedSource {
                schema: schema.clone(),
                schema_rename: String::new(),
                tables: Vec::new(),
            };
            for table in inspector.list_tables(&schema).await? {
                if ignores_table(ignore_db, &schema, &table) {
                    continue;
                }
                if let Some(resolved) =
                    validate_candidate(inspector, &schema, &table, "", "", &mut seen).await
                {
                    source.tables.push(resolved);
                }
            }
            out.push(source);
        }
        return Ok(out);
    }

    for selector in do_db {
        for (schema, schema_rename) in expand_schemas(selector, inspector).await? {
            let mut source = ResolvedSource {
                schema: schema.clone(),
                schema_rename,
                tables: Vec::new(),
            };

            if selector.tables.is_empty() {
                // Replicate all tables of the schema.
                for table in inspector.list_tables(&schema).await? {
                    if let Some(resolved) =
                        validate_candidate(inspector, &schema, &table, "", "", &mut seen).await
                    {
                        source.tables.push(resolved);
                    }
                }
            } else {
                for spec in &selector.tables {
                    if !spec.regex.is_empty() && spec.name.is_empty() {
                        let pattern = Regex::new(&spec.regex).map_err(|e| {
                            ExtractError::config(format!("table regex {}: {e}", spec.regex))
                        })?;
                        let before = source.tables.len();
                        for table in inspector.list_tables(&schema).await? {
                            let Some(rename) = expand_or_skip(&pattern, &spec.rename, &table)
                            else {
                                continue;
                            };
                            if let Some(resolved) = validate_candidate(
                                inspector,
                                &schema,
                                &table,
                                &rename,
                                &spec.where_filter,
                                &mut seen,
                            )
                            .await
                            {
                                source.tables.push(resolved);
                            }
                        }
                        if source.tables.len() == before {
                            return Err(ExtractError::config(format!(
                                "table regex {} matched nothing in {schema}",
                                spec.regex
                            )));
                        }
                    } else if !spec.name.is_empty() {
                        if let Some(resolved) = validate_candidate(
                            inspector,
                            &schema,
                            &spec.name,
                            &spec.rename,
                            &spec.where_filter,
                            &mut seen,
                        )
                        .await
                        {
                            source.tables.push(resolved);
                        }
                    } else {
                        return Err(ExtractError::config("table selector has neither name nor regex"));
                    }
                }
            }
            out.push(source);
        }
    }

    Ok(out)
}

/// Expand a selector into concrete (schema, rename) pairs.
async fn expand_schemas(
    selector: &SchemaSelector,
    inspector: &dyn SchemaInspector,
) -> Result<Vec<(String, String)>> {
    if selector.schema_regex.is_empty() {
        if selector.schema.is_empty() {
            return Err(ExtractError::config(
                "schema selector has neither name nor regex",
            ));
        }
        return Ok(vec![(
            selector.schema.clone(),
            selector.schema_rename.clone(),
        )]);
    }

    let pattern = Regex::new(&selector.schema_regex).map_err(|e| {
        ExtractError::config(format!("schema regex {}: {e}", selector.schema_regex))
    })?;
    let mut expanded = Vec::new();
    for schema in inspector.list_schemas().await? {
        let Some(rename) = expand_or_skip(&pattern, &selector.schema_rename, &schema) else {
            continue;
        };
        expanded.push((schema, rename));
    }
    if expanded.is_empty() {
        return Err(ExtractError::config(format!(
            "schema regex {} matched nothing",
            selector.schema_regex
        )));
    }
    Ok(expanded)
}

/// `None` if the candidate does not match; the expanded rename (possibly
/// empty when no template is configured) if it does.
fn expand_or_skip(pattern: &Regex, template: &str, candidate: &str) -> Option<String> {
    if !pattern.is_match(candidate) {
        return None;
    }
    if template.is_empty() {
        return Some(String::new());
    }
    resolve_rename(pattern, template, candidate)
}

async fn validate_candidate(
    inspector: &dyn SchemaInspector,
    schema: &str,
    table: &str,
    rename: &str,
    where_filter: &str,
    seen: &mut HashSet<(String, String)>,
) -> Option<ResolvedTable> {
    if !seen.insert((schema.to_string(), table.to_string())) {
        debug!(schema, table, "skipping duplicate selector match");
        return None;
    }
    match inspector.table_columns(schema, table).await {
        Ok(columns) => Some(ResolvedTable {
            schema: schema.to_string(),
            name: table.to_string(),
            rename: rename.to_string(),
            where_filter: if where_filter.is_empty() {
                "true".to_string()
            } else {
                where_filter.to_string()
            },
            columns,
        }),
        Err(e) => {
            warn!(schema, table, error = %e, "table failed validation, skipping");
            None
        }
    }
}

fn ignores_schema(ignore: &[SchemaSelector], schema: &str) -> bool {
    ignore
        .iter()
        .any(|s| s.schema == schema && s.tables.is_empty())
}

fn ignores_table(ignore: &[SchemaSelector], schema: &str, table: &str) -> bool {
    ignore
        .iter()
        .filter(|s| s.schema == schema)
        .any(|s| s.tables.iter().any(|t| t.name == table))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::TableSpec;
    use std::collections::HashMap;

    /// Inspector double over a fixed catalog; tables named `broken*` fail
    /// validation.
    struct FixedInspector {
        catalog: HashMap<String, Vec<String>>,
    }

    impl FixedInspector {
        fn new(catalog: &[(&str, &[&str])]) -> Self {
            Self {
                catalog: catalog
                    .iter()
                    .map(|(s, ts)| {
                        (s.to_string(), ts.iter().map(|t| t.to_string()).collect())
                    })
                    .collect(),
            }
        }
    }

    #[async_trait]
    impl SchemaInspector for FixedInspector {
        async fn list_schemas(&self) -> Result<Vec<String>> {
            let mut schemas: Vec<_> = self.catalog.keys().cloned().collect();
            schemas.sort();
            Ok(schemas)
        }

        async fn list_tables(&self, schema: &str) -> Result<Vec<String>> {
            Ok(self.catalog.get(schema).cloned().unwrap_or_default())
        }

        async fn table_columns(&self, _schema: &str, table: &str) -> Result<TableColumns> {
            if table.starts_with("broken") {
                return Err(ExtractError::schema("no obtainable column layout"));
            }
            Ok(TableColumns {
                columns: vec![
                    ColumnDef {
                        name: "id".into(),
                        data_type: "bigint".into(),
                        key: true,
                    },
                    ColumnDef {
                        name: "payload".into(),
                        data_type: "text".into(),
                        key: false,
                    },
                ],
            })
        }

        async fn count_rows(&self, _: &str, _: &str, _: &str) -> Result<i64> {
            Ok(0)
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    fn names(source: &ResolvedSource) -> Vec<&str> {
        source.tables.iter().map(|t| t.name.as_str()).collect()
    }

    #[tokio::test]
    async fn test_explicit_schema_and_tables() {
        let inspector = FixedInspector::new(&[("shop", &["orders", "users"])]);
        let selector = SchemaSelector {
            schema: "shop".into(),
            tables: vec![TableSpec::named("orders")],
            ..Default::default()
        };

        let resolved = resolve_sources(&[selector], &[], &inspector).await.unwrap();
        assert_eq!(resolved.len(), 1);
        assert_eq!(names(&resolved[0]), vec!["orders"]);
        assert_eq!(resolved[0].tables[0].where_filter, "true");
        assert_eq!(resolved[0].tables[0].columns.key_column(), Some("id"));
    }

    #[tokio::test]
    async fn test_schema_regex_with_rename_expansion() {
        let inspector = FixedInspector::new(&[
            ("shard_1", &["orders"]),
            ("shard_2", &["orders"]),
            ("other", &["misc"]),
        ]);
        let selector = SchemaSelector {
            schema_regex: r"^shard_(\d+)$".into(),
            schema_rename: "merged_$1".into(),
            ..Default::default()
        };

        let resolved = resolve_sources(&[selector], &[], &inspector).await.unwrap();
        assert_eq!(resolved.len(), 2);
        assert_eq!(resolved[0].schema, "shard_1");
        assert_eq!(resolved[0].schema_rename, "merged_1");
        assert_eq!(resolved[1].target_schema(), "merged_2");
    }

    #[tokio::test]
    async fn test_table_regex_with_rename() {
        let inspector =
            FixedInspector::new(&[("shop", &["orders_2023", "orders_2024", "users"])]);
        let selector = SchemaSelector {
            schema: "shop".into(),
            tables: vec![TableSpec {
                regex: r"^orders_(\d+)$".into(),
                rename: "orders_all".into(),
                ..Default::default()
            }],
            ..Default::default()
        };

        let resolved = resolve_sources(&[selector], &[], &inspector).await.unwrap();
        assert_eq!(names(&resolved[0]), vec!["orders_2023", "orders_2024"]);
        assert!(resolved[0].tables.iter().all(|t| t.rename == "orders_all"));
    }

    #[tokio::test]
    async fn test_all_schemas_minus_ignore_list() {
        let inspector = FixedInspector::new(&[
            ("shop", &["orders", "audit_log"]),
            ("scratch", &["tmp"]),
        ]);
        let ignore = vec![
            SchemaSelector::named("scratch"),
            SchemaSelector {
                schema: "shop".into(),
                tables: vec![TableSpec::named("audit_log")],
                ..Default::default()
            },
        ];

        let resolved = resolve_sources(&[], &ignore, &inspector).await.unwrap();
        let all: Vec<(String, String)> = resolved
            .iter()
            .flat_map(|s| s.tables.iter().map(|t| (t.schema.clone(), t.name.clone())))
            .collect();
        assert_eq!(all, vec![("shop".to_string(), "orders".to_string())]);
    }

    #[tokio::test]
    async fn test_validation_failure_skips_single_table() {
        let inspector = FixedInspector::new(&[("shop", &["broken_view", "orders"])]);
        let selector = SchemaSelector::named("shop");

        let resolved = resolve_sources(&[selector], &[], &inspector).await.unwrap();
        assert_eq!(names(&resolved[0]), vec!["orders"]);
    }

    #[tokio::test]
    async fn test_no_duplicate_pairs_across_selectors() {
        let inspector = FixedInspector::new(&[("shop", &["orders", "users"])]);
        let selectors = vec![
            SchemaSelector {
                schema: "shop".into(),
                tables: vec![TableSpec::named("orders")],
                ..Default::default()
            },
            // Overlaps the first selector entirely.
            SchemaSelector::named("shop"),
        ];

        let resolved = resolve_sources(&selectors, &[], &inspector).await.unwrap();
        let mut pairs: Vec<(String, String)> = resolved
            .iter()
            .flat_map(|s| s.tables.iter().map(|t| (t.schema.clone(), t.name.clone())))
            .collect();
        let total = pairs.len();
        pairs.sort();
        pairs.dedup();
        assert_eq!(total, pairs.len());
        assert_eq!(total, 2);
    }

    #[tokio::test]
    async fn test_unmatched_table_regex_is_config_error() {
        let inspector = FixedInspector::new(&[("shop", &["users"])]);
        let selector = SchemaSelector {
            schema: "shop".into(),
            tables: vec![TableSpec {
                regex: r"^orders_\d+$".into(),
                rename: "x".into(),
                ..Default::default()
            }],
            ..Default::default()
        };

        let err = resolve_sources(&[selector], &[], &inspector)
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractError::Config(_)));
    }
}

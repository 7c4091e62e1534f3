// ABOUTME: Schema reconciler - compares source columns against the live destination schema
// ABOUTME: Reports missing columns and type mismatches; evolves additively only when opted in

use crate::error::Result;
use crate::warehouse::Warehouse;

use super::{CanonicalType, ColumnDescriptor, DestColumn};

/// A same-named column whose destination type differs from the mapped source type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeMismatch {
    pub name: String,
    pub dest_type: String,
    pub expected: CanonicalType,
}

/// Result of comparing source columns with the destination schema.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaDiff {
    /// Source columns absent by name on the destination, with the type they would get.
    pub missing: Vec<(String, CanonicalType)>,
    /// Never auto-resolved; reported only.
    pub mismatches: Vec<TypeMismatch>,
}

impl SchemaDiff {
    pub fn is_clean(&self) -> bool {
        self.missing.is_empty() && self.mismatches.is_empty()
    }

    pub fn missing_names(&self) -> Vec<String> {
        self.missing.iter().map(|(name, _)| name.clone()).collect()
    }
}

/// Outcome of a reconcile pass for one mapping.
#[derive(Debug, Clone, Default)]
pub struct ReconcileOutcome {
    pub diff: SchemaDiff,
    /// Columns that were added to the destination during this pass.
    pub evolved: Vec<String>,
    /// Source columns that the destination still lacks after this pass.
    /// Their values are left out of the loaded row shape.
    pub absent: Vec<String>,
}

/// Compares discovered source columns with the destination and optionally
/// adds the missing ones.
///
/// Evolution is additive only: type changes and column drops are never
/// applied, whatever the drift.
pub struct SchemaReconciler<'a> {
    warehouse: &'a dyn Warehouse,
}

impl<'a> SchemaReconciler<'a> {
    pub fn new(warehouse: &'a dyn Warehouse) -> Self {
        Self { warehouse }
    }

    /// Compute the drift between source columns and the destination schema.
    ///
    /// Pure; the order of `missing` follows the source column order.
    pub fn diff(source_columns: &[ColumnDescriptor], dest_schema: &[DestColumn]) -> SchemaDiff {
        let mut diff = SchemaDiff::default();

        for column in source_columns {
            let expected = column.canonical_type();
            match dest_schema.iter().find(|d| d.name == column.name) {
                None => diff.missing.push((column.name.clone(), expected)),
                Some(dest) if dest.data_type != expected.as_str() => {
                    diff.mismatches.push(TypeMismatch {
                        name: column.name.clone(),
                        dest_type: dest.data_type.clone(),
                        expected,
                    });
                }
                Some(_) => {}
            }
        }

        diff
    }

    /// Append the missing columns to the destination as nullable columns.
    pub async fn evolve(&self, dest_table: &str, missing: &[(String, CanonicalType)]) -> Result<()> {
        if missing.is_empty() {
            return Ok(());
        }
        self.warehouse.add_columns(dest_table, missing).await?;
        tracing::info!(
            "Added {} column(s) to {}: {}",
            missing.len(),
            dest_table,
            missing
                .iter()
                .map(|(name, t)| format!("{} {}", name, t))
                .collect::<Vec<_>>()
                .join(", ")
        );
        Ok(())
    }

    /// Diff, optionally evolve, and log. Never fails the run.
    ///
    /// If the destination schema cannot be read, the pass assumes the
    /// destination matches the source and leaves any real problem to surface
    /// at load time.
    pub async fn reconcile(
        &self,
        dest_table: &str,
        source_columns: &[ColumnDescriptor],
        allow_additions: bool,
    ) -> ReconcileOutcome {
        let dest_schema = match self.warehouse.table_schema(dest_table).await {
            Ok(schema) => schema,
            Err(e) => {
                tracing::warn!(
                    "Could not read destination schema for {}: {}. Skipping reconciliation",
                    dest_table,
                    e
                );
                return ReconcileOutcome::default();
            }
        };

        let diff = Self::diff(source_columns, &dest_schema);
        let mut outcome = ReconcileOutcome {
            diff: diff.clone(),
            ..Default::default()
        };

        for mismatch in &diff.mismatches {
            tracing::warn!(
                "Type mismatch on {}.{}: destination has {}, source maps to {}",
                dest_table,
                mismatch.name,
                mismatch.dest_type,
                mismatch.expected
            );
        }

        if diff.missing.is_empty() {
            return outcome;
        }

        if allow_additions {
            match self.evolve(dest_table, &diff.missing).await {
                Ok(()) => outcome.evolved = diff.missing_names(),
                Err(e) => {
                    tracing::warn!(
                        "Failed to add missing columns to {}: {}. Loading without them",
                        dest_table,
                        e
                    );
                    outcome.absent = diff.missing_names();
                }
            }
        } else {
            tracing::warn!(
                "Missing columns in destination {}: {}",
                dest_table,
                diff.missing_names().join(", ")
            );
            outcome.absent = diff.missing_names();
        }

        outcome
    }
}

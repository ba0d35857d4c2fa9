//! # Error Types
//!
//! Domain-specific error types for tally-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  tally-core errors (this file)                                         │
//! │  ├── CoreError        - Payload and entity errors                      │
//! │  ├── ValidationError  - Field-level validation failures                │
//! │  └── LedgerError      - Unit mismatches, integrity violations          │
//! │                                                                         │
//! │  tally-db errors        DbError     (device store)                     │
//! │  tally-sync errors      SyncError   (network, retry classification)    │
//! │  central-api errors     CentralError (HTTP status mapping)             │
//! │                                                                         │
//! │  A CoreError raised while applying a pushed mutation becomes a         │
//! │  `rejected` outcome for that entry, never a failed batch.              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

// =============================================================================
// Core Error
// =============================================================================

/// Errors raised while interpreting or applying entity payloads.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The entity kind string is not one of the synchronized kinds.
    #[error("Unknown entity kind: {0}")]
    UnknownEntityKind(String),

    /// The operation string is not create/update/delete.
    #[error("Unknown operation: {0}")]
    UnknownOperation(String),

    /// A status or enum string stored in a column could not be parsed.
    #[error("Invalid {field} value: {value}")]
    InvalidEnumValue { field: String, value: String },

    /// Update or delete targeting an entity that does not exist.
    ///
    /// ## When This Occurs
    /// - Device pushes an update for an entity whose create was rejected
    /// - Device of another account references a foreign entity id
    #[error("Unknown {kind} entity: {id}")]
    UnknownEntity { kind: String, id: String },

    /// Payload is not a JSON object or does not match the entity shape.
    #[error("Malformed {kind} payload: {reason}")]
    MalformedPayload { kind: String, reason: String },

    /// Ledger records are append-only; update and delete are refused.
    #[error("{kind} records are append-only")]
    AppendOnly { kind: String },

    /// Timestamp outside the representable millisecond range.
    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(i64),

    /// Validation error (wraps ValidationError).
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Ledger error (wraps LedgerError).
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),
}

// =============================================================================
// Validation Error
// =============================================================================

/// Field-level validation errors.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("{field} is required")]
    Required { field: String },

    /// Field value is too long.
    #[error("{field} must be at most {max} characters")]
    TooLong { field: String, max: usize },

    /// Numeric value is out of range.
    #[error("{field} must be between {min} and {max}")]
    OutOfRange { field: String, min: i64, max: i64 },

    /// Value must be positive.
    #[error("{field} must be positive")]
    MustBePositive { field: String },

    /// Invalid format (e.g., invalid UUID).
    #[error("{field} has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },

    /// Field may not change once the entity exists.
    ///
    /// ## When This Occurs
    /// - An inventory item update tries to change `unit`; existing events
    ///   and snapshots are expressed in the original unit
    #[error("{field} is immutable")]
    Immutable { field: String },

    /// Derived value does not match its inputs (e.g. order total).
    #[error("{field} is {actual}, expected {expected}")]
    Mismatch {
        field: String,
        expected: i64,
        actual: i64,
    },
}

// =============================================================================
// Ledger Error
// =============================================================================

/// Inventory ledger errors.
///
/// Both variants are data-integrity problems: they are surfaced to the
/// operator and never silently corrected.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LedgerError {
    /// Event or snapshot unit differs from the item's declared unit.
    ///
    /// ## When This Occurs
    /// ```text
    /// InventoryItem { unit: "kg" }
    ///      │
    ///      ▼
    /// InventoryEvent { delta: -500, unit: "g" }   ← recorded on old firmware
    ///      │
    ///      ▼
    /// UnitMismatch { expected: "kg", found: "g" } → rejected, not coerced
    /// ```
    #[error("Unit mismatch for item {item_id}: expected {expected}, found {found}")]
    UnitMismatch {
        item_id: String,
        expected: String,
        found: String,
    },

    /// Event or snapshot references a different item than the one folded.
    #[error("Record {record_id} belongs to item {found}, not {expected}")]
    ItemMismatch {
        record_id: String,
        expected: String,
        found: String,
    },

    /// Replaying the history disagrees with a stored snapshot, or a late
    /// event landed behind a compaction snapshot.
    ///
    /// ## When This Occurs
    /// - A device was offline long enough that central compacted past the
    ///   timestamp of one of its events
    /// - Snapshot rows were edited outside the system
    #[error("Integrity violation for item {item_id}: {reason}")]
    IntegrityViolation { item_id: String, reason: String },

    /// Folding deltas overflowed i64.
    #[error("Stock overflow for item {item_id}")]
    Overflow { item_id: String },
}

// =============================================================================
// Result Type Aliases
// =============================================================================

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;

/// Convenience type alias for ledger operations.
pub type LedgerResult<T> = Result<T, LedgerError>;

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = LedgerError::UnitMismatch {
            item_id: "flour".to_string(),
            expected: "kg".to_string(),
            found: "g".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Unit mismatch for item flour: expected kg, found g"
        );

        let err = CoreError::AppendOnly {
            kind: "inventory_event".to_string(),
        };
        assert_eq!(err.to_string(), "inventory_event records are append-only");
    }

    #[test]
    fn test_validation_converts_to_core_error() {
        let validation_err = ValidationError::Immutable {
            field: "unit".to_string(),
        };
        let core_err: CoreError = validation_err.into();
        assert!(matches!(core_err, CoreError::Validation(_)));
        assert_eq!(core_err.to_string(), "Validation error: unit is immutable");
    }
}

//! Maps failed response statuses to typed errors.

use ember_core::protocol::subdoc::decode_mutation_failure;
use ember_core::protocol::{Opcode, Status};
use ember_core::EmberError;

use super::dispatcher::Operation;

fn path_of(op: &Operation, index: usize) -> String {
    op.request()
        .subdoc_path(index)
        .unwrap_or_default()
        .to_string()
}

fn subdoc_error(op: &Operation, index: usize, status: Status) -> EmberError {
    let path = path_of(op, index);
    match status {
        Status::SubdocPathNotFound => EmberError::PathNotFound { path },
        Status::SubdocPathExists => EmberError::PathExists { path },
        Status::SubdocPathMismatch => EmberError::PathMismatch { path },
        other => EmberError::InvalidArgument(format!(
            "sub-document spec {} ('{}') on '{}' failed: {}",
            index,
            path,
            op.key(),
            other
        )),
    }
}

/// Converts a definite failure status into the caller-facing error.
///
/// Transient statuses (`NotMyVbucket`, temporary failures) are handled by
/// the retry loop and never reach this function.
pub(crate) fn status_to_error(op: &Operation, status: Status, body: &[u8]) -> EmberError {
    let key = op.key().to_string();
    let opcode = op.request().opcode();

    match status {
        Status::NotFound => EmberError::DocumentNotFound { key },
        Status::Exists if op.request().cas() != 0 => EmberError::CasMismatch { key },
        Status::Exists => EmberError::DocumentExists { key },
        Status::NotStored => match opcode {
            Opcode::Insert => EmberError::DocumentExists { key },
            Opcode::Append | Opcode::Prepend => EmberError::DocumentNotFound { key },
            _ => EmberError::InvalidArgument(format!("{} on '{}' was not stored", opcode, key)),
        },
        Status::Locked => EmberError::DocumentLocked { key },
        Status::TooBig => EmberError::ValueTooLarge { key },
        Status::Invalid | Status::DeltaBadValue => EmberError::InvalidArgument(format!(
            "{} on '{}' rejected: {}",
            opcode, key, status
        )),
        Status::AuthError | Status::AccessDenied => {
            EmberError::Authentication(format!("{} on '{}' denied: {}", opcode, key, status))
        }
        Status::UnknownCollection => EmberError::UnknownCollection(op.collection().to_string()),
        Status::NoBucket => EmberError::Configuration("connection is not bound to a bucket".to_string()),
        Status::DurabilityInvalidLevel | Status::DurabilityImpossible => {
            EmberError::InvalidArgument(format!("{} on '{}': {}", opcode, key, status))
        }
        Status::SyncWriteAmbiguous => EmberError::AmbiguousTimeout(format!(
            "durable {} on '{}' has an unknown outcome",
            opcode, key
        )),
        Status::SubdocMultiPathFailure | Status::SubdocMultiPathFailureDeleted => {
            match decode_mutation_failure(body) {
                Some((index, code)) => match Status::from_code(code) {
                    Some(spec_status) => subdoc_error(op, index as usize, spec_status),
                    None => EmberError::UnknownStatus {
                        opcode: opcode.code(),
                        status: code,
                    },
                },
                None => EmberError::Protocol(format!(
                    "multi-path failure for '{}' without a failing spec",
                    key
                )),
            }
        }
        Status::SubdocPathNotFound
        | Status::SubdocPathMismatch
        | Status::SubdocPathExists
        | Status::SubdocPathInvalid
        | Status::SubdocPathTooBig
        | Status::SubdocDocTooDeep
        | Status::SubdocValueCannotInsert
        | Status::SubdocDocNotJson
        | Status::SubdocNumRange
        | Status::SubdocDeltaInvalid
        | Status::SubdocValueTooDeep
        | Status::SubdocInvalidCombo => subdoc_error(op, 0, status),
        other => EmberError::UnknownStatus {
            opcode: opcode.code(),
            status: other.code(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use ember_core::protocol::{MutateInSpec, Request, StoreMode, StoreSemantics};
    use ember_core::{CollectionName, DurabilityLevel};

    fn store(mode: StoreMode, cas: u64) -> Operation {
        Operation::new(
            "store",
            CollectionName::default(),
            "k",
            Request::Store {
                mode,
                key: Bytes::from_static(b"k"),
                value: Bytes::from_static(b"{}"),
                flags: 0,
                expiry: 0,
                cas,
                datatype: 0,
                durability: DurabilityLevel::None,
            },
        )
    }

    #[test]
    fn test_exists_depends_on_cas() {
        let with_cas = status_to_error(&store(StoreMode::Replace, 5), Status::Exists, &[]);
        assert!(matches!(with_cas, EmberError::CasMismatch { .. }));

        let insert = status_to_error(&store(StoreMode::Insert, 0), Status::Exists, &[]);
        assert!(matches!(insert, EmberError::DocumentExists { .. }));
    }

    #[test]
    fn test_not_stored_on_insert() {
        let err = status_to_error(&store(StoreMode::Insert, 0), Status::NotStored, &[]);
        assert!(matches!(err, EmberError::DocumentExists { .. }));
    }

    #[test]
    fn test_multi_path_failure_names_the_path() {
        let op = Operation::new(
            "mutate_in",
            CollectionName::default(),
            "k",
            Request::MutateIn {
                key: Bytes::from_static(b"k"),
                specs: vec![
                    MutateInSpec::upsert("a", Bytes::from_static(b"1")),
                    MutateInSpec::insert("b.c", Bytes::from_static(b"2")),
                ],
                cas: 0,
                expiry: None,
                semantics: StoreSemantics::Replace,
                access_deleted: false,
                durability: DurabilityLevel::None,
            },
        );
        let body = [1u8, 0x00, 0xc9];
        let err = status_to_error(&op, Status::SubdocMultiPathFailure, &body);
        assert!(matches!(err, EmberError::PathExists { ref path } if path == "b.c"));
    }
}

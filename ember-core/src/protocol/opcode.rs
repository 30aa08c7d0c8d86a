//! Opcode and status code tables.

use std::fmt;

macro_rules! code_enum {
    (
        $(#[$meta:meta])*
        $name:ident : $repr:ty {
            $( $(#[$vmeta:meta])* $variant:ident = $code:literal => $label:literal, )+
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr($repr)]
        pub enum $name {
            $( $(#[$vmeta])* $variant = $code, )+
        }

        impl $name {
            /// Looks up a known code, returning `None` for codes this client does not handle.
            pub fn from_code(code: $repr) -> Option<Self> {
                match code {
                    $( $code => Some(Self::$variant), )+
                    _ => None,
                }
            }

            /// Returns the wire value.
            pub fn code(self) -> $repr {
                self as $repr
            }

            /// Returns a short lowercase name, suitable for logs and metric labels.
            pub fn name(self) -> &'static str {
                match self {
                    $( Self::$variant => $label, )+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.name())
            }
        }
    };
}

code_enum! {
    /// Request opcodes understood by the client.
    Opcode: u8 {
        /// Read a document.
        Get = 0x00 => "get",
        /// Store unconditionally.
        Upsert = 0x01 => "upsert",
        /// Store only if absent.
        Insert = 0x02 => "insert",
        /// Store only if present.
        Replace = 0x03 => "replace",
        /// Delete a document.
        Remove = 0x04 => "remove",
        /// Increment a counter.
        Increment = 0x05 => "increment",
        /// Decrement a counter.
        Decrement = 0x06 => "decrement",
        /// No-op, used for heartbeats.
        Noop = 0x0a => "noop",
        /// Append raw bytes.
        Append = 0x0e => "append",
        /// Prepend raw bytes.
        Prepend = 0x0f => "prepend",
        /// Update expiry.
        Touch = 0x1c => "touch",
        /// Read and update expiry.
        GetAndTouch = 0x1d => "get_and_touch",
        /// Feature negotiation.
        Hello = 0x1f => "hello",
        /// SASL authentication.
        SaslAuth = 0x21 => "sasl_auth",
        /// Bind the connection to a bucket.
        SelectBucket = 0x89 => "select_bucket",
        /// Read and lock.
        GetAndLock = 0x94 => "get_and_lock",
        /// Release a lock.
        Unlock = 0x95 => "unlock",
        /// Read document metadata.
        GetMeta = 0xa0 => "get_meta",
        /// Fetch the cluster configuration.
        GetClusterConfig = 0xb5 => "get_cluster_config",
        /// Fetch the collections manifest.
        GetCollectionsManifest = 0xba => "get_collections_manifest",
        /// Multi-path sub-document read.
        LookupIn = 0xd0 => "lookup_in",
        /// Multi-path sub-document write.
        MutateIn = 0xd1 => "mutate_in",
    }
}

code_enum! {
    /// Response status codes understood by the client.
    Status: u16 {
        /// Success.
        Success = 0x0000 => "success",
        /// Key not found.
        NotFound = 0x0001 => "not_found",
        /// Key exists, or CAS mismatch.
        Exists = 0x0002 => "exists",
        /// Value too large.
        TooBig = 0x0003 => "too_big",
        /// Invalid arguments.
        Invalid = 0x0004 => "invalid",
        /// Item not stored.
        NotStored = 0x0005 => "not_stored",
        /// Counter on a non-numeric value.
        DeltaBadValue = 0x0006 => "delta_bad_value",
        /// The node does not own the vbucket.
        NotMyVbucket = 0x0007 => "not_my_vbucket",
        /// The connection is not bound to a bucket.
        NoBucket = 0x0008 => "no_bucket",
        /// The document is locked.
        Locked = 0x0009 => "locked",
        /// Authentication failed.
        AuthError = 0x0020 => "auth_error",
        /// Authentication needs another step.
        AuthContinue = 0x0021 => "auth_continue",
        /// Access denied.
        AccessDenied = 0x0024 => "access_denied",
        /// Unknown command.
        UnknownCommand = 0x0081 => "unknown_command",
        /// Out of memory.
        OutOfMemory = 0x0082 => "out_of_memory",
        /// Not supported.
        NotSupported = 0x0083 => "not_supported",
        /// Internal server error.
        Internal = 0x0084 => "internal",
        /// Server busy.
        Busy = 0x0085 => "busy",
        /// Temporary failure.
        TemporaryFailure = 0x0086 => "temporary_failure",
        /// Unknown collection.
        UnknownCollection = 0x0088 => "unknown_collection",
        /// Invalid durability level.
        DurabilityInvalidLevel = 0x00a0 => "durability_invalid_level",
        /// Durability requirements cannot be met.
        DurabilityImpossible = 0x00a1 => "durability_impossible",
        /// A synchronous write is already in progress on the key.
        SyncWriteInProgress = 0x00a2 => "sync_write_in_progress",
        /// The outcome of a synchronous write is unknown.
        SyncWriteAmbiguous = 0x00a3 => "sync_write_ambiguous",
        /// Sub-document path not found.
        SubdocPathNotFound = 0x00c0 => "subdoc_path_not_found",
        /// Sub-document path mismatch.
        SubdocPathMismatch = 0x00c1 => "subdoc_path_mismatch",
        /// Sub-document path syntax invalid.
        SubdocPathInvalid = 0x00c2 => "subdoc_path_invalid",
        /// Sub-document path too long.
        SubdocPathTooBig = 0x00c3 => "subdoc_path_too_big",
        /// Document too deep to parse.
        SubdocDocTooDeep = 0x00c4 => "subdoc_doc_too_deep",
        /// Value cannot be inserted at the path.
        SubdocValueCannotInsert = 0x00c5 => "subdoc_value_cannot_insert",
        /// Document is not JSON.
        SubdocDocNotJson = 0x00c6 => "subdoc_doc_not_json",
        /// Counter out of range.
        SubdocNumRange = 0x00c7 => "subdoc_num_range",
        /// Invalid counter delta.
        SubdocDeltaInvalid = 0x00c8 => "subdoc_delta_invalid",
        /// Sub-document path already exists.
        SubdocPathExists = 0x00c9 => "subdoc_path_exists",
        /// Value would make the document too deep.
        SubdocValueTooDeep = 0x00ca => "subdoc_value_too_deep",
        /// Invalid combination of specs.
        SubdocInvalidCombo = 0x00cb => "subdoc_invalid_combo",
        /// At least one spec failed.
        SubdocMultiPathFailure = 0x00cc => "subdoc_multi_path_failure",
        /// Success on a deleted document.
        SubdocSuccessDeleted = 0x00cd => "subdoc_success_deleted",
        /// At least one spec failed on a deleted document.
        SubdocMultiPathFailureDeleted = 0x00d3 => "subdoc_multi_path_failure_deleted",
    }
}

impl Status {
    /// Returns `true` for statuses that mean the server did not apply the
    /// request and the same request may succeed later.
    pub fn is_temporary(self) -> bool {
        matches!(
            self,
            Self::TemporaryFailure | Self::Busy | Self::OutOfMemory | Self::SyncWriteInProgress
        )
    }
}

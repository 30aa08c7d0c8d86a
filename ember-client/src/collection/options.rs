//! Per-operation option structs for [`Collection`](super::Collection).

use std::time::Duration;

use ember_core::protocol::StoreSemantics;
use ember_core::DurabilityLevel;

use crate::config::RetryConfig;
use crate::dispatch::DispatchOptions;

macro_rules! dispatch_overrides {
    ($($name:ident),+ $(,)?) => {
        $(
            impl $name {
                /// Creates options with every field unset.
                pub fn new() -> Self {
                    Self::default()
                }

                /// Sets the end-to-end timeout, including retries.
                pub fn timeout(mut self, timeout: Duration) -> Self {
                    self.dispatch.timeout = Some(timeout);
                    self
                }

                /// Overrides the retry policy.
                pub fn retry(mut self, retry: RetryConfig) -> Self {
                    self.dispatch.retry = Some(retry);
                    self
                }

                /// Overrides whether the operation may be retried after it was written.
                pub fn idempotent(mut self, idempotent: bool) -> Self {
                    self.dispatch.idempotent = Some(idempotent);
                    self
                }

                pub(crate) fn dispatch(&self) -> &DispatchOptions {
                    &self.dispatch
                }
            }
        )+
    };
}

dispatch_overrides!(
    GetOptions,
    ExistsOptions,
    TouchOptions,
    UnlockOptions,
    InsertOptions,
    UpsertOptions,
    ReplaceOptions,
    RemoveOptions,
    CounterOptions,
    ConcatOptions,
    LookupInOptions,
    MutateInOptions,
);

/// Options for `get`, `get_and_touch` and `get_and_lock`.
#[derive(Debug, Clone, Default)]
pub struct GetOptions {
    dispatch: DispatchOptions,
}

/// Options for `exists`.
#[derive(Debug, Clone, Default)]
pub struct ExistsOptions {
    dispatch: DispatchOptions,
}

/// Options for `touch`.
#[derive(Debug, Clone, Default)]
pub struct TouchOptions {
    dispatch: DispatchOptions,
}

/// Options for `unlock`.
#[derive(Debug, Clone, Default)]
pub struct UnlockOptions {
    dispatch: DispatchOptions,
}

/// Options for `insert`.
#[derive(Debug, Clone, Default)]
pub struct InsertOptions {
    dispatch: DispatchOptions,
    pub(crate) expiry: Option<Duration>,
    pub(crate) durability: DurabilityLevel,
}

impl InsertOptions {
    /// Sets the document expiry.
    pub fn expiry(mut self, expiry: Duration) -> Self {
        self.expiry = Some(expiry);
        self
    }

    /// Sets the durability requirement.
    pub fn durability(mut self, durability: DurabilityLevel) -> Self {
        self.durability = durability;
        self
    }
}

/// Options for `upsert`.
#[derive(Debug, Clone, Default)]
pub struct UpsertOptions {
    dispatch: DispatchOptions,
    pub(crate) expiry: Option<Duration>,
    pub(crate) durability: DurabilityLevel,
}

impl UpsertOptions {
    /// Sets the document expiry.
    pub fn expiry(mut self, expiry: Duration) -> Self {
        self.expiry = Some(expiry);
        self
    }

    /// Sets the durability requirement.
    pub fn durability(mut self, durability: DurabilityLevel) -> Self {
        self.durability = durability;
        self
    }
}

/// Options for `replace`.
#[derive(Debug, Clone, Default)]
pub struct ReplaceOptions {
    dispatch: DispatchOptions,
    pub(crate) cas: u64,
    pub(crate) expiry: Option<Duration>,
    pub(crate) durability: DurabilityLevel,
}

impl ReplaceOptions {
    /// Only replace if the stored CAS equals `cas`.
    pub fn cas(mut self, cas: u64) -> Self {
        self.cas = cas;
        self
    }

    /// Sets the document expiry.
    pub fn expiry(mut self, expiry: Duration) -> Self {
        self.expiry = Some(expiry);
        self
    }

    /// Sets the durability requirement.
    pub fn durability(mut self, durability: DurabilityLevel) -> Self {
        self.durability = durability;
        self
    }
}

/// Options for `remove`.
#[derive(Debug, Clone, Default)]
pub struct RemoveOptions {
    dispatch: DispatchOptions,
    pub(crate) cas: u64,
    pub(crate) durability: DurabilityLevel,
}

impl RemoveOptions {
    /// Only remove if the stored CAS equals `cas`.
    pub fn cas(mut self, cas: u64) -> Self {
        self.cas = cas;
        self
    }

    /// Sets the durability requirement.
    pub fn durability(mut self, durability: DurabilityLevel) -> Self {
        self.durability = durability;
        self
    }
}

/// Options for `increment` and `decrement`.
#[derive(Debug, Clone, Default)]
pub struct CounterOptions {
    dispatch: DispatchOptions,
    pub(crate) initial: Option<u64>,
    pub(crate) expiry: Option<Duration>,
    pub(crate) durability: DurabilityLevel,
}

impl CounterOptions {
    /// Creates the counter with this value if it does not exist.
    pub fn initial(mut self, initial: u64) -> Self {
        self.initial = Some(initial);
        self
    }

    /// Expiry applied when the counter is created.
    pub fn expiry(mut self, expiry: Duration) -> Self {
        self.expiry = Some(expiry);
        self
    }

    /// Sets the durability requirement.
    pub fn durability(mut self, durability: DurabilityLevel) -> Self {
        self.durability = durability;
        self
    }
}

/// Options for `append` and `prepend`.
#[derive(Debug, Clone, Default)]
pub struct ConcatOptions {
    dispatch: DispatchOptions,
    pub(crate) cas: u64,
    pub(crate) durability: DurabilityLevel,
}

impl ConcatOptions {
    /// Only apply if the stored CAS equals `cas`.
    pub fn cas(mut self, cas: u64) -> Self {
        self.cas = cas;
        self
    }

    /// Sets the durability requirement.
    pub fn durability(mut self, durability: DurabilityLevel) -> Self {
        self.durability = durability;
        self
    }
}

/// Options for `lookup_in`.
#[derive(Debug, Clone, Default)]
pub struct LookupInOptions {
    dispatch: DispatchOptions,
    pub(crate) access_deleted: bool,
}

impl LookupInOptions {
    /// Allows reading tombstones.
    pub fn access_deleted(mut self, enabled: bool) -> Self {
        self.access_deleted = enabled;
        self
    }
}

/// Options for `mutate_in`.
#[derive(Debug, Clone, Default)]
pub struct MutateInOptions {
    dispatch: DispatchOptions,
    pub(crate) cas: u64,
    pub(crate) expiry: Option<Duration>,
    pub(crate) semantics: StoreSemantics,
    pub(crate) access_deleted: bool,
    pub(crate) durability: DurabilityLevel,
}

impl MutateInOptions {
    /// Only apply if the stored CAS equals `cas`.
    pub fn cas(mut self, cas: u64) -> Self {
        self.cas = cas;
        self
    }

    /// Sets the document expiry.
    pub fn expiry(mut self, expiry: Duration) -> Self {
        self.expiry = Some(expiry);
        self
    }

    /// Whether the document must exist, may be created, or must be absent.
    pub fn semantics(mut self, semantics: StoreSemantics) -> Self {
        self.semantics = semantics;
        self
    }

    /// Allows mutating tombstones.
    pub fn access_deleted(mut self, enabled: bool) -> Self {
        self.access_deleted = enabled;
        self
    }

    /// Sets the durability requirement.
    pub fn durability(mut self, durability: DurabilityLevel) -> Self {
        self.durability = durability;
        self
    }
}

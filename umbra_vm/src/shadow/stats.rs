//! Cache statistics.
//!
//! Process-wide counters, one row per opcode: hits, misses, slight misses
//! (entry correct but subsidiary state refreshed), uncacheable
//! classifications, and entries created. A separate breakdown records why
//! sites were classified uncacheable.
//!
//! Counter updates go through [`record_stat!`]; with the `stats` feature
//! disabled the macro expands to nothing and the fast paths carry no
//! counter traffic.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::bytecode::{Opcode, OPCODE_COUNT};

/// Counter fields tracked per opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatField {
    /// Cache successfully used.
    Hits,
    /// Cache miss; the site respecializes.
    Misses,
    /// Cache mostly correct; subsidiary state was refreshed.
    SlightMisses,
    /// Site could not be cached.
    Uncacheable,
    /// Cache entries created.
    Entries,
}

/// Why a site was classified uncacheable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UncachableKind {
    /// Data descriptor mixed with an instance dict.
    DictDescrMix,
    /// Owner type (or metatype) overrides attribute lookup.
    GetattrType,
    /// Owner is a super proxy.
    GetattrSuper,
    /// Anything else.
    GetattrUnknown,
}

struct OpcodeCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    slight_misses: AtomicU64,
    uncacheable: AtomicU64,
    entries: AtomicU64,
}

#[allow(clippy::declare_interior_mutable_const)]
const ZERO_ROW: OpcodeCounters = OpcodeCounters {
    hits: AtomicU64::new(0),
    misses: AtomicU64::new(0),
    slight_misses: AtomicU64::new(0),
    uncacheable: AtomicU64::new(0),
    entries: AtomicU64::new(0),
};

static PER_OPCODE: [OpcodeCounters; OPCODE_COUNT] = [ZERO_ROW; OPCODE_COUNT];

static DICT_DESCR_MIX: AtomicU64 = AtomicU64::new(0);
static GETATTR_TYPE: AtomicU64 = AtomicU64::new(0);
static GETATTR_SUPER: AtomicU64 = AtomicU64::new(0);
static GETATTR_UNKNOWN: AtomicU64 = AtomicU64::new(0);

/// Record one event against an opcode's counters.
#[inline]
pub fn record(op: Opcode, field: StatField) {
    let row = &PER_OPCODE[op as usize];
    let counter = match field {
        StatField::Hits => &row.hits,
        StatField::Misses => &row.misses,
        StatField::SlightMisses => &row.slight_misses,
        StatField::Uncacheable => &row.uncacheable,
        StatField::Entries => &row.entries,
    };
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Record an uncacheable classification with its reason.
#[inline]
pub fn record_uncachable(op: Opcode, kind: UncachableKind) {
    #[cfg(feature = "stats")]
    {
        record(op, StatField::Uncacheable);
        let counter = match kind {
            UncachableKind::DictDescrMix => &DICT_DESCR_MIX,
            UncachableKind::GetattrType => &GETATTR_TYPE,
            UncachableKind::GetattrSuper => &GETATTR_SUPER,
            UncachableKind::GetattrUnknown => &GETATTR_UNKNOWN,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
    #[cfg(not(feature = "stats"))]
    {
        let _ = (op, kind);
    }
}

/// Record one event against an opcode's counters.
///
/// Compiles to nothing without the `stats` feature.
macro_rules! record_stat {
    ($op:expr, $field:ident) => {{
        #[cfg(feature = "stats")]
        {
            $crate::shadow::stats::record($op, $crate::shadow::stats::StatField::$field);
        }
    }};
}
pub(crate) use record_stat;

// =============================================================================
// Snapshots
// =============================================================================

/// Plain counter values for one opcode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpcodeCacheStats {
    /// Cache successfully used.
    pub hits: u64,
    /// Cache miss and respecialization.
    pub misses: u64,
    /// Subsidiary state refreshed.
    pub slight_misses: u64,
    /// Uncacheable classifications.
    pub uncacheable: u64,
    /// Entries created.
    pub entries: u64,
}

/// Uncacheable-reason breakdown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UncachableStats {
    /// Data descriptor mixed with an instance dict.
    pub dict_descr_mix: u64,
    /// Attribute lookup overridden on the owner.
    pub getattr_type: u64,
    /// Super proxy owner.
    pub getattr_super: u64,
    /// Everything else.
    pub getattr_unknown: u64,
}

/// A point-in-time copy of all cache statistics.
#[derive(Debug, Clone, Default)]
pub struct CacheStatsSnapshot {
    per_opcode: Vec<OpcodeCacheStats>,
    /// Uncacheable-reason breakdown.
    pub uncachable: UncachableStats,
}

impl CacheStatsSnapshot {
    /// Counters for one opcode.
    pub fn opcode(&self, op: Opcode) -> OpcodeCacheStats {
        self.per_opcode
            .get(op as usize)
            .copied()
            .unwrap_or_default()
    }

    /// Summed counters for a set of opcodes (e.g. one opcode family).
    pub fn sum<I: IntoIterator<Item = Opcode>>(&self, ops: I) -> OpcodeCacheStats {
        let mut total = OpcodeCacheStats::default();
        for op in ops {
            let s = self.opcode(op);
            total.hits += s.hits;
            total.misses += s.misses;
            total.slight_misses += s.slight_misses;
            total.uncacheable += s.uncacheable;
            total.entries += s.entries;
        }
        total
    }
}

/// Copy out the current counters.
pub fn snapshot() -> CacheStatsSnapshot {
    let per_opcode = PER_OPCODE
        .iter()
        .map(|row| OpcodeCacheStats {
            hits: row.hits.load(Ordering::Relaxed),
            misses: row.misses.load(Ordering::Relaxed),
            slight_misses: row.slight_misses.load(Ordering::Relaxed),
            uncacheable: row.uncacheable.load(Ordering::Relaxed),
            entries: row.entries.load(Ordering::Relaxed),
        })
        .collect();
    CacheStatsSnapshot {
        per_opcode,
        uncachable: UncachableStats {
            dict_descr_mix: DICT_DESCR_MIX.load(Ordering::Relaxed),
            getattr_type: GETATTR_TYPE.load(Ordering::Relaxed),
            getattr_super: GETATTR_SUPER.load(Ordering::Relaxed),
            getattr_unknown: GETATTR_UNKNOWN.load(Ordering::Relaxed),
        },
    }
}

/// Zero all counters.
pub fn reset() {
    for row in PER_OPCODE.iter() {
        row.hits.store(0, Ordering::Relaxed);
        row.misses.store(0, Ordering::Relaxed);
        row.slight_misses.store(0, Ordering::Relaxed);
        row.uncacheable.store(0, Ordering::Relaxed);
        row.entries.store(0, Ordering::Relaxed);
    }
    DICT_DESCR_MIX.store(0, Ordering::Relaxed);
    GETATTR_TYPE.store(0, Ordering::Relaxed);
    GETATTR_SUPER.store(0, Ordering::Relaxed);
    GETATTR_UNKNOWN.store(0, Ordering::Relaxed);
}

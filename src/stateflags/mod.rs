//! State Flags
//!
//! Fixed-width bitsets of named flags carried by cluster entities. Flag
//! changes are buffered in a transaction object and access-checked against
//! the owning object's protection: mutators need `CHANGE`, queries `VIEW`.
//!
//! Flag enums are declared with [`state_flags!`], which derives the
//! [`Flag`] implementation (bit values, labels, and the set of valid flags).

use crate::error::Result;
use crate::security::{AccessContext, AccessType, ObjectProtection};
use crate::transaction::{DbKey, TransactionMgr, TransactionSimpleObject};
use std::marker::PhantomData;
use std::sync::Arc;

// =============================================================================
// Flag Trait
// =============================================================================

/// A named flag occupying one or more bits of a [`StateFlags`] set
pub trait Flag: Copy + Eq + std::fmt::Debug + Send + Sync + 'static {
    /// Every declared flag of this set
    const ALL: &'static [Self];

    fn bit(self) -> u64;

    fn label(self) -> &'static str;

    /// OR of every declared flag
    fn valid_mask() -> u64 {
        Self::ALL.iter().fold(0, |mask, f| mask | f.bit())
    }

    /// Combined bits of `flags`
    fn to_bits(flags: &[Self]) -> u64 {
        flags.iter().fold(0, |mask, f| mask | f.bit())
    }

    /// Flags whose bits are all set in `bits`; unknown bits are ignored
    fn restore(bits: u64) -> Vec<Self> {
        Self::ALL
            .iter()
            .copied()
            .filter(|f| bits & f.bit() == f.bit())
            .collect()
    }
}

/// Declare a flag enum and its [`Flag`] implementation
///
/// ```ignore
/// state_flags! {
///     pub enum NodeFlags {
///         Delete = 1 << 0 => "DELETE",
///         Evicted = 1 << 1 => "EVICTED",
///     }
/// }
/// ```
#[macro_export]
macro_rules! state_flags {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident {
            $($variant:ident = $bit:expr => $label:literal),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        $vis enum $name {
            $($variant),+
        }

        impl $crate::stateflags::Flag for $name {
            const ALL: &'static [Self] = &[$($name::$variant),+];

            fn bit(self) -> u64 {
                match self {
                    $($name::$variant => $bit),+
                }
            }

            fn label(self) -> &'static str {
                match self {
                    $($name::$variant => $label),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str($crate::stateflags::Flag::label(*self))
            }
        }
    };
}

// =============================================================================
// State Flags
// =============================================================================

/// Access-checked, transactional bitset of `F` flags
pub struct StateFlags<F: Flag> {
    protection: Arc<ObjectProtection>,
    bits: TransactionSimpleObject<u64>,
    _flags: PhantomData<F>,
}

impl<F: Flag> StateFlags<F> {
    /// Flags persisted at `key`, initialised to `initial`
    pub fn new(protection: Arc<ObjectProtection>, key: DbKey, initial: &[F]) -> Self {
        Self::from_bits(protection, key, F::to_bits(initial))
    }

    /// Flags loaded from persisted `bits`; bits outside the valid mask are dropped
    pub fn from_bits(protection: Arc<ObjectProtection>, key: DbKey, bits: u64) -> Self {
        Self {
            protection,
            bits: TransactionSimpleObject::persistent(key, bits & F::valid_mask()),
            _flags: PhantomData,
        }
    }

    /// Bits of every declared flag
    pub fn valid_mask(&self) -> u64 {
        F::valid_mask()
    }

    /// Last committed bits
    pub fn persisted_bits(&self) -> u64 {
        self.bits.committed()
    }

    pub fn is_dirty(&self) -> bool {
        self.bits.is_dirty()
    }

    /// Delete the persisted flags row of an entity being removed
    pub fn delete(&self, tx: &TransactionMgr) -> Result<()> {
        self.bits.remove_row(tx)
    }

    // -------------------------------------------------------------------------
    // Mutators
    // -------------------------------------------------------------------------

    pub fn enable_flags(&self, ctx: &AccessContext, tx: &TransactionMgr, flags: &[F]) -> Result<()> {
        self.protection.require_access(ctx, AccessType::Change)?;
        let add = F::to_bits(flags);
        self.store(tx, |bits| bits | add)
    }

    pub fn disable_flags(&self, ctx: &AccessContext, tx: &TransactionMgr, flags: &[F]) -> Result<()> {
        self.protection.require_access(ctx, AccessType::Change)?;
        let remove = F::to_bits(flags);
        self.store(tx, |bits| bits & !remove)
    }

    /// Replace the whole set with exactly `flags`
    pub fn reset_flags_to(&self, ctx: &AccessContext, tx: &TransactionMgr, flags: &[F]) -> Result<()> {
        self.protection.require_access(ctx, AccessType::Change)?;
        let set = F::to_bits(flags);
        self.store(tx, |_| set)
    }

    /// Enable every valid flag except `flags`
    pub fn enable_flags_except(
        &self,
        ctx: &AccessContext,
        tx: &TransactionMgr,
        flags: &[F],
    ) -> Result<()> {
        self.protection.require_access(ctx, AccessType::Change)?;
        let add = F::valid_mask() & !F::to_bits(flags);
        self.store(tx, |bits| bits | add)
    }

    /// Disable every valid flag except `flags`
    pub fn disable_flags_except(
        &self,
        ctx: &AccessContext,
        tx: &TransactionMgr,
        flags: &[F],
    ) -> Result<()> {
        self.protection.require_access(ctx, AccessType::Change)?;
        let keep = F::to_bits(flags);
        self.store(tx, |bits| bits & keep)
    }

    pub fn enable_all_flags(&self, ctx: &AccessContext, tx: &TransactionMgr) -> Result<()> {
        self.enable_flags_except(ctx, tx, &[])
    }

    pub fn disable_all_flags(&self, ctx: &AccessContext, tx: &TransactionMgr) -> Result<()> {
        self.disable_flags_except(ctx, tx, &[])
    }

    fn store(&self, tx: &TransactionMgr, f: impl FnOnce(u64) -> u64) -> Result<()> {
        let next = f(self.bits.get()) & F::valid_mask();
        self.bits.set(tx, next)?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// Whether every one of `flags` is set
    pub fn is_set(&self, ctx: &AccessContext, flags: &[F]) -> Result<bool> {
        let mask = F::to_bits(flags);
        Ok(self.pending(ctx)? & mask == mask)
    }

    /// Whether every one of `flags` is unset
    pub fn is_unset(&self, ctx: &AccessContext, flags: &[F]) -> Result<bool> {
        Ok(self.pending(ctx)? & F::to_bits(flags) == 0)
    }

    /// Whether at least one of `flags` is set
    pub fn is_some_set(&self, ctx: &AccessContext, flags: &[F]) -> Result<bool> {
        Ok(self.pending(ctx)? & F::to_bits(flags) != 0)
    }

    /// Whether at least one of `flags` is unset
    pub fn is_some_unset(&self, ctx: &AccessContext, flags: &[F]) -> Result<bool> {
        let mask = F::to_bits(flags);
        Ok(self.pending(ctx)? & mask != mask)
    }

    /// Current bits, including uncommitted changes
    pub fn flags_bits(&self, ctx: &AccessContext) -> Result<u64> {
        self.pending(ctx)
    }

    /// Current flags, including uncommitted changes
    pub fn flags(&self, ctx: &AccessContext) -> Result<Vec<F>> {
        Ok(F::restore(self.pending(ctx)?))
    }

    fn pending(&self, ctx: &AccessContext) -> Result<u64> {
        self.protection.require_access(ctx, AccessType::View)?;
        Ok(self.bits.get())
    }
}

impl<F: Flag> std::fmt::Debug for StateFlags<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(F::restore(self.bits.get())).finish()
    }
}

// =============================================================================
// Flag Sets
// =============================================================================

state_flags! {
    /// Flags of a resource (one node's instance of a resource definition)
    pub enum ResourceFlags {
        Delete = 1 << 0 => "DELETE",
        Diskless = 1 << 2 => "DISKLESS",
        DrbdDiskless = (1 << 2) | (1 << 8) => "DRBD_DISKLESS",
        DrbdDelete = (1 << 0) | (1 << 10) => "DRBD_DELETE",
        Inactive = 1 << 11 => "INACTIVE",
        TieBreaker = 1 << 12 => "TIE_BREAKER",
        Evicted = 1 << 13 => "EVICTED",
        RestoreFromSnapshot = 1 << 14 => "RESTORE_FROM_SNAPSHOT",
    }
}

state_flags! {
    /// Flags of a satellite node
    pub enum NodeFlags {
        Delete = 1 << 0 => "DELETE",
        Evicted = 1 << 1 => "EVICTED",
        QuorumIgnore = 1 << 2 => "QIGNORE",
    }
}

state_flags! {
    /// Flags of a resource definition
    pub enum ResourceDefinitionFlags {
        Delete = 1 << 0 => "DELETE",
        Cloning = 1 << 1 => "CLONING",
    }
}

state_flags! {
    /// Flags of a replicated-block (DRBD) layer node
    pub enum DrbdLayerFlags {
        Diskless = 1 << 0 => "DISKLESS",
        Delete = 1 << 1 => "DELETE",
        Initialized = 1 << 2 => "INITIALIZED",
        ForceNewMetadata = 1 << 3 => "FORCE_NEW_METADATA",
    }
}

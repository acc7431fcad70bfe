use std::fmt;

use serde::{Deserialize, Serialize};

/// Maximum number of data stripes a table can be split into.
///
/// The stripe of a row is encoded in the low bits of its [`RowId`].
pub const MAX_STRIPES: u8 = 16;

/// Store-assigned identifier of a logical row (a "genid").
///
/// The 64 bits are laid out as `seq:48 | update_id:12 | stripe:4`, so that
/// the natural `u64` ordering orders rows by allocation sequence first. An
/// in-place update of a row bumps only the update id, leaving the
/// [`RowId::base`] of the row unchanged.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RowId(u64);

impl RowId {
    const STRIPE_BITS: u32 = 4;
    const UPDATE_BITS: u32 = 12;
    const STRIPE_MASK: u64 = (1 << Self::STRIPE_BITS) - 1;
    const UPDATE_MASK: u64 = ((1 << Self::UPDATE_BITS) - 1) << Self::STRIPE_BITS;
    const SEQ_SHIFT: u32 = Self::STRIPE_BITS + Self::UPDATE_BITS;

    /// Create the id of a freshly allocated row in `stripe`.
    ///
    /// # Panics
    ///
    /// If `stripe >= MAX_STRIPES` or `seq` does not fit into 48 bits.
    pub const fn new(seq: u64, stripe: u8) -> Self {
        assert!(stripe < MAX_STRIPES, "stripe out of range");
        assert!(seq < (1 << 48), "row sequence out of range");
        Self((seq << Self::SEQ_SHIFT) | stripe as u64)
    }

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn into_raw(self) -> u64 {
        self.0
    }

    pub const fn seq(self) -> u64 {
        self.0 >> Self::SEQ_SHIFT
    }

    /// The data stripe this row lives in.
    pub const fn stripe(self) -> u8 {
        (self.0 & Self::STRIPE_MASK) as u8
    }

    pub const fn update_id(self) -> u16 {
        ((self.0 & Self::UPDATE_MASK) >> Self::STRIPE_BITS) as u16
    }

    /// The id with the update id cleared.
    ///
    /// Two ids with equal bases denote the same physical row before and after
    /// an in-place update.
    pub const fn base(self) -> Self {
        Self(self.0 & !Self::UPDATE_MASK)
    }

    /// True if `self` and `other` refer to the same physical row.
    pub const fn same_row(self, other: Self) -> bool {
        self.base().0 == other.base().0
    }

    /// The id this row gets after an in-place update.
    ///
    /// The update id wraps around, which never changes the [`Self::base`].
    pub const fn next_update(self) -> Self {
        let next = (self.update_id() as u64 + 1) & ((1 << Self::UPDATE_BITS) - 1);
        Self(self.base().0 | (next << Self::STRIPE_BITS))
    }
}

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

impl fmt::Debug for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RowId({:#x})", self.0)
    }
}

/// Position of a record in the write-ahead log.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Lsn {
    pub file: u32,
    pub offset: u32,
}

impl Lsn {
    /// The position before any record.
    pub const ZERO: Self = Self { file: 0, offset: 0 };

    pub const fn new(file: u32, offset: u32) -> Self {
        Self { file, offset }
    }

    pub const fn is_zero(&self) -> bool {
        self.file == 0 && self.offset == 0
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}:{}]", self.file, self.offset)
    }
}

/// Identifier of a store transaction as recorded in the log.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxnId(pub u64);

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

/// Replication sequence number returned by a commit.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SeqNum(pub u64);

/// Per-stripe conversion progress marker.
///
/// `Pending` sorts before every row, `Done` after every row. Once a stripe is
/// `Done` its cursor never changes again.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StripeCursor {
    /// No row of the stripe has been converted yet.
    #[default]
    Pending,
    /// The last row that was converted.
    At(RowId),
    /// The whole stripe has been converted.
    Done,
}

impl StripeCursor {
    pub fn row_id(&self) -> Option<RowId> {
        match self {
            Self::At(id) => Some(*id),
            Self::Pending | Self::Done => None,
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done)
    }

    /// True if `id` lies strictly beyond this cursor, i.e. the converter has
    /// not reached it yet.
    pub fn is_behind(&self, id: RowId) -> bool {
        match self {
            Self::Pending => true,
            Self::At(at) => id.base() > at.base(),
            Self::Done => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn row_id_layout() {
        let id = RowId::new(42, 3);
        assert_eq!(id.seq(), 42);
        assert_eq!(id.stripe(), 3);
        assert_eq!(id.update_id(), 0);

        let upd = id.next_update();
        assert_eq!(upd.update_id(), 1);
        assert!(upd.same_row(id));
        assert_eq!(upd.base(), id);
        assert!(upd > id);
    }

    #[test]
    fn stripe_cursor_ordering() {
        let at = StripeCursor::At(RowId::new(10, 0));
        assert!(StripeCursor::Pending.is_behind(RowId::new(1, 0)));
        assert!(at.is_behind(RowId::new(11, 0)));
        assert!(!at.is_behind(RowId::new(10, 0)));
        assert!(!at.is_behind(RowId::new(10, 0).next_update()));
        assert!(!at.is_behind(RowId::new(9, 0)));
        assert!(!StripeCursor::Done.is_behind(RowId::new(u32::MAX as u64, 0)));
    }

    proptest! {
        #[test]
        fn ordering_follows_sequence(a in 0u64..(1 << 40), b in 0u64..(1 << 40), s in 0u8..MAX_STRIPES, t in 0u8..MAX_STRIPES) {
            let x = RowId::new(a, s);
            let y = RowId::new(b, t);
            if a < b {
                prop_assert!(x < y);
            }
            prop_assert_eq!(x.base(), x);
            prop_assert_eq!(x.next_update().stripe(), s);
        }
    }
}

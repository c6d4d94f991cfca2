use crate::abi::{CQE_FLAG_CACHE_HIT, Cqe};

/// Encoded user_data identifying the request slot a completion belongs to.
///
/// Layout (64-bit):
/// ```text
/// Bits 63..32: Generation (bumped each time the slot is reused)
/// Bits 31..0:  Slot index
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserData(pub u64);

impl UserData {
    const GEN_SHIFT: u64 = 32;
    const SLOT_MASK: u64 = 0xFFFF_FFFF;

    #[inline]
    pub fn encode(slot: u32, generation: u32) -> Self {
        UserData(((generation as u64) << Self::GEN_SHIFT) | slot as u64)
    }

    #[inline]
    pub fn slot(self) -> u32 {
        (self.0 & Self::SLOT_MASK) as u32
    }

    #[inline]
    pub fn generation(self) -> u32 {
        (self.0 >> Self::GEN_SHIFT) as u32
    }

    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }
}

/// A completion record read from the completion ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionRecord {
    pub user_data: UserData,
    /// Bytes transferred on success, `-errno` on failure.
    pub result: i32,
    pub flags: u32,
}

impl CompletionRecord {
    /// Whether the read was served without touching the device.
    pub fn is_cache_hit(&self) -> bool {
        self.flags & CQE_FLAG_CACHE_HIT != 0
    }
}

impl From<Cqe> for CompletionRecord {
    fn from(cqe: Cqe) -> Self {
        CompletionRecord {
            user_data: UserData(cqe.user_data),
            result: cqe.res,
            flags: cqe.flags,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_data_fields() {
        let ud = UserData::encode(31, 0xDEAD_BEEF);
        assert_eq!(ud.slot(), 31);
        assert_eq!(ud.generation(), 0xDEAD_BEEF);
        assert_eq!(UserData(ud.raw()), ud);
    }

    #[test]
    fn zero_generation_is_plain_slot() {
        assert_eq!(UserData::encode(5, 0).raw(), 5);
    }

    #[test]
    fn record_classification() {
        let hit = CompletionRecord::from(Cqe {
            user_data: 1,
            res: 4096,
            flags: CQE_FLAG_CACHE_HIT,
        });
        assert!(hit.is_cache_hit());
        assert_eq!(hit.result, 4096);

        let failed = CompletionRecord::from(Cqe {
            user_data: 1,
            res: -libc::EIO,
            flags: 0,
        });
        assert!(!failed.is_cache_hit());
        assert_eq!(failed.result, -libc::EIO);
    }
}

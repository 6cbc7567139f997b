//! Backing file layout arithmetic
//!
//! A backing file is split into five regions, always in this order:
//!
//! ```text
//! [ headers | keycounts | journal | nugget metadata | body ]
//! ```
//!
//! Every region size is a pure function of the nugget count, the number of
//! flakes per nugget, the flake size and the per-nugget metadata width.

use crate::error::{Result, SwitchCryptError};
use serde::Serialize;

/// First byte after the fixed header region
pub const HEADER_REGION_END: u64 = 105;

/// Bytes used by one nugget's keycount record
pub const KEYCOUNT_BYTES_PER_NUGGET: u64 = 8;

/// Journal bytes needed to hold one bit per flake
pub fn journal_bytes_per_nugget(flakes_per_nugget: u32) -> u64 {
    (flakes_per_nugget as u64 + 7) / 8
}

/// Computed region offsets for a backing file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Layout {
    /// Number of nuggets stored in the body
    pub num_nuggets: u32,

    /// Flakes per nugget
    pub flakes_per_nugget: u32,

    /// Flake size in bytes
    pub flake_size: u32,

    /// Per-nugget metadata bytes (cipher ident + cipher extras)
    pub md_bytes_per_nugget: u32,

    /// Start of the keycount region
    pub kcs_offset: u64,

    /// Start of the transaction journal region
    pub tj_offset: u64,

    /// Start of the nugget metadata region
    pub md_offset: u64,

    /// Start of the body region (0 until setup is finished)
    pub body_offset: u64,

    /// Total size of the backing file
    pub file_size: u64,
}

impl Layout {
    /// Layout of a freshly created file whose geometry is not yet known
    pub fn unconfigured(file_size: u64) -> Self {
        Layout {
            num_nuggets: 0,
            flakes_per_nugget: 0,
            flake_size: 0,
            md_bytes_per_nugget: 1,
            kcs_offset: 0,
            tj_offset: 0,
            md_offset: 0,
            body_offset: 0,
            file_size,
        }
    }

    /// Fit as many nuggets as possible into `total_size` bytes
    pub fn compute(
        total_size: u64,
        flakes_per_nugget: u32,
        flake_size: u32,
        md_bytes_per_nugget: u32,
    ) -> Result<Self> {
        if flakes_per_nugget == 0 {
            return Err(SwitchCryptError::InvalidFlakesPerNugget(
                "must be at least 1".to_string(),
            ));
        }

        if flake_size == 0 {
            return Err(SwitchCryptError::InvalidFlakeSize(
                "must be at least 1".to_string(),
            ));
        }

        let nugget_size = flakes_per_nugget as u64 * flake_size as u64;
        let per_nugget = nugget_size
            + KEYCOUNT_BYTES_PER_NUGGET
            + journal_bytes_per_nugget(flakes_per_nugget)
            + md_bytes_per_nugget as u64;

        let available = total_size.checked_sub(HEADER_REGION_END).ok_or_else(|| {
            SwitchCryptError::InvalidBackstoreSize(format!(
                "{} bytes cannot hold the {} byte header region",
                total_size, HEADER_REGION_END
            ))
        })?;

        let num_nuggets = available / per_nugget;
        if num_nuggets == 0 {
            return Err(SwitchCryptError::InvalidBackstoreSize(format!(
                "{} bytes cannot hold a single {} byte nugget",
                total_size, per_nugget
            )));
        }

        let num_nuggets = u32::try_from(num_nuggets).map_err(|_| {
            SwitchCryptError::InvalidBackstoreSize(format!(
                "{} nuggets exceeds the addressable maximum",
                num_nuggets
            ))
        })?;

        let mut layout = Self::from_geometry(num_nuggets, flakes_per_nugget, flake_size, total_size);
        layout.finish(md_bytes_per_nugget);
        Ok(layout)
    }

    /// Recompute the header-derived offsets of an existing file
    ///
    /// The body offset stays 0 until [`Layout::finish`] supplies the
    /// per-nugget metadata width.
    pub fn from_geometry(
        num_nuggets: u32,
        flakes_per_nugget: u32,
        flake_size: u32,
        file_size: u64,
    ) -> Self {
        let n = num_nuggets as u64;
        let kcs_offset = HEADER_REGION_END;
        let tj_offset = kcs_offset.saturating_add(n.saturating_mul(KEYCOUNT_BYTES_PER_NUGGET));
        let md_offset =
            tj_offset.saturating_add(n.saturating_mul(journal_bytes_per_nugget(flakes_per_nugget)));

        Layout {
            num_nuggets,
            flakes_per_nugget,
            flake_size,
            md_bytes_per_nugget: 1,
            kcs_offset,
            tj_offset,
            md_offset,
            body_offset: 0,
            file_size,
        }
    }

    /// Fix the metadata width and derive the body offset
    pub fn finish(&mut self, md_bytes_per_nugget: u32) {
        self.md_bytes_per_nugget = md_bytes_per_nugget;
        self.body_offset = self.md_offset.saturating_add(
            (self.num_nuggets as u64).saturating_mul(md_bytes_per_nugget as u64),
        );
    }

    /// Bytes per nugget in the body region
    pub fn nugget_size(&self) -> u64 {
        self.flakes_per_nugget as u64 * self.flake_size as u64
    }

    /// Journal bytes per nugget
    pub fn journal_bytes(&self) -> u64 {
        journal_bytes_per_nugget(self.flakes_per_nugget)
    }

    /// Size of the encrypted body, i.e. the device capacity
    pub fn writeable_size(&self) -> u64 {
        (self.num_nuggets as u64).saturating_mul(self.nugget_size())
    }

    /// Check that a finished layout describes the file it was read from
    pub fn validate(&self) -> Result<()> {
        if self.num_nuggets == 0 || self.flakes_per_nugget == 0 || self.flake_size == 0 {
            return Err(SwitchCryptError::CorruptGeometry(format!(
                "zero geometry: {} nuggets x {} flakes x {} bytes",
                self.num_nuggets, self.flakes_per_nugget, self.flake_size
            )));
        }

        let end = self
            .body_offset
            .checked_add(self.writeable_size())
            .filter(|end| *end <= self.file_size);

        match end {
            Some(_) => Ok(()),
            None => Err(SwitchCryptError::CorruptGeometry(format!(
                "body at {} with {} bytes does not fit in a {} byte file",
                self.body_offset,
                self.writeable_size(),
                self.file_size
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_geometry_offsets() {
        // 3 nuggets x 2 flakes x 8 bytes, 8 bytes of metadata per nugget
        let total = HEADER_REGION_END + 3 * (16 + 8 + 1 + 8);
        let layout = Layout::compute(total, 2, 8, 8).unwrap();

        assert_eq!(layout.num_nuggets, 3);
        assert_eq!(layout.kcs_offset, 105);
        assert_eq!(layout.tj_offset, 129);
        assert_eq!(layout.md_offset, 132);
        assert_eq!(layout.body_offset, 156);
        assert_eq!(layout.nugget_size(), 16);
        assert_eq!(layout.writeable_size(), 48);
        assert_eq!(layout.file_size, 204);
        layout.validate().unwrap();
    }

    #[test]
    fn test_4k_geometry_offsets() {
        let layout = Layout::compute(4096, 12, 2, 8).unwrap();

        assert_eq!(layout.num_nuggets, 95);
        assert_eq!(layout.kcs_offset, 105);
        assert_eq!(layout.tj_offset, 865);
        assert_eq!(layout.md_offset, 1055);
        assert_eq!(layout.body_offset, 1815);
        assert_eq!(layout.writeable_size(), 2280);
    }

    #[test]
    fn test_two_phase_matches_compute() {
        let computed = Layout::compute(4096, 12, 2, 8).unwrap();

        let mut reopened = Layout::from_geometry(95, 12, 2, 4096);
        assert_eq!(reopened.body_offset, 0);
        assert_eq!(reopened.md_offset, computed.md_offset);

        reopened.finish(8);
        assert_eq!(reopened, computed);
    }

    #[test]
    fn test_finish_with_zero_metadata() {
        let mut layout = Layout::from_geometry(3, 2, 8, 204);
        layout.finish(0);
        assert_eq!(layout.body_offset, 132);
    }

    #[test]
    fn test_body_offset_is_sum_of_regions() {
        for fpn in [1u32, 7, 8, 9, 64, 100] {
            for md in [1u32, 3, 8] {
                let layout = Layout::compute(1 << 20, fpn, 16, md).unwrap();
                let n = layout.num_nuggets as u64;
                let expected = HEADER_REGION_END
                    + n * KEYCOUNT_BYTES_PER_NUGGET
                    + n * journal_bytes_per_nugget(fpn)
                    + n * md as u64;
                assert_eq!(layout.body_offset, expected);
                assert!(layout.body_offset + layout.writeable_size() <= layout.file_size);
            }
        }
    }

    #[test]
    fn test_too_small_backstore() {
        assert!(matches!(
            Layout::compute(100, 2, 8, 1),
            Err(SwitchCryptError::InvalidBackstoreSize(_))
        ));
        assert!(matches!(
            Layout::compute(HEADER_REGION_END + 10, 2, 8, 1),
            Err(SwitchCryptError::InvalidBackstoreSize(_))
        ));
    }

    #[test]
    fn test_validate_rejects_oversized_body() {
        let mut layout = Layout::from_geometry(1000, 2, 8, 204);
        layout.finish(1);
        assert!(matches!(
            layout.validate(),
            Err(SwitchCryptError::CorruptGeometry(_))
        ));
    }
}

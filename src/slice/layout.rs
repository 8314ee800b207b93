//! Mapping between the logical archive stream and (slice number, in-file
//! offset) pairs.

use crate::bigint::Bigint;
use crate::error::Error;
use crate::error::Result;

/// Geometry of a sliced archive.
///
/// Every slice ends with one flag byte, so the payload capacity of a
/// slice is its size minus its header and minus that byte.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SliceLayout {
    /// Size of the first slice file.
    pub first_size: Bigint,
    /// Size of every other slice file.
    pub other_size: Bigint,
    /// Bytes of header at the start of the first slice.
    pub first_header_size: Bigint,
    /// Bytes of header at the start of the other slices.
    pub other_header_size: Bigint,
}

impl SliceLayout {
    pub fn new(
        first_size: Bigint,
        other_size: Bigint,
        first_header_size: Bigint,
        other_header_size: Bigint,
    ) -> Result<Self> {
        let layout = Self {
            first_size,
            other_size,
            first_header_size,
            other_header_size,
        };
        if layout.first_capacity()?.is_zero() || layout.other_capacity()?.is_zero() {
            return Err(Error::range(
                "slice size too small to hold its header, its flag and any data",
            ));
        }
        Ok(layout)
    }

    /// Payload bytes the first slice can hold.
    pub fn first_capacity(&self) -> Result<Bigint> {
        let overhead = &self.first_header_size + &Bigint::from(1u64);
        self.first_size
            .checked_sub(&overhead)
            .ok_or_else(|| Error::range("first slice size smaller than its header"))
    }

    /// Payload bytes every other slice can hold.
    pub fn other_capacity(&self) -> Result<Bigint> {
        let overhead = &self.other_header_size + &Bigint::from(1u64);
        self.other_size
            .checked_sub(&overhead)
            .ok_or_else(|| Error::range("slice size smaller than its header"))
    }

    /// Translates a logical stream offset into the number of the slice
    /// holding that byte and the offset inside the slice file.
    pub fn locate(&self, offset: &Bigint) -> Result<(usize, Bigint)> {
        let first_cap = self.first_capacity()?;
        if *offset < first_cap {
            return Ok((1, &self.first_header_size + offset));
        }
        let rest = offset.sub(&first_cap)?;
        let (slices, in_slice) = rest.div_rem(&self.other_capacity()?)?;
        let number = slices
            .to_usize()
            .and_then(|n| n.checked_add(2))
            .ok_or_else(|| Error::range("slice number out of bounds"))?;
        Ok((number, &self.other_header_size + &in_slice))
    }

    /// Inverse of `locate`.
    pub fn relocate(&self, slice: usize, in_file: &Bigint) -> Result<Bigint> {
        if slice == 0 {
            return Err(Error::range("slice numbers start at one"));
        }
        if slice == 1 {
            return in_file.sub(&self.first_header_size);
        }
        let full = Bigint::from(slice - 2).mul(&self.other_capacity()?);
        let base = &self.first_capacity()? + &full;
        Ok(&base + &in_file.sub(&self.other_header_size)?)
    }

    /// Number of the slice holding the given logical offset.
    pub fn slice_of(&self, offset: &Bigint) -> Result<usize> {
        Ok(self.locate(offset)?.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> SliceLayout {
        SliceLayout::new(
            Bigint::from(100u64),
            Bigint::from(50u64),
            Bigint::from(30u64),
            Bigint::from(20u64),
        )
        .unwrap()
    }

    #[test]
    fn capacities() {
        let l = layout();
        assert_eq!(l.first_capacity().unwrap().to_u64(), Some(69));
        assert_eq!(l.other_capacity().unwrap().to_u64(), Some(29));
    }

    #[test]
    fn locate_boundaries() {
        let l = layout();
        assert_eq!(l.locate(&Bigint::zero()).unwrap(), (1, Bigint::from(30u64)));
        assert_eq!(
            l.locate(&Bigint::from(68u64)).unwrap(),
            (1, Bigint::from(98u64))
        );
        assert_eq!(
            l.locate(&Bigint::from(69u64)).unwrap(),
            (2, Bigint::from(20u64))
        );
        assert_eq!(
            l.locate(&Bigint::from(69u64 + 29)).unwrap(),
            (3, Bigint::from(20u64))
        );
    }

    #[test]
    fn bijection() {
        let l = layout();
        for off in 0..200u64 {
            let offset = Bigint::from(off);
            let (slice, pos) = l.locate(&offset).unwrap();
            assert_eq!(l.relocate(slice, &pos).unwrap(), offset, "offset {off}");
        }
    }

    #[test]
    fn too_small_rejected() {
        assert!(SliceLayout::new(
            Bigint::from(31u64),
            Bigint::from(50u64),
            Bigint::from(30u64),
            Bigint::from(20u64),
        )
        .is_err());
    }

    #[test]
    fn uniform_when_first_equals_other() {
        let l = SliceLayout::new(
            Bigint::from(50u64),
            Bigint::from(50u64),
            Bigint::from(20u64),
            Bigint::from(20u64),
        )
        .unwrap();
        assert_eq!(l.first_capacity().unwrap(), l.other_capacity().unwrap());
        let (slice, _) = l.locate(&Bigint::from(29u64)).unwrap();
        assert_eq!(slice, 2);
    }
}

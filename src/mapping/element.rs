//! Element types that may be read straight out of mapped bytes.

/// A type whose values can be read from arbitrary bytes.
///
/// # Safety
///
/// Implementors must have no padding, no invalid bit patterns and no
/// interior pointers: every byte sequence of `size_of::<Self>()` bytes must
/// be a valid value.
pub unsafe trait MappedElement: Copy + Send + Sync + 'static {}

macro_rules! mapped_element {
    ($($ty:ty),* $(,)?) => {
        $(
            // SAFETY: primitive numeric types accept every bit pattern.
            unsafe impl MappedElement for $ty {}
        )*
    };
}

mapped_element!(u8, i8, u16, i16, u32, i32, u64, i64, u128, i128, f32, f64);

// SAFETY: arrays have no padding between elements and inherit validity.
unsafe impl<T: MappedElement, const N: usize> MappedElement for [T; N] {}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_element<T: MappedElement>() {}

    #[test]
    fn test_primitives_and_arrays() {
        assert_element::<u8>();
        assert_element::<f64>();
        assert_element::<[u32; 4]>();
        assert_element::<[[f32; 3]; 2]>();
    }
}

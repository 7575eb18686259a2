use half::{bf16, f16};
use num_traits::Zero;

/// A value that can be stored in backend memory and moved between spaces
/// with a byte copy.
///
/// # Safety
///
/// The all-zero bit pattern must be a valid value of the type, and the type
/// must have no padding and no drop glue: backends hand out zeroed buffers
/// and transfers copy raw bytes.
pub unsafe trait Element: Copy + Send + Sync + Zero + 'static {}

macro_rules! impl_element {
    ($($e:ty),*) => {
        $(unsafe impl Element for $e {})*
    };
}

impl_element!(u8, u16, u32, u64, usize, i8, i16, i32, i64, isize, f32, f64);
impl_element!(f16, bf16);

#[cfg(test)]
mod tests {
    use super::*;

    fn zeroed<T: Element>() -> T {
        unsafe { std::mem::zeroed() }
    }

    #[test]
    fn test_zero_bits_is_zero() {
        assert_eq!(zeroed::<f32>(), f32::zero());
        assert_eq!(zeroed::<i64>(), 0);
        assert_eq!(zeroed::<f16>(), f16::zero());
        assert_eq!(zeroed::<bf16>(), bf16::zero());
    }
}

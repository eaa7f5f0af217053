//! Internal macros.
//!
//! `zerocopy_accessors!` generates getter and setter pairs for zerocopy
//! struct fields stored as big-endian wrapper types (`U32`), which is how
//! every on-disk page-number field in this crate is encoded.
//!
//! ```ignore
//! use zerocopy::big_endian::U32;
//!
//! #[repr(C)]
//! struct LeafPointers {
//!     parent: U32,
//!     left_sibling: U32,
//! }
//!
//! impl LeafPointers {
//!     zerocopy_accessors! {
//!         parent: u32,
//!         left_sibling: u32,
//!     }
//! }
//! ```

/// Generates getter and setter methods for zerocopy big-endian fields.
#[macro_export]
macro_rules! zerocopy_accessors {
    (@impl $field:ident, u32) => {
        ::paste::paste! {
            #[inline]
            pub fn $field(&self) -> u32 {
                self.$field.get()
            }

            #[inline]
            pub fn [<set_ $field>](&mut self, val: u32) {
                self.$field = ::zerocopy::big_endian::U32::new(val);
            }
        }
    };
    ($($field:ident : $ty:tt),* $(,)?) => {
        $(
            $crate::zerocopy_accessors!(@impl $field, $ty);
        )*
    };
}

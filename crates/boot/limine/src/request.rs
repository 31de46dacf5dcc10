//! Request structures for the Limine boot protocol.
//!
//! Every request follows the same pattern: construct it with `new()`, place
//! it in the `.requests` section with `#[used]` + `#[link_section]`, and read
//! the bootloader-filled response through `response()` after boot.

use core::cell::UnsafeCell;

use crate::response::{
    ExecutableAddressResponse, FramebufferResponse, HhdmResponse, MemMapResponse, ModuleResponse,
    RsdpResponse,
};

/// Generates a Limine request ID: the common magic pair plus two
/// request-specific words.
macro_rules! limine_id {
    ($part1:expr, $part2:expr) => {
        [
            0xc7b1_dd30_df4c_8b88_u64,
            0x0a82_e883_a194_f07b_u64,
            $part1,
            $part2,
        ]
    };
}

/// A response pointer slot, written exactly once by the bootloader before the
/// kernel gains control.
#[repr(transparent)]
struct ResponsePtr<T>(UnsafeCell<*const T>);

impl<T> ResponsePtr<T> {
    const fn null() -> Self {
        Self(UnsafeCell::new(core::ptr::null()))
    }

    /// Reads the response pointer.
    fn get(&self) -> Option<&T> {
        // SAFETY: The bootloader writes this slot before the kernel starts
        // and never mutates it afterwards, so reading it is race-free. A
        // non-null pointer references bootloader-reclaimable memory that
        // stays valid until the kernel recycles those regions.
        unsafe { (*self.0.get()).as_ref() }
    }
}

// SAFETY: Written only by the bootloader before kernel start, read-only after.
unsafe impl<T> Sync for ResponsePtr<T> {}

/// Marker placed at the start of the requests section.
///
/// Lets the bootloader bound its scan. If a start marker is used, an end
/// marker must be used too.
#[repr(C, align(8))]
pub struct RequestsStartMarker([u64; 4]);

impl RequestsStartMarker {
    /// The Limine ID of the start marker.
    pub const ID: [u64; 4] = [
        0xf6b8_f4b3_9de7_d1ae,
        0xfab9_1a69_40fc_b9cf,
        0x785c_6ed0_15d3_e316,
        0x181e_920a_7852_b9d9,
    ];

    /// Creates a new start marker.
    #[must_use]
    pub const fn new() -> Self {
        Self(Self::ID)
    }
}

impl Default for RequestsStartMarker {
    fn default() -> Self {
        Self::new()
    }
}

/// Marker placed at the end of the requests section.
#[repr(C, align(8))]
pub struct RequestsEndMarker([u64; 2]);

impl RequestsEndMarker {
    /// The Limine ID of the end marker.
    pub const ID: [u64; 2] = [0xadc0_e053_1bb1_0d03, 0x9572_709f_3176_4c62];

    /// Creates a new end marker.
    #[must_use]
    pub const fn new() -> Self {
        Self(Self::ID)
    }
}

impl Default for RequestsEndMarker {
    fn default() -> Self {
        Self::new()
    }
}

/// Declares the base revision of the protocol the kernel speaks.
///
/// The bootloader rewrites the revision word to 0 when it supports the
/// requested revision.
#[repr(C, align(8))]
pub struct BaseRevision(UnsafeCell<[u64; 3]>);

impl BaseRevision {
    /// The Limine ID of the base revision tag.
    pub const ID: [u64; 2] = [0xf956_2b2d_5c95_a6c8, 0x6a7b_3849_4453_6bdc];

    /// Creates a base revision tag for protocol revision 3.
    #[must_use]
    pub const fn new() -> Self {
        Self::with_revision(3)
    }

    /// Creates a base revision tag for the given revision.
    #[must_use]
    pub const fn with_revision(revision: u64) -> Self {
        Self(UnsafeCell::new([Self::ID[0], Self::ID[1], revision]))
    }

    /// Returns `true` if the bootloader acknowledged the revision.
    #[must_use]
    pub fn is_supported(&self) -> bool {
        // SAFETY: Written by the bootloader before the kernel starts, then
        // read-only.
        unsafe { (*self.0.get())[2] == 0 }
    }
}

// SAFETY: Bootloader-written before kernel start, read-only after.
unsafe impl Sync for BaseRevision {}

/// Expands to a request struct with the standard id/revision/response layout.
macro_rules! request_struct {
    ($(#[$doc:meta])* $name:ident, $response:ty, $id1:expr, $id2:expr) => {
        $(#[$doc])*
        #[repr(C, align(8))]
        pub struct $name {
            id: [u64; 4],
            revision: u64,
            response: ResponsePtr<$response>,
        }

        impl $name {
            /// The Limine ID of this request.
            pub const ID: [u64; 4] = limine_id!($id1, $id2);

            /// Creates a new request.
            #[must_use]
            pub const fn new() -> Self {
                Self {
                    id: Self::ID,
                    revision: 0,
                    response: ResponsePtr::null(),
                }
            }

            /// Returns the bootloader's response, if it provided one.
            #[must_use]
            pub fn response(&self) -> Option<&$response> {
                self.response.get()
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }
    };
}

request_struct!(
    /// Requests the physical memory map.
    MemMapRequest,
    MemMapResponse,
    0x67cf_3d9d_378a_806f,
    0xe304_acdf_c50c_3c62
);

request_struct!(
    /// Requests the Higher-Half Direct Map offset.
    HhdmRequest,
    HhdmResponse,
    0x48dc_f1cb_8ad2_b852,
    0x6398_4e95_9a98_244b
);

request_struct!(
    /// Requests the framebuffer list.
    FramebufferRequest,
    FramebufferResponse,
    0x9d58_27dc_d881_dd75,
    0xa314_8604_f6fa_b11b
);

request_struct!(
    /// Requests the physical and virtual base of the loaded kernel image.
    ExecutableAddressRequest,
    ExecutableAddressResponse,
    0x71ba_7686_3cc5_5f63,
    0xb264_4a48_c516_a487
);

request_struct!(
    /// Requests the ACPI RSDP address.
    RsdpRequest,
    RsdpResponse,
    0xc5e7_7b6b_397e_7b43,
    0x2763_7845_accd_cf3c
);

request_struct!(
    /// Requests the list of boot modules loaded alongside the kernel.
    ModuleRequest,
    ModuleResponse,
    0x3e7e_2797_02be_32af,
    0xca1c_4f3b_d128_0cee
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_layout() {
        // id (32) + revision (8) + response pointer (8).
        assert_eq!(core::mem::size_of::<MemMapRequest>(), 48);
        assert_eq!(core::mem::size_of::<HhdmRequest>(), 48);
    }

    #[test]
    fn ids_share_the_common_magic() {
        for id in [
            MemMapRequest::ID,
            HhdmRequest::ID,
            FramebufferRequest::ID,
            ExecutableAddressRequest::ID,
            RsdpRequest::ID,
            ModuleRequest::ID,
        ] {
            assert_eq!(id[0], 0xc7b1_dd30_df4c_8b88);
            assert_eq!(id[1], 0x0a82_e883_a194_f07b);
        }
    }

    #[test]
    fn no_response_before_boot() {
        let request = MemMapRequest::new();
        assert!(request.response().is_none());
    }

    #[test]
    fn base_revision_unacknowledged() {
        let rev = BaseRevision::new();
        assert!(!rev.is_supported());
    }
}

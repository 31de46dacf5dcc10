//! Limine boot protocol structures.
//!
//! Requests are static structures the kernel places in the `.requests` linker
//! section; the bootloader scans the section between the start and end
//! markers, recognizes requests by their 4-word IDs, and fills in the
//! response pointers before handing over control.
//!
//! ```ignore
//! #[used]
//! #[unsafe(link_section = ".requests")]
//! static MEMMAP: MemMapRequest = MemMapRequest::new();
//!
//! fn entry() {
//!     if let Some(response) = MEMMAP.response() {
//!         for entry in response.entries() { /* ... */ }
//!     }
//! }
//! ```

#![cfg_attr(not(test), no_std)]

pub mod file;
pub mod framebuffer;
pub mod memmap;
pub mod request;
pub mod response;

pub use request::{
    BaseRevision, ExecutableAddressRequest, FramebufferRequest, HhdmRequest, MemMapRequest,
    ModuleRequest, RequestsEndMarker, RequestsStartMarker, RsdpRequest,
};

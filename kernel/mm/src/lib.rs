//! Memory management for the Muon kernel.
//!
//! Three tightly coupled pieces: the reference-counted physical frame table
//! ([`pmm`]), the four-level page-table manager with copy-on-write cloning
//! ([`mapper`], [`space`]), and the linked-list kernel heap ([`heap`]).
//!
//! Everything here is expressed over an HHDM offset and a [`FrameSource`],
//! so the same code runs against real physical memory in the kernel and
//! against page-aligned host buffers in the test suite.

#![cfg_attr(not(test), no_std)]

pub mod heap;
pub mod mapper;
pub mod pmm;
pub mod space;

pub use mapper::{MapError, PageTableMapper};
pub use pmm::{FrameSource, FrameTable};
pub use space::AddressSpace;

//! Limine protocol requests, placed in the `.requests` section for the
//! bootloader to find.

use limine::{
    BaseRevision, ExecutableAddressRequest, FramebufferRequest, HhdmRequest, MemMapRequest,
    ModuleRequest, RequestsEndMarker, RequestsStartMarker, RsdpRequest,
};

/// Every request the kernel makes, bracketed by the scan markers.
#[repr(C)]
pub struct LimineRequests {
    _start_marker: RequestsStartMarker,
    pub base_revision: BaseRevision,
    pub memmap: MemMapRequest,
    pub hhdm: HhdmRequest,
    pub executable_address: ExecutableAddressRequest,
    pub framebuffer: FramebufferRequest,
    pub rsdp: RsdpRequest,
    pub modules: ModuleRequest,
    _end_marker: RequestsEndMarker,
}

impl LimineRequests {
    const fn new() -> Self {
        Self {
            _start_marker: RequestsStartMarker::new(),
            base_revision: BaseRevision::new(),
            memmap: MemMapRequest::new(),
            hhdm: HhdmRequest::new(),
            executable_address: ExecutableAddressRequest::new(),
            framebuffer: FramebufferRequest::new(),
            rsdp: RsdpRequest::new(),
            modules: ModuleRequest::new(),
            _end_marker: RequestsEndMarker::new(),
        }
    }
}

#[used]
#[unsafe(link_section = ".requests")]
pub static REQUESTS: LimineRequests = LimineRequests::new();

//! Limine boot stub for the Muon kernel.
//!
//! Declares the protocol requests, brings up the early serial logger,
//! translates the bootloader's responses into the kernel's canonical
//! [`BootInfoData`], and hands over to
//! [`kernel_init`](muon_kernel::kernel_init).

#![no_std]
#![no_main]

mod requests;

use muon_kernel::addr::{PhysAddr, VirtAddr};
use muon_kernel::boot::{
    BootInfoData, FramebufferInfo, KernelAddressInfo, MemoryRegion, MemoryRegionKind, ModuleInfo,
};
use muon_kernel::{kfatal, kinfo};
use planck_noalloc::vec::ArrayVec;

use limine::memmap::EntryType;

use requests::REQUESTS;

unsafe extern "C" {
    static __kernel_start: u8;
    static __kernel_end: u8;
}

fn halt() -> ! {
    loop {
        // SAFETY: Halting with interrupts off is the terminal state.
        unsafe {
            core::arch::asm!("cli; hlt", options(nomem, nostack));
        }
    }
}

fn region_kind(entry_type: EntryType) -> MemoryRegionKind {
    match entry_type {
        EntryType::USABLE => MemoryRegionKind::Usable,
        EntryType::ACPI_RECLAIMABLE => MemoryRegionKind::AcpiReclaimable,
        EntryType::ACPI_NVS => MemoryRegionKind::AcpiNvs,
        EntryType::BAD_MEMORY => MemoryRegionKind::BadMemory,
        EntryType::BOOTLOADER_RECLAIMABLE => MemoryRegionKind::BootloaderReclaimable,
        EntryType::EXECUTABLE_AND_MODULES => MemoryRegionKind::KernelAndModules,
        EntryType::FRAMEBUFFER => MemoryRegionKind::Framebuffer,
        _ => MemoryRegionKind::Reserved,
    }
}

/// Limine entry point: responses are filled in before we run.
#[unsafe(no_mangle)]
extern "C" fn _start() -> ! {
    muon_kernel::log::init_early_serial();

    if !REQUESTS.base_revision.is_supported() {
        kfatal!("limine: base revision not supported");
        halt();
    }
    kinfo!("limine: booting Muon");

    let Some(hhdm) = REQUESTS.hhdm.response() else {
        kfatal!("limine: no HHDM response");
        halt();
    };
    let Some(memmap) = REQUESTS.memmap.response() else {
        kfatal!("limine: no memory map response");
        halt();
    };
    let Some(exec_addr) = REQUESTS.executable_address.response() else {
        kfatal!("limine: no executable address response");
        halt();
    };

    let mut memory_map = ArrayVec::new();
    for entry in memmap.entries() {
        if memory_map.is_full() {
            break;
        }
        memory_map.push(MemoryRegion {
            start: PhysAddr::new_truncate(entry.base),
            size: entry.length,
            kind: region_kind(entry.entry_type),
        });
    }

    let framebuffer = REQUESTS
        .framebuffer
        .response()
        .and_then(|response| response.framebuffers().next())
        .map(|fb| FramebufferInfo {
            address: VirtAddr::new_truncate(fb.address() as u64),
            width: fb.width() as u32,
            height: fb.height() as u32,
            pitch: fb.pitch() as u32,
            bpp: fb.bpp(),
        });

    let rsdp_address = REQUESTS
        .rsdp
        .response()
        .map(|response| PhysAddr::new_truncate(response.address()));

    let hhdm_offset = hhdm.offset();
    let mut modules = ArrayVec::new();
    if let Some(response) = REQUESTS.modules.response() {
        for module in response.modules() {
            if modules.is_full() {
                break;
            }
            // Module addresses are HHDM virtual; the kernel wants physical.
            let phys = (module.address() as u64).wrapping_sub(hhdm_offset);
            modules.push(ModuleInfo {
                phys_addr: PhysAddr::new_truncate(phys),
                size: module.size(),
            });
        }
    }

    // SAFETY: The linker script defines both symbols around the image.
    let kernel_size = unsafe {
        (&__kernel_end as *const u8 as u64) - (&__kernel_start as *const u8 as u64)
    };

    let boot_info = BootInfoData {
        memory_map,
        hhdm_offset,
        kernel_address: KernelAddressInfo {
            physical_base: PhysAddr::new_truncate(exec_addr.physical_base()),
            virtual_base: VirtAddr::new_truncate(exec_addr.virtual_base()),
        },
        kernel_size,
        framebuffer,
        rsdp_address,
        modules,
    };

    muon_kernel::kernel_init(&boot_info)
}

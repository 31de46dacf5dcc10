//! Bootloader-agnostic boot information and the kernel entry point.
//!
//! The boot stub converts its protocol's native structures into these
//! canonical types and calls [`kernel_init`]. Static dispatch over the
//! [`BootInfo`] trait keeps the kernel free of protocol details.

use alloc::sync::Arc;

use muon_core::addr::{PhysAddr, VirtAddr};
use muon_core::arch::x86_64::interrupts;
use muon_core::{kinfo, kwarn};
use planck_noalloc::vec::ArrayVec;

use crate::{drivers, fs, mm, proc, sched, time};

/// The kind of a physical memory region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryRegionKind {
    /// Normal usable RAM.
    Usable,
    /// Reserved by firmware or hardware.
    Reserved,
    /// ACPI tables, reclaimable after parsing.
    AcpiReclaimable,
    /// ACPI non-volatile storage.
    AcpiNvs,
    /// Defective memory.
    BadMemory,
    /// Bootloader-owned, reclaimable after boot structures are consumed.
    BootloaderReclaimable,
    /// The kernel image and boot modules.
    KernelAndModules,
    /// Memory-mapped framebuffer.
    Framebuffer,
}

/// A contiguous physical memory region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    /// Physical start address.
    pub start: PhysAddr,
    /// Size in bytes.
    pub size: u64,
    /// Region kind.
    pub kind: MemoryRegionKind,
}

/// Physical and virtual base of the loaded kernel image.
#[derive(Debug, Clone, Copy)]
pub struct KernelAddressInfo {
    /// Physical base address.
    pub physical_base: PhysAddr,
    /// Virtual base address (the link address).
    pub virtual_base: VirtAddr,
}

/// A linear framebuffer handed over by the bootloader.
#[derive(Debug, Clone, Copy)]
pub struct FramebufferInfo {
    /// Virtual (HHDM) address of the pixel buffer.
    pub address: VirtAddr,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Bytes per scanline.
    pub pitch: u32,
    /// Bits per pixel.
    pub bpp: u16,
}

/// A boot module (the shell binary, a disk image).
#[derive(Debug, Clone, Copy)]
pub struct ModuleInfo {
    /// Physical address of the module contents.
    pub phys_addr: PhysAddr,
    /// Size in bytes.
    pub size: u64,
}

/// Maximum memory regions the kernel records.
pub const MAX_MEMORY_REGIONS: usize = 128;

/// Maximum boot modules the kernel records.
pub const MAX_MODULES: usize = 8;

/// Bootloader-agnostic boot information.
pub trait BootInfo {
    /// Physical memory map, sorted by base address.
    fn memory_map(&self) -> &[MemoryRegion];

    /// HHDM offset: `virt = phys + hhdm_offset()`.
    fn hhdm_offset(&self) -> u64;

    /// Kernel load addresses.
    fn kernel_address(&self) -> KernelAddressInfo;

    /// Size of the loaded kernel image in bytes.
    fn kernel_size(&self) -> u64;

    /// The primary framebuffer, if any.
    fn framebuffer(&self) -> Option<FramebufferInfo>;

    /// ACPI RSDP physical address, if provided.
    fn rsdp_address(&self) -> Option<PhysAddr>;

    /// Boot modules in load order.
    fn modules(&self) -> &[ModuleInfo];
}

/// Concrete container populated by a boot stub.
pub struct BootInfoData {
    /// Physical memory map.
    pub memory_map: ArrayVec<MemoryRegion, MAX_MEMORY_REGIONS>,
    /// HHDM offset.
    pub hhdm_offset: u64,
    /// Kernel load addresses.
    pub kernel_address: KernelAddressInfo,
    /// Kernel image size in bytes.
    pub kernel_size: u64,
    /// Primary framebuffer.
    pub framebuffer: Option<FramebufferInfo>,
    /// ACPI RSDP address.
    pub rsdp_address: Option<PhysAddr>,
    /// Boot modules.
    pub modules: ArrayVec<ModuleInfo, MAX_MODULES>,
}

impl BootInfo for BootInfoData {
    fn memory_map(&self) -> &[MemoryRegion] {
        self.memory_map.as_slice()
    }

    fn hhdm_offset(&self) -> u64 {
        self.hhdm_offset
    }

    fn kernel_address(&self) -> KernelAddressInfo {
        self.kernel_address
    }

    fn kernel_size(&self) -> u64 {
        self.kernel_size
    }

    fn framebuffer(&self) -> Option<FramebufferInfo> {
        self.framebuffer
    }

    fn rsdp_address(&self) -> Option<PhysAddr> {
        self.rsdp_address
    }

    fn modules(&self) -> &[ModuleInfo] {
        self.modules.as_slice()
    }
}

/// Path the first user program is loaded from.
const SHELL_PATH: &str = "/bin/shell";

/// Kernel entry point, called by the boot stub with the serial logger
/// already running.
///
/// Brings up memory, interrupts, the syscall boundary, and the
/// filesystems; stages the boot modules; spawns the first user task; arms
/// the scheduler; and parks as the idle context.
pub fn kernel_init(boot_info: &impl BootInfo) -> ! {
    kinfo!("muon: booting");

    // 1. CPU enforcement bits, segments, and the TSS.
    // SAFETY: Single-threaded boot, before the kernel's own tables exist.
    unsafe { crate::arch::x86_64::cpu::enable_features() };
    crate::arch::x86_64::gdt::init();

    // 2. Memory: direct map, frame table, master page tables, heap.
    mm::hhdm::init(boot_info.hhdm_offset());
    kinfo!("hhdm: offset {:#x}", boot_info.hhdm_offset());
    mm::pmm::init(boot_info);
    mm::vmm::init(boot_info);
    mm::heap::init();

    // 3. Interrupt plumbing (still masked).
    // SAFETY: GDT is loaded; handlers are built for these vectors.
    unsafe { crate::arch::x86_64::idt::init() };
    drivers::pic::init();
    drivers::pit::init(time::TICK_HZ);
    drivers::keyboard::init();

    // 4. Ring-3 entry.
    // SAFETY: The GDT carries the selector layout STAR encodes.
    unsafe { crate::arch::x86_64::syscall::init() };

    if let Some(fb) = boot_info.framebuffer() {
        kinfo!(
            "framebuffer: {}x{} ({} bpp) at {}",
            fb.width,
            fb.height,
            fb.bpp,
            fb.address
        );
    }
    if let Some(rsdp) = boot_info.rsdp_address() {
        kinfo!("acpi: RSDP at {rsdp}");
    }

    // 5. Filesystems and boot modules: module 0 is the shell binary,
    //    module 1 (optional) a disk image served as /dev/disk0.
    fs::init();
    stage_modules(boot_info);

    // 6. First user task.
    if proc::spawn_user_elf(SHELL_PATH).is_err() {
        panic!("no {SHELL_PATH} to run");
    }

    // 7. Preemption on; the next tick switches into the shell.
    sched::enable();
    // SAFETY: IDT, PIC, and PIT are programmed.
    unsafe { interrupts::enable() };
    kinfo!("muon: up, entering idle");

    // The boot context becomes the idle loop; it is not a task and is
    // abandoned by the first switch.
    loop {
        interrupts::hlt();
    }
}

/// Copies the shell module into the VFS and registers a disk-image module
/// as a block device.
fn stage_modules(boot_info: &impl BootInfo) {
    let mut modules = boot_info.modules().iter();

    match modules.next() {
        Some(shell) => {
            let virt = mm::hhdm::phys_to_virt(shell.phys_addr);
            // SAFETY: The module region is HHDM-mapped and never reclaimed
            // (kernel-and-modules).
            let data = unsafe {
                core::slice::from_raw_parts(virt.as_ptr::<u8>(), shell.size as usize)
            };
            match fs::write_file(SHELL_PATH, data) {
                Ok(()) => kinfo!("boot: staged {SHELL_PATH} ({} bytes)", shell.size),
                Err(e) => kwarn!("boot: cannot stage {SHELL_PATH}: {e}"),
            }
        }
        None => kwarn!("boot: no shell module"),
    }

    if let Some(disk) = modules.next() {
        let virt = mm::hhdm::phys_to_virt(disk.phys_addr);
        // SAFETY: Module memory stays mapped and exclusively ours.
        let ramdisk = unsafe {
            drivers::ramdisk::RamDisk::new(virt.as_mut_ptr::<u8>(), disk.size as usize)
        };
        fs::register_disk("disk0", Arc::new(ramdisk));
    }
}

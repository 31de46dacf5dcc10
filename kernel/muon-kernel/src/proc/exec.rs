//! ELF program loading and the `exec` image replacement.

use core::ptr;
use core::sync::atomic::Ordering;

use muon_core::addr::VirtAddr;
use muon_core::arch::x86_64::control::Cr3;
use muon_core::kerr;
use muon_core::paging::{PageTableFlags, PAGE_SIZE};
use muon_elf::ElfImage;
use muon_mm::{AddressSpace, FrameSource};

use crate::arch::x86_64::context::jump_to_userspace;
use crate::mm::{pmm, vmm};
use crate::{fs, proc};

/// Loads every `PT_LOAD` segment of `image` into `space`.
///
/// Pages are allocated zeroed and mapped user-writable, file bytes are
/// copied through the HHDM, and the BSS tail stays zero from allocation.
/// Returns the entry point.
///
/// The space must be fresh or exclusively owned; on failure the caller
/// destroys it (mapped frames are owned by the space and rebalance there).
pub fn load_image(space: &AddressSpace, image: &ElfImage<'_>) -> Result<u64, ()> {
    let frames = pmm::frames();
    let mapper = vmm::mapper();
    let root = space.root_phys();

    for segment in image.load_segments() {
        let vaddr = segment.p_vaddr;
        let aligned = vaddr & !(PAGE_SIZE as u64 - 1);
        let span = (vaddr - aligned) + segment.p_memsz;
        let pages = span.div_ceil(PAGE_SIZE as u64);

        for page in 0..pages {
            let virt = VirtAddr::new_truncate(aligned + page * PAGE_SIZE as u64);
            // Segments may share a page; keep the first mapping.
            // SAFETY: The root is exclusively ours while loading.
            if unsafe { mapper.translate(root, virt) }.is_some() {
                continue;
            }
            let Some(frame) = frames.request_frame() else {
                kerr!("exec: out of frames loading a segment");
                return Err(());
            };
            // SAFETY: Fresh frame, HHDM-reachable.
            unsafe {
                ptr::write_bytes(mapper.phys_to_virt(frame.start_address()), 0, PAGE_SIZE);
                if mapper
                    .map_4k(
                        root,
                        virt,
                        frame.start_address(),
                        PageTableFlags::PRESENT
                            | PageTableFlags::WRITABLE
                            | PageTableFlags::USER,
                        frames,
                    )
                    .is_err()
                {
                    frames.unref_frame(frame);
                    kerr!("exec: out of frames mapping a segment");
                    return Err(());
                }
            }
            // A freshly built space cannot carry copy-on-write leaves.
            debug_assert!(
                // SAFETY: Just mapped above.
                unsafe { mapper.pte_of(root, virt) }
                    .is_some_and(|pte| !pte.flags().contains(PageTableFlags::COW))
            );
        }

        // Copy the file-backed bytes page by page through the HHDM.
        let bytes = image.segment_bytes(&segment).map_err(|_| {
            kerr!("exec: segment data out of bounds");
        })?;
        let mut copied = 0usize;
        while copied < bytes.len() {
            let dst_virt = VirtAddr::new_truncate(vaddr + copied as u64);
            let page_offset = dst_virt.page_offset() as usize;
            let chunk = (PAGE_SIZE - page_offset).min(bytes.len() - copied);

            // SAFETY: All pages of the segment were mapped above.
            let Some(phys) = (unsafe { mapper.translate(root, dst_virt) }) else {
                kerr!("exec: segment page vanished at {dst_virt}");
                return Err(());
            };
            // SAFETY: HHDM-reachable destination of at least `chunk` bytes.
            unsafe {
                ptr::copy_nonoverlapping(
                    bytes.as_ptr().add(copied),
                    mapper.phys_to_virt(phys),
                    chunk,
                );
            }
            copied += chunk;
        }
    }

    Ok(image.entry())
}

/// Replaces the current task's image with the ELF at `path`.
///
/// On success control transfers to the new entry point in ring 3 and this
/// function does not return. Any failure leaves the old image untouched
/// and returns -1.
pub fn exec(path: &str) -> i64 {
    let Ok(data) = fs::read_file(path) else {
        kerr!("exec: cannot read {path}");
        return -1;
    };
    let Ok(image) = ElfImage::parse(&data) else {
        kerr!("exec: {path} is not a loadable ELF");
        return -1;
    };

    let frames = pmm::frames();
    let mapper = vmm::mapper();
    let task = proc::current();

    // Build the replacement space fully before touching the task.
    // SAFETY: The master root is live.
    let Some(new_space) = (unsafe { AddressSpace::new_user(&mapper, frames, vmm::kernel_root()) })
    else {
        kerr!("exec: out of frames for the address space");
        return -1;
    };
    let entry = match load_image(&new_space, &image) {
        Ok(entry) => entry,
        Err(()) => {
            // SAFETY: Never installed in CR3.
            unsafe { new_space.destroy(&mapper, frames) };
            return -1;
        }
    };

    // Carry the user stack page over: map it into the new space and wipe
    // it for the fresh image.
    let Some(stack) = *task.user_stack.lock() else {
        kerr!("exec: task {} has no user stack", task.pid);
        // SAFETY: Never installed in CR3.
        unsafe { new_space.destroy(&mapper, frames) };
        return -1;
    };
    // SAFETY: The stack frame is owned by the task and HHDM-reachable.
    unsafe {
        if mapper
            .map_4k(
                new_space.root_phys(),
                stack.virt_base,
                stack.frame.start_address(),
                PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::USER,
                frames,
            )
            .is_err()
        {
            new_space.destroy(&mapper, frames);
            kerr!("exec: out of frames mapping the user stack");
            return -1;
        }
        ptr::write_bytes(mapper.phys_to_virt(stack.frame.start_address()), 0, PAGE_SIZE);
    }

    // Point of no return: swap the spaces, install the new root, tear the
    // old tree down. The stack frame gets an extra reference so the old
    // tree's unref leaves it alive for the new mapping.
    frames.ref_frame(stack.frame);
    let old_space = task.space.lock().replace(new_space);
    task.entry.store(entry, Ordering::Release);

    let new_root = task
        .space
        .lock()
        .as_ref()
        .map(|s| s.root_phys())
        .expect("space just installed");
    // SAFETY: The new root shares the kernel upper half; the kernel keeps
    // running across the switch.
    unsafe { Cr3::write(new_root) };

    if let Some(old) = old_space {
        // SAFETY: No longer in CR3.
        unsafe { old.destroy(&mapper, frames) };
    }

    // This frame is abandoned by the ring-3 jump; release what it owns.
    drop(task);
    drop(data);
    let user_rsp = stack.initial_rsp();
    // SAFETY: Entry and stack are mapped user-accessible in the live root.
    unsafe { jump_to_userspace(entry, user_rsp) }
}

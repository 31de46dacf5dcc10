//! Framebuffer description provided by the bootloader.

/// A linear framebuffer, already mapped into the HHDM.
#[repr(C)]
pub struct Framebuffer {
    address: *mut u8,
    width: u64,
    height: u64,
    pitch: u64,
    bpp: u16,
    memory_model: u8,
    red_mask_size: u8,
    red_mask_shift: u8,
    green_mask_size: u8,
    green_mask_shift: u8,
    blue_mask_size: u8,
    blue_mask_shift: u8,
    _unused: [u8; 7],
    edid_size: u64,
    edid: *const u8,
}

impl Framebuffer {
    /// Virtual address of the first pixel.
    #[must_use]
    pub fn address(&self) -> *mut u8 {
        self.address
    }

    /// Width in pixels.
    #[must_use]
    pub fn width(&self) -> u64 {
        self.width
    }

    /// Height in pixels.
    #[must_use]
    pub fn height(&self) -> u64 {
        self.height
    }

    /// Bytes per scanline.
    #[must_use]
    pub fn pitch(&self) -> u64 {
        self.pitch
    }

    /// Bits per pixel.
    #[must_use]
    pub fn bpp(&self) -> u16 {
        self.bpp
    }

    /// Bit position of the red channel (from LSB).
    #[must_use]
    pub fn red_mask_shift(&self) -> u8 {
        self.red_mask_shift
    }

    /// Bit position of the green channel (from LSB).
    #[must_use]
    pub fn green_mask_shift(&self) -> u8 {
        self.green_mask_shift
    }

    /// Bit position of the blue channel (from LSB).
    #[must_use]
    pub fn blue_mask_shift(&self) -> u8 {
        self.blue_mask_shift
    }
}

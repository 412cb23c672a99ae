use core::ptr::NonNull;

pub const PAGE_SHIFT: usize = 12;
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

bitflags! {
    /// Page allocation flags, as understood by the page provider.
    pub struct PageFlags: u32 {
        /// Zero the page before handing it out.
        const ZERO = 1 << 0;
        /// Take the page from the user pool instead of the kernel pool.
        const USER = 1 << 1;
    }
}

/// Supplier of whole, naturally aligned pages.
///
/// The heap sits on top of one of these. Pages handed out by `get_page`
/// are `PAGE_SIZE` bytes and `PAGE_SIZE`-aligned.
pub trait PageProvider {
    /// Returns one page, or `None` when the provider is exhausted.
    fn get_page(&self, flags: PageFlags) -> Option<NonNull<u8>>;

    /// Returns a page to the provider.
    ///
    /// # Safety
    ///
    /// `page` must have been obtained from `get_page` on the same provider
    /// and must not be used after this call.
    unsafe fn free_page(&self, page: NonNull<u8>);
}

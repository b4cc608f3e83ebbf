//! Branch-free selection.
//!
//! Anything that runs between two single-steps shows up in the next cycle
//! count, so conditional updates in the handler go through [`select`]
//! instead of an `if`. This is the only place where that trick lives.

/// Return `b` if `mask` is set, otherwise return `a`.
///
/// On x86_64 this is a `TEST`/`CMOVNZ` pair, which executes in the same
/// amount of time for either outcome.
#[cfg(target_arch = "x86_64")]
#[inline(always)]
pub fn select(mask: bool, a: usize, b: usize) -> usize {
    let mut res = a;
    unsafe {
        core::arch::asm!(
            "test {m}, {m}",
            "cmovnz {r}, {b}",
            m = in(reg_byte) mask as u8,
            b = in(reg) b,
            r = inout(reg) res,
            options(pure, nomem, nostack),
        );
    }
    res
}

/// Return `b` if `mask` is set, otherwise return `a`.
#[cfg(not(target_arch = "x86_64"))]
#[inline(always)]
pub fn select(mask: bool, a: usize, b: usize) -> usize {
    // Keep the compiler from turning the mask back into a branch
    let m = 0usize.wrapping_sub(core::hint::black_box(mask as usize));
    a ^ ((a ^ b) & m)
}

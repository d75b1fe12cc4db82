use crate::types::HookError;

/// A page-granular region that is written while RW and then flipped to RX.
#[derive(Debug)]
pub struct CodeSlice {
    pub data: *mut u8,
    pub size: usize,
}

unsafe impl Send for CodeSlice {}
unsafe impl Sync for CodeSlice {}

#[derive(Debug)]
pub struct CodeAllocator {
    slab_size: usize,
}

impl Default for CodeAllocator {
    fn default() -> Self {
        Self { slab_size: 4096 }
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// Parse `/proc/self/maps` into sorted `[start, end)` ranges.
#[cfg(any(target_os = "linux", target_os = "android"))]
fn mapped_regions() -> Vec<(usize, usize)> {
    let Ok(maps) = std::fs::read_to_string("/proc/self/maps") else {
        return Vec::new();
    };
    let mut regions: Vec<(usize, usize)> = maps
        .lines()
        .filter_map(|line| {
            let range = line.split_whitespace().next()?;
            let (start, end) = range.split_once('-')?;
            Some((
                usize::from_str_radix(start, 16).ok()?,
                usize::from_str_radix(end, 16).ok()?,
            ))
        })
        .collect();
    regions.sort_unstable_by_key(|&(s, _)| s);
    regions
}

impl CodeAllocator {
    /// Allocate a RW slab within `max_distance` of `near`.
    ///
    /// Free gaps are found from `/proc/self/maps`; the candidate is passed to
    /// `mmap` as a hint and the result is checked, since `MAP_FIXED_NOREPLACE`
    /// is not available on every Android kernel.
    #[cfg(any(target_os = "linux", target_os = "android"))]
    pub fn alloc_near(&mut self, near: *const u8, max_distance: usize) -> Result<CodeSlice, HookError> {
        let near_u = near as usize;
        let page_sz = page_size();
        let need = self.slab_size;
        let win_start = near_u.saturating_sub(max_distance) & !(page_sz - 1);
        let win_end = near_u.saturating_add(max_distance) & !(page_sz - 1);

        let mut gaps = Vec::new();
        let mut prev_end = win_start;
        for (start, end) in mapped_regions() {
            if start > win_end {
                break;
            }
            if start > prev_end {
                gaps.push((prev_end, start.min(win_end)));
            }
            prev_end = prev_end.max(end);
        }
        if prev_end < win_end {
            gaps.push((prev_end, win_end));
        }

        for (gap_start, gap_end) in gaps {
            if gap_end <= gap_start || gap_end - gap_start < need {
                continue;
            }
            let candidate = near_u.clamp(gap_start, gap_end - need) & !(page_sz - 1);
            let ptr = unsafe {
                libc::mmap(
                    candidate as *mut libc::c_void,
                    need,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                    -1,
                    0,
                )
            };
            if ptr == libc::MAP_FAILED {
                continue;
            }
            if (ptr as usize).abs_diff(near_u) <= max_distance {
                return Ok(CodeSlice {
                    data: ptr as *mut u8,
                    size: need,
                });
            }
            unsafe {
                libc::munmap(ptr, need);
            }
        }

        Err(HookError::AllocationFailed)
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    pub fn alloc_near(&mut self, _near: *const u8, _max_distance: usize) -> Result<CodeSlice, HookError> {
        Err(HookError::Unsupported)
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    pub fn alloc_any(&mut self) -> Result<CodeSlice, HookError> {
        let ptr = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                self.slab_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(HookError::AllocationFailed);
        }
        Ok(CodeSlice {
            data: ptr as *mut u8,
            size: self.slab_size,
        })
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    pub fn alloc_any(&mut self) -> Result<CodeSlice, HookError> {
        Err(HookError::Unsupported)
    }

    /// Flip a slab from RW to RX.
    ///
    /// # Safety
    /// `slice` must come from this allocator and no longer be written to.
    #[cfg(any(target_os = "linux", target_os = "android"))]
    pub unsafe fn make_executable(&self, slice: &CodeSlice) -> Result<(), HookError> {
        if libc::mprotect(
            slice.data as *mut libc::c_void,
            slice.size,
            libc::PROT_READ | libc::PROT_EXEC,
        ) != 0
        {
            return Err(HookError::ProtectionFailed);
        }
        Ok(())
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    pub unsafe fn make_executable(&self, _slice: &CodeSlice) -> Result<(), HookError> {
        Err(HookError::Unsupported)
    }
}

#[cfg(all(test, any(target_os = "linux", target_os = "android")))]
mod tests {
    use super::*;

    #[test]
    fn alloc_any_returns_executable_page() {
        let mut alloc = CodeAllocator::default();
        let slice = alloc.alloc_any().expect("alloc");
        unsafe {
            slice.data.write(0xC3); // ret
            alloc.make_executable(&slice).expect("protect");
        }
        #[cfg(target_arch = "x86_64")]
        unsafe {
            let f: extern "C" fn() = core::mem::transmute(slice.data);
            f();
        }
    }

    #[test]
    fn alloc_near_returns_within_range() {
        let mut alloc = CodeAllocator::default();
        let near = alloc_near_returns_within_range as *const u8;
        let max_distance = 1024 * 1024 * 1024;
        let slice = alloc.alloc_near(near, max_distance).expect("alloc_near");
        assert!((slice.data as usize).abs_diff(near as usize) <= max_distance);
    }

    #[test]
    fn maps_are_sorted_and_non_empty() {
        let regions = mapped_regions();
        assert!(!regions.is_empty());
        assert!(regions.windows(2).all(|w| w[0].0 <= w[1].0));
    }
}

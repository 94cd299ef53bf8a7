// Abstract over the system virtual-memory functions.
//
// This is the only module that talks to the operating system. Everything
// the pool ever hands out -- reserve chunks and large passthrough
// allocations alike -- originates from `vendor::sys_alloc` here, and only
// large passthrough allocations are ever given back via
// `vendor::sys_dealloc`. Reserve memory stays with the pool for the life
// of the process.

#[derive(Debug)]
pub struct AllocFailed;

impl std::error::Error for AllocFailed {}

use std::fmt;
impl fmt::Display for AllocFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "system allocation failed")
    }
}

pub fn sys_alloc(nbytes: usize) -> Result<*mut u8, AllocFailed> {
    debug_assert!(nbytes > 0);

    let p = vendor::sys_alloc(nbytes)?;
    debug_assert!(!p.is_null());
    // Every platform below returns page-aligned memory, which is far more
    // aligned than the pool's 8-byte grid needs.
    debug_assert!(p.addr() % crate::ALIGN == 0);

    Ok(p)
}

pub fn sys_dealloc(p: *mut u8, nbytes: usize) {
    debug_assert!(!p.is_null());
    debug_assert!(nbytes > 0);

    vendor::sys_dealloc(p, nbytes)
}

#[cfg(target_os = "linux")]
pub mod vendor {
    pub const PAGE_SIZE: usize = 4096;

    use crate::platformalloc::AllocFailed;
    use rustix::mm::{mmap_anonymous, munmap, MapFlags, ProtFlags};
    use std::ffi::c_void;
    use std::ptr;

    pub fn sys_alloc(reqsize: usize) -> Result<*mut u8, AllocFailed> {
        match unsafe {
            mmap_anonymous(
                ptr::null_mut(),
                reqsize,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::PRIVATE | MapFlags::NORESERVE,
            )
        } {
            Ok(p) => Ok(p as *mut u8),
            Err(_) => Err(AllocFailed),
        }
    }

    pub fn sys_dealloc(p: *mut u8, size: usize) {
        unsafe {
            munmap(p as *mut c_void, size).ok();
        }
    }
}

#[cfg(target_vendor = "apple")]
pub mod vendor {
    pub const PAGE_SIZE: usize = 16384;

    use crate::platformalloc::AllocFailed;
    use mach_sys::kern_return::KERN_SUCCESS;
    use mach_sys::port::mach_port_t;
    use mach_sys::traps::mach_task_self;
    use mach_sys::vm::{mach_vm_allocate, mach_vm_deallocate};
    use mach_sys::vm_statistics::VM_FLAGS_ANYWHERE;
    use mach_sys::vm_types::{mach_vm_address_t, mach_vm_size_t};

    pub fn sys_alloc(reqsize: usize) -> Result<*mut u8, AllocFailed> {
        let task: mach_port_t = unsafe { mach_task_self() };
        let mut address: mach_vm_address_t = 0;
        let size: mach_vm_size_t = reqsize as mach_vm_size_t;

        let retval = unsafe { mach_vm_allocate(task, &mut address, size, VM_FLAGS_ANYWHERE) };
        if retval == KERN_SUCCESS {
            Ok(address as *mut u8)
        } else {
            Err(AllocFailed)
        }
    }

    pub fn sys_dealloc(p: *mut u8, size: usize) {
        unsafe {
            let retval = mach_vm_deallocate(mach_task_self(), p.addr() as u64, size as u64);
            debug_assert!(retval == KERN_SUCCESS);
        }
    }
}

#[cfg(target_os = "windows")]
pub mod vendor {
    pub const PAGE_SIZE: usize = 4096;

    use crate::platformalloc::AllocFailed;
    use std::ffi::c_void;
    use std::ptr;
    use windows_sys::Win32::System::Memory::{
        VirtualAlloc, VirtualFree, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_READWRITE,
    };

    pub fn sys_alloc(reqsize: usize) -> Result<*mut u8, AllocFailed> {
        let p =
            unsafe { VirtualAlloc(ptr::null(), reqsize, MEM_RESERVE | MEM_COMMIT, PAGE_READWRITE) };

        if !p.is_null() {
            Ok(p as *mut u8)
        } else {
            Err(AllocFailed)
        }
    }

    pub fn sys_dealloc(p: *mut u8, _size: usize) {
        // MEM_RELEASE wants a zero size and frees the whole reservation.
        unsafe {
            VirtualFree(p as *mut c_void, 0, MEM_RELEASE);
        }
    }
}

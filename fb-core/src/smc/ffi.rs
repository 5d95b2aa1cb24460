//! IOKit transport for the controller driver

use fb_error::{FanbridgeError, Result};

use super::{SmcParamBlock, SmcTransport};

#[cfg(target_os = "macos")]
mod imp {
    use std::ffi::{c_char, c_void, CStr, CString};
    use std::mem;

    use core_foundation_sys::dictionary::{CFDictionaryRef, CFMutableDictionaryRef};
    use mach2::kern_return::{kern_return_t, KERN_SUCCESS};
    use mach2::port::{mach_port_t, MACH_PORT_NULL};
    use mach2::traps::mach_task_self;
    use tracing::{debug, warn};

    use super::{FanbridgeError, Result, SmcParamBlock, SmcTransport};
    use crate::constants::driver;

    #[allow(non_camel_case_types)]
    type io_object_t = mach_port_t;
    #[allow(non_camel_case_types)]
    type io_connect_t = mach_port_t;
    #[allow(non_camel_case_types)]
    type io_iterator_t = mach_port_t;

    const KIO_RETURN_NOT_PRIVILEGED: kern_return_t = -536_870_174;

    #[link(name = "IOKit", kind = "framework")]
    extern "C" {
        fn IOServiceMatching(name: *const c_char) -> CFMutableDictionaryRef;
        fn IOServiceGetMatchingServices(
            main_port: mach_port_t,
            matching: CFDictionaryRef,
            existing: *mut io_iterator_t,
        ) -> kern_return_t;
        fn IOIteratorNext(iterator: io_iterator_t) -> io_object_t;
        fn IORegistryEntryGetName(entry: io_object_t, name: *mut c_char) -> kern_return_t;
        fn IOServiceOpen(
            service: io_object_t,
            owning_task: mach_port_t,
            conn_type: u32,
            connection: *mut io_connect_t,
        ) -> kern_return_t;
        fn IOServiceClose(connection: io_connect_t) -> kern_return_t;
        fn IOObjectRelease(object: io_object_t) -> kern_return_t;
        fn IOConnectCallStructMethod(
            connection: io_connect_t,
            selector: u32,
            input: *const c_void,
            input_size: usize,
            output: *mut c_void,
            output_size: *mut usize,
        ) -> kern_return_t;
    }

    /// All registry entries matching the controller service class, with names
    fn matching_services() -> Result<Vec<(io_object_t, String)>> {
        let class = CString::new(driver::SERVICE_CLASS)
            .map_err(|e| FanbridgeError::driver(e.to_string()))?;
        let mut iterator: io_iterator_t = 0;

        // SAFETY: the matching dictionary is consumed by IOServiceGetMatchingServices,
        // and the iterator is released below once drained.
        unsafe {
            let matching = IOServiceMatching(class.as_ptr());
            if matching.is_null() {
                return Err(FanbridgeError::driver("cannot build matching dictionary"));
            }
            let kr = IOServiceGetMatchingServices(MACH_PORT_NULL, matching as CFDictionaryRef, &mut iterator);
            if kr != KERN_SUCCESS {
                return Err(FanbridgeError::NotFound(format!(
                    "{} service (kern_return {})",
                    driver::SERVICE_CLASS,
                    kr
                )));
            }
        }

        let mut out = Vec::new();
        loop {
            // SAFETY: iterator is valid until released; name buffer is the
            // 128-byte io_name_t the API expects.
            let entry = unsafe { IOIteratorNext(iterator) };
            if entry == 0 {
                break;
            }
            let mut name = [0 as c_char; 128];
            let name = unsafe {
                if IORegistryEntryGetName(entry, name.as_mut_ptr()) == KERN_SUCCESS {
                    CStr::from_ptr(name.as_ptr()).to_string_lossy().into_owned()
                } else {
                    String::new()
                }
            };
            out.push((entry, name));
        }
        unsafe {
            IOObjectRelease(iterator);
        }
        Ok(out)
    }

    /// Open connection to the controller driver
    pub struct IoKitTransport {
        connection: io_connect_t,
    }

    impl IoKitTransport {
        pub fn open() -> Result<Self> {
            let mut services = matching_services()?;
            // The keys endpoint is where newer machines expose the key API
            services.sort_by_key(|(_, name)| name != driver::KEYS_ENDPOINT);

            let mut result = Err(FanbridgeError::NotFound(driver::SERVICE_CLASS.to_string()));
            for (entry, name) in services {
                if result.is_ok() {
                    unsafe { IOObjectRelease(entry) };
                    continue;
                }
                let mut connection: io_connect_t = 0;
                // SAFETY: entry is a live registry object; connection is written on success.
                let kr = unsafe { IOServiceOpen(entry, mach_task_self(), 0, &mut connection) };
                unsafe { IOObjectRelease(entry) };

                match kr {
                    KERN_SUCCESS if connection != 0 => {
                        debug!(entry = %name, "opened controller connection");
                        result = Ok(Self { connection });
                    }
                    KIO_RETURN_NOT_PRIVILEGED => {
                        result = Err(FanbridgeError::PermissionDenied(format!(
                            "opening {}",
                            name
                        )));
                    }
                    other => {
                        warn!(entry = %name, kern_return = other, "IOServiceOpen failed");
                        result = Err(FanbridgeError::driver(format!(
                            "IOServiceOpen on {} returned {}",
                            name, other
                        )));
                    }
                }
            }
            result
        }
    }

    impl SmcTransport for IoKitTransport {
        fn call(&mut self, selector: u32, block: &mut SmcParamBlock) -> Result<()> {
            let input = *block;
            let mut output_size = mem::size_of::<SmcParamBlock>();

            // SAFETY: both pointers reference a repr(C) block of the size passed.
            let kr = unsafe {
                IOConnectCallStructMethod(
                    self.connection,
                    selector,
                    &input as *const SmcParamBlock as *const c_void,
                    mem::size_of::<SmcParamBlock>(),
                    block as *mut SmcParamBlock as *mut c_void,
                    &mut output_size,
                )
            };
            if kr != KERN_SUCCESS {
                return Err(FanbridgeError::driver(format!(
                    "IOConnectCallStructMethod selector {} returned {}",
                    selector, kr
                )));
            }
            Ok(())
        }
    }

    impl Drop for IoKitTransport {
        fn drop(&mut self) {
            // SAFETY: connection came from IOServiceOpen and is closed once.
            unsafe {
                IOServiceClose(self.connection);
            }
        }
    }
}

#[cfg(target_os = "macos")]
pub use imp::IoKitTransport;

/// Placeholder on platforms without the controller driver
#[cfg(not(target_os = "macos"))]
#[derive(Debug)]
pub struct IoKitTransport {
    _private: (),
}

#[cfg(not(target_os = "macos"))]
impl IoKitTransport {
    pub fn open() -> Result<Self> {
        Err(FanbridgeError::NotSupported(
            "the system management controller is only reachable on macOS".to_string(),
        ))
    }
}

#[cfg(not(target_os = "macos"))]
impl SmcTransport for IoKitTransport {
    fn call(&mut self, _selector: u32, _block: &mut SmcParamBlock) -> Result<()> {
        Err(FanbridgeError::NotSupported("controller transport".to_string()))
    }
}

#![no_std]
#![no_main]

use core::panic::PanicInfo;

use limine::request::{
    ExecutableAddressRequest, ExecutableFileRequest, HhdmRequest, MemoryMapRequest, ModuleRequest,
    RequestsEndMarker, RequestsStartMarker,
};
use limine::BaseRevision;

use kernel::boot::build_boot_info;
use kernel::kprintln;

#[used]
#[link_section = ".limine_requests.start"]
static LIMINE_START: RequestsStartMarker = RequestsStartMarker::new();

#[used]
#[link_section = ".limine_requests"]
static BASE_REVISION: BaseRevision = BaseRevision::with_revision(0);

#[used]
#[link_section = ".limine_requests"]
static MEMORY_MAP_REQUEST: MemoryMapRequest = MemoryMapRequest::new();

#[used]
#[link_section = ".limine_requests"]
static HHDM_REQUEST: HhdmRequest = HhdmRequest::new();

#[used]
#[link_section = ".limine_requests"]
static EXECUTABLE_FILE_REQUEST: ExecutableFileRequest = ExecutableFileRequest::new();

#[used]
#[link_section = ".limine_requests"]
static EXECUTABLE_ADDRESS_REQUEST: ExecutableAddressRequest = ExecutableAddressRequest::new();

#[used]
#[link_section = ".limine_requests"]
static MODULE_REQUEST: ModuleRequest = ModuleRequest::new();

#[used]
#[link_section = ".limine_requests.end"]
static LIMINE_END: RequestsEndMarker = RequestsEndMarker::new();

fn halt(message: &str) -> ! {
    kprintln!("limine: {}", message);
    loop {
        core::hint::spin_loop();
    }
}

#[no_mangle]
pub extern "C" fn _start() -> ! {
    kernel::console::init_early();
    kprintln!("limine entry starting");
    if !BASE_REVISION.is_supported() {
        halt("unsupported base revision");
    }

    let Some(memory_map) = MEMORY_MAP_REQUEST.get_response() else {
        halt("memory map response missing");
    };
    let Some(hhdm) = HHDM_REQUEST.get_response() else {
        halt("hhdm response missing");
    };
    let Some(exec_file) = EXECUTABLE_FILE_REQUEST.get_response() else {
        halt("executable file response missing");
    };
    let Some(exec_addr) = EXECUTABLE_ADDRESS_REQUEST.get_response() else {
        halt("executable address response missing");
    };

    let kernel_start = exec_addr.physical_base();
    let kernel_end = kernel_start + exec_file.file().size();

    let initramfs = MODULE_REQUEST
        .get_response()
        .and_then(|response| response.modules().first().copied())
        .map(|module| {
            let start = module.addr() as u64;
            let end = start + module.size();
            (start, end)
        });

    let boot_info = build_boot_info(memory_map, kernel_start, kernel_end, initramfs, hhdm.offset());
    kernel::entry(boot_info, exec_addr.virtual_base())
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    kprintln!("panic: {}", info);
    loop {
        core::hint::spin_loop();
    }
}

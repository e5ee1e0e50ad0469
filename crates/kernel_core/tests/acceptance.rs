use std::sync::{Arc, Mutex};

use hal::{FaultInfo, Interrupts, PhysMemory};
use kernel_core::{
    build_initramfs, load_initramfs, Context, DefaultSignals, Disposition, Errno, FaultOutcome,
    FrameAllocator, InitramfsEntry, Kernel, KernelConfig, MemoryVfs, Pid, ProcState, Process,
    Resume, SignalDelivery, SimulatedRam, SpaceId, Start, TrapFrame, SIGNAL_RETURN, THREAD_RETURN,
};

#[derive(Clone)]
struct NoIrq;

impl Interrupts for NoIrq {
    fn disable(&self) -> bool {
        false
    }

    fn restore(&self, _was_enabled: bool) {}
}

/// Records delivered signals and arranges a handler for each.
#[derive(Clone, Default)]
struct HandlerSignals {
    delivered: Arc<Mutex<Vec<(Pid, u32)>>>,
}

impl SignalDelivery for HandlerSignals {
    fn deliver(&mut self, process: &Process, signal: u32) -> Disposition {
        self.delivered.lock().unwrap().push((process.pid, signal));
        Disposition::Handled
    }
}

const RAM: u64 = 0x80_0000;
const KERNEL_IP: usize = 0x2_0000;
const IMAGE_BASE: u64 = 0x80_0000;
const ENTRY: u64 = 0x80_0040;

type TestKernel = Kernel<SimulatedRam, NoIrq>;

fn saved() -> Context {
    Context {
        ip: KERNEL_IP,
        sp: 0,
        bp: 0,
    }
}

fn boot_with(vfs: MemoryVfs, signals: Box<dyn SignalDelivery + Send>) -> TestKernel {
    let ram = SimulatedRam::new(RAM);
    let frames = FrameAllocator::new(ram.size());
    Kernel::new(frames, ram, NoIrq, KernelConfig::small(), Box::new(vfs), signals)
        .expect("kernel should boot")
}

fn boot(vfs: MemoryVfs) -> TestKernel {
    boot_with(vfs, Box::new(DefaultSignals::default()))
}

/// Forks a user process off the idle task and switches to it.
fn enter_user_process(kernel: &mut TestKernel) -> Pid {
    let pid = kernel.fork(&TrapFrame::default()).expect("fork should succeed");
    let dispatch = kernel.yield_current(false, saved());
    assert_eq!(dispatch.pid, pid);
    pid
}

fn space_of(kernel: &TestKernel, pid: Pid) -> SpaceId {
    kernel.process(pid).expect("process should exist").space
}

fn read_word(kernel: &TestKernel, space: SpaceId, addr: u64) -> u64 {
    let mut word = [0u8; 8];
    kernel.vm().read_bytes(space, addr, &mut word).expect("word should be mapped");
    u64::from_le_bytes(word)
}

fn read_cstr(kernel: &TestKernel, space: SpaceId, mut addr: u64) -> String {
    let mut bytes = Vec::new();
    loop {
        let mut byte = [0u8; 1];
        kernel.vm().read_bytes(space, addr, &mut byte).expect("string should be mapped");
        if byte[0] == 0 {
            break;
        }
        bytes.push(byte[0]);
        addr += 1;
    }
    String::from_utf8(bytes).expect("utf-8 string")
}

/// Builds an ELF64 executable; each segment is `(vaddr, file bytes, memory size)`.
fn elf_image(entry: u64, segments: &[(u64, &[u8], u64)], dynamic: bool) -> Vec<u8> {
    let phnum = segments.len() + usize::from(dynamic);
    let mut image = vec![0u8; 64 + 56 * phnum];
    image[..4].copy_from_slice(&[0x7F, b'E', b'L', b'F']);
    image[4] = 2;
    image[5] = 1;
    image[6] = 1;
    image[16..18].copy_from_slice(&2u16.to_le_bytes());
    image[18..20].copy_from_slice(&0x3Eu16.to_le_bytes());
    image[24..32].copy_from_slice(&entry.to_le_bytes());
    image[32..40].copy_from_slice(&64u64.to_le_bytes());
    image[52..54].copy_from_slice(&64u16.to_le_bytes());
    image[54..56].copy_from_slice(&56u16.to_le_bytes());
    image[56..58].copy_from_slice(&(phnum as u16).to_le_bytes());

    for (index, (vaddr, data, mem_size)) in segments.iter().enumerate() {
        let ph = 64 + 56 * index;
        let offset = image.len() as u64;
        image[ph..ph + 4].copy_from_slice(&1u32.to_le_bytes());
        image[ph + 4..ph + 8].copy_from_slice(&7u32.to_le_bytes());
        image[ph + 8..ph + 16].copy_from_slice(&offset.to_le_bytes());
        image[ph + 16..ph + 24].copy_from_slice(&vaddr.to_le_bytes());
        image[ph + 32..ph + 40].copy_from_slice(&(data.len() as u64).to_le_bytes());
        image[ph + 40..ph + 48].copy_from_slice(&mem_size.to_le_bytes());
        image.extend_from_slice(data);
    }
    if dynamic {
        let ph = 64 + 56 * segments.len();
        image[ph..ph + 4].copy_from_slice(&2u32.to_le_bytes());
    }
    image
}

fn simple_program() -> Vec<u8> {
    elf_image(ENTRY, &[(IMAGE_BASE, b"hello world", 0x1800)], false)
}

#[test]
fn acceptance_init_pipeline() {
    let entries = vec![InitramfsEntry {
        name: "/bin/init".to_string(),
        mode: 0o755,
        uid: 0,
        data: simple_program(),
    }];
    let vfs = load_initramfs(&build_initramfs(&entries)).expect("initramfs should load");
    let mut kernel = boot(vfs);

    let pid = kernel
        .spawn_process("/bin/init", &["/bin/init"], &["HOME=/"])
        .expect("init should start");
    assert_eq!(pid, kernel_core::INIT_PID);
    assert_eq!(kernel.current_pid(), kernel_core::IDLE_PID);
    assert!(kernel.scheduler().is_ready(pid));
    assert_eq!(
        kernel.process(pid).map(|init| init.state),
        Some(ProcState::NotStarted)
    );

    let dispatch = kernel.yield_current(false, saved());
    assert_eq!(dispatch.pid, pid);
    let Resume::FirstEntry(Start::EnterUser(entry)) = dispatch.resume else {
        panic!("init should enter user mode first");
    };
    assert_eq!(entry.entry, ENTRY);
    assert_eq!(entry.argc, 1);

    let space = space_of(&kernel, pid);
    assert_eq!(read_word(&kernel, space, entry.stack), 1);
    assert_eq!(read_word(&kernel, space, entry.stack + 8), entry.argv);
    let argv0 = read_word(&kernel, space, entry.argv);
    assert_eq!(read_cstr(&kernel, space, argv0), "/bin/init");
    assert_eq!(read_word(&kernel, space, entry.argv + 8), 0);
    let env0 = read_word(&kernel, space, entry.envp);
    assert_eq!(read_cstr(&kernel, space, env0), "HOME=/");

    let process = kernel.process(pid).expect("init");
    assert_eq!(process.files.lock().entries.len(), 3);
    assert_eq!(process.image.entry, ENTRY);
    assert_eq!(
        process.image.user_stack,
        KernelConfig::small().user_stack_top
    );
}

#[test]
fn clone_then_release_restores_refs_and_bitmap() {
    let mut kernel = boot(MemoryVfs::new());
    let pid = enter_user_process(&mut kernel);
    let space = space_of(&kernel, pid);
    kernel
        .vm_mut()
        .map_range(space, IMAGE_BASE, IMAGE_BASE + 0x3000, false, true)
        .expect("map");
    let bitmap = kernel.frames().snapshot();
    let refs = kernel.vm().refs(space);

    let copy = kernel.vm_mut().clone_space(space).expect("clone");
    kernel.vm_mut().release(copy).expect("release");
    assert_eq!(kernel.frames().snapshot(), bitmap);
    assert_eq!(kernel.vm().refs(space), refs);

    kernel.fork(&TrapFrame::default()).expect("fork");
    kernel.yield_current(true, saved());
    kernel.exit(0).expect("child exits");
    assert_eq!(kernel.frames().snapshot(), bitmap);
}

#[test]
fn loaded_segments_read_back_with_zero_tail() {
    let mut vfs = MemoryVfs::new();
    let text: Vec<u8> = (0..0x1200u32).map(|value| (value % 251) as u8).collect();
    let program = elf_image(
        ENTRY,
        &[(IMAGE_BASE, &text, 0x1200), (IMAGE_BASE + 0x3000, b"data", 0x2000)],
        false,
    );
    vfs.insert("/bin/prog", program, 0o755, 0);
    let mut kernel = boot(vfs);
    let pid = enter_user_process(&mut kernel);
    kernel
        .exec("/bin/prog", &["prog"], &[], 0)
        .expect("exec should succeed");

    let space = space_of(&kernel, pid);
    let mut back = vec![0u8; text.len()];
    kernel.vm().read_bytes(space, IMAGE_BASE, &mut back).expect("read");
    assert_eq!(back, text);

    let mut data = [0u8; 4];
    kernel.vm().read_bytes(space, IMAGE_BASE + 0x3000, &mut data).expect("read");
    assert_eq!(&data, b"data");
    let mut tail = vec![0xFFu8; 0x2000 - 4];
    kernel
        .vm()
        .read_bytes(space, IMAGE_BASE + 0x3004, &mut tail)
        .expect("read");
    assert!(tail.iter().all(|byte| *byte == 0));

    let image = kernel.process(pid).expect("process").image;
    assert_eq!(image.start, IMAGE_BASE);
    assert_eq!(image.size, 0x5000);
    assert!(image.heap >= IMAGE_BASE + 0x5000);
    assert_eq!(image.heap_actual % 0x1000, 0);
}

#[test]
fn first_free_never_returns_a_bound_frame() {
    let kernel = boot(MemoryVfs::new());
    let frames = kernel.frames();
    for _ in 0..64 {
        let frame = frames.find_first_free();
        assert_ne!(frame, 0);
        assert!(!frames.test(u64::from(frame) * 0x1000));
        frames.mark(u64::from(frame) * 0x1000);
    }
}

#[test]
fn fork_duplicates_then_diverges() {
    let mut kernel = boot(MemoryVfs::new());
    let parent = enter_user_process(&mut kernel);
    let parent_space = space_of(&kernel, parent);
    kernel.vm_mut().map_page(parent_space, IMAGE_BASE, false, true).expect("map");
    kernel.vm_mut().write_bytes(parent_space, IMAGE_BASE, b"AAAA").expect("write");

    let trap = TrapFrame {
        ip: ENTRY as usize,
        ret: 55,
        ..TrapFrame::default()
    };
    let child = kernel.fork(&trap).expect("fork");
    assert_ne!(child, 0);
    assert_eq!(kernel.process(child).expect("child").trap.ret, 0);

    let child_space = space_of(&kernel, child);
    let mut bytes = [0u8; 4];
    kernel.vm().read_bytes(child_space, IMAGE_BASE, &mut bytes).expect("read");
    assert_eq!(&bytes, b"AAAA");

    kernel.vm_mut().write_bytes(child_space, IMAGE_BASE, b"BBBB").expect("write");
    kernel.vm().read_bytes(parent_space, IMAGE_BASE, &mut bytes).expect("read");
    assert_eq!(&bytes, b"AAAA");
    assert_ne!(
        kernel.vm().translate(parent_space, IMAGE_BASE),
        kernel.vm().translate(child_space, IMAGE_BASE)
    );

    let dispatch = kernel.yield_current(true, saved());
    assert_eq!(dispatch.pid, child);
    assert_eq!(dispatch.resume, Resume::FirstEntry(Start::ReturnToUser));
}

#[test]
fn shebang_chain_at_depth_limit_succeeds_and_beyond_loops() {
    let mut vfs = MemoryVfs::new();
    vfs.insert("/bin/prog", simple_program(), 0o755, 0);
    vfs.insert("/s0", b"#!/bin/prog\n".to_vec(), 0o755, 0);
    for level in 1..=5 {
        let script = format!("#!/s{}\n", level - 1);
        vfs.insert(&format!("/s{}", level), script.into_bytes(), 0o755, 0);
    }
    let mut kernel = boot(vfs);
    let pid = enter_user_process(&mut kernel);

    let entry = kernel.exec("/s4", &["s4", "arg"], &[], 0).expect("five scripts deep");
    assert_eq!(entry.entry, ENTRY);
    let space = space_of(&kernel, pid);
    let args: Vec<String> = (0..entry.argc as u64)
        .map(|index| read_cstr(&kernel, space, read_word(&kernel, space, entry.argv + 8 * index)))
        .collect();
    assert_eq!(
        args,
        ["/bin/prog", "/s0", "/s1", "/s2", "/s3", "/s4", "arg"]
    );

    assert_eq!(kernel.exec("/s5", &["s5"], &[], 0), Err(Errno::Loop));
    assert_eq!(Errno::Loop.code(), -40);
}

#[test]
fn clone_passes_argument_and_thread_return_exits_cleanly() {
    let mut kernel = boot(MemoryVfs::new());
    let parent = enter_user_process(&mut kernel);
    let space = space_of(&kernel, parent);
    let stack_page = 0x100_0000;
    kernel.vm_mut().map_page(space, stack_page, false, true).expect("map");
    let files = kernel.process(parent).expect("parent").files.clone();

    let thread = kernel
        .clone(stack_page + 0x1000, ENTRY as usize, 0x1234, &TrapFrame::default())
        .expect("clone");
    let record = kernel.process(thread).expect("thread");
    assert_eq!(record.space, space);
    assert!(Arc::ptr_eq(&record.files, &files));
    assert_eq!(record.trap.ip, ENTRY as usize);
    let sp = record.trap.sp as u64;
    assert_eq!(sp, stack_page + 0x1000 - 16);
    assert_eq!(read_word(&kernel, space, sp), THREAD_RETURN as u64);
    assert_eq!(read_word(&kernel, space, sp + 8), 0x1234);
    assert_eq!(kernel.vm().refs(space), 2);

    let dispatch = kernel.yield_current(true, saved());
    assert_eq!(dispatch.pid, thread);
    let fault = FaultInfo {
        addr: THREAD_RETURN as u64,
        ip: THREAD_RETURN,
        error_code: 0x15,
    };
    let outcome = kernel.page_fault(fault, &TrapFrame::default()).expect("fault");
    let FaultOutcome::Switch(next) = outcome else {
        panic!("thread exit should switch away");
    };
    assert_eq!(next.pid, parent);
    let record = kernel.process(thread).expect("zombie until reaped");
    assert_eq!(record.state, ProcState::Finished);
    assert_eq!(record.status, 0);
    assert_eq!(kernel.vm().refs(space), 1);
}

#[test]
fn low_segment_is_rejected_without_partial_mapping() {
    let mut vfs = MemoryVfs::new();
    let low = elf_image(0x40_0040, &[(0x40_0000, b"low", 0x1000)], false);
    vfs.insert("/bin/low", low, 0o755, 0);
    let mut kernel = boot(vfs);
    let pid = enter_user_process(&mut kernel);
    let space = space_of(&kernel, pid);
    kernel.vm_mut().map_page(space, IMAGE_BASE, false, true).expect("map");
    kernel.vm_mut().write_bytes(space, IMAGE_BASE, b"keep").expect("write");
    let bitmap = kernel.frames().snapshot();

    assert_eq!(
        kernel.exec("/bin/low", &["low"], &[], 0),
        Err(Errno::InvalidArg)
    );
    assert_eq!(kernel.frames().snapshot(), bitmap);
    assert_eq!(space_of(&kernel, pid), space);
    let mut bytes = [0u8; 4];
    kernel.vm().read_bytes(space, IMAGE_BASE, &mut bytes).expect("still mapped");
    assert_eq!(&bytes, b"keep");
    assert_eq!(kernel.vm().translate(space, 0x40_0000), None);
}

#[test]
fn exec_reports_lookup_permission_and_format_errors() {
    let mut vfs = MemoryVfs::new();
    vfs.insert("/etc/passwd", b"root".to_vec(), 0o644, 0);
    vfs.insert("/bin/junk", b"MZ\x90\x00".to_vec(), 0o755, 0);
    vfs.insert("/bin/noline", b"#!/bin/sh".to_vec(), 0o755, 0);
    let mut kernel = boot(vfs);
    enter_user_process(&mut kernel);

    assert_eq!(kernel.exec("/bin/none", &[], &[], 0), Err(Errno::NotFound));
    assert_eq!(kernel.exec("/etc/passwd", &[], &[], 0), Err(Errno::Access));
    assert_eq!(kernel.exec("/bin/junk", &[], &[], 0), Err(Errno::NoExec));
    assert_eq!(kernel.exec("/bin/noline", &[], &[], 0), Err(Errno::NoExec));
}

#[test]
fn dynamic_image_runs_through_linker() {
    let mut vfs = MemoryVfs::new();
    vfs.insert(
        "/bin/dyn",
        elf_image(ENTRY, &[(IMAGE_BASE, b"dyn", 0x1000)], true),
        0o755,
        0,
    );
    vfs.insert(
        "/lib/ld.so",
        elf_image(0x90_0000, &[(0x90_0000, b"ld", 0x1000)], false),
        0o755,
        0,
    );
    let mut kernel = boot(vfs);
    let pid = enter_user_process(&mut kernel);

    let entry = kernel.exec("/bin/dyn", &["dyn", "x"], &[], 0).expect("exec");
    assert_eq!(entry.entry, 0x90_0000);
    let space = space_of(&kernel, pid);
    let args: Vec<String> = (0..entry.argc as u64)
        .map(|index| read_cstr(&kernel, space, read_word(&kernel, space, entry.argv + 8 * index)))
        .collect();
    assert_eq!(args, ["ld.so", "-e", "/bin/dyn", "dyn", "x"]);
    assert_eq!(kernel.vm().translate(space, IMAGE_BASE), None);
}

#[test]
fn setuid_image_changes_effective_user_and_auxv() {
    let mut vfs = MemoryVfs::new();
    vfs.insert("/bin/su", simple_program(), 0o4755, 1000);
    let mut kernel = boot(vfs);
    let pid = enter_user_process(&mut kernel);

    let entry = kernel.exec("/bin/su", &["su"], &[], 0).expect("exec");
    let process = kernel.process(pid).expect("process");
    assert_eq!(process.user, 1000);
    assert_eq!(process.real_user, 0);
    assert_eq!(process.name, "/bin/su");

    let space = space_of(&kernel, pid);
    let auxv = entry.envp + 8;
    let words: Vec<u64> = (0..6).map(|index| read_word(&kernel, space, auxv + 8 * index)).collect();
    assert_eq!(words, [11, 0, 12, 1000, 0, 0]);
}

#[test]
fn failed_setuid_exec_keeps_caller_identity() {
    let mut vfs = MemoryVfs::new();
    let low = elf_image(0x40_0040, &[(0x40_0000, b"low", 0x1000)], false);
    vfs.insert("/bin/bad-su", low, 0o4755, 0);
    let dynamic = elf_image(ENTRY, &[(IMAGE_BASE, b"dyn", 0x1000)], true);
    vfs.insert("/bin/dyn-su", dynamic, 0o4755, 0);
    let mut kernel = boot(vfs);
    let pid = enter_user_process(&mut kernel);
    let process = kernel.process_mut(pid).expect("process");
    process.user = 1000;
    process.real_user = 1000;
    let name = process.name.clone();

    assert_eq!(
        kernel.exec("/bin/bad-su", &["bad-su"], &[], 0),
        Err(Errno::InvalidArg)
    );
    assert_eq!(
        kernel.exec("/bin/dyn-su", &["dyn-su"], &[], 0),
        Err(Errno::InvalidArg)
    );
    let process = kernel.process(pid).expect("process");
    assert_eq!(process.user, 1000);
    assert_eq!(process.name, name);
}

#[test]
fn exec_from_thread_leaves_shared_space_to_siblings() {
    let mut vfs = MemoryVfs::new();
    vfs.insert("/bin/prog", simple_program(), 0o755, 0);
    let mut kernel = boot(vfs);
    let pid = enter_user_process(&mut kernel);
    let space = space_of(&kernel, pid);
    kernel.vm_mut().map_page(space, 0x100_0000, false, true).expect("map");
    kernel.vm_mut().write_bytes(space, 0x100_0000, b"mine").expect("write");
    kernel
        .clone(0x100_1000, ENTRY as usize, 0, &TrapFrame::default())
        .expect("clone");

    kernel.exec("/bin/prog", &["prog"], &[], 0).expect("exec");
    assert_ne!(space_of(&kernel, pid), space);
    assert_eq!(kernel.vm().refs(space), 1);
    let mut bytes = [0u8; 4];
    kernel.vm().read_bytes(space, 0x100_0000, &mut bytes).expect("sibling keeps data");
    assert_eq!(&bytes, b"mine");
}

#[test]
fn segfault_terminates_with_signal_status() {
    let mut kernel = boot(MemoryVfs::new());
    let pid = enter_user_process(&mut kernel);
    let fault = FaultInfo {
        addr: 0,
        ip: ENTRY as usize,
        error_code: 0x4,
    };
    let outcome = kernel.page_fault(fault, &TrapFrame::default()).expect("fault");
    let FaultOutcome::Switch(next) = outcome else {
        panic!("terminated process should switch away");
    };
    assert_eq!(next.pid, 0);
    let record = kernel.process(pid).expect("finished record");
    assert_eq!(record.status, 128 + 11);
    assert_eq!(record.state, ProcState::Finished);

    assert_eq!(kernel.finish_resume(), Ok(None));
    assert!(kernel.process(pid).is_none());
}

#[test]
fn handled_signal_returns_to_saved_frame() {
    let signals = HandlerSignals::default();
    let delivered = signals.delivered.clone();
    let mut kernel = boot_with(MemoryVfs::new(), Box::new(signals));
    let pid = enter_user_process(&mut kernel);
    let trap = TrapFrame {
        ip: ENTRY as usize,
        sp: 0x1FF_FF00,
        ..TrapFrame::default()
    };
    let fault = FaultInfo {
        addr: 0x10,
        ip: ENTRY as usize,
        error_code: 0x6,
    };
    assert_eq!(kernel.page_fault(fault, &trap), Ok(FaultOutcome::Continue));
    assert_eq!(*delivered.lock().unwrap(), [(pid, 11)]);
    let frame = kernel
        .process(pid)
        .and_then(|process| process.signals.frame.clone())
        .expect("signal frame saved");
    assert_eq!(frame.trap, trap);

    let back = FaultInfo {
        addr: SIGNAL_RETURN as u64,
        ip: SIGNAL_RETURN,
        error_code: 0x14,
    };
    let outcome = kernel.page_fault(back, &TrapFrame::default()).expect("return");
    let FaultOutcome::Switch(dispatch) = outcome else {
        panic!("signal return resumes the saved frame");
    };
    assert_eq!(dispatch.pid, pid);
    assert_eq!(dispatch.resume, Resume::Resumed(frame.context));
    let process = kernel.process(pid).expect("process");
    assert!(process.signals.frame.is_none());
    assert_eq!(process.trap, trap);
    assert_eq!(kernel.return_from_signal(), Err(Errno::InvalidArg));
}

#[test]
fn corrupt_record_is_skipped_not_terminated() {
    let mut kernel = boot(MemoryVfs::new());
    let first = kernel.fork(&TrapFrame::default()).expect("fork");
    let second = kernel.fork(&TrapFrame::default()).expect("fork");
    assert_eq!(kernel.yield_current(false, saved()).pid, first);

    let corrupt = Context {
        ip: 0xDEAD_0000,
        ..saved()
    };
    assert_eq!(kernel.yield_current(true, corrupt).pid, second);
    assert_eq!(kernel.yield_current(true, saved()).pid, second);
    let record = kernel.process(first).expect("still present");
    assert_ne!(record.state, ProcState::Finished);
}

#[test]
fn system_runs_program_in_fresh_space() {
    let mut vfs = MemoryVfs::new();
    vfs.insert("/bin/init", simple_program(), 0o755, 0);
    let mut kernel = boot(vfs);
    let worker = kernel.spawn_kernel_worker(KERNEL_IP, "[init]", 0).expect("spawn");
    kernel.yield_current(false, saved());
    assert_eq!(space_of(&kernel, worker), SpaceId::KERNEL);

    let entry = kernel.system("/bin/init", &["/bin/init"], &[]).expect("system");
    assert_eq!(entry.entry, ENTRY);
    let process = kernel.process(worker).expect("worker");
    assert_ne!(process.space, SpaceId::KERNEL);
    assert_eq!(process.cmdline, ["/bin/init"]);
    assert_eq!(process.name, "/bin/init");
    assert_eq!(kernel.vm().translate(SpaceId::KERNEL, IMAGE_BASE), None);
}

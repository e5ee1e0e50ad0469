//! Executable format dispatch: ELF images, `#!` scripts and the boot-time `system` launcher.

use alloc::string::{String, ToString};
use alloc::vec::Vec;

use hal::{Errno, Interrupts, PhysMemory};

use crate::elf::ELF_MAGIC;
use crate::kernel::Kernel;
use crate::process::{Pid, Process, Start, UserEntry};
use crate::vfs::{FileHandle, PERM_EXEC};
use crate::vmm::SpaceId;

/// Bytes of a script examined for the interpreter line.
pub const SHEBANG_LINE_MAX: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Loader {
    Elf,
    Shebang,
}

struct Format {
    name: &'static str,
    magic: &'static [u8],
    loader: Loader,
}

/// Recognised formats, tried in order.
const FORMATS: [Format; 2] = [
    Format {
        name: "ELF",
        magic: &ELF_MAGIC,
        loader: Loader::Elf,
    },
    Format {
        name: "#!",
        magic: b"#!",
        loader: Loader::Shebang,
    },
];

/// Interpreter line of a script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shebang {
    pub interpreter: String,
    pub arg: Option<String>,
}

/// Parses `#!interp [arg]\n` from the head of a script.
///
/// One space after `#!` is skipped. The interpreter ends at a space or a
/// newline; after a space the rest of the line is a single argument. A head
/// without a line end, or with a NUL before it, is not executable.
pub fn parse_shebang(head: &[u8]) -> Result<Shebang, Errno> {
    let head = head.get(..SHEBANG_LINE_MAX).unwrap_or(head);
    let mut line = head.strip_prefix(b"#!").ok_or(Errno::NoExec)?;
    if let Some(rest) = line.strip_prefix(b" ") {
        line = rest;
    }
    let line = match line.iter().position(|byte| *byte == 0) {
        Some(nul) => &line[..nul],
        None => line,
    };
    let split = line
        .iter()
        .position(|byte| *byte == b' ' || *byte == b'\n')
        .ok_or(Errno::NoExec)?;
    let interpreter = text(&line[..split])?;
    if line[split] == b'\n' {
        return Ok(Shebang {
            interpreter,
            arg: None,
        });
    }
    let rest = &line[split + 1..];
    let end = rest.iter().position(|byte| *byte == b'\n').ok_or(Errno::NoExec)?;
    Ok(Shebang {
        interpreter,
        arg: Some(text(&rest[..end])?),
    })
}

fn text(bytes: &[u8]) -> Result<String, Errno> {
    core::str::from_utf8(bytes)
        .map(ToString::to_string)
        .map_err(|_| Errno::NoExec)
}

/// Argument vector for the interpreter: `[interp, arg?, script, argv[1..]...]`.
pub fn interpreter_args(shebang: &Shebang, script: &str, argv: &[&str]) -> Vec<String> {
    let mut args = Vec::with_capacity(argv.len() + 2);
    args.push(shebang.interpreter.clone());
    if let Some(arg) = &shebang.arg {
        args.push(arg.clone());
    }
    args.push(script.to_string());
    args.extend(argv.iter().skip(1).map(|arg| arg.to_string()));
    args
}

impl<M: PhysMemory, I: Interrupts> Kernel<M, I> {
    /// Replaces the current process image with the program at `path`.
    ///
    /// `depth` counts interpreter indirections and is 0 for external callers.
    pub fn exec(
        &mut self,
        path: &str,
        argv: &[&str],
        envp: &[&str],
        depth: u32,
    ) -> Result<UserEntry, Errno> {
        let pid = self.scheduler.current();
        self.exec_in(pid, path, argv, envp, depth)
    }

    pub(crate) fn exec_in(
        &mut self,
        pid: Pid,
        path: &str,
        argv: &[&str],
        envp: &[&str],
        depth: u32,
    ) -> Result<UserEntry, Errno> {
        let user = self.procs.get(&pid).ok_or(Errno::NotFound)?.user;
        let file = self.vfs.open(path).map_err(|_| Errno::NotFound)?;
        if !self.vfs.has_permission(file, user, PERM_EXEC) {
            self.vfs.close(file);
            return Err(Errno::Access);
        }
        let mut head = [0u8; 4];
        let read = match self.vfs.read_at(file, 0, &mut head) {
            Ok(read) => read,
            Err(err) => {
                self.vfs.close(file);
                return Err(err);
            }
        };

        let format = FORMATS
            .iter()
            .find(|format| head[..read].starts_with(format.magic));
        let Some(format) = format else {
            self.vfs.close(file);
            return Err(Errno::NoExec);
        };
        log::trace!("binfmt: {} is {} (depth {})", path, format.name, depth);
        match format.loader {
            Loader::Elf => {
                let entry = self.exec_elf(pid, path, file, argv, envp, depth, None)?;
                if let Some(process) = self.procs.get_mut(&pid) {
                    process.name = path.to_string();
                }
                Ok(entry)
            }
            Loader::Shebang => self.exec_shebang(pid, path, file, argv, envp, depth),
        }
    }

    fn exec_shebang(
        &mut self,
        pid: Pid,
        path: &str,
        file: FileHandle,
        argv: &[&str],
        envp: &[&str],
        depth: u32,
    ) -> Result<UserEntry, Errno> {
        if depth > self.config.max_interp_depth {
            self.vfs.close(file);
            return Err(Errno::Loop);
        }
        let mut head = [0u8; SHEBANG_LINE_MAX];
        let read = self.vfs.read_at(file, 0, &mut head);
        self.vfs.close(file);
        let shebang = parse_shebang(&head[..read?])?;

        let args = interpreter_args(&shebang, path, argv);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.exec_in(pid, &shebang.interpreter, &args, envp, depth + 1)
    }

    /// Gives the current process a fresh address space cloned from the
    /// kernel directory, records the command line, and executes `path`.
    pub fn system(&mut self, path: &str, argv: &[&str], envp: &[&str]) -> Result<UserEntry, Errno> {
        let pid = self.scheduler.current();
        let space = self.vm.clone_space(SpaceId::KERNEL)?;
        let process = self.procs.get_mut(&pid).ok_or(Errno::NotFound)?;
        let old = core::mem::replace(&mut process.space, space);
        process.cmdline = argv.iter().map(|arg| arg.to_string()).collect();
        self.vm.release(old)?;
        self.exec_in(pid, path, argv, envp, 0)
    }

    /// Creates a new top-level process running `path` and queues it.
    pub fn spawn_process(
        &mut self,
        path: &str,
        argv: &[&str],
        envp: &[&str],
    ) -> Result<Pid, Errno> {
        let _irq = self.irq_guard();
        let space = self.vm.clone_space(SpaceId::KERNEL)?;
        let pid = self.scheduler.alloc_pid();
        let mut process = Process::new(pid, path, space, self.config.kernel_stack_size);
        process.cmdline = argv.iter().map(|arg| arg.to_string()).collect();
        self.procs.insert(pid, process);

        match self.exec_in(pid, path, argv, envp, 0) {
            Ok(entry) => {
                if let Some(process) = self.procs.get_mut(&pid) {
                    process.start = Start::EnterUser(entry);
                }
                self.scheduler.push_ready(pid);
                log::info!("binfmt: started {} as pid {}", path, pid);
                Ok(pid)
            }
            Err(err) => {
                if let Some(process) = self.procs.remove(&pid) {
                    self.vm.release(process.space)?;
                }
                log::warn!("binfmt: failed to start {}: {:?}", path, err);
                Err(err)
            }
        }
    }
}

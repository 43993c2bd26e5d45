//! Namespace confinement for snippets run as plain child processes
//!
//! The spawned child (A) unshares user, mount, network, PID, IPC and UTS
//! namespaces and maps its own uid to root inside them. It then forks B,
//! which becomes PID 1 of the new PID namespace, builds a minimal root
//! (read-only system directories, the scratch directory at `/box`, private
//! `/tmp`, `/dev` and `/proc`) and pivots into it. B forks C, which execs the
//! snippet. B reaps everything and hands C's wait status to A, which exits the
//! same way so the caller sees the snippet's own status.
//!
//! When A dies, B gets SIGKILL through the parent death signal, and when B
//! dies the kernel kills every process left in the namespace. Killing A is
//! therefore enough to kill the whole tree, including processes that left the
//! process group with `setsid`.
//!
//! Everything between fork and exec is restricted to async-signal-safe
//! calls: all paths are prepared as C strings before the fork.

use std::ffi::{CStr, CString};
use std::fmt;
use std::fs;
use std::io::{self, Read};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::Stdio;
use std::sync::OnceLock;

use anyhow::{Result, anyhow, bail};
use nix::mount::{MntFlags, MsFlags, mount, umount2};
use nix::sched::{CloneFlags, unshare};
use nix::sys::prctl;
use nix::sys::signal::Signal;
use nix::sys::stat::Mode;
use nix::sys::statvfs::{FsFlags, statvfs};
use nix::unistd::{ForkResult, chdir, fork, mkdir, pivot_root, sethostname};

/// Host directories exposed read-only inside the sandbox root
const SYSTEM_DIRS: &[&str] = &["/bin", "/sbin", "/usr", "/lib", "/lib32", "/lib64", "/libx32"];
const DEVICES: &[&str] = &["null", "zero", "full", "random", "urandom"];
const DEV_LINKS: &[(&str, &str)] = &[
    ("fd", "/proc/self/fd"),
    ("stdin", "/proc/self/fd/0"),
    ("stdout", "/proc/self/fd/1"),
    ("stderr", "/proc/self/fd/2"),
];

/// Where the setup inside the child failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
enum Stage {
    Unshare = 1,
    IdMap = 2,
    Fork = 3,
    Mount = 4,
    PivotRoot = 5,
    Program = 6,
}

impl Stage {
    fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(Self::Unshare),
            2 => Some(Self::IdMap),
            3 => Some(Self::Fork),
            4 => Some(Self::Mount),
            5 => Some(Self::PivotRoot),
            6 => Some(Self::Program),
            _ => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unshare => "unshare",
            Self::IdMap => "id mapping",
            Self::Fork => "fork",
            Self::Mount => "mount",
            Self::PivotRoot => "pivot_root",
            Self::Program => "program lookup",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
enum SystemEntry {
    /// Merged-usr style symlink such as `/bin -> usr/bin`, recreated as is
    Link { target: CString, path: CString },
    /// Directory bind-mounted read-only; `locked` keeps the flags the host
    /// mount carries, which a user namespace may not drop on remount
    Dir {
        source: CString,
        path: CString,
        locked: MsFlags,
    },
}

/// Everything the forked child needs, prepared before the fork
#[derive(Debug, Clone)]
pub(super) struct Confinement {
    root: CString,
    scratch: CString,
    uid_map: CString,
    gid_map: CString,
    system: Vec<SystemEntry>,
    devices: Vec<(CString, CString)>,
    dev_links: Vec<(CString, CString)>,
    box_dir: CString,
    tmp_dir: CString,
    dev_dir: CString,
    proc_dir: CString,
    program: Option<CString>,
}

fn c_path(path: &Path) -> Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| anyhow!("path {} contains a NUL byte", path.display()))
}

impl Confinement {
    /// Prepares a confinement that mounts `scratch` at `/box` of a root
    /// built on `root`, an empty directory owned by the runner
    ///
    /// `program` is checked for existence inside the sandbox when absolute.
    pub(super) fn prepare(root: &Path, scratch: &Path, program: &str) -> Result<Self> {
        let mut system = Vec::new();
        for dir in SYSTEM_DIRS {
            let source = Path::new(dir);
            let Ok(meta) = fs::symlink_metadata(source) else {
                continue;
            };
            let path = c_path(&root.join(&dir[1..]))?;
            if meta.file_type().is_symlink() {
                system.push(SystemEntry::Link {
                    target: c_path(&fs::read_link(source)?)?,
                    path,
                });
            } else if meta.is_dir() {
                system.push(SystemEntry::Dir {
                    source: c_path(source)?,
                    path,
                    locked: locked_flags(source)?,
                });
            }
        }

        let dev_root = root.join("dev");
        let devices = DEVICES
            .iter()
            .map(|name| Path::new("/dev").join(name))
            .filter(|host| host.exists())
            .map(|host| {
                let name = host.file_name().unwrap_or_default();
                Ok((c_path(&host)?, c_path(&dev_root.join(name))?))
            })
            .collect::<Result<Vec<_>>>()?;
        let dev_links = DEV_LINKS
            .iter()
            .map(|(name, target)| Ok((CString::new(*target)?, c_path(&dev_root.join(name))?)))
            .collect::<Result<Vec<_>>>()?;

        let uid = nix::unistd::getuid();
        let gid = nix::unistd::getgid();

        Ok(Self {
            root: c_path(root)?,
            scratch: c_path(scratch)?,
            uid_map: CString::new(format!("0 {uid} 1\n"))?,
            gid_map: CString::new(format!("0 {gid} 1\n"))?,
            system,
            devices,
            dev_links,
            box_dir: c_path(&root.join("box"))?,
            tmp_dir: c_path(&root.join("tmp"))?,
            dev_dir: c_path(&dev_root)?,
            proc_dir: c_path(&root.join("proc"))?,
            program: program
                .starts_with('/')
                .then(|| CString::new(program))
                .transpose()?,
        })
    }

    /// Runs in the spawned child between fork and exec
    ///
    /// Returns only in the process that goes on to exec the snippet. Every
    /// setup failure is written to `report_fd`.
    pub(super) fn enter(&self, report_fd: RawFd) -> io::Result<()> {
        let flags = CloneFlags::CLONE_NEWUSER
            | CloneFlags::CLONE_NEWNS
            | CloneFlags::CLONE_NEWNET
            | CloneFlags::CLONE_NEWPID
            | CloneFlags::CLONE_NEWIPC
            | CloneFlags::CLONE_NEWUTS;
        if let Err(errno) = unshare(flags) {
            report(report_fd, Stage::Unshare, errno as i32);
            return Err(errno.into());
        }
        let id_maps = write_file(c"/proc/self/uid_map", &self.uid_map)
            .and_then(|()| write_file(c"/proc/self/setgroups", c"deny"))
            .and_then(|()| write_file(c"/proc/self/gid_map", &self.gid_map));
        if let Err(e) = id_maps {
            report(report_fd, Stage::IdMap, e.raw_os_error().unwrap_or(0));
            return Err(e);
        }

        let (status_read, status_write) = cloexec_pipe()?;
        // The spawn error pipe of the parent must not stay open in processes
        // that never exec, or the parent would wait for it forever.
        close_fds_except([report_fd, status_read, status_write]);

        match unsafe { fork() } {
            Err(errno) => {
                report(report_fd, Stage::Fork, errno as i32);
                exit(127)
            }
            Ok(ForkResult::Parent { child }) => {
                unsafe { libc::close(status_write) };
                let status = wait_for(child.as_raw());
                let mut raw = [0u8; 4];
                let read = unsafe { libc::read(status_read, raw.as_mut_ptr().cast(), raw.len()) };
                if read == 4 {
                    exit_like(i32::from_ne_bytes(raw))
                } else {
                    exit_like(status)
                }
            }
            Ok(ForkResult::Child) => {
                unsafe { libc::close(status_read) };
                self.run_init(report_fd, status_write)
            }
        }
    }

    /// PID 1 of the sandbox: builds the root, then forks the snippet and
    /// reaps until it exits
    fn run_init(&self, report_fd: RawFd, status_fd: RawFd) -> io::Result<()> {
        let _ = prctl::set_pdeathsig(Signal::SIGKILL);

        if let Err((stage, errno)) = self.build_root() {
            report(report_fd, stage, errno);
            exit(127)
        }

        match unsafe { fork() } {
            Err(errno) => {
                report(report_fd, Stage::Fork, errno as i32);
                exit(127)
            }
            Ok(ForkResult::Parent { child }) => {
                let snippet = child.as_raw();
                loop {
                    let mut status = 0;
                    let pid = unsafe { libc::waitpid(-1, &mut status, 0) };
                    if pid == snippet {
                        let raw = status.to_ne_bytes();
                        unsafe { libc::write(status_fd, raw.as_ptr().cast(), raw.len()) };
                        exit(0)
                    }
                    if pid < 0 && io::Error::last_os_error().raw_os_error() != Some(libc::EINTR) {
                        exit(127)
                    }
                }
            }
            Ok(ForkResult::Child) => {
                let _ = prctl::set_no_new_privs();
                if let Err(errno) = chdir(c"/box") {
                    report(report_fd, Stage::PivotRoot, errno as i32);
                    exit(127)
                }
                if let Some(program) = &self.program
                    && unsafe { libc::access(program.as_ptr(), libc::X_OK) } != 0
                {
                    report(report_fd, Stage::Program, last_errno());
                    exit(127)
                }
                Ok(())
            }
        }
    }

    fn build_root(&self) -> Result<(), (Stage, i32)> {
        let fail = |stage: Stage| move |errno: nix::errno::Errno| (stage, errno as i32);
        let none = None::<&str>;

        mount(none, c"/", none, MsFlags::MS_REC | MsFlags::MS_PRIVATE, none)
            .map_err(fail(Stage::Mount))?;
        mount(
            Some(c"tmpfs"),
            self.root.as_c_str(),
            Some(c"tmpfs"),
            MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
            Some(c"size=1m,mode=0755"),
        )
        .map_err(fail(Stage::Mount))?;

        for entry in &self.system {
            match entry {
                SystemEntry::Link { target, path } => {
                    if unsafe { libc::symlink(target.as_ptr(), path.as_ptr()) } != 0 {
                        return Err((Stage::Mount, last_errno()));
                    }
                }
                SystemEntry::Dir {
                    source,
                    path,
                    locked,
                } => {
                    bind_read_only(source, path, *locked).map_err(fail(Stage::Mount))?;
                }
            }
        }

        mkdir(self.box_dir.as_c_str(), Mode::from_bits_truncate(0o755)).map_err(fail(Stage::Mount))?;
        mount(
            Some(self.scratch.as_c_str()),
            self.box_dir.as_c_str(),
            none,
            MsFlags::MS_BIND | MsFlags::MS_REC,
            none,
        )
        .map_err(fail(Stage::Mount))?;

        mkdir(self.tmp_dir.as_c_str(), Mode::from_bits_truncate(0o1777)).map_err(fail(Stage::Mount))?;
        mount(
            Some(c"tmpfs"),
            self.tmp_dir.as_c_str(),
            Some(c"tmpfs"),
            MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
            Some(c"size=16m,mode=1777"),
        )
        .map_err(fail(Stage::Mount))?;

        self.build_dev().map_err(fail(Stage::Mount))?;

        // Masked or read-only /proc on the host makes this fail; the snippet
        // then runs without /proc.
        if mkdir(self.proc_dir.as_c_str(), Mode::from_bits_truncate(0o555)).is_ok() {
            let _ = mount(
                Some(c"proc"),
                self.proc_dir.as_c_str(),
                Some(c"proc"),
                MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
                none,
            );
        }

        chdir(self.root.as_c_str()).map_err(fail(Stage::PivotRoot))?;
        pivot_root(c".", c".").map_err(fail(Stage::PivotRoot))?;
        umount2(c".", MntFlags::MNT_DETACH).map_err(fail(Stage::PivotRoot))?;
        chdir(c"/").map_err(fail(Stage::PivotRoot))?;

        let read_only = MsFlags::MS_REMOUNT | MsFlags::MS_BIND | MsFlags::MS_RDONLY;
        mount(none, c"/", none, read_only | MsFlags::MS_NOSUID | MsFlags::MS_NODEV, none)
            .map_err(fail(Stage::Mount))?;
        mount(none, c"/dev", none, read_only | MsFlags::MS_NOSUID, none)
            .map_err(fail(Stage::Mount))?;

        let _ = sethostname("guardian-sandbox");
        Ok(())
    }

    fn build_dev(&self) -> nix::Result<()> {
        let none = None::<&str>;
        mkdir(self.dev_dir.as_c_str(), Mode::from_bits_truncate(0o755))?;
        mount(
            Some(c"tmpfs"),
            self.dev_dir.as_c_str(),
            Some(c"tmpfs"),
            MsFlags::MS_NOSUID,
            Some(c"size=64k,mode=0755"),
        )?;

        for (host, target) in &self.devices {
            let fd = unsafe {
                libc::open(
                    target.as_ptr(),
                    libc::O_CREAT | libc::O_WRONLY | libc::O_CLOEXEC,
                    0o644,
                )
            };
            if fd < 0 {
                return Err(nix::errno::Errno::last());
            }
            unsafe { libc::close(fd) };
            mount(
                Some(host.as_c_str()),
                target.as_c_str(),
                none,
                MsFlags::MS_BIND,
                none,
            )?;
        }
        for (target, link) in &self.dev_links {
            if unsafe { libc::symlink(target.as_ptr(), link.as_ptr()) } != 0 {
                return Err(nix::errno::Errno::last());
            }
        }
        Ok(())
    }
}

/// Flags of the host mount under `path` that must survive a remount
fn locked_flags(path: &Path) -> Result<MsFlags> {
    let flags = statvfs(path)?.flags();
    let mut locked = MsFlags::MS_NOSUID;
    if flags.contains(FsFlags::ST_NODEV) {
        locked |= MsFlags::MS_NODEV;
    }
    if flags.contains(FsFlags::ST_NOEXEC) {
        locked |= MsFlags::MS_NOEXEC;
    }
    Ok(locked)
}

fn bind_read_only(source: &CStr, target: &CStr, locked: MsFlags) -> nix::Result<()> {
    let none = None::<&str>;
    mkdir(target, Mode::from_bits_truncate(0o755))?;
    mount(
        Some(source),
        target,
        none,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        none,
    )?;
    mount(
        none,
        target,
        none,
        MsFlags::MS_REMOUNT | MsFlags::MS_BIND | MsFlags::MS_RDONLY | locked,
        none,
    )
}

fn write_file(path: &CStr, content: &CStr) -> io::Result<()> {
    let fd = unsafe { libc::open(path.as_ptr(), libc::O_WRONLY | libc::O_CLOEXEC) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    let bytes = content.to_bytes();
    let written = unsafe { libc::write(fd, bytes.as_ptr().cast(), bytes.len()) };
    let err = io::Error::last_os_error();
    unsafe { libc::close(fd) };
    if written != bytes.len() as isize {
        return Err(err);
    }
    Ok(())
}

fn cloexec_pipe() -> io::Result<(RawFd, RawFd)> {
    let mut fds = [0; 2];
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok((fds[0], fds[1]))
}

fn close_fds_except(mut keep: [RawFd; 3]) {
    keep.sort_unstable();
    let mut low: RawFd = 3;
    for fd in keep {
        if fd > low {
            close_range(low, fd - 1);
        }
        low = low.max(fd + 1);
    }
    close_range(low, RawFd::MAX);
}

fn close_range(first: RawFd, last: RawFd) {
    let closed = unsafe {
        libc::syscall(
            libc::SYS_close_range,
            first as libc::c_uint,
            last as libc::c_uint,
            0 as libc::c_uint,
        )
    };
    if closed != 0 {
        // Kernels before 5.9 have no close_range.
        for fd in first..=last.min(4096) {
            unsafe { libc::close(fd) };
        }
    }
}

fn wait_for(pid: libc::pid_t) -> libc::c_int {
    loop {
        let mut status = 0;
        let waited = unsafe { libc::waitpid(pid, &mut status, 0) };
        if waited == pid {
            return status;
        }
        if waited < 0 && io::Error::last_os_error().raw_os_error() != Some(libc::EINTR) {
            return 127 << 8;
        }
    }
}

/// Terminates the calling process with the same status as `status`
fn exit_like(status: libc::c_int) -> ! {
    if libc::WIFSIGNALED(status) {
        let signal = libc::WTERMSIG(status);
        unsafe {
            libc::signal(signal, libc::SIG_DFL);
            libc::kill(libc::getpid(), signal);
        }
        exit(128 + signal)
    }
    exit(libc::WEXITSTATUS(status))
}

fn exit(code: i32) -> ! {
    unsafe { libc::_exit(code) }
}

fn last_errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

fn report(fd: RawFd, stage: Stage, errno: i32) {
    let mut record = [0u8; 8];
    record[..4].copy_from_slice(&(stage as u32).to_ne_bytes());
    record[4..].copy_from_slice(&errno.to_ne_bytes());
    unsafe { libc::write(fd, record.as_ptr().cast(), record.len()) };
}

/// Channel on which the confined child reports setup failures
///
/// The write end must stay open across the spawn and be closed in the
/// parent right after it; `check` then reads until every child copy is gone.
pub(super) struct SetupReport {
    read: OwnedFd,
    write: Option<OwnedFd>,
}

impl SetupReport {
    pub(super) fn new() -> Result<Self> {
        let (read, write) = cloexec_pipe()?;
        // SAFETY: both descriptors were just created and are owned here.
        let (read, write) = unsafe { (OwnedFd::from_raw_fd(read), OwnedFd::from_raw_fd(write)) };
        Ok(Self {
            read,
            write: Some(write),
        })
    }

    pub(super) fn write_fd(&self) -> RawFd {
        self.write.as_ref().map(|fd| fd.as_raw_fd()).unwrap_or(-1)
    }

    pub(super) fn close_write(&mut self) {
        self.write = None;
    }

    /// Fails with the reported stage if the sandbox could not be set up
    pub(super) fn check(mut self) -> Result<()> {
        self.close_write();
        let mut record = Vec::new();
        fs::File::from(self.read).read_to_end(&mut record)?;
        if record.len() < 8 {
            return Ok(());
        }

        let code = u32::from_ne_bytes([record[0], record[1], record[2], record[3]]);
        let errno = i32::from_ne_bytes([record[4], record[5], record[6], record[7]]);
        let stage = Stage::from_code(code)
            .map(|stage| stage.to_string())
            .unwrap_or_else(|| format!("stage {code}"));
        bail!(
            "sandbox setup failed at {stage}: {}",
            io::Error::from_raw_os_error(errno)
        )
    }
}

/// Whether this host lets an unprivileged process build the confinement
///
/// Checked once per process by running `/bin/sh -c 'exit 0'` confined.
pub fn confinement_available() -> bool {
    static AVAILABLE: OnceLock<bool> = OnceLock::new();
    *AVAILABLE.get_or_init(|| match try_confined_shell() {
        Ok(()) => true,
        Err(e) => {
            log::warn!("Namespace confinement unavailable: {e:#}");
            false
        }
    })
}

fn try_confined_shell() -> Result<()> {
    let base = std::env::temp_dir()
        .join("guardian-confine-check")
        .join(std::process::id().to_string());
    let root = base.join("root");
    let scratch = base.join("box");
    fs::create_dir_all(&root)?;
    fs::create_dir_all(&scratch)?;

    let result = (|| {
        let confinement = Confinement::prepare(&root, &scratch, "/bin/sh")?;
        let mut report = SetupReport::new()?;
        let report_fd = report.write_fd();

        let mut cmd = std::process::Command::new("/bin/sh");
        cmd.args(["-c", "exit 0"])
            .current_dir(&scratch)
            .env_clear()
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        // SAFETY: `enter` only performs async-signal-safe calls.
        unsafe {
            cmd.pre_exec(move || confinement.enter(report_fd));
        }

        let mut child = cmd.spawn()?;
        report.close_write();
        let status = child.wait()?;
        report.check()?;
        if !status.success() {
            bail!("confined shell exited with {status}");
        }
        Ok(())
    })();

    let _ = fs::remove_dir_all(&base);
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prepare_mirrors_host_layout() {
        let base = std::env::temp_dir().join(format!("guardian-confine-{}", crate::create_id()));
        let confinement =
            Confinement::prepare(&base.join("root"), &base.join("box"), "/bin/sh").unwrap();

        assert!(confinement.program.is_some());
        assert!(confinement.uid_map.to_bytes().starts_with(b"0 "));
        let usr = confinement
            .system
            .iter()
            .find(|entry| match entry {
                SystemEntry::Dir { source, .. } => source.to_bytes() == b"/usr",
                SystemEntry::Link { .. } => false,
            })
            .expect("/usr is a directory on every supported host");
        if let SystemEntry::Dir { path, locked, .. } = usr {
            assert!(path.to_bytes().ends_with(b"root/usr"));
            assert!(locked.contains(MsFlags::MS_NOSUID));
        }
        assert!(
            confinement
                .dev_links
                .iter()
                .any(|(target, _)| target.to_bytes() == b"/proc/self/fd")
        );
    }

    #[test]
    fn relative_programs_are_not_checked() {
        let base = std::env::temp_dir().join("guardian-confine-relative");
        let confinement = Confinement::prepare(&base.join("root"), &base.join("box"), "sh").unwrap();
        assert!(confinement.program.is_none());
    }

    #[test]
    fn empty_report_means_setup_succeeded() {
        let report = SetupReport::new().unwrap();
        assert!(report.check().is_ok());
    }

    #[test]
    fn reported_stage_becomes_an_error() {
        let report = SetupReport::new().unwrap();
        super::report(report.write_fd(), Stage::Mount, libc::EPERM);
        let err = report.check().unwrap_err().to_string();
        assert!(err.contains("sandbox setup failed at mount"), "{err}");
    }
}

//! The autofree collector: periodic conservative mark-sweep, gated by
//! `CT_AUTOFREE_SCAN`.
//!
//! A detached worker suspends every other thread of the process, reads
//! their register files and stacks, walks the writable data segments, marks
//! every live allocation a pointer-aligned root word can reach, and
//! transitions the unmarked remainder to `Autofreed`. The table lock is
//! held for the whole mark phase so the sweep sees a consistent view; the
//! actual frees happen after the lock is dropped and the world resumed.
//!
//! Thread suspension is signal-based: each target gets `SIGPWR` via
//! `tgkill`, publishes its stack pointer and callee-visible registers from
//! the `ucontext`, acknowledges on a semaphore and parks until the collector
//! bumps the resume generation. A wall-clock budget (5 ms by default)
//! bounds the mark phase; on overrun the cycle frees nothing.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::OnceLock;

use libc::{c_int, c_void};

use crate::alloc;
use crate::env;
use crate::logger::{ct_log, Level};
use crate::state::{self, Feature};
use crate::table::{table, EntryInfo};

#[cfg(target_os = "linux")]
const SUSPEND_SIGNAL: c_int = libc::SIGPWR;
#[cfg(not(target_os = "linux"))]
const SUSPEND_SIGNAL: c_int = libc::SIGUSR2;
const ACK_TIMEOUT_MS: i64 = 100;
const DEFAULT_PERIOD_NS: u64 = 1_000_000_000;
const DEFAULT_BUDGET_NS: u64 = 5_000_000;
const MAX_REGS: usize = 32;

#[derive(Clone, Copy)]
pub struct GcConfig {
    pub enabled: bool,
    pub scan_at_start: bool,
    pub scan_stack: bool,
    pub scan_regs: bool,
    pub scan_globals: bool,
    pub scan_interior: bool,
    pub ptr_scan: bool,
    pub period_ns: u64,
    pub budget_ns: u64,
    pub debug: bool,
    pub debug_scan: bool,
}

fn env_duration_ns(base: &str, default: u64) -> u64 {
    if let Some(ns) = env::env_usize(&format!("{base}_NS")) {
        return ns as u64;
    }
    if let Some(us) = env::env_usize(&format!("{base}_US")) {
        return us as u64 * 1_000;
    }
    if let Some(ms) = env::env_usize(&format!("{base}_MS")) {
        return ms as u64 * 1_000_000;
    }
    default
}

impl GcConfig {
    fn from_env() -> Self {
        let mut period_ns = env_duration_ns("CT_AUTOFREE_SCAN_PERIOD", DEFAULT_PERIOD_NS);
        if let Some(ms) = env::env_usize("CT_AUTOFREE_SCAN_INTERVAL_MS") {
            period_ns = ms as u64 * 1_000_000;
        }

        Self {
            enabled: env::env_set("CT_AUTOFREE_SCAN"),
            scan_at_start: env::env_set("CT_AUTOFREE_SCAN_START"),
            scan_stack: !matches!(
                std::env::var("CT_AUTOFREE_SCAN_STACK").as_deref(),
                Ok("0")
            ),
            scan_regs: !matches!(std::env::var("CT_AUTOFREE_SCAN_REGS").as_deref(), Ok("0")),
            scan_globals: !matches!(
                std::env::var("CT_AUTOFREE_SCAN_GLOBALS").as_deref(),
                Ok("0")
            ),
            scan_interior: env::env_set("CT_AUTOFREE_SCAN_INTERIOR"),
            ptr_scan: env::env_set("CT_AUTOFREE_SCAN_PTR"),
            period_ns,
            budget_ns: env_duration_ns("CT_AUTOFREE_SCAN_BUDGET", DEFAULT_BUDGET_NS),
            debug: env::env_set("CT_DEBUG_AUTOFREE"),
            debug_scan: env::env_set("CT_DEBUG_AUTOFREE_SCAN"),
        }
    }
}

fn config() -> &'static GcConfig {
    static CONFIG: OnceLock<GcConfig> = OnceLock::new();
    CONFIG.get_or_init(GcConfig::from_env)
}

pub fn pointer_scan_enabled() -> bool {
    config().ptr_scan
}

fn now_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

// ---------------------------------------------------------------------------
// Stop-the-world machinery
// ---------------------------------------------------------------------------

struct HandshakeSlot {
    sp: UnsafeCell<usize>,
    regs: UnsafeCell<[usize; MAX_REGS]>,
    reg_count: UnsafeCell<usize>,
}

unsafe impl Sync for HandshakeSlot {}

static SLOT: HandshakeSlot = HandshakeSlot {
    sp: UnsafeCell::new(0),
    regs: UnsafeCell::new([0; MAX_REGS]),
    reg_count: UnsafeCell::new(0),
};

struct AckSem(UnsafeCell<std::mem::MaybeUninit<libc::sem_t>>);
unsafe impl Sync for AckSem {}
static ACK: AckSem = AckSem(UnsafeCell::new(std::mem::MaybeUninit::uninit()));

fn ack_sem() -> *mut libc::sem_t {
    ACK.0.get() as *mut libc::sem_t
}

static IN_GC: AtomicBool = AtomicBool::new(false);
static RESUME_GEN: AtomicU32 = AtomicU32::new(0);
static HANDLER_INSTALLED: AtomicUsize = AtomicUsize::new(0);

/// Pull the stack pointer and general registers out of a `ucontext_t`.
/// Conservative scanning wants every register that may carry a pointer.
unsafe fn harvest_context(ctx: *const libc::ucontext_t, regs: &mut [usize; MAX_REGS]) -> (usize, usize) {
    #[cfg(target_arch = "x86_64")]
    {
        let gregs = &(*ctx).uc_mcontext.gregs;
        let mut count = 0;
        for value in gregs.iter() {
            if count == MAX_REGS {
                break;
            }
            regs[count] = *value as usize;
            count += 1;
        }
        ((*ctx).uc_mcontext.gregs[libc::REG_RSP as usize] as usize, count)
    }
    #[cfg(target_arch = "aarch64")]
    {
        let mc = &(*ctx).uc_mcontext;
        let mut count = 0;
        for value in mc.regs.iter() {
            if count == MAX_REGS {
                break;
            }
            regs[count] = *value as usize;
            count += 1;
        }
        (mc.sp as usize, count)
    }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        let _ = ctx;
        (0, 0)
    }
}

extern "C" fn suspend_handler(
    _signo: c_int,
    _info: *mut libc::siginfo_t,
    ctx: *mut c_void,
) {
    if !IN_GC.load(Ordering::Acquire) {
        return;
    }
    let entry_gen = RESUME_GEN.load(Ordering::Acquire);

    unsafe {
        let mut regs = [0usize; MAX_REGS];
        let (sp, count) = harvest_context(ctx as *const libc::ucontext_t, &mut regs);
        *SLOT.sp.get() = sp;
        *SLOT.regs.get() = regs;
        *SLOT.reg_count.get() = count;
        libc::sem_post(ack_sem());
    }

    // Park until the collector bumps the generation. Plain sleeping keeps
    // the handler async-signal-safe.
    let delay = libc::timespec {
        tv_sec: 0,
        tv_nsec: 1_000_000,
    };
    while IN_GC.load(Ordering::Acquire) && RESUME_GEN.load(Ordering::Acquire) == entry_gen {
        unsafe { libc::nanosleep(&delay, std::ptr::null_mut()) };
    }
}

fn install_handler() {
    if HANDLER_INSTALLED
        .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return;
    }
    unsafe {
        libc::sem_init(ack_sem(), 0, 0);

        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = suspend_handler as usize;
        sa.sa_flags = libc::SA_SIGINFO | libc::SA_RESTART;
        libc::sigemptyset(&mut sa.sa_mask);
        libc::sigaction(SUSPEND_SIGNAL, &sa, std::ptr::null_mut());
    }
}

fn list_other_threads() -> Vec<i32> {
    let self_tid = unsafe { libc::syscall(libc::SYS_gettid) } as i32;
    let mut tids = Vec::new();
    let Ok(entries) = std::fs::read_dir("/proc/self/task") else {
        return tids;
    };
    for entry in entries.flatten() {
        if let Ok(tid) = entry.file_name().to_string_lossy().parse::<i32>() {
            if tid != self_tid {
                tids.push(tid);
            }
        }
    }
    tids
}

struct SuspendedThread {
    tid: i32,
    sp: usize,
    regs: [usize; MAX_REGS],
    reg_count: usize,
}

/// Suspend every other thread, one handshake at a time. Threads that die
/// between listing and signalling are skipped after a timeout.
fn suspend_world() -> Vec<SuspendedThread> {
    install_handler();

    unsafe {
        // Drain stale acknowledgements from a previous timed-out cycle.
        while libc::sem_trywait(ack_sem()) == 0 {}
    }

    let pid = unsafe { libc::getpid() };
    let mut suspended = Vec::new();

    for tid in list_other_threads() {
        let rc = unsafe {
            libc::syscall(
                libc::SYS_tgkill,
                pid as libc::c_long,
                tid as libc::c_long,
                SUSPEND_SIGNAL as libc::c_long,
            )
        };
        if rc != 0 {
            continue;
        }

        let mut deadline = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut deadline) };
        deadline.tv_nsec += ACK_TIMEOUT_MS * 1_000_000;
        deadline.tv_sec += deadline.tv_nsec / 1_000_000_000;
        deadline.tv_nsec %= 1_000_000_000;

        let rc = unsafe { libc::sem_timedwait(ack_sem(), &deadline) };
        if rc != 0 {
            continue;
        }

        unsafe {
            suspended.push(SuspendedThread {
                tid,
                sp: *SLOT.sp.get(),
                regs: *SLOT.regs.get(),
                reg_count: *SLOT.reg_count.get(),
            });
        }
    }

    suspended
}

fn resume_world() {
    RESUME_GEN.fetch_add(1, Ordering::AcqRel);
}

// ---------------------------------------------------------------------------
// Root discovery
// ---------------------------------------------------------------------------

/// The mapped region `[start, end)` containing `addr`, from
/// `/proc/self/maps`. Used to bound stack scans below the guard page.
fn region_containing(addr: usize) -> Option<(usize, usize)> {
    let maps = std::fs::read_to_string("/proc/self/maps").ok()?;
    for line in maps.lines() {
        let range = line.split_whitespace().next()?;
        let (start, end) = range.split_once('-')?;
        let start = usize::from_str_radix(start, 16).ok()?;
        let end = usize::from_str_radix(end, 16).ok()?;
        if addr >= start && addr < end {
            return Some((start, end));
        }
    }
    None
}

/// Writable `PT_LOAD` segments of the main executable: the data/BSS roots.
fn data_segments() -> Vec<(usize, usize)> {
    struct Ctx {
        segments: Vec<(usize, usize)>,
    }

    unsafe extern "C" fn callback(
        info: *mut libc::dl_phdr_info,
        _size: libc::size_t,
        data: *mut c_void,
    ) -> c_int {
        let ctx = &mut *(data as *mut Ctx);
        let info = &*info;

        // Only the main executable: its name entry is empty.
        if !info.dlpi_name.is_null() && *info.dlpi_name != 0 {
            return 0;
        }

        for i in 0..info.dlpi_phnum {
            let phdr = &*info.dlpi_phdr.add(i as usize);
            if phdr.p_type != libc::PT_LOAD || phdr.p_flags & libc::PF_W == 0 {
                continue;
            }
            let start = info.dlpi_addr as usize + phdr.p_vaddr as usize;
            ctx.segments.push((start, start + phdr.p_memsz as usize));
        }
        0
    }

    let mut ctx = Ctx {
        segments: Vec::new(),
    };
    unsafe {
        libc::dl_iterate_phdr(Some(callback), &mut ctx as *mut Ctx as *mut c_void);
    }
    ctx.segments
}

fn approximate_own_sp() -> usize {
    let marker = 0u8;
    &marker as *const u8 as usize
}

/// Visit every pointer-aligned word in `[start, end)`.
fn scan_words(start: usize, end: usize, mut visit: impl FnMut(usize) -> bool) -> bool {
    let word = std::mem::size_of::<usize>();
    let mut addr = (start + word - 1) & !(word - 1);
    while addr + word <= end {
        let value = unsafe { std::ptr::read_volatile(addr as *const usize) };
        if !visit(value) {
            return false;
        }
        addr += word;
    }
    true
}

struct RootSet {
    register_words: Vec<usize>,
    stack_ranges: Vec<(usize, usize)>,
    global_ranges: Vec<(usize, usize)>,
}

fn collect_roots(threads: &[SuspendedThread]) -> RootSet {
    let cfg = config();
    let mut roots = RootSet {
        register_words: Vec::new(),
        stack_ranges: Vec::new(),
        global_ranges: Vec::new(),
    };

    if cfg.scan_regs {
        for thread in threads {
            roots
                .register_words
                .extend_from_slice(&thread.regs[..thread.reg_count]);
        }
    }

    if cfg.scan_stack {
        for thread in threads {
            if thread.sp == 0 {
                continue;
            }
            if let Some((_, top)) = region_containing(thread.sp) {
                roots.stack_ranges.push((thread.sp, top));
            }
        }
        // The collector's own stack pins nothing it allocated, but a
        // single-threaded program's only roots live here.
        let own_sp = approximate_own_sp();
        if let Some((_, top)) = region_containing(own_sp) {
            roots.stack_ranges.push((own_sp, top));
        }
    }

    if cfg.scan_globals {
        roots.global_ranges = data_segments();
    }

    roots
}

// ---------------------------------------------------------------------------
// Collection
// ---------------------------------------------------------------------------

/// One collection cycle. Returns the number of reclaimed allocations.
pub fn gc() -> usize {
    let cfg = config();
    if !cfg.enabled || !state::enabled(Feature::Alloc) || !state::enabled(Feature::Autofree) {
        return 0;
    }

    IN_GC.store(true, Ordering::Release);
    let threads = suspend_world();
    let roots = collect_roots(&threads);

    let deadline = now_ns() + cfg.budget_ns;
    let mut victims: Vec<EntryInfo> = Vec::new();

    let timed_out = table().locked(|inner| {
        inner.clear_marks();

        let mut checked = 0usize;
        let mut over_budget = false;
        let mut visit = |value: usize| -> bool {
            inner_mark(inner, value, cfg.scan_interior);
            checked += 1;
            // The clock is coarse; only sample it every few words.
            if checked % 1024 == 0 && now_ns() > deadline {
                over_budget = true;
                return false;
            }
            true
        };

        'mark: {
            for &word in &roots.register_words {
                if !visit(word) {
                    break 'mark;
                }
            }
            for &(start, end) in &roots.stack_ranges {
                if !scan_words(start, end, &mut visit) {
                    break 'mark;
                }
            }
            for &(start, end) in &roots.global_ranges {
                if !scan_words(start, end, &mut visit) {
                    break 'mark;
                }
            }
        }

        if over_budget {
            return true;
        }

        inner.sweep_unmarked(|info| victims.push(info));
        false
    });

    resume_world();
    IN_GC.store(false, Ordering::Release);

    if timed_out {
        if cfg.debug {
            ct_log!(
                Level::Warn,
                "ct: autofree scan over budget, skipping sweep (threads={})\n",
                threads.len()
            );
        }
        return 0;
    }

    for info in &victims {
        if state::enabled(Feature::Shadow) {
            crate::shadow::poison_range(info.base, info.real_size);
        }
        if cfg.debug {
            ct_log!(
                Level::Warn,
                "ct: autofree sweep ptr={:#x} size={} site={}\n",
                info.base,
                info.real_size,
                crate::logger::site_name(info.site)
            );
        }
        alloc::release_entry(info);
    }

    victims.len()
}

fn inner_mark(inner: &mut crate::table::Inner, value: usize, interior: bool) {
    // Cheap pre-filter: heap pointers are word-aligned and well above the
    // first page.
    if value < 0x1000 || value & (std::mem::size_of::<usize>() - 1) != 0 {
        return;
    }
    inner.mark_address(value, interior);
}

/// Single-shot scan used by the autofree entry points under
/// `CT_AUTOFREE_SCAN_PTR`: is `ptr` referenced anywhere in the process?
pub fn pointer_is_referenced(ptr: usize) -> bool {
    let cfg = config();
    if !cfg.ptr_scan {
        return false;
    }

    IN_GC.store(true, Ordering::Release);
    let threads = suspend_world();
    let roots = collect_roots(&threads);

    let mut found = false;
    let mut visit = |value: usize| -> bool {
        if value == ptr {
            found = true;
            return false;
        }
        true
    };

    'scan: {
        for &word in &roots.register_words {
            if !visit(word) {
                break 'scan;
            }
        }
        for &(start, end) in &roots.stack_ranges {
            if !scan_words(start, end, &mut visit) {
                break 'scan;
            }
        }
        for &(start, end) in &roots.global_ranges {
            if !scan_words(start, end, &mut visit) {
                break 'scan;
            }
        }
    }

    resume_world();
    IN_GC.store(false, Ordering::Release);

    if cfg.debug_scan {
        ct_log!(
            Level::Info,
            "ct: autofree ptr-scan ptr={:#x} referenced={}\n",
            ptr,
            found
        );
    }
    found
}

/// Start the worker when `CT_AUTOFREE_SCAN` is set; called from the
/// runtime constructor.
pub fn maybe_start() {
    let cfg = config();
    if !cfg.enabled {
        return;
    }

    install_handler();

    if cfg.scan_at_start {
        gc();
    }

    let period_ns = cfg.period_ns.max(1);
    std::thread::Builder::new()
        .name("ct-autofree".into())
        .spawn(move || loop {
            gc();
            std::thread::sleep(std::time::Duration::from_nanos(period_ns));
        })
        .ok();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_env_prefers_finest_unit() {
        std::env::set_var("CT_TEST_GC_DUR_MS", "2");
        assert_eq!(env_duration_ns("CT_TEST_GC_DUR", 7), 2_000_000);
        std::env::set_var("CT_TEST_GC_DUR_US", "3");
        assert_eq!(env_duration_ns("CT_TEST_GC_DUR", 7), 3_000);
        std::env::set_var("CT_TEST_GC_DUR_NS", "4");
        assert_eq!(env_duration_ns("CT_TEST_GC_DUR", 7), 4);
        std::env::remove_var("CT_TEST_GC_DUR_NS");
        std::env::remove_var("CT_TEST_GC_DUR_US");
        std::env::remove_var("CT_TEST_GC_DUR_MS");
        assert_eq!(env_duration_ns("CT_TEST_GC_DUR", 7), 7);
    }

    #[test]
    fn scan_words_visits_aligned_words_only() {
        let buf: [usize; 8] = [1, 2, 3, 4, 5, 6, 7, 8];
        let start = buf.as_ptr() as usize;
        let end = start + std::mem::size_of_val(&buf);
        let mut seen = Vec::new();
        scan_words(start, end, |value| {
            seen.push(value);
            true
        });
        assert_eq!(seen, vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn scan_words_stops_on_request() {
        let buf: [usize; 4] = [10, 20, 30, 40];
        let start = buf.as_ptr() as usize;
        let end = start + std::mem::size_of_val(&buf);
        let mut count = 0;
        let completed = scan_words(start, end, |_| {
            count += 1;
            count < 2
        });
        assert!(!completed);
        assert_eq!(count, 2);
    }

    #[test]
    fn own_stack_region_is_resolvable() {
        let sp = approximate_own_sp();
        let (start, end) = region_containing(sp).expect("stack region");
        assert!(start <= sp && sp < end);
    }

    #[test]
    fn data_segments_are_nonempty_and_writable_sized() {
        let segments = data_segments();
        assert!(!segments.is_empty());
        for (start, end) in segments {
            assert!(start < end);
        }
    }
}

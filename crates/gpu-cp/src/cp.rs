//! The command parser: one batch being filled for one ring.
//!
//! Space accounting works in dwords. `size` is what commands and stolen state
//! may occupy together; it excludes the end-of-batch marker and whatever the
//! current owner reserved for the commands it emits when it loses the floor.
//! `used + stolen <= size` holds between any two calls.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use tracing::{debug, error};

use crate::bo::BufferObject;
use crate::builder::{Builder, BuilderSnapshot, FinishedBatch};
use crate::config::{CpConfig, DebugFlags};
use crate::error::Result;
use crate::owner::{OwnerId, ReleaseHook};
use crate::packet::{self, BATCH_END, NOOP};
use crate::shader_cache::ShaderCache;
use crate::stats::CpStats;
use crate::winsys::{ContextId, Domains, Ring, SubmitFlags, Submission, Winsys};

/// Dwords held back from every batch for `BATCH_END` and its padding.
pub const BATCH_END_DWORDS: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing was pending.
    Empty,
    Submitted,
    /// The winsys rejected the batch; its contents are lost.
    SubmitFailed,
}

#[derive(Debug, Clone, Copy)]
struct CommandWindow {
    cur: u32,
    end: u32,
}

pub struct CommandParser {
    winsys: Arc<dyn Winsys>,
    debug: DebugFlags,
    builder: Builder,
    ring: Ring,
    render_context: Option<ContextId>,

    size: u32,
    owner: OwnerId,
    owner_reserve: u32,
    release_hooks: Vec<(OwnerId, ReleaseHook)>,
    no_implicit_flush: bool,

    window: Option<CommandWindow>,
    one_off_flags: SubmitFlags,
    last_submitted: Option<Arc<BufferObject>>,

    flush_callback: Option<Box<dyn FnMut()>>,
    discard_callback: Option<Box<dyn FnMut()>>,
    shader_cache: Option<Rc<RefCell<ShaderCache>>>,
    stats: CpStats,
}

impl CommandParser {
    pub fn new(winsys: Arc<dyn Winsys>, config: &CpConfig) -> Result<Self> {
        assert!(
            config.batch_dwords > BATCH_END_DWORDS,
            "batch of {} dwords cannot hold the end marker",
            config.batch_dwords
        );
        let mut builder = Builder::new(Arc::clone(&winsys), config.batch_dwords);
        builder.begin()?;
        let render_context = winsys.create_context();

        Ok(Self {
            winsys,
            debug: config.debug,
            builder,
            ring: Ring::Render,
            render_context,
            size: config.batch_dwords - BATCH_END_DWORDS,
            owner: OwnerId::None,
            owner_reserve: 0,
            release_hooks: Vec::new(),
            no_implicit_flush: false,
            window: None,
            one_off_flags: SubmitFlags::empty(),
            last_submitted: None,
            flush_callback: None,
            discard_callback: None,
            shader_cache: None,
            stats: CpStats::new(),
        })
    }

    fn base_size(&self) -> u32 {
        self.builder.capacity() - BATCH_END_DWORDS
    }

    pub fn winsys(&self) -> &Arc<dyn Winsys> {
        &self.winsys
    }

    pub fn debug_flags(&self) -> DebugFlags {
        self.debug
    }

    pub fn ring(&self) -> Ring {
        self.ring
    }

    pub fn owner(&self) -> OwnerId {
        self.owner
    }

    pub fn owner_reserve(&self) -> u32 {
        self.owner_reserve
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn used(&self) -> u32 {
        self.builder.used()
    }

    pub fn stolen(&self) -> u32 {
        self.builder.stolen()
    }

    /// Dwords still available to commands and stolen state.
    pub fn space(&self) -> u32 {
        self.size - self.used() - self.stolen()
    }

    pub fn is_empty(&self) -> bool {
        self.used() == 0
    }

    pub fn builder(&self) -> &Builder {
        &self.builder
    }

    pub fn batch_bo(&self) -> Option<Arc<BufferObject>> {
        self.builder.bo().cloned()
    }

    pub fn last_submitted(&self) -> Option<&Arc<BufferObject>> {
        self.last_submitted.as_ref()
    }

    pub fn render_context(&self) -> Option<ContextId> {
        self.render_context
    }

    pub fn set_render_context(&mut self, context: Option<ContextId>) {
        self.render_context = context;
    }

    pub fn stats(&self) -> &CpStats {
        &self.stats
    }

    pub fn one_off_flags(&self) -> SubmitFlags {
        self.one_off_flags
    }

    /// Adds flags to the next submission only.
    pub fn set_one_off_flags(&mut self, flags: SubmitFlags) {
        self.one_off_flags |= flags;
    }

    /// Installs the release hook called whenever `id` loses the floor.
    pub fn register_owner(&mut self, id: OwnerId, hook: ReleaseHook) {
        self.release_hooks.retain(|(owner, _)| *owner != id);
        self.release_hooks.push((id, hook));
    }

    /// Installs the callback run after every successful submission.
    pub fn set_flush_callback(&mut self, callback: impl FnMut() + 'static) {
        self.flush_callback = Some(Box::new(callback));
    }

    /// Installs the callback run when a batch is dropped instead of executed,
    /// so state emitted into it must be emitted again.
    pub fn set_discard_callback(&mut self, callback: impl FnMut() + 'static) {
        self.discard_callback = Some(Box::new(callback));
    }

    /// Kernel cache to invalidate when a submission fails.
    pub fn set_shader_cache(&mut self, cache: Rc<RefCell<ShaderCache>>) {
        self.shader_cache = Some(cache);
    }

    /// Forbids (or allows again) implicit flushes. Returns the previous setting.
    pub fn assert_no_implicit_flush(&mut self, enable: bool) -> bool {
        std::mem::replace(&mut self.no_implicit_flush, enable)
    }

    /// Runs `f` with implicit flushes forbidden.
    pub fn without_implicit_flush<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        let prev = self.assert_no_implicit_flush(true);
        let ret = f(self);
        self.no_implicit_flush = prev;
        ret
    }

    /// Opens a window of exactly `len` dwords for one command, flushing first
    /// when the batch cannot hold it.
    pub fn begin_command(&mut self, len: u32) -> Result<()> {
        assert!(self.window.is_none(), "command begun inside another command");
        if len > self.space() {
            self.implicit_flush()?;
            assert!(
                len <= self.space(),
                "{len}-dword command does not fit an empty batch of {} dwords",
                self.space()
            );
        }
        let start = self.builder.claim(len);
        self.window = Some(CommandWindow {
            cur: start,
            end: start + len,
        });
        Ok(())
    }

    fn advance(&mut self, len: u32) -> u32 {
        let Some(window) = self.window.as_mut() else {
            panic!("command data written outside of a command");
        };
        assert!(
            window.cur + len <= window.end,
            "command overruns its window by {} dwords",
            window.cur + len - window.end
        );
        let pos = window.cur;
        window.cur += len;
        pos
    }

    pub fn write(&mut self, dword: u32) {
        let pos = self.advance(1);
        self.builder.write(pos, dword);
    }

    pub fn write_multi(&mut self, dwords: &[u32]) {
        let pos = self.advance(dwords.len() as u32);
        self.builder.write_multi(pos, dwords);
    }

    /// Writes the presumed address of `target + delta` and records a relocation.
    pub fn write_bo(
        &mut self,
        delta: u64,
        target: &Arc<BufferObject>,
        read_domains: Domains,
        write_domain: Domains,
    ) {
        let pos = self.advance(1);
        self.builder
            .write_reloc(pos, target, delta, read_domains, write_domain);
    }

    pub fn end_command(&mut self) {
        let Some(window) = self.window.take() else {
            panic!("end_command without begin_command");
        };
        assert_eq!(
            window.cur, window.end,
            "command ended {} dwords short of its length",
            window.end - window.cur
        );
    }

    /// Steals `size` dwords aligned to `align` from the top of the batch and
    /// returns their byte offset in the batch buffer.
    pub fn steal(&mut self, size: u32, align: u32) -> Result<u32> {
        assert!(self.window.is_none(), "state stolen inside a command");
        if Builder::steal_cost(size, align) > self.space() {
            self.implicit_flush()?;
        }
        match self.builder.steal(size, align) {
            Some(offset) if self.used() + self.stolen() <= self.size => Ok(offset),
            _ => panic!("{size}-dword state block does not fit an empty batch"),
        }
    }

    pub fn write_stolen(&mut self, offset: u32, dwords: &[u32]) {
        self.builder.write_multi(offset / 4, dwords);
    }

    pub fn snapshot(&self) -> BuilderSnapshot {
        self.builder.snapshot()
    }

    /// Throws away everything written since `snapshot`. Returns `false` when
    /// the batch was flushed in between.
    pub fn rewind(&mut self, snapshot: &BuilderSnapshot) -> bool {
        assert!(self.window.is_none(), "rewind inside a command");
        self.builder.rewind(snapshot)
    }

    pub fn validate(&self, extra: &[&Arc<BufferObject>]) -> bool {
        self.builder.validate(extra)
    }

    pub fn has_reloc(&self, bo: &BufferObject) -> bool {
        self.builder.has_reloc(bo)
    }

    /// Switches engines. A batch never spans two rings, so this flushes
    /// whatever is pending for the old one.
    pub fn set_ring(&mut self, ring: Ring) -> Result<()> {
        if self.ring != ring {
            self.flush("ring change")?;
            self.ring = ring;
        }
        Ok(())
    }

    /// Hands the floor to `owner` with `reserve` dwords held back for its
    /// release hook.
    ///
    /// Returns `true` when `owner` (re)acquired the floor, either because it
    /// took over from someone else or because the reservation forced a flush
    /// that released it. Either way whatever it paused must be resumed, and
    /// `space()` covers at least `reserve` more dwords for doing so.
    pub fn set_owner(&mut self, owner: OwnerId, reserve: u32) -> Result<bool> {
        let reserve = if owner == OwnerId::None { 0 } else { reserve };

        if self.owner != owner {
            self.release_owner();
        }
        if reserve != self.owner_reserve {
            self.carve_reserve(reserve)?;
        }

        let is_new = self.owner != owner;
        if is_new && owner != OwnerId::None {
            self.stats.inc_owner_switches();
            debug!(?owner, reserve, ring = ?self.ring, "command parser owner changed");
        }
        self.owner = owner;
        Ok(is_new)
    }

    fn carve_reserve(&mut self, reserve: u32) -> Result<()> {
        let pending = self.used() + self.stolen();
        let base = self.size + self.owner_reserve;
        if reserve > self.owner_reserve && pending + 2 * reserve > base {
            self.implicit_flush()?;
            let pending = self.used() + self.stolen();
            assert!(
                pending + reserve <= self.size + self.owner_reserve,
                "reservation of {reserve} dwords does not fit an empty batch"
            );
        }
        let base = self.size + self.owner_reserve;
        self.size = base - reserve;
        self.owner_reserve = reserve;
        Ok(())
    }

    fn release_owner(&mut self) {
        let owner = std::mem::take(&mut self.owner);
        self.size += self.owner_reserve;
        self.owner_reserve = 0;
        if owner == OwnerId::None {
            return;
        }

        let hook = self
            .release_hooks
            .iter()
            .find(|(id, _)| *id == owner)
            .and_then(|(_, hook)| hook.upgrade());
        if let Some(hook) = hook {
            let prev = self.assert_no_implicit_flush(true);
            hook.borrow_mut().release(self);
            self.no_implicit_flush = prev;
        }
    }

    fn implicit_flush(&mut self) -> Result<()> {
        if self.no_implicit_flush {
            error!(
                used = self.used(),
                stolen = self.stolen(),
                size = self.size,
                owner = ?self.owner,
                "implicit flush while implicit flushes are forbidden"
            );
            panic!("unexpected implicit flush: a reservation or command estimate is too small");
        }
        self.stats.inc_implicit_flushes();
        self.flush("out of space (implicit)")?;
        Ok(())
    }

    fn emit_batch_end(&mut self) {
        // Keep the batch length a whole number of qwords.
        let len = if self.used() % 2 == 1 { 1 } else { 2 };
        let pos = self.builder.claim(len);
        self.builder.write(pos, BATCH_END);
        if len == 2 {
            self.builder.write(pos + 1, NOOP);
        }
    }

    fn dump(&self, batch: &FinishedBatch) {
        let words = batch.bo.read_dwords(0, batch.used_dwords as usize);
        debug!(
            target: "gpu_cp::dump",
            ring = ?self.ring,
            dwords = batch.used_dwords,
            relocs = batch.relocations.len(),
            "batch contents"
        );
        for line in packet::disassemble(&words).lines() {
            debug!(target: "gpu_cp::dump", "{line}");
        }
    }

    /// Ends the current batch, submits it and starts a new one.
    pub fn flush(&mut self, reason: &str) -> Result<FlushOutcome> {
        assert!(self.window.is_none(), "flush inside a command");

        if self.is_empty() {
            // Stolen state without commands is referenced by nothing.
            self.builder.reset();
            self.stats.inc_empty_flushes();
            return Ok(FlushOutcome::Empty);
        }

        self.release_owner();
        self.emit_batch_end();
        self.stats.inc_flushes();

        let outcome = match self.builder.end() {
            Some(batch) => self.submit(batch, reason),
            None => {
                // A previous begin() failed; there is no buffer to submit from.
                error!(reason, "dropping batch that has no buffer");
                self.builder.discard();
                FlushOutcome::SubmitFailed
            }
        };
        self.one_off_flags = SubmitFlags::empty();

        let callback = match outcome {
            FlushOutcome::Submitted => self.flush_callback.as_mut(),
            _ => self.discard_callback.as_mut(),
        };
        if let Some(callback) = callback {
            callback();
        }

        self.size = self.base_size();
        self.builder.begin()?;
        Ok(outcome)
    }

    fn submit(&mut self, batch: FinishedBatch, reason: &str) -> FlushOutcome {
        if self.debug.contains(DebugFlags::DUMP_3D) {
            self.dump(&batch);
        }

        let submission = Submission {
            ring: self.ring,
            batch: &batch.bo,
            used_dwords: batch.used_dwords,
            relocations: &batch.relocations,
            context: match self.ring {
                Ring::Render => self.render_context,
                Ring::Blt => None,
            },
            flags: self.one_off_flags,
        };
        let result = if self.debug.contains(DebugFlags::NO_HW) {
            Ok(())
        } else {
            self.winsys.submit(&submission)
        };

        match result {
            Ok(()) => {
                debug!(
                    reason,
                    ring = ?self.ring,
                    dwords = batch.used_dwords,
                    relocs = batch.relocations.len(),
                    "submitted batch"
                );
                self.stats
                    .add_dwords_submitted(u64::from(batch.used_dwords));
                self.last_submitted = Some(batch.bo);
                FlushOutcome::Submitted
            }
            Err(err) => {
                error!(reason, %err, "batch submission failed, dropping its contents");
                self.stats.inc_submit_failures();
                // Kernels uploaded for this batch may never have landed.
                if let Some(cache) = &self.shader_cache {
                    cache.borrow_mut().invalidate();
                }
                FlushOutcome::SubmitFailed
            }
        }
    }
}

impl fmt::Debug for CommandParser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandParser")
            .field("ring", &self.ring)
            .field("size", &self.size)
            .field("used", &self.used())
            .field("stolen", &self.stolen())
            .field("owner", &self.owner)
            .field("owner_reserve", &self.owner_reserve)
            .field("one_off_flags", &self.one_off_flags)
            .field("builder", &self.builder)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::owner::OwnerRelease;
    use crate::soft::SoftwareWinsys;

    const MARKER: u32 = 0x0123_4567;

    struct Recorder {
        releases: u32,
        emit: u32,
        saw_owner: Vec<OwnerId>,
    }

    impl Recorder {
        fn new(emit: u32) -> Rc<RefCell<Self>> {
            Rc::new(RefCell::new(Self {
                releases: 0,
                emit,
                saw_owner: Vec::new(),
            }))
        }
    }

    impl OwnerRelease for Recorder {
        fn release(&mut self, cp: &mut CommandParser) {
            self.releases += 1;
            self.saw_owner.push(cp.owner());
            if self.emit > 0 {
                cp.begin_command(self.emit).unwrap();
                for _ in 0..self.emit {
                    cp.write(MARKER);
                }
                cp.end_command();
            }
        }
    }

    fn parser(batch_dwords: u32) -> (Arc<SoftwareWinsys>, CommandParser) {
        let winsys = Arc::new(SoftwareWinsys::new(1 << 24));
        let config = CpConfig {
            batch_dwords,
            ..CpConfig::default()
        };
        let cp = CommandParser::new(winsys.clone(), &config).unwrap();
        (winsys, cp)
    }

    fn emit_noops(cp: &mut CommandParser, len: u32) {
        cp.begin_command(len).unwrap();
        for _ in 0..len {
            cp.write(NOOP);
        }
        cp.end_command();
    }

    fn register(cp: &mut CommandParser, id: OwnerId, hook: &Rc<RefCell<Recorder>>) {
        let weak = Rc::downgrade(hook);
        cp.register_owner(id, weak);
    }

    #[test]
    fn reserve_of_100_out_of_1000_flushes_exactly_once() {
        let (winsys, mut cp) = parser(1000 + BATCH_END_DWORDS);
        let owner = Recorder::new(0);
        register(&mut cp, OwnerId::QueryRing, &owner);

        assert!(cp.set_owner(OwnerId::QueryRing, 100).unwrap());
        assert_eq!(cp.size(), 900);

        for _ in 0..19 {
            emit_noops(&mut cp, 50);
            assert!(cp.used() + cp.stolen() <= cp.size());
        }

        assert_eq!(cp.stats().snapshot().implicit_flushes, 1);
        assert_eq!(winsys.submissions().len(), 1);
        assert_eq!(owner.borrow().releases, 1);
        assert_eq!(cp.used(), 50);
        assert_eq!(cp.owner(), OwnerId::None);
        assert_eq!(cp.size(), 1000);
    }

    #[test]
    fn same_owner_twice_does_not_release() {
        let (_winsys, mut cp) = parser(256);
        let owner = Recorder::new(0);
        register(&mut cp, OwnerId::QueryRing, &owner);

        assert!(cp.set_owner(OwnerId::QueryRing, 10).unwrap());
        let size = cp.size();
        assert!(!cp.set_owner(OwnerId::QueryRing, 10).unwrap());
        assert_eq!(cp.size(), size);
        assert_eq!(owner.borrow().releases, 0);
    }

    #[test]
    fn hand_off_releases_previous_owner_before_new_commands() {
        let (_winsys, mut cp) = parser(256);
        let a = Recorder::new(4);
        register(&mut cp, OwnerId::QueryRing, &a);

        cp.set_owner(OwnerId::QueryRing, 4).unwrap();
        emit_noops(&mut cp, 3);
        assert!(cp.set_owner(OwnerId::Blit, 0).unwrap());
        assert_eq!(a.borrow().releases, 1);
        // The old owner was already gone while its hook ran.
        assert_eq!(a.borrow().saw_owner, vec![OwnerId::None]);

        cp.begin_command(1).unwrap();
        cp.write(0xb);
        cp.end_command();

        let batch = cp.builder.end().unwrap();
        let words = batch.bo.read_dwords(0, batch.used_dwords as usize);
        assert_eq!(&words[3..7], &[MARKER; 4]);
        assert_eq!(words[7], 0xb);
    }

    #[test]
    fn release_space_comes_from_the_reservation() {
        let (_winsys, mut cp) = parser(64 + BATCH_END_DWORDS);
        let a = Recorder::new(8);
        register(&mut cp, OwnerId::QueryRing, &a);

        cp.set_owner(OwnerId::QueryRing, 8).unwrap();
        let space = cp.space();
        emit_noops(&mut cp, space);
        assert_eq!(cp.space(), 0);

        // Losing the floor with a full batch must not flush.
        cp.set_owner(OwnerId::None, 0).unwrap();
        assert_eq!(cp.stats().snapshot().flushes, 0);
        assert_eq!(cp.used(), 64);
    }

    #[test]
    fn growing_reservation_of_a_full_batch_reacquires() {
        let (winsys, mut cp) = parser(64 + BATCH_END_DWORDS);
        let a = Recorder::new(0);
        register(&mut cp, OwnerId::QueryRing, &a);

        assert!(cp.set_owner(OwnerId::QueryRing, 4).unwrap());
        emit_noops(&mut cp, 50);
        assert!(cp.set_owner(OwnerId::QueryRing, 8).unwrap());
        assert_eq!(a.borrow().releases, 1);
        assert_eq!(winsys.submissions().len(), 1);
        assert_eq!(cp.size(), 56);
        assert!(cp.space() >= 8);
    }

    #[test]
    fn flush_of_empty_batch_is_a_noop() {
        let (winsys, mut cp) = parser(128);
        let calls = Rc::new(Cell::new(0));
        let seen = calls.clone();
        cp.set_flush_callback(move || seen.set(seen.get() + 1));

        cp.steal(8, 1).unwrap();
        assert_eq!(cp.flush("test").unwrap(), FlushOutcome::Empty);
        assert_eq!(cp.stolen(), 0);
        assert!(winsys.submissions().is_empty());
        assert_eq!(calls.get(), 0);
        assert!(cp.last_submitted().is_none());
    }

    #[test]
    fn flush_submits_and_replaces_last_submitted() {
        let (winsys, mut cp) = parser(128);
        let calls = Rc::new(Cell::new(0));
        let seen = calls.clone();
        cp.set_flush_callback(move || seen.set(seen.get() + 1));

        emit_noops(&mut cp, 3);
        assert_eq!(cp.flush("first").unwrap(), FlushOutcome::Submitted);
        let first = cp.last_submitted().unwrap().id();

        emit_noops(&mut cp, 2);
        cp.flush("second").unwrap();
        let second = cp.last_submitted().unwrap().id();

        assert_ne!(first, second);
        assert_eq!(calls.get(), 2);
        let submissions = winsys.submissions();
        // Odd length gets a bare end marker, even length a padded one.
        assert_eq!(submissions[0].used_dwords, 4);
        assert_eq!(submissions[1].used_dwords, 4);
        assert_eq!(&submissions[1].words[2..], &[BATCH_END, NOOP]);
        assert_eq!(cp.used(), 0);
    }

    #[test]
    fn ring_change_flushes_pending_work() {
        let (winsys, mut cp) = parser(128);
        emit_noops(&mut cp, 2);
        cp.set_ring(Ring::Render).unwrap();
        assert!(winsys.submissions().is_empty());

        cp.set_ring(Ring::Blt).unwrap();
        let submissions = winsys.submissions();
        assert_eq!(submissions.len(), 1);
        assert_eq!(submissions[0].ring, Ring::Render);
        assert_eq!(submissions[0].context, cp.render_context());
        assert_eq!(cp.ring(), Ring::Blt);

        emit_noops(&mut cp, 2);
        cp.flush("blit").unwrap();
        let submissions = winsys.submissions();
        assert_eq!(submissions[1].ring, Ring::Blt);
        assert_eq!(submissions[1].context, None);
    }

    #[test]
    fn one_off_flags_apply_to_one_submission() {
        let (winsys, mut cp) = parser(128);
        cp.set_one_off_flags(SubmitFlags::SO_RESET);
        emit_noops(&mut cp, 1);
        cp.flush("first").unwrap();
        emit_noops(&mut cp, 1);
        cp.flush("second").unwrap();

        let submissions = winsys.submissions();
        assert_eq!(submissions[0].flags, SubmitFlags::SO_RESET);
        assert_eq!(submissions[1].flags, SubmitFlags::empty());
        assert_eq!(cp.one_off_flags(), SubmitFlags::empty());
    }

    #[test]
    fn failed_submission_invalidates_kernel_cache() {
        let (winsys, mut cp) = parser(128);
        let cache = Rc::new(RefCell::new(ShaderCache::new()));
        let kernel = cache.borrow_mut().add(vec![1, 2, 3, 4]);
        cache.borrow_mut().upload(&*winsys).unwrap();
        cp.set_shader_cache(cache.clone());
        let calls = Rc::new(Cell::new(0));
        let seen = calls.clone();
        cp.set_flush_callback(move || seen.set(seen.get() + 1));

        winsys.fail_next_submits(1);
        emit_noops(&mut cp, 4);
        assert_eq!(cp.flush("doomed").unwrap(), FlushOutcome::SubmitFailed);

        assert_eq!(cache.borrow().kernel_offset(kernel), None);
        assert!(cp.last_submitted().is_none());
        assert_eq!(calls.get(), 0);
        assert_eq!(cp.stats().snapshot().submit_failures, 1);
        assert!(cp.builder().relocations().is_empty());

        // The parser keeps working afterwards.
        emit_noops(&mut cp, 4);
        assert_eq!(cp.flush("retry").unwrap(), FlushOutcome::Submitted);
    }

    #[test]
    fn failed_submission_runs_the_discard_callback() {
        let (winsys, mut cp) = parser(128);
        let flushed = Rc::new(Cell::new(0));
        let discarded = Rc::new(Cell::new(0));
        let seen = flushed.clone();
        cp.set_flush_callback(move || seen.set(seen.get() + 1));
        let seen = discarded.clone();
        cp.set_discard_callback(move || seen.set(seen.get() + 1));

        winsys.fail_next_submits(1);
        emit_noops(&mut cp, 4);
        assert_eq!(cp.flush("doomed").unwrap(), FlushOutcome::SubmitFailed);
        assert_eq!((flushed.get(), discarded.get()), (0, 1));

        assert_eq!(cp.flush("empty").unwrap(), FlushOutcome::Empty);
        emit_noops(&mut cp, 4);
        assert_eq!(cp.flush("ok").unwrap(), FlushOutcome::Submitted);
        assert_eq!((flushed.get(), discarded.get()), (1, 1));
    }

    #[test]
    fn render_context_only_reaches_render_submissions() {
        let (winsys, mut cp) = parser(128);
        let replaced = Some(ContextId(7));
        cp.set_render_context(replaced);
        assert_eq!(cp.render_context(), replaced);

        emit_noops(&mut cp, 2);
        cp.flush("render").unwrap();
        cp.set_ring(Ring::Blt).unwrap();
        emit_noops(&mut cp, 2);
        cp.flush("blit").unwrap();

        let submissions = winsys.submissions();
        assert_eq!(submissions[0].ring, Ring::Render);
        assert_eq!(submissions[0].context, replaced);
        assert_eq!(submissions[1].ring, Ring::Blt);
        assert_eq!(submissions[1].context, None);
    }

    #[test]
    fn no_hw_keeps_bookkeeping_without_submitting() {
        let winsys = Arc::new(SoftwareWinsys::new(1 << 20));
        let config = CpConfig {
            batch_dwords: 128,
            debug: DebugFlags::NO_HW | DebugFlags::DUMP_3D,
            ..CpConfig::default()
        };
        let mut cp = CommandParser::new(winsys.clone(), &config).unwrap();
        emit_noops(&mut cp, 4);
        assert_eq!(cp.flush("nohw").unwrap(), FlushOutcome::Submitted);
        assert!(winsys.submissions().is_empty());
        assert!(cp.last_submitted().is_some());
        assert_eq!(cp.stats().snapshot().dwords_submitted, 6);
    }

    #[test]
    fn allocation_failure_surfaces_and_recovers() {
        let (winsys, mut cp) = parser(128);
        emit_noops(&mut cp, 2);
        winsys.fail_next_allocs(1);
        assert!(matches!(
            cp.flush("oom"),
            Err(crate::error::CpError::OutOfMemory(_))
        ));
        assert_eq!(winsys.submissions().len(), 1);

        // Without a buffer the next batch is dropped, then allocation resumes.
        emit_noops(&mut cp, 2);
        assert_eq!(cp.flush("no buffer").unwrap(), FlushOutcome::SubmitFailed);
        emit_noops(&mut cp, 2);
        assert_eq!(cp.flush("ok").unwrap(), FlushOutcome::Submitted);
    }

    #[test]
    #[should_panic(expected = "unexpected implicit flush")]
    fn forbidden_implicit_flush_panics() {
        let (_winsys, mut cp) = parser(32 + BATCH_END_DWORDS);
        emit_noops(&mut cp, 30);
        cp.without_implicit_flush(|cp| emit_noops(cp, 4));
    }

    #[test]
    #[should_panic(expected = "does not fit an empty batch")]
    fn oversized_command_asserts() {
        let (_winsys, mut cp) = parser(32 + BATCH_END_DWORDS);
        emit_noops(&mut cp, 1);
        let _ = cp.begin_command(33);
    }

    #[test]
    #[should_panic(expected = "short of its length")]
    fn short_command_asserts() {
        let (_winsys, mut cp) = parser(64);
        cp.begin_command(3).unwrap();
        cp.write(NOOP);
        cp.end_command();
    }

    #[test]
    fn steal_flushes_when_state_does_not_fit() {
        let (winsys, mut cp) = parser(64 + BATCH_END_DWORDS);
        emit_noops(&mut cp, 60);
        let offset = cp.steal(8, 4).unwrap();
        assert_eq!(winsys.submissions().len(), 1);
        // 66 - 8 = 58, aligned down to 56.
        assert_eq!(offset, 56 * 4);
        assert_eq!(cp.stolen(), 10);
    }
}

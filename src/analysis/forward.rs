use crate::code::{Addr, Code};
use crate::dispatch::Dispatcher;
use crate::errors::{AnalysisError, AnalysisResult};
use crate::state::Merge;
use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::fmt;

/// Forward worklist driver.
///
/// Starting from the code entry, the driver threads a current abstract
/// state instruction by instruction, dispatching each instruction's
/// effect through the dispatcher. Labels are the forward merge points: the
/// first arrival stores a snapshot of the incoming state, later arrivals
/// merge into it, and a branch whose merge brings no new information is
/// terminated. The worklist is drained depth-first, newest target first,
/// until a fixpoint is reached.
///
/// Results live until [`ForwardAnalysis::invalidate`] or a new
/// [`ForwardAnalysis::analyze`] call.
pub struct ForwardAnalysis<'c, S, D> {
    code: Option<&'c Code>,
    dispatcher: D,
    initial: S,
    current: Option<S>,
    final_state: Option<S>,
    merge_points: HashMap<Addr, S>,
    queue: VecDeque<Addr>,
}

impl<'c, S, D> ForwardAnalysis<'c, S, D>
where
    S: Merge + Clone + fmt::Display,
    D: Dispatcher<S>,
{
    /// Creates an idle driver from the initial state of the analysis and
    /// the dispatcher implementing its transfer functions.
    pub fn new(initial: S, dispatcher: D) -> Self {
        Self {
            code: None,
            dispatcher,
            initial,
            current: None,
            final_state: None,
            merge_points: HashMap::new(),
            queue: VecDeque::new(),
        }
    }

    /// Binds a code object and runs the fixpoint iteration, discarding any
    /// previously computed result first.
    pub fn analyze(&mut self, code: &'c Code) {
        if self.good() {
            self.invalidate();
        }
        self.code = Some(code);
        self.run(code);
    }

    /// Releases every state owned by the driver. May be called
    /// redundantly; a fresh `analyze` call is needed before results can be
    /// queried again.
    pub fn invalidate(&mut self) {
        self.code = None;
        self.current = None;
        self.final_state = None;
        self.merge_points.clear();
        self.queue.clear();
    }

    /// Whether the driver currently holds valid results.
    #[must_use]
    pub fn good(&self) -> bool {
        self.code.is_some()
    }

    /// The merged state over all exit points.
    ///
    /// # Errors
    ///
    /// Returns [`AnalysisError::NotAnalyzed`] on an idle or invalidated
    /// driver, and [`AnalysisError::NoFinalState`] when the fixpoint was
    /// reached without ever arriving at an exit point.
    pub fn final_state(&self) -> AnalysisResult<&S> {
        if !self.good() {
            return Err(AnalysisError::NotAnalyzed);
        }
        self.final_state.as_ref().ok_or(AnalysisError::NoFinalState)
    }

    /// The fixed snapshot stored at a merge point, if the location is a
    /// label ever reached by the analysis.
    #[must_use]
    pub fn merge_point(&self, addr: Addr) -> Option<&S> {
        self.merge_points.get(&addr)
    }

    pub fn dispatcher(&self) -> &D {
        &self.dispatcher
    }

    pub fn dispatcher_mut(&mut self) -> &mut D {
        &mut self.dispatcher
    }

    fn run(&mut self, code: &Code) {
        self.current = Some(self.initial.clone());
        self.queue.push_front(code.begin());

        while let Some(start) = self.queue.pop_front() {
            log::debug!("forward branch from {start}");
            let mut ins = start;
            loop {
                // labels are the merge points of the forward walk
                if code.is_label(ins) && !self.merge_at_label(ins) {
                    log::debug!("    branch converged at {ins}");
                    break;
                }

                log::trace!("    {ins}: {}", code.instr(ins));
                let state = self.current.as_mut().expect("no live abstract state");
                self.dispatcher.dispatch(code, ins, state);

                if code.is_jump(ins) {
                    let target = code.target(ins);
                    if self.should_jump(target) {
                        log::trace!("    queueing jump target {target}");
                        self.queue.push_front(target);
                    }
                    if code.is_uncond_jump(ins) {
                        self.current = None;
                        break;
                    }
                } else if code.is_exit_point(ins) {
                    let state = self.current.take().expect("no live abstract state");
                    log::debug!("    exit point {ins} reached");
                    match &mut self.final_state {
                        Some(final_state) => {
                            final_state.merge_with(&state);
                        }
                        None => self.final_state = Some(state),
                    }
                    break;
                }

                ins = ins.next();
            }
        }
    }

    /// Join point handling. Returns false when the incoming state brings
    /// no new information and the branch must be terminated.
    fn merge_at_label(&mut self, ins: Addr) -> bool {
        match self.merge_points.entry(ins) {
            Entry::Vacant(entry) => {
                let state = self
                    .current
                    .as_ref()
                    .expect("no incoming state at a new merge point");
                entry.insert(state.clone());
                true
            }
            Entry::Occupied(mut entry) => match self.current.take() {
                // revisited from the queue without a live state
                None => {
                    self.current = Some(entry.get().clone());
                    true
                }
                Some(state) => {
                    if entry.get_mut().merge_with(&state) {
                        self.current = Some(entry.get().clone());
                        true
                    } else {
                        false
                    }
                }
            },
        }
    }

    /// Decides whether a jump must be followed: always when the target has
    /// no snapshot yet (one is created from the current state), otherwise
    /// only when merging the current state into the snapshot changes it.
    fn should_jump(&mut self, target: Addr) -> bool {
        let current = self.current.as_ref().expect("no live abstract state");
        match self.merge_points.entry(target) {
            Entry::Vacant(entry) => {
                entry.insert(current.clone());
                true
            }
            Entry::Occupied(mut entry) => entry.get_mut().merge_with(current),
        }
    }
}

impl<S, D> fmt::Display for ForwardAnalysis<'_, S, D>
where
    S: Merge + Clone + fmt::Display,
    D: Dispatcher<S>,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut points: Vec<_> = self.merge_points.iter().collect();
        points.sort_by_key(|(addr, _)| **addr);
        writeln!(f, "merge points:")?;
        for (addr, state) in points {
            writeln!(f, "{addr}:")?;
            for line in state.to_string().lines() {
                writeln!(f, "  {line}")?;
            }
        }
        match &self.final_state {
            Some(state) => {
                writeln!(f, "final state:")?;
                for line in state.to_string().lines() {
                    writeln!(f, "  {line}")?;
                }
            }
            None => writeln!(f, "no final state")?,
        }
        Ok(())
    }
}

/// Forward driver with per-instruction state retrieval.
///
/// Once the fixpoint is known, the abstract state before any instruction
/// can be reconstructed in linear time by replaying from the nearest
/// upstream merge point. The replay cache is optimized for queries in
/// increasing location order; a query behind the cache restarts the
/// replay from the entry.
pub struct ForwardStates<'c, S, D> {
    analysis: ForwardAnalysis<'c, S, D>,
    cache: Option<S>,
    cache_at: Addr,
}

impl<'c, S, D> ForwardStates<'c, S, D>
where
    S: Merge + Clone + fmt::Display,
    D: Dispatcher<S>,
{
    pub fn new(initial: S, dispatcher: D) -> Self {
        Self {
            analysis: ForwardAnalysis::new(initial, dispatcher),
            cache: None,
            cache_at: Addr(0),
        }
    }

    /// Runs the fixpoint iteration and initializes the retrieval cache.
    pub fn analyze(&mut self, code: &'c Code) {
        self.analysis.analyze(code);
        self.initialize_cache();
    }

    pub fn invalidate(&mut self) {
        self.analysis.invalidate();
        self.cache = None;
        self.cache_at = Addr(0);
    }

    #[must_use]
    pub fn good(&self) -> bool {
        self.analysis.good()
    }

    /// See [`ForwardAnalysis::final_state`].
    ///
    /// # Errors
    ///
    /// Same conditions as [`ForwardAnalysis::final_state`].
    pub fn final_state(&self) -> AnalysisResult<&S> {
        self.analysis.final_state()
    }

    #[must_use]
    pub fn merge_point(&self, addr: Addr) -> Option<&S> {
        self.analysis.merge_point(addr)
    }

    pub fn dispatcher(&self) -> &D {
        self.analysis.dispatcher()
    }

    pub fn dispatcher_mut(&mut self) -> &mut D {
        self.analysis.dispatcher_mut()
    }

    /// The abstract state before the instruction at `addr`.
    ///
    /// # Errors
    ///
    /// Returns [`AnalysisError::NotAnalyzed`] on an idle or invalidated
    /// driver.
    ///
    /// # Panics
    ///
    /// Panics if `addr` is never found, even after restarting the replay
    /// from the entry; that can only happen for a location outside the
    /// analyzed code.
    pub fn state_at(&mut self, addr: Addr) -> AnalysisResult<&S> {
        if !self.good() {
            return Err(AnalysisError::NotAnalyzed);
        }
        if addr != self.cache_at {
            self.seek(addr);
        }
        Ok(self.cache.as_ref().expect("retrieval cache not initialized"))
    }

    fn code(&self) -> &'c Code {
        self.analysis.code.expect("no code bound")
    }

    fn initialize_cache(&mut self) {
        self.cache = Some(self.analysis.initial.clone());
        self.cache_at = self.code().begin();
    }

    /// Replays one instruction and moves the cache forward.
    fn advance(&mut self) {
        let code = self.code();
        let state = self.cache.as_mut().expect("retrieval cache not initialized");
        self.analysis.dispatcher.dispatch(code, self.cache_at, state);
        self.cache_at = self.cache_at.next();
        if code.is_label(self.cache_at) {
            // re-base on the fixpoint snapshot; dead code reached by the
            // linear scan has none, and keeps the replayed state as a
            // best-effort approximation
            if let Some(fixpoint) = self.analysis.merge_points.get(&self.cache_at) {
                self.cache = Some(fixpoint.clone());
            }
        }
    }

    fn seek(&mut self, target: Addr) {
        let end = self.code().end();
        while self.cache_at != end {
            if self.cache_at == target {
                return;
            }
            if self.code().is_exit_point(self.cache_at) {
                break;
            }
            self.advance();
        }
        // not ahead of the cache: start over from the entry
        self.initialize_cache();
        while self.cache_at != end {
            if self.cache_at == target {
                return;
            }
            self.advance();
        }
        panic!("retrieval target {target} not found in the analyzed code");
    }
}

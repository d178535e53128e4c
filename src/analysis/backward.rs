use crate::code::{Addr, Code};
use crate::dispatch::Dispatcher;
use crate::errors::{AnalysisError, AnalysisResult};
use crate::state::Merge;
use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::fmt;

/// Backward worklist driver.
///
/// Control flow is recorded forward, so the driver first scans the whole
/// program once to collect the origin of every jump and to seed the
/// worklist with the exit points. It then walks instructions in reverse:
/// exit points (re)load the initial "boundary" state, jump instructions
/// play the role labels play in the forward walk (the backward merge
/// points), and reaching the entry point merges the current state into the
/// final state. At a label, every recorded jump origin is enqueued if
/// merging would teach it something; straight-line fallthrough into the
/// label is only followed when the preceding instruction actually flows
/// into it.
pub struct BackwardAnalysis<'c, S, D> {
    code: Option<&'c Code>,
    dispatcher: D,
    initial: S,
    current: Option<S>,
    final_state: Option<S>,
    merge_points: HashMap<Addr, S>,
    jump_origins: HashMap<Addr, Vec<Addr>>,
    queue: VecDeque<Addr>,
}

impl<'c, S, D> BackwardAnalysis<'c, S, D>
where
    S: Merge + Clone + fmt::Display,
    D: Dispatcher<S>,
{
    /// Creates an idle driver from the boundary state of the analysis and
    /// the dispatcher implementing its backward transfer functions.
    pub fn new(initial: S, dispatcher: D) -> Self {
        Self {
            code: None,
            dispatcher,
            initial,
            current: None,
            final_state: None,
            merge_points: HashMap::new(),
            jump_origins: HashMap::new(),
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
    /// redundantly.
    pub fn invalidate(&mut self) {
        self.code = None;
        self.current = None;
        self.final_state = None;
        self.merge_points.clear();
        self.jump_origins.clear();
        self.queue.clear();
    }

    #[must_use]
    pub fn good(&self) -> bool {
        self.code.is_some()
    }

    /// The merged state over all backward branches that reached the entry
    /// point.
    ///
    /// # Errors
    ///
    /// Returns [`AnalysisError::NotAnalyzed`] on an idle or invalidated
    /// driver, and [`AnalysisError::NoFinalState`] when no backward branch
    /// ever reached the entry.
    pub fn final_state(&self) -> AnalysisResult<&S> {
        if !self.good() {
            return Err(AnalysisError::NotAnalyzed);
        }
        self.final_state.as_ref().ok_or(AnalysisError::NoFinalState)
    }

    /// The fixed snapshot stored at a backward merge point (a jump
    /// instruction), if the analysis ever reached it.
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

    /// Jump instructions are where backward control flow joins.
    fn is_merge_point(code: &Code, ins: Addr) -> bool {
        code.is_jump(ins)
    }

    fn run(&mut self, code: &Code) {
        // pre-pass: record jump origins for every label, seed the
        // worklist with the exit points
        for ins in code.addrs() {
            if code.is_jump(ins) {
                self.jump_origins
                    .entry(code.target(ins))
                    .or_default()
                    .push(ins);
            }
            if code.is_exit_point(ins) {
                self.queue.push_front(ins);
            }
        }

        while let Some(start) = self.queue.pop_front() {
            log::debug!("backward branch from {start}");
            let mut ins = start;
            loop {
                if code.is_exit_point(ins) {
                    // boundary of the backward walk
                    debug_assert!(
                        self.current.is_none(),
                        "live state carried into an exit point"
                    );
                    self.current = Some(self.initial.clone());
                } else if Self::is_merge_point(code, ins) && !self.merge_at(ins) {
                    log::debug!("    branch converged at {ins}");
                    break;
                }

                log::trace!("    {ins}: {}", code.instr(ins));
                let state = self.current.as_mut().expect("no live abstract state");
                self.dispatcher.dispatch(code, ins, state);

                if code.is_entry_point(ins) {
                    // the backward branch ends here
                    let state = self.current.take().expect("no live abstract state");
                    log::debug!("    entry point reached");
                    match &mut self.final_state {
                        Some(final_state) => {
                            final_state.merge_with(&state);
                        }
                        None => self.final_state = Some(state),
                    }
                    break;
                }

                if code.is_label(ins) {
                    // wake up every jump that lands here
                    if let Some(origins) = self.jump_origins.get(&ins) {
                        for origin in origins.clone() {
                            if self.should_follow_jump_from(origin) {
                                log::trace!("    queueing jump origin {origin}");
                                self.queue.push_front(origin);
                            }
                        }
                    }
                    // fallthrough into the label is only real when the
                    // preceding instruction actually flows into it
                    let prev = ins.prev();
                    if code.is_exit_point(prev) || !code.successors(prev).contains(&ins) {
                        self.current = None;
                        break;
                    }
                }

                ins = ins.prev();
            }
        }
    }

    /// Join point handling, symmetric to the forward label case. Returns
    /// false when the branch must be terminated.
    fn merge_at(&mut self, ins: Addr) -> bool {
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

    /// Same merge-and-compare tie-break as the forward `should_jump`, but
    /// keyed by the jump origin the backward walk would continue from.
    fn should_follow_jump_from(&mut self, origin: Addr) -> bool {
        let current = self.current.as_ref().expect("no live abstract state");
        match self.merge_points.entry(origin) {
            Entry::Vacant(entry) => {
                entry.insert(current.clone());
                true
            }
            Entry::Occupied(mut entry) => entry.get_mut().merge_with(current),
        }
    }
}

impl<S, D> fmt::Display for BackwardAnalysis<'_, S, D>
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

/// Backward driver with per-instruction state retrieval.
///
/// Backward per-instruction semantics describe the state *before* the
/// instruction in execution order, so the cache re-dispatches the
/// instruction at the cached location after every cache reset and after
/// every step: the state returned for a location always includes that
/// location's own backward effect. The replay scans toward the program
/// start and restarts from the reverse beginning on a miss.
pub struct BackwardStates<'c, S, D> {
    analysis: BackwardAnalysis<'c, S, D>,
    cache: Option<S>,
    cache_at: Addr,
}

impl<'c, S, D> BackwardStates<'c, S, D>
where
    S: Merge + Clone + fmt::Display,
    D: Dispatcher<S>,
{
    pub fn new(initial: S, dispatcher: D) -> Self {
        Self {
            analysis: BackwardAnalysis::new(initial, dispatcher),
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

    /// See [`BackwardAnalysis::final_state`].
    ///
    /// # Errors
    ///
    /// Same conditions as [`BackwardAnalysis::final_state`].
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

    /// The abstract state before the instruction at `addr`, in execution
    /// order.
    ///
    /// # Errors
    ///
    /// Returns [`AnalysisError::NotAnalyzed`] on an idle or invalidated
    /// driver.
    ///
    /// # Panics
    ///
    /// Panics if `addr` is never found, even after restarting the replay;
    /// that can only happen for a location outside the analyzed code.
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
        let code = self.code();
        self.cache = Some(self.analysis.initial.clone());
        self.cache_at = code.rbegin();
        let state = self.cache.as_mut().expect("retrieval cache not initialized");
        self.analysis.dispatcher.dispatch(code, self.cache_at, state);
    }

    /// Moves the cache one instruction toward the program start and
    /// applies that instruction's backward effect.
    fn advance(&mut self) {
        let code = self.code();
        self.cache_at = self.cache_at.prev();
        if code.is_exit_point(self.cache_at) {
            // boundary of the backward walk: reload the initial state
            self.cache = Some(self.analysis.initial.clone());
        } else if BackwardAnalysis::<S, D>::is_merge_point(code, self.cache_at) {
            if let Some(fixpoint) = self.analysis.merge_points.get(&self.cache_at) {
                self.cache = Some(fixpoint.clone());
            }
        }
        let state = self.cache.as_mut().expect("retrieval cache not initialized");
        self.analysis.dispatcher.dispatch(code, self.cache_at, state);
    }

    fn seek(&mut self, target: Addr) {
        let begin = self.code().begin();
        loop {
            if self.cache_at == target {
                return;
            }
            if self.cache_at == begin {
                break;
            }
            self.advance();
        }
        // behind the cache: start over from the reverse beginning
        self.initialize_cache();
        loop {
            if self.cache_at == target {
                return;
            }
            if self.cache_at == begin {
                break;
            }
            self.advance();
        }
        panic!("retrieval target {target} not found in the analyzed code");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::fixtures::{counting_loop, straight_line, St, Tracer, Uses, Val};
    use crate::code::{Code, Instr, Label};
    use crate::dispatch::InstructionDispatcher;

    fn tracing_driver<'c>() -> BackwardAnalysis<'c, St, InstructionDispatcher<Tracer>> {
        BackwardAnalysis::new(St::new(), InstructionDispatcher::new(Tracer::default()))
    }

    fn uses_driver<'c>() -> BackwardAnalysis<'c, St, InstructionDispatcher<Uses>> {
        BackwardAnalysis::new(St::new(), InstructionDispatcher::new(Uses))
    }

    #[test]
    fn lifecycle_idle_fixed_invalidated() {
        let code = straight_line();
        let mut analysis = tracing_driver();

        assert!(!analysis.good());
        assert_eq!(analysis.final_state().unwrap_err(), AnalysisError::NotAnalyzed);

        analysis.analyze(&code);
        assert!(analysis.good());
        assert!(analysis.final_state().is_ok());

        analysis.invalidate();
        assert!(!analysis.good());
        analysis.invalidate();
        assert!(!analysis.good());
    }

    #[test]
    fn straight_line_is_walked_in_reverse() {
        let code = straight_line();
        let mut analysis = tracing_driver();
        analysis.analyze(&code);

        assert_eq!(
            analysis.dispatcher().receiver().trace,
            vec![Addr(3), Addr(2), Addr(1), Addr(0)]
        );
        // no transfer touched the state: the final state is the boundary
        assert_eq!(*analysis.final_state().unwrap(), St::new());
    }

    #[test]
    fn a_read_makes_a_variable_live_at_entry() {
        let code = Code::new(vec![
            Instr::Load("a".to_string()),
            Instr::Pop,
            Instr::Ret,
        ])
        .unwrap();
        let mut analysis = uses_driver();
        analysis.analyze(&code);

        let final_state = analysis.final_state().unwrap();
        assert_eq!(final_state.env().get(&"a".to_string()), Some(&Val::Const(1)));
    }

    #[test]
    fn a_write_kills_the_use_below_it() {
        let code = Code::new(vec![
            Instr::Push(0),
            Instr::Store("a".to_string()),
            Instr::Load("a".to_string()),
            Instr::Pop,
            Instr::Ret,
        ])
        .unwrap();
        let mut analysis = uses_driver();
        analysis.analyze(&code);

        let final_state = analysis.final_state().unwrap();
        assert_eq!(final_state.env().get(&"a".to_string()), Some(&Val::Absent));
    }

    #[test]
    fn fallthrough_into_a_label_is_gated_by_the_layout() {
        // the jump at 1 does not flow into the label at 2, so the branch
        // walking down from the exit must stop at the label and continue
        // only through the recorded jump origins
        let code = Code::new(vec![
            Instr::Branch(Label(0)),    // 0
            Instr::Jump(Label(1)),      // 1
            Instr::Label(Label(0)),     // 2
            Instr::Nop,                 // 3
            Instr::Label(Label(1)),     // 4
            Instr::Ret,                 // 5
        ])
        .unwrap();
        let mut analysis = tracing_driver();
        analysis.analyze(&code);

        assert_eq!(
            analysis.dispatcher().receiver().trace,
            vec![Addr(5), Addr(4), Addr(3), Addr(2), Addr(0), Addr(1)]
        );
        assert!(analysis.final_state().is_ok());
    }

    #[test]
    fn an_exit_point_before_a_label_terminates_the_branch() {
        let code = Code::new(vec![
            Instr::Branch(Label(0)),    // 0
            Instr::Ret,                 // 1
            Instr::Label(Label(0)),     // 2
            Instr::Ret,                 // 3
        ])
        .unwrap();
        let mut analysis = tracing_driver();
        analysis.analyze(&code);

        assert_eq!(
            analysis.dispatcher().receiver().trace,
            vec![Addr(3), Addr(2), Addr(0), Addr(1)]
        );
    }

    #[test]
    fn loop_converges_and_stores_the_jump_snapshot() {
        let code = counting_loop();
        let mut analysis = uses_driver();
        analysis.analyze(&code);

        // the back edge at 7 is the backward merge point of the loop
        let snapshot = analysis.merge_point(Addr(7)).unwrap();
        assert_eq!(snapshot.env().get(&"x".to_string()), Some(&Val::Top));

        // at the entry, the store at 1 has killed x
        let final_state = analysis.final_state().unwrap();
        assert_eq!(final_state.env().get(&"x".to_string()), Some(&Val::Absent));
    }

    #[test]
    fn code_without_exit_points_has_no_final_state() {
        let code = Code::new(vec![Instr::Label(Label(0)), Instr::Jump(Label(0))]).unwrap();
        let mut analysis = tracing_driver();
        analysis.analyze(&code);
        assert!(analysis.good());
        assert_eq!(analysis.final_state().unwrap_err(), AnalysisError::NoFinalState);
        assert!(analysis.dispatcher().receiver().trace.is_empty());
    }

    fn uses_states<'c>() -> BackwardStates<'c, St, InstructionDispatcher<Uses>> {
        BackwardStates::new(St::new(), InstructionDispatcher::new(Uses))
    }

    #[test]
    fn retrieval_includes_the_effect_of_the_queried_instruction() {
        // push 1; store x; push 2; ret
        let code = straight_line();
        let mut states = uses_states();
        states.analyze(&code);

        // before ret (in execution order) nothing is known yet
        assert!(states.state_at(Addr(3)).unwrap().env().is_empty());
        assert!(states.state_at(Addr(2)).unwrap().env().is_empty());
        // the store's own backward effect is part of its state
        assert_eq!(
            states.state_at(Addr(1)).unwrap().env().get(&"x".to_string()),
            Some(&Val::Absent)
        );
        assert_eq!(
            states.state_at(Addr(0)).unwrap().env().get(&"x".to_string()),
            Some(&Val::Absent)
        );
    }

    #[test]
    fn cache_reset_re_dispatches_the_cached_instruction() {
        let code = straight_line();
        let mut states = BackwardStates::new(
            St::new(),
            InstructionDispatcher::new(Tracer::default()),
        );
        states.analyze(&code);

        // fixpoint walk plus the dispatch of the cache initialization
        assert_eq!(
            states.dispatcher().receiver().trace,
            vec![Addr(3), Addr(2), Addr(1), Addr(0), Addr(3)]
        );

        states.dispatcher_mut().receiver_mut().trace.clear();
        // cache already sits on the reverse beginning: no dispatch
        states.state_at(Addr(3)).unwrap();
        assert!(states.dispatcher().receiver().trace.is_empty());

        // one step, one dispatch
        states.state_at(Addr(2)).unwrap();
        assert_eq!(states.dispatcher().receiver().trace, vec![Addr(2)]);

        // seeking up needs a restart, which re-dispatches the reverse
        // beginning after reloading the boundary state
        states.dispatcher_mut().receiver_mut().trace.clear();
        states.state_at(Addr(3)).unwrap();
        assert_eq!(
            states.dispatcher().receiver().trace,
            vec![Addr(1), Addr(0), Addr(3)]
        );
    }

    #[test]
    fn retrieval_reloads_snapshots_at_backward_merge_points() {
        let code = counting_loop();
        let mut states = uses_states();
        states.analyze(&code);

        // the branch itself has no transfer, so its state is the stored
        // snapshot reloaded by the cache
        let snapshot = states.merge_point(Addr(7)).unwrap().clone();
        assert_eq!(*states.state_at(Addr(7)).unwrap(), snapshot);

        // before the load at 3, x is live
        assert_eq!(
            states.state_at(Addr(3)).unwrap().env().get(&"x".to_string()),
            Some(&Val::Const(1))
        );
    }

    #[test]
    fn retrieval_before_analyze_is_rejected() {
        let mut states = uses_states();
        assert_eq!(states.state_at(Addr(0)).unwrap_err(), AnalysisError::NotAnalyzed);
    }
}

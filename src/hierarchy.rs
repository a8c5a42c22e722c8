//! Host task and team hierarchy, walked outward to attribute device activity to the
//! host context that caused it.
//!
//! Teams and tasks live in an arena and are named by index handles. Each worker
//! additionally keeps a stack of [lightweight frames](LightweightHandle), one per
//! serialized nested region it entered without allocating a full team. The visible
//! "current" context of a worker is the top of that stack when the top frame was
//! pushed while the worker's current task was running, and the task itself otherwise.
//!
//! Ancestor queries count levels outward from the current context:
//!
//! 1. lightweight frames anchored on the task, innermost first;
//! 2. then the task itself;
//! 3. then its scheduling parent if it has one (for the scheduling walks), or its
//!    lexical parent, continuing from step 1 for that task.
//!
//! A walk that runs out of ancestors, or meets a handle that is not in the arena,
//! reports nothing.
use bitflags::bitflags;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use tracing::trace;

/// Handle of a team in a [`Hierarchy`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TeamId(usize);

/// Handle of a task in a [`Hierarchy`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(usize);

/// Handle of a worker thread in a [`Hierarchy`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WorkerId(usize);

/// A word of tool-owned data attached to a task or parallel region.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
pub struct ToolData(pub u64);

/// Stack frame addresses bracketing a task's user code.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
pub struct Frame {
    pub exit: u64,
    pub enter: u64,
    pub exit_flags: u32,
    pub enter_flags: u32,
}

/// What a tool sees of a task.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
pub struct TaskPayload {
    pub task_data: ToolData,
    pub frame: Frame,
}

/// What a tool sees of a parallel region.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
pub struct TeamPayload {
    pub parallel_data: ToolData,
    pub return_address: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
#[repr(u32)]
pub enum TaskKind {
    Initial = 0x01,
    Implicit = 0x02,
    Explicit = 0x04,
    Target = 0x08,
}

bitflags! {
    /// Details of how a task was created.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    #[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
    pub struct TaskFlags: u32 {
        const UNDEFERRED = 0x0800_0000;
        const UNTIED = 0x1000_0000;
        const FINAL = 0x2000_0000;
        const MERGEABLE = 0x4000_0000;
    }
}

/// The kind of a task together with its creation details.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
pub struct TaskType {
    pub kind: TaskKind,
    pub flags: TaskFlags,
}

impl TaskType {
    pub fn new(kind: TaskKind, flags: TaskFlags) -> Self {
        Self { kind, flags }
    }

    /// The type as a single word, kind bits or'ed with flag bits.
    pub fn bits(&self) -> u32 {
        self.kind as u32 | self.flags.bits()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
pub enum WorkerState {
    #[default]
    Undefined,
    WorkSerial,
    WorkParallel,
    Idle,
    Overhead,
}

/// Result of [`Hierarchy::task_info`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
pub struct TaskInfo {
    pub task_type: TaskType,
    pub task: TaskPayload,
    pub parallel_data: ToolData,
    /// Index of the worker in the team at that level, `None` if it is not a member.
    pub thread_num: Option<usize>,
}

/// Result of [`Hierarchy::parallel_info`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
pub struct ParallelInfo {
    pub parallel_data: ToolData,
    pub team_size: usize,
}

/// Description of a team to add to a [`Hierarchy`].
#[derive(Clone, Copy, Debug, Default)]
pub struct TeamSpec {
    pub parent: Option<TeamId>,
    pub size: usize,
    /// Thread number, in the parent team, of the worker that formed this team.
    pub master_tid: usize,
    /// Serialization nesting level; zero for a team that runs in parallel.
    pub serialized: u32,
    pub payload: TeamPayload,
}

/// Description of a task to add to a [`Hierarchy`].
#[derive(Clone, Copy, Debug)]
pub struct TaskSpec {
    pub team: TeamId,
    pub kind: TaskKind,
    pub flags: TaskFlags,
    pub parent: Option<TaskId>,
    pub scheduling_parent: Option<TaskId>,
    pub payload: TaskPayload,
}

impl TaskSpec {
    pub fn new(team: TeamId, kind: TaskKind) -> Self {
        Self {
            team,
            kind,
            flags: TaskFlags::empty(),
            parent: None,
            scheduling_parent: None,
            payload: TaskPayload::default(),
        }
    }
}

/// Handle of a lightweight frame: its worker and its position in that worker's stack.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct LightweightHandle {
    pub worker: WorkerId,
    pub depth: usize,
}

#[derive(Debug)]
struct Team {
    parent: Option<TeamId>,
    master_tid: usize,
    serialized: u32,
    threads: Vec<Option<WorkerId>>,
    payload: TeamPayload,
}

#[derive(Debug)]
struct Task {
    team: TeamId,
    kind: TaskKind,
    flags: TaskFlags,
    parent: Option<TaskId>,
    scheduling_parent: Option<TaskId>,
    payload: TaskPayload,
}

#[derive(Debug)]
struct LightweightFrame {
    team: TeamId,
    /// The task that was current when the frame was linked.
    anchor: TaskId,
    team_payload: TeamPayload,
    task_payload: TaskPayload,
}

#[derive(Debug, Default)]
struct Worker {
    tid: usize,
    current: Option<TaskId>,
    state: WorkerState,
    frames: Vec<LightweightFrame>,
}

impl Worker {
    fn anchored_on(&self, task: TaskId) -> usize {
        self.frames.iter().filter(|f| f.anchor == task).count()
    }

    /// The `n`th frame anchored on `task`, counting from the outermost.
    fn anchored_frame(&self, task: TaskId, n: usize) -> Option<&LightweightFrame> {
        self.frames.iter().filter(|f| f.anchor == task).nth(n)
    }

    fn top_frame_mut(&mut self) -> Option<&mut LightweightFrame> {
        let current = self.current?;
        self.frames.last_mut().filter(|f| f.anchor == current)
    }
}

/// A point reached while walking outward.
#[derive(Clone, Copy, Debug)]
struct Position {
    task: TaskId,
    team: TeamId,
    /// Lightweight frames anchored on `task` still ahead of it.
    lightweight: usize,
    /// The team the walk left when it last crossed a team boundary.
    prev_team: Option<TeamId>,
}

/// Arena of teams, tasks and workers.
#[derive(Debug, Default)]
pub struct Hierarchy {
    teams: Vec<Team>,
    tasks: Vec<Task>,
    workers: Vec<Worker>,
}

impl Hierarchy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a team with `spec.size` empty thread slots. Fails if the parent is unknown.
    pub fn add_team(&mut self, spec: TeamSpec) -> Option<TeamId> {
        if let Some(parent) = spec.parent {
            self.teams.get(parent.0)?;
        }
        let id = TeamId(self.teams.len());
        self.teams.push(Team {
            parent: spec.parent,
            master_tid: spec.master_tid,
            serialized: spec.serialized,
            threads: vec![None; spec.size],
            payload: spec.payload,
        });
        Some(id)
    }

    /// Add a task. Fails if its team or either parent is unknown.
    pub fn add_task(&mut self, spec: TaskSpec) -> Option<TaskId> {
        self.teams.get(spec.team.0)?;
        for task in [spec.parent, spec.scheduling_parent].into_iter().flatten() {
            self.tasks.get(task.0)?;
        }
        let id = TaskId(self.tasks.len());
        self.tasks.push(Task {
            team: spec.team,
            kind: spec.kind,
            flags: spec.flags,
            parent: spec.parent,
            scheduling_parent: spec.scheduling_parent,
            payload: spec.payload,
        });
        Some(id)
    }

    pub fn add_worker(&mut self) -> WorkerId {
        let id = WorkerId(self.workers.len());
        self.workers.push(Worker::default());
        id
    }

    /// Put `worker` into (or take it out of) slot `slot` of `team`.
    pub fn set_thread(&mut self, team: TeamId, slot: usize, worker: Option<WorkerId>) -> bool {
        match self.teams.get_mut(team.0).and_then(|t| t.threads.get_mut(slot)) {
            Some(entry) => {
                *entry = worker;
                true
            }
            None => false,
        }
    }

    /// Make `task` the task `worker` runs, with `tid` as its raw thread number.
    pub fn set_current_task(&mut self, worker: WorkerId, task: TaskId, tid: usize) -> bool {
        if self.tasks.get(task.0).is_none() {
            return false;
        }
        match self.workers.get_mut(worker.0) {
            Some(w) => {
                w.current = Some(task);
                w.tid = tid;
                true
            }
            None => false,
        }
    }

    pub fn worker_state(&self, worker: WorkerId) -> Option<WorkerState> {
        self.workers.get(worker.0).map(|w| w.state)
    }

    /// Enter a serialized nested region on `worker`.
    ///
    /// The new region gets `parallel_data` and an empty implicit task and becomes the
    /// worker's current context; the context it hides stays reachable one level out.
    pub fn link(
        &mut self,
        worker: WorkerId,
        parallel_data: ToolData,
        return_address: u64,
    ) -> Option<LightweightHandle> {
        let w = self.workers.get_mut(worker.0)?;
        let anchor = w.current?;
        let team = self.tasks.get(anchor.0)?.team;
        w.frames.push(LightweightFrame {
            team,
            anchor,
            team_payload: TeamPayload {
                parallel_data,
                return_address,
            },
            task_payload: TaskPayload::default(),
        });
        let depth = w.frames.len() - 1;
        trace!(?worker, depth, "linked lightweight frame");
        Some(LightweightHandle { worker, depth })
    }

    /// Leave the innermost serialized region on `worker`, returning its parallel data.
    ///
    /// Does nothing and returns `None` if the worker has no lightweight frames.
    pub fn unlink(&mut self, worker: WorkerId) -> Option<ToolData> {
        let frame = self.workers.get_mut(worker.0)?.frames.pop()?;
        trace!(?worker, "unlinked lightweight frame");
        Some(frame.team_payload.parallel_data)
    }

    pub fn lightweight_task_mut(&mut self, handle: LightweightHandle) -> Option<&mut TaskPayload> {
        self.workers
            .get_mut(handle.worker.0)?
            .frames
            .get_mut(handle.depth)
            .map(|f| &mut f.task_payload)
    }

    /// The payload of the task `worker` is currently running.
    pub fn current_task_payload_mut(&mut self, worker: WorkerId) -> Option<&mut TaskPayload> {
        let w = self.workers.get_mut(worker.0)?;
        let current = w.current?;
        if w.top_frame_mut().is_some() {
            return w.top_frame_mut().map(|f| &mut f.task_payload);
        }
        self.tasks.get_mut(current.0).map(|t| &mut t.payload)
    }

    /// Set the parallel data of the innermost region `worker` is in.
    pub fn set_parallel_data(&mut self, worker: WorkerId, data: ToolData) -> bool {
        let Some(w) = self.workers.get_mut(worker.0) else {
            return false;
        };
        if let Some(frame) = w.top_frame_mut() {
            frame.team_payload.parallel_data = data;
            return true;
        }
        let team = w
            .current
            .and_then(|task| self.tasks.get(task.0))
            .map(|task| task.team);
        match team.and_then(|team| self.teams.get_mut(team.0)) {
            Some(team) => {
                team.payload.parallel_data = data;
                true
            }
            None => false,
        }
    }

    /// Record the enter frame of the current task and mark the worker as working in
    /// parallel. Returns the state the worker was in before.
    pub fn set_frame_enter(
        &mut self,
        worker: WorkerId,
        address: u64,
        flags: u32,
    ) -> Option<WorkerState> {
        let payload = self.current_task_payload_mut(worker)?;
        payload.frame.enter = address;
        payload.frame.enter_flags = flags;
        let w = self.workers.get_mut(worker.0)?;
        Some(std::mem::replace(&mut w.state, WorkerState::WorkParallel))
    }

    fn start(&self, worker: WorkerId) -> Option<(&Worker, Position)> {
        let w = self.workers.get(worker.0)?;
        let task = w.current?;
        let team = self.tasks.get(task.0)?.team;
        Some((
            w,
            Position {
                task,
                team,
                lightweight: w.anchored_on(task),
                prev_team: None,
            },
        ))
    }

    fn walk(
        &self,
        worker: WorkerId,
        depth: usize,
        follow_scheduling: bool,
    ) -> Option<(&Worker, Position)> {
        let (w, mut pos) = self.start(worker)?;
        for _ in 0..depth {
            let task = self.tasks.get(pos.task.0)?;
            if pos.lightweight > 0 {
                pos.lightweight -= 1;
            } else if let Some(next) = task.scheduling_parent.filter(|_| follow_scheduling) {
                pos.task = next;
                pos.team = self.tasks.get(next.0)?.team;
                pos.lightweight = w.anchored_on(next);
            } else if let Some(next) = task.parent {
                let team = self.tasks.get(next.0)?.team;
                if team != pos.team {
                    pos.prev_team = Some(pos.team);
                }
                pos.task = next;
                pos.team = team;
                pos.lightweight = w.anchored_on(next);
            } else {
                return None;
            }
        }
        Some((w, pos))
    }

    fn payloads(&self, w: &Worker, pos: &Position) -> Option<(TaskPayload, TeamPayload)> {
        if pos.lightweight > 0 {
            let frame = w.anchored_frame(pos.task, pos.lightweight - 1)?;
            Some((frame.task_payload, frame.team_payload))
        } else {
            let task = self.tasks.get(pos.task.0)?;
            let team = self.teams.get(pos.team.0)?;
            Some((task.payload, team.payload))
        }
    }

    /// Information about the task `depth` levels out from the current one on `worker`.
    pub fn task_info(&self, worker: WorkerId, depth: usize) -> Option<TaskInfo> {
        let (w, pos) = self.walk(worker, depth, true)?;
        let (task_payload, team_payload) = self.payloads(w, &pos)?;
        let task = self.tasks.get(pos.task.0)?;
        let team = self.teams.get(pos.team.0)?;

        let task_type = if pos.lightweight > 0 {
            TaskType::new(TaskKind::Implicit, TaskFlags::empty())
        } else if task.parent.is_none() {
            TaskType::new(TaskKind::Initial, TaskFlags::empty())
        } else {
            TaskType::new(task.kind, task.flags)
        };

        let member = |team: &Team, slot: usize| team.threads.get(slot) == Some(&Some(worker));
        let thread_num = if pos.lightweight > 0 {
            // A lightweight region is a team of one: the worker that linked it.
            Some(0)
        } else if team.serialized > 0 {
            member(team, 0).then_some(0)
        } else if depth == 0 || pos.prev_team.is_none() {
            if member(team, w.tid) {
                Some(w.tid)
            } else if team
                .parent
                .and_then(|p| self.teams.get(p.0))
                .is_some_and(|parent| member(parent, w.tid))
            {
                // The raw thread number still refers to the parent team while this
                // one is being formed or torn down; the worker is its master.
                Some(0)
            } else {
                None
            }
        } else {
            let master = pos
                .prev_team
                .and_then(|prev| self.teams.get(prev.0))
                .map(|prev| prev.master_tid)?;
            member(team, master).then_some(master)
        };

        Some(TaskInfo {
            task_type,
            task: task_payload,
            parallel_data: team_payload.parallel_data,
            thread_num,
        })
    }

    /// The payload of the task `depth` levels out, following only lexical parents.
    pub fn lexical_task_payload(&self, worker: WorkerId, depth: usize) -> Option<TaskPayload> {
        let (w, pos) = self.walk(worker, depth, false)?;
        self.payloads(w, &pos).map(|(task, _)| task)
    }

    /// The payload of the task `depth` levels out, preferring scheduling parents.
    pub fn scheduling_task_payload(&self, worker: WorkerId, depth: usize) -> Option<TaskPayload> {
        let (w, pos) = self.walk(worker, depth, true)?;
        self.payloads(w, &pos).map(|(task, _)| task)
    }

    /// The parallel region `depth` levels out from the innermost one on `worker`.
    ///
    /// Lightweight regions report a team size of one.
    pub fn parallel_info(&self, worker: WorkerId, depth: usize) -> Option<ParallelInfo> {
        let (w, pos) = self.start(worker)?;
        let in_team = |team: TeamId| w.frames.iter().filter(|f| f.team == team).count();
        let mut team = pos.team;
        let mut lightweight = in_team(team);
        for _ in 0..depth {
            if lightweight > 0 {
                lightweight -= 1;
            } else {
                team = self.teams.get(team.0)?.parent?;
                lightweight = in_team(team);
            }
        }
        if lightweight > 0 {
            let frame = w.frames.iter().filter(|f| f.team == team).nth(lightweight - 1)?;
            Some(ParallelInfo {
                parallel_data: frame.team_payload.parallel_data,
                team_size: 1,
            })
        } else {
            let team = self.teams.get(team.0)?;
            Some(ParallelInfo {
                parallel_data: team.payload.parallel_data,
                team_size: team.threads.len(),
            })
        }
    }
}

use std::time::Duration;

use serde::Deserialize;
use tokio::time::Instant;

use crate::error::TimeoutPhase;
use crate::timings::AttemptEvent;

const PHASES: [TimeoutPhase; 7] = [
    TimeoutPhase::Lookup,
    TimeoutPhase::Connect,
    TimeoutPhase::SecureConnect,
    TimeoutPhase::Socket,
    TimeoutPhase::Send,
    TimeoutPhase::Response,
    TimeoutPhase::Request,
];

const fn slot(phase: TimeoutPhase) -> usize {
    match phase {
        TimeoutPhase::Lookup => 0,
        TimeoutPhase::Connect => 1,
        TimeoutPhase::SecureConnect => 2,
        TimeoutPhase::Socket => 3,
        TimeoutPhase::Send => 4,
        TimeoutPhase::Response => 5,
        TimeoutPhase::Request => 6,
    }
}

/// Per-phase time budgets. An unset phase is never armed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct TimeoutBudgets {
    #[serde(default, with = "millis")]
    pub lookup: Option<Duration>,
    #[serde(default, with = "millis")]
    pub connect: Option<Duration>,
    #[serde(default, with = "millis")]
    pub secure_connect: Option<Duration>,
    #[serde(default, with = "millis")]
    pub socket: Option<Duration>,
    #[serde(default, with = "millis")]
    pub send: Option<Duration>,
    #[serde(default, with = "millis")]
    pub response: Option<Duration>,
    #[serde(default, with = "millis")]
    pub request: Option<Duration>,
}

impl TimeoutBudgets {
    pub fn budget(&self, phase: TimeoutPhase) -> Option<Duration> {
        match phase {
            TimeoutPhase::Lookup => self.lookup,
            TimeoutPhase::Connect => self.connect,
            TimeoutPhase::SecureConnect => self.secure_connect,
            TimeoutPhase::Socket => self.socket,
            TimeoutPhase::Send => self.send,
            TimeoutPhase::Response => self.response,
            TimeoutPhase::Request => self.request,
        }
    }

    pub fn set(&mut self, phase: TimeoutPhase, budget: Option<Duration>) {
        let field = match phase {
            TimeoutPhase::Lookup => &mut self.lookup,
            TimeoutPhase::Connect => &mut self.connect,
            TimeoutPhase::SecureConnect => &mut self.secure_connect,
            TimeoutPhase::Socket => &mut self.socket,
            TimeoutPhase::Send => &mut self.send,
            TimeoutPhase::Response => &mut self.response,
            TimeoutPhase::Request => &mut self.request,
        };
        *field = budget;
    }

    pub fn with(mut self, phase: TimeoutPhase, budget: Duration) -> Self {
        self.set(phase, Some(budget));
        self
    }

    /// Phases set in `overrides` win.
    pub(crate) fn merge_from(&mut self, overrides: &Self) {
        for phase in PHASES {
            if let Some(budget) = overrides.budget(phase) {
                self.set(phase, Some(budget));
            }
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub(super) fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}

/// A timer that fired.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Expired {
    pub phase: TimeoutPhase,
    pub budget: Duration,
}

/// Arms and cancels one timer per phase as attempt events arrive.
#[derive(Debug)]
pub struct TimeoutController {
    budgets: TimeoutBudgets,
    secure: bool,
    reused: bool,
    deadlines: [Option<Instant>; 7],
}

impl TimeoutController {
    pub fn new(budgets: TimeoutBudgets, secure: bool) -> Self {
        Self {
            budgets,
            secure,
            reused: false,
            deadlines: [None; 7],
        }
    }

    /// Arms the whole-attempt `request` timer.
    pub fn start(&mut self, at: Instant) {
        self.arm(TimeoutPhase::Request, at);
    }

    pub fn observe(&mut self, event: &AttemptEvent, at: Instant) {
        match event {
            AttemptEvent::Socket {
                reused,
                needs_lookup,
            } => {
                self.reused = *reused;
                self.arm(TimeoutPhase::Socket, at);
                if *reused {
                    self.arm(TimeoutPhase::Send, at);
                } else if *needs_lookup {
                    self.arm(TimeoutPhase::Lookup, at);
                } else {
                    self.arm(TimeoutPhase::Connect, at);
                }
            }
            AttemptEvent::Lookup => {
                self.disarm(TimeoutPhase::Lookup);
                if !self.reused {
                    self.arm(TimeoutPhase::Connect, at);
                }
            }
            AttemptEvent::Connect { .. } => {
                self.disarm(TimeoutPhase::Connect);
                if self.secure {
                    self.arm(TimeoutPhase::SecureConnect, at);
                }
                self.arm(TimeoutPhase::Send, at);
            }
            AttemptEvent::SecureConnect => self.disarm(TimeoutPhase::SecureConnect),
            AttemptEvent::UploadComplete => {
                self.disarm(TimeoutPhase::Send);
                self.arm(TimeoutPhase::Response, at);
            }
            AttemptEvent::Response => self.disarm(TimeoutPhase::Response),
            AttemptEvent::End => self.cancel_all(),
            AttemptEvent::UploadProgress { .. } | AttemptEvent::Activity => {
                self.touch(at);
            }
        }
    }

    /// Socket activity pushes the idle deadline out.
    pub fn touch(&mut self, at: Instant) {
        if self.deadlines[slot(TimeoutPhase::Socket)].is_some() {
            self.arm(TimeoutPhase::Socket, at);
        }
    }

    fn arm(&mut self, phase: TimeoutPhase, at: Instant) {
        if let Some(budget) = self.budgets.budget(phase) {
            self.deadlines[slot(phase)] = Some(at + budget);
        }
    }

    fn disarm(&mut self, phase: TimeoutPhase) {
        self.deadlines[slot(phase)] = None;
    }

    pub fn cancel_all(&mut self) {
        self.deadlines = [None; 7];
    }

    pub fn is_armed(&self, phase: TimeoutPhase) -> bool {
        self.deadlines[slot(phase)].is_some()
    }

    pub fn armed_count(&self) -> usize {
        self.deadlines.iter().flatten().count()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.iter().flatten().min().copied()
    }

    /// Earliest timer whose deadline is at or before `at`.
    pub fn expired(&self, at: Instant) -> Option<Expired> {
        PHASES
            .iter()
            .filter_map(|phase| {
                let deadline = self.deadlines[slot(*phase)]?;
                (deadline <= at).then_some((deadline, *phase))
            })
            .min_by_key(|(deadline, _)| *deadline)
            .and_then(|(_, phase)| {
                Some(Expired {
                    phase,
                    budget: self.budgets.budget(phase)?,
                })
            })
    }
}

//! # Control Loop
//!
//! Runs one control cycle per received frame: parse the telemetry, run the controller, and reply
//! with the command. Cycles are processed strictly in sequence, a new frame is not read until the
//! previous one has been answered.
//!
//! Each peer has its own session. The controller is loaded with the sending peer's session
//! state before a frame is processed, and the state is saved back afterwards, so frames from
//! different peers may be interleaved freely.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use log::{debug, info, warn};
use std::{
    collections::HashMap,
    thread,
    time::{Duration, Instant},
};

use comms_if::telem::{format_manual, format_steer, parse_frame, SimEvent};
use util::{archive::Archived, module::State};

use crate::{
    mpc::{InputData, MpcCtrl, SessionState},
    telem_server::{PeerId, TelemLink},
};

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// Couples a controller to a telemetry link.
pub struct ControlLoop<L> {
    link: L,

    ctrl: MpcCtrl,

    /// Hold back each command by this long before sending it.
    actuation_delay: Option<Duration>,

    /// Session of every peer heard from recently.
    sessions: HashMap<PeerId, PeerSession>,

    /// Sessions are dropped once their peer has been silent this long.
    session_expiry: Duration,
}

#[derive(Debug, Clone, Copy)]
struct PeerSession {
    state: SessionState,

    last_seen: Instant,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

/// What happened in one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// No frame arrived.
    Idle,

    /// The frame was not telemetry, an empty reply was sent.
    Ignored,

    /// The simulator is in manual mode.
    Manual,

    /// The frame or its telemetry was invalid, control was handed back to the simulator.
    Rejected,

    /// A steering command was sent.
    Commanded {
        /// The command reused a previous one as the solve failed.
        fallback: bool,
    },
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl<L: TelemLink> ControlLoop<L> {
    /// Create a new control loop.
    ///
    /// If `actuation_delay` is given each command is held back by that duration before it is
    /// sent, emulating the latency of real actuators. A peer silent for longer than
    /// `session_expiry` starts a fresh session when it next sends a frame.
    pub fn new(
        link: L,
        ctrl: MpcCtrl,
        actuation_delay: Option<Duration>,
        session_expiry: Duration
    ) -> Self {
        Self {
            link,
            ctrl,
            actuation_delay,
            sessions: HashMap::new(),
            session_expiry,
        }
    }

    pub fn ctrl(&self) -> &MpcCtrl {
        &self.ctrl
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    /// The saved session state of `peer`, if it has a live session.
    pub fn session(&self, peer: &PeerId) -> Option<&SessionState> {
        self.sessions.get(peer).map(|s| &s.state)
    }

    pub fn num_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Run a single cycle.
    ///
    /// Only link errors are returned, everything else is handled within the cycle.
    pub fn run_cycle(&mut self) -> Result<CycleOutcome, L::Error> {
        let (peer, frame) = match self.link.recv_frame()? {
            Some(f) => f,
            None => {
                self.expire_sessions(Instant::now());
                return Ok(CycleOutcome::Idle);
            }
        };
        let timestamp = Instant::now();

        self.expire_sessions(timestamp);

        // Load the peer's own session into the controller
        match self.sessions.get(&peer) {
            Some(s) => self.ctrl.restore_session(s.state),
            None => {
                info!("New telemetry peer {}", peer);
                self.ctrl.reset();
            }
        }

        let (reply, outcome) = match parse_frame(&frame) {
            Ok(Some(SimEvent::Telemetry(telemetry))) => {
                self.handle_telemetry(InputData { telemetry, timestamp })
            }
            Ok(Some(SimEvent::Manual)) => (format_manual(), CycleOutcome::Manual),
            Ok(Some(SimEvent::Other(event))) => {
                debug!("Ignoring \"{}\" event from {}", event, peer);
                (String::new(), CycleOutcome::Ignored)
            }
            Ok(None) => (String::new(), CycleOutcome::Ignored),
            Err(e) => {
                warn!("Could not parse frame from {}: {}", peer, e);
                (format_manual(), CycleOutcome::Rejected)
            }
        };

        self.sessions.insert(
            peer.clone(),
            PeerSession {
                state: *self.ctrl.session_state(),
                last_seen: timestamp,
            }
        );

        if let (CycleOutcome::Commanded { .. }, Some(delay)) = (outcome, self.actuation_delay) {
            thread::sleep(delay);
        }

        self.link.send_frame(&peer, &reply)?;

        Ok(outcome)
    }

    fn handle_telemetry(&mut self, input: InputData) -> (String, CycleOutcome) {
        let (output, _) = match self.ctrl.proc(&input) {
            Ok(o) => o,
            Err(e) => {
                warn!("Rejecting telemetry: {}", e);
                return (format_manual(), CycleOutcome::Rejected);
            }
        };

        if let Err(e) = self.ctrl.write() {
            warn!("Could not archive MpcCtrl: {}", e);
        }

        match format_steer(&output.steer_cmd) {
            Ok(frame) => (frame, CycleOutcome::Commanded { fallback: output.fallback }),
            Err(e) => {
                warn!("Could not format the steering command: {}", e);
                (format_manual(), CycleOutcome::Rejected)
            }
        }
    }

    /// Drop the sessions of peers which have gone quiet.
    fn expire_sessions(&mut self, now: Instant) {
        let expiry = self.session_expiry;

        self.sessions.retain(|peer, s| {
            let live = now.saturating_duration_since(s.last_seen) < expiry;
            if !live {
                info!("Session of telemetry peer {} expired", peer);
            }
            live
        });
    }
}

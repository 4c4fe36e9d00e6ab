//! Decision vector layout
//!
//! The decision vector holds, for each of the `N` horizon timesteps, the
//! six state channels, followed by the `N - 1` steering and throttle values:
//!
//! ```text
//! [x_0..x_N-1, y_0.., psi_0.., v_0.., cte_0.., epsi_0.., delta_0..delta_N-2, a_0..a_N-2]
//! ```
//!
//! The constraint vector uses the same blocking as the state channels, so the
//! constraint row for channel `c` at timestep `t` has the same index as the
//! variable for channel `c` at timestep `t`.

// ---------------------------------------------------------------------------
// CONSTANTS
// ---------------------------------------------------------------------------

/// Number of state channels in each timestep.
pub const NUM_STATE_CHANNELS: usize = 6;

/// Number of actuation channels in each timestep.
pub const NUM_ACT_CHANNELS: usize = 2;

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// Index layout of the decision and constraint vectors for a given horizon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VariableLayout {
    horizon_len: usize,
}

// ---------------------------------------------------------------------------
// ENUMERATIONS
// ---------------------------------------------------------------------------

/// The state channels, in the order they are laid out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateChannel {
    X = 0,
    Y = 1,
    Psi = 2,
    V = 3,
    Cte = 4,
    Epsi = 5,
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl StateChannel {
    /// All channels in layout order.
    pub const ALL: [StateChannel; NUM_STATE_CHANNELS] = [
        StateChannel::X,
        StateChannel::Y,
        StateChannel::Psi,
        StateChannel::V,
        StateChannel::Cte,
        StateChannel::Epsi,
    ];
}

impl VariableLayout {
    /// Create the layout for a horizon of `horizon_len` timesteps.
    pub fn new(horizon_len: usize) -> Self {
        Self { horizon_len }
    }

    /// Number of timesteps in the horizon.
    pub fn horizon_len(&self) -> usize {
        self.horizon_len
    }

    /// Number of actuation timesteps, one fewer than the states.
    pub fn num_actuations(&self) -> usize {
        self.horizon_len.saturating_sub(1)
    }

    /// Total length of the decision vector.
    pub fn num_variables(&self) -> usize {
        NUM_STATE_CHANNELS * self.horizon_len
            + NUM_ACT_CHANNELS * self.num_actuations()
    }

    /// Total length of the constraint vector.
    pub fn num_constraints(&self) -> usize {
        NUM_STATE_CHANNELS * self.horizon_len
    }

    /// Index of the first variable of the given state channel.
    pub fn start(&self, channel: StateChannel) -> usize {
        channel as usize * self.horizon_len
    }

    /// Index of a state variable at timestep `t`.
    ///
    /// Also the index of that channel's constraint row at `t`.
    pub fn state(&self, channel: StateChannel, t: usize) -> usize {
        self.start(channel) + t
    }

    /// Index of the first steering variable.
    pub fn delta_start(&self) -> usize {
        NUM_STATE_CHANNELS * self.horizon_len
    }

    /// Index of the first throttle variable.
    pub fn a_start(&self) -> usize {
        self.delta_start() + self.num_actuations()
    }

    pub fn delta(&self, t: usize) -> usize {
        self.delta_start() + t
    }

    pub fn a(&self, t: usize) -> usize {
        self.a_start() + t
    }
}

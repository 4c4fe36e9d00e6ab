//! # MPC Executable
//!
//! This executable drives a simulated vehicle around a track. It serves telemetry requests from
//! the simulator bridge and replies to each one with the steering and throttle commands found by
//! the model predictive controller.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

// External
use color_eyre::{eyre::WrapErr, Result};
use log::{info, warn};

// Internal
use comms_if::net::zmq;
use mpc_lib::{
    control_loop::{ControlLoop, CycleOutcome},
    mpc::MpcCtrl,
    params::MpcExecParams,
    telem_server::TelemServer,
};
use util::{
    host,
    logger::{logger_init, parse_level},
    module::State,
    session::Session,
};

// ------------------------------------------------------------------------------------------------
// MAIN
// ------------------------------------------------------------------------------------------------

fn main() -> Result<()> {
    color_eyre::install()?;

    // ---- EARLY INITIALISATION ----

    // Parameters come first as they hold the log level
    let exec_params: MpcExecParams = util::params::load("mpc_exec.toml")
        .wrap_err("Could not load the executable parameters")?;
    exec_params.validate()
        .wrap_err("Invalid executable parameters")?;

    // Initialise session
    let session = Session::new("mpc_exec", "sessions")
        .wrap_err("Failed to create the session")?;

    // Initialise logger
    let level = parse_level(&exec_params.log_level)
        .wrap_err("Invalid log level")?;
    logger_init(level, &session)
        .wrap_err("Failed to initialise logging")?;

    // Log information on this execution.
    info!("MPC Executable\n");
    info!(
        "Software root: {:?}",
        host::get_mpc_sw_root().wrap_err("Failed to get the software root")?
    );
    info!("Session directory: {:?}\n", session.session_root);

    info!("Initialising...");

    // ---- MODULE INITIALISATION ----

    let mut mpc_ctrl = MpcCtrl::default();
    mpc_ctrl.init("mpc_ctrl.toml", &session)
        .wrap_err("Failed to initialise MpcCtrl")?;
    info!("MpcCtrl init complete");

    // ---- SERVER INITIALISATION ----

    let zmq_ctx = zmq::Context::new();

    let telem_server = TelemServer::new(&zmq_ctx, &exec_params.net)
        .wrap_err("Failed to initialise the telemetry server")?;
    info!("Telemetry server bound to {}", exec_params.net.telem_endpoint);

    let actuation_delay = exec_params.actuation_delay();
    if let Some(delay) = actuation_delay {
        info!("Emulating an actuation delay of {:?}", delay);
    }

    let mut control_loop = ControlLoop::new(
        telem_server,
        mpc_ctrl,
        actuation_delay,
        exec_params.session_expiry()
    );

    // ---- MAIN LOOP ----

    info!("Initialisation complete, waiting for telemetry");

    let mut num_peers = 0;

    loop {
        match control_loop.run_cycle() {
            Ok(CycleOutcome::Idle) => {
                let n = control_loop.link().num_peers();
                if n != num_peers {
                    match n {
                        0 => warn!("All simulators disconnected"),
                        _ => info!("{} simulator(s) connected", n),
                    }
                    num_peers = n;
                }
            }
            Ok(CycleOutcome::Commanded { fallback: true }) => {
                warn!("Sent fallback command")
            }
            Ok(_) => (),
            Err(e) => warn!("Telemetry link error: {}", e),
        }
    }
}

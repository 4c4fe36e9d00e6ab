//! # MPC Executable Parameters
//!
//! This module provides parameters for the MPC executable.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use comms_if::net::NetParams;
use serde::Deserialize;
use std::time::Duration;

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct MpcExecParams {
    /// Minimum level of log messages to record, e.g. `"info"`.
    pub log_level: String,

    /// If true the command reply is held back by `actuation_delay_s` to emulate actuator latency
    /// in simulation.
    pub emulate_actuation_delay: bool,

    /// Units: seconds
    pub actuation_delay_s: f64,

    /// A peer's session is forgotten once no frame has arrived from it for this long.
    ///
    /// Units: seconds
    pub session_expiry_s: f64,

    /// Network configuration
    pub net: NetParams,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ExecParamsError {
    #[error("The actuation delay must be finite and not negative, found {0}")]
    InvalidActuationDelay(f64),

    #[error("The session expiry must be positive and finite, found {0}")]
    InvalidSessionExpiry(f64),
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl MpcExecParams {
    /// Check the parameters are usable.
    pub fn validate(&self) -> Result<(), ExecParamsError> {
        if !(self.actuation_delay_s.is_finite() && self.actuation_delay_s >= 0.0) {
            return Err(ExecParamsError::InvalidActuationDelay(self.actuation_delay_s));
        }

        if !(self.session_expiry_s.is_finite() && self.session_expiry_s > 0.0) {
            return Err(ExecParamsError::InvalidSessionExpiry(self.session_expiry_s));
        }

        Ok(())
    }

    /// The delay to hold each command back by, if delay emulation is enabled.
    ///
    /// The parameters must already be validated.
    pub fn actuation_delay(&self) -> Option<Duration> {
        if self.emulate_actuation_delay {
            Some(Duration::from_secs_f64(self.actuation_delay_s))
        }
        else {
            None
        }
    }

    /// The parameters must already be validated.
    pub fn session_expiry(&self) -> Duration {
        Duration::from_secs_f64(self.session_expiry_s)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const EXEC_PARAMS: &str = r#"
        log_level = "debug"
        emulate_actuation_delay = true
        actuation_delay_s = 0.1
        session_expiry_s = 10.0

        [net]
        telem_endpoint = "tcp://*:4567"
        recv_timeout_ms = 1000
        send_timeout_ms = 1000
        "#;

    #[test]
    fn test_load_exec_params() {
        let p: MpcExecParams = util::params::from_toml_str(EXEC_PARAMS).unwrap();

        assert_eq!(p.log_level, "debug");
        assert!(p.emulate_actuation_delay);
        assert_eq!(p.net.telem_endpoint, "tcp://*:4567");
        assert!(p.validate().is_ok());
        assert_eq!(p.actuation_delay(), Some(Duration::from_millis(100)));
        assert_eq!(p.session_expiry(), Duration::from_secs(10));
    }

    #[test]
    fn test_invalid_exec_params_rejected() {
        let valid: MpcExecParams = util::params::from_toml_str(EXEC_PARAMS).unwrap();

        for &delay in [f64::INFINITY, f64::NAN, -0.1].iter() {
            let mut p = valid.clone();
            p.actuation_delay_s = delay;
            assert!(matches!(
                p.validate(),
                Err(ExecParamsError::InvalidActuationDelay(_))
            ));
        }

        for &expiry in [0.0, f64::INFINITY, -1.0].iter() {
            let mut p = valid.clone();
            p.session_expiry_s = expiry;
            assert!(matches!(
                p.validate(),
                Err(ExecParamsError::InvalidSessionExpiry(_))
            ));
        }
    }

    #[test]
    fn test_delay_disabled() {
        let mut p: MpcExecParams = util::params::from_toml_str(EXEC_PARAMS).unwrap();
        p.emulate_actuation_delay = false;

        assert_eq!(p.actuation_delay(), None);
    }
}

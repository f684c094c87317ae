//! Daemon environment handling for the SetEnv / ListenEnv / GetAllEnv
//! control requests.
//!
//! The environment is process-global; services forked after a SetEnv
//! observe the new value. Changes are reported to subscribed control
//! connections as EnvEvent info packets.

use std::env;

/// Parses and applies a `NAME=value` assignment. Returns the variable
/// name on success; `Err` if the input has no `=`, an empty name, or
/// embedded NULs.
pub fn set_env_assignment(assignment: &str) -> Result<String, ()> {
    let (name, value) = assignment.split_once('=').ok_or(())?;
    if name.is_empty() || name.contains('\0') || value.contains('\0') {
        return Err(());
    }
    // Single-threaded daemon; the only mutator is the control layer.
    unsafe {
        env::set_var(name, value);
    }
    Ok(name.to_owned())
}

/// Snapshot of the daemon environment as `NAME=value` entries.
/// Variables whose name or value is not valid UTF-8 are skipped.
pub fn environment_snapshot() -> Vec<String> {
    env::vars().map(|(k, v)| format!("{k}={v}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assignment_round_trip() {
        let name = set_env_assignment("ORDINIT_TEST_VAR=hello").unwrap();
        assert_eq!(name, "ORDINIT_TEST_VAR");
        assert_eq!(env::var("ORDINIT_TEST_VAR").unwrap(), "hello");
        assert!(environment_snapshot()
            .iter()
            .any(|e| e == "ORDINIT_TEST_VAR=hello"));

        // Value may itself contain '='.
        set_env_assignment("ORDINIT_TEST_VAR=a=b").unwrap();
        assert_eq!(env::var("ORDINIT_TEST_VAR").unwrap(), "a=b");
    }

    #[test]
    fn malformed_assignments_rejected() {
        assert!(set_env_assignment("NOEQUALS").is_err());
        assert!(set_env_assignment("=value").is_err());
    }
}

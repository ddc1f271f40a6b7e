use super::command::{Command, Response};
use super::state::{CertRow, FsmState, ValidationRow, VALIDATION_TTL_SECS};

/// Apply a command to the FSM state, returning a response.
///
/// This is a pure function — no I/O, no clocks. Applying the same command
/// sequence on any node produces identical state.
pub fn apply_command(state: &mut FsmState, cmd: Command) -> Response {
    match cmd {
        Command::CertInsert { subject, csr } => {
            // First writer wins; an existing row (with or without a chain)
            // is left untouched.
            state
                .certs
                .entry(subject)
                .or_insert(CertRow { csr, cert_pem: String::new(), expiry: 0 });
            Response::Ok
        }

        Command::CertUpsert { subject, csr, cert_pem, expiry } => {
            state.certs.insert(subject, CertRow { csr, cert_pem, expiry });
            Response::Ok
        }

        Command::ValidationSet { qname, value, now } => {
            state.validations.insert(qname, ValidationRow { value, created: now });
            state.validations.retain(|_, row| row.created >= now - VALIDATION_TTL_SECS);
            Response::Ok
        }

        Command::AutocertPut { key, data } => {
            state.autocert.insert(key, data);
            Response::Ok
        }

        Command::AutocertDelete { key } => {
            state.autocert.remove(&key);
            Response::Ok
        }
    }
}

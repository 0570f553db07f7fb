//! CLI command implementations.

pub mod purge;
pub mod recreate;
pub mod setup;

use std::io::{IsTerminal, Read};
use std::path::Path;
use vmhost::error::{Error, Result};
use vmhost_protocol::{StorageSecrets, VmParams};

/// Read standard input, or nothing when it is a terminal.
fn read_stdin() -> Result<String> {
    let mut input = String::new();
    let stdin = std::io::stdin();
    if stdin.is_terminal() {
        return Ok(input);
    }
    stdin.lock().read_to_string(&mut input)?;
    Ok(input)
}

/// Parameters and secrets from `--params` and standard input.
///
/// With `--params -` standard input holds the parameter document followed
/// by the secrets document; otherwise it holds only the secrets.
pub fn read_inputs(params: Option<&Path>) -> Result<(Option<VmParams>, StorageSecrets)> {
    let input = read_stdin()?;
    match params {
        Some(path) if path == Path::new("-") => {
            let mut docs = serde_json::Deserializer::from_str(&input).into_iter::<serde_json::Value>();
            let params = docs
                .next()
                .ok_or_else(|| Error::params("no parameter document on stdin"))??;
            let secrets = match docs.next() {
                Some(value) => serde_json::from_value(value?)?,
                None => StorageSecrets::new(),
            };
            Ok((Some(serde_json::from_value(params)?), secrets))
        }
        Some(path) => {
            let params = VmParams::from_json(&std::fs::read_to_string(path)?)?;
            Ok((Some(params), vmhost_protocol::parse_secrets(&input)?))
        }
        None => Ok((None, vmhost_protocol::parse_secrets(&input)?)),
    }
}

/// Warn when not running as root; most steps will fail.
pub fn warn_if_unprivileged() {
    let euid = unsafe { libc::geteuid() };
    if euid != 0 {
        tracing::warn!(euid, "not running as root, privileged commands will fail");
    }
}

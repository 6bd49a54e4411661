//! Passphrase acquisition: interactive prompt or external helper

use anyhow::{bail, Context, Result};
use secrecy::SecretString;
use std::process::Command;

/// Read the passphrase once: from the `--extpass` helper when given,
/// interactively otherwise.
pub fn read_passphrase(extpass: Option<&str>) -> Result<SecretString> {
    match extpass {
        Some(cmd) => from_helper(cmd),
        None => {
            let pw = rpassword::prompt_password("Password: ").context("reading password")?;
            if pw.is_empty() {
                bail!("empty password not allowed");
            }
            Ok(SecretString::from(pw))
        }
    }
}

/// Read the passphrase twice and require both entries to match (init).
/// A helper command is trusted to be consistent and only run once.
pub fn read_passphrase_twice(extpass: Option<&str>) -> Result<SecretString> {
    if let Some(cmd) = extpass {
        return from_helper(cmd);
    }

    let first = rpassword::prompt_password("New password: ").context("reading password")?;
    let second = rpassword::prompt_password("Confirm password: ").context("reading password")?;
    if first != second {
        bail!("passwords do not match");
    }
    if first.is_empty() {
        bail!("empty password not allowed");
    }
    Ok(SecretString::from(first))
}

/// Run the helper via the shell and take the first line of its stdout.
fn from_helper(cmd: &str) -> Result<SecretString> {
    let output = Command::new("sh")
        .arg("-c")
        .arg(cmd)
        .output()
        .with_context(|| format!("running extpass helper {cmd:?}"))?;
    if !output.status.success() {
        bail!("extpass helper {cmd:?} exited with {}", output.status);
    }

    let stdout = String::from_utf8(output.stdout).context("extpass output is not UTF-8")?;
    let password = stdout.lines().next().unwrap_or("").to_string();
    if password.is_empty() {
        bail!("extpass helper {cmd:?} produced no password");
    }
    Ok(SecretString::from(password))
}

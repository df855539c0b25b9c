//! Local subject validation.
//!
//! Subjects are dot-separated tokens. Publishing requires literal tokens;
//! subscribing also allows `*` (one token) and a trailing `>` (the rest).

use crate::error::{ClientError, Result};

fn bad(subject: &str, why: &str) -> ClientError {
    ClientError::BadSubject(format!("{subject:?}: {why}"))
}

fn check_tokens(subject: &str, wildcards: bool) -> Result<()> {
    if subject.is_empty() {
        return Err(bad(subject, "empty subject"));
    }
    if subject.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(bad(subject, "contains whitespace"));
    }

    let tokens: Vec<&str> = subject.split('.').collect();
    let last = tokens.len() - 1;
    for (i, token) in tokens.iter().enumerate() {
        match *token {
            "" => return Err(bad(subject, "empty token")),
            "*" if wildcards => {}
            ">" if wildcards && i == last => {}
            ">" if wildcards => return Err(bad(subject, "'>' must be the last token")),
            "*" | ">" => return Err(bad(subject, "wildcards are not allowed here")),
            _ => {}
        }
    }
    Ok(())
}

/// Validate a subject used for PUB or as a reply-to.
///
/// ```
/// use relay_core::subject::validate_publish;
///
/// assert!(validate_publish("orders.eu.created").is_ok());
/// assert!(validate_publish("orders.*").is_err());
/// ```
pub fn validate_publish(subject: &str) -> Result<()> {
    check_tokens(subject, false)
}

/// Validate a subject used for SUB.
pub fn validate_subscribe(subject: &str) -> Result<()> {
    check_tokens(subject, true)
}

/// Validate a queue group name: a single non-empty token without whitespace.
pub fn validate_queue_group(group: &str) -> Result<()> {
    if group.is_empty() || group.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(ClientError::BadSubject(format!("invalid queue group: {group:?}")));
    }
    Ok(())
}

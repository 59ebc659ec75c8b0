//! Recognizing transient failures and deriving the options for a retry.

use std::fmt;

use tracing::debug;

use crate::data::InstallOptions;
use crate::process::OutputLine;

/// An automatic adjustment that may turn a failed attempt into a successful one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Remediation {
    /// Re-run the command through the configured elevator.
    Elevate,
    /// Re-run with installer hash verification disabled.
    SkipIntegrityCheck,
}

impl Remediation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Remediation::Elevate => "elevate",
            Remediation::SkipIntegrityCheck => "skip_integrity_check",
        }
    }

    #[must_use]
    pub fn already_applied(&self, options: &InstallOptions) -> bool {
        match self {
            Remediation::Elevate => options.run_elevated,
            Remediation::SkipIntegrityCheck => options.skip_integrity_check,
        }
    }

    /// Derives the options for the next attempt. The input is left untouched.
    #[must_use]
    pub fn apply(&self, options: &InstallOptions) -> InstallOptions {
        let mut next = options.clone();
        match self {
            Remediation::Elevate => next.run_elevated = true,
            Remediation::SkipIntegrityCheck => next.skip_integrity_check = true,
        }
        next
    }
}

impl fmt::Display for Remediation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureClass {
    Transient(Remediation),
    Permanent,
}

/// Something in a failed attempt that identifies a known transient failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureSignature {
    /// Case-insensitive substring of any output line.
    Text(&'static str, Remediation),
    /// Exact process exit code.
    ExitCode(i32, Remediation),
}

impl FailureSignature {
    fn matches(&self, exit_code: Option<i32>, lowered: &[String]) -> Option<Remediation> {
        match *self {
            FailureSignature::Text(pattern, remediation) => lowered
                .iter()
                .any(|line| line.contains(pattern))
                .then_some(remediation),
            FailureSignature::ExitCode(code, remediation) => {
                (exit_code == Some(code)).then_some(remediation)
            }
        }
    }
}

/// Signatures shared by every CLI tool. Patterns are lowercase.
pub static COMMON_SIGNATURES: &[FailureSignature] = &[
    FailureSignature::Text("requires elevation", Remediation::Elevate),
    FailureSignature::Text("run as administrator", Remediation::Elevate),
    FailureSignature::Text("access is denied", Remediation::Elevate),
    FailureSignature::Text("permission denied", Remediation::Elevate),
    FailureSignature::Text("eacces", Remediation::Elevate),
    FailureSignature::Text("hash mismatch", Remediation::SkipIntegrityCheck),
    FailureSignature::Text("hash does not match", Remediation::SkipIntegrityCheck),
    FailureSignature::Text("integrity check failed", Remediation::SkipIntegrityCheck),
];

/// Classifies a failed attempt. Tool-specific signatures are checked before
/// the common ones.
pub fn classify(
    exit_code: Option<i32>,
    output: &[OutputLine],
    tool_signatures: &[FailureSignature],
) -> FailureClass {
    let lowered: Vec<String> = output.iter().map(|l| l.text.to_lowercase()).collect();
    tool_signatures
        .iter()
        .chain(COMMON_SIGNATURES)
        .find_map(|signature| signature.matches(exit_code, &lowered))
        .map_or(FailureClass::Permanent, FailureClass::Transient)
}

/// Why no further attempt will be made.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GiveUp {
    /// The failure is not one a remediation addresses.
    NoRemediation,
    /// The matching remediation was already in effect for this attempt.
    AlreadyApplied(Remediation),
    Exhausted,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    Retry {
        remediation: Remediation,
        options: InstallOptions,
    },
    GiveUp(GiveUp),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }

    /// Decides what happens after a failed attempt, given how many retries
    /// already happened.
    pub fn decide(
        &self,
        class: FailureClass,
        options: &InstallOptions,
        retries: u32,
    ) -> RetryDecision {
        let remediation = match class {
            FailureClass::Permanent => return RetryDecision::GiveUp(GiveUp::NoRemediation),
            FailureClass::Transient(remediation) => remediation,
        };
        if remediation.already_applied(options) {
            return RetryDecision::GiveUp(GiveUp::AlreadyApplied(remediation));
        }
        if retries >= self.max_retries {
            debug!(retries, max = self.max_retries, "Retry budget exhausted");
            return RetryDecision::GiveUp(GiveUp::Exhausted);
        }
        RetryDecision::Retry {
            remediation,
            options: remediation.apply(options),
        }
    }
}

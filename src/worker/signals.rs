//! Exit analysis for worker processes.

use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;

/// Why a worker process went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    /// Normal exit with status code.
    Exited(i32),
    /// Terminated by signal.
    Signaled(Signal),
    /// The exit could not be observed (e.g. waitpid failed).
    Unknown,
}

impl TerminationReason {
    /// Whether the worker left the way a termination request asks it to:
    /// exit code 0 or the default action of SIGTERM/SIGINT.
    pub fn is_clean(&self) -> bool {
        matches!(
            self,
            Self::Exited(0) | Self::Signaled(Signal::SIGTERM) | Self::Signaled(Signal::SIGINT)
        )
    }

    /// Whether the worker died from a fault rather than a request.
    pub fn is_crash(&self) -> bool {
        matches!(
            self,
            Self::Signaled(
                Signal::SIGSEGV | Signal::SIGBUS | Signal::SIGABRT | Signal::SIGILL | Signal::SIGFPE
            )
        )
    }

    pub fn description(&self) -> String {
        match self {
            Self::Exited(code) => format!("exited with code {}", code),
            Self::Signaled(Signal::SIGKILL) => "killed (SIGKILL)".to_string(),
            Self::Signaled(sig) => format!("terminated by {}", sig.as_str()),
            Self::Unknown => "unknown reason".to_string(),
        }
    }
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Map a `WaitStatus` for a terminated child to its reason.
pub fn analyze_wait_status(status: WaitStatus) -> TerminationReason {
    match status {
        WaitStatus::Exited(_, code) => TerminationReason::Exited(code),
        WaitStatus::Signaled(_, signal, _) => TerminationReason::Signaled(signal),
        _ => TerminationReason::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::Pid;

    #[test]
    fn test_clean_exits() {
        assert!(TerminationReason::Exited(0).is_clean());
        assert!(TerminationReason::Signaled(Signal::SIGTERM).is_clean());
        assert!(!TerminationReason::Exited(1).is_clean());
        assert!(!TerminationReason::Signaled(Signal::SIGKILL).is_clean());
    }

    #[test]
    fn test_crash_classification() {
        assert!(TerminationReason::Signaled(Signal::SIGSEGV).is_crash());
        assert!(TerminationReason::Signaled(Signal::SIGABRT).is_crash());
        assert!(!TerminationReason::Signaled(Signal::SIGTERM).is_crash());
        assert!(!TerminationReason::Exited(101).is_crash());
    }

    #[test]
    fn test_analyze_wait_status() {
        let pid = Pid::from_raw(1);
        assert_eq!(
            analyze_wait_status(WaitStatus::Exited(pid, 3)),
            TerminationReason::Exited(3)
        );
        assert_eq!(
            analyze_wait_status(WaitStatus::Signaled(pid, Signal::SIGTERM, false)),
            TerminationReason::Signaled(Signal::SIGTERM)
        );
        assert_eq!(
            analyze_wait_status(WaitStatus::StillAlive),
            TerminationReason::Unknown
        );
    }

    #[test]
    fn test_description() {
        assert_eq!(
            TerminationReason::Signaled(Signal::SIGTERM).to_string(),
            "terminated by SIGTERM"
        );
        assert_eq!(TerminationReason::Exited(2).to_string(), "exited with code 2");
    }
}

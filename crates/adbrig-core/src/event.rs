/// Events emitted by a runner over its event channel, in emission order.
/// `Terminal` is always the last event of an invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdbEvent {
    /// The OS confirmed the process launched.
    Started,
    /// A raw output increment or a synthesized status line.
    Log(String),
    /// Deduplicated transfer progress, only during push/pull commands.
    Progress { download: bool, percent: u8 },
    /// Final outcome; the session is over and the runner is reusable.
    Terminal(ExecOutcome),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecOutcome {
    /// Process exited with status 0.
    Succeeded,
    /// Process ran and exited non-zero (including after a kill request).
    ExitedWithError,
    /// The OS could not create the process for a reason other than a
    /// missing executable.
    StartFailed,
    /// The resolved adb path does not point at an executable.
    MissingBinary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferDirection {
    #[default]
    None,
    Push,
    Pull,
}

impl TransferDirection {
    pub fn is_transfer(self) -> bool {
        matches!(self, TransferDirection::Push | TransferDirection::Pull)
    }

    pub fn is_download(self) -> bool {
        matches!(self, TransferDirection::Pull)
    }
}

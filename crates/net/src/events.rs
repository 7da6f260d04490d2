/// State-transition notifications collected during a pump and drained by
/// the facade, which turns them into registered callback invocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionEvent {
    ConnectedToServer,
    DisconnectedFromServer { reason: DisconnectReason },
    ClientConnected { client_index: usize },
    ClientDisconnected { client_index: usize, reason: DisconnectReason },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DisconnectReason {
    Graceful,
    Timeout,
    Remote,
}

impl DisconnectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisconnectReason::Graceful => "disconnected",
            DisconnectReason::Timeout => "timed out",
            DisconnectReason::Remote => "closed by peer",
        }
    }
}

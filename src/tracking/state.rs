//! Tracking state machine.

/// State of the frontend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrackingState {
    /// No frame accepted yet.
    #[default]
    NotInitialized,
    /// Tracking successfully.
    Ok,
    /// Lost tracking recently, attempting recovery against the last good frame.
    RecentlyLost,
    /// Lost for several frames; the motion prior has been dropped.
    Lost,
}

impl TrackingState {
    /// True while the frontend refuses to publish new poses or keyframes.
    pub fn is_degraded(&self) -> bool {
        matches!(self, Self::RecentlyLost | Self::Lost)
    }
}

impl std::fmt::Display for TrackingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::NotInitialized => "NOT_INITIALIZED",
            Self::Ok => "OK",
            Self::RecentlyLost => "RECENTLY_LOST",
            Self::Lost => "LOST",
        };
        f.write_str(name)
    }
}

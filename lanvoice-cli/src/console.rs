//! Line-based call controls read from stdin

use lanvoice_core::{CallEvent, CallState, EndReason};

/// Help shown for unrecognised input
pub const HELP: &str =
    "Commands: a=accept  m=mute  u=unmute  s=speaker  e=earpiece  h=hang up  q=quit";

/// One command typed by the user
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleCommand {
    Accept,
    Mute,
    Unmute,
    Speaker,
    Earpiece,
    HangUp,
    Quit,
}

impl ConsoleCommand {
    /// Parse one input line; surrounding whitespace and case are ignored
    pub fn parse(line: &str) -> Option<Self> {
        match line.trim().to_ascii_lowercase().as_str() {
            "a" | "accept" => Some(Self::Accept),
            "m" | "mute" => Some(Self::Mute),
            "u" | "unmute" => Some(Self::Unmute),
            "s" | "speaker" => Some(Self::Speaker),
            "e" | "earpiece" => Some(Self::Earpiece),
            "h" | "hangup" => Some(Self::HangUp),
            "q" | "quit" => Some(Self::Quit),
            _ => None,
        }
    }
}

/// Status line for a call state
pub fn describe_state(state: &CallState) -> String {
    match state {
        CallState::Idle => "Idle".to_string(),
        CallState::Calling { peer } => format!("📞 Calling {}...", peer.name),
        CallState::IncomingRinging { peer } => {
            format!("🔔 {} is calling, press 'a' to accept or 'h' to decline", peer.name)
        }
        CallState::InCall {
            peer,
            muted,
            speaker_on,
        } => format!(
            "✅ In call with {} | mic: {} | audio: {}",
            peer.name,
            if *muted { "muted" } else { "on" },
            if *speaker_on { "speaker" } else { "earpiece" },
        ),
    }
}

/// Notification line for a call event
pub fn describe_event(event: &CallEvent) -> String {
    match event {
        CallEvent::IncomingCall { peer } => format!("Incoming call from {}", peer),
        CallEvent::CallStarted { peer } => format!("Call with {} started", peer.name),
        CallEvent::CallEnded { peer, reason } => {
            let who = peer.as_ref().map_or("peer", |p| p.name.as_str());
            format!("📴 Call with {} ended ({})", who, describe_reason(*reason))
        }
    }
}

fn describe_reason(reason: EndReason) -> &'static str {
    match reason {
        EndReason::LocalHangup => "hung up",
        EndReason::RemoteHangup => "remote hung up",
        EndReason::Disconnected => "connection lost",
        EndReason::MediaFailed => "media failed",
        EndReason::Superseded => "replaced by a new call",
        EndReason::Shutdown => "shutting down",
    }
}

//! Line-oriented console for the ringline CLI

use ringline_core::prelude::*;
use ringline_core::{CallStatus, EndReason};

/// Key reference printed at session start and on `?`
pub const HELP: &str = "Commands: a accept | r reject | h hang up | m mute | v video | q quit";

/// A line typed by the user
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    /// Forward to the controller
    Command(Command),
    /// Print the key reference
    Help,
    /// Hang up and exit
    Quit,
}

/// Parse a single console line
pub fn parse_input(line: &str) -> Option<Input> {
    let input = match line.trim().to_ascii_lowercase().as_str() {
        "a" | "accept" => Input::Command(Command::Accept),
        "r" | "reject" => Input::Command(Command::Reject),
        "h" | "hangup" | "end" => Input::Command(Command::End),
        "m" | "mute" => Input::Command(Command::ToggleMute),
        "v" | "video" => Input::Command(Command::ToggleVideo),
        "?" | "help" => Input::Help,
        "q" | "quit" | "exit" => Input::Quit,
        _ => return None,
    };
    Some(input)
}

/// Console line for a call event, if it is worth showing
pub fn describe(event: &CallEvent, local: &ParticipantId) -> Option<String> {
    match event {
        CallEvent::IncomingCall { call } => Some(format!(
            "📞 Incoming {} call from {} ({}) - 'a' to accept, 'r' to reject",
            call.call_type, call.caller_id, call.id
        )),
        CallEvent::OutgoingCall { call } => Some(format!(
            "📞 Calling {}... ({})",
            call.peer_of(local),
            call.id
        )),
        CallEvent::Connected { call_id } => Some(format!("✅ Connected ({call_id})")),
        CallEvent::StateChanged(state) if state.is_in_call => Some(format!(
            "   Muted: {} | Video: {} | Remote media: {}",
            yes_no(state.is_muted),
            yes_no(state.is_video_enabled),
            yes_no(state.has_remote_stream)
        )),
        CallEvent::CallEnded { call, reason } => {
            let duration = call
                .as_ref()
                .filter(|call| call.duration.is_some())
                .map(|call| format!(" after {}", call.format_duration()))
                .unwrap_or_default();
            Some(format!("📴 Call ended{duration}: {}", end_reason(reason)))
        }
        CallEvent::PhaseChanged { .. } | CallEvent::StateChanged(_) => None,
    }
}

/// One line of the history listing
pub fn history_row(call: &Call, local: &ParticipantId) -> String {
    let direction = if call.is_outgoing_for(local) { "→" } else { "←" };
    format!(
        "{}  {} {:<20} {:<5} {:<8} {}",
        call.created_at.format("%Y-%m-%d %H:%M"),
        direction,
        call.peer_of(local).as_str(),
        call.call_type.to_string(),
        status_label(call.status),
        call.format_duration()
    )
}

fn status_label(status: CallStatus) -> &'static str {
    match status {
        CallStatus::Pending => "pending",
        CallStatus::Accepted => "accepted",
        CallStatus::Rejected => "rejected",
        CallStatus::Ended => "ended",
        CallStatus::Missed => "missed",
    }
}

fn end_reason(reason: &EndReason) -> String {
    match reason {
        EndReason::LocalHangup => "you hung up".to_string(),
        EndReason::RemoteHangup => "the other side hung up".to_string(),
        EndReason::Rejected => "call declined".to_string(),
        EndReason::Declined => "you declined".to_string(),
        EndReason::ChannelLost => "relay connection lost".to_string(),
        EndReason::Failed(error) => format!("failed ({error})"),
    }
}

fn yes_no(flag: bool) -> &'static str {
    if flag {
        "on"
    } else {
        "off"
    }
}

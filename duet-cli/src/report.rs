//! Console output for call events and history

use duet_core::{CallEvent, CallHistoryRecord, CallNotice, CallStats, HistoryDirection, UserId};

/// One-line description of an event, or `None` for events not worth printing
pub fn describe_event(event: &CallEvent<UserId>) -> Option<String> {
    let line = match event {
        CallEvent::IncomingCall {
            caller, media_type, ..
        } => format!("📞 Incoming {media_type} call from {caller}"),
        CallEvent::StateChanged {
            old_state,
            new_state,
            ..
        } => format!("   {old_state} → {new_state}"),
        CallEvent::MediaTypeChanged {
            media_type, remote, ..
        } => {
            let who = if *remote { "peer" } else { "you" };
            format!("🔁 Switched to {media_type} ({who})")
        }
        CallEvent::RemoteVideoToggled { enabled, .. } => {
            format!("📷 Peer camera {}", if *enabled { "on" } else { "off" })
        }
        CallEvent::ScreenShareChanged { active, .. } => {
            format!("🖥  Screen share {}", if *active { "started" } else { "stopped" })
        }
        CallEvent::DurationTick { .. } => return None,
        CallEvent::CallEnded {
            outcome,
            duration_secs,
            ..
        } => format!("📴 Call ended: {outcome} ({})", format_duration(*duration_secs)),
        CallEvent::Notice { notice, .. } => format!("⚠️  {}", describe_notice(notice)),
    };
    Some(line)
}

fn describe_notice(notice: &CallNotice) -> String {
    match notice {
        CallNotice::PermissionDenied(detail) => format!("Permission denied: {detail}"),
        CallNotice::DeviceUnavailable(detail) => format!("Device unavailable: {detail}"),
        CallNotice::ConnectionFailed(detail) => format!("Connection failed: {detail}"),
        CallNotice::SignalingUnavailable(detail) => format!("Signaling unavailable: {detail}"),
        CallNotice::RemoteBusy => "User is in another call".to_string(),
    }
}

/// `m:ss`, or `h:mm:ss` past an hour
pub fn format_duration(secs: u64) -> String {
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{h}:{m:02}:{s:02}")
    } else {
        format!("{m}:{s:02}")
    }
}

fn direction_icon(direction: HistoryDirection) -> &'static str {
    match direction {
        HistoryDirection::Incoming => "↙",
        HistoryDirection::Outgoing => "↗",
        HistoryDirection::Missed => "✗",
    }
}

pub fn print_records(records: &[CallHistoryRecord]) {
    if records.is_empty() {
        println!("No calls recorded");
        return;
    }
    for record in records {
        println!(
            "{} {:<20} {:<5} {:<9} {:>7}  {}",
            direction_icon(record.direction),
            record.participant_display_name,
            record.media_type.to_string(),
            record.outcome.to_string(),
            format_duration(record.duration_seconds),
            record
                .started_at
                .with_timezone(&chrono::Local)
                .format("%Y-%m-%d %H:%M"),
        );
    }
}

pub fn print_stats(owner: &str, stats: &CallStats) {
    println!("📊 Call statistics for {owner}");
    println!("==========================");
    println!("Total calls:      {}", stats.total_calls);
    println!("Completed:        {}", stats.completed_calls);
    println!("Missed:           {}", stats.missed_calls);
    println!(
        "Average duration: {}",
        format_duration(stats.average_duration_seconds.round() as u64)
    );
    println!("Total talk time:  {}", format_duration(stats.total_duration_seconds));
}

#[cfg(test)]
mod tests {
    use super::*;
    use duet_core::{CallId, CallOutcome, CallState};

    #[test]
    fn durations_format_like_a_clock() {
        assert_eq!(format_duration(0), "0:00");
        assert_eq!(format_duration(65), "1:05");
        assert_eq!(format_duration(3_725), "1:02:05");
    }

    #[test]
    fn duration_ticks_are_not_printed() {
        let tick = CallEvent::<UserId>::DurationTick {
            call_id: CallId::new(),
            elapsed_secs: 3,
        };
        assert!(describe_event(&tick).is_none());
    }

    #[test]
    fn terminal_events_are_described() {
        let call_id = CallId::new();
        let ended = CallEvent::<UserId>::CallEnded {
            call_id,
            outcome: CallOutcome::NoAnswer,
            duration_secs: 0,
        };
        assert_eq!(
            describe_event(&ended).as_deref(),
            Some("📴 Call ended: no-answer (0:00)")
        );

        let changed = CallEvent::<UserId>::StateChanged {
            call_id,
            old_state: CallState::Calling,
            new_state: CallState::InCall,
        };
        assert_eq!(describe_event(&changed).as_deref(), Some("   calling → in-call"));
    }
}

//! Human-readable discovery status.

use crate::watcher::WatcherState;

/// Status shown once the watchers have been stopped.
pub const STOPPED: &str = "stopped";

/// Derive the status line from every domain's state.
///
/// First match wins: no domains, any failed, any waiting, any ready, any
/// still in setup, otherwise searching.
pub fn status_text<'a, I>(states: I, gateway_count: usize) -> String
where
    I: IntoIterator<Item = &'a WatcherState>,
{
    let states: Vec<&WatcherState> = states.into_iter().collect();
    if states.is_empty() {
        return "idle".to_string();
    }
    if let Some(err) = states.iter().find_map(|s| match s {
        WatcherState::Failed(e) => Some(e),
        _ => None,
    }) {
        return format!("failed: {err}");
    }
    if let Some(err) = states.iter().find_map(|s| match s {
        WatcherState::Waiting(e) => Some(e),
        _ => None,
    }) {
        return format!("waiting: {err}");
    }
    if states.iter().any(|s| matches!(s, WatcherState::Ready)) {
        return match gateway_count {
            0 => "ready".to_string(),
            1 => "ready: 1 gateway".to_string(),
            n => format!("ready: {n} gateways"),
        };
    }
    if states.iter().any(|s| matches!(s, WatcherState::Idle)) {
        return "setup".to_string();
    }
    "searching".to_string()
}

use chrono::{DateTime, Local};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Per-destination bookkeeping for the session summary.
#[derive(Debug, Clone, Default)]
pub struct SubStats {
    /// Subscription id while the destination is subscribed.
    pub id: Option<String>,
    /// Number of messages received on this destination
    pub message_count: u64,
    pub last_message: Option<DateTime<Local>>,
}

/// Session state shared between the command loop and subscription tasks.
pub struct AppState {
    pub start_time: DateTime<Local>,
    pub address: String,
    pub user: String,
    pub sent: u64,
    /// Destinations ever subscribed in this session.
    pub subscriptions: BTreeMap<String, SubStats>,
}

impl AppState {
    pub fn new(address: String, user: String) -> Self {
        Self {
            start_time: Local::now(),
            address,
            user,
            sent: 0,
            subscriptions: BTreeMap::new(),
        }
    }

    pub fn register_subscription(&mut self, destination: &str, id: &str) {
        self.subscriptions
            .entry(destination.to_string())
            .or_default()
            .id = Some(id.to_string());
    }

    /// Forget the active subscription id for `destination`, returning it.
    pub fn take_subscription(&mut self, destination: &str) -> Option<String> {
        self.subscriptions.get_mut(destination)?.id.take()
    }

    pub fn record_message(&mut self, destination: &str) {
        let stats = self.subscriptions.entry(destination.to_string()).or_default();
        stats.message_count += 1;
        stats.last_message = Some(Local::now());
    }

    pub fn record_sent(&mut self) {
        self.sent += 1;
    }

    pub fn total_message_count(&self) -> u64 {
        self.subscriptions.values().map(|s| s.message_count).sum()
    }

    /// Generate session summary text
    pub fn generate_summary(&self) -> String {
        let end_time = Local::now();
        let total_secs = end_time.signed_duration_since(self.start_time).num_seconds();

        let mut lines = Vec::new();
        lines.push(format!("Session summary for {}@{}", self.user, self.address));
        lines.push(format!(
            "  Started:  {}",
            self.start_time.format("%Y-%m-%d %H:%M:%S")
        ));
        lines.push(format!("  Duration: {}m {}s", total_secs / 60, total_secs % 60));
        lines.push(format!("  Sent:     {}", self.sent));
        lines.push("  Received:".to_string());

        let width = self
            .subscriptions
            .keys()
            .map(|d| d.len())
            .max()
            .unwrap_or(5)
            .clamp(5, 40);
        for (dest, stats) in &self.subscriptions {
            let last = stats
                .last_message
                .map(|t| t.format("%H:%M:%S").to_string())
                .unwrap_or_else(|| "-".to_string());
            let marker = if stats.id.is_some() { "" } else { " (unsubscribed)" };
            lines.push(format!(
                "    {:width$} {:>6}  last {}{}",
                dest,
                stats.message_count,
                last,
                marker,
                width = width
            ));
        }
        lines.push(format!(
            "    {:width$} {:>6}",
            "Total",
            self.total_message_count(),
            width = width
        ));
        lines.join("\n")
    }
}

/// Thread-safe shared state
pub type SharedState = Arc<Mutex<AppState>>;

pub fn new_shared_state(address: String, user: String) -> SharedState {
    Arc::new(Mutex::new(AppState::new(address, user)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_messages_per_destination() {
        let mut state = AppState::new("localhost:61613".into(), "guest".into());
        state.register_subscription("/queue/a", "0");
        state.record_message("/queue/a");
        state.record_message("/queue/a");
        state.record_message("/topic/b");
        assert_eq!(state.total_message_count(), 3);
        assert_eq!(state.subscriptions["/queue/a"].message_count, 2);
    }

    #[test]
    fn take_subscription_clears_id_once() {
        let mut state = AppState::new("h".into(), "u".into());
        state.register_subscription("/queue/a", "4");
        assert_eq!(state.take_subscription("/queue/a").as_deref(), Some("4"));
        assert_eq!(state.take_subscription("/queue/a"), None);
        assert_eq!(state.take_subscription("/queue/missing"), None);
        assert!(state.generate_summary().contains("(unsubscribed)"));
    }
}

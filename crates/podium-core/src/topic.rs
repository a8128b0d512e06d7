//! Topic names for live-connection broadcasts.

/// Maximum topic name length in bytes.
pub const MAX_TOPIC_LENGTH: usize = 256;

/// Topic every connection is implicitly reachable on.
pub const GLOBAL: &str = "global";

/// Topic carrying updates for one leaderboard.
#[must_use]
pub fn leaderboard(id: &str) -> String {
    format!("leaderboard:{id}")
}

/// Topic carrying updates for one user.
#[must_use]
pub fn user(id: &str) -> String {
    format!("user:{id}")
}

/// Topic carrying notifications for one user.
#[must_use]
pub fn notification(user_id: &str) -> String {
    format!("notification:{user_id}")
}

/// Topic for one chat room.
#[must_use]
pub fn chat(room_id: &str) -> String {
    format!("chat:{room_id}")
}

/// Validate a topic name requested by a client.
///
/// # Errors
///
/// Returns a message describing why the name is rejected.
pub fn validate_topic(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("Topic cannot be empty");
    }
    if name.len() > MAX_TOPIC_LENGTH {
        return Err("Topic too long");
    }
    if !name.chars().all(|c| c.is_ascii() && !c.is_ascii_control()) {
        return Err("Topic contains invalid characters");
    }
    Ok(())
}

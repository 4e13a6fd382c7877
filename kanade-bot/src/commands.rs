//! Slash commands.

use crate::discord::format::user_mention;
use crate::message::CommandInvocation;
use kanade_memory::MemoryStore;
use kanade_memory::MemoryError;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

/// Discord `ADMINISTRATOR` permission bit.
pub const PERMISSION_ADMINISTRATOR: u64 = 1 << 3;
/// Discord `MANAGE_GUILD` permission bit.
pub const PERMISSION_MANAGE_GUILD: u64 = 1 << 5;

/// How long `/reset` waits for a user who is mid-exchange. Discord drops
/// interaction callbacks that arrive after three seconds.
pub const RESET_LOCK_WAIT: Duration = Duration::from_secs(2);

/// Entries shown by `/leaderboard`.
pub const LEADERBOARD_SIZE: usize = 10;

pub const HELP_TEXT: &str = "\
**Kanade**
Mention me with a question and I'll answer. Attach images and I'll look at them too.
I remember our recent conversation until you go quiet for a while.

`/stats` shows how busy I've been.
`/leaderboard` lists who talks to me the most.
`/reset [user]` clears a conversation (admins only).
`/help` shows this message.";

/// A recognised slash command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Reset { target: Option<String> },
    Stats,
    Leaderboard,
    Help,
}

impl Command {
    pub fn parse(invocation: &CommandInvocation) -> Option<Self> {
        match invocation.name.as_str() {
            "reset" => Some(Self::Reset {
                target: invocation.target_user.clone(),
            }),
            "stats" => Some(Self::Stats),
            "leaderboard" => Some(Self::Leaderboard),
            "help" => Some(Self::Help),
            _ => None,
        }
    }
}

/// True if the permission bitfield allows administrative commands.
pub fn is_admin(permissions: u64) -> bool {
    permissions & (PERMISSION_ADMINISTRATOR | PERMISSION_MANAGE_GUILD) != 0
}

/// Application command definitions for bulk registration.
pub fn command_definitions() -> serde_json::Value {
    json!([
        {
            "name": "reset",
            "description": "Clear a user's conversation with Kanade",
            "type": 1,
            "options": [{
                "name": "user",
                "description": "User to reset (defaults to you)",
                "type": 6,
                "required": false
            }]
        },
        { "name": "stats", "description": "Show activity statistics", "type": 1 },
        { "name": "leaderboard", "description": "Show the most active users", "type": 1 },
        { "name": "help", "description": "How to talk to Kanade", "type": 1 }
    ])
}

/// Executes slash commands against the conversation store.
pub struct CommandHandler {
    store: Arc<MemoryStore>,
}

impl CommandHandler {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self { store }
    }

    /// Run the invocation and return the response text.
    pub async fn handle(&self, invocation: &CommandInvocation) -> String {
        let Some(command) = Command::parse(invocation) else {
            tracing::debug!(command = %invocation.name, "Unknown command");
            return format!("Unknown command `/{}`.", invocation.name);
        };

        match command {
            Command::Reset { target } => self.reset(invocation, target).await,
            Command::Stats => self.stats(),
            Command::Leaderboard => self.leaderboard(),
            Command::Help => HELP_TEXT.to_string(),
        }
    }

    async fn reset(&self, invocation: &CommandInvocation, target: Option<String>) -> String {
        if !is_admin(invocation.invoker_permissions) {
            tracing::info!(invoker = %invocation.invoker_id, "Reset denied");
            return "Only admins can reset conversations.".to_string();
        }

        let target = target.unwrap_or_else(|| invocation.invoker_id.clone());
        match self.store.reset(&target, RESET_LOCK_WAIT).await {
            Ok(removed) => {
                tracing::info!(invoker = %invocation.invoker_id, target = %target, removed, "Reset");
                if removed {
                    format!("Memory cleared for {}.", user_mention(&target))
                } else {
                    format!("Nothing to clear for {}.", user_mention(&target))
                }
            }
            Err(e @ MemoryError::LockTimeout { .. }) => {
                tracing::warn!(invoker = %invocation.invoker_id, error = %e, "Reset skipped");
                format!(
                    "{} is busy right now. Try again in a moment.",
                    user_mention(&target)
                )
            }
            Err(e) => {
                tracing::warn!(invoker = %invocation.invoker_id, error = %e, "Reset failed");
                "Reset failed. Try again.".to_string()
            }
        }
    }

    fn stats(&self) -> String {
        let stats = self.store.stats();
        format!(
            "**Stats**\nActive users: {}\nTotal messages: {}\nAverage per user: {}",
            stats.active_users, stats.total_messages, stats.average
        )
    }

    fn leaderboard(&self) -> String {
        let top = self.store.top_n(LEADERBOARD_SIZE);
        if top.is_empty() {
            return "**Leaderboard**\nNo messages yet.".to_string();
        }

        let mut out = String::from("**Leaderboard**");
        for (rank, (user_id, count)) in top.iter().enumerate() {
            let noun = if *count == 1 { "message" } else { "messages" };
            out.push_str(&format!("\n{}. {}: {count} {noun}", rank + 1, user_mention(user_id)));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use kanade_memory::Turn;
    use std::convert::Infallible;
    use test_case::test_case;

    fn invocation(name: &str, permissions: u64, target: Option<&str>) -> CommandInvocation {
        CommandInvocation {
            id: "i1".into(),
            token: "tok".into(),
            name: name.into(),
            invoker_id: "admin".into(),
            invoker_permissions: permissions,
            target_user: target.map(String::from),
            trace_id: "t".into(),
        }
    }

    async fn seed(store: &MemoryStore, user_id: &str, messages: usize) {
        let t0 = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        for _ in 0..messages {
            let mut entry = store
                .get_or_create(user_id, || Ok::<_, Infallible>(vec![Turn::user("p"), Turn::assistant("a")]))
                .await
                .unwrap();
            entry.record_activity(t0);
        }
    }

    #[test_case(0, false ; "no permissions")]
    #[test_case(PERMISSION_ADMINISTRATOR, true ; "administrator")]
    #[test_case(PERMISSION_MANAGE_GUILD, true ; "manage guild")]
    #[test_case(1 << 11, false ; "send messages only")]
    #[test_case(u64::MAX, true ; "everything")]
    fn test_is_admin(permissions: u64, expected: bool) {
        assert_eq!(is_admin(permissions), expected);
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(
            Command::parse(&invocation("reset", 0, Some("u2"))),
            Some(Command::Reset {
                target: Some("u2".into())
            })
        );
        assert_eq!(Command::parse(&invocation("stats", 0, None)), Some(Command::Stats));
        assert_eq!(Command::parse(&invocation("dance", 0, None)), None);
    }

    #[test]
    fn test_command_definitions() {
        let defs = command_definitions();
        let names: Vec<&str> = defs
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|d| d["name"].as_str())
            .collect();
        assert_eq!(names, ["reset", "stats", "leaderboard", "help"]);
        assert_eq!(defs[0]["options"][0]["type"], 6);
    }

    #[tokio::test]
    async fn test_reset_requires_admin() {
        let store = Arc::new(MemoryStore::new(20));
        seed(&store, "u2", 3).await;
        let handler = CommandHandler::new(Arc::clone(&store));

        let reply = handler.handle(&invocation("reset", 0, Some("u2"))).await;
        assert!(reply.contains("Only admins"));
        assert_eq!(store.message_count("u2"), Some(3));

        let reply = handler
            .handle(&invocation("reset", PERMISSION_MANAGE_GUILD, Some("u2")))
            .await;
        assert_eq!(reply, "Memory cleared for <@u2>.");
        assert_eq!(store.message_count("u2"), None);
        assert!(store.history("u2").await.is_none());

        let reply = handler
            .handle(&invocation("reset", PERMISSION_MANAGE_GUILD, Some("u2")))
            .await;
        assert_eq!(reply, "Nothing to clear for <@u2>.");
    }

    #[tokio::test]
    async fn test_reset_defaults_to_invoker() {
        let store = Arc::new(MemoryStore::new(20));
        seed(&store, "admin", 1).await;
        let handler = CommandHandler::new(Arc::clone(&store));

        handler
            .handle(&invocation("reset", PERMISSION_ADMINISTRATOR, None))
            .await;
        assert!(!store.contains("admin"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_of_busy_user_answers_in_time() {
        let store = Arc::new(MemoryStore::new(20));
        seed(&store, "u2", 2).await;
        let handler = CommandHandler::new(Arc::clone(&store));

        let held = store.entry("u2").await;
        let reply = tokio::time::timeout(
            Duration::from_secs(3),
            handler.handle(&invocation("reset", PERMISSION_ADMINISTRATOR, Some("u2"))),
        )
        .await
        .expect("reset must answer before the interaction deadline");
        assert_eq!(reply, "<@u2> is busy right now. Try again in a moment.");
        assert_eq!(store.message_count("u2"), Some(2));

        drop(held);
        let reply = handler
            .handle(&invocation("reset", PERMISSION_ADMINISTRATOR, Some("u2")))
            .await;
        assert_eq!(reply, "Memory cleared for <@u2>.");
    }

    #[tokio::test]
    async fn test_stats_and_leaderboard() {
        let store = Arc::new(MemoryStore::new(20));
        let handler = CommandHandler::new(Arc::clone(&store));

        assert_eq!(
            handler.handle(&invocation("leaderboard", 0, None)).await,
            "**Leaderboard**\nNo messages yet."
        );

        seed(&store, "a", 5).await;
        seed(&store, "b", 5).await;
        seed(&store, "c", 1).await;

        assert_eq!(
            handler.handle(&invocation("stats", 0, None)).await,
            "**Stats**\nActive users: 3\nTotal messages: 11\nAverage per user: 3"
        );
        assert_eq!(
            handler.handle(&invocation("leaderboard", 0, None)).await,
            "**Leaderboard**\n1. <@a>: 5 messages\n2. <@b>: 5 messages\n3. <@c>: 1 message"
        );
    }

    #[tokio::test]
    async fn test_help_and_unknown() {
        let handler = CommandHandler::new(Arc::new(MemoryStore::new(20)));
        assert_eq!(handler.handle(&invocation("help", 0, None)).await, HELP_TEXT);
        assert!(handler
            .handle(&invocation("dance", 0, None))
            .await
            .starts_with("Unknown command"));
    }
}

//! Reply-matcher waits: a running task can block (bounded by a
//! timeout) for the next message from a specific user, optionally in a
//! specific channel. The dispatcher offers every inbound event here
//! first; a consumed event never reaches plugin matching.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use regex::Regex;
use tokio::sync::oneshot;
use tracing::debug;

use crate::tasks::pattern;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyOutcome {
    /// The reply matched the registered pattern.
    Matched(String),
    /// A reply arrived but did not match the pattern.
    NotMatched(String),
    /// No reply within the caller's timeout.
    TimedOut,
}

struct Waiter {
    re: Regex,
    tx: oneshot::Sender<(bool, String)>,
}

#[derive(Default)]
pub struct ReplyWaiters {
    // Keyed by (user, channel-or-empty). One outstanding wait per
    // sender context at a time; a new wait replaces the old.
    waiting: Mutex<HashMap<(String, String), Waiter>>,
}

fn wait_key(user: &str, channel: Option<&str>) -> (String, String) {
    (user.to_string(), channel.unwrap_or_default().to_string())
}

impl ReplyWaiters {
    pub fn new() -> Self {
        ReplyWaiters::default()
    }

    /// Wait for the next message from `user` in `channel`, matching it
    /// against `pattern` (compiled anchored, like a command matcher).
    pub async fn wait_for_reply(
        &self,
        user: &str,
        channel: Option<&str>,
        pattern: &str,
        timeout: Duration,
    ) -> Result<ReplyOutcome, regex::Error> {
        let re = pattern::compile_anchored(pattern)?;
        let (tx, rx) = oneshot::channel();
        {
            let mut waiting = self.waiting.lock().expect("reply table poisoned");
            if waiting
                .insert(wait_key(user, channel), Waiter { re, tx })
                .is_some()
            {
                debug!("replacing outstanding reply wait for {user}");
            }
        }
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok((true, text))) => Ok(ReplyOutcome::Matched(text)),
            Ok(Ok((false, text))) => Ok(ReplyOutcome::NotMatched(text)),
            // Sender dropped: the wait was replaced by a newer one.
            Ok(Err(_)) => Ok(ReplyOutcome::TimedOut),
            Err(_) => {
                let mut waiting = self.waiting.lock().expect("reply table poisoned");
                waiting.remove(&wait_key(user, channel));
                Ok(ReplyOutcome::TimedOut)
            }
        }
    }

    /// Offer an inbound message to a waiting task. Returns true when
    /// the message was consumed by a waiter.
    pub fn deliver(&self, user: &str, channel: Option<&str>, text: &str) -> bool {
        let waiter = {
            let mut waiting = self.waiting.lock().expect("reply table poisoned");
            waiting.remove(&wait_key(user, channel))
        };
        match waiter {
            Some(w) => {
                let matched = w.re.is_match(text);
                let _ = w.tx.send((matched, text.to_string()));
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn matching_reply_is_consumed_and_returned() {
        let waiters = Arc::new(ReplyWaiters::new());
        let w = waiters.clone();
        let wait = tokio::spawn(async move {
            w.wait_for_reply("alice", Some("general"), r"(yes|no)", Duration::from_secs(2))
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(waiters.deliver("alice", Some("general"), "yes"));
        assert_eq!(
            wait.await.unwrap().unwrap(),
            ReplyOutcome::Matched("yes".to_string())
        );
        // Consumed: a second identical message finds no waiter.
        assert!(!waiters.deliver("alice", Some("general"), "yes"));
    }

    #[tokio::test]
    async fn non_matching_reply_reports_not_matched() {
        let waiters = Arc::new(ReplyWaiters::new());
        let w = waiters.clone();
        let wait = tokio::spawn(async move {
            w.wait_for_reply("bob", None, r"\d+", Duration::from_secs(2)).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(waiters.deliver("bob", None, "dunno"));
        assert_eq!(
            wait.await.unwrap().unwrap(),
            ReplyOutcome::NotMatched("dunno".to_string())
        );
    }

    #[tokio::test]
    async fn wait_times_out_instead_of_hanging() {
        let waiters = ReplyWaiters::new();
        let outcome = waiters
            .wait_for_reply("carol", None, r".*", Duration::from_millis(30))
            .await
            .unwrap();
        assert_eq!(outcome, ReplyOutcome::TimedOut);
        // The expired wait was cleaned up.
        assert!(!waiters.deliver("carol", None, "too late"));
    }

    #[tokio::test]
    async fn waits_are_scoped_to_user_and_channel() {
        let waiters = Arc::new(ReplyWaiters::new());
        let w = waiters.clone();
        let wait = tokio::spawn(async move {
            w.wait_for_reply("dave", Some("ops"), r".*", Duration::from_millis(200))
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        // Wrong user and wrong channel pass through untouched.
        assert!(!waiters.deliver("mallory", Some("ops"), "hi"));
        assert!(!waiters.deliver("dave", Some("random"), "hi"));
        assert!(waiters.deliver("dave", Some("ops"), "hi"));
        assert!(matches!(
            wait.await.unwrap().unwrap(),
            ReplyOutcome::Matched(_)
        ));
    }

    #[tokio::test]
    async fn bad_pattern_is_an_error_not_a_wait() {
        let waiters = ReplyWaiters::new();
        assert!(
            waiters
                .wait_for_reply("eve", None, r"(unclosed", Duration::from_millis(10))
                .await
                .is_err()
        );
    }
}

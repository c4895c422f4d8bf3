//! # Trial Quotas
//!
//! Per-client allowances for the trial chat and trial call. Clients are
//! identified by an opaque id the browser keeps; nothing here is tied to an
//! account.
//!
//! ## Rules:
//! - **Chat**: every message counts; the message that reaches the limit is refused
//! - **Call**: a fixed number of call windows of fixed length. Starting inside
//!   an open window resumes it instead of consuming another one.

use crate::config::TrialConfig;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatQuota {
    Allowed { remaining: u32 },
    Exhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CallStatus {
    /// Seconds left in the current (or next) call window
    pub remaining: u64,
    pub sessions_left: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStart {
    /// A new window was opened
    Started(CallStatus),
    /// An open window was resumed
    Resumed(CallStatus),
    /// No windows left
    Denied,
}

#[derive(Debug, Default)]
struct ClientUsage {
    chat_messages: u32,
    calls_used: u32,
    call_started_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub struct TrialLedger {
    limits: TrialConfig,
    clients: Mutex<HashMap<String, ClientUsage>>,
}

impl TrialLedger {
    pub fn new(limits: TrialConfig) -> Self {
        Self {
            limits,
            clients: Mutex::new(HashMap::new()),
        }
    }

    pub fn record_chat_message(&self, client_id: &str) -> ChatQuota {
        let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
        let usage = clients.entry(client_id.to_string()).or_default();
        usage.chat_messages = usage.chat_messages.saturating_add(1);

        if usage.chat_messages >= self.limits.chat_message_limit {
            info!(client_id, messages = usage.chat_messages, "Trial chat limit reached");
            ChatQuota::Exhausted
        } else {
            ChatQuota::Allowed {
                remaining: self.limits.chat_message_limit - usage.chat_messages,
            }
        }
    }

    pub fn call_status(&self, client_id: &str) -> CallStatus {
        self.call_status_at(client_id, Utc::now())
    }

    pub fn call_status_at(&self, client_id: &str, now: DateTime<Utc>) -> CallStatus {
        let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
        // Reads never create entries; unknown clients have the full allowance.
        let Some(usage) = clients.get_mut(client_id) else {
            return CallStatus {
                remaining: self.limits.call_limit_secs,
                sessions_left: self.limits.call_max_sessions,
            };
        };

        let remaining = match self.window_remaining(usage, now) {
            Some(0) => {
                debug!(client_id, "Trial call window expired");
                usage.call_started_at = None;
                0
            }
            Some(secs) => secs,
            None => self.limits.call_limit_secs,
        };

        CallStatus {
            remaining,
            sessions_left: self.sessions_left(usage),
        }
    }

    pub fn start_call(&self, client_id: &str) -> CallStart {
        self.start_call_at(client_id, Utc::now())
    }

    pub fn start_call_at(&self, client_id: &str, now: DateTime<Utc>) -> CallStart {
        let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
        let usage = clients.entry(client_id.to_string()).or_default();

        if let Some(remaining) = self.window_remaining(usage, now).filter(|secs| *secs > 0) {
            return CallStart::Resumed(CallStatus {
                remaining,
                sessions_left: self.sessions_left(usage),
            });
        }

        if self.sessions_left(usage) == 0 {
            info!(client_id, "Trial call refused, no sessions left");
            return CallStart::Denied;
        }

        usage.calls_used += 1;
        usage.call_started_at = Some(now);
        info!(client_id, calls_used = usage.calls_used, "Trial call window opened");

        CallStart::Started(CallStatus {
            remaining: self.limits.call_limit_secs,
            sessions_left: self.sessions_left(usage),
        })
    }

    fn sessions_left(&self, usage: &ClientUsage) -> u32 {
        self.limits.call_max_sessions.saturating_sub(usage.calls_used)
    }

    /// Seconds left in the open window, if one was started.
    fn window_remaining(&self, usage: &ClientUsage, now: DateTime<Utc>) -> Option<u64> {
        let started = usage.call_started_at?;
        let elapsed = (now - started).num_seconds().max(0) as u64;
        Some(self.limits.call_limit_secs.saturating_sub(elapsed))
    }
}

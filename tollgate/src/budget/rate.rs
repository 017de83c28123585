//! Fixed-window request and token rate enforcement.
//!
//! Counters are bucketed per (caller, model) into wall-clock windows.
//! Admission reserves the request's estimated tokens optimistically; after
//! the call completes, the reservation is corrected to actual usage so the
//! window tracks real consumption.

use crate::auth::principal::Principal;
use crate::config::RateLimitConfig;
use crate::errors::{Error, Result};
use dashmap::DashMap;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Default)]
struct Window {
    index: u64,
    requests: u32,
    tokens: u64,
}

#[derive(Debug)]
pub struct RateLimiter {
    windows: DashMap<(String, String), Window>,
    window_secs: u64,
    enabled: bool,
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            windows: DashMap::new(),
            window_secs: config.window.as_secs().max(1),
            enabled: config.enabled,
        }
    }

    /// Admit one request and reserve `estimated_tokens` against the caller's
    /// window. Rejections carry the seconds until the window rolls over.
    pub fn check_and_reserve(
        &self,
        principal: &Principal,
        model: &str,
        estimated_tokens: u64,
    ) -> Result<()> {
        self.check_at(principal, model, estimated_tokens, now_unix())
    }

    fn check_at(
        &self,
        principal: &Principal,
        model: &str,
        estimated_tokens: u64,
        now: u64,
    ) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let limits = principal.rate_limits;
        if limits.rpm.is_none() && limits.tpm.is_none() {
            return Ok(());
        }

        let index = now / self.window_secs;
        let retry_after_secs = (index + 1) * self.window_secs - now;
        let key = (principal.rate_key().to_string(), model.to_string());

        let mut window = self.windows.entry(key).or_default();
        if window.index != index {
            *window = Window {
                index,
                requests: 0,
                tokens: 0,
            };
        }

        if let Some(rpm) = limits.rpm {
            if window.requests >= rpm {
                return Err(Error::RateLimited {
                    scope: format!("requests for model {model}"),
                    retry_after_secs,
                });
            }
        }
        if let Some(tpm) = limits.tpm {
            if window.tokens.saturating_add(estimated_tokens) > tpm {
                return Err(Error::RateLimited {
                    scope: format!("tokens for model {model}"),
                    retry_after_secs,
                });
            }
        }

        window.requests += 1;
        window.tokens += estimated_tokens;
        Ok(())
    }

    /// Replace the optimistic reservation with actual usage once the call
    /// finishes. No-op if the window has already rolled over.
    pub fn record_usage(
        &self,
        principal: &Principal,
        model: &str,
        estimated_tokens: u64,
        actual_tokens: u64,
    ) {
        self.record_usage_at(principal, model, estimated_tokens, actual_tokens, now_unix());
    }

    fn record_usage_at(
        &self,
        principal: &Principal,
        model: &str,
        estimated_tokens: u64,
        actual_tokens: u64,
        now: u64,
    ) {
        if !self.enabled {
            return;
        }
        let index = now / self.window_secs;
        let key = (principal.rate_key().to_string(), model.to_string());
        if let Some(mut window) = self.windows.get_mut(&key) {
            if window.index == index {
                window.tokens = window
                    .tokens
                    .saturating_sub(estimated_tokens)
                    .saturating_add(actual_tokens);
            }
        }
    }
}

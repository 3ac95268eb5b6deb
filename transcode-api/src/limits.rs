use std::num::NonZeroU32;
use std::time::Duration;

use governor::clock::{Clock, DefaultClock};
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter};

/// Endpoint classes with independent refill rates. Submission variants each
/// get their own bucket; reads share the query bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointClass {
    Convert,
    Analyze,
    Stream,
    Query,
}

impl EndpointClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointClass::Convert => "convert",
            EndpointClass::Analyze => "analyze",
            EndpointClass::Stream => "stream",
            EndpointClass::Query => "query",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RateSettings {
    pub convert_per_minute: u32,
    pub analyze_per_minute: u32,
    pub stream_per_minute: u32,
    pub query_per_minute: u32,
}

impl Default for RateSettings {
    fn default() -> Self {
        Self {
            convert_per_minute: 60,
            analyze_per_minute: 120,
            stream_per_minute: 30,
            query_per_minute: 300,
        }
    }
}

type KeyedLimiter = RateLimiter<String, DefaultKeyedStateStore<String>, DefaultClock>;

/// Pre-admission request-rate gate: a keyed token bucket per
/// (key id, endpoint class). The in-flight concurrency quota is enforced
/// separately, transactionally, at admission.
pub struct RateGate {
    convert: KeyedLimiter,
    analyze: KeyedLimiter,
    stream: KeyedLimiter,
    query: KeyedLimiter,
    clock: DefaultClock,
}

fn per_minute(rate: u32) -> Quota {
    Quota::per_minute(NonZeroU32::new(rate.max(1)).expect("rate is non-zero"))
}

impl RateGate {
    pub fn new(settings: RateSettings) -> Self {
        Self {
            convert: RateLimiter::keyed(per_minute(settings.convert_per_minute)),
            analyze: RateLimiter::keyed(per_minute(settings.analyze_per_minute)),
            stream: RateLimiter::keyed(per_minute(settings.stream_per_minute)),
            query: RateLimiter::keyed(per_minute(settings.query_per_minute)),
            clock: DefaultClock::default(),
        }
    }

    /// Ok, or the duration the caller should wait (surfaced as Retry-After).
    pub fn check(&self, class: EndpointClass, key_id: &str) -> Result<(), Duration> {
        let limiter = match class {
            EndpointClass::Convert => &self.convert,
            EndpointClass::Analyze => &self.analyze,
            EndpointClass::Stream => &self.stream,
            EndpointClass::Query => &self.query,
        };

        match limiter.check_key(&key_id.to_owned()) {
            Ok(()) => Ok(()),
            Err(not_until) => {
                metrics::counter!("rate_limited_total", "class" => class.as_str()).increment(1);
                Err(not_until.wait_time_from(self.clock.now()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tight_gate() -> RateGate {
        RateGate::new(RateSettings {
            convert_per_minute: 2,
            analyze_per_minute: 2,
            stream_per_minute: 2,
            query_per_minute: 2,
        })
    }

    #[test]
    fn allows_within_budget_then_rejects() {
        let gate = tight_gate();
        assert!(gate.check(EndpointClass::Convert, "key-1").is_ok());
        assert!(gate.check(EndpointClass::Convert, "key-1").is_ok());

        let wait = gate.check(EndpointClass::Convert, "key-1").unwrap_err();
        assert!(wait > Duration::ZERO);
    }

    #[test]
    fn keys_are_isolated() {
        let gate = tight_gate();
        assert!(gate.check(EndpointClass::Convert, "key-1").is_ok());
        assert!(gate.check(EndpointClass::Convert, "key-1").is_ok());
        assert!(gate.check(EndpointClass::Convert, "key-1").is_err());

        // A different key still has a full bucket.
        assert!(gate.check(EndpointClass::Convert, "key-2").is_ok());
    }

    #[test]
    fn classes_are_isolated() {
        let gate = tight_gate();
        assert!(gate.check(EndpointClass::Convert, "key-1").is_ok());
        assert!(gate.check(EndpointClass::Convert, "key-1").is_ok());
        assert!(gate.check(EndpointClass::Convert, "key-1").is_err());

        assert!(gate.check(EndpointClass::Query, "key-1").is_ok());
    }
}

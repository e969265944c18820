//! Admission control: keyed window counters, named policies and the gates
//! that apply them to requests.

mod clock;
mod counter;
mod gate;
mod policy;
mod registry;

pub use clock::{Clock, MockClock, SystemClock};
pub use counter::{CounterEntry, CounterStore, StoreStats};
pub use gate::{rate_limit, Admission, CompensationGuard, RequestGate};
pub use policy::{
    Compensation, Decision, ExceededHook, KeyStrategy, LimiterPolicy, Outcome, PolicyName,
    RateLimitInfo, SkipRule, HEADER_LIMIT, HEADER_REMAINING, HEADER_RESET, HEADER_USED,
};
pub use registry::{LimiterRegistry, PolicyStats};

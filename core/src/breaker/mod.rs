// Circuit breaker state machine, cache and persistence

pub mod cache;
pub mod registry;
pub mod sqlite;
pub mod state;
pub mod store;

pub use cache::{DisabledCache, StateCache, TtlStateCache};
pub use registry::{BreakerFilter, BreakerRegistry, BreakerStats, BreakerStatus, TestAction};
pub use sqlite::SqliteBreakerStore;
pub use state::{BreakerKey, CircuitBreaker, CircuitState, Transition};
pub use store::{BreakerStore, MemoryBreakerStore};

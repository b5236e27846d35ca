pub mod completer;
pub mod lease;
pub mod orchestrator;
pub mod poller;
pub mod router;
pub mod state;
pub mod task;
pub mod topics;

pub use completer::{Completion, TaskCompleter};
pub use lease::{LeaseKeeper, LeaseLost};
pub use orchestrator::{Orchestrator, OrchestratorReport};
pub use poller::{PollerState, TaskPoller};
pub use router::{RoutingError, TaskRouter};
pub use state::{Observation, OrchestratorState, TerminationPolicy, next_state};
pub use task::{RoutingMeta, RoutingTarget, Task};
pub use topics::TopicSet;

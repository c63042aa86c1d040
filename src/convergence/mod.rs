mod poller;

pub use poller::{ConvergenceError, ConvergencePoller, PollConfig};

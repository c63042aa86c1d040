//! Scenario catalogue and the runner that drives client/server pairs
//! through it.

mod catalogue;
mod command_template;
mod mutation;
mod port_allocator;
mod runner;
#[allow(clippy::module_inception)]
mod scenario;

pub use catalogue::{CatalogueError, ScenarioCatalogue};
pub use command_template::CommandTemplate;
pub use mutation::{Mutation, MutationError, Operation, Side, TreeRoots};
pub use port_allocator::PortAllocator;
pub use runner::{RunnerConfig, ScenarioOutcome, ScenarioRunner};
pub use scenario::{Scenario, Stage};

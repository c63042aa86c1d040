use derive_more::Display;

use crate::scenario::Mutation;

/// Where a scenario currently is, used to label failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Stage {
    #[display("setup")]
    Setup,
    #[display("initial sync")]
    InitialSync,
    #[display("round {_0}")]
    Round(usize),
}

/// One test case: mutations applied before the processes start, then rounds
/// of mutations each followed by a convergence check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scenario {
    pub name: String,
    pub initial: Vec<Mutation>,
    pub rounds: Vec<Vec<Mutation>>,
}

impl Scenario {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            initial: Vec::new(),
            rounds: Vec::new(),
        }
    }

    #[cfg(test)]
    pub fn with_initial(mut self, mutations: Vec<Mutation>) -> Self {
        self.initial = mutations;
        self
    }

    #[cfg(test)]
    pub fn with_round(mut self, mutations: Vec<Mutation>) -> Self {
        self.rounds.push(mutations);
        self
    }

    pub fn mutation_count(&self) -> usize {
        self.initial.len() + self.rounds.iter().map(Vec::len).sum::<usize>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scenario::Operation;

    #[test]
    fn stage_labels() {
        assert_eq!(Stage::InitialSync.to_string(), "initial sync");
        assert_eq!(Stage::Round(2).to_string(), "round 2");
    }

    #[test]
    fn builder_counts_all_mutations() {
        let scenario = Scenario::new("add_and_remove_empty_dir")
            .with_initial(vec![Mutation::on_client(Operation::Wipe)])
            .with_round(vec![Mutation::on_client(Operation::Mkdir {
                path: "newemptydir".to_string(),
            })])
            .with_round(vec![Mutation::on_client(Operation::Rmdir {
                path: "newemptydir".to_string(),
            })]);

        assert_eq!(scenario.rounds.len(), 2);
        assert_eq!(scenario.mutation_count(), 3);
    }
}

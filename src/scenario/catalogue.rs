use std::{
    borrow::Cow,
    path::{Component, Path},
    time::Duration,
};

use compio::fs;
use hashlink::LinkedHashMap;
use saphyr::{LoadableYamlNode, Scalar, Yaml};
use snafu::prelude::*;
use tracing::{debug, warn};

use crate::{
    ext::BestEffortPathExt,
    scenario::{Mutation, Operation, Scenario, Side, mutation::MAX_PAYLOAD_LEN},
};

const BUILTIN_CATALOGUE: &str = include_str!("builtin_scenarios.yaml");

/// Upper bound for `repeat`, so a typo cannot expand into millions of
/// mutations.
const MAX_REPEAT: u64 = 100_000;

/// Ordered collection of scenarios, read from YAML.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScenarioCatalogue {
    scenarios: Vec<Scenario>,
}

impl ScenarioCatalogue {
    /// Reads `path` when given, otherwise falls back to the built-in cases.
    pub async fn load(path: Option<&Path>) -> Result<Self, CatalogueError> {
        match path {
            Some(path) => Self::from_path(path).await,
            None => Self::builtin(),
        }
    }

    pub fn builtin() -> Result<Self, CatalogueError> {
        BUILTIN_CATALOGUE.try_into()
    }

    pub async fn from_path(path: &Path) -> Result<Self, CatalogueError> {
        debug!("Reading scenario catalogue {}", path.best_effort_path_display());
        let bytes = fs::read(path).await.context(ReadSnafu {
            file_path: path.best_effort_path_display(),
        })?;
        let contents = String::from_utf8(bytes).context(EncodingSnafu {
            file_path: path.best_effort_path_display(),
        })?;
        contents.as_str().try_into()
    }

    #[cfg(test)]
    pub fn scenarios(&self) -> &[Scenario] {
        &self.scenarios
    }

    /// Scenarios whose name contains `filter`, in catalogue order.
    pub fn select(&self, filter: Option<&str>) -> Vec<&Scenario> {
        self.scenarios
            .iter()
            .filter(|scenario| filter.is_none_or(|filter| scenario.name.contains(filter)))
            .collect()
    }

    fn parse_scenario(
        name: &str,
        data: &LinkedHashMap<Yaml, Yaml>,
    ) -> Result<Scenario, CatalogueError> {
        let mut scenario = Scenario::new(name);

        for (key, value) in data {
            match key.as_str() {
                Some("initial") => {
                    scenario.initial = Self::parse_mutations(name, "initial", value)?;
                }
                Some("rounds") => {
                    let rounds = value.as_sequence().context(InvalidFieldSnafu {
                        scenario: name,
                        field: "rounds",
                        expected: "a list of rounds",
                    })?;
                    for round in rounds {
                        let mutations = Self::parse_mutations(name, "rounds", round)?;
                        scenario.rounds.push(mutations);
                    }
                }
                other => warn!("Ignoring unknown key {:?} in scenario '{}'", other, name),
            }
        }

        Ok(scenario)
    }

    fn parse_mutations(
        scenario: &str,
        field: &'static str,
        value: &Yaml,
    ) -> Result<Vec<Mutation>, CatalogueError> {
        if is_null(value) {
            return Ok(Vec::new());
        }
        let items = value.as_sequence().context(InvalidFieldSnafu {
            scenario,
            field,
            expected: "a list of mutations",
        })?;

        let mut mutations = Vec::new();
        for item in items {
            mutations.extend(Self::parse_mutation(scenario, item)?);
        }
        Ok(mutations)
    }

    /// Parses one list item, expanding `repeat` into several mutations.
    fn parse_mutation(scenario: &str, item: &Yaml) -> Result<Vec<Mutation>, CatalogueError> {
        let data = item.as_mapping().context(InvalidFieldSnafu {
            scenario,
            field: "mutation",
            expected: "a map with one operation",
        })?;

        let mut side = Side::default();
        let mut repeat = None;
        let mut operation = None;

        for (key, value) in data {
            match key.as_str() {
                Some("side") => side = Self::parse_side(scenario, value)?,
                Some("repeat") => {
                    let count = integer(value).context(InvalidFieldSnafu {
                        scenario,
                        field: "repeat",
                        expected: "a non-negative integer",
                    })?;
                    ensure!(
                        count <= MAX_REPEAT,
                        RepeatTooLargeSnafu {
                            scenario,
                            count,
                            limit: MAX_REPEAT
                        }
                    );
                    repeat = Some(count);
                }
                Some(name) => {
                    ensure!(
                        operation.is_none(),
                        MultipleOperationsSnafu { scenario }
                    );
                    operation = Some(Self::parse_operation(scenario, name, value)?);
                }
                None => {
                    return InvalidFieldSnafu {
                        scenario,
                        field: "mutation",
                        expected: "string keys",
                    }
                    .fail();
                }
            }
        }

        let operation = operation.context(MissingOperationSnafu { scenario })?;
        ensure!(
            operation
                .payload_len()
                .is_some_and(|len| len <= MAX_PAYLOAD_LEN),
            PayloadTooLargeSnafu {
                scenario,
                limit: MAX_PAYLOAD_LEN
            }
        );
        Ok(match repeat {
            None => vec![Mutation::new(side, operation)],
            Some(count) => (0..count as usize)
                .map(|index| Mutation::new(side, operation.with_index(index)))
                .collect(),
        })
    }

    fn parse_side(scenario: &str, value: &Yaml) -> Result<Side, CatalogueError> {
        match value.as_str() {
            Some("client") => Ok(Side::Client),
            Some("server") => Ok(Side::Server),
            _ => InvalidFieldSnafu {
                scenario,
                field: "side",
                expected: "'client' or 'server'",
            }
            .fail(),
        }
    }

    fn parse_operation(
        scenario: &str,
        name: &str,
        value: &Yaml,
    ) -> Result<Operation, CatalogueError> {
        let operation = match name {
            "write" => {
                let args = arguments(scenario, name, value)?;
                Operation::Write {
                    path: required_path(scenario, name, args, "path")?,
                    content: optional_text(scenario, args, "content")?,
                    fill: optional_text(scenario, args, "fill")?,
                    fill_len: match field(args, "fill_len") {
                        Some(value) => integer(value).context(InvalidFieldSnafu {
                            scenario,
                            field: "fill_len",
                            expected: "a non-negative integer",
                        })? as usize,
                        None => 0,
                    },
                }
            }
            "remove" => Operation::Remove {
                path: path_value(scenario, name, value)?,
            },
            "mkdir" => Operation::Mkdir {
                path: path_value(scenario, name, value)?,
            },
            "rmdir" => Operation::Rmdir {
                path: path_value(scenario, name, value)?,
            },
            "rename" => {
                let args = arguments(scenario, name, value)?;
                Operation::Rename {
                    from: required_path(scenario, name, args, "from")?,
                    to: required_path(scenario, name, args, "to")?,
                }
            }
            "wipe" => Operation::Wipe,
            "sleep" => Operation::Sleep {
                duration: Duration::from_millis(integer(value).context(InvalidFieldSnafu {
                    scenario,
                    field: "sleep",
                    expected: "milliseconds as an integer",
                })?),
            },
            _ => {
                return UnknownOperationSnafu {
                    scenario,
                    operation: name,
                }
                .fail();
            }
        };
        Ok(operation)
    }
}

impl TryFrom<&str> for ScenarioCatalogue {
    type Error = CatalogueError;

    fn try_from(contents: &str) -> Result<Self, Self::Error> {
        let documents = Yaml::load_from_str(contents).context(ParseSnafu)?;
        let document = documents.first().context(MalformedCatalogueSnafu)?;
        let top_level = document.as_mapping().context(TopLevelNotMapSnafu)?;

        let empty = LinkedHashMap::new();
        let scenarios = match field(top_level, "scenarios") {
            Some(value) if !is_null(value) => {
                value.as_mapping().context(ScenariosNotMapSnafu)?
            }
            _ => &empty,
        };

        let scenarios = scenarios
            .iter()
            .map(|(key, value)| {
                let name = scalar_text(key).context(InvalidScenarioNameSnafu)?;
                let data = value.as_mapping().context(InvalidFieldSnafu {
                    scenario: name.as_str(),
                    field: "scenario",
                    expected: "a map",
                })?;
                Self::parse_scenario(&name, data)
            })
            .collect::<Result<Vec<_>, _>>()?;

        debug!("Parsed {} scenario(s)", scenarios.len());
        Ok(ScenarioCatalogue { scenarios })
    }
}

fn field<'a, 'm>(data: &'m LinkedHashMap<Yaml<'a>, Yaml<'a>>, name: &'a str) -> Option<&'m Yaml<'a>> {
    data.get(&Yaml::Value(Scalar::String(Cow::Borrowed(name))))
}

fn arguments<'a, 'm>(
    scenario: &str,
    operation: &str,
    value: &'m Yaml<'a>,
) -> Result<&'m LinkedHashMap<Yaml<'a>, Yaml<'a>>, CatalogueError> {
    value.as_mapping().context(InvalidFieldSnafu {
        scenario,
        field: operation.to_string(),
        expected: "a map of arguments",
    })
}

fn is_null(value: &Yaml) -> bool {
    matches!(value, Yaml::Value(Scalar::Null))
}

fn scalar_text(value: &Yaml) -> Option<String> {
    match value {
        Yaml::Value(Scalar::String(text)) => Some(text.to_string()),
        Yaml::Value(Scalar::Integer(number)) => Some(number.to_string()),
        Yaml::Value(Scalar::Boolean(flag)) => Some(flag.to_string()),
        _ => None,
    }
}

fn integer(value: &Yaml) -> Option<u64> {
    match value {
        Yaml::Value(Scalar::Integer(number)) => u64::try_from(*number).ok(),
        _ => None,
    }
}

fn optional_text(
    scenario: &str,
    args: &LinkedHashMap<Yaml, Yaml>,
    name: &'static str,
) -> Result<String, CatalogueError> {
    match field(args, name) {
        None => Ok(String::new()),
        Some(value) if is_null(value) => Ok(String::new()),
        Some(value) => scalar_text(value).context(InvalidFieldSnafu {
            scenario,
            field: name,
            expected: "text",
        }),
    }
}

fn required_path(
    scenario: &str,
    operation: &str,
    args: &LinkedHashMap<Yaml, Yaml>,
    name: &'static str,
) -> Result<String, CatalogueError> {
    let value = field(args, name).context(MissingFieldSnafu {
        scenario,
        operation,
        field: name,
    })?;
    path_value(scenario, operation, value)
}

/// Paths must stay inside the side's root.
fn path_value(scenario: &str, operation: &str, value: &Yaml) -> Result<String, CatalogueError> {
    let path = scalar_text(value).context(InvalidFieldSnafu {
        scenario,
        field: operation.to_string(),
        expected: "a relative path",
    })?;
    let stays_inside = !path.is_empty()
        && Path::new(&path)
            .components()
            .all(|component| matches!(component, Component::Normal(_) | Component::CurDir));
    ensure!(stays_inside, InvalidPathSnafu { scenario, path });
    Ok(path)
}

#[derive(Debug, Snafu)]
pub enum CatalogueError {
    #[snafu(display("Failed to read the scenario catalogue: {}", file_path))]
    ReadError {
        file_path: String,
        source: std::io::Error,
    },
    #[snafu(display("Scenario catalogue {} is not valid UTF-8", file_path))]
    EncodingError {
        file_path: String,
        source: std::string::FromUtf8Error,
    },
    #[snafu(display("Failed to parse the scenario catalogue"))]
    ParseError { source: saphyr::ScanError },
    #[snafu(display("Improperly formatted scenario catalogue"))]
    MalformedCatalogue,
    #[snafu(display("Top level of the scenario catalogue should be a map"))]
    TopLevelNotMap,
    #[snafu(display("Scenarios section should be a map"))]
    ScenariosNotMap,
    #[snafu(display("Scenario names should be strings"))]
    InvalidScenarioName,
    #[snafu(display("Scenario '{}': '{}' should be {}", scenario, field, expected))]
    InvalidField {
        scenario: String,
        field: String,
        expected: &'static str,
    },
    #[snafu(display("Scenario '{}': unknown operation '{}'", scenario, operation))]
    UnknownOperation { scenario: String, operation: String },
    #[snafu(display("Scenario '{}': mutation without an operation", scenario))]
    MissingOperation { scenario: String },
    #[snafu(display("Scenario '{}': mutation with more than one operation", scenario))]
    MultipleOperations { scenario: String },
    #[snafu(display("Scenario '{}': '{}' requires '{}'", scenario, operation, field))]
    MissingField {
        scenario: String,
        operation: String,
        field: &'static str,
    },
    #[snafu(display("Scenario '{}': path '{}' escapes the tree root", scenario, path))]
    InvalidPath { scenario: String, path: String },
    #[snafu(display("Scenario '{}': repeat {} exceeds the limit of {}", scenario, count, limit))]
    RepeatTooLarge {
        scenario: String,
        count: u64,
        limit: u64,
    },
    #[snafu(display("Scenario '{}': write payload exceeds {} bytes", scenario, limit))]
    PayloadTooLarge { scenario: String, limit: usize },
}

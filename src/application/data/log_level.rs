use clap::ValueEnum;

/// Verbosity of the harness's own diagnostics. Output of the processes under
/// test is inherited and never filtered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Default)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    #[default]
    Warn,
    Error,
    Silent,
}

impl LogLevel {
    pub fn to_tracing_level(self) -> Option<tracing::Level> {
        match self {
            LogLevel::Trace => Some(tracing::Level::TRACE),
            LogLevel::Debug => Some(tracing::Level::DEBUG),
            LogLevel::Info => Some(tracing::Level::INFO),
            LogLevel::Warn => Some(tracing::Level::WARN),
            LogLevel::Error => Some(tracing::Level::ERROR),
            LogLevel::Silent => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(LogLevel::Trace, Some(tracing::Level::TRACE))]
    #[case(LogLevel::Warn, Some(tracing::Level::WARN))]
    #[case(LogLevel::Silent, None)]
    fn maps_to_tracing_levels(#[case] level: LogLevel, #[case] expected: Option<tracing::Level>) {
        assert_eq!(level.to_tracing_level(), expected);
    }

    #[test]
    fn parses_from_command_line_names() {
        assert_eq!(LogLevel::from_str("silent", true), Ok(LogLevel::Silent));
        assert!(LogLevel::from_str("verbose", true).is_err());
    }
}

use serde::Serialize;

/// Lifecycle of one encoder job
///
/// ```text
/// STARTING --launched--> RUNNING
///     |                     |
///     +------failed---------+--> ERROR
///     +------ended----------+--> ENDED
/// ```
/// ERROR and ENDED absorb every further transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EncoderState {
    Starting,
    Running,
    Error,
    Ended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobTransition {
    Launched,
    Failed,
    Ended,
}

impl EncoderState {
    /// Next state, or `None` when the transition is not allowed
    pub fn apply(self, transition: JobTransition) -> Option<EncoderState> {
        use EncoderState::*;
        match (self, transition) {
            (Starting, JobTransition::Launched) => Some(Running),
            (Starting | Running, JobTransition::Failed) => Some(Error),
            (Starting | Running, JobTransition::Ended) => Some(Ended),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let state = EncoderState::Starting;
        let state = state.apply(JobTransition::Launched).unwrap();
        assert_eq!(state, EncoderState::Running);
        assert_eq!(
            state.apply(JobTransition::Ended),
            Some(EncoderState::Ended)
        );
    }

    #[test]
    fn test_failure_before_launch() {
        assert_eq!(
            EncoderState::Starting.apply(JobTransition::Failed),
            Some(EncoderState::Error)
        );
    }

    #[test]
    fn test_terminal_states_absorb() {
        for terminal in [EncoderState::Error, EncoderState::Ended] {
            assert_eq!(terminal.apply(JobTransition::Launched), None);
            assert_eq!(terminal.apply(JobTransition::Failed), None);
            assert_eq!(terminal.apply(JobTransition::Ended), None);
        }
    }

    #[test]
    fn test_relaunch_is_rejected() {
        assert_eq!(EncoderState::Running.apply(JobTransition::Launched), None);
    }
}

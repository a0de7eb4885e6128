//! Status state machines for publications, send requests and worker messages.
//!
//! All three share one shape: a short forward-only chain of working states and
//! a set of terminal states. Any working state may jump straight to a terminal
//! one; nothing ever leaves a terminal state.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// Common behaviour of the pipeline status enums.
pub trait Status: Copy + Eq + fmt::Debug + Send + Sync + 'static {
    /// Every variant, in declaration order.
    const ALL: &'static [Self];

    /// Stable wire/storage name.
    fn as_str(self) -> &'static str;

    fn is_terminal(self) -> bool;

    /// Position in the working chain; only meaningful for non-terminal states.
    fn rank(self) -> u8;

    /// Whether `self -> next` is allowed.
    fn can_transition_to(self, next: Self) -> bool {
        if self.is_terminal() || self == next {
            return false;
        }
        next.is_terminal() || next.rank() > self.rank()
    }

    /// Apply a transition, failing if the state machine forbids it.
    fn transition(self, next: Self) -> DomainResult<Self> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(DomainError::illegal_transition(format!(
                "{} -> {}",
                self.as_str(),
                next.as_str()
            )))
        }
    }

    /// All states from which `next` may be entered.
    ///
    /// Storage backends use this to build conditional updates.
    fn predecessors(next: Self) -> Vec<Self> {
        Self::ALL
            .iter()
            .copied()
            .filter(|s| s.can_transition_to(next))
            .collect()
    }

    fn terminal_states() -> Vec<Self> {
        Self::ALL.iter().copied().filter(|s| s.is_terminal()).collect()
    }
}

macro_rules! status_enum {
    (
        $(#[$meta:meta])*
        $name:ident {
            $($variant:ident => $str:literal, rank = $rank:literal, terminal = $terminal:literal;)+
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant,)+
        }

        impl Status for $name {
            const ALL: &'static [Self] = &[$(Self::$variant,)+];

            fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $str,)+
                }
            }

            fn is_terminal(self) -> bool {
                match self {
                    $(Self::$variant => $terminal,)+
                }
            }

            fn rank(self) -> u8 {
                match self {
                    $(Self::$variant => $rank,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($str => Ok(Self::$variant),)+
                    other => Err(DomainError::validation(format!(
                        "unknown {} '{}'",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }
    };
}

status_enum! {
    /// Aggregate status of a publication.
    PublicationStatus {
        Pending => "pending", rank = 0, terminal = false;
        Scheduling => "scheduling", rank = 1, terminal = false;
        Scheduled => "scheduled", rank = 2, terminal = false;
        InProgress => "in_progress", rank = 3, terminal = false;
        Posted => "posted", rank = 4, terminal = true;
        Failed => "failed", rank = 4, terminal = true;
        Canceled => "canceled", rank = 4, terminal = true;
        Stale => "stale", rank = 4, terminal = true;
    }
}

status_enum! {
    /// Status of one per-destination send request.
    RequestStatus {
        Planned => "planned", rank = 0, terminal = false;
        InProgress => "in_progress", rank = 1, terminal = false;
        Sent => "sent", rank = 2, terminal = true;
        Failed => "failed", rank = 2, terminal = true;
        Cancelled => "cancelled", rank = 2, terminal = true;
        Stale => "stale", rank = 2, terminal = true;
    }
}

status_enum! {
    /// Status of a message inside a tenant's delivery queue.
    MessageStatus {
        Pending => "pending", rank = 0, terminal = false;
        InProgress => "in_progress", rank = 1, terminal = false;
        Sent => "sent", rank = 2, terminal = true;
        Failed => "failed", rank = 2, terminal = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn publication_happy_path_is_allowed() {
        let s = PublicationStatus::Pending
            .transition(PublicationStatus::Scheduling)
            .and_then(|s| s.transition(PublicationStatus::Scheduled))
            .and_then(|s| s.transition(PublicationStatus::InProgress))
            .and_then(|s| s.transition(PublicationStatus::Posted))
            .unwrap();
        assert_eq!(s, PublicationStatus::Posted);
    }

    #[test]
    fn working_states_never_move_backwards() {
        assert!(!PublicationStatus::Scheduled.can_transition_to(PublicationStatus::Pending));
        assert!(!RequestStatus::InProgress.can_transition_to(RequestStatus::Planned));
        assert!(!MessageStatus::InProgress.can_transition_to(MessageStatus::Pending));
    }

    #[test]
    fn terminal_states_are_sinks() {
        for from in PublicationStatus::terminal_states() {
            for to in PublicationStatus::ALL {
                assert!(!from.can_transition_to(*to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn predecessors_exclude_terminal_states() {
        let preds = RequestStatus::predecessors(RequestStatus::Stale);
        assert_eq!(preds, vec![RequestStatus::Planned, RequestStatus::InProgress]);
        assert!(PublicationStatus::predecessors(PublicationStatus::Scheduling)
            .contains(&PublicationStatus::Pending));
    }

    #[test]
    fn storage_names_round_trip() {
        for s in PublicationStatus::ALL {
            assert_eq!(s.as_str().parse::<PublicationStatus>().unwrap(), *s);
        }
        assert_eq!(
            serde_json::to_string(&RequestStatus::InProgress).unwrap(),
            "\"in_progress\""
        );
        assert!("posted".parse::<RequestStatus>().is_err());
    }

    fn check_monotonic<S: Status>(start: S, attempts: &[usize]) -> Result<(), TestCaseError> {
        let mut current = start;
        let mut terminal_seen: Option<S> = None;
        for idx in attempts {
            let next = S::ALL[idx % S::ALL.len()];
            if let Ok(applied) = current.transition(next) {
                current = applied;
            }
            if let Some(t) = terminal_seen {
                prop_assert_eq!(current, t);
            }
            if current.is_terminal() {
                terminal_seen = Some(current);
            }
        }
        Ok(())
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 512,
            ..ProptestConfig::default()
        })]

        /// Property: once a publication reaches a terminal status, no later
        /// transition attempt changes it.
        #[test]
        fn publication_status_is_monotonic(attempts in prop::collection::vec(0usize..64, 0..40)) {
            check_monotonic(PublicationStatus::Pending, &attempts)?;
        }

        #[test]
        fn request_status_is_monotonic(attempts in prop::collection::vec(0usize..64, 0..40)) {
            check_monotonic(RequestStatus::Planned, &attempts)?;
        }

        #[test]
        fn message_status_is_monotonic(attempts in prop::collection::vec(0usize..64, 0..40)) {
            check_monotonic(MessageStatus::Pending, &attempts)?;
        }

        /// Property: every successful transition strictly advances the rank.
        #[test]
        fn transitions_advance_rank(from in 0usize..8, to in 0usize..8) {
            let from = PublicationStatus::ALL[from];
            let to = PublicationStatus::ALL[to];
            if from.can_transition_to(to) {
                prop_assert!(to.rank() > from.rank());
            }
        }
    }
}

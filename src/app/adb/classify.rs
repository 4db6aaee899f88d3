#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorRule {
    pub pattern: &'static str,
    pub message: &'static str,
}

/// Known failure markers, checked in this order; the first pattern found wins.
///
/// Reordering changes which message a response with several markers produces.
pub const ERROR_TABLE: &[ErrorRule] = &[
    ErrorRule {
        pattern: "INSTALL_FAILED_ALREADY_EXISTS",
        message: "The app is already installed. Trying to update...",
    },
    ErrorRule {
        pattern: "INSTALL_FAILED_INSUFFICIENT_STORAGE",
        message: "Not enough free storage on the device.",
    },
    ErrorRule {
        pattern: "INSTALL_FAILED_UPDATE_INCOMPATIBLE",
        message: "A previous version signed with a different key is installed. Uninstall it manually.",
    },
    ErrorRule {
        pattern: "Permission denied",
        message: "Permission denied. Make sure USB debugging was approved on the device.",
    },
    ErrorRule {
        pattern: "device unauthorized",
        message: "The device is not authorized. Check the device screen and approve the connection.",
    },
    ErrorRule {
        pattern: "not found",
        message: "The device disconnected. Check the cable.",
    },
    ErrorRule {
        pattern: "there are already some accounts",
        message: "Active accounts were found on the device. They must be removed first.",
    },
    ErrorRule {
        pattern: "already a device owner",
        message: "A device owner is already set. The device must be factory reset.",
    },
    ErrorRule {
        pattern: "java.lang.IllegalStateException",
        message: "Critical error (IllegalStateException) while removing accounts. Make sure every account was removed from the device.",
    },
    ErrorRule {
        pattern: "Trying to set the device owner",
        message: "Setting the device owner failed. The device still has accounts on it.",
    },
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Known,
    Generic,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    Success(String),
    Failure {
        kind: FailureKind,
        message: String,
        pattern: Option<&'static str>,
    },
}

pub fn classify_response(raw: &str) -> CommandOutcome {
    classify_with_table(raw, ERROR_TABLE)
}

pub fn classify_with_table(raw: &str, table: &[ErrorRule]) -> CommandOutcome {
    if let Some(rule) = table.iter().find(|rule| raw.contains(rule.pattern)) {
        return CommandOutcome::Failure {
            kind: FailureKind::Known,
            message: format!("{} ({})", rule.message, rule.pattern),
            pattern: Some(rule.pattern),
        };
    }

    let lower = raw.to_lowercase();
    if lower.contains("failure") || lower.contains("error") {
        return CommandOutcome::Failure {
            kind: FailureKind::Generic,
            message: format!("operation failed: {raw}"),
            pattern: None,
        };
    }

    CommandOutcome::Success(raw.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn known_pattern(outcome: &CommandOutcome) -> Option<&'static str> {
        match outcome {
            CommandOutcome::Failure {
                kind: FailureKind::Known,
                pattern,
                ..
            } => *pattern,
            _ => None,
        }
    }

    #[test]
    fn table_order_is_fixed() {
        let patterns: Vec<&str> = ERROR_TABLE.iter().map(|rule| rule.pattern).collect();
        assert_eq!(
            patterns,
            vec![
                "INSTALL_FAILED_ALREADY_EXISTS",
                "INSTALL_FAILED_INSUFFICIENT_STORAGE",
                "INSTALL_FAILED_UPDATE_INCOMPATIBLE",
                "Permission denied",
                "device unauthorized",
                "not found",
                "there are already some accounts",
                "already a device owner",
                "java.lang.IllegalStateException",
                "Trying to set the device owner",
            ]
        );
    }

    #[test]
    fn every_pattern_matches_anywhere_in_the_text() {
        for rule in ERROR_TABLE {
            let raw = format!("prefix noise {} suffix noise", rule.pattern);
            let outcome = classify_response(&raw);
            assert_eq!(known_pattern(&outcome), Some(rule.pattern), "rule {}", rule.pattern);
            match outcome {
                CommandOutcome::Failure { message, .. } => {
                    assert_eq!(message, format!("{} ({})", rule.message, rule.pattern));
                }
                CommandOutcome::Success(_) => unreachable!(),
            }
        }
    }

    #[test]
    fn first_rule_in_table_order_wins() {
        // The device-owner message appears first in the text, but the accounts rule comes first in the table.
        let raw = "java.lang.IllegalStateException: Not allowed to set the device owner because \
                   there are already some accounts on the device";
        assert_eq!(
            known_pattern(&classify_response(raw)),
            Some("there are already some accounts")
        );

        let raw = "Error: Trying to set the device owner, but device owner is already set. already a device owner";
        assert_eq!(
            known_pattern(&classify_response(raw)),
            Some("already a device owner")
        );
    }

    #[test]
    fn known_patterns_are_case_sensitive() {
        let outcome = classify_response("permission DENIED somewhere");
        assert_eq!(known_pattern(&outcome), None);
        assert_eq!(
            outcome,
            CommandOutcome::Success("permission DENIED somewhere".to_string())
        );
    }

    #[test]
    fn generic_failure_is_case_insensitive() {
        let outcome = classify_response("Failure [INSTALL_FAILED_OLDER_SDK]");
        assert_eq!(
            outcome,
            CommandOutcome::Failure {
                kind: FailureKind::Generic,
                message: "operation failed: Failure [INSTALL_FAILED_OLDER_SDK]".to_string(),
                pattern: None,
            }
        );
        assert!(matches!(
            classify_response("Unexpected ERROR while starting"),
            CommandOutcome::Failure {
                kind: FailureKind::Generic,
                ..
            }
        ));
    }

    #[test]
    fn clean_output_is_success() {
        assert_eq!(
            classify_response("Success"),
            CommandOutcome::Success("Success".to_string())
        );
        assert_eq!(classify_response(""), CommandOutcome::Success(String::new()));
    }

    #[test]
    fn custom_tables_follow_their_own_order() {
        let table = [
            ErrorRule {
                pattern: "b",
                message: "second",
            },
            ErrorRule {
                pattern: "a",
                message: "first",
            },
        ];
        assert_eq!(known_pattern(&classify_with_table("a b", &table)), Some("b"));
    }
}

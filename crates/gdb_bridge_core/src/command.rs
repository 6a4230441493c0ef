use std::time::Duration;

/// Verbs that hand control to the debuggee. After one of these the debugger
/// may not print a prompt again until the program stops. Stepping counts:
/// stepping over a call or out of a frame can run indefinitely.
const BLOCKING_VERBS: &[&str] = &[
    "c", "continue", "fg", "r", "run", "start", "starti", "jump",
    "s", "step", "si", "stepi", "n", "next", "ni", "nexti",
    "fin", "finish", "u", "until", "advance",
];

const BLOCKING_PREFIXES: &[&str] = &["target remote", "target extended-remote"];

/// One line of debugger input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub text: String,
    pub may_block: bool,
    pub timeout_budget: Duration,
}

impl Command {
    pub fn new(text: impl Into<String>, timeout_budget: Duration) -> Self {
        let text = text.into().trim().to_string();
        let may_block = may_block(&text);
        Self {
            text,
            may_block,
            timeout_budget,
        }
    }
}

pub fn may_block(text: &str) -> bool {
    let normalized = text.split_whitespace().collect::<Vec<_>>().join(" ");
    let Some(verb) = normalized.split(' ').next() else {
        return false;
    };

    BLOCKING_VERBS.contains(&verb)
        || BLOCKING_PREFIXES
            .iter()
            .any(|prefix| normalized.starts_with(prefix))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_flow_verbs_may_block() {
        for text in ["c", "continue", "continue 3", "run", "r --flag", "start", "  fg  "] {
            assert!(may_block(text), "{text:?} should be classified as blocking");
        }
    }

    #[test]
    fn stepping_verbs_may_block() {
        for text in ["step", "s", "stepi", "next 2", "ni", "finish", "until 42", "u", "advance main"] {
            assert!(may_block(text), "{text:?} should be classified as blocking");
        }
    }

    #[test]
    fn remote_targets_may_block() {
        assert!(may_block("target remote localhost:1234"));
        assert!(may_block("target   remote :1234"));
        assert!(may_block("target extended-remote 10.0.0.2:2345"));
    }

    #[test]
    fn inspection_commands_do_not_block() {
        for text in ["info locals", "bt", "x/10x $sp", "print c", "cont_var", "stepping", "target exec a.out", ""] {
            assert!(!may_block(text), "{text:?} should not be classified as blocking");
        }
    }

    #[test]
    fn command_trims_text_and_derives_flag() {
        let command = Command::new("  continue \n", Duration::from_secs(5));
        assert_eq!(command.text, "continue");
        assert!(command.may_block);
        assert_eq!(command.timeout_budget, Duration::from_secs(5));
    }
}

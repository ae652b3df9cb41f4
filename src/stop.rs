//! Stop detection: reverse prompts and end-of-sequence.

use crate::backend::{Backend, Token};

/// How many recent tokens are rendered when searching for a reverse prompt.
pub const N_PREV: usize = 32;

/// Characters of slack allowed after a reverse prompt. Outside interactive
/// mode the prompt may be followed by a short tail that was emitted in the
/// same step.
pub fn antiprompt_padding(interactive: bool) -> usize {
    if interactive {
        0
    } else {
        2
    }
}

/// Render recent tokens to the text the reverse prompts are matched against.
pub fn render_recent<B: Backend + ?Sized>(backend: &B, tokens: &[Token]) -> String {
    tokens.iter().map(|&t| backend.token_to_text(t)).collect()
}

/// The first reverse prompt found at the tail of `last_output`.
///
/// The search starts `len(antiprompt) + padding` bytes before the end, so a
/// match must end at most `padding` bytes from the end of the text.
pub fn find_antiprompt<'a>(
    last_output: &str,
    antiprompts: &'a [String],
    interactive: bool,
) -> Option<&'a str> {
    let padding = antiprompt_padding(interactive);
    antiprompts
        .iter()
        .filter(|a| !a.is_empty())
        .find(|antiprompt| {
            let mut start = last_output
                .len()
                .saturating_sub(antiprompt.len() + padding);
            while !last_output.is_char_boundary(start) {
                start -= 1;
            }
            last_output[start..].contains(antiprompt.as_str())
        })
        .map(String::as_str)
}

/// Session mode relevant to stop handling.
#[derive(Debug, Clone, Copy, Default)]
pub struct StopMode {
    pub interactive: bool,
    pub instruct: bool,
    pub has_antiprompts: bool,
}

/// What the controller should do after a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StopDecision {
    pub end_of_sequence: bool,
    pub is_antiprompt: bool,
    /// Hand control back to the user.
    pub is_interacting: bool,
    /// Queue the first reverse prompt so the transcript shows whose turn it is.
    pub inject_antiprompt: bool,
    /// End the session.
    pub terminate: bool,
}

/// Combine the reverse-prompt and end-of-sequence checks.
pub fn decide(antiprompt_hit: bool, end_of_sequence: bool, mode: StopMode) -> StopDecision {
    let mut decision = StopDecision {
        end_of_sequence,
        is_antiprompt: antiprompt_hit,
        is_interacting: antiprompt_hit && mode.interactive,
        ..Default::default()
    };

    if end_of_sequence {
        if mode.interactive {
            if mode.has_antiprompts {
                decision.inject_antiprompt = true;
                decision.is_antiprompt = true;
            }
            decision.is_interacting = true;
        } else if mode.instruct {
            decision.is_interacting = true;
        } else {
            decision.terminate = true;
        }
    }

    decision
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::scripted::{text_tokens, ScriptedBackend};

    fn prompts(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn finds_antiprompt_at_the_tail() {
        let backend = ScriptedBackend::new(64);
        let text = render_recent(&backend, &text_tokens("...done.\nUser:"));
        assert_eq!(text, "...done.\nUser:");

        let ap = prompts(&["User:"]);
        assert_eq!(find_antiprompt(&text, &ap, true), Some("User:"));
        assert_eq!(find_antiprompt("User: said hi", &ap, true), None);
    }

    #[test]
    fn padding_allows_short_tail_outside_interactive_mode() {
        let ap = prompts(&["User:"]);
        assert_eq!(find_antiprompt("hello User: ", &ap, true), None);
        assert_eq!(find_antiprompt("hello User: ", &ap, false), Some("User:"));
        assert_eq!(find_antiprompt("hello User:   ", &ap, false), None);
    }

    #[test]
    fn first_matching_antiprompt_wins_and_multibyte_text_is_safe() {
        let ap = prompts(&["", "Bob:", "b:"]);
        assert_eq!(find_antiprompt("héllo Bob:", &ap, true), Some("Bob:"));
        assert_eq!(find_antiprompt("ééé", &prompts(&["é"]), false), Some("é"));
        assert_eq!(find_antiprompt("", &ap, false), None);
    }

    #[test]
    fn antiprompt_in_interactive_mode_returns_control() {
        let mode = StopMode {
            interactive: true,
            has_antiprompts: true,
            ..Default::default()
        };
        let d = decide(true, false, mode);
        assert!(d.is_antiprompt && d.is_interacting);
        assert!(!d.inject_antiprompt && !d.terminate);

        // Outside interactive mode the hit is only recorded.
        let d = decide(true, false, StopMode::default());
        assert!(d.is_antiprompt && !d.is_interacting);
    }

    #[test]
    fn end_of_sequence_by_mode() {
        let interactive = StopMode {
            interactive: true,
            has_antiprompts: true,
            ..Default::default()
        };
        let d = decide(false, true, interactive);
        assert!(d.inject_antiprompt && d.is_antiprompt && d.is_interacting);
        assert!(d.end_of_sequence && !d.terminate);

        let bare = StopMode {
            interactive: true,
            ..Default::default()
        };
        let d = decide(false, true, bare);
        assert!(d.is_interacting && !d.inject_antiprompt && !d.is_antiprompt);

        let instruct = StopMode {
            instruct: true,
            ..Default::default()
        };
        let d = decide(false, true, instruct);
        assert!(d.is_interacting && !d.inject_antiprompt);

        let d = decide(false, true, StopMode::default());
        assert!(d.terminate);
    }
}

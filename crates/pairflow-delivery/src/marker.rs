use serde::Serialize;

/// Where a delivery marker sits in a captured pane relative to the input line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkerPosition {
    /// Seen above the last prompt line: the agent received the message.
    Submitted,
    /// Seen only on or below the last prompt line: typed but not submitted.
    StuckInInput,
    NotFound,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MarkerLocation {
    pub in_output: bool,
    pub in_input: bool,
    pub prompt_line: Option<usize>,
}

impl MarkerLocation {
    pub fn position(&self) -> MarkerPosition {
        if self.in_output {
            MarkerPosition::Submitted
        } else if self.in_input {
            MarkerPosition::StuckInInput
        } else {
            MarkerPosition::NotFound
        }
    }
}

pub fn last_prompt_line(lines: &[&str], glyphs: &[String]) -> Option<usize> {
    lines.iter().rposition(|line| {
        let trimmed = line.trim_start();
        glyphs
            .iter()
            .any(|glyph| !glyph.is_empty() && trimmed.starts_with(glyph.as_str()))
    })
}

/// Splits the capture at the last prompt line. Without any prompt line the
/// whole capture counts as output.
pub fn locate_marker(capture: &str, needle: &str, glyphs: &[String]) -> MarkerLocation {
    let lines: Vec<&str> = capture.lines().collect();
    let prompt_line = last_prompt_line(&lines, glyphs);
    let boundary = prompt_line.unwrap_or(lines.len());

    let mut location = MarkerLocation {
        prompt_line,
        ..MarkerLocation::default()
    };
    if needle.is_empty() {
        return location;
    }
    for (idx, line) in lines.iter().enumerate() {
        if !line.contains(needle) {
            continue;
        }
        if idx < boundary {
            location.in_output = true;
        } else {
            location.in_input = true;
        }
    }
    location
}

pub fn classify_marker(capture: &str, marker: &str, glyphs: &[String]) -> MarkerPosition {
    locate_marker(capture, marker, glyphs).position()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn glyphs() -> Vec<String> {
        vec!["›".to_string(), "❯".to_string(), ">".to_string()]
    }

    #[test]
    fn marker_above_prompt_is_submitted() {
        let capture = "\
• [pairflow] r1 TASK orchestrator->implementer msg=msg_abc ref=t#msg_abc.
  Working...

› ";
        assert_eq!(
            classify_marker(capture, "msg_abc", &glyphs()),
            MarkerPosition::Submitted
        );
    }

    #[test]
    fn marker_only_in_input_is_stuck() {
        let capture = "\
previous output

› [pairflow] r1 TASK orchestrator->implementer msg=msg_abc ref=t#msg_abc.
";
        assert_eq!(
            classify_marker(capture, "msg_abc", &glyphs()),
            MarkerPosition::StuckInInput
        );
    }

    #[test]
    fn marker_in_both_regions_counts_as_submitted() {
        let capture = "\
> msg=msg_abc first copy
output
> msg=msg_abc second copy";
        let location = locate_marker(capture, "msg_abc", &glyphs());
        assert!(location.in_output);
        assert!(location.in_input);
        assert_eq!(location.prompt_line, Some(2));
        assert_eq!(location.position(), MarkerPosition::Submitted);
    }

    #[test]
    fn missing_marker_is_not_found() {
        assert_eq!(
            classify_marker("› \n", "msg_abc", &glyphs()),
            MarkerPosition::NotFound
        );
    }

    #[test]
    fn without_prompt_line_any_occurrence_is_submitted() {
        let capture = "plain shell output msg=msg_abc\nmore output";
        let location = locate_marker(capture, "msg_abc", &glyphs());
        assert_eq!(location.prompt_line, None);
        assert_eq!(location.position(), MarkerPosition::Submitted);
    }

    #[test]
    fn last_prompt_line_wins_and_tolerates_indentation() {
        let lines = ["› old", "output", "   ❯ current", ""];
        assert_eq!(last_prompt_line(&lines, &glyphs()), Some(2));
        assert_eq!(last_prompt_line(&lines, &["$".to_string()]), None);
    }

    #[test]
    fn custom_glyphs_change_the_boundary() {
        let capture = "msg_abc\n$ msg_abc";
        assert_eq!(
            classify_marker(capture, "msg_abc", &["$".to_string()]),
            MarkerPosition::Submitted
        );
        let capture = "output\n$ msg_abc";
        assert_eq!(
            classify_marker(capture, "msg_abc", &["$".to_string()]),
            MarkerPosition::StuckInInput
        );
    }
}

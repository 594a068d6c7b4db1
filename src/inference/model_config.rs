use serde::{Deserialize, Serialize};

/// Stop sequences that end a continuation. The template closes with `### Output:`,
/// so an answer followed by a new section or a repeated marker is cut there.
pub const DEFAULT_STOP_SEQUENCES: [&str; 2] = ["###", "Output"];

/// Decoding parameters of a single generation. Decoding is always greedy.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct GenerationConfig {
    pub max_new_tokens: usize,
    pub repeat_penalty: f32,
    pub repeat_context_size: usize,
    pub stop_sequences: Vec<String>,
}

impl Default for GenerationConfig {
    #[tracing::instrument(level = "trace", skip())]
    fn default() -> Self {
        Self {
            max_new_tokens: 30,
            repeat_penalty: 1.0,
            repeat_context_size: 64,
            stop_sequences: DEFAULT_STOP_SEQUENCES.map(String::from).to_vec(),
        }
    }
}

impl GenerationConfig {
    fn stops(&self) -> impl Iterator<Item = &str> {
        self.stop_sequences
            .iter()
            .map(String::as_str)
            .filter(|stop| !stop.is_empty())
    }

    /// Offset where the answer begins. Models often echo `### Output:` before
    /// answering, so leading stop sequences, whitespace, `#` and `:` are skipped.
    fn answer_start(&self, text: &str) -> usize {
        let mut rest = text;
        loop {
            let trimmed =
                rest.trim_start_matches(|c: char| c.is_whitespace() || c == ':' || c == '#');
            match self.stops().find_map(|stop| trimmed.strip_prefix(stop)) {
                Some(next) => rest = next,
                None => return text.len() - trimmed.len(),
            }
        }
    }

    /// Byte offset of the earliest stop sequence after the answer has started, if any.
    pub fn find_stop(&self, text: &str) -> Option<usize> {
        let start = self.answer_start(text);
        let answer = &text[start..];
        self.stops()
            .filter_map(|stop| answer.find(stop))
            .min()
            .map(|offset| start + offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn earliest_stop_sequence_wins() {
        let config = GenerationConfig::default();
        assert_eq!(config.find_stop("Abdominal pain\n\n### Output: x"), Some(16));
        assert_eq!(config.find_stop("Fever Output ### "), Some(6));
        assert_eq!(config.find_stop("Abdominal pain"), None);
    }

    #[test]
    fn echoed_marker_before_the_answer_is_not_a_stop() {
        let config = GenerationConfig::default();
        assert_eq!(config.find_stop("Output: Abdominal pain"), None);
        assert_eq!(config.find_stop("### Output:\n"), None);
        assert_eq!(config.find_stop("  ## Output ### "), None);
        assert_eq!(
            config.find_stop("### Output:\nAbdominal pain\n### Symptom"),
            Some(27)
        );
    }

    #[test]
    fn custom_stop_inside_the_answer_cuts_it() {
        let config = GenerationConfig {
            stop_sequences: vec!["\n".to_string()],
            ..GenerationConfig::default()
        };
        assert_eq!(config.find_stop("\nFever\nCough"), Some(6));
    }

    #[test]
    fn empty_stop_sequences_are_ignored() {
        let config = GenerationConfig {
            stop_sequences: vec![String::new()],
            ..GenerationConfig::default()
        };
        assert_eq!(config.find_stop("anything"), None);
    }
}

//! Turns a flat word stream into narration-sized paragraphs.
//!
//! Backends that only expose a raw text layer (fixed-page documents) hand us
//! words in reading order. The pipeline has three pure stages:
//! words → sentences → fixed-size paragraphs → short paragraphs merged into a
//! neighbour.

/// Default number of sentences grouped into one paragraph.
pub const DEFAULT_SENTENCES_PER_PARAGRAPH: usize = 8;
/// Paragraphs with fewer words than this get merged into a neighbour.
pub const DEFAULT_MIN_PARAGRAPH_LENGTH: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmenterOptions {
    pub sentences_per_paragraph: usize,
    pub min_paragraph_length: usize,
}

impl Default for SegmenterOptions {
    fn default() -> Self {
        Self {
            sentences_per_paragraph: DEFAULT_SENTENCES_PER_PARAGRAPH,
            min_paragraph_length: DEFAULT_MIN_PARAGRAPH_LENGTH,
        }
    }
}

/// Run the whole pipeline.
pub fn segment<S: AsRef<str>>(words: &[S], options: SegmenterOptions) -> Vec<String> {
    let sentences = words_to_sentences(words);
    let paragraphs = sentences_to_paragraphs(&sentences, options.sentences_per_paragraph);
    merge_short_paragraphs(paragraphs, options.min_paragraph_length)
}

/// A sentence starts at a capitalized word and ends at a word ending with a
/// period. Words outside of an open sentence are dropped, as is a trailing
/// sentence that never closes.
pub fn words_to_sentences<S: AsRef<str>>(words: &[S]) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut buffer: Vec<&str> = Vec::new();

    for word in words {
        let word = word.as_ref();
        if buffer.is_empty() && !starts_uppercase(word) {
            continue;
        }
        buffer.push(word);
        if word.ends_with('.') {
            sentences.push(buffer.join(" "));
            buffer.clear();
        }
    }

    sentences
}

/// Group sentences into chunks of `sentences_per_paragraph`; the last chunk
/// may be shorter.
pub fn sentences_to_paragraphs<S: AsRef<str>>(
    sentences: &[S],
    sentences_per_paragraph: usize,
) -> Vec<String> {
    sentences
        .chunks(sentences_per_paragraph.max(1))
        .map(|chunk| {
            chunk
                .iter()
                .map(|sentence| sentence.as_ref())
                .collect::<Vec<_>>()
                .join(" ")
        })
        .collect()
}

/// Single left-to-right pass: a paragraph shorter than `min_paragraph_length`
/// words is appended to the closest non-empty paragraph before it, or
/// prepended to the next one when it is first. Emptied slots are dropped at
/// the end. Merge targets are not re-checked.
pub fn merge_short_paragraphs(paragraphs: Vec<String>, min_paragraph_length: usize) -> Vec<String> {
    if paragraphs.is_empty() {
        return paragraphs;
    }

    let mut slots = paragraphs;
    for idx in 0..slots.len() {
        if slots[idx].is_empty() || word_count(&slots[idx]) >= min_paragraph_length {
            continue;
        }
        let previous = (0..idx).rev().find(|&prev| !slots[prev].is_empty());
        if let Some(prev) = previous {
            let short = std::mem::take(&mut slots[idx]);
            join_into(&mut slots[prev], &short, false);
        } else if idx + 1 < slots.len() {
            let short = std::mem::take(&mut slots[idx]);
            join_into(&mut slots[idx + 1], &short, true);
        }
    }

    slots.into_iter().filter(|p| !p.is_empty()).collect()
}

fn join_into(target: &mut String, text: &str, prepend: bool) {
    if target.is_empty() {
        target.push_str(text);
    } else if prepend {
        *target = format!("{text} {target}");
    } else {
        target.push(' ');
        target.push_str(text);
    }
}

fn starts_uppercase(word: &str) -> bool {
    word.chars().next().is_some_and(char::is_uppercase)
}

fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(text: &str) -> Vec<&str> {
        text.split_whitespace().collect()
    }

    #[test]
    fn sentences_start_at_capital_and_end_at_period() {
        let input = words("dangling words First one here. Second one. trailing Third never closes");
        let sentences = words_to_sentences(&input);
        assert_eq!(sentences, vec!["First one here.", "Second one."]);
    }

    #[test]
    fn lowercase_after_period_is_discarded_until_capital() {
        let input = words("Alpha. beta gamma. Delta.");
        assert_eq!(words_to_sentences(&input), vec!["Alpha.", "Delta."]);
    }

    #[test]
    fn empty_words_yield_nothing() {
        let input: Vec<&str> = Vec::new();
        assert!(words_to_sentences(&input).is_empty());
        assert!(segment(&input, SegmenterOptions::default()).is_empty());
    }

    #[test]
    fn paragraphs_chunk_sentences_with_short_tail() {
        let sentences = vec!["A.", "B.", "C.", "D.", "E."];
        let paragraphs = sentences_to_paragraphs(&sentences, 2);
        assert_eq!(paragraphs, vec!["A. B.", "C. D.", "E."]);
    }

    #[test]
    fn zero_chunk_size_is_treated_as_one() {
        let sentences = vec!["A.", "B."];
        assert_eq!(sentences_to_paragraphs(&sentences, 0), vec!["A.", "B."]);
    }

    #[test]
    fn merge_of_empty_input_is_empty() {
        for min in [0, 1, 50, usize::MAX] {
            assert!(merge_short_paragraphs(Vec::new(), min).is_empty());
        }
    }

    #[test]
    fn short_paragraph_merges_into_previous() {
        let paragraphs = vec![
            "one two three four".to_string(),
            "five".to_string(),
            "six seven eight nine".to_string(),
        ];
        let merged = merge_short_paragraphs(paragraphs, 3);
        assert_eq!(merged, vec!["one two three four five", "six seven eight nine"]);
    }

    #[test]
    fn short_first_paragraph_merges_into_next() {
        let paragraphs = vec!["tiny".to_string(), "a b c d".to_string()];
        let merged = merge_short_paragraphs(paragraphs, 3);
        assert_eq!(merged, vec!["tiny a b c d"]);
    }

    #[test]
    fn merge_is_single_pass() {
        // Nothing non-empty precedes the carried text, so it keeps rolling
        // forward and the last slot stays short.
        let paragraphs = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let merged = merge_short_paragraphs(paragraphs, 10);
        assert_eq!(merged, vec!["a b c"]);
    }

    #[test]
    fn lone_short_paragraph_is_kept() {
        let merged = merge_short_paragraphs(vec!["just this".to_string()], 50);
        assert_eq!(merged, vec!["just this"]);
    }

    #[test]
    fn segment_conserves_qualifying_words_in_order() {
        let input = words(
            "noise The quick fox ran. It jumped high. lost words Then it slept well. The end. tail",
        );
        let sentences = words_to_sentences(&input);
        let expected: Vec<String> = sentences
            .iter()
            .flat_map(|s| s.split_whitespace().map(str::to_string))
            .collect();

        for (per, min) in [(1, 0), (2, 3), (8, 50), (3, 100)] {
            let paragraphs = segment(
                &input,
                SegmenterOptions {
                    sentences_per_paragraph: per,
                    min_paragraph_length: min,
                },
            );
            let actual: Vec<String> = paragraphs
                .iter()
                .flat_map(|p| p.split_whitespace().map(str::to_string))
                .collect();
            assert_eq!(actual, expected, "per={per} min={min}");
        }
    }
}

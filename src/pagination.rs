//! Pagination utilities.
//!
//! We approximate how many characters fit on a page from the font size and
//! pack whole paragraphs into pages of that budget. Paragraphs are returned as
//! byte ranges into the source text so reflowable locators can point back at
//! them.

use std::ops::Range;

/// Minimum allowed font size (points).
pub const MIN_FONT_SIZE: u32 = 12;
/// Maximum allowed font size (points).
pub const MAX_FONT_SIZE: u32 = 36;
/// Bounds for the fixed-page line budget.
pub const MIN_LINES_PER_PAGE: usize = 5;
pub const MAX_LINES_PER_PAGE: usize = 2000;

/// Character budget of one page at the given font size.
pub fn chars_per_page(font_size: u32) -> usize {
    let normalized = font_size.clamp(MIN_FONT_SIZE, MAX_FONT_SIZE) as f32;

    // Roughly scale page size as font size changes.
    let chars_per_line = (80.0 * (16.0 / normalized)).round().clamp(30.0, 120.0) as usize;
    let lines_per_page = (28.0 * (16.0 / normalized)).round().clamp(10.0, 80.0) as usize;
    chars_per_line.saturating_mul(lines_per_page).max(1)
}

/// Group paragraph ranges into pages. A paragraph longer than a page still
/// gets a page of its own; paragraphs are never split.
pub fn paginate(text: &str, font_size: u32) -> Vec<Vec<Range<usize>>> {
    let budget = chars_per_page(font_size);
    let paragraphs = split_paragraphs(text);

    let mut pages = Vec::new();
    let mut current: Vec<Range<usize>> = Vec::new();
    let mut current_len = 0usize;

    for para in paragraphs {
        let separator_len = if current.is_empty() { 0 } else { 2 };
        let para_len = para.len();
        if !current.is_empty() && current_len + separator_len + para_len > budget {
            pages.push(std::mem::take(&mut current));
            current_len = 0;
        }
        current_len += if current.is_empty() { para_len } else { separator_len + para_len };
        current.push(para);
    }

    if !current.is_empty() {
        pages.push(current);
    }

    pages
}

/// Byte ranges of paragraphs separated by blank lines, trimmed of
/// surrounding whitespace.
pub fn split_paragraphs(text: &str) -> Vec<Range<usize>> {
    let mut paragraphs = Vec::new();
    let mut start: Option<usize> = None;
    let mut end = 0usize;
    let mut offset = 0usize;

    for line in text.split_inclusive('\n') {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            if let Some(s) = start.take() {
                paragraphs.push(s..end);
            }
        } else {
            let lead = line.len() - line.trim_start().len();
            if start.is_none() {
                start = Some(offset + lead);
            }
            end = offset + lead + trimmed.len();
        }
        offset += line.len();
    }

    if let Some(s) = start {
        paragraphs.push(s..end);
    }

    paragraphs
}

/// Split text into pages of `lines_per_page` non-empty lines.
pub fn paginate_lines(text: &str, lines_per_page: usize) -> Vec<String> {
    let per_page = lines_per_page.clamp(MIN_LINES_PER_PAGE, MAX_LINES_PER_PAGE);
    let lines: Vec<&str> = text
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.trim().is_empty())
        .collect();
    lines.chunks(per_page).map(|chunk| chunk.join("\n")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paragraphs_are_trimmed_ranges() {
        let text = "  First line\ncontinues.\n\n\nSecond.  \n";
        let ranges = split_paragraphs(text);
        assert_eq!(ranges.len(), 2);
        assert_eq!(&text[ranges[0].clone()], "First line\ncontinues.");
        assert_eq!(&text[ranges[1].clone()], "Second.");
    }

    #[test]
    fn pages_respect_budget_without_splitting_paragraphs() {
        let para = "word ".repeat(200);
        let text = [para.trim(), para.trim(), para.trim()].join("\n\n");
        let pages = paginate(&text, 36);
        assert!(pages.len() > 1);
        let total: usize = pages.iter().map(Vec::len).sum();
        assert_eq!(total, 3);
    }

    #[test]
    fn empty_text_has_no_pages() {
        assert!(paginate("", 16).is_empty());
        assert!(paginate_lines("\n\n", 10).is_empty());
    }

    #[test]
    fn line_pages_drop_blank_lines() {
        let text = (1..=12)
            .map(|n| format!("line {n}\n\n"))
            .collect::<String>();
        let pages = paginate_lines(&text, 5);
        assert_eq!(pages.len(), 3);
        assert_eq!(pages[2], "line 11\nline 12");
    }
}

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

pub const CHAPTER_DELIMITER: &str = "Chapter";

const CHAPTER_MARKER: &str = "paragraphs";
const PARAGRAPH_MARKER: &str = "paragraph";
const TITLE_SEPARATOR: &str = "): ";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParagraphSpec {
    pub title: String,
    pub target_words: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chapter {
    pub title: String,
    pub paragraphs: Vec<ParagraphSpec>,
}

impl Chapter {
    pub fn paragraph(&self, index: usize) -> Option<&ParagraphSpec> {
        self.paragraphs.get(index)
    }
}

/// Chapter/paragraph plan parsed from one structure reply.
///
/// The raw reply is kept next to the parsed chapters because it is replayed verbatim to the
/// backend when the base conversation is finalized.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Outline {
    raw_text: String,
    chapters: Vec<Chapter>,
}

impl Outline {
    pub fn from_text(raw_text: impl Into<String>) -> Self {
        let trimmed = raw_text.into().trim().to_string();
        let chapters = parse_outline(&trimmed);
        Self {
            raw_text: trimmed,
            chapters,
        }
    }

    pub fn from_chapters(chapters: Vec<Chapter>) -> Self {
        let mut outline = Self {
            raw_text: String::new(),
            chapters,
        };
        outline.raw_text = outline.to_string().trim_end().to_string();
        outline
    }

    pub fn raw_text(&self) -> &str {
        &self.raw_text
    }

    pub fn chapters(&self) -> &[Chapter] {
        &self.chapters
    }

    pub fn chapter(&self, index: usize) -> Option<&Chapter> {
        self.chapters.get(index)
    }

    pub fn len(&self) -> usize {
        self.chapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chapters.is_empty()
    }

    pub fn total_paragraphs(&self) -> usize {
        self.chapters.iter().map(|c| c.paragraphs.len()).sum()
    }

    pub fn paragraph_counts(&self) -> Vec<usize> {
        self.chapters.iter().map(|c| c.paragraphs.len()).collect()
    }

    pub fn target_words(&self) -> Vec<Vec<u32>> {
        self.chapters
            .iter()
            .map(|c| c.paragraphs.iter().map(|p| p.target_words).collect())
            .collect()
    }
}

impl fmt::Display for Outline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (chapter_index, chapter) in self.chapters.iter().enumerate() {
            writeln!(
                f,
                "{} {} ({} paragraphs): {}",
                CHAPTER_DELIMITER,
                chapter_index + 1,
                chapter.paragraphs.len(),
                chapter.title
            )?;
            for (paragraph_index, paragraph) in chapter.paragraphs.iter().enumerate() {
                writeln!(
                    f,
                    "\tParagraph {} ({} words): {}",
                    paragraph_index + 1,
                    paragraph.target_words,
                    paragraph.title
                )?;
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Token<'a> {
    Header(Option<&'a str>),
    Paragraph { title: &'a str, target_words: u32 },
    Text,
}

/// Parses a structure reply. Never fails: anything off-grammar is dropped, so an unusable
/// reply yields an empty list.
pub fn parse_outline(text: &str) -> Vec<Chapter> {
    let mut builder = OutlineBuilder::default();
    for token in tokenize(text) {
        builder.accept(token);
    }
    builder.finish()
}

fn tokenize(text: &str) -> Vec<Token<'_>> {
    let mut tokens = Vec::new();
    for segment in text.split(CHAPTER_DELIMITER) {
        if segment.is_empty() {
            continue;
        }

        let mut lines = segment.lines();
        let Some(header) = lines.next() else {
            continue;
        };

        // A segment without a line break cannot carry any paragraph.
        if !segment.contains('\n') {
            tokens.push(Token::Header(None));
            continue;
        }

        tokens.push(Token::Header(chapter_title(header)));
        for line in lines {
            tokens.push(match paragraph_spec(line) {
                Some((title, target_words)) => Token::Paragraph {
                    title,
                    target_words,
                },
                None => Token::Text,
            });
        }
    }
    tokens
}

fn chapter_title(line: &str) -> Option<&str> {
    if !line.to_lowercase().contains(CHAPTER_MARKER) {
        return None;
    }
    line.split_once(TITLE_SEPARATOR)
        .map(|(_, title)| title.trim())
}

fn paragraph_spec(line: &str) -> Option<(&str, u32)> {
    if !line.to_lowercase().contains(PARAGRAPH_MARKER) {
        return None;
    }

    let annotation = annotation_regex().captures(line)?.get(1)?.as_str();
    let mut parts = annotation.split_whitespace();
    let words = parts.next()?;
    parts.next()?;

    let target_words: u32 = words.parse().ok().filter(|w| *w > 0)?;
    let (_, title) = line.split_once(TITLE_SEPARATOR)?;
    Some((title.trim(), target_words))
}

#[derive(Default)]
struct OutlineBuilder {
    chapters: Vec<Chapter>,
    current: Option<Chapter>,
}

impl OutlineBuilder {
    fn accept(&mut self, token: Token<'_>) {
        match token {
            Token::Header(title) => {
                self.close_chapter();
                self.current = title.map(|title| Chapter {
                    title: title.to_string(),
                    paragraphs: Vec::new(),
                });
            }
            Token::Paragraph {
                title,
                target_words,
            } => {
                if let Some(chapter) = self.current.as_mut() {
                    chapter.paragraphs.push(ParagraphSpec {
                        title: title.to_string(),
                        target_words,
                    });
                }
            }
            Token::Text => {}
        }
    }

    fn close_chapter(&mut self) {
        if let Some(chapter) = self.current.take() {
            if !chapter.paragraphs.is_empty() {
                self.chapters.push(chapter);
            }
        }
    }

    fn finish(mut self) -> Vec<Chapter> {
        self.close_chapter();
        self.chapters
    }
}

fn annotation_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(r"\(([^)]*)").expect("invalid annotation regex"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_chapter_example() {
        let outline =
            Outline::from_text("Chapter 1 (1 paragraphs): Intro\n\tParagraph 1 (100 words): Hello\n");

        assert_eq!(outline.len(), 1);
        let chapter = outline.chapter(0).unwrap();
        assert_eq!(chapter.title, "Intro");
        assert_eq!(
            chapter.paragraphs,
            vec![ParagraphSpec {
                title: "Hello".into(),
                target_words: 100
            }]
        );
    }

    #[test]
    fn counts_match_annotations() {
        let text = "\
Structure of the book:
Chapter 1 (3 paragraphs): The Spark
\tParagraph 1 (120 words): Where it began
\tParagraph 2 (80 words): First attempts
\tParagraph 3 (200 words): A lucky break
Chapter 2 (2 paragraphs): Growth
\tParagraph 1 (150 words): Scaling up
\tParagraph 2 (90 words): Growing pains
";
        let outline = Outline::from_text(text);

        assert_eq!(outline.paragraph_counts(), vec![3, 2]);
        assert_eq!(outline.target_words(), vec![vec![120, 80, 200], vec![150, 90]]);
        assert_eq!(outline.total_paragraphs(), 5);
        assert_eq!(outline.chapter(1).unwrap().title, "Growth");
        assert_eq!(
            outline.chapter(0).unwrap().paragraph(2).unwrap().title,
            "A lucky break"
        );
    }

    #[test]
    fn empty_and_malformed_input_yield_nothing() {
        assert!(parse_outline("").is_empty());
        assert!(parse_outline("Chapter").is_empty());
        assert!(parse_outline("ChapterChapterChapter").is_empty());
        assert!(parse_outline("I'm sorry, I can't help with that.").is_empty());
        assert!(parse_outline("Chapter 1: no annotation\n\tParagraph 1: none\n").is_empty());
        assert!(parse_outline("Chapter 1 (2 paragraphs) missing separator\n\tParagraph 1 (10 words): x\n").is_empty());
        assert!(parse_outline("Chapter 1 (1 paragraphs): Title only").is_empty());
    }

    #[test]
    fn drops_paragraph_lines_that_do_not_match() {
        let text = "\
Chapter 1 (4 paragraphs): Mixed
\tParagraph 1 (100 words): Kept
\tParagraph 2 (words): Missing count
\tParagraph 3 (0 words): Zero budget
\tParagraph 4 (75): Single token
\tSome commentary that mentions nothing relevant
\tparagraph 5 (60 words): Lowercase marker
";
        let chapters = parse_outline(text);

        assert_eq!(chapters.len(), 1);
        let titles: Vec<_> = chapters[0].paragraphs.iter().map(|p| p.title.as_str()).collect();
        assert_eq!(titles, vec!["Kept", "Lowercase marker"]);
    }

    #[test]
    fn chapters_without_paragraphs_are_dropped() {
        let text = "\
Chapter 1 (2 paragraphs): Empty
\tnothing here
Chapter 2 (1 paragraphs): Full
\tParagraph 1 (50 words): Only one
";
        let chapters = parse_outline(text);
        assert_eq!(chapters.len(), 1);
        assert_eq!(chapters[0].title, "Full");
    }

    #[test]
    fn paragraphs_under_an_invalid_header_are_not_attached_elsewhere() {
        let text = "\
Chapter 1 (1 paragraphs): Good
\tParagraph 1 (50 words): Belongs to good
Chapter 2 has a broken header
\tParagraph 1 (50 words): Orphan
";
        let chapters = parse_outline(text);
        assert_eq!(chapters.len(), 1);
        assert_eq!(chapters[0].paragraphs.len(), 1);
        assert_eq!(chapters[0].paragraphs[0].title, "Belongs to good");
    }

    #[test]
    fn tolerates_carriage_returns_and_case() {
        let text = "Chapter 1 (1 PARAGRAPHS): Windows\r\n\tPARAGRAPH 1 (40 words): Line endings\r\n";
        let chapters = parse_outline(text);
        assert_eq!(chapters.len(), 1);
        assert_eq!(chapters[0].title, "Windows");
        assert_eq!(chapters[0].paragraphs[0].title, "Line endings");
    }

    #[test]
    fn title_keeps_text_after_first_separator() {
        let chapters =
            parse_outline("Chapter 1 (1 paragraphs): Part (a): more\n\tParagraph 1 (10 words): A (b): c\n");
        assert_eq!(chapters[0].title, "Part (a): more");
        assert_eq!(chapters[0].paragraphs[0].title, "A (b): c");
    }

    #[test]
    fn canonical_rendering_parses_back() {
        let outline = Outline::from_chapters(vec![
            Chapter {
                title: "One".into(),
                paragraphs: vec![
                    ParagraphSpec {
                        title: "Alpha".into(),
                        target_words: 30,
                    },
                    ParagraphSpec {
                        title: "Beta".into(),
                        target_words: 45,
                    },
                ],
            },
            Chapter {
                title: "Two".into(),
                paragraphs: vec![ParagraphSpec {
                    title: "Gamma".into(),
                    target_words: 60,
                }],
            },
        ]);

        assert!(outline
            .raw_text()
            .starts_with("Chapter 1 (2 paragraphs): One\n\tParagraph 1 (30 words): Alpha"));
        let reparsed = Outline::from_text(outline.raw_text());
        assert_eq!(reparsed.chapters(), outline.chapters());
    }
}

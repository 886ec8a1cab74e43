use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use rand::Rng;
use thiserror::Error;

use crate::book::GenerationState;

pub const UNTITLED_BOOK: &str = "Untitled Book";
pub const PARTIAL_NOTICE: &str =
    "> **Note:** Generation stopped early; the content below is partial.";

const FILE_NAME_ATTEMPTS: usize = 16;

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("content not generated yet")]
    ContentNotReady,
    #[error("failed to prepare output directory `{path}`: {source}")]
    CreateDir { path: PathBuf, source: io::Error },
    #[error("failed to write document `{path}`: {source}")]
    Write { path: PathBuf, source: io::Error },
    #[error("no free document name left in `{path}`")]
    NoFreeName { path: PathBuf },
}

/// Renders the state as markdown. Output is trimmed and ends with exactly one newline.
pub fn render(state: &GenerationState) -> Result<String, DocumentError> {
    let (Some(outline), Some(content)) = (state.outline(), state.content()) else {
        return Err(DocumentError::ContentNotReady);
    };

    let mut lines: Vec<String> = vec![format!("# {}", state.title().unwrap_or(UNTITLED_BOOK))];
    if state.is_partial() {
        lines.push(String::new());
        lines.push(PARTIAL_NOTICE.to_string());
    }

    for (chapter_index, (chapter, paragraphs)) in
        outline.chapters().iter().zip(content).enumerate()
    {
        lines.push(String::new());
        lines.push(format!("## Chapter {}: {}", chapter_index + 1, chapter.title));
        lines.push(String::new());
        for (spec, text) in chapter.paragraphs.iter().zip(paragraphs) {
            lines.push(format!("### {}", spec.title));
            lines.push(String::new());
            lines.push(text.clone());
            lines.push(String::new());
        }
    }

    let mut document = lines.join("\n").trim().to_string();
    document.push('\n');
    Ok(document)
}

pub fn document_file_name(number: u32, partial: bool) -> String {
    let suffix = if partial { "_partial" } else { "" };
    format!("book{number}{suffix}.md")
}

/// Writes the rendered document to a fresh `book<digits>[_partial].md` inside `dir`.
pub fn write_document(dir: &Path, state: &GenerationState) -> Result<PathBuf, DocumentError> {
    let rendered = render(state)?;
    fs::create_dir_all(dir).map_err(|source| DocumentError::CreateDir {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut rng = rand::thread_rng();
    for _ in 0..FILE_NAME_ATTEMPTS {
        let number: u32 = rng.gen_range(1_000_009..=9_999_999);
        let path = dir.join(document_file_name(number, state.is_partial()));
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => {
                fill_or_remove(&path, file, rendered.as_bytes())?;
                return Ok(path);
            }
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(source) => return Err(DocumentError::Write { path, source }),
        }
    }

    Err(DocumentError::NoFreeName {
        path: dir.to_path_buf(),
    })
}

/// A failed write removes the half-written file so it cannot pass for a finished book.
fn fill_or_remove(path: &Path, mut file: impl Write, bytes: &[u8]) -> Result<(), DocumentError> {
    match file.write_all(bytes).and_then(|()| file.flush()) {
        Ok(()) => Ok(()),
        Err(source) => {
            drop(file);
            let _ = fs::remove_file(path);
            Err(DocumentError::Write {
                path: path.to_path_buf(),
                source,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outline::Outline;
    use regex::Regex;
    use tempfile::tempdir;

    const OUTLINE: &str = "\
Chapter 1 (2 paragraphs): Origins
\tParagraph 1 (10 words): The seed
\tParagraph 2 (10 words): The sprout
Chapter 2 (1 paragraphs): Harvest
\tParagraph 1 (10 words): Reaping
";

    fn complete_state() -> GenerationState {
        GenerationState::from_parts(
            Some("Gardens".into()),
            Outline::from_text(OUTLINE),
            vec![
                vec!["It began small.".into(), "Then it grew.\n\n".into()],
                vec!["We gathered everything.".into()],
            ],
            false,
        )
    }

    #[test]
    fn renders_sections_in_outline_order() {
        let rendered = render(&complete_state()).unwrap();
        let expected = "\
# Gardens

## Chapter 1: Origins

### The seed

It began small.

### The sprout

Then it grew.



## Chapter 2: Harvest

### Reaping

We gathered everything.
";
        assert_eq!(rendered, expected);
        assert!(!rendered.contains(PARTIAL_NOTICE));
    }

    #[test]
    fn rendering_is_idempotent() {
        let state = complete_state();
        let first = render(&state).unwrap();
        let second = render(&state).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.matches("\n### ").count(), 3);
        assert!(first.ends_with("everything.\n"));
        assert!(!first.ends_with("\n\n"));
    }

    #[test]
    fn partial_state_gets_notice_under_title() {
        let state = GenerationState::from_parts(
            None,
            Outline::from_text(OUTLINE),
            vec![vec!["Only this.".into()]],
            true,
        );
        let rendered = render(&state).unwrap();
        assert!(rendered.starts_with(&format!("# {UNTITLED_BOOK}\n\n{PARTIAL_NOTICE}\n\n## Chapter 1")));
        assert!(!rendered.contains("Harvest"));
        assert!(!rendered.contains("The sprout"));
    }

    #[test]
    fn missing_content_is_an_error() {
        let err = render(&GenerationState::new()).unwrap_err();
        assert!(matches!(err, DocumentError::ContentNotReady));
    }

    #[test]
    fn writes_uniquely_named_files() {
        let dir = tempdir().unwrap();
        let complete = write_document(dir.path(), &complete_state()).unwrap();
        let again = write_document(dir.path(), &complete_state()).unwrap();
        assert_ne!(complete, again);

        let name = Regex::new(r"^book\d{7}\.md$").unwrap();
        let file_name = complete.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.is_match(&file_name), "{file_name}");
        assert_eq!(
            fs::read_to_string(&complete).unwrap(),
            render(&complete_state()).unwrap()
        );

        let partial_state = GenerationState::from_parts(
            Some("Gardens".into()),
            Outline::from_text(OUTLINE),
            vec![],
            true,
        );
        let partial = write_document(&dir.path().join("out"), &partial_state).unwrap();
        let partial_name = partial.file_name().unwrap().to_string_lossy().into_owned();
        assert!(Regex::new(r"^book\d{7}_partial\.md$").unwrap().is_match(&partial_name));
    }

    struct FullDisk;

    impl Write for FullDisk {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::Other, "no space left"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn failed_write_removes_the_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(document_file_name(1_234_567, false));
        fs::write(&path, "").unwrap();

        let err = fill_or_remove(&path, FullDisk, b"# Gardens\n").unwrap_err();
        assert!(matches!(err, DocumentError::Write { .. }));
        assert!(!path.exists());

        fill_or_remove(&path, fs::File::create(&path).unwrap(), b"# Gardens\n").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "# Gardens\n");
    }
}

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;

use crate::conversation::Conversation;

pub const DEFAULT_EXCHANGE_LOG: &str = "log.txt";

const RECORD_OPEN: &str = "===== exchange";
const RECORD_CLOSE: &str = "===== end exchange";
const BODY_INDENT: &str = "  ";

/// Append-only prompt/reply log. Records are tagged `<run>-<sequence>`; body lines are
/// indented so only frame lines start at column zero.
#[derive(Debug)]
pub struct ExchangeLog {
    path: PathBuf,
    run: String,
    sequence: AtomicU64,
}

impl ExchangeLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let run = format!("{:08x}", rand::thread_rng().gen::<u32>());
        Self {
            path: path.into(),
            run,
            sequence: AtomicU64::new(0),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn run_id(&self) -> &str {
        &self.run
    }

    pub fn append(&self, conversation: &Conversation, reply: &str) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let tag = format!("{}-{sequence}", self.run);
        let record = format_record(&tag, unix_seconds(), conversation, reply);

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(record.as_bytes())?;
        file.flush()
    }
}

fn format_record(tag: &str, timestamp: u64, conversation: &Conversation, reply: &str) -> String {
    let mut record = format!("{RECORD_OPEN} {tag} @ {timestamp} =====\n--- prompt ---\n");
    for message in conversation.iter() {
        let mut lines = message.content.lines();
        record.push_str(&format!("[{}] {}\n", message.role, lines.next().unwrap_or_default()));
        push_indented(&mut record, lines);
    }
    record.push_str("--- response ---\n");
    push_indented(&mut record, reply.lines());
    record.push_str(&format!("{RECORD_CLOSE} {tag} =====\n\n"));
    record
}

fn push_indented<'a>(record: &mut String, lines: impl Iterator<Item = &'a str>) {
    for line in lines {
        record.push_str(BODY_INDENT);
        record.push_str(line);
        record.push('\n');
    }
}

fn unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Number of complete records in an exchange log file's contents.
pub fn count_records(contents: &str) -> usize {
    contents
        .lines()
        .filter(|line| line.starts_with(RECORD_CLOSE))
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::Message;
    use tempfile::tempdir;

    #[test]
    fn appends_framed_records() {
        let dir = tempdir().unwrap();
        let log = ExchangeLog::new(dir.path().join("nested").join("log.txt"));
        let run = log.run_id().to_string();

        let conversation: Conversation =
            [Message::system("rules"), Message::user("!w 1 1")].into_iter().collect();
        log.append(&conversation, "first reply").unwrap();
        log.append(&conversation, "second reply\n").unwrap();

        let contents = fs::read_to_string(log.path()).unwrap();
        assert_eq!(count_records(&contents), 2);
        assert!(contents.starts_with(&format!("===== exchange {run}-1 @ ")));
        assert!(contents.contains(&format!(
            "[system] rules\n[user] !w 1 1\n--- response ---\n  first reply\n===== end exchange {run}-1 ====="
        )));
        assert!(contents.contains(&format!("  second reply\n===== end exchange {run}-2 =====")));
    }

    #[test]
    fn separate_runs_use_distinct_tags() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.txt");
        let conversation: Conversation = [Message::user("hi")].into_iter().collect();

        let first = ExchangeLog::new(&path);
        let second = ExchangeLog::new(&path);
        assert_ne!(first.run_id(), second.run_id());
        first.append(&conversation, "a").unwrap();
        second.append(&conversation, "b").unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(count_records(&contents), 2);
        assert!(contents.contains(&format!("{}-1 =====", first.run_id())));
        assert!(contents.contains(&format!("{}-1 =====", second.run_id())));
    }

    #[test]
    fn marker_lines_inside_text_do_not_close_a_record() {
        let dir = tempdir().unwrap();
        let log = ExchangeLog::new(dir.path().join("log.txt"));
        let conversation: Conversation = [Message::user("quote this\n===== end exchange 9 =====")]
            .into_iter()
            .collect();
        log.append(&conversation, "sure\n===== end exchange 9 =====\nmore")
            .unwrap();

        let contents = fs::read_to_string(log.path()).unwrap();
        assert_eq!(count_records(&contents), 1);
        assert!(contents.contains("[user] quote this\n  ===== end exchange 9 =====\n"));
        assert!(contents.contains("--- response ---\n  sure\n  ===== end exchange 9 =====\n  more\n"));
    }

    #[test]
    fn unterminated_tail_is_not_counted() {
        let contents = "===== exchange ab-1 @ 0 =====\n--- prompt ---\n--- response ---\n  ok\n===== end exchange ab-1 =====\n\n===== exchange ab-2 @ 0 =====\n--- prompt ---\n[user] cut";
        assert_eq!(count_records(contents), 1);
    }
}

//! Purpose: Render archive progress, per-item failures, and fatal errors as text lines.
//! Exports: `pack_event_line`, `unpack_event_line`, `finished_line`, `error_text`, and notice helpers.
//! Role: Keeps human-facing wording out of the archive engine; the CLI decides where lines go.
//! Invariants: Every run ends with exactly one `finished_line`.
//! Invariants: Rendering is pure; nothing here touches stdout or stderr.

use std::error::Error as StdError;

use crate::api::{Error, ErrorKind};
use crate::archive::{PackEvent, UnpackEvent};

pub const DEFAULT_PATTERN: &str = "*";

pub fn pack_event_line(event: &PackEvent<'_>) -> String {
    match event {
        PackEvent::Packing {
            index,
            total,
            path,
            key,
        } => format!(
            "{} of {total} - packing file: {} as {key}",
            index + 1,
            path.display()
        ),
        PackEvent::AlreadyExists { key, .. } => format!("{key}: already exists"),
        PackEvent::NotRegular { path } => format!("Not regular file: {}", path.display()),
        PackEvent::Stored { key, bytes } => format!("{key}: {bytes} bytes"),
        PackEvent::Failed { path, error } => {
            format!("***Failed to pack {}: {}", path.display(), one_line(error))
        }
    }
}

pub fn unpack_event_line(event: &UnpackEvent<'_>) -> String {
    match event {
        UnpackEvent::Extracting { key } => format!("Extracting file: {key}"),
    }
}

pub fn finished_line(processed: u64) -> String {
    format!("Finished. Processed {processed} items")
}

pub fn default_pattern_notice() -> String {
    format!("No pattern is given. Using {DEFAULT_PATTERN}. Use -p <glob_pattern> to override")
}

pub fn optimize_notice(expected_records: u64) -> String {
    format!("Opening database optimized for {expected_records} items")
}

pub fn error_message(err: &Error) -> String {
    if let Some(message) = err.message() {
        return message.to_string();
    }
    match err.kind() {
        ErrorKind::Internal => "internal error".to_string(),
        ErrorKind::Usage => "usage error".to_string(),
        ErrorKind::NotFound => "not found".to_string(),
        ErrorKind::Busy => "resource is busy".to_string(),
        ErrorKind::Permission => "permission denied".to_string(),
        ErrorKind::Corrupt => "corrupt data".to_string(),
        ErrorKind::Io => "i/o error".to_string(),
    }
}

pub fn error_causes(err: &Error) -> Vec<String> {
    let mut causes = Vec::new();
    let mut cur = err.source();
    while let Some(source) = cur {
        causes.push(source.to_string());
        cur = source.source();
    }
    causes
}

/// Multi-line form for fatal errors.
pub fn error_text(err: &Error) -> String {
    let mut lines = vec![format!("error: {}", error_message(err))];
    if let Some(hint) = err.hint() {
        lines.push(format!("hint: {hint}"));
    }
    if let Some(key) = err.key() {
        lines.push(format!("key: {key}"));
    }
    if let Some(path) = err.path() {
        lines.push(format!("path: {}", path.display()));
    }
    for cause in error_causes(err) {
        lines.push(format!("caused by: {cause}"));
    }
    lines.join("\n")
}

fn one_line(err: &Error) -> String {
    let mut text = error_message(err);
    if let Some(cause) = error_causes(err).into_iter().next() {
        text.push_str(": ");
        text.push_str(&cause);
    }
    text
}

#[cfg(test)]
mod tests {
    use super::{
        default_pattern_notice, error_text, finished_line, pack_event_line, unpack_event_line,
    };
    use crate::api::{Error, ErrorKind};
    use crate::archive::{PackEvent, UnpackEvent};
    use std::path::Path;

    #[test]
    fn pack_lines_match_cli_wording() {
        let path = Path::new("/data/a.txt");
        assert_eq!(
            pack_event_line(&PackEvent::Packing {
                index: 0,
                total: 2,
                path,
                key: "docs/a.txt",
            }),
            "1 of 2 - packing file: /data/a.txt as docs/a.txt"
        );
        assert_eq!(
            pack_event_line(&PackEvent::AlreadyExists {
                path,
                key: "docs/a.txt"
            }),
            "docs/a.txt: already exists"
        );
        assert_eq!(
            pack_event_line(&PackEvent::NotRegular {
                path: Path::new("sub")
            }),
            "Not regular file: sub"
        );
        assert_eq!(
            pack_event_line(&PackEvent::Stored {
                key: "a.txt",
                bytes: 12
            }),
            "a.txt: 12 bytes"
        );
    }

    #[test]
    fn failed_line_includes_cause() {
        let io = std::io::Error::from_raw_os_error(libc::ENOENT);
        let err = Error::io(io, "gone.txt").with_message("failed to stat file");
        let line = pack_event_line(&PackEvent::Failed {
            path: Path::new("gone.txt"),
            error: &err,
        });
        assert!(line.starts_with("***Failed to pack gone.txt: failed to stat file: "));
    }

    #[test]
    fn summary_and_notice_lines() {
        assert_eq!(finished_line(3), "Finished. Processed 3 items");
        assert_eq!(
            unpack_event_line(&UnpackEvent::Extracting { key: "docs/a.txt" }),
            "Extracting file: docs/a.txt"
        );
        assert!(default_pattern_notice().contains("Using *"));
    }

    #[test]
    fn error_text_lists_context() {
        let err = Error::new(ErrorKind::Usage)
            .with_message("record key escapes the destination directory")
            .with_key("../x")
            .with_hint("Use -C to choose a destination.");
        assert_eq!(
            error_text(&err),
            "error: record key escapes the destination directory\n\
             hint: Use -C to choose a destination.\n\
             key: ../x"
        );
    }
}

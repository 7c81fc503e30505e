//! Wire grammar for the depot transfer protocol.
//!
//! The protocol is line-oriented ASCII: the client sends one
//! newline-terminated command at a time and the server answers with one
//! newline-terminated reply, except for the raw byte phases of `UPLOAD`
//! (client to server, length declared up front) and `DOWNLOAD` (server to
//! client, length announced in the `FILEINFO` reply).
//!
//! Parsing and filename sanitization live here so the TCP session and the
//! HTTP handlers validate names through the same code path.

use std::fmt;

/// Sent once, immediately after a connection is accepted.
pub const BANNER: &str = "CONNECTED";
/// Acknowledges an `UPLOAD` command; raw file bytes follow from the client.
pub const READY: &str = "READY";
/// Sent after the declared number of upload bytes has been received.
pub const UPLOAD_COMPLETE: &str = "UPLOAD_COMPLETE";

/// A parsed control line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `UPLOAD <filename> <size>` — filename already sanitized to a basename.
    Upload { filename: String, size: u64 },
    /// `DOWNLOAD <filename>` — filename already sanitized to a basename.
    Download { filename: String },
    /// `LIST`
    List,
    /// `STATS`
    Stats,
}

/// Why a control line was rejected. `Display` is the exact text sent after
/// the `ERROR ` prefix on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    InvalidUpload,
    InvalidDownload,
    InvalidFilename,
    Unknown,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::InvalidUpload => write!(f, "Invalid UPLOAD command format"),
            ParseError::InvalidDownload => write!(f, "Invalid DOWNLOAD command format"),
            ParseError::InvalidFilename => write!(f, "Invalid filename"),
            ParseError::Unknown => write!(f, "Unknown command"),
        }
    }
}

impl std::error::Error for ParseError {}

/// Parse one control line (already stripped of its line terminator).
pub fn parse_command(line: &str) -> Result<Command, ParseError> {
    let mut tokens = line.split_whitespace();
    match tokens.next() {
        Some("UPLOAD") => {
            let name = tokens.next().ok_or(ParseError::InvalidUpload)?;
            let size = tokens.next().ok_or(ParseError::InvalidUpload)?;
            if tokens.next().is_some() {
                return Err(ParseError::InvalidUpload);
            }
            let size: u64 = size.parse().map_err(|_| ParseError::InvalidUpload)?;
            let filename = sanitize_filename(name).ok_or(ParseError::InvalidFilename)?;
            Ok(Command::Upload { filename, size })
        }
        Some("DOWNLOAD") => {
            let name = tokens.next().ok_or(ParseError::InvalidDownload)?;
            if tokens.next().is_some() {
                return Err(ParseError::InvalidDownload);
            }
            let filename = sanitize_filename(name).ok_or(ParseError::InvalidFilename)?;
            Ok(Command::Download { filename })
        }
        Some("LIST") if tokens.next().is_none() => Ok(Command::List),
        Some("STATS") if tokens.next().is_none() => Ok(Command::Stats),
        _ => Err(ParseError::Unknown),
    }
}

/// Reduce a client-supplied filename to a bare basename.
///
/// Path components (both separator styles) are stripped; a name that reduces
/// to nothing, `.` or `..` is rejected so a stored file can never land
/// outside the storage directory.
pub fn sanitize_filename(raw: &str) -> Option<String> {
    let base = raw.rsplit(['/', '\\']).next().unwrap_or_default().trim();
    if base.is_empty() || base == "." || base == ".." {
        None
    } else {
        Some(base.to_string())
    }
}

/// Human-readable size, `1.5 KB` style, as shown in catalog listings.
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    if bytes < KB {
        format!("{bytes} B")
    } else if bytes < MB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else if bytes < GB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_upload() {
        assert_eq!(
            parse_command("UPLOAD report.pdf 1024"),
            Ok(Command::Upload {
                filename: "report.pdf".to_string(),
                size: 1024,
            })
        );
    }

    #[test]
    fn upload_strips_path_components() {
        assert_eq!(
            parse_command("UPLOAD ../../etc/passwd 10"),
            Ok(Command::Upload {
                filename: "passwd".to_string(),
                size: 10,
            })
        );
        assert_eq!(
            parse_command(r"UPLOAD C:\temp\notes.txt 5"),
            Ok(Command::Upload {
                filename: "notes.txt".to_string(),
                size: 5,
            })
        );
    }

    #[test]
    fn rejects_malformed_upload() {
        assert_eq!(parse_command("UPLOAD"), Err(ParseError::InvalidUpload));
        assert_eq!(parse_command("UPLOAD foo"), Err(ParseError::InvalidUpload));
        assert_eq!(
            parse_command("UPLOAD foo notanumber"),
            Err(ParseError::InvalidUpload)
        );
        assert_eq!(
            parse_command("UPLOAD foo 10 extra"),
            Err(ParseError::InvalidUpload)
        );
        assert_eq!(
            parse_command("UPLOAD foo -1"),
            Err(ParseError::InvalidUpload)
        );
    }

    #[test]
    fn rejects_filenames_that_sanitize_to_nothing() {
        assert_eq!(
            parse_command("UPLOAD .. 10"),
            Err(ParseError::InvalidFilename)
        );
        assert_eq!(
            parse_command("DOWNLOAD a/b/.."),
            Err(ParseError::InvalidFilename)
        );
    }

    #[test]
    fn parses_download() {
        assert_eq!(
            parse_command("DOWNLOAD data/archive.tar"),
            Ok(Command::Download {
                filename: "archive.tar".to_string(),
            })
        );
        assert_eq!(parse_command("DOWNLOAD"), Err(ParseError::InvalidDownload));
        assert_eq!(
            parse_command("DOWNLOAD a b"),
            Err(ParseError::InvalidDownload)
        );
    }

    #[test]
    fn parses_bare_commands_exactly() {
        assert_eq!(parse_command("LIST"), Ok(Command::List));
        assert_eq!(parse_command("STATS"), Ok(Command::Stats));
        assert_eq!(parse_command("LIST extra"), Err(ParseError::Unknown));
        assert_eq!(parse_command(""), Err(ParseError::Unknown));
        assert_eq!(parse_command("FROBNICATE"), Err(ParseError::Unknown));
    }

    #[test]
    fn sanitize_keeps_plain_names() {
        assert_eq!(sanitize_filename("notes.txt"), Some("notes.txt".into()));
        assert_eq!(sanitize_filename("/var/tmp/x.bin"), Some("x.bin".into()));
        assert_eq!(sanitize_filename("dir/"), None);
        assert_eq!(sanitize_filename("."), None);
        assert_eq!(sanitize_filename(""), None);
    }

    #[test]
    fn formats_sizes_with_unit_steps() {
        assert_eq!(format_size(0), "0 B");
        assert_eq!(format_size(1023), "1023 B");
        assert_eq!(format_size(1024), "1.0 KB");
        assert_eq!(format_size(1536), "1.5 KB");
        assert_eq!(format_size(5 * 1024 * 1024), "5.0 MB");
        assert_eq!(format_size(3 * 1024 * 1024 * 1024), "3.0 GB");
    }
}

//! HDFS log line parsing for display.
//!
//! The backend forwards HDFS DataNode/NameNode lines verbatim in
//! `LogRecord::message`. Two layouts show up:
//!
//! ```text
//! 081109 203615 [148] INFO [dfs.DataNode$PacketResponder]: PacketResponder 1 for block blk_38865049064139660 terminating
//! 081109 203615 148 INFO dfs.DataNode$PacketResponder: PacketResponder 1 for block blk_38865049064139660 terminating
//! ```

use regex::Regex;
use serde::Serialize;
use std::sync::OnceLock;

static BRACKETED: OnceLock<Regex> = OnceLock::new();
static PLAIN: OnceLock<Regex> = OnceLock::new();
static BLOCK_ID: OnceLock<Regex> = OnceLock::new();

fn bracketed() -> &'static Regex {
    BRACKETED.get_or_init(|| {
        Regex::new(r"^(\d{6}) (\d{6}) \[(\d+)\] (\w+) \[([^\]]+)\]: (.+)$").expect("static regex")
    })
}

fn plain() -> &'static Regex {
    PLAIN.get_or_init(|| {
        Regex::new(r"^(\d{6}) (\d{6}) (\d+) (\w+) ([^:\s]+): (.+)$").expect("static regex")
    })
}

fn block_id() -> &'static Regex {
    BLOCK_ID.get_or_init(|| Regex::new(r"blk_-?\d{10,19}").expect("static regex"))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HdfsLine {
    /// `YYMMDD HHMMSS`, empty when the line did not parse
    pub date_time: String,
    pub thread_id: String,
    pub log_level: String,
    pub component: String,
    pub message: String,
}

impl HdfsLine {
    pub fn is_structured(&self) -> bool {
        !self.date_time.is_empty()
    }
}

/// Split an HDFS line into columns. Unrecognized lines come back with only
/// `message` set to the original text.
pub fn parse_line(line: &str) -> HdfsLine {
    let caps = bracketed().captures(line).or_else(|| plain().captures(line));
    match caps {
        Some(c) => HdfsLine {
            date_time: format!("{} {}", &c[1], &c[2]),
            thread_id: c[3].to_string(),
            log_level: c[4].to_string(),
            component: c[5].to_string(),
            message: c[6].to_string(),
        },
        None => HdfsLine {
            date_time: String::new(),
            thread_id: String::new(),
            log_level: String::new(),
            component: String::new(),
            message: line.to_string(),
        },
    }
}

/// All block IDs mentioned in a message, in order of appearance.
pub fn block_ids(message: &str) -> Vec<&str> {
    block_id().find_iter(message).map(|m| m.as_str()).collect()
}

/// Client-side check mirroring the backend's `blk_` prefix validation.
pub fn is_block_id(candidate: &str) -> bool {
    candidate.starts_with("blk_")
}

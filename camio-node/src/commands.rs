//! Operator commands read line by line from stdin.

use std::path::PathBuf;

use camio_core::Point;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::warn;

pub const HELP: &str = "commands: peers | status | invite <peer> | accept <peer> | \
decline <peer> | request-image | send-image [path] | send-calibration | add-point <x> <y> | \
tap <x> <y> | clear-points | redraw | quit";

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Peers,
    Status,
    Invite(String),
    Accept(String),
    Decline(String),
    RequestImage,
    /// Send the latest frame, or the named file.
    SendImage(Option<PathBuf>),
    SendCalibration,
    /// Point in image coordinates.
    AddPoint(Point),
    /// Point in view coordinates, mapped onto the displayed image.
    Tap(Point),
    ClearPoints,
    Redraw,
    Help,
    Quit,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("unknown command `{0}`")]
    Unknown(String),
    #[error("`{0}` needs a peer name")]
    MissingPeer(&'static str),
    #[error("expected two finite numbers")]
    BadPoint,
}

/// Parse one input line. Blank lines yield `None`.
pub fn parse(line: &str) -> Option<Result<Command, ParseError>> {
    let line = line.trim();
    let (word, rest) = match line.split_once(char::is_whitespace) {
        Some((w, r)) => (w, r.trim()),
        None => (line, ""),
    };
    if word.is_empty() {
        return None;
    }
    let peer = |name: &'static str, ctor: fn(String) -> Command| {
        if rest.is_empty() {
            Err(ParseError::MissingPeer(name))
        } else {
            Ok(ctor(rest.to_string()))
        }
    };
    Some(match word {
        "peers" => Ok(Command::Peers),
        "status" => Ok(Command::Status),
        "invite" => peer("invite", Command::Invite),
        "accept" => peer("accept", Command::Accept),
        "decline" => peer("decline", Command::Decline),
        "request-image" => Ok(Command::RequestImage),
        "send-image" => Ok(Command::SendImage(
            (!rest.is_empty()).then(|| PathBuf::from(rest)),
        )),
        "send-calibration" => Ok(Command::SendCalibration),
        "add-point" => parse_point(rest).map(Command::AddPoint),
        "tap" => parse_point(rest).map(Command::Tap),
        "clear-points" => Ok(Command::ClearPoints),
        "redraw" => Ok(Command::Redraw),
        "help" | "?" => Ok(Command::Help),
        "quit" | "exit" => Ok(Command::Quit),
        other => Err(ParseError::Unknown(other.to_string())),
    })
}

fn parse_point(rest: &str) -> Result<Point, ParseError> {
    let mut nums = rest
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|s| !s.is_empty())
        .map(str::parse::<f64>);
    match (nums.next(), nums.next(), nums.next()) {
        (Some(Ok(x)), Some(Ok(y)), None) if x.is_finite() && y.is_finite() => Ok(Point::new(x, y)),
        _ => Err(ParseError::BadPoint),
    }
}

/// Forward parsed stdin commands. Returns `true` on `quit`, `false` when input ends.
pub async fn read_stdin(commands: mpsc::UnboundedSender<Command>) -> bool {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => return false,
            Err(e) => {
                warn!(error = %e, "stdin read failed");
                return false;
            }
        };
        match parse(&line) {
            None => {}
            Some(Ok(Command::Quit)) => return true,
            Some(Ok(cmd)) => {
                if commands.send(cmd).is_err() {
                    return false;
                }
            }
            Some(Err(e)) => warn!("{e}; {HELP}"),
        }
    }
}
